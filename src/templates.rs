//! Provisioning templates: per-OS-family package and command tables.
//!
//! The table is immutable for the lifetime of the process. Unknown template
//! ids are rejected at request validation time.

use std::collections::HashMap;

use serde::Serialize;

/// Package-manager group a cloud image belongs to, derived from the image
/// id prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Ubuntu,
    Debian,
    Fedora,
    Rocky,
    AlmaLinux,
    CentOs,
}

impl OsFamily {
    pub fn from_image_id(image_id: &str) -> Option<Self> {
        if image_id.starts_with("ubuntu") {
            Some(OsFamily::Ubuntu)
        } else if image_id.starts_with("debian") {
            Some(OsFamily::Debian)
        } else if image_id.starts_with("fedora") {
            Some(OsFamily::Fedora)
        } else if image_id.starts_with("rocky") {
            Some(OsFamily::Rocky)
        } else if image_id.starts_with("almalinux") {
            Some(OsFamily::AlmaLinux)
        } else if image_id.starts_with("centos") {
            Some(OsFamily::CentOs)
        } else {
            None
        }
    }

    /// True for the apt-based families, false for the dnf-based ones.
    pub fn uses_apt(&self) -> bool {
        matches!(self, OsFamily::Ubuntu | OsFamily::Debian)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Template {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub os_variants: Vec<&'static str>,
    pub packages: HashMap<OsFamily, Vec<&'static str>>,
    pub commands: HashMap<OsFamily, Vec<&'static str>>,
}

impl Template {
    /// Whether this template may be installed on the given image.
    /// An empty variant list means "any image".
    pub fn supports_image(&self, image_id: &str) -> bool {
        self.os_variants.is_empty() || self.os_variants.contains(&image_id)
    }

    pub fn packages_for(&self, family: OsFamily) -> &[&'static str] {
        self.packages.get(&family).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn commands_for(&self, family: OsFamily) -> &[&'static str] {
        self.commands.get(&family).map(Vec::as_slice).unwrap_or(&[])
    }
}

pub fn find<'a>(templates: &'a [Template], id: &str) -> Option<&'a Template> {
    templates.iter().find(|t| t.id == id)
}

/// The built-in template table.
pub fn builtin() -> Vec<Template> {
    vec![blank(), docker(), nodejs(), golang(), python()]
}

fn blank() -> Template {
    Template {
        id: "blank",
        name: "Blank Server",
        description: "Basic server with no additional software",
        // No payload, so every image qualifies.
        os_variants: vec![],
        packages: HashMap::new(),
        commands: HashMap::new(),
    }
}

fn docker() -> Template {
    let apt_packages = vec![
        "apt-transport-https",
        "ca-certificates",
        "curl",
        "software-properties-common",
    ];
    let rhel_packages = vec!["yum-utils", "epel-release"];
    let rhel_commands = vec![
        "dnf config-manager --add-repo https://download.docker.com/linux/centos/docker-ce.repo",
        "dnf -y install docker-ce docker-ce-cli containerd.io docker-compose-plugin",
        "systemctl enable docker",
        "systemctl start docker",
    ];
    Template {
        id: "docker",
        name: "Docker Development Environment",
        description: "Server with Docker and Docker Compose pre-installed",
        os_variants: vec![
            "ubuntu-22.04", "ubuntu-20.04", "debian-12", "debian-11",
            "fedora-40", "fedora-38", "rocky-9", "rocky-8",
            "almalinux-9", "almalinux-8",
        ],
        packages: HashMap::from([
            (OsFamily::Ubuntu, apt_packages.clone()),
            (OsFamily::Debian, apt_packages),
            (OsFamily::Fedora, vec!["dnf-plugins-core", "curl"]),
            (OsFamily::Rocky, rhel_packages.clone()),
            (OsFamily::AlmaLinux, rhel_packages.clone()),
            (OsFamily::CentOs, rhel_packages),
        ]),
        commands: HashMap::from([
            (OsFamily::Ubuntu, vec![
                "curl -fsSL https://download.docker.com/linux/ubuntu/gpg | apt-key add -",
                "add-apt-repository \"deb [arch=amd64] https://download.docker.com/linux/ubuntu $(lsb_release -cs) stable\"",
                "apt-get update",
                "apt-get install -y docker-ce docker-ce-cli containerd.io docker-compose-plugin",
                "systemctl enable docker",
                "systemctl start docker",
            ]),
            (OsFamily::Debian, vec![
                "curl -fsSL https://download.docker.com/linux/debian/gpg | apt-key add -",
                "add-apt-repository \"deb [arch=amd64] https://download.docker.com/linux/debian $(lsb_release -cs) stable\"",
                "apt-get update",
                "apt-get install -y docker-ce docker-ce-cli containerd.io docker-compose-plugin",
                "systemctl enable docker",
                "systemctl start docker",
            ]),
            (OsFamily::Fedora, vec![
                "dnf -y remove docker docker-* podman* buildah*",
                "dnf config-manager --add-repo https://download.docker.com/linux/fedora/docker-ce.repo",
                "dnf -y install docker-ce docker-ce-cli containerd.io docker-compose-plugin",
                "systemctl enable docker",
                "systemctl start docker",
            ]),
            (OsFamily::Rocky, rhel_commands.clone()),
            (OsFamily::AlmaLinux, rhel_commands),
            (OsFamily::CentOs, vec![
                "if [ -f /etc/centos-release ] && grep -q 'CentOS Linux release 7' /etc/centos-release; then \
                 yum-config-manager --add-repo https://download.docker.com/linux/centos/docker-ce.repo && \
                 yum -y install docker-ce docker-ce-cli containerd.io; \
                 else \
                 dnf config-manager --add-repo https://download.docker.com/linux/centos/docker-ce.repo && \
                 dnf -y install docker-ce docker-ce-cli containerd.io docker-compose-plugin; \
                 fi",
                "systemctl enable docker",
                "systemctl start docker",
            ]),
        ]),
    }
}

fn nodejs() -> Template {
    let deb_commands = vec![
        "curl -fsSL https://deb.nodesource.com/setup_18.x | bash -",
        "apt-get install -y nodejs",
        "npm install -g yarn pm2 typescript ts-node",
    ];
    let rpm_commands = vec![
        "curl -fsSL https://rpm.nodesource.com/setup_18.x | bash -",
        "dnf -y install nodejs",
        "npm install -g yarn pm2 typescript ts-node",
    ];
    Template {
        id: "nodejs",
        name: "Node.js Development Environment",
        description: "Server with Node.js, NPM, and common development tools",
        os_variants: vec![
            "ubuntu-22.04", "ubuntu-20.04", "debian-12", "debian-11",
            "fedora-40", "fedora-38", "rocky-9", "rocky-8",
            "almalinux-9", "almalinux-8",
        ],
        packages: HashMap::from([
            (OsFamily::Ubuntu, vec!["curl", "build-essential"]),
            (OsFamily::Debian, vec!["curl", "build-essential"]),
            (OsFamily::Fedora, vec!["curl", "gcc", "gcc-c++", "make", "python3"]),
            (OsFamily::Rocky, vec!["curl", "gcc", "gcc-c++", "make", "epel-release", "python3"]),
            (OsFamily::AlmaLinux, vec!["curl", "gcc", "gcc-c++", "make", "epel-release", "python3"]),
            (OsFamily::CentOs, vec!["curl", "gcc", "gcc-c++", "make", "epel-release", "python3"]),
        ]),
        commands: HashMap::from([
            (OsFamily::Ubuntu, deb_commands.clone()),
            (OsFamily::Debian, deb_commands),
            (OsFamily::Fedora, vec![
                "dnf -y module reset nodejs",
                "dnf -y module enable nodejs:18",
                "dnf -y install nodejs",
                "npm install -g yarn pm2 typescript ts-node",
            ]),
            (OsFamily::Rocky, rpm_commands.clone()),
            (OsFamily::AlmaLinux, rpm_commands),
            (OsFamily::CentOs, vec![
                "if [ -f /etc/centos-release ] && grep -q 'CentOS Linux release 7' /etc/centos-release; then \
                 curl -fsSL https://rpm.nodesource.com/setup_18.x | bash - && \
                 yum -y install nodejs; \
                 else \
                 curl -fsSL https://rpm.nodesource.com/setup_18.x | bash - && \
                 dnf -y install nodejs; \
                 fi",
                "npm install -g yarn pm2 typescript ts-node",
            ]),
        ]),
    }
}

fn golang() -> Template {
    // The Go toolchain install is identical on every family.
    let commands = vec![
        "curl -OL https://go.dev/dl/go1.21.5.linux-amd64.tar.gz",
        "rm -rf /usr/local/go && tar -C /usr/local -xzf go1.21.5.linux-amd64.tar.gz",
        "echo 'export PATH=$PATH:/usr/local/go/bin' >> /etc/profile",
        "echo 'export PATH=$PATH:/usr/local/go/bin' >> /root/.bashrc",
        "rm go1.21.5.linux-amd64.tar.gz",
        "/usr/local/go/bin/go install golang.org/x/tools/gopls@latest",
        "/usr/local/go/bin/go install github.com/go-delve/delve/cmd/dlv@latest",
    ];
    let rpm_packages = vec!["curl", "git", "gcc", "gcc-c++", "make"];
    Template {
        id: "golang",
        name: "Go Development Environment",
        description: "Server with Go and common development tools",
        os_variants: vec![
            "ubuntu-22.04", "ubuntu-20.04", "debian-12", "debian-11",
            "fedora-40", "fedora-38", "rocky-9", "rocky-8",
            "almalinux-9", "almalinux-8",
        ],
        packages: HashMap::from([
            (OsFamily::Ubuntu, vec!["curl", "git", "build-essential"]),
            (OsFamily::Debian, vec!["curl", "git", "build-essential"]),
            (OsFamily::Fedora, rpm_packages.clone()),
            (OsFamily::Rocky, rpm_packages.clone()),
            (OsFamily::AlmaLinux, rpm_packages.clone()),
            (OsFamily::CentOs, rpm_packages),
        ]),
        commands: HashMap::from([
            (OsFamily::Ubuntu, commands.clone()),
            (OsFamily::Debian, commands.clone()),
            (OsFamily::Fedora, commands.clone()),
            (OsFamily::Rocky, commands.clone()),
            (OsFamily::AlmaLinux, commands.clone()),
            (OsFamily::CentOs, commands),
        ]),
    }
}

fn python() -> Template {
    let alias_cmds = [
        "echo 'alias python=python3' >> /root/.bashrc",
        "echo 'alias pip=pip3' >> /root/.bashrc",
    ];
    let deb_commands = vec![
        "pip3 install --upgrade pip",
        "pip3 install poetry virtualenv pylint black mypy pytest jupyter",
        alias_cmds[0],
        alias_cmds[1],
    ];
    let rpm_commands = vec![
        "dnf -y update",
        "python3 -m pip install --upgrade pip",
        "python3 -m pip install poetry virtualenv pylint black mypy pytest jupyter",
        alias_cmds[0],
        alias_cmds[1],
    ];
    let rpm_packages = vec![
        "epel-release", "python3", "python3-pip", "python3-devel",
        "gcc", "gcc-c++", "make", "git",
    ];
    Template {
        id: "python",
        name: "Python Development Environment",
        description: "Server with Python, pip, and common development tools",
        os_variants: vec![
            "ubuntu-22.04", "ubuntu-20.04", "debian-12", "debian-11",
            "fedora-40", "fedora-38", "rocky-9", "rocky-8",
            "almalinux-9", "almalinux-8",
        ],
        packages: HashMap::from([
            (OsFamily::Ubuntu, vec![
                "python3", "python3-pip", "python3-venv", "build-essential", "python3-dev", "git",
            ]),
            (OsFamily::Debian, vec![
                "python3", "python3-pip", "python3-venv", "build-essential", "python3-dev", "git",
            ]),
            (OsFamily::Fedora, vec![
                "python3", "python3-pip", "python3-devel", "gcc", "gcc-c++",
                "make", "git", "python3-wheel",
            ]),
            (OsFamily::Rocky, rpm_packages.clone()),
            (OsFamily::AlmaLinux, rpm_packages.clone()),
            (OsFamily::CentOs, rpm_packages),
        ]),
        commands: HashMap::from([
            (OsFamily::Ubuntu, deb_commands.clone()),
            (OsFamily::Debian, deb_commands),
            (OsFamily::Fedora, vec![
                "dnf -y update",
                "python3 -m ensurepip --upgrade",
                "python3 -m pip install --upgrade pip setuptools wheel",
                "python3 -m pip install poetry virtualenv pylint black mypy pytest jupyter",
                alias_cmds[0],
                alias_cmds[1],
            ]),
            (OsFamily::Rocky, rpm_commands.clone()),
            (OsFamily::AlmaLinux, rpm_commands),
            (OsFamily::CentOs, vec![
                "if [ -f /etc/centos-release ] && grep -q 'CentOS Linux release 7' /etc/centos-release; then \
                 yum -y update && \
                 python3 -m pip install --upgrade pip && \
                 python3 -m pip install poetry virtualenv pylint black mypy pytest jupyter; \
                 else \
                 dnf -y update && \
                 python3 -m pip install --upgrade pip && \
                 python3 -m pip install poetry virtualenv pylint black mypy pytest jupyter; \
                 fi",
                alias_cmds[0],
                alias_cmds[1],
            ]),
        ]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_family_derives_from_image_prefix() {
        assert_eq!(OsFamily::from_image_id("ubuntu-22.04"), Some(OsFamily::Ubuntu));
        assert_eq!(OsFamily::from_image_id("debian-12"), Some(OsFamily::Debian));
        assert_eq!(OsFamily::from_image_id("fedora-40"), Some(OsFamily::Fedora));
        assert_eq!(OsFamily::from_image_id("rocky-9"), Some(OsFamily::Rocky));
        assert_eq!(OsFamily::from_image_id("almalinux-8"), Some(OsFamily::AlmaLinux));
        assert_eq!(OsFamily::from_image_id("centos-7"), Some(OsFamily::CentOs));
        assert_eq!(OsFamily::from_image_id("arch-latest"), None);
    }

    #[test]
    fn blank_has_no_payload_and_supports_everything() {
        let templates = builtin();
        let blank = find(&templates, "blank").unwrap();
        assert!(blank.packages_for(OsFamily::Ubuntu).is_empty());
        assert!(blank.commands_for(OsFamily::CentOs).is_empty());
        assert!(blank.supports_image("ubuntu-24.04"));
        assert!(blank.supports_image("centos-7"));
    }

    #[test]
    fn docker_is_scoped_to_listed_variants() {
        let templates = builtin();
        let docker = find(&templates, "docker").unwrap();
        assert!(docker.supports_image("ubuntu-22.04"));
        assert!(!docker.supports_image("centos-7"));
        assert!(!docker.supports_image("ubuntu-24.04"));
    }

    #[test]
    fn unknown_template_id_is_absent() {
        let templates = builtin();
        assert!(find(&templates, "kubernetes").is_none());
    }

    #[test]
    fn every_listed_variant_has_a_family_payload() {
        for template in builtin() {
            for variant in &template.os_variants {
                let family = OsFamily::from_image_id(variant)
                    .unwrap_or_else(|| panic!("variant {variant} has no OS family"));
                assert!(
                    !template.packages_for(family).is_empty()
                        || !template.commands_for(family).is_empty(),
                    "template {} lists {variant} but has no payload for it",
                    template.id
                );
            }
        }
    }
}
