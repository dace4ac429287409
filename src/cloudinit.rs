//! First-boot configuration: renders `user-data` / `meta-data` and packs
//! them into an ISO9660 seed image under the `cidata` volume id.

use std::fmt::Write as _;
use std::path::Path;

use tokio::process::Command;
use uuid::Uuid;

use crate::error::Error;
use crate::templates::{OsFamily, Template};

const ISO_TOOL: &str = "genisoimage";

/// Validate an RFC-1123 style hostname: total length at most 253, labels at
/// most 63 characters, each label alphanumeric with interior hyphens.
pub fn validate_hostname(hostname: &str) -> Result<(), Error> {
    let invalid = || Error::InvalidInput(format!("invalid hostname format: {hostname}"));

    if hostname.is_empty() || hostname.len() > 253 {
        return Err(invalid());
    }
    for label in hostname.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(invalid());
        }
        let bytes = label.as_bytes();
        if !bytes[0].is_ascii_alphanumeric() || !bytes[bytes.len() - 1].is_ascii_alphanumeric() {
            return Err(invalid());
        }
        if !bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-') {
            return Err(invalid());
        }
    }
    Ok(())
}

/// Render the `#cloud-config` user-data document.
///
/// Root login is enabled with the generated password, SSH password auth is
/// turned on, and the template's packages and commands for the image's OS
/// family run after the base system update.
pub fn render_user_data(
    password: &str,
    hostname: &str,
    family: OsFamily,
    template: &Template,
) -> String {
    let packages = template.packages_for(family);

    let mut commands: Vec<String> = Vec::new();
    if !packages.is_empty() {
        if family.uses_apt() {
            commands.push("apt-get update".to_string());
            commands.push(format!(
                "DEBIAN_FRONTEND=noninteractive apt-get install -y {}",
                packages.join(" ")
            ));
        } else {
            commands.push("dnf update -y".to_string());
            commands.push(format!("dnf install -y {}", packages.join(" ")));
        }
    }
    commands.extend(template.commands_for(family).iter().map(|c| c.to_string()));

    let mut out = format!(
        "\
#cloud-config
users:
  - name: root
    lock_passwd: false
    ssh_pwauth: true

chpasswd:
  list: |
    root:{password}
  expire: false

ssh_pwauth: true
disable_root: false

hostname: {hostname}

package_update: true
package_upgrade: true

packages:
"
    );
    for pkg in packages {
        let _ = writeln!(out, "  - {pkg}");
    }
    out.push_str(
        "
runcmd:
  - sed -i 's/#PermitRootLogin.*/PermitRootLogin yes/' /etc/ssh/sshd_config
  - systemctl restart ssh || systemctl restart sshd
",
    );
    for cmd in &commands {
        let _ = writeln!(out, "  - {cmd}");
    }
    out
}

/// Render `meta-data` with a fresh instance-id. The id is never reused so
/// cloud-init re-runs first-boot configuration for every VM.
pub fn render_meta_data(hostname: &str) -> String {
    format!("instance-id: {}\nlocal-hostname: {hostname}\n", Uuid::new_v4())
}

/// Write the seed files into a scratch directory and assemble the ISO.
pub async fn build_iso(
    iso_path: &Path,
    password: &str,
    image_id: &str,
    hostname: &str,
    template: &Template,
) -> Result<(), Error> {
    let family = OsFamily::from_image_id(image_id)
        .ok_or_else(|| Error::InvalidInput(format!("unsupported OS type: {image_id}")))?;

    let staging = tempfile::tempdir()?;
    let user_data = render_user_data(password, hostname, family, template);
    let meta_data = render_meta_data(hostname);

    let user_data_path = staging.path().join("user-data");
    let meta_data_path = staging.path().join("meta-data");
    tokio::fs::write(&user_data_path, user_data).await?;
    tokio::fs::write(&meta_data_path, meta_data).await?;

    let output = Command::new(ISO_TOOL)
        .arg("-output")
        .arg(iso_path)
        .args(["-volid", "cidata", "-joliet", "-rock"])
        .arg(&user_data_path)
        .arg(&meta_data_path)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| Error::Tool { tool: ISO_TOOL, detail: format!("spawn: {e}") })?;

    if !output.status.success() {
        return Err(Error::Tool {
            tool: ISO_TOOL,
            detail: format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates;

    #[test]
    fn hostnames_accept_valid_labels() {
        for ok in ["a", "a.b", "a-b.c1", "vm1.vps.local", "A.B-2.c"] {
            assert!(validate_hostname(ok).is_ok(), "{ok} should be accepted");
        }
    }

    #[test]
    fn hostnames_reject_malformed_labels() {
        let long_label = format!("{}.com", "x".repeat(64));
        let long_total = ["abcdefgh"; 32].join(".");
        for bad in [
            "",
            "-a",
            "a-",
            "a..b",
            "under_score",
            "slash/name",
            long_label.as_str(),
            long_total.as_str(),
        ] {
            assert!(validate_hostname(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn user_data_blank_template_has_no_packages_or_extra_commands() {
        let all = templates::builtin();
        let blank = templates::find(&all, "blank").unwrap();
        let doc = render_user_data("s3cret", "n1.vps.local", OsFamily::Ubuntu, blank);

        assert!(doc.starts_with("#cloud-config\n"));
        assert!(doc.contains("root:s3cret"));
        assert!(doc.contains("hostname: n1.vps.local"));
        assert!(doc.contains("packages:\n\nruncmd:"));
        // Only the two fixed ssh commands remain under runcmd.
        let runcmd = &doc[doc.find("runcmd:").unwrap()..];
        assert_eq!(runcmd.matches("\n  - ").count(), 2);
        assert!(runcmd.contains("PermitRootLogin yes"));
    }

    #[test]
    fn user_data_apt_family_installs_template_packages() {
        let all = templates::builtin();
        let docker = templates::find(&all, "docker").unwrap();
        let doc = render_user_data("pw", "host", OsFamily::Ubuntu, docker);

        assert!(doc.contains("  - apt-transport-https\n"));
        assert!(doc.contains("  - apt-get update\n"));
        assert!(doc.contains("DEBIAN_FRONTEND=noninteractive apt-get install -y"));
        assert!(doc.contains("  - systemctl start docker\n"));
        // Package install precedes the template's own commands.
        let install = doc.find("apt-get install -y docker-ce").unwrap();
        let bootstrap = doc.find("DEBIAN_FRONTEND").unwrap();
        assert!(bootstrap < install);
    }

    #[test]
    fn user_data_dnf_family_uses_dnf_bootstrap() {
        let all = templates::builtin();
        let python = templates::find(&all, "python").unwrap();
        let doc = render_user_data("pw", "host", OsFamily::Rocky, python);
        assert!(doc.contains("  - dnf update -y\n"));
        assert!(doc.contains("dnf install -y epel-release python3"));
    }

    #[test]
    fn commands_stay_one_item_per_line() {
        let all = templates::builtin();
        let golang = templates::find(&all, "golang").unwrap();
        let doc = render_user_data("pw", "host", OsFamily::Debian, golang);
        for cmd in golang.commands_for(OsFamily::Debian) {
            assert!(doc.contains(&format!("  - {cmd}\n")), "missing list item for {cmd}");
        }
    }

    #[test]
    fn meta_data_carries_fresh_instance_ids() {
        let a = render_meta_data("h1");
        let b = render_meta_data("h1");
        assert!(a.contains("local-hostname: h1\n"));
        assert!(a.starts_with("instance-id: "));
        assert_ne!(a, b);
    }
}
