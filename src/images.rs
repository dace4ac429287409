//! Base-image library: downloads cloud images on demand, normalizes them to
//! qcow2 at the service disk size, and caches them under `<data>/base`.
//!
//! Prepared bases are shared read-only backing files; per-VM disks are thin
//! overlays created by the lifecycle controller.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::Error;

/// Every base image is resized to this many GiB before first use.
pub const DISK_SIZE_GIB: u64 = 50;

/// Supported cloud images, keyed by image id.
const CATALOG: &[(&str, &str)] = &[
    ("ubuntu-22.04", "https://cloud-images.ubuntu.com/releases/22.04/release/ubuntu-22.04-server-cloudimg-amd64.img"),
    ("ubuntu-20.04", "https://cloud-images.ubuntu.com/focal/current/focal-server-cloudimg-amd64.img"),
    ("ubuntu-24.04", "https://cloud-images.ubuntu.com/noble/current/noble-server-cloudimg-amd64.img"),
    ("debian-11", "https://cloud.debian.org/images/cloud/bullseye/latest/debian-11-generic-amd64.qcow2"),
    ("debian-12", "https://os-cdn.virtfusion.net/debian/debian-12-x86_64.qcow2"),
    ("fedora-38", "https://download.fedoraproject.org/pub/fedora/linux/releases/38/Cloud/x86_64/images/Fedora-Cloud-Base-38-1.6.x86_64.qcow2"),
    ("fedora-40", "https://os-cdn.virtfusion.net/fedora/fedora-40-x86_64-virtfusion.qcow2"),
    ("almalinux-8", "https://repo.almalinux.org/almalinux/8/cloud/x86_64/images/AlmaLinux-8-GenericCloud-latest.x86_64.qcow2"),
    ("almalinux-9", "https://os-cdn.virtfusion.net/alma/almalinux-9-x86_64.qcow2"),
    ("rocky-8", "https://os.virtfusion.net/images/rocky-linux-8-minimal-x86_64.qcow2"),
    ("rocky-9", "https://os-cdn.virtfusion.net/rocky/rocky-linux-9-x86_64.qcow2"),
    ("centos-7", "https://os.virtfusion.net/images/centos-7-minimal-x86_64.qcow2"),
    ("centos-9", "https://os-cdn.virtfusion.net/centos/centos-stream-9-x86_64.qcow2"),
];

pub struct ImageLibrary {
    base_dir: PathBuf,
    // One async lock per image id so concurrent prepares for the same image
    // wait on each other instead of racing on the target file.
    locks: StdMutex<HashMap<&'static str, Arc<Mutex<()>>>>,
}

impl ImageLibrary {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir, locks: StdMutex::new(HashMap::new()) }
    }

    /// All supported image ids, sorted.
    pub fn ids(&self) -> Vec<&'static str> {
        let mut ids: Vec<_> = CATALOG.iter().map(|(id, _)| *id).collect();
        ids.sort_unstable();
        ids
    }

    pub fn supports(&self, image_id: &str) -> bool {
        source_url(image_id).is_some()
    }

    pub fn base_path(&self, image_id: &str) -> PathBuf {
        self.base_dir.join(format!("{image_id}.qcow2"))
    }

    /// Prepare the base image for `image_id` if it is not already cached.
    ///
    /// Idempotent: an existing target that probes as a qcow2 of the expected
    /// virtual size is accepted as-is. Failures leave no partial target in
    /// place (work happens in a scratch dir, then converts into the final
    /// path which is re-probed by the next caller).
    pub async fn prepare(&self, image_id: &str) -> Result<(), Error> {
        let (id, url) = catalog_entry(image_id)
            .ok_or_else(|| Error::InvalidInput(format!("unsupported image type: {image_id}")))?;

        let lock = {
            let mut locks = self.locks.lock().expect("image lock table poisoned");
            locks.entry(id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };
        let _guard = lock.lock().await;

        let target = self.base_path(id);
        if is_prepared(&target).await {
            return Ok(());
        }

        info!(image = id, "preparing base image");
        let scratch = tempfile::tempdir()?;
        let download = scratch.path().join(
            url.rsplit('/').next().unwrap_or("image.qcow2"),
        );

        run("wget", &["-q", "-O", path_str(&download), url]).await?;

        tokio::fs::create_dir_all(&self.base_dir).await?;
        run(
            "qemu-img",
            &["convert", "-f", "qcow2", "-O", "qcow2", path_str(&download), path_str(&target)],
        )
        .await?;
        run(
            "qemu-img",
            &["resize", path_str(&target), &format!("{DISK_SIZE_GIB}G")],
        )
        .await?;

        let mut perms = tokio::fs::metadata(&target).await?.permissions();
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(0o644);
        tokio::fs::set_permissions(&target, perms).await?;

        info!(image = id, path = %target.display(), "base image ready");
        Ok(())
    }

    /// Warm the cache for every supported image. Per-image failures are
    /// logged and skipped; VM creation retries the prepare on demand.
    pub async fn ensure_all(&self) {
        for (id, _) in CATALOG {
            if let Err(e) = self.prepare(id).await {
                warn!(image = id, "base image preparation failed: {e}");
            }
        }
    }
}

fn catalog_entry(image_id: &str) -> Option<(&'static str, &'static str)> {
    CATALOG.iter().find(|(id, _)| *id == image_id).copied()
}

fn source_url(image_id: &str) -> Option<&'static str> {
    catalog_entry(image_id).map(|(_, url)| url)
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_default()
}

/// Probe an existing file with `qemu-img info`; accept it only as a qcow2
/// whose virtual size matches the service disk size.
async fn is_prepared(target: &Path) -> bool {
    if !target.exists() {
        return false;
    }
    let output = match Command::new("qemu-img")
        .args(["info", "--output=json"])
        .arg(target)
        .kill_on_drop(true)
        .output()
        .await
    {
        Ok(out) if out.status.success() => out,
        _ => return false,
    };
    let info: serde_json::Value = match serde_json::from_slice(&output.stdout) {
        Ok(v) => v,
        Err(_) => return false,
    };
    info["format"] == "qcow2"
        && info["virtual-size"].as_u64() == Some(DISK_SIZE_GIB * 1024 * 1024 * 1024)
}

/// Run an external tool, mapping a non-zero exit to a captured-stderr error.
/// The child dies with the task if the task is cancelled.
async fn run(tool: &'static str, args: &[&str]) -> Result<(), Error> {
    let output = Command::new(tool)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| Error::Tool { tool, detail: format!("spawn: {e}") })?;
    if !output.status.success() {
        return Err(Error::Tool {
            tool,
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

    #[test]
    fn catalog_covers_all_families() {
        let lib = ImageLibrary::new(PathBuf::from("/tmp/x"));
        for id in ["ubuntu-22.04", "debian-12", "fedora-40", "rocky-9", "almalinux-8", "centos-7"] {
            assert!(lib.supports(id), "{id} missing from catalog");
        }
        assert!(!lib.supports("ubuntu-18.04"));
        assert_eq!(lib.ids().len(), 13);
    }

    #[test]
    fn base_paths_are_keyed_by_image_id() {
        let lib = ImageLibrary::new(PathBuf::from("/var/lib/vps-service/base"));
        assert_eq!(
            lib.base_path("debian-12"),
            PathBuf::from("/var/lib/vps-service/base/debian-12.qcow2")
        );
    }

    #[tokio::test]
    async fn prepare_rejects_unknown_image() {
        let dir = tempfile::tempdir().unwrap();
        let lib = ImageLibrary::new(dir.path().to_path_buf());
        let err = lib.prepare("windows-11").await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn missing_target_is_not_prepared() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_prepared(&dir.path().join("nope.qcow2")).await);
    }
}
