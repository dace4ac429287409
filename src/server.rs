//! Daemon wiring: preflight, data directories, background tasks, signal
//! and panic cleanup, HTTP listener.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::api;
use crate::auth::ApiKey;
use crate::error::Error;
use crate::hypervisor::QEMU_BIN;
use crate::metrics;
use crate::vm::{DataDirs, VpsManager};

/// Shared state handed to every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<VpsManager>,
    pub api_key: ApiKey,
}

/// Verify host requirements before accepting any work. Failures here are
/// fatal and take the exit code path.
pub fn preflight() -> Result<(), Error> {
    for tool in [QEMU_BIN, "qemu-img", "genisoimage"] {
        which(tool)?;
    }
    if !Path::new("/dev/kvm").exists() {
        return Err(Error::Preflight(
            "KVM not available: /dev/kvm not found".into(),
        ));
    }
    Ok(())
}

/// Look a binary up in PATH.
fn which(name: &str) -> Result<(), Error> {
    let found = std::env::var("PATH")
        .unwrap_or_default()
        .split(':')
        .map(|dir| Path::new(dir).join(name))
        .any(|p| p.exists());
    if found {
        Ok(())
    } else {
        Err(Error::Preflight(format!("{name} not found in PATH")))
    }
}

/// Start the daemon: reap hooks, metrics collector, image warm-up, HTTP
/// listener. Runs until a termination signal arrives.
pub async fn serve(bind: String, data_dir: PathBuf) -> Result<()> {
    preflight()?;

    let api_key = std::env::var("API_KEY")
        .ok()
        .filter(|k| !k.is_empty())
        .context("API_KEY environment variable is required")?;

    let dirs = DataDirs::new(data_dir);
    for dir in [dirs.base(), dirs.disks(), dirs.logs()] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create directory {}", dir.display()))?;
    }

    let manager = VpsManager::new(dirs);

    // Guest resources must not outlive the daemon, even on a crash.
    install_panic_cleanup(manager.clone());
    spawn_signal_handler(manager.clone());

    metrics::spawn_collector(manager.clone());
    info!("metrics collector started");

    {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager.images().ensure_all().await;
            info!("base image warm-up finished");
        });
    }

    let state = AppState { manager, api_key: ApiKey::new(api_key) };
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!("vpsd listening on http://{bind}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

/// On SIGINT/SIGTERM: reap every VM, then exit cleanly.
fn spawn_signal_handler(manager: Arc<VpsManager>) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut interrupt = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                error!("failed to install SIGINT handler: {e}");
                return;
            }
        };
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                return;
            }
        };

        tokio::select! {
            _ = interrupt.recv() => info!("received SIGINT, cleaning up"),
            _ = terminate.recv() => info!("received SIGTERM, cleaning up"),
        }

        let _ = tokio::task::spawn_blocking(move || manager.cleanup_all()).await;
        info!("cleanup complete, exiting");
        std::process::exit(0);
    });
}

/// Reap every VM before the default panic handling runs, then let the
/// panic continue as usual.
fn install_panic_cleanup(manager: Arc<VpsManager>) {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        manager.cleanup_all();
        default_hook(info);
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn which_finds_common_binaries() {
        // `sh` exists on any host these tests run on.
        assert!(which("sh").is_ok());
        assert!(matches!(
            which("definitely-not-a-real-tool-xyz").unwrap_err(),
            Error::Preflight(_)
        ));
    }
}
