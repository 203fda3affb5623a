//! Long-running mode: keep the attachment watcher alive and refresh on a
//! timer until interrupted.

use std::{future::Future, io, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use devfleet_core::manager::{DeviceManager, RunOutcome};
use tokio::{
    process::Command,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

/// Pause before re-spawning a watcher that exited.
const RESPAWN_DELAY: Duration = Duration::from_secs(5);

/// `manager` must outlive the runtime: its blocking HTTP client may not be
/// dropped on an async worker.
pub async fn run(manager: Arc<DeviceManager>, interval: Duration) -> Result<()> {
    let exe = std::env::current_exe().context("failed to locate devfleetctl")?;
    let cfgutil = manager.config().tools.cfgutil.clone();

    let watcher = tokio::spawn(watch_attachments(cfgutil, exe));
    info!(interval = %humantime::format_duration(interval), "daemon started");

    let result = refresh_until(
        move || manager.verify(true),
        interval,
        tokio::signal::ctrl_c(),
    )
    .await;
    watcher.abort();
    info!("shutting down");
    result
}

/// Call `refresh` on a blocking thread every `interval` until `shutdown`
/// resolves. A refresh still running at shutdown is abandoned.
async fn refresh_until<R, S>(refresh: R, interval: Duration, shutdown: S) -> Result<()>
where
    R: Fn() -> devfleet_core::Result<RunOutcome> + Send + Sync + 'static,
    S: Future<Output = io::Result<()>>,
{
    let refresh = Arc::new(refresh);
    let refresher = tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let refresh = refresh.clone();
            match tokio::task::spawn_blocking(move || (*refresh)()).await {
                Ok(Ok(outcome)) => debug!(outcome = ?outcome, "refresh finished"),
                Ok(Err(err)) => error!(error = %err, "refresh failed"),
                Err(err) => error!(error = %err, "refresh task failed"),
            }
        }
    });

    let signal = shutdown.await;
    refresher.abort();
    signal.context("failed to listen for ctrl-c")
}

/// Run `cfgutil exec` so attach and detach events call back into this
/// binary. The child is re-spawned whenever it exits.
async fn watch_attachments(cfgutil: PathBuf, exe: PathBuf) {
    let attached = format!("{} attached", exe.display());
    let detached = format!("{} detached", exe.display());
    loop {
        debug!(program = %cfgutil.display(), "starting attachment watcher");
        let spawned = Command::new(&cfgutil)
            .args(["exec", "-a", &attached, "-d", &detached])
            .kill_on_drop(true)
            .spawn();
        match spawned {
            Ok(mut child) => match child.wait().await {
                Ok(status) => warn!(status = %status, "attachment watcher exited"),
                Err(err) => error!(error = %err, "attachment watcher failed"),
            },
            Err(err) => {
                error!(program = %cfgutil.display(), error = %err, "unable to start attachment watcher");
            }
        }
        time::sleep(RESPAWN_DELAY).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Barrier,
        atomic::{AtomicUsize, Ordering},
    };
    use tokio::sync::Notify;

    #[tokio::test]
    async fn shutdown_is_not_held_up_by_a_running_refresh() {
        let started = Arc::new(Notify::new());
        let release = Arc::new(Barrier::new(2));

        let refresh = {
            let started = started.clone();
            let release = release.clone();
            move || {
                started.notify_one();
                release.wait();
                Ok(RunOutcome::Completed)
            }
        };
        let shutdown = {
            let started = started.clone();
            async move {
                started.notified().await;
                Ok(())
            }
        };

        let stopped = time::timeout(
            Duration::from_secs(5),
            refresh_until(refresh, Duration::from_secs(3600), shutdown),
        )
        .await;
        // Let the abandoned refresh finish so the runtime can shut down.
        release.wait();

        assert!(matches!(stopped, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn refreshes_on_every_tick() {
        let calls = Arc::new(AtomicUsize::new(0));
        let refresh = {
            let calls = calls.clone();
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(RunOutcome::Completed)
            }
        };
        let shutdown = async {
            time::sleep(Duration::from_millis(200)).await;
            Ok(())
        };

        refresh_until(refresh, Duration::from_millis(20), shutdown)
            .await
            .unwrap();
        assert!(calls.load(Ordering::SeqCst) >= 2);
    }
}
