//! Process supervision for the serve-loop and persistence tasks. Every
//! task this daemon runs is critical (losing the DHCP listener on an
//! interface, or the lease writer, is a user-visible outage), so this
//! carries a single unconditional-retry policy rather than anything
//! priority-tiered.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Spawn `factory` in a tokio task, restarting it on panic or error with a
/// linear backoff (`100ms * retry`, capped at 30s). Retries are unlimited:
/// a crashed serve loop keeps trying rather than leaving an interface
/// permanently unserved.
pub fn spawn_supervised<F, Fut>(name: &'static str, factory: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let factory = Arc::new(factory);
    tokio::spawn(async move {
        let mut retries: u32 = 0;
        let mut last_restart = Instant::now();

        loop {
            info!("[supervisor] starting {name}");
            let f = Arc::clone(&factory);
            let result = tokio::spawn(async move { f().await }).await;

            match result {
                Ok(Ok(())) => {
                    info!("[supervisor] {name} exited cleanly");
                    break;
                }
                Ok(Err(e)) => error!("[supervisor] {name} failed: {e:#}"),
                Err(join_error) => error!("[supervisor] {name} task panicked: {join_error}"),
            }

            if last_restart.elapsed() > Duration::from_secs(60) {
                retries = 0;
            }
            retries = retries.saturating_add(1);

            let backoff = Duration::from_millis(100 * retries as u64).min(MAX_BACKOFF);
            warn!("[supervisor] {name} restarting in {backoff:?} (attempt {retries})");
            tokio::time::sleep(backoff).await;
            last_restart = Instant::now();
        }
    })
}
