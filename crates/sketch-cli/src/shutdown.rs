//! SIGINT / SIGTERM handling for the training loops.
//!
//! The first signal sets the stop flag that the trainers check between
//! batches; the run then finishes its batch, flushes the reward cache and
//! returns. A second signal also sets the abort flag: the reward cache
//! refuses further oracle calls, so the current batch fails and the flush
//! guard writes out everything scored so far on the way up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Flags shared between the signal listener and the training run.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    stop: Arc<AtomicBool>,
    abort: Arc<AtomicBool>,
}

impl Shutdown {
    /// Checked by the trainers between batches.
    pub fn stop(&self) -> &AtomicBool {
        &self.stop
    }

    /// Handed to the reward cache.
    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }

    /// Record one signal. Returns `true` for the first.
    fn signal(&self) -> bool {
        if self.stop.swap(true, Ordering::Relaxed) {
            self.abort.store(true, Ordering::Relaxed);
            false
        } else {
            true
        }
    }
}

/// Start a listener thread and return the flags it sets.
///
/// The listener owns a current-thread tokio runtime, so the rest of the
/// program stays synchronous.
pub fn install() -> anyhow::Result<Shutdown> {
    let shutdown = Shutdown::default();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let listener = shutdown.clone();
    std::thread::Builder::new()
        .name("signal-listener".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                loop {
                    wait_for_signal().await;
                    if listener.signal() {
                        tracing::warn!(
                            "Interrupt received, stopping after the current batch (interrupt again to abort it)"
                        );
                    } else {
                        tracing::warn!("Interrupt received again, aborting oracle calls and flushing the reward cache");
                    }
                }
            })
        })?;
    Ok(shutdown)
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Cannot listen for SIGTERM, handling Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
