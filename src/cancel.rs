//! Top-level interruption policy.
//!
//! While an invocation runs, SIGINT, SIGTERM and SIGHUP delivered to baton
//! itself are logged and ignored so an in-flight checkpoint upload is never
//! abandoned halfway. The only supported cancellation is the Build deadline,
//! which the timed executor enforces on the child's process group.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

fn ignored_signals() -> [(SignalKind, &'static str); 3] {
    [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
        (SignalKind::hangup(), "SIGHUP"),
    ]
}

#[derive(Debug, Default)]
pub struct CancellationPolicy {
    ignored: Arc<AtomicUsize>,
}

impl CancellationPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take over the interruption signals until the returned guard is dropped.
    /// Must be called from within a tokio runtime.
    pub fn install(&self) -> Result<CancellationGuard> {
        let mut tasks = Vec::new();
        for (kind, name) in ignored_signals() {
            let mut stream =
                signal(kind).with_context(|| format!("Failed to install {} handler", name))?;
            let ignored = Arc::clone(&self.ignored);
            tasks.push(tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    ignored.fetch_add(1, Ordering::SeqCst);
                    warn!(signal = name, "Ignoring interruption while the invocation is in flight");
                }
            }));
        }
        debug!("Interruption signals are now ignored");
        Ok(CancellationGuard { tasks })
    }

    /// Number of signals swallowed so far.
    pub fn ignored_count(&self) -> usize {
        self.ignored.load(Ordering::SeqCst)
    }
}

/// Stops logging ignored signals when dropped. The process keeps ignoring
/// them afterwards; tokio does not restore default dispositions.
pub struct CancellationGuard {
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for CancellationGuard {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::{Signal, raise};
    use std::time::Duration;

    #[tokio::test]
    async fn test_hangup_is_ignored_and_counted() {
        let policy = CancellationPolicy::new();
        let _guard = policy.install().unwrap();
        raise(Signal::SIGHUP).unwrap();

        for _ in 0..50 {
            if policy.ignored_count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(policy.ignored_count() >= 1);
    }
}
