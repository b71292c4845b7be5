// SPDX-License-Identifier: MIT

//! The Rotation Scheduler: wakes on a timer aligned to the
//! configured period boundary, or on demand (the daemon's SIGHUP
//! handler), and asks every supervised task to rotate its log file.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::Notify;

use crate::registry::TaskRegistry;

pub struct RotationScheduler {
    registry: Arc<TaskRegistry>,
    period: Option<Duration>,
    manual: Arc<Notify>,
}

impl RotationScheduler {
    pub fn new(registry: Arc<TaskRegistry>, period: Option<Duration>) -> Self {
        Self {
            registry,
            period,
            manual: Arc::new(Notify::new()),
        }
    }

    /// A handle a signal handler can call to request an out-of-band
    /// rotation (the daemon's SIGHUP path).
    pub fn trigger(&self) -> Arc<Notify> {
        Arc::clone(&self.manual)
    }

    /// Run until `shutdown` fires, rotating every task's log on each
    /// tick of the aligned timer or on a manual trigger.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            match self.period {
                Some(period) => {
                    let sleep = tokio::time::sleep(time_until_next_boundary(period));
                    tokio::select! {
                        _ = sleep => self.rotate_all(),
                        _ = self.manual.notified() => self.rotate_all(),
                        Ok(()) = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
                None => {
                    tokio::select! {
                        _ = self.manual.notified() => self.rotate_all(),
                        Ok(()) = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    fn rotate_all(&self) {
        for runtime in self.registry.snapshot() {
            if runtime.is_one_time() {
                continue;
            }
            if let Err(e) = runtime.rotate() {
                tracing::warn!(task = %runtime.name(), error = %e, "rotate request rejected");
            }
        }
    }
}

/// The same alignment trick as `time.Now().Truncate(every).Add(every)`:
/// sleep exactly long enough to land on the next multiple of `period`
/// since the Unix epoch.
fn time_until_next_boundary(period: Duration) -> Duration {
    let period_secs = period.as_secs().max(1);
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    let remainder = now.as_secs() % period_secs;
    Duration::from_secs(period_secs - remainder)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_alignment_never_exceeds_the_period() {
        let period = Duration::from_secs(3600);
        let wait = time_until_next_boundary(period);
        assert!(wait <= period);
        assert!(wait > Duration::from_secs(0) || wait == Duration::from_secs(0));
    }
}
