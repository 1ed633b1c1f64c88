//! Timers owned by the orchestrator.
//!
//! Both kinds only post a tick into the orchestrator's channel; the actual
//! work happens on the orchestrator task. Dropping a timer aborts it.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::trace;

/// A named repeating timer.
#[derive(Debug)]
pub struct PeriodicTask {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Post `tick` every `period`, the first one immediately.
    pub fn spawn<T>(name: &'static str, period: Duration, tx: mpsc::UnboundedSender<T>, tick: T) -> Self
    where
        T: Clone + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if tx.send(tick.clone()).is_err() {
                    break;
                }
            }
        });
        trace!(task = name, period_ms = period.as_millis() as u64, "Periodic task started");
        Self { name, handle }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn cancel(self) {
        trace!(task = self.name, "Periodic task cancelled");
        drop(self);
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A one-shot timer.
#[derive(Debug)]
pub struct DeadlineTimer {
    handle: JoinHandle<()>,
}

impl DeadlineTimer {
    pub fn spawn<T>(after: Duration, tx: mpsc::UnboundedSender<T>, tick: T) -> Self
    where
        T: Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(tick);
        });
        Self { handle }
    }
}

impl Drop for DeadlineTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
