// src/api/scheduler.rs
//! Background tasks with explicit start and stop.

use std::future::Future;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Handle on a spawned periodic or delayed job.
///
/// `stop` lets an in-flight run finish and then joins the task; `abort`
/// cancels it at the next await point.
pub struct ScheduledTask {
    name: String,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Runs `tick` every `period`, first after one full period.
    pub fn every<F, Fut>(name: impl Into<String>, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let (shutdown, mut stopped) = watch::channel(false);
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => tick().await,
                    _ = stopped.changed() => break,
                }
            }
            debug!("⏹️ {} stopped", task_name);
        });
        debug!("⏱️ {} scheduled every {:?}", name, period);
        Self { name, shutdown, handle }
    }

    /// Runs `job` once after `delay` unless stopped first.
    pub fn after<Fut>(name: impl Into<String>, delay: Duration, job: Fut) -> Self
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let (shutdown, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => job.await,
                _ = stopped.changed() => {}
            }
        });
        Self { name, shutdown, handle }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn abort(&self) {
        self.handle.abort();
    }

    pub async fn stop(self) {
        // the receiver is gone once the task has exited on its own
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            if !e.is_cancelled() {
                warn!("{} ended abnormally: {}", self.name, e);
            }
        }
    }
}
