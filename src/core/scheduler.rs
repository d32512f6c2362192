//! Periodic task scheduler.
//!
//! A registry of named jobs, each running on its own worker. Every tick
//! spawns the job function in a fresh task so a slow run does not block
//! future ticks. Intervals can be changed at runtime through a bounded
//! update channel; an interval of zero deregisters and stops the job.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

type JobFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct JobHandle {
    update_tx: mpsc::Sender<Duration>,
    stop_tx: mpsc::Sender<()>,
}

/// Named periodic job registry.
#[derive(Default)]
pub struct Scheduler {
    jobs: Mutex<HashMap<String, JobHandle>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job and start its worker. Idempotent on name: a second
    /// registration with the same name is ignored. A non-positive interval
    /// skips registration entirely.
    pub fn register<F, Fut>(&self, name: &str, interval: Duration, run_on_start: bool, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if interval.is_zero() {
            debug!("task {name} not registered: interval is 0");
            return;
        }

        let mut jobs = self.jobs.lock().unwrap();
        if jobs.contains_key(name) {
            warn!("task {name} already registered, skipping");
            return;
        }

        let (update_tx, update_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        jobs.insert(
            name.to_string(),
            JobHandle {
                update_tx,
                stop_tx,
            },
        );

        let job: JobFn = Arc::new(move || Box::pin(job()));
        let name = name.to_string();
        tokio::spawn(run_job(name, interval, run_on_start, job, update_rx, stop_rx));
    }

    /// Change a job's interval. Zero deregisters and stops the job. The
    /// update is dropped if one is already pending.
    pub fn update(&self, name: &str, interval: Duration) {
        let mut jobs = self.jobs.lock().unwrap();
        let Some(handle) = jobs.get(name) else {
            warn!("task {name} not found");
            return;
        };

        if interval.is_zero() {
            let handle = jobs.remove(name).unwrap();
            let _ = handle.stop_tx.try_send(());
            info!("task {name} removed: interval is 0");
            return;
        }

        match handle.update_tx.try_send(interval) {
            Ok(()) => info!("task {name} interval updated to {interval:?}"),
            Err(_) => warn!("task {name} update channel full, skipping"),
        }
    }

    /// Stop every registered job.
    pub fn shutdown(&self) {
        let mut jobs = self.jobs.lock().unwrap();
        for (_, handle) in jobs.drain() {
            let _ = handle.stop_tx.try_send(());
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }
}

async fn run_job(
    name: String,
    mut interval: Duration,
    run_on_start: bool,
    job: JobFn,
    mut update_rx: mpsc::Receiver<Duration>,
    mut stop_rx: mpsc::Receiver<()>,
) {
    debug!("task {name} started with interval {interval:?}, run_on_start: {run_on_start}");

    if run_on_start {
        tokio::spawn(job());
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.reset();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                tokio::spawn(job());
            }
            Some(new_interval) = update_rx.recv() => {
                interval = new_interval;
                ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                ticker.reset();
            }
            _ = stop_rx.recv() => {
                debug!("task {name} stopped");
                return;
            }
        }
    }
}
