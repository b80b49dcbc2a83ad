use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{interval, MissedTickBehavior};

use super::Stage;
use crate::errors::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyHealth {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerHealth {
    pub name: &'static str,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub is_cycle_running: bool,
    pub dependency_health: DependencyHealth,
    pub last_error: Option<String>,
    pub cycles: u64,
}

impl WorkerHealth {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            last_cycle_at: None,
            is_cycle_running: false,
            dependency_health: DependencyHealth::Healthy,
            last_error: None,
            cycles: 0,
        }
    }
}

/// Shared view of every worker's last cycle, read by `/health`.
#[derive(Clone, Default)]
pub struct HealthRegistry {
    workers: Arc<RwLock<BTreeMap<&'static str, WorkerHealth>>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, name: &'static str) {
        self.workers
            .write()
            .await
            .entry(name)
            .or_insert_with(|| WorkerHealth::new(name));
    }

    pub async fn snapshot(&self) -> Vec<WorkerHealth> {
        self.workers.read().await.values().cloned().collect()
    }

    pub async fn is_degraded(&self) -> bool {
        self.workers
            .read()
            .await
            .values()
            .any(|w| w.dependency_health == DependencyHealth::Degraded)
    }

    async fn cycle_started(&self, name: &'static str) {
        let mut workers = self.workers.write().await;
        let entry = workers.entry(name).or_insert_with(|| WorkerHealth::new(name));
        entry.is_cycle_running = true;
    }

    async fn cycle_finished(&self, name: &'static str, error: Option<&PipelineError>) {
        let mut workers = self.workers.write().await;
        let entry = workers.entry(name).or_insert_with(|| WorkerHealth::new(name));
        entry.is_cycle_running = false;
        entry.last_cycle_at = Some(Utc::now());
        entry.cycles += 1;
        entry.last_error = error.map(|e| e.to_string());
        entry.dependency_health = match error {
            Some(e) if e.is_fatal() => DependencyHealth::Degraded,
            _ => DependencyHealth::Healthy,
        };
    }
}

/// Clears the running flag when the cycle ends, however it ends.
pub struct CycleGuard {
    running: Arc<AtomicBool>,
}

impl CycleGuard {
    /// `None` if a cycle already holds the flag.
    pub fn try_begin(running: &Arc<AtomicBool>) -> Option<Self> {
        running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self {
                running: running.clone(),
            })
    }
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

#[derive(Debug, PartialEq)]
pub enum CycleOutcome {
    Completed(usize),
    Failed(String),
    /// The previous cycle was still running.
    Busy,
}

/// Runs one worker's cycle on a fixed interval, never overlapping itself.
#[derive(Clone)]
pub struct Scheduler {
    stage: Stage,
    every: Duration,
    running: Arc<AtomicBool>,
    health: HealthRegistry,
}

impl Scheduler {
    pub fn new(stage: Stage, every: Duration, health: HealthRegistry) -> Self {
        Self {
            stage,
            every,
            running: Arc::new(AtomicBool::new(false)),
            health,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run one cycle to completion unless one is already in progress.
    pub async fn run_cycle<F, Fut>(&self, cycle: F) -> CycleOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<usize, PipelineError>>,
    {
        let Some(_guard) = CycleGuard::try_begin(&self.running) else {
            tracing::debug!(worker = %self.stage, "Previous cycle still running, skipping tick");
            return CycleOutcome::Busy;
        };

        let name = self.stage.as_str();
        self.health.cycle_started(name).await;
        let result = cycle().await;
        self.health.cycle_finished(name, result.as_ref().err()).await;

        match result {
            Ok(n) => {
                if n > 0 {
                    tracing::debug!(worker = name, processed = n, "Cycle complete");
                }
                CycleOutcome::Completed(n)
            }
            Err(e) => {
                if e.is_fatal() {
                    tracing::error!(worker = name, error = %e, "Cycle aborted");
                } else {
                    tracing::warn!(worker = name, error = %e, "Cycle failed");
                }
                CycleOutcome::Failed(e.to_string())
            }
        }
    }

    /// Tick forever. Missed ticks are skipped rather than bunched up.
    pub async fn run_forever<F, Fut>(self, mut cycle: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<usize, PipelineError>>,
    {
        self.health.register(self.stage.as_str()).await;
        let mut ticker = interval(self.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(
            worker = %self.stage,
            interval_ms = self.every.as_millis() as u64,
            "Worker started"
        );

        loop {
            ticker.tick().await;
            self.run_cycle(&mut cycle).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn overlapping_cycle_is_skipped() {
        let health = HealthRegistry::new();
        let scheduler = Scheduler::new(Stage::Routing, Duration::from_millis(10), health.clone());

        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (started_tx, started_rx) = oneshot::channel::<()>();

        let first = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                scheduler
                    .run_cycle(|| async move {
                        let _ = started_tx.send(());
                        let _ = release_rx.await;
                        Ok(1)
                    })
                    .await
            })
        };

        started_rx.await.unwrap();
        assert!(scheduler.is_running());
        assert_eq!(scheduler.run_cycle(|| async { Ok(0) }).await, CycleOutcome::Busy);

        release_tx.send(()).unwrap();
        assert_eq!(first.await.unwrap(), CycleOutcome::Completed(1));
        assert!(!scheduler.is_running());
        assert_eq!(scheduler.run_cycle(|| async { Ok(2) }).await, CycleOutcome::Completed(2));
    }

    #[tokio::test]
    async fn fatal_error_marks_worker_degraded() {
        let health = HealthRegistry::new();
        let scheduler = Scheduler::new(Stage::Settlement, Duration::from_secs(1), health.clone());

        let outcome = scheduler
            .run_cycle(|| async { Err(PipelineError::Fatal("store unreachable".into())) })
            .await;
        assert!(matches!(outcome, CycleOutcome::Failed(_)));
        assert!(health.is_degraded().await);

        let workers = health.snapshot().await;
        assert_eq!(workers[0].name, "settlement");
        assert!(workers[0].last_error.is_some());
        assert!(!workers[0].is_cycle_running);

        scheduler.run_cycle(|| async { Ok(0) }).await;
        assert!(!health.is_degraded().await);
    }
}
