use futures_util::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::task::JoinHandle;

use super::notifier::Notifier;
use super::scheduler::{HealthRegistry, Scheduler};
use super::Stage;
use crate::config::AppConfig;
use crate::db::Store;
use crate::errors::PipelineError;
use crate::execution::trade_executor::{ExecutionOutcome, TradeExecutor};
use crate::ingestion::normalizer::Normalizer;
use crate::models::IntentState;
use crate::routing::VenueRouter;
use crate::settlement::{BillingGateway, ImpactScorer, SettlementEngine};
use crate::venues::VenueRegistry;

/// Every stage of the signal-to-settlement pipeline, wired to one store.
#[derive(Clone)]
pub struct Pipeline {
    pub store: Arc<dyn Store>,
    pub venues: VenueRegistry,
    pub normalizer: Arc<Normalizer>,
    pub router: Arc<VenueRouter>,
    pub executor: Arc<TradeExecutor>,
    pub settlement: Arc<SettlementEngine>,
    pub scorer: Arc<ImpactScorer>,
}

impl Pipeline {
    pub fn build(
        store: Arc<dyn Store>,
        venues: VenueRegistry,
        billing: Arc<dyn BillingGateway>,
        config: &AppConfig,
        notifier: Option<Arc<Notifier>>,
    ) -> Self {
        let normalizer = Arc::new(Normalizer::new(
            store.clone(),
            config.normalizer(),
            notifier.clone(),
        ));
        let router = Arc::new(VenueRouter::new(
            store.clone(),
            venues.clone(),
            config.sizing(),
            config.routing(),
            notifier.clone(),
        ));
        let executor = Arc::new(TradeExecutor::new(
            store.clone(),
            venues.clone(),
            router.clone(),
            config.executor(),
            notifier,
        ));
        let settlement = Arc::new(SettlementEngine::new(store.clone(), billing, config.fees()));
        let scorer = Arc::new(ImpactScorer::new(store.clone()));

        Self {
            store,
            venues,
            normalizer,
            router,
            executor,
            settlement,
            scorer,
        }
    }

    /// Fan out signals that have not been routed yet.
    pub async fn routing_cycle(&self, batch: i64, parallelism: usize) -> Result<usize, PipelineError> {
        let signals = self.store.signals_pending_fanout(batch).await?;
        let results: Vec<_> = stream::iter(signals)
            .map(|signal| async move {
                let result = self.router.fan_out(&signal).await;
                (signal.id, result)
            })
            .buffered(parallelism.max(1))
            .collect()
            .await;

        let mut done = 0;
        for (signal_id, result) in results {
            match result {
                Ok(_) => done += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(PipelineError::Transient(reason)) => {
                    tracing::warn!(signal_id = %signal_id, reason = %reason, "Fan-out deferred to next cycle");
                }
                Err(e) => tracing::error!(signal_id = %signal_id, error = %e, "Fan-out failed"),
            }
        }
        Ok(done)
    }

    /// Drive routed intents through execution.
    pub async fn execution_cycle(&self, batch: i64, parallelism: usize) -> Result<usize, PipelineError> {
        let intents = self.store.intents_in_state(IntentState::Routed, batch).await?;
        let results: Vec<_> = stream::iter(intents.into_iter().map(|i| i.id))
            .map(|intent_id| async move { (intent_id, self.executor.execute(intent_id).await) })
            .buffered(parallelism.max(1))
            .collect()
            .await;

        let mut done = 0;
        for (intent_id, result) in results {
            match result {
                Ok(ExecutionOutcome::NotClaimed) => {}
                Ok(_) => done += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => tracing::error!(intent_id = %intent_id, error = %e, "Execution failed"),
            }
        }
        Ok(done)
    }

    pub async fn settlement_cycle(&self, batch: i64, parallelism: usize) -> Result<usize, PipelineError> {
        self.settlement.run_once(batch, parallelism).await
    }

    pub async fn impact_cycle(&self) -> Result<usize, PipelineError> {
        self.scorer.run_once().await
    }

    pub async fn sweep_cycle(&self) -> Result<usize, PipelineError> {
        let report = self.executor.sweep_stale().await?;
        Ok(report.released + report.ambiguous)
    }

    /// Book positions the venues closed on their own.
    pub async fn monitor_cycle(&self, batch: i64) -> Result<usize, PipelineError> {
        self.executor.sync_venue_closes(batch).await
    }
}

/// Spawn one polling worker per configured stage.
pub fn spawn_workers(
    pipeline: Pipeline,
    config: &AppConfig,
    health: HealthRegistry,
) -> Vec<JoinHandle<()>> {
    let batch = config.worker_batch_size;
    let parallelism = config.worker_parallelism;
    let mut handles = Vec::new();

    for stage in Stage::ALL.into_iter().filter(|s| config.runs(*s)) {
        let every = match stage {
            Stage::Routing => config.intervals.routing,
            Stage::Execution => config.intervals.execution,
            Stage::Settlement => config.intervals.settlement,
            Stage::Impact => config.intervals.impact,
            Stage::Sweep => config.intervals.sweep,
            Stage::PositionMonitor => config.intervals.position_monitor,
        };
        let scheduler = Scheduler::new(stage, every, health.clone());
        let p = pipeline.clone();

        let handle = tokio::spawn(async move {
            scheduler
                .run_forever(move || {
                    let p = p.clone();
                    async move {
                        match stage {
                            Stage::Routing => p.routing_cycle(batch, parallelism).await,
                            Stage::Execution => p.execution_cycle(batch, parallelism).await,
                            Stage::Settlement => p.settlement_cycle(batch, parallelism).await,
                            Stage::Impact => p.impact_cycle().await,
                            Stage::Sweep => p.sweep_cycle().await,
                            Stage::PositionMonitor => p.monitor_cycle(batch).await,
                        }
                    }
                })
                .await;
        });
        handles.push(handle);
    }

    tracing::info!(
        stages = ?config.worker_stages.iter().map(Stage::as_str).collect::<Vec<_>>(),
        "Workers spawned"
    );
    handles
}
