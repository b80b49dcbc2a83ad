use metrics::{counter, gauge};
use std::sync::Arc;

use crate::db::Store;
use crate::errors::PipelineError;

/// Folds settled contributions back into each source's reputation score.
pub struct ImpactScorer {
    store: Arc<dyn Store>,
}

impl ImpactScorer {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Set every source with settled records to the mean of its contributions.
    /// Sources with nothing settled keep their current score.
    pub async fn run_once(&self) -> Result<usize, PipelineError> {
        let aggregates = self.store.reputation_aggregates().await?;

        for agg in &aggregates {
            let score = agg.mean_contribution.round_dp(8);
            self.store.update_reputation(agg.alpha_source_id, score).await?;
            tracing::debug!(
                alpha_source_id = %agg.alpha_source_id,
                score = %score,
                samples = agg.samples,
                "Reputation updated"
            );
        }

        counter!("reputation_updates_total").increment(aggregates.len() as u64);
        gauge!("scored_alpha_sources").set(aggregates.len() as f64);
        if !aggregates.is_empty() {
            tracing::info!(sources = aggregates.len(), "Impact scoring cycle complete");
        }
        Ok(aggregates.len())
    }
}
