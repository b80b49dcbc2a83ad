use futures_util::stream::{self, StreamExt};
use metrics::counter;
use std::sync::Arc;

use super::RoutingConfig;
use crate::db::Store;
use crate::errors::PipelineError;
use crate::execution::position_sizer::{size_position, SizingError, SizingInput, SizingPolicy};
use crate::execution::retry::retry_transient;
use crate::models::{
    AgentDeployment, AlphaSource, IntentState, NewIntent, RoutingRationale, Signal, SizeModel,
    SourceKind, TradeIntent, Venue, VenueCheck, VenueCheckOutcome, VENUE_PRIORITY,
};
use crate::services::notifier::{self, Notifier};
use crate::venues::VenueRegistry;

/// Picks one venue per (signal, deployment) and sizes the order for it.
pub struct VenueRouter {
    store: Arc<dyn Store>,
    venues: VenueRegistry,
    sizing: SizingPolicy,
    config: RoutingConfig,
    notifier: Option<Arc<Notifier>>,
}

/// Per-signal tally of routing outcomes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOutSummary {
    pub routed: usize,
    pub unroutable: usize,
    pub sizing_failed: usize,
    pub skipped: usize,
    /// Deployments that already had an intent for this signal.
    pub existing: usize,
}

impl FanOutSummary {
    fn count(&mut self, intent: &TradeIntent, created: bool) {
        if !created {
            self.existing += 1;
            return;
        }
        match intent.state {
            IntentState::Routed => self.routed += 1,
            IntentState::Unroutable => self.unroutable += 1,
            IntentState::SizingFailed => self.sizing_failed += 1,
            _ => self.skipped += 1,
        }
    }
}

/// The venue, size and rationale an intent was routed with, if it was routed.
fn route_of(intent: &TradeIntent) -> Option<(Venue, &SizeModel, &RoutingRationale)> {
    match (intent.venue, intent.size_model.as_ref(), intent.rationale.as_ref()) {
        (Some(venue), Some(model), Some(rationale)) => Some((venue, model, rationale)),
        _ => None,
    }
}

impl VenueRouter {
    pub fn new(
        store: Arc<dyn Store>,
        venues: VenueRegistry,
        sizing: SizingPolicy,
        config: RoutingConfig,
        notifier: Option<Arc<Notifier>>,
    ) -> Self {
        Self {
            store,
            venues,
            sizing,
            config,
            notifier,
        }
    }

    /// Walk venues in priority order and stop at the first one that can take
    /// the trade. Every venue looked at is recorded with its outcome.
    pub async fn select_venue(
        &self,
        token_symbol: &str,
        deployment: &AgentDeployment,
        excluded: &[Venue],
    ) -> Result<RoutingRationale, PipelineError> {
        let mut checked = Vec::with_capacity(VENUE_PRIORITY.len());
        let mut selected = None;

        for venue in VENUE_PRIORITY {
            let outcome = self.check_venue(venue, token_symbol, deployment, excluded).await?;
            let done = outcome == VenueCheckOutcome::Selected;
            checked.push(VenueCheck { venue, outcome });
            if done {
                selected = Some(venue);
                break;
            }
        }

        Ok(RoutingRationale {
            checked,
            selected,
            excluded: excluded.to_vec(),
            note: None,
            decided_at: chrono::Utc::now(),
        })
    }

    async fn check_venue(
        &self,
        venue: Venue,
        token_symbol: &str,
        deployment: &AgentDeployment,
        excluded: &[Venue],
    ) -> Result<VenueCheckOutcome, PipelineError> {
        if !deployment.venue_enabled(venue) {
            return Ok(VenueCheckOutcome::NotEnabled);
        }
        if excluded.contains(&venue) {
            return Ok(VenueCheckOutcome::Excluded);
        }
        let Some(adapter) = self.venues.get(venue) else {
            return Ok(VenueCheckOutcome::NoAdapter);
        };
        if self.store.wallet_for(&deployment.user_id, venue).await?.is_none() {
            return Ok(VenueCheckOutcome::WalletNotConfigured);
        }

        let label = format!("{venue} availability");
        let (checked, attempts) =
            retry_transient(&self.config.retry, &label, || adapter.is_available(token_symbol)).await;
        match checked {
            Ok(true) => Ok(VenueCheckOutcome::Selected),
            Ok(false) => Ok(VenueCheckOutcome::AssetUnavailable),
            // Never fall through to a lower-priority venue on a blip.
            Err(e) if e.is_transient() => {
                tracing::warn!(
                    venue = %venue,
                    token = %token_symbol,
                    attempts,
                    error = %e,
                    "Venue availability still failing after retries"
                );
                Err(PipelineError::Transient(format!("{label}: {e}")))
            }
            Err(e) => {
                tracing::warn!(venue = %venue, token = %token_symbol, error = %e, "Venue availability check failed");
                Ok(VenueCheckOutcome::CheckFailed(e.to_string()))
            }
        }
    }

    pub fn size_for(
        &self,
        signal: &Signal,
        source_kind: SourceKind,
        deployment: &AgentDeployment,
        venue: Venue,
    ) -> Result<SizeModel, SizingError> {
        size_position(
            &self.sizing,
            SizingInput {
                confidence: signal.confidence,
                source_kind,
                preferences: &deployment.risk_preferences,
                constraints: venue.constraints(),
            },
        )
    }

    /// Why the source may not be traded right now, if anything.
    fn gate_reason(&self, source: &AlphaSource) -> Option<String> {
        if !source.is_active {
            return Some(format!("alpha source {} is inactive", source.identity));
        }
        match self.config.min_source_reputation {
            Some(min) if source.reputation_score < min => Some(format!(
                "alpha source reputation {} below minimum {}",
                source.reputation_score, min
            )),
            _ => None,
        }
    }

    /// Create one intent per subscribed deployment, then mark the signal fanned out.
    ///
    /// Safe to repeat: deployments that already hold an intent are left alone.
    /// If any deployment hit a transient failure the signal stays pending and
    /// the error is returned, so the next pass routes only what is missing.
    pub async fn fan_out(&self, signal: &Signal) -> Result<FanOutSummary, PipelineError> {
        let source = self
            .store
            .get_alpha_source(signal.alpha_source_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("alpha source {}", signal.alpha_source_id)))?;
        let deployments = self.store.deployments_for_source(source.id).await?;
        let deployment_count = deployments.len();
        let gate = self.gate_reason(&source);
        let (source, gate) = (&source, gate.as_deref());

        let results: Vec<_> = stream::iter(deployments)
            .map(|deployment| async move {
                let result = self.route_deployment(signal, source, &deployment, gate).await;
                (deployment.id, result)
            })
            .buffered(self.config.parallelism.max(1))
            .collect()
            .await;

        let mut summary = FanOutSummary::default();
        let mut first_route = None;
        let mut deferred: Option<PipelineError> = None;
        for (deployment_id, result) in results {
            match result {
                Ok((intent, created)) => {
                    summary.count(&intent, created);
                    if first_route.is_none() && route_of(&intent).is_some() {
                        first_route = Some(intent);
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        signal_id = %signal.id,
                        deployment_id = %deployment_id,
                        error = %e,
                        "Routing deferred for deployment"
                    );
                    match &deferred {
                        Some(d) if d.is_fatal() || !e.is_fatal() => {}
                        _ => deferred = Some(e),
                    }
                }
            }
        }

        if signal.venue.is_none() {
            if let Some((venue, model, rationale)) = first_route.as_ref().and_then(route_of) {
                self.store
                    .record_signal_route(signal.id, venue, model, rationale)
                    .await?;
            }
        }

        if let Some(e) = deferred {
            counter!("signals_routing_deferred_total").increment(1);
            return Err(e);
        }

        self.store.mark_signal_fanned_out(signal.id).await?;

        tracing::info!(
            signal_id = %signal.id,
            deployments = deployment_count,
            routed = summary.routed,
            unroutable = summary.unroutable,
            sizing_failed = summary.sizing_failed,
            skipped = summary.skipped,
            "Signal fanned out"
        );
        Ok(summary)
    }

    /// The deployment's intent for the signal, and whether this call created it.
    async fn route_deployment(
        &self,
        signal: &Signal,
        source: &AlphaSource,
        deployment: &AgentDeployment,
        gate: Option<&str>,
    ) -> Result<(TradeIntent, bool), PipelineError> {
        if let Some(existing) = self.store.intent_for(signal.id, deployment.id).await? {
            return Ok((existing, false));
        }

        let mut new_intent = NewIntent {
            signal_id: signal.id,
            deployment_id: deployment.id,
            state: IntentState::Skipped,
            venue: None,
            size_model: None,
            rationale: None,
            last_error: None,
        };

        if let Some(reason) = gate {
            new_intent.rationale = Some(RoutingRationale::note_only(reason));
            new_intent.last_error = Some(reason.to_string());
            return self.persist(signal, new_intent).await;
        }

        let rationale = self
            .select_venue(&signal.token_symbol, deployment, &[])
            .await?;

        match rationale.selected {
            None => {
                new_intent.state = IntentState::Unroutable;
                new_intent.rationale = Some(rationale.with_note("no enabled venue can take the trade"));
            }
            Some(venue) => match self.size_for(signal, source.kind, deployment, venue) {
                Ok(model) => {
                    new_intent.state = IntentState::Routed;
                    new_intent.venue = Some(venue);
                    new_intent.size_model = Some(model);
                    new_intent.rationale = Some(rationale);
                }
                Err(e) => {
                    let e = PipelineError::from(e);
                    tracing::error!(
                        signal_id = %signal.id,
                        deployment_id = %deployment.id,
                        error = %e,
                        "Sizing failed"
                    );
                    new_intent.state = IntentState::SizingFailed;
                    new_intent.venue = Some(venue);
                    new_intent.rationale = Some(rationale);
                    new_intent.last_error = Some(e.to_string());
                }
            },
        }

        self.persist(signal, new_intent).await
    }

    async fn persist(
        &self,
        signal: &Signal,
        new_intent: NewIntent,
    ) -> Result<(TradeIntent, bool), PipelineError> {
        let Some(intent) = self.store.create_intent(&new_intent).await? else {
            // Lost the race to another router; its intent stands.
            let existing = self
                .store
                .intent_for(signal.id, new_intent.deployment_id)
                .await?
                .ok_or_else(|| {
                    PipelineError::StateConflict(format!(
                        "intent for signal {} and deployment {} vanished",
                        signal.id, new_intent.deployment_id
                    ))
                })?;
            return Ok((existing, false));
        };

        match intent.state {
            IntentState::Routed => {
                let venue = intent.venue.map(|v| v.as_str()).unwrap_or("none");
                counter!("intents_routed_total", "venue" => venue).increment(1);
            }
            IntentState::Unroutable => {
                counter!("intents_unroutable_total").increment(1);
                tracing::warn!(
                    signal_id = %signal.id,
                    deployment_id = %intent.deployment_id,
                    "No venue available, intent unroutable"
                );
                notifier::dispatch(&self.notifier, notifier::format_unroutable(signal, &intent));
            }
            IntentState::SizingFailed => counter!("intents_sizing_failed_total").increment(1),
            _ => {
                counter!("intents_skipped_total").increment(1);
                tracing::info!(
                    signal_id = %signal.id,
                    deployment_id = %intent.deployment_id,
                    reason = intent.last_error.as_deref().unwrap_or(""),
                    "Intent skipped"
                );
            }
        }
        Ok((intent, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{AlphaSourceRepo, DeploymentRepo, IntentRepo, MemoryStore, SignalRepo, WalletRepo};
    use crate::models::{NewSignal, RiskPreferences, Side};
    use crate::venues::PaperVenue;
    use rust_decimal::Decimal;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn paper(venue: Venue, tokens: &[&str]) -> Arc<PaperVenue> {
        let prices = tokens
            .iter()
            .map(|t| (t.to_string(), Decimal::from(100)))
            .collect::<HashMap<_, _>>();
        Arc::new(PaperVenue::new(venue, Decimal::from(10_000), prices))
    }

    async fn setup(
        venues: VenueRegistry,
        enabled: Vec<Venue>,
        wallets: &[Venue],
    ) -> (Arc<MemoryStore>, VenueRouter, Signal, AgentDeployment) {
        let store = Arc::new(MemoryStore::new());
        let source = store.upsert_alpha_source("x:@alpha", SourceKind::Trader).await.unwrap();
        let signal = store
            .insert_signal(&NewSignal {
                alpha_source_id: source.id,
                external_event_id: "evt-1".into(),
                token_symbol: "ETH".into(),
                side: Side::Long,
                confidence: 0.8,
                reasoning: None,
                attested: false,
            })
            .await
            .unwrap();
        let deployment = store
            .upsert_deployment(&AgentDeployment {
                id: Uuid::new_v4(),
                user_id: "user-1".into(),
                alpha_source_ids: vec![source.id],
                enabled_venues: enabled,
                risk_preferences: RiskPreferences::default(),
                capital_usd: Decimal::from(1_000),
                is_active: true,
                created_at: chrono::Utc::now(),
            })
            .await
            .unwrap();
        for (i, v) in wallets.iter().enumerate() {
            store.add_wallet(*v, &format!("0x{i:040x}"), "kms://test").await.unwrap();
            store.claim_wallet("user-1", *v).await.unwrap();
        }
        let router = VenueRouter::new(
            store.clone(),
            venues,
            SizingPolicy::default(),
            RoutingConfig::default(),
            None,
        );
        (store, router, signal, deployment)
    }

    #[tokio::test]
    async fn highest_priority_available_venue_wins() {
        let venues = VenueRegistry::new()
            .with(paper(Venue::Hyperliquid, &["BTC"]))
            .with(paper(Venue::Ostium, &["ETH"]))
            .with(paper(Venue::Gmx, &["ETH"]));
        let (_, router, signal, deployment) = setup(
            venues,
            vec![Venue::Gmx, Venue::Ostium, Venue::Hyperliquid],
            &[Venue::Hyperliquid, Venue::Ostium, Venue::Gmx],
        )
        .await;

        let first = router.select_venue(&signal.token_symbol, &deployment, &[]).await.unwrap();
        let second = router.select_venue(&signal.token_symbol, &deployment, &[]).await.unwrap();

        assert_eq!(first.selected, Some(Venue::Ostium));
        assert_eq!(first.checked, second.checked);
        assert_eq!(first.checked[0].outcome, VenueCheckOutcome::AssetUnavailable);
        // GMX is never consulted once Ostium accepted.
        assert_eq!(first.checked.len(), 2);
    }

    #[tokio::test]
    async fn missing_wallet_and_exclusion_are_recorded() {
        let venues = VenueRegistry::new()
            .with(paper(Venue::Hyperliquid, &["ETH"]))
            .with(paper(Venue::Ostium, &["ETH"]))
            .with(paper(Venue::Gmx, &["ETH"]));
        let (_, router, signal, deployment) = setup(
            venues,
            vec![Venue::Hyperliquid, Venue::Ostium, Venue::Gmx],
            &[Venue::Ostium, Venue::Gmx],
        )
        .await;

        let r = router
            .select_venue(&signal.token_symbol, &deployment, &[Venue::Ostium])
            .await
            .unwrap();
        assert_eq!(r.selected, Some(Venue::Gmx));
        let outcomes: Vec<_> = r.checked.iter().map(|c| c.outcome.clone()).collect();
        assert_eq!(
            outcomes,
            vec![
                VenueCheckOutcome::WalletNotConfigured,
                VenueCheckOutcome::Excluded,
                VenueCheckOutcome::Selected,
            ]
        );
    }

    #[tokio::test]
    async fn fan_out_marks_unroutable_without_touching_signal_route() {
        let venues = VenueRegistry::new().with(paper(Venue::Hyperliquid, &["BTC"]));
        let (store, router, signal, deployment) =
            setup(venues, vec![Venue::Hyperliquid], &[Venue::Hyperliquid]).await;

        let summary = router.fan_out(&signal).await.unwrap();
        assert_eq!(summary.unroutable, 1);

        let intent = store.intent_for(signal.id, deployment.id).await.unwrap().unwrap();
        assert_eq!(intent.state, IntentState::Unroutable);
        let stored = store.get_signal(signal.id).await.unwrap().unwrap();
        assert!(stored.venue.is_none());
        assert!(stored.fanned_out_at.is_some());
    }

    #[tokio::test]
    async fn fan_out_is_idempotent_and_records_first_route() {
        let venues = VenueRegistry::new().with(paper(Venue::Hyperliquid, &["ETH"]));
        let (store, router, signal, _) =
            setup(venues, vec![Venue::Hyperliquid], &[Venue::Hyperliquid]).await;

        assert_eq!(router.fan_out(&signal).await.unwrap().routed, 1);
        assert_eq!(router.fan_out(&signal).await.unwrap().existing, 1);

        let stored = store.get_signal(signal.id).await.unwrap().unwrap();
        assert_eq!(stored.venue, Some(Venue::Hyperliquid));
        assert!(stored.size_model.is_some());
    }

    #[tokio::test]
    async fn low_reputation_source_is_skipped() {
        let venues = VenueRegistry::new().with(paper(Venue::Hyperliquid, &["ETH"]));
        let (store, _, signal, deployment) =
            setup(venues.clone(), vec![Venue::Hyperliquid], &[Venue::Hyperliquid]).await;
        let router = VenueRouter::new(
            store.clone(),
            venues,
            SizingPolicy::default(),
            RoutingConfig {
                min_source_reputation: Some(Decimal::ONE),
                ..Default::default()
            },
            None,
        );

        assert_eq!(router.fan_out(&signal).await.unwrap().skipped, 1);
        let intent = store.intent_for(signal.id, deployment.id).await.unwrap().unwrap();
        assert_eq!(intent.state, IntentState::Skipped);
        assert!(intent.last_error.unwrap().contains("below minimum"));
    }
}
