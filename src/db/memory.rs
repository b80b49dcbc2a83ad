//! In-process store with the same uniqueness and conditional-update rules as
//! the Postgres schema. Backs dry runs and the test suite.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    AlphaSourceRepo, Attribution, DeploymentRepo, IntegrityRepo, IntentRepo, PositionRepo,
    ReputationAggregate, SettlementRepo, SignalRepo, StoreError, StoreHealth, StoreResult,
    WalletRepo,
};
use crate::models::{
    AgentDeployment, AlphaSource, BillingEvent, BillingKind, BillingStatus, ImpactFactorRecord,
    IntegrityRejection, IntentState, IntentUpdate, NewIntent, NewPosition, NewSignal, PnlSnapshot,
    Position, PositionClose, RoutingRationale, Signal, SizeModel, SourceKind, TradeIntent, Venue,
    WalletSlot,
};

#[derive(Default)]
struct Tables {
    alpha_sources: Vec<AlphaSource>,
    signals: Vec<Signal>,
    integrity_rejections: Vec<IntegrityRejection>,
    deployments: Vec<AgentDeployment>,
    intents: Vec<TradeIntent>,
    positions: Vec<Position>,
    billing_events: Vec<BillingEvent>,
    pnl_snapshots: HashMap<(Uuid, NaiveDate), Decimal>,
    impact_records: Vec<ImpactFactorRecord>,
    wallets: Vec<WalletSlot>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backdate an intent's last update. Lets sweeps be exercised without waiting.
    pub async fn age_intent(&self, id: Uuid, updated_at: DateTime<Utc>) {
        let mut t = self.tables.lock().await;
        if let Some(intent) = t.intents.iter_mut().find(|i| i.id == id) {
            intent.updated_at = updated_at;
        }
    }
}

fn newest_first<T, F: Fn(&T) -> DateTime<Utc>>(items: &mut [T], key: F) {
    items.sort_by_key(|item| std::cmp::Reverse(key(item)));
}

fn take(limit: i64) -> usize {
    usize::try_from(limit).unwrap_or(0)
}

#[async_trait]
impl StoreHealth for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Alpha sources
// ---------------------------------------------------------------------------

#[async_trait]
impl AlphaSourceRepo for MemoryStore {
    async fn upsert_alpha_source(
        &self,
        identity: &str,
        kind: SourceKind,
    ) -> StoreResult<AlphaSource> {
        let mut t = self.tables.lock().await;
        if let Some(existing) = t.alpha_sources.iter().find(|s| s.identity == identity) {
            return Ok(existing.clone());
        }
        let now = Utc::now();
        let source = AlphaSource {
            id: Uuid::new_v4(),
            identity: identity.to_string(),
            kind,
            reputation_score: Decimal::ZERO,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        t.alpha_sources.push(source.clone());
        Ok(source)
    }

    async fn get_alpha_source(&self, id: Uuid) -> StoreResult<Option<AlphaSource>> {
        let t = self.tables.lock().await;
        Ok(t.alpha_sources.iter().find(|s| s.id == id).cloned())
    }

    async fn list_alpha_sources(&self) -> StoreResult<Vec<AlphaSource>> {
        let t = self.tables.lock().await;
        let mut out = t.alpha_sources.clone();
        out.sort_by(|a, b| {
            b.reputation_score
                .cmp(&a.reputation_score)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(out)
    }

    async fn update_reputation(&self, id: Uuid, score: Decimal) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        if let Some(source) = t.alpha_sources.iter_mut().find(|s| s.id == id) {
            source.reputation_score = score;
            source.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_alpha_source_active(&self, id: Uuid, active: bool) -> StoreResult<bool> {
        let mut t = self.tables.lock().await;
        match t.alpha_sources.iter_mut().find(|s| s.id == id) {
            Some(source) => {
                source.is_active = active;
                source.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

#[async_trait]
impl SignalRepo for MemoryStore {
    async fn insert_signal(&self, signal: &NewSignal) -> StoreResult<Signal> {
        let mut t = self.tables.lock().await;
        let dedup_key = signal.dedup_key();
        if t.signals.iter().any(|s| s.dedup_key == dedup_key) {
            return Err(StoreError::UniqueViolation(format!(
                "signals.dedup_key {dedup_key}"
            )));
        }
        let row = Signal {
            id: Uuid::new_v4(),
            alpha_source_id: signal.alpha_source_id,
            external_event_id: signal.external_event_id.clone(),
            token_symbol: signal.token_symbol.clone(),
            side: signal.side,
            confidence: signal.confidence,
            reasoning: signal.reasoning.clone(),
            attested: signal.attested,
            dedup_key,
            venue: None,
            size_model: None,
            routing_rationale: None,
            fanned_out_at: None,
            created_at: Utc::now(),
        };
        t.signals.push(row.clone());
        Ok(row)
    }

    async fn signal_exists(&self, dedup_key: &str) -> StoreResult<bool> {
        let t = self.tables.lock().await;
        Ok(t.signals.iter().any(|s| s.dedup_key == dedup_key))
    }

    async fn get_signal(&self, id: Uuid) -> StoreResult<Option<Signal>> {
        let t = self.tables.lock().await;
        Ok(t.signals.iter().find(|s| s.id == id).cloned())
    }

    async fn recent_signals(&self, limit: i64) -> StoreResult<Vec<Signal>> {
        let t = self.tables.lock().await;
        let mut out = t.signals.clone();
        newest_first(&mut out, |s| s.created_at);
        out.truncate(take(limit));
        Ok(out)
    }

    async fn signals_pending_fanout(&self, limit: i64) -> StoreResult<Vec<Signal>> {
        let t = self.tables.lock().await;
        Ok(t.signals
            .iter()
            .filter(|s| s.fanned_out_at.is_none())
            .take(take(limit))
            .cloned()
            .collect())
    }

    async fn mark_signal_fanned_out(&self, id: Uuid) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        if let Some(s) = t.signals.iter_mut().find(|s| s.id == id) {
            s.fanned_out_at.get_or_insert_with(Utc::now);
        }
        Ok(())
    }

    async fn record_signal_route(
        &self,
        id: Uuid,
        venue: Venue,
        size_model: &SizeModel,
        rationale: &RoutingRationale,
    ) -> StoreResult<bool> {
        let mut t = self.tables.lock().await;
        match t.signals.iter_mut().find(|s| s.id == id && s.venue.is_none()) {
            Some(s) => {
                s.venue = Some(venue);
                s.size_model = Some(size_model.clone());
                s.routing_rationale = Some(rationale.clone());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl IntegrityRepo for MemoryStore {
    async fn record_integrity_rejection(
        &self,
        source_identity: &str,
        external_event_id: &str,
        reason: &str,
        payload: &serde_json::Value,
    ) -> StoreResult<IntegrityRejection> {
        let mut t = self.tables.lock().await;
        let row = IntegrityRejection {
            id: Uuid::new_v4(),
            source_identity: source_identity.to_string(),
            external_event_id: external_event_id.to_string(),
            reason: reason.to_string(),
            payload: payload.clone(),
            created_at: Utc::now(),
        };
        t.integrity_rejections.push(row.clone());
        Ok(row)
    }

    async fn recent_integrity_rejections(
        &self,
        limit: i64,
    ) -> StoreResult<Vec<IntegrityRejection>> {
        let t = self.tables.lock().await;
        let mut out = t.integrity_rejections.clone();
        newest_first(&mut out, |r| r.created_at);
        out.truncate(take(limit));
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Deployments + intents
// ---------------------------------------------------------------------------

#[async_trait]
impl DeploymentRepo for MemoryStore {
    async fn upsert_deployment(&self, deployment: &AgentDeployment) -> StoreResult<AgentDeployment> {
        let mut t = self.tables.lock().await;
        match t.deployments.iter_mut().find(|d| d.id == deployment.id) {
            Some(existing) => {
                let created_at = existing.created_at;
                *existing = AgentDeployment {
                    created_at,
                    ..deployment.clone()
                };
                Ok(existing.clone())
            }
            None => {
                t.deployments.push(deployment.clone());
                Ok(deployment.clone())
            }
        }
    }

    async fn get_deployment(&self, id: Uuid) -> StoreResult<Option<AgentDeployment>> {
        let t = self.tables.lock().await;
        Ok(t.deployments.iter().find(|d| d.id == id).cloned())
    }

    async fn list_deployments(&self) -> StoreResult<Vec<AgentDeployment>> {
        let t = self.tables.lock().await;
        Ok(t.deployments.clone())
    }

    async fn deployments_for_source(
        &self,
        alpha_source_id: Uuid,
    ) -> StoreResult<Vec<AgentDeployment>> {
        let t = self.tables.lock().await;
        let mut out: Vec<AgentDeployment> = t
            .deployments
            .iter()
            .filter(|d| d.is_active && d.subscribes_to(alpha_source_id))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }
}

#[async_trait]
impl IntentRepo for MemoryStore {
    async fn create_intent(&self, intent: &NewIntent) -> StoreResult<Option<TradeIntent>> {
        let mut t = self.tables.lock().await;
        if t.intents
            .iter()
            .any(|i| i.signal_id == intent.signal_id && i.deployment_id == intent.deployment_id)
        {
            return Ok(None);
        }
        let now = Utc::now();
        let row = TradeIntent {
            id: Uuid::new_v4(),
            signal_id: intent.signal_id,
            deployment_id: intent.deployment_id,
            state: intent.state,
            venue: intent.venue,
            size_model: intent.size_model.clone(),
            rationale: intent.rationale.clone(),
            excluded_venues: Vec::new(),
            tx_ref: None,
            attempts: 0,
            last_error: intent.last_error.clone(),
            created_at: now,
            updated_at: now,
        };
        t.intents.push(row.clone());
        Ok(Some(row))
    }

    async fn get_intent(&self, id: Uuid) -> StoreResult<Option<TradeIntent>> {
        let t = self.tables.lock().await;
        Ok(t.intents.iter().find(|i| i.id == id).cloned())
    }

    async fn intent_for(
        &self,
        signal_id: Uuid,
        deployment_id: Uuid,
    ) -> StoreResult<Option<TradeIntent>> {
        let t = self.tables.lock().await;
        Ok(t.intents
            .iter()
            .find(|i| i.signal_id == signal_id && i.deployment_id == deployment_id)
            .cloned())
    }

    async fn intents_in_state(
        &self,
        state: IntentState,
        limit: i64,
    ) -> StoreResult<Vec<TradeIntent>> {
        let t = self.tables.lock().await;
        Ok(t.intents
            .iter()
            .filter(|i| i.state == state)
            .take(take(limit))
            .cloned()
            .collect())
    }

    async fn list_intents(
        &self,
        state: Option<IntentState>,
        limit: i64,
    ) -> StoreResult<Vec<TradeIntent>> {
        let t = self.tables.lock().await;
        let mut out: Vec<TradeIntent> = t
            .intents
            .iter()
            .filter(|i| state.map_or(true, |s| i.state == s))
            .cloned()
            .collect();
        newest_first(&mut out, |i| i.created_at);
        out.truncate(take(limit));
        Ok(out)
    }

    async fn transition_intent(
        &self,
        id: Uuid,
        from: IntentState,
        to: IntentState,
        update: &IntentUpdate,
    ) -> StoreResult<Option<TradeIntent>> {
        let mut t = self.tables.lock().await;
        let Some(intent) = t.intents.iter_mut().find(|i| i.id == id && i.state == from) else {
            return Ok(None);
        };
        intent.state = to;
        if let Some(v) = update.venue {
            intent.venue = Some(v);
        }
        if let Some(m) = &update.size_model {
            intent.size_model = Some(m.clone());
        }
        if let Some(r) = &update.rationale {
            intent.rationale = Some(r.clone());
        }
        if let Some(x) = &update.excluded_venues {
            intent.excluded_venues = x.clone();
        }
        if let Some(tx) = &update.tx_ref {
            intent.tx_ref = Some(tx.clone());
        }
        if let Some(e) = &update.last_error {
            intent.last_error = Some(e.clone());
        }
        if update.bump_attempts {
            intent.attempts += 1;
        }
        intent.updated_at = Utc::now();
        Ok(Some(intent.clone()))
    }

    async fn stale_intents(
        &self,
        states: &[IntentState],
        before: DateTime<Utc>,
    ) -> StoreResult<Vec<TradeIntent>> {
        let t = self.tables.lock().await;
        let mut out: Vec<TradeIntent> = t
            .intents
            .iter()
            .filter(|i| states.contains(&i.state) && i.updated_at < before)
            .cloned()
            .collect();
        out.sort_by_key(|i| i.updated_at);
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Positions + settlement
// ---------------------------------------------------------------------------

#[async_trait]
impl PositionRepo for MemoryStore {
    async fn open_position(
        &self,
        position: &NewPosition,
        attribution: &[Attribution],
    ) -> StoreResult<(Position, bool)> {
        let mut t = self.tables.lock().await;
        if let Some(signal_id) = position.signal_id {
            if let Some(existing) = t.positions.iter().find(|p| {
                p.signal_id == Some(signal_id) && p.deployment_id == position.deployment_id
            }) {
                return Ok((existing.clone(), false));
            }
        }
        let row = Position {
            id: Uuid::new_v4(),
            signal_id: position.signal_id,
            deployment_id: position.deployment_id,
            intent_id: position.intent_id,
            venue: position.venue,
            token_symbol: position.token_symbol.clone(),
            side: position.side,
            wallet_address: position.wallet_address.clone(),
            venue_position_ref: position.venue_position_ref.clone(),
            entry_price: position.entry_price,
            qty: position.qty,
            opened_at: Utc::now(),
            closed_at: None,
            exit_price: None,
            pnl: None,
            close_reason: None,
            settled_at: None,
        };
        t.positions.push(row.clone());
        for a in attribution {
            if !t
                .impact_records
                .iter()
                .any(|r| r.position_id == row.id && r.alpha_source_id == a.alpha_source_id)
            {
                t.impact_records.push(ImpactFactorRecord {
                    alpha_source_id: a.alpha_source_id,
                    signal_id: position.signal_id,
                    position_id: row.id,
                    pnl_contribution: None,
                    weight: a.weight,
                    in_flight: true,
                });
            }
        }
        Ok((row, true))
    }

    async fn get_position(&self, id: Uuid) -> StoreResult<Option<Position>> {
        let t = self.tables.lock().await;
        Ok(t.positions.iter().find(|p| p.id == id).cloned())
    }

    async fn position_for(
        &self,
        signal_id: Uuid,
        deployment_id: Uuid,
    ) -> StoreResult<Option<Position>> {
        let t = self.tables.lock().await;
        Ok(t.positions
            .iter()
            .find(|p| p.signal_id == Some(signal_id) && p.deployment_id == deployment_id)
            .cloned())
    }

    async fn list_positions(&self, open_only: bool, limit: i64) -> StoreResult<Vec<Position>> {
        let t = self.tables.lock().await;
        let mut out: Vec<Position> = t
            .positions
            .iter()
            .filter(|p| !open_only || p.is_open())
            .cloned()
            .collect();
        newest_first(&mut out, |p| p.opened_at);
        out.truncate(take(limit));
        Ok(out)
    }

    async fn close_position(
        &self,
        id: Uuid,
        close: &PositionClose,
    ) -> StoreResult<Option<Position>> {
        let mut t = self.tables.lock().await;
        match t.positions.iter_mut().find(|p| p.id == id && p.is_open()) {
            Some(p) => {
                p.closed_at = Some(close.closed_at);
                p.exit_price = Some(close.exit_price);
                p.pnl = Some(close.pnl);
                p.close_reason = Some(close.reason);
                Ok(Some(p.clone()))
            }
            None => Ok(None),
        }
    }

    async fn closed_unsettled_positions(&self, limit: i64) -> StoreResult<Vec<Position>> {
        let t = self.tables.lock().await;
        let mut out: Vec<Position> = t
            .positions
            .iter()
            .filter(|p| !p.is_open() && !p.is_settled())
            .cloned()
            .collect();
        out.sort_by_key(|p| p.closed_at);
        out.truncate(take(limit));
        Ok(out)
    }
}

#[async_trait]
impl SettlementRepo for MemoryStore {
    async fn billing_events_for(&self, position_id: Uuid) -> StoreResult<Vec<BillingEvent>> {
        let t = self.tables.lock().await;
        Ok(t.billing_events
            .iter()
            .filter(|e| e.position_id == position_id)
            .cloned()
            .collect())
    }

    async fn insert_billing_event(
        &self,
        position_id: Uuid,
        deployment_id: Uuid,
        kind: BillingKind,
        amount: Decimal,
        status: BillingStatus,
    ) -> StoreResult<Option<BillingEvent>> {
        let mut t = self.tables.lock().await;
        if t.billing_events
            .iter()
            .any(|e| e.position_id == position_id && e.kind == kind)
        {
            return Ok(None);
        }
        let event = BillingEvent {
            id: Uuid::new_v4(),
            position_id,
            deployment_id,
            kind,
            amount,
            status,
            created_at: Utc::now(),
        };
        t.billing_events.push(event.clone());
        Ok(Some(event))
    }

    async fn finalize_settlement(
        &self,
        position_id: Uuid,
        deployment_id: Uuid,
        day: NaiveDate,
        pnl: Decimal,
    ) -> StoreResult<bool> {
        // A single lock scope stands in for the transaction.
        let mut t = self.tables.lock().await;
        let Some(position) = t
            .positions
            .iter_mut()
            .find(|p| p.id == position_id && !p.is_open() && !p.is_settled())
        else {
            return Ok(false);
        };
        position.settled_at = Some(Utc::now());

        *t.pnl_snapshots
            .entry((deployment_id, day))
            .or_insert(Decimal::ZERO) += pnl;

        for record in t
            .impact_records
            .iter_mut()
            .filter(|r| r.position_id == position_id && r.in_flight)
        {
            record.pnl_contribution = Some(pnl * record.weight);
            record.in_flight = false;
        }
        Ok(true)
    }

    async fn pnl_snapshot(
        &self,
        deployment_id: Uuid,
        day: NaiveDate,
    ) -> StoreResult<Option<PnlSnapshot>> {
        let t = self.tables.lock().await;
        Ok(t.pnl_snapshots
            .get(&(deployment_id, day))
            .map(|pnl| PnlSnapshot {
                deployment_id,
                day,
                pnl: *pnl,
            }))
    }

    async fn pnl_history(&self, deployment_id: Uuid, limit: i64) -> StoreResult<Vec<PnlSnapshot>> {
        let t = self.tables.lock().await;
        let mut out: Vec<PnlSnapshot> = t
            .pnl_snapshots
            .iter()
            .filter(|((d, _), _)| *d == deployment_id)
            .map(|((d, day), pnl)| PnlSnapshot {
                deployment_id: *d,
                day: *day,
                pnl: *pnl,
            })
            .collect();
        out.sort_by(|a, b| b.day.cmp(&a.day));
        out.truncate(take(limit));
        Ok(out)
    }

    async fn impact_records_for_position(
        &self,
        position_id: Uuid,
    ) -> StoreResult<Vec<ImpactFactorRecord>> {
        let t = self.tables.lock().await;
        Ok(t.impact_records
            .iter()
            .filter(|r| r.position_id == position_id)
            .cloned()
            .collect())
    }

    async fn reputation_aggregates(&self) -> StoreResult<Vec<ReputationAggregate>> {
        let t = self.tables.lock().await;
        let mut sums: HashMap<Uuid, (Decimal, i64)> = HashMap::new();
        for record in t.impact_records.iter().filter(|r| !r.in_flight) {
            if let Some(contribution) = record.pnl_contribution {
                let entry = sums.entry(record.alpha_source_id).or_insert((Decimal::ZERO, 0));
                entry.0 += contribution;
                entry.1 += 1;
            }
        }
        Ok(sums
            .into_iter()
            .map(|(alpha_source_id, (sum, samples))| ReputationAggregate {
                alpha_source_id,
                mean_contribution: sum / Decimal::from(samples),
                samples,
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Wallet pool
// ---------------------------------------------------------------------------

#[async_trait]
impl WalletRepo for MemoryStore {
    async fn add_wallet(
        &self,
        venue: Venue,
        address: &str,
        credential_ref: &str,
    ) -> StoreResult<WalletSlot> {
        let mut t = self.tables.lock().await;
        if t.wallets.iter().any(|w| w.address == address) {
            return Err(StoreError::UniqueViolation(format!(
                "wallet_pool.address {address}"
            )));
        }
        let slot = WalletSlot {
            id: Uuid::new_v4(),
            venue,
            address: address.to_string(),
            credential_ref: credential_ref.to_string(),
            assigned_user_id: None,
            assigned_at: None,
        };
        t.wallets.push(slot.clone());
        Ok(slot)
    }

    async fn claim_wallet(&self, user_id: &str, venue: Venue) -> StoreResult<Option<WalletSlot>> {
        let mut t = self.tables.lock().await;
        if let Some(held) = t
            .wallets
            .iter()
            .find(|w| w.venue == venue && w.assigned_user_id.as_deref() == Some(user_id))
        {
            return Ok(Some(held.clone()));
        }
        match t.wallets.iter_mut().find(|w| w.venue == venue && w.is_free()) {
            Some(slot) => {
                slot.assigned_user_id = Some(user_id.to_string());
                slot.assigned_at = Some(Utc::now());
                Ok(Some(slot.clone()))
            }
            None => Ok(None),
        }
    }

    async fn release_wallet(&self, slot_id: Uuid) -> StoreResult<bool> {
        let mut t = self.tables.lock().await;
        match t.wallets.iter_mut().find(|w| w.id == slot_id && !w.is_free()) {
            Some(slot) => {
                slot.assigned_user_id = None;
                slot.assigned_at = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn wallet_for(&self, user_id: &str, venue: Venue) -> StoreResult<Option<WalletSlot>> {
        let t = self.tables.lock().await;
        Ok(t.wallets
            .iter()
            .find(|w| w.venue == venue && w.assigned_user_id.as_deref() == Some(user_id))
            .cloned())
    }

    async fn wallets_for_user(&self, user_id: &str) -> StoreResult<Vec<WalletSlot>> {
        let t = self.tables.lock().await;
        let mut out: Vec<WalletSlot> = t
            .wallets
            .iter()
            .filter(|w| w.assigned_user_id.as_deref() == Some(user_id))
            .cloned()
            .collect();
        out.sort_by_key(|w| w.venue);
        Ok(out)
    }
}
