use chrono::Utc;
use metrics::{counter, histogram};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::retry::{retry_transient, with_timeout, RetryPolicy};
use crate::db::{Attribution, Store};
use crate::errors::PipelineError;
use crate::models::{
    AgentDeployment, CloseReason, IntentState, IntentUpdate, NewPosition, Position, PositionClose,
    Signal, SizeModel, SourceKind, TradeIntent, Venue,
};
use crate::routing::VenueRouter;
use crate::services::notifier::{self, Notifier};
use crate::settlement::engine::{attribution_for, compute_pnl};
use crate::venues::{CloseFill, OrderParams, OrderStatus, VenueAdapter, VenueError, VenueRegistry};

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub retry: RetryPolicy,
    /// How long to poll an accepted order before declaring it ambiguous.
    pub confirm_timeout: Duration,
    pub confirm_poll: Duration,
    /// Intents untouched for this long are picked up by the stale sweep.
    pub stale_after: chrono::Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            confirm_timeout: Duration::from_secs(60),
            confirm_poll: Duration::from_secs(2),
            stale_after: chrono::Duration::minutes(5),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Opened(Position),
    /// A position for the pair already existed; nothing was sent.
    AlreadyOpen(Position),
    Failed(String),
    Unroutable,
    Ambiguous,
    /// Another worker holds the intent, or it is no longer routed.
    NotClaimed,
}

#[derive(Debug, Clone)]
pub enum CloseOutcome {
    Closed(Position),
    AlreadyClosed(Position),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    Opened(Uuid),
    Failed(String),
    StillPending,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub released: usize,
    pub ambiguous: usize,
}

/// Everything needed to act on one claimed intent.
struct Job {
    intent: TradeIntent,
    signal: Signal,
    deployment: AgentDeployment,
    source_kind: SourceKind,
}

/// Drives intents from ROUTED to a terminal state, exactly once per
/// (signal, deployment).
pub struct TradeExecutor {
    store: Arc<dyn Store>,
    venues: VenueRegistry,
    router: Arc<VenueRouter>,
    config: ExecutorConfig,
    notifier: Option<Arc<Notifier>>,
}

impl TradeExecutor {
    pub fn new(
        store: Arc<dyn Store>,
        venues: VenueRegistry,
        router: Arc<VenueRouter>,
        config: ExecutorConfig,
        notifier: Option<Arc<Notifier>>,
    ) -> Self {
        Self {
            store,
            venues,
            router,
            config,
            notifier,
        }
    }

    // -----------------------------------------------------------------------
    // Open path
    // -----------------------------------------------------------------------

    pub async fn execute(&self, intent_id: Uuid) -> Result<ExecutionOutcome, PipelineError> {
        let started = Instant::now();

        let Some(intent) = self
            .store
            .transition_intent(intent_id, IntentState::Routed, IntentState::Preparing, &IntentUpdate::default())
            .await?
        else {
            return Ok(ExecutionOutcome::NotClaimed);
        };

        let job = match self.load_job(intent).await? {
            Ok(job) => job,
            Err((intent, err)) => {
                return self.fail(&intent, IntentState::Preparing, err).await;
            }
        };

        if let Some(existing) = self
            .store
            .position_for(job.signal.id, job.deployment.id)
            .await?
        {
            tracing::info!(
                intent_id = %job.intent.id,
                position_id = %existing.id,
                "Position already exists for pair, nothing to submit"
            );
            self.store
                .transition_intent(job.intent.id, IntentState::Preparing, IntentState::Open, &IntentUpdate::default())
                .await?;
            return Ok(ExecutionOutcome::AlreadyOpen(existing));
        }

        let outcome = self.run(job).await;
        histogram!("execution_latency_seconds").record(started.elapsed().as_secs_f64());
        outcome
    }

    async fn load_job(
        &self,
        intent: TradeIntent,
    ) -> Result<Result<Job, (TradeIntent, PipelineError)>, PipelineError> {
        let Some(signal) = self.store.get_signal(intent.signal_id).await? else {
            let err = PipelineError::NotFound(format!("signal {}", intent.signal_id));
            return Ok(Err((intent, err)));
        };
        let Some(deployment) = self.store.get_deployment(intent.deployment_id).await? else {
            let err = PipelineError::NotFound(format!("deployment {}", intent.deployment_id));
            return Ok(Err((intent, err)));
        };
        let source_kind = self
            .store
            .get_alpha_source(signal.alpha_source_id)
            .await?
            .map(|s| s.kind)
            .unwrap_or_default();
        if intent.venue.is_none() || intent.size_model.is_none() {
            let err = PipelineError::StateConflict("routed intent has no venue or size".into());
            return Ok(Err((intent, err)));
        }
        Ok(Ok(Job {
            intent,
            signal,
            deployment,
            source_kind,
        }))
    }

    /// PREPARING → SUBMITTING → CONFIRMING, rerouting on hard venue rejections.
    async fn run(&self, mut job: Job) -> Result<ExecutionOutcome, PipelineError> {
        loop {
            let (Some(venue), Some(model)) = (job.intent.venue, job.intent.size_model.clone()) else {
                let err = PipelineError::StateConflict("intent lost its venue".into());
                return self.fail(&job.intent, IntentState::Preparing, err).await;
            };
            let Some(adapter) = self.venues.get(venue) else {
                match self.reroute(&mut job, IntentState::Preparing, venue, "no adapter registered".into()).await? {
                    Some(outcome) => return Ok(outcome),
                    None => continue,
                }
            };

            // PREPARING: wallet + balance
            let Some(wallet) = self.store.wallet_for(&job.deployment.user_id, venue).await? else {
                match self.reroute(&mut job, IntentState::Preparing, venue, "wallet released".into()).await? {
                    Some(outcome) => return Ok(outcome),
                    None => continue,
                }
            };

            let required = match collateral_for(job.deployment.capital_usd, &model) {
                Ok(r) => r,
                Err(reason) => {
                    return self.fail(&job.intent, IntentState::Preparing, PipelineError::UserPermanent(reason)).await;
                }
            };

            let (balance, _) = retry_transient(&self.config.retry, "balance", || {
                adapter.available_balance(&wallet.address)
            })
            .await;
            match balance {
                Ok(available) if available < required => {
                    let err = VenueError::InsufficientFunds { required, available };
                    tracing::warn!(intent_id = %job.intent.id, venue = %venue, error = %err, "Balance check failed");
                    return self
                        .fail(&job.intent, IntentState::Preparing, PipelineError::UserPermanent(err.to_string()))
                        .await;
                }
                Ok(_) => {}
                Err(e) if e.is_transient() => {
                    let err = PipelineError::Transient(format!("balance check: {e}"));
                    return self.fail(&job.intent, IntentState::Preparing, err).await;
                }
                Err(e) => {
                    match self.reroute(&mut job, IntentState::Preparing, venue, e.to_string()).await? {
                        Some(outcome) => return Ok(outcome),
                        None => continue,
                    }
                }
            }

            // SUBMITTING
            let Some(submitting) = self
                .store
                .transition_intent(job.intent.id, IntentState::Preparing, IntentState::Submitting, &IntentUpdate::default())
                .await?
            else {
                return Ok(ExecutionOutcome::NotClaimed);
            };
            job.intent = submitting;

            let params = OrderParams {
                client_ref: job.intent.id.to_string(),
                token_symbol: job.signal.token_symbol.clone(),
                side: job.signal.side,
                collateral_usd: required,
                leverage: model.leverage,
                stop_loss_percent: model.stop_loss_percent,
                take_profit_percent: model.take_profit_percent,
                wallet_address: wallet.address.clone(),
            };

            let (submitted, attempts) =
                retry_transient(&self.config.retry, "submit", || adapter.submit_order(&params)).await;
            counter!("order_submit_attempts_total", "venue" => venue.as_str()).increment(u64::from(attempts));

            let tx_ref = match submitted {
                Ok(tx_ref) => tx_ref,
                // The last request may have reached the venue; only the
                // venue's record of the client reference can tell.
                Err(e @ VenueError::Timeout(_)) => {
                    let err = PipelineError::Ambiguous(format!("submit timed out after {attempts} attempts: {e}"));
                    return self.mark_ambiguous(&job.intent, IntentState::Submitting, err).await;
                }
                Err(e) if e.is_transient() => {
                    let err = PipelineError::Transient(format!("submit gave up after {attempts} attempts: {e}"));
                    return self.fail(&job.intent, IntentState::Submitting, err).await;
                }
                Err(e @ VenueError::InsufficientFunds { .. }) => {
                    return self
                        .fail(&job.intent, IntentState::Submitting, PipelineError::UserPermanent(e.to_string()))
                        .await;
                }
                Err(e) => {
                    tracing::warn!(intent_id = %job.intent.id, venue = %venue, error = %e, "Venue rejected order");
                    counter!("orders_rejected_total", "venue" => venue.as_str()).increment(1);
                    match self.reroute(&mut job, IntentState::Submitting, venue, e.to_string()).await? {
                        Some(outcome) => return Ok(outcome),
                        None => continue,
                    }
                }
            };

            let Some(confirming) = self
                .store
                .transition_intent(
                    job.intent.id,
                    IntentState::Submitting,
                    IntentState::Confirming,
                    &IntentUpdate {
                        tx_ref: Some(tx_ref.clone()),
                        bump_attempts: true,
                        ..Default::default()
                    },
                )
                .await?
            else {
                return Ok(ExecutionOutcome::NotClaimed);
            };
            job.intent = confirming;

            return self.confirm(&job, adapter.as_ref(), &tx_ref, &wallet.address).await;
        }
    }

    /// Exclude `venue` and ask the router for the next one. `Some` is a
    /// terminal outcome; `None` means the intent is back in PREPARING on a new venue.
    async fn reroute(
        &self,
        job: &mut Job,
        from: IntentState,
        venue: Venue,
        reason: String,
    ) -> Result<Option<ExecutionOutcome>, PipelineError> {
        let mut excluded = job.intent.excluded_venues.clone();
        if !excluded.contains(&venue) {
            excluded.push(venue);
        }

        let rationale = match self
            .router
            .select_venue(&job.signal.token_symbol, &job.deployment, &excluded)
            .await
        {
            Ok(r) => r.with_note(format!("{venue} rejected: {reason}")),
            Err(PipelineError::Transient(msg)) => {
                let err = PipelineError::Transient(format!("rerouting after {venue} rejection: {msg}"));
                return self.fail(&job.intent, from, err).await.map(Some);
            }
            Err(e) => return Err(e),
        };

        let Some(next) = rationale.selected else {
            let update = IntentUpdate {
                rationale: Some(rationale),
                excluded_venues: Some(excluded),
                last_error: Some(format!("{venue} rejected: {reason}")),
                ..Default::default()
            };
            let Some(intent) = self
                .store
                .transition_intent(job.intent.id, from, IntentState::Unroutable, &update)
                .await?
            else {
                return Ok(Some(ExecutionOutcome::NotClaimed));
            };
            counter!("intents_unroutable_total").increment(1);
            tracing::warn!(intent_id = %intent.id, "No alternate venue after rejection");
            notifier::dispatch(&self.notifier, notifier::format_unroutable(&job.signal, &intent));
            return Ok(Some(ExecutionOutcome::Unroutable));
        };

        let model = match self
            .router
            .size_for(&job.signal, job.source_kind, &job.deployment, next)
        {
            Ok(m) => m,
            Err(e) => return self.fail(&job.intent, from, PipelineError::Sizing(e)).await.map(Some),
        };

        tracing::info!(intent_id = %job.intent.id, from = %venue, to = %next, "Rerouting intent");
        let update = IntentUpdate {
            venue: Some(next),
            size_model: Some(model),
            rationale: Some(rationale),
            excluded_venues: Some(excluded),
            last_error: Some(format!("{venue} rejected: {reason}")),
            ..Default::default()
        };
        match self
            .store
            .transition_intent(job.intent.id, from, IntentState::Preparing, &update)
            .await?
        {
            Some(intent) => {
                job.intent = intent;
                Ok(None)
            }
            None => Ok(Some(ExecutionOutcome::NotClaimed)),
        }
    }

    /// CONFIRMING: poll until the venue reports a terminal status or the
    /// confirmation window closes.
    async fn confirm(
        &self,
        job: &Job,
        adapter: &dyn VenueAdapter,
        tx_ref: &str,
        wallet_address: &str,
    ) -> Result<ExecutionOutcome, PipelineError> {
        let deadline = Instant::now() + self.config.confirm_timeout;

        loop {
            match with_timeout(self.config.retry.call_timeout, "order status", adapter.get_order_status(tx_ref)).await {
                Ok(OrderStatus::Open {
                    entry_price,
                    qty,
                    position_ref,
                }) => {
                    let position = self
                        .materialize(&job.intent, &job.signal, adapter.venue(), wallet_address, entry_price, qty, position_ref)
                        .await?;
                    self.store
                        .transition_intent(job.intent.id, IntentState::Confirming, IntentState::Open, &IntentUpdate::default())
                        .await?;
                    return Ok(ExecutionOutcome::Opened(position));
                }
                Ok(OrderStatus::Failed(reason)) => {
                    let err = PipelineError::VenueRejected(format!("venue failed order: {reason}"));
                    return self.fail(&job.intent, IntentState::Confirming, err).await;
                }
                Ok(OrderStatus::Pending) => {}
                Err(e) => {
                    tracing::debug!(intent_id = %job.intent.id, error = %e, "Order status unavailable, polling again");
                }
            }

            if Instant::now() + self.config.confirm_poll > deadline {
                break;
            }
            tokio::time::sleep(self.config.confirm_poll).await;
        }

        let err = PipelineError::Ambiguous(format!(
            "no confirmation within {}s",
            self.config.confirm_timeout.as_secs()
        ));
        self.mark_ambiguous(&job.intent, IntentState::Confirming, err).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn materialize(
        &self,
        intent: &TradeIntent,
        signal: &Signal,
        venue: Venue,
        wallet_address: &str,
        entry_price: Decimal,
        qty: Decimal,
        position_ref: String,
    ) -> Result<Position, PipelineError> {
        let new_position = NewPosition {
            signal_id: Some(signal.id),
            deployment_id: intent.deployment_id,
            intent_id: Some(intent.id),
            venue,
            token_symbol: signal.token_symbol.clone(),
            side: signal.side,
            wallet_address: Some(wallet_address.to_string()),
            venue_position_ref: Some(position_ref),
            entry_price,
            qty,
        };
        let attribution: Vec<Attribution> = attribution_for(&[signal.alpha_source_id]);
        let (position, created) = self.store.open_position(&new_position, &attribution).await?;

        if created {
            counter!("positions_opened_total", "venue" => venue.as_str()).increment(1);
            tracing::info!(
                position_id = %position.id,
                intent_id = %intent.id,
                venue = %venue,
                token = %position.token_symbol,
                entry_price = %position.entry_price,
                qty = %position.qty,
                "Position opened"
            );
        }
        Ok(position)
    }

    async fn fail(
        &self,
        intent: &TradeIntent,
        from: IntentState,
        error: PipelineError,
    ) -> Result<ExecutionOutcome, PipelineError> {
        let reason = error.to_string();
        counter!("intents_failed_total").increment(1);
        tracing::warn!(intent_id = %intent.id, state = %from, reason = %reason, "Intent failed");
        match self
            .store
            .transition_intent(intent.id, from, IntentState::Failed, &IntentUpdate::error(reason.clone()))
            .await?
        {
            Some(_) => Ok(ExecutionOutcome::Failed(reason)),
            None => Ok(ExecutionOutcome::NotClaimed),
        }
    }

    async fn mark_ambiguous(
        &self,
        intent: &TradeIntent,
        from: IntentState,
        error: PipelineError,
    ) -> Result<ExecutionOutcome, PipelineError> {
        let update = IntentUpdate::error(error.to_string());
        match self
            .store
            .transition_intent(intent.id, from, IntentState::Ambiguous, &update)
            .await?
        {
            Some(flagged) => {
                self.flag_ambiguous(&flagged);
                Ok(ExecutionOutcome::Ambiguous)
            }
            None => Ok(ExecutionOutcome::NotClaimed),
        }
    }

    fn flag_ambiguous(&self, intent: &TradeIntent) {
        counter!("intents_ambiguous_total").increment(1);
        tracing::error!(
            intent_id = %intent.id,
            tx_ref = intent.tx_ref.as_deref().unwrap_or(""),
            "Execution outcome ambiguous, reconciliation required"
        );
        notifier::dispatch(&self.notifier, notifier::format_ambiguous(intent));
    }

    // -----------------------------------------------------------------------
    // Reconciliation + stale sweep
    // -----------------------------------------------------------------------

    /// Resolve an AMBIGUOUS intent from the venue's view of the order.
    pub async fn reconcile(&self, intent_id: Uuid) -> Result<ReconcileOutcome, PipelineError> {
        let intent = self
            .store
            .get_intent(intent_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("intent {intent_id}")))?;
        if intent.state != IntentState::Ambiguous {
            return Err(PipelineError::StateConflict(format!(
                "intent {intent_id} is {}, not AMBIGUOUS",
                intent.state
            )));
        }
        let Some(venue) = intent.venue else {
            return Err(PipelineError::StateConflict(format!(
                "intent {intent_id} has no venue; manual review required"
            )));
        };
        let adapter = self
            .venues
            .get(venue)
            .ok_or_else(|| PipelineError::Fatal(format!("no adapter for {venue}")))?;

        let tx_ref = match intent.tx_ref.clone() {
            Some(tx_ref) => tx_ref,
            None => {
                let found = with_timeout(
                    self.config.retry.call_timeout,
                    "order lookup",
                    adapter.find_order(&intent.id.to_string()),
                )
                .await
                .map_err(|e| PipelineError::Transient(e.to_string()))?;
                found.ok_or_else(|| {
                    PipelineError::StateConflict(format!(
                        "intent {intent_id} has no venue order reference and {venue} holds none; manual review required"
                    ))
                })?
            }
        };

        let status = with_timeout(self.config.retry.call_timeout, "order status", adapter.get_order_status(&tx_ref))
            .await
            .map_err(|e| PipelineError::Transient(e.to_string()))?;

        match status {
            OrderStatus::Open {
                entry_price,
                qty,
                position_ref,
            } => {
                let signal = self
                    .store
                    .get_signal(intent.signal_id)
                    .await?
                    .ok_or_else(|| PipelineError::NotFound(format!("signal {}", intent.signal_id)))?;
                let deployment = self
                    .store
                    .get_deployment(intent.deployment_id)
                    .await?
                    .ok_or_else(|| PipelineError::NotFound(format!("deployment {}", intent.deployment_id)))?;
                let wallet = self
                    .store
                    .wallet_for(&deployment.user_id, venue)
                    .await?
                    .map(|w| w.address)
                    .unwrap_or_default();
                let position = self
                    .materialize(&intent, &signal, venue, &wallet, entry_price, qty, position_ref)
                    .await?;
                let update = IntentUpdate {
                    tx_ref: Some(tx_ref.clone()),
                    ..Default::default()
                };
                self.store
                    .transition_intent(intent.id, IntentState::Ambiguous, IntentState::Open, &update)
                    .await?;
                tracing::info!(intent_id = %intent.id, position_id = %position.id, "Reconciled ambiguous intent as open");
                Ok(ReconcileOutcome::Opened(position.id))
            }
            OrderStatus::Failed(reason) => {
                self.store
                    .transition_intent(
                        intent.id,
                        IntentState::Ambiguous,
                        IntentState::Failed,
                        &IntentUpdate::error(format!("reconciled: {reason}")),
                    )
                    .await?;
                tracing::info!(intent_id = %intent.id, reason = %reason, "Reconciled ambiguous intent as failed");
                Ok(ReconcileOutcome::Failed(reason))
            }
            OrderStatus::Pending => Ok(ReconcileOutcome::StillPending),
        }
    }

    /// Release intents abandoned before anything was sent, and flag intents
    /// abandoned mid-flight as ambiguous.
    pub async fn sweep_stale(&self) -> Result<SweepReport, PipelineError> {
        let before = Utc::now() - self.config.stale_after;
        let mut report = SweepReport::default();

        for intent in self.store.stale_intents(&[IntentState::Preparing], before).await? {
            let update = IntentUpdate::error("released after stalling in PREPARING");
            if self
                .store
                .transition_intent(intent.id, IntentState::Preparing, IntentState::Routed, &update)
                .await?
                .is_some()
            {
                tracing::warn!(intent_id = %intent.id, "Stale PREPARING intent released");
                report.released += 1;
            }
        }

        let in_flight = [IntentState::Submitting, IntentState::Confirming];
        for intent in self.store.stale_intents(&in_flight, before).await? {
            let update = IntentUpdate::error(
                PipelineError::Ambiguous(format!("stalled in {}", intent.state)).to_string(),
            );
            if let Some(flagged) = self
                .store
                .transition_intent(intent.id, intent.state, IntentState::Ambiguous, &update)
                .await?
            {
                self.flag_ambiguous(&flagged);
                report.ambiguous += 1;
            }
        }

        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Close path
    // -----------------------------------------------------------------------

    /// Close a position once. `fill` carries a venue-reported exit (stop or
    /// take-profit hit); otherwise the venue is asked to close.
    pub async fn close_position(
        &self,
        position_id: Uuid,
        reason: CloseReason,
        fill: Option<CloseFill>,
    ) -> Result<CloseOutcome, PipelineError> {
        let position = self
            .store
            .get_position(position_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("position {position_id}")))?;
        if !position.is_open() {
            return Ok(CloseOutcome::AlreadyClosed(position));
        }

        let fill = match fill {
            Some(f) => f,
            None => self.close_at_venue(&position).await?,
        };
        if fill.qty != position.qty {
            tracing::error!(
                position_id = %position.id,
                held = %position.qty,
                filled = %fill.qty,
                "Venue close does not cover the whole position"
            );
            return Err(PipelineError::StateConflict(format!(
                "venue closed {} of position {} holding {}",
                fill.qty, position.id, position.qty
            )));
        }

        let close = PositionClose {
            exit_price: fill.exit_price,
            pnl: compute_pnl(position.entry_price, fill.exit_price, position.qty, position.side),
            closed_at: Utc::now(),
            reason,
        };

        match self.store.close_position(position.id, &close).await? {
            Some(closed) => {
                counter!("positions_closed_total", "reason" => reason.as_str()).increment(1);
                tracing::info!(
                    position_id = %closed.id,
                    exit_price = %close.exit_price,
                    pnl = %close.pnl,
                    reason = %reason,
                    "Position closed"
                );
                notifier::dispatch(&self.notifier, notifier::format_position_closed(&closed));
                Ok(CloseOutcome::Closed(closed))
            }
            None => {
                let current = self
                    .store
                    .get_position(position.id)
                    .await?
                    .ok_or_else(|| PipelineError::NotFound(format!("position {position_id}")))?;
                Ok(CloseOutcome::AlreadyClosed(current))
            }
        }
    }

    /// Close every open position the venues report as already closed, with
    /// the venue's fill and trigger. One venue failing leaves the rest alone.
    pub async fn sync_venue_closes(&self, batch: i64) -> Result<usize, PipelineError> {
        let open = self.store.list_positions(true, batch).await?;

        let mut by_wallet: HashMap<(Venue, String), Vec<Position>> = HashMap::new();
        for position in open {
            if position.venue_position_ref.is_none() {
                continue;
            }
            if let Some(wallet) = position.wallet_address.clone() {
                by_wallet.entry((position.venue, wallet)).or_default().push(position);
            }
        }

        let mut closed = 0;
        for ((venue, wallet), positions) in by_wallet {
            let Some(adapter) = self.venues.get(venue) else {
                continue;
            };
            let (result, _) =
                retry_transient(&self.config.retry, "closed positions", || adapter.closed_positions(&wallet)).await;
            let venue_closes = match result {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(venue = %venue, wallet = %wallet, error = %e, "Could not fetch venue closes");
                    continue;
                }
            };

            for position in &positions {
                let Some(vc) = venue_closes
                    .iter()
                    .find(|c| position.venue_position_ref.as_deref() == Some(c.position_ref.as_str()))
                else {
                    continue;
                };
                match self.close_position(position.id, vc.trigger, Some(vc.fill)).await {
                    Ok(CloseOutcome::Closed(_)) => {
                        counter!("positions_closed_at_venue_total", "reason" => vc.trigger.as_str()).increment(1);
                        closed += 1;
                    }
                    Ok(CloseOutcome::AlreadyClosed(_)) => {}
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        tracing::error!(position_id = %position.id, error = %e, "Could not book venue close");
                    }
                }
            }
        }
        Ok(closed)
    }

    async fn close_at_venue(&self, position: &Position) -> Result<CloseFill, PipelineError> {
        let adapter = self
            .venues
            .get(position.venue)
            .ok_or_else(|| PipelineError::Fatal(format!("no adapter for {}", position.venue)))?;
        let position_ref = position.venue_position_ref.as_deref().ok_or_else(|| {
            PipelineError::StateConflict(format!("position {} has no venue reference", position.id))
        })?;

        let (result, _) =
            retry_transient(&self.config.retry, "close", || adapter.close_position(position_ref)).await;
        result.map_err(|e| match e {
            e if e.is_transient() => PipelineError::Transient(e.to_string()),
            e => PipelineError::VenueRejected(e.to_string()),
        })
    }
}

/// Collateral committed to the order: capital × size%.
fn collateral_for(capital_usd: Decimal, model: &SizeModel) -> Result<Decimal, String> {
    let pct = Decimal::try_from(model.size_percent)
        .map_err(|e| format!("size percent {} unusable: {e}", model.size_percent))?;
    let required = (capital_usd * pct / Decimal::ONE_HUNDRED).round_dp(2);
    if required <= Decimal::ZERO {
        return Err(format!("order collateral {required} is not positive"));
    }
    Ok(required)
}
