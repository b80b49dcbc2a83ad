use metrics::counter;
use std::sync::Arc;

use super::attestation::{verify_attestation, AttestedClassification};
use crate::db::Store;
use crate::errors::PipelineError;
use crate::models::{ClassifiedCandidate, NewSignal, Side, Signal};
use crate::services::notifier::{self, Notifier};

#[derive(Debug, Clone)]
pub struct NormalizerConfig {
    /// Candidates below this confidence are skipped.
    pub min_confidence: f64,
    /// Upper-case token symbols the platform trades.
    pub supported_assets: Vec<String>,
    pub operator_address: Option<String>,
    pub require_attestation: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    LowConfidence { confidence: f64, floor: f64 },
    UnsupportedToken(Vec<String>),
    Duplicate(String),
}

impl SkipReason {
    pub fn label(&self) -> &'static str {
        match self {
            SkipReason::LowConfidence { .. } => "low_confidence",
            SkipReason::UnsupportedToken(_) => "unsupported_token",
            SkipReason::Duplicate(_) => "duplicate",
        }
    }
}

#[derive(Debug, Clone)]
pub enum NormalizeOutcome {
    Accepted(Signal),
    Skipped(SkipReason),
    /// Integrity failure; already persisted to the audit table.
    Rejected(String),
}

/// Turns classified candidates into canonical, deduplicated signals.
pub struct Normalizer {
    store: Arc<dyn Store>,
    config: NormalizerConfig,
    notifier: Option<Arc<Notifier>>,
}

impl Normalizer {
    pub fn new(store: Arc<dyn Store>, config: NormalizerConfig, notifier: Option<Arc<Notifier>>) -> Self {
        Self {
            store,
            config,
            notifier,
        }
    }

    pub async fn normalize(
        &self,
        candidate: &ClassifiedCandidate,
    ) -> Result<NormalizeOutcome, PipelineError> {
        let (side, attested) = match self.check_integrity(candidate) {
            Ok(ok) => ok,
            Err(PipelineError::Integrity(reason)) => return self.reject(candidate, reason).await,
            Err(e) => return Err(e),
        };

        if candidate.confidence < self.config.min_confidence {
            return Ok(self.skip(
                candidate,
                SkipReason::LowConfidence {
                    confidence: candidate.confidence,
                    floor: self.config.min_confidence,
                },
            ));
        }

        // A signed classification pins the token to the one the operator attested.
        let listed = match &attested {
            Some(a) => std::slice::from_ref(&a.token),
            None => candidate.token_symbols.as_slice(),
        };
        let Some(token) = self.first_supported_token(listed) else {
            return Ok(self.skip(
                candidate,
                SkipReason::UnsupportedToken(candidate.token_symbols.clone()),
            ));
        };

        let source = self
            .store
            .upsert_alpha_source(candidate.source_identity.trim(), candidate.source_kind)
            .await?;

        let new_signal = NewSignal {
            alpha_source_id: source.id,
            external_event_id: candidate.external_event_id.trim().to_string(),
            token_symbol: token,
            side,
            confidence: candidate.confidence,
            reasoning: candidate.reasoning.clone(),
            attested: attested.is_some(),
        };
        let dedup_key = new_signal.dedup_key();

        if self.store.signal_exists(&dedup_key).await? {
            return Ok(self.skip(candidate, SkipReason::Duplicate(dedup_key)));
        }

        // The unique index is the real guard; the check above only saves a write.
        match self.store.insert_signal(&new_signal).await {
            Ok(signal) => {
                counter!("signals_accepted_total").increment(1);
                tracing::info!(
                    signal_id = %signal.id,
                    source = %source.identity,
                    token = %signal.token_symbol,
                    side = %signal.side,
                    confidence = signal.confidence,
                    attested = signal.attested,
                    "Signal accepted"
                );
                Ok(NormalizeOutcome::Accepted(signal))
            }
            Err(e) if e.is_unique_violation() => {
                Ok(self.skip(candidate, SkipReason::Duplicate(dedup_key)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Shape, side and attestation checks. Returns the parsed side and, when
    /// the candidate carried a valid attestation, what the operator signed.
    fn check_integrity(
        &self,
        c: &ClassifiedCandidate,
    ) -> Result<(Side, Option<AttestedClassification>), PipelineError> {
        let integrity = PipelineError::Integrity;

        if c.source_identity.trim().is_empty() {
            return Err(integrity("blank source identity".into()));
        }
        if c.external_event_id.trim().is_empty() {
            return Err(integrity("blank external event id".into()));
        }
        if c.token_symbols.iter().all(|t| t.trim().is_empty()) {
            return Err(integrity("no token symbols".into()));
        }
        if !c.confidence.is_finite() || !(0.0..=1.0).contains(&c.confidence) {
            return Err(integrity(format!("confidence {} outside [0, 1]", c.confidence)));
        }
        let side = Side::from_api_str(&c.side)
            .ok_or_else(|| integrity(format!("unrecognized side {:?}", c.side)))?;

        match &c.attestation {
            Some(att) => {
                let attested = verify_attestation(att, self.config.operator_address.as_deref())
                    .and_then(|_| AttestedClassification::parse(&att.raw_output))
                    .and_then(|a| a.check_matches(&c.token_symbols, side, c.confidence).map(|_| a))
                    .map_err(|e| integrity(format!("attestation failed: {e}")))?;
                Ok((side, Some(attested)))
            }
            None if self.config.require_attestation => Err(integrity("missing attestation".into())),
            None => Ok((side, None)),
        }
    }

    fn first_supported_token(&self, symbols: &[String]) -> Option<String> {
        symbols
            .iter()
            .map(|s| s.trim().to_uppercase())
            .find(|s| self.config.supported_assets.iter().any(|a| a == s))
    }

    fn skip(&self, c: &ClassifiedCandidate, reason: SkipReason) -> NormalizeOutcome {
        counter!("signals_skipped_total", "reason" => reason.label()).increment(1);
        tracing::debug!(
            source = %c.source_identity,
            event_id = %c.external_event_id,
            reason = ?reason,
            "Candidate skipped"
        );
        NormalizeOutcome::Skipped(reason)
    }

    async fn reject(
        &self,
        c: &ClassifiedCandidate,
        reason: String,
    ) -> Result<NormalizeOutcome, PipelineError> {
        counter!("integrity_rejections_total").increment(1);
        tracing::warn!(
            source = %c.source_identity,
            event_id = %c.external_event_id,
            reason = %reason,
            "Integrity rejection"
        );

        let payload = serde_json::to_value(c).unwrap_or(serde_json::Value::Null);
        self.store
            .record_integrity_rejection(&c.source_identity, &c.external_event_id, &reason, &payload)
            .await?;

        notifier::dispatch(
            &self.notifier,
            notifier::format_integrity_rejection(&c.source_identity, &c.external_event_id, &reason),
        );

        Ok(NormalizeOutcome::Rejected(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{IntegrityRepo, MemoryStore, SignalRepo};
    use crate::models::SourceKind;

    fn config() -> NormalizerConfig {
        NormalizerConfig {
            min_confidence: 0.6,
            supported_assets: vec!["BTC".into(), "ETH".into()],
            operator_address: None,
            require_attestation: false,
        }
    }

    fn candidate(event: &str, tokens: &[&str], confidence: f64) -> ClassifiedCandidate {
        ClassifiedCandidate {
            source_identity: "x:@alpha".into(),
            source_kind: SourceKind::Social,
            external_event_id: event.into(),
            token_symbols: tokens.iter().map(|s| s.to_string()).collect(),
            side: "long".into(),
            confidence,
            reasoning: Some("breakout".into()),
            attestation: None,
        }
    }

    #[tokio::test]
    async fn first_supported_token_wins() {
        let store = Arc::new(MemoryStore::new());
        let n = Normalizer::new(store.clone(), config(), None);

        match n.normalize(&candidate("e1", &["PEPE", "eth", "BTC"], 0.9)).await.unwrap() {
            NormalizeOutcome::Accepted(s) => {
                assert_eq!(s.token_symbol, "ETH");
                assert_eq!(s.side, Side::Long);
                assert!(!s.attested);
            }
            other => panic!("expected accepted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn skips_are_not_integrity_failures() {
        let store = Arc::new(MemoryStore::new());
        let n = Normalizer::new(store.clone(), config(), None);

        let low = n.normalize(&candidate("e1", &["BTC"], 0.2)).await.unwrap();
        assert!(matches!(low, NormalizeOutcome::Skipped(SkipReason::LowConfidence { .. })));

        let unsupported = n.normalize(&candidate("e2", &["PEPE"], 0.9)).await.unwrap();
        assert!(matches!(unsupported, NormalizeOutcome::Skipped(SkipReason::UnsupportedToken(_))));

        assert!(store.recent_integrity_rejections(10).await.unwrap().is_empty());
        assert!(store.recent_signals(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replayed_event_is_a_duplicate() {
        let store = Arc::new(MemoryStore::new());
        let n = Normalizer::new(store.clone(), config(), None);

        let c = candidate("e1", &["BTC"], 0.9);
        assert!(matches!(n.normalize(&c).await.unwrap(), NormalizeOutcome::Accepted(_)));
        assert!(matches!(
            n.normalize(&c).await.unwrap(),
            NormalizeOutcome::Skipped(SkipReason::Duplicate(_))
        ));
        assert_eq!(store.recent_signals(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_candidates_are_audited() {
        let store = Arc::new(MemoryStore::new());
        let n = Normalizer::new(store.clone(), config(), None);

        let mut bad_side = candidate("e1", &["BTC"], 0.9);
        bad_side.side = "sideways".into();
        assert!(matches!(n.normalize(&bad_side).await.unwrap(), NormalizeOutcome::Rejected(_)));

        let out_of_range = candidate("e2", &["BTC"], 1.7);
        assert!(matches!(n.normalize(&out_of_range).await.unwrap(), NormalizeOutcome::Rejected(_)));

        let rejections = store.recent_integrity_rejections(10).await.unwrap();
        assert_eq!(rejections.len(), 2);
        assert!(store.recent_signals(10).await.unwrap().is_empty());
    }

    fn signed_candidate(event: &str, tokens: &[&str], side: &str, confidence: f64, raw_output: &str) -> ClassifiedCandidate {
        use crate::ingestion::attestation::attestation_message;
        use crate::models::Attestation;
        use alloy::primitives::hex;
        use alloy::signers::local::PrivateKeySigner;
        use alloy::signers::SignerSync;

        let signer: PrivateKeySigner = DEV_KEY.parse().unwrap();
        let mut att = Attestation {
            signing_address: signer.address().to_string(),
            signature: String::new(),
            raw_output: raw_output.into(),
            chain_id: 8453,
            model_id: "classifier-v3".into(),
            full_prompt: "Classify the post".into(),
        };
        let sig = signer.sign_message_sync(attestation_message(&att).as_bytes()).unwrap();
        att.signature = hex::encode(sig.as_bytes());

        let mut c = candidate(event, tokens, confidence);
        c.side = side.into();
        c.attestation = Some(att);
        c
    }

    const DEV_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const DEV_ADDR: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";

    fn attested_config() -> NormalizerConfig {
        NormalizerConfig {
            require_attestation: true,
            operator_address: Some(DEV_ADDR.into()),
            ..config()
        }
    }

    #[tokio::test]
    async fn attestation_for_another_trade_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let n = Normalizer::new(store.clone(), attested_config(), None);

        let c = signed_candidate(
            "e1",
            &["BTC"],
            "long",
            0.99,
            r#"{"token":"ETH","side":"SHORT","confidence":0.55}"#,
        );
        match n.normalize(&c).await.unwrap() {
            NormalizeOutcome::Rejected(reason) => assert!(reason.contains("does not match")),
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(store.recent_integrity_rejections(10).await.unwrap().len(), 1);
        assert!(store.recent_signals(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn matching_attestation_pins_the_attested_token() {
        let store = Arc::new(MemoryStore::new());
        let n = Normalizer::new(store.clone(), attested_config(), None);

        let c = signed_candidate(
            "e1",
            &["BTC", "ETH"],
            "SHORT",
            0.55,
            r#"{"token":"ETH","side":"SHORT","confidence":0.55}"#,
        );
        // 0.55 is under the 0.6 floor, so the attested signal is skipped, not rejected.
        assert!(matches!(
            n.normalize(&c).await.unwrap(),
            NormalizeOutcome::Skipped(SkipReason::LowConfidence { .. })
        ));

        let c = signed_candidate(
            "e2",
            &["BTC", "ETH"],
            "SHORT",
            0.8,
            r#"{"token":"ETH","side":"SHORT","confidence":0.8}"#,
        );
        match n.normalize(&c).await.unwrap() {
            NormalizeOutcome::Accepted(s) => {
                assert_eq!(s.token_symbol, "ETH");
                assert_eq!(s.side, Side::Short);
                assert!(s.attested);
            }
            other => panic!("expected accepted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_attestation_rejected_when_required() {
        let store = Arc::new(MemoryStore::new());
        let n = Normalizer::new(
            store.clone(),
            NormalizerConfig {
                require_attestation: true,
                ..config()
            },
            None,
        );
        let out = n.normalize(&candidate("e1", &["BTC"], 0.9)).await.unwrap();
        assert_eq!(
            match out {
                NormalizeOutcome::Rejected(r) => r,
                other => panic!("expected rejection, got {other:?}"),
            },
            "missing attestation"
        );
    }
}
