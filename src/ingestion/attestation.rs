use alloy::primitives::{hex, Address, Signature};
use serde::Deserialize;

use crate::models::{Attestation, Side};

/// Largest confidence difference still treated as the attested value.
const CONFIDENCE_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AttestationError {
    #[error("malformed signing address: {0}")]
    MalformedAddress(String),

    #[error("malformed signature: {0}")]
    MalformedSignature(String),

    #[error("signature recovers to {recovered}, not the claimed {claimed}")]
    SignerMismatch { claimed: Address, recovered: Address },

    #[error("signer {claimed} is not the expected operator {expected}")]
    UnexpectedOperator { claimed: Address, expected: Address },

    #[error("attested output is not a classification: {0}")]
    MalformedOutput(String),

    #[error("attested {field} {attested} does not match candidate {candidate}")]
    OutputMismatch {
        field: &'static str,
        attested: String,
        candidate: String,
    },
}

/// The classification the operator signed, carried in `rawOutput`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AttestedClassification {
    #[serde(alias = "tokenSymbol", alias = "token_symbol")]
    pub token: String,
    pub side: String,
    pub confidence: f64,
}

impl AttestedClassification {
    pub fn parse(raw_output: &str) -> Result<Self, AttestationError> {
        serde_json::from_str(raw_output).map_err(|e| AttestationError::MalformedOutput(e.to_string()))
    }

    /// Require the candidate to claim exactly what was signed. The attested
    /// token must be one of the candidate's tokens.
    pub fn check_matches(
        &self,
        token_symbols: &[String],
        side: Side,
        confidence: f64,
    ) -> Result<(), AttestationError> {
        let token = self.token.trim().to_uppercase();
        if !token_symbols.iter().any(|t| t.trim().eq_ignore_ascii_case(&token)) {
            return Err(AttestationError::OutputMismatch {
                field: "token",
                attested: token,
                candidate: token_symbols.join(","),
            });
        }
        if Side::from_api_str(&self.side) != Some(side) {
            return Err(AttestationError::OutputMismatch {
                field: "side",
                attested: self.side.clone(),
                candidate: side.to_string(),
            });
        }
        if (self.confidence - confidence).abs() > CONFIDENCE_TOLERANCE {
            return Err(AttestationError::OutputMismatch {
                field: "confidence",
                attested: self.confidence.to_string(),
                candidate: confidence.to_string(),
            });
        }
        Ok(())
    }
}

/// The exact bytes the inference operator signs.
pub fn attestation_message(a: &Attestation) -> String {
    format!("{}{}{}{}", a.chain_id, a.model_id, a.full_prompt, a.raw_output)
}

pub fn parse_address(raw: &str) -> Result<Address, AttestationError> {
    raw.trim()
        .parse::<Address>()
        .map_err(|e| AttestationError::MalformedAddress(format!("{raw}: {e}")))
}

/// Recover the EIP-191 signer of the attestation and check it against the
/// claimed address and, when given, the expected operator.
pub fn verify_attestation(
    attestation: &Attestation,
    expected_operator: Option<&str>,
) -> Result<Address, AttestationError> {
    let claimed = parse_address(&attestation.signing_address)?;

    let sig_bytes = hex::decode(attestation.signature.trim())
        .map_err(|e| AttestationError::MalformedSignature(e.to_string()))?;
    let signature = Signature::try_from(sig_bytes.as_slice())
        .map_err(|e| AttestationError::MalformedSignature(e.to_string()))?;

    let message = attestation_message(attestation);
    let recovered = signature
        .recover_address_from_msg(message.as_bytes())
        .map_err(|e| AttestationError::MalformedSignature(e.to_string()))?;

    if recovered != claimed {
        return Err(AttestationError::SignerMismatch { claimed, recovered });
    }

    if let Some(expected) = expected_operator {
        let expected = parse_address(expected)?;
        if claimed != expected {
            return Err(AttestationError::UnexpectedOperator { claimed, expected });
        }
    }

    Ok(recovered)
}
