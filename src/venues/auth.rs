use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Venue-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Venue-Timestamp";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("HMAC computation failed: {0}")]
    HmacError(String),
}

/// Shared-secret request signing for the venue gateway services.
#[derive(Clone)]
pub struct GatewayAuth {
    secret: String,
}

impl std::fmt::Debug for GatewayAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayAuth").finish_non_exhaustive()
    }
}

impl GatewayAuth {
    pub fn new(secret: String) -> Self {
        Self { secret }
    }

    /// HMAC-SHA256 over `{timestamp}{method}{path}{body}`, base64 encoded.
    pub fn sign(
        &self,
        timestamp: &str,
        method: &str,
        path: &str,
        body: &str,
    ) -> Result<String, AuthError> {
        let message = format!("{timestamp}{method}{path}{body}");

        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| AuthError::HmacError(e.to_string()))?;

        mac.update(message.as_bytes());
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    /// Constant-time check of a signature produced by [`GatewayAuth::sign`].
    pub fn verify(&self, timestamp: &str, method: &str, path: &str, body: &str, signature: &str) -> bool {
        let Ok(expected) = BASE64.decode(signature) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(self.secret.as_bytes()) else {
            return false;
        };
        mac.update(format!("{timestamp}{method}{path}{body}").as_bytes());
        mac.verify_slice(&expected).is_ok()
    }
}
