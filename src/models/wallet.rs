use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Venue;

/// A pre-provisioned venue credential, handed to at most one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletSlot {
    pub id: Uuid,
    pub venue: Venue,
    pub address: String,
    /// Opaque handle into the key store; never the key itself.
    #[serde(skip_serializing)]
    pub credential_ref: String,
    pub assigned_user_id: Option<String>,
    pub assigned_at: Option<DateTime<Utc>>,
}

impl WalletSlot {
    pub fn is_free(&self) -> bool {
        self.assigned_user_id.is_none()
    }
}
