use super::money::Balance;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque subject id handed out by the authenticator.
pub type UserId = Uuid;

/// A registered loyalty account holder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub login: String,
    /// Hash produced by the credential collaborator; never interpreted here.
    pub credential_hash: String,
    pub balance: Balance,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(login: impl Into<String>, credential_hash: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            login: login.into(),
            credential_hash: credential_hash.into(),
            balance: Balance::ZERO,
            created_at: Utc::now(),
        }
    }
}

/// Current balance alongside everything the user has withdrawn so far.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BalanceSummary {
    pub current: Balance,
    pub withdrawn: Balance,
}
