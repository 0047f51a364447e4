use thiserror::Error;
use uuid::Uuid;

use crate::agreement::{ActionKind, AgreementState, Guard, Party};

/// Failures surfaced by the agreement lifecycle and the service around it.
///
/// Validation and eligibility failures are expected outcomes the caller can
/// act on. `Storage` is the only internal variant; its detail is logged and
/// never shown to API consumers.
#[derive(Debug, Error)]
pub enum AgreementError {
    #[error("{0}")]
    Validation(String),

    #[error("agreement {0} not found")]
    NotFound(Uuid),

    #[error("cannot {action} while the agreement is {state}")]
    InvalidState {
        action: ActionKind,
        state: AgreementState,
    },

    #[error("cannot {action}: {guard}")]
    NotEligible { action: ActionKind, guard: Guard },

    #[error("{0} has already confirmed")]
    AlreadyConfirmed(Party),

    #[error("invalid dispute winner '{0}', expected payer or payee")]
    InvalidWinner(String),

    #[error("an agreement with on-chain id {0} already exists")]
    Duplicate(u64),

    #[error("agreement {0} was modified concurrently, retry the request")]
    Conflict(Uuid),

    #[error("{0}")]
    Forbidden(String),

    #[error("chain oracle error: {0}")]
    Oracle(#[from] OracleError),

    #[error("storage error: {0}")]
    Storage(StoreError),
}

impl AgreementError {
    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            AgreementError::Validation(_) => "validation_error",
            AgreementError::NotFound(_) => "not_found",
            AgreementError::InvalidState { .. } => "invalid_state",
            AgreementError::NotEligible { .. } => "not_eligible",
            AgreementError::AlreadyConfirmed(_) => "already_confirmed",
            AgreementError::InvalidWinner(_) => "invalid_winner",
            AgreementError::Duplicate(_) => "duplicate",
            AgreementError::Conflict(_) => "conflict",
            AgreementError::Forbidden(_) => "forbidden",
            AgreementError::Oracle(_) => "oracle_unavailable",
            AgreementError::Storage(_) => "internal_error",
        }
    }

    /// Whether repeating the same request may succeed without changes.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AgreementError::Conflict(_) | AgreementError::Oracle(_))
    }

    /// The guard that rejected the request, if any.
    pub fn guard(&self) -> Option<Guard> {
        match self {
            AgreementError::NotEligible { guard, .. } => Some(*guard),
            _ => None,
        }
    }
}

impl From<StoreError> for AgreementError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(id) => AgreementError::Conflict(id),
            StoreError::Missing(id) => AgreementError::NotFound(id),
            StoreError::Duplicate(on_chain_id) => AgreementError::Duplicate(on_chain_id),
            StoreError::ReceiptClaimed { action, .. } => AgreementError::NotEligible {
                action,
                guard: Guard::ReceiptAlreadyUsed,
            },
            other => AgreementError::Storage(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The stored version no longer matches the version the caller read.
    #[error("version conflict on agreement {0}")]
    Conflict(Uuid),

    #[error("agreement {0} does not exist")]
    Missing(Uuid),

    #[error("on-chain id {0} is already indexed")]
    Duplicate(u64),

    /// The transaction hash already backs an earlier transition.
    #[error("transaction {tx_hash} was already used, cannot {action}")]
    ReceiptClaimed { tx_hash: String, action: ActionKind },

    #[error("stored row is unreadable: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Errors raised while asking the chain for a transaction receipt.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("RPC endpoint returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("unexpected RPC response: {0}")]
    InvalidResponse(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}
