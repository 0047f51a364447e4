//! Durable agreement records.
//!
//! Every backend implements optimistic concurrency: [`AgreementStore::update`]
//! only writes when the stored `version` still equals the version the caller
//! read, and bumps it on success. A [`ReceiptClaim`] passed to `update` is
//! recorded in the same write, so a transaction hash backs at most one
//! transition.

mod memory;
mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::agreement::{ActionKind, Address, Agreement, Role};
use crate::error::StoreError;
use crate::oracle::TxHash;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[async_trait]
pub trait AgreementStore: Send + Sync {
    /// Short backend label for health output and logs.
    fn backend(&self) -> &'static str;

    /// Persist a new record. Fails with `Duplicate` if its `on_chain_id` is taken.
    async fn insert(&self, agreement: &Agreement) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Agreement>, StoreError>;

    /// Records where `address` holds `role`, oldest first.
    async fn list_by_role(&self, role: Role, address: &Address)
    -> Result<Vec<Agreement>, StoreError>;

    /// Compare-and-swap on `agreement.version`; returns the stored record.
    ///
    /// With a `claim`, fails with `ReceiptClaimed` if its hash was already
    /// spent, and leaves the record untouched.
    async fn update(
        &self,
        agreement: &Agreement,
        claim: Option<&ReceiptClaim>,
    ) -> Result<Agreement, StoreError>;

    /// Returns whether a record was removed.
    async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;
}

/// A verified transaction hash spent on one transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptClaim {
    pub tx_hash: TxHash,
    pub action: ActionKind,
}

/// Store backend selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    Memory,
    Sqlite {
        database_url: String,
        max_connections: u32,
    },
}

impl StoreConfig {
    /// `None` keeps everything in process memory.
    pub fn from_database_url(database_url: Option<&str>, max_connections: u32) -> Self {
        match database_url {
            Some(url) if !url.trim().is_empty() => Self::Sqlite {
                database_url: url.to_string(),
                max_connections,
            },
            _ => Self::Memory,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Sqlite { .. } => "sqlite",
        }
    }

    pub async fn connect(&self) -> Result<Arc<dyn AgreementStore>, StoreError> {
        match self {
            Self::Memory => Ok(Arc::new(MemoryStore::new())),
            Self::Sqlite {
                database_url,
                max_connections,
            } => Ok(Arc::new(
                SqliteStore::connect(database_url, *max_connections).await?,
            )),
        }
    }
}
