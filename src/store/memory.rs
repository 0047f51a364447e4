use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{AgreementStore, ReceiptClaim};
use crate::agreement::{Address, Agreement, Role};
use crate::error::StoreError;
use crate::oracle::TxHash;

/// Process-local store. The write lock makes each compare-and-swap atomic,
/// together with its receipt claim.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<Uuid, Agreement>,
    /// Spent transaction hashes and the agreement each one moved.
    claims: HashMap<TxHash, Uuid>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgreementStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn insert(&self, agreement: &Agreement) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner
            .records
            .values()
            .any(|existing| existing.on_chain_id == agreement.on_chain_id)
        {
            return Err(StoreError::Duplicate(agreement.on_chain_id));
        }
        inner.records.insert(agreement.id, agreement.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Agreement>, StoreError> {
        Ok(self.inner.read().await.records.get(&id).cloned())
    }

    async fn list_by_role(
        &self,
        role: Role,
        address: &Address,
    ) -> Result<Vec<Agreement>, StoreError> {
        let inner = self.inner.read().await;
        let mut matches: Vec<Agreement> = inner
            .records
            .values()
            .filter(|agreement| agreement.address_of(role) == address)
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(matches)
    }

    async fn update(
        &self,
        agreement: &Agreement,
        claim: Option<&ReceiptClaim>,
    ) -> Result<Agreement, StoreError> {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;
        let stored = inner
            .records
            .get_mut(&agreement.id)
            .ok_or(StoreError::Missing(agreement.id))?;
        if stored.version != agreement.version {
            return Err(StoreError::Conflict(agreement.id));
        }
        if let Some(claim) = claim {
            if inner.claims.contains_key(&claim.tx_hash) {
                return Err(StoreError::ReceiptClaimed {
                    tx_hash: claim.tx_hash.to_string(),
                    action: claim.action,
                });
            }
            inner.claims.insert(claim.tx_hash.clone(), agreement.id);
        }

        let mut next = agreement.clone();
        next.version += 1;
        *stored = next.clone();
        Ok(next)
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.inner.write().await.records.remove(&id).is_some())
    }
}
