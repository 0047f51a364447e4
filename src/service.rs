//! Request-surface orchestration around the lifecycle engine.
//!
//! Each lifecycle call follows the same path: validate the caller, read the
//! record, check the chain receipt against it (when configured), then apply
//! and compare-and-swap, retrying on a concurrent write. A verified receipt
//! is spent in the same write.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agreement::{
    Action, ActionKind, Address, Agreement, AgreementState, Guard, Lifecycle, NewAgreement, Party,
    Role, RoleActions,
};
use crate::clock::{Clock, SystemClock};
use crate::config::EscrowConfig;
use crate::error::{AgreementError, StoreError};
use crate::oracle::{ChainOracle, JsonRpcOracle, ReceiptPolicy, TxHash};
use crate::store::{AgreementStore, ReceiptClaim};

/// Retry behaviour for optimistic-concurrency conflicts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first conflicting write before giving up.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 25,
        }
    }
}

impl RetryConfig {
    /// delay = base_delay_ms * 2^(attempt - 1)
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        self.base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// One record plus what each role may do with it right now.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgreementDetail {
    pub agreement: Agreement,
    pub available_actions: Vec<RoleActions>,
}

/// Agreements bound to one address in one role.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleListing {
    pub role: Role,
    pub address: Address,
    pub agreements: Vec<Agreement>,
    /// Records currently awaiting arbitration.
    pub dispute_count: usize,
    /// Records completed through arbitration.
    pub resolve_count: usize,
}

pub struct AgreementService {
    store: Arc<dyn AgreementStore>,
    clock: Arc<dyn Clock>,
    oracle: Option<Arc<dyn ChainOracle>>,
    require_receipts: bool,
    receipt_policy: ReceiptPolicy,
    admin_token: Option<String>,
    retry: RetryConfig,
}

impl AgreementService {
    pub fn new(store: Arc<dyn AgreementStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            oracle: None,
            require_receipts: false,
            receipt_policy: ReceiptPolicy::default(),
            admin_token: None,
            retry: RetryConfig::default(),
        }
    }

    /// Check receipts against `oracle`; with `require_receipts` every
    /// lifecycle request must carry a transaction hash.
    pub fn with_oracle(mut self, oracle: Arc<dyn ChainOracle>, require_receipts: bool) -> Self {
        self.oracle = Some(oracle);
        self.require_receipts = require_receipts;
        self
    }

    /// How a receipt is tied to the agreement and action it authorizes.
    pub fn with_receipt_policy(mut self, policy: ReceiptPolicy) -> Self {
        self.receipt_policy = policy;
        self
    }

    pub fn with_admin_token(mut self, token: Option<String>) -> Self {
        self.admin_token = token;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Wire store, clock and oracle from configuration.
    pub async fn bootstrap(config: &EscrowConfig) -> anyhow::Result<Self> {
        let store_config = config.store();
        let store = store_config
            .connect()
            .await
            .with_context(|| format!("failed to open {} store", store_config.label()))?;

        let mut service = Self::new(store, Arc::new(SystemClock))
            .with_admin_token(config.admin_token.clone())
            .with_retry(config.retry());

        match &config.rpc_url {
            Some(url) => {
                let oracle = JsonRpcOracle::new(url.clone())?;
                service = service
                    .with_oracle(Arc::new(oracle), config.require_receipts)
                    .with_receipt_policy(config.receipt_policy()?);
                info!(rpc_url = %url, require_receipts = config.require_receipts, "chain oracle configured");
            }
            None if config.require_receipts => {
                bail!("require_receipts is set but no rpc_url is configured");
            }
            None => {}
        }

        Ok(service)
    }

    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    pub async fn create(&self, input: NewAgreement) -> Result<Agreement, AgreementError> {
        let agreement = Lifecycle::create(input, self.clock.now())?;
        self.store.insert(&agreement).await?;
        info!(
            id = %agreement.id,
            on_chain_id = agreement.on_chain_id,
            payer = %agreement.payer,
            amount = %agreement.amount,
            "agreement indexed"
        );
        Ok(agreement)
    }

    pub async fn get(&self, id: Uuid) -> Result<Agreement, AgreementError> {
        self.store
            .get(id)
            .await?
            .ok_or(AgreementError::NotFound(id))
    }

    pub async fn detail(&self, id: Uuid) -> Result<AgreementDetail, AgreementError> {
        let agreement = self.get(id).await?;
        let available_actions = Lifecycle::available_actions(&agreement, self.clock.now());
        Ok(AgreementDetail {
            agreement,
            available_actions,
        })
    }

    /// An address with no agreements yields an empty listing, not an error.
    pub async fn list_by_role(
        &self,
        role: Role,
        address: &str,
    ) -> Result<RoleListing, AgreementError> {
        let address = Address::parse(address).map_err(|err| {
            AgreementError::Validation(format!("{role} address is invalid: {err}"))
        })?;
        let agreements = self.store.list_by_role(role, &address).await?;

        let dispute_count = agreements
            .iter()
            .filter(|a| a.current_state == AgreementState::InDispute)
            .count();
        let resolve_count = agreements
            .iter()
            .filter(|a| a.was_resolved_by_arbiter())
            .count();

        Ok(RoleListing {
            role,
            address,
            agreements,
            dispute_count,
            resolve_count,
        })
    }

    pub async fn request_confirmation(
        &self,
        id: Uuid,
        caller: &str,
        party: Party,
        tx_hash: Option<&str>,
    ) -> Result<Agreement, AgreementError> {
        self.execute(id, caller, Action::Confirm(party), tx_hash).await
    }

    pub async fn raise_dispute(
        &self,
        id: Uuid,
        caller: &str,
        tx_hash: Option<&str>,
    ) -> Result<Agreement, AgreementError> {
        self.execute(id, caller, Action::RaiseDispute, tx_hash).await
    }

    pub async fn resolve_dispute(
        &self,
        id: Uuid,
        caller: &str,
        winner: &str,
        tx_hash: Option<&str>,
    ) -> Result<Agreement, AgreementError> {
        let winner = winner
            .parse::<Party>()
            .map_err(|_| AgreementError::InvalidWinner(winner.to_string()))?;
        self.execute(id, caller, Action::ResolveDispute(winner), tx_hash)
            .await
    }

    pub async fn release_funds(
        &self,
        id: Uuid,
        caller: &str,
        tx_hash: Option<&str>,
    ) -> Result<Agreement, AgreementError> {
        self.execute(id, caller, Action::ReleaseFunds, tx_hash).await
    }

    pub async fn cancel_expired(
        &self,
        id: Uuid,
        caller: &str,
        tx_hash: Option<&str>,
    ) -> Result<Agreement, AgreementError> {
        self.execute(id, caller, Action::CancelExpired, tx_hash).await
    }

    pub async fn extend_deadline(
        &self,
        id: Uuid,
        caller: &str,
        new_deadline: DateTime<Utc>,
        tx_hash: Option<&str>,
    ) -> Result<Agreement, AgreementError> {
        self.execute(id, caller, Action::ExtendDeadline(new_deadline), tx_hash)
            .await
    }

    /// Administrative removal. Not part of the business lifecycle.
    pub async fn delete(&self, id: Uuid, admin_token: Option<&str>) -> Result<(), AgreementError> {
        match (self.admin_token.as_deref(), admin_token) {
            (None, _) => {
                return Err(AgreementError::Forbidden(
                    "administrative delete is disabled".into(),
                ));
            }
            (Some(expected), Some(given)) if expected == given => {}
            _ => return Err(AgreementError::Forbidden("invalid admin token".into())),
        }

        if !self.store.delete(id).await? {
            return Err(AgreementError::NotFound(id));
        }
        warn!(%id, "agreement deleted by administrator");
        Ok(())
    }

    async fn execute(
        &self,
        id: Uuid,
        caller: &str,
        action: Action,
        tx_hash: Option<&str>,
    ) -> Result<Agreement, AgreementError> {
        let caller = Address::parse(caller).map_err(|err| {
            AgreementError::Validation(format!("caller address is invalid: {err}"))
        })?;
        let tx_hash = tx_hash
            .map(|raw| {
                TxHash::parse(raw).ok_or_else(|| {
                    AgreementError::Validation(format!("'{raw}' is not a transaction hash"))
                })
            })
            .transpose()?;

        let mut current = self.get(id).await?;
        let claim = self
            .verify_receipt(&current, action.kind(), tx_hash)
            .await?;

        let mut attempt = 0;
        loop {
            let next = Lifecycle::apply(&current, &action, &caller, self.clock.now())
                .inspect_err(|err| {
                    debug!(%id, action = ?action.kind(), error = %err, "lifecycle request rejected");
                })?;

            match self.store.update(&next, claim.as_ref()).await {
                Ok(stored) => {
                    info!(
                        %id,
                        on_chain_id = stored.on_chain_id,
                        action = ?action.kind(),
                        from = %current.current_state,
                        to = %stored.current_state,
                        version = stored.version,
                        tx_hash = claim.as_ref().map(|c| c.tx_hash.as_str()),
                        "agreement updated"
                    );
                    return Ok(stored);
                }
                Err(StoreError::Conflict(_)) if attempt < self.retry.max_retries => {
                    attempt += 1;
                    let delay_ms = self.retry.delay_for_attempt(attempt);
                    warn!(%id, attempt, delay_ms, "concurrent update detected, retrying");
                    sleep(Duration::from_millis(delay_ms)).await;
                    current = self.get(id).await?;
                }
                Err(err) => {
                    if matches!(err, StoreError::ReceiptClaimed { .. }) {
                        warn!(%id, action = ?action.kind(), "transaction hash replayed");
                    }
                    return Err(err.into());
                }
            }
        }
    }

    /// Returns the claim to spend with the write, or `None` when no receipt
    /// is checked.
    async fn verify_receipt(
        &self,
        agreement: &Agreement,
        action: ActionKind,
        tx_hash: Option<TxHash>,
    ) -> Result<Option<ReceiptClaim>, AgreementError> {
        let Some(oracle) = &self.oracle else {
            return Ok(None);
        };
        let Some(tx_hash) = tx_hash else {
            if self.require_receipts {
                return Err(AgreementError::Validation(
                    "txHash is required for lifecycle actions".into(),
                ));
            }
            return Ok(None);
        };

        let id = agreement.id;
        let receipt = match oracle.receipt(&tx_hash).await {
            Ok(Some(receipt)) => receipt,
            Ok(None) => {
                return Err(AgreementError::NotEligible {
                    action,
                    guard: Guard::ReceiptNotSuccessful,
                });
            }
            Err(err) => {
                error!(%id, %tx_hash, error = %err, "receipt lookup failed");
                return Err(err.into());
            }
        };

        self.receipt_policy
            .check(&receipt, agreement.on_chain_id, action)
            .map_err(|guard| {
                debug!(%id, %tx_hash, ?guard, "receipt rejected");
                AgreementError::NotEligible { action, guard }
            })?;
        debug!(%id, %tx_hash, block = ?receipt.block_number, "receipt confirmed");

        Ok(Some(ReceiptClaim { tx_hash, action }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agreement::AmountInput;
    use crate::clock::ManualClock;
    use crate::error::OracleError;
    use crate::oracle::{Receipt, ReceiptLog, agreement_topic};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::{TimeDelta, TimeZone};

    const PAYER: &str = "0x1111111111111111111111111111111111111111";
    const PAYEE: &str = "0x2222222222222222222222222222222222222222";
    const ARBITER: &str = "0x3333333333333333333333333333333333333333";

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 8, 15, 12, 0, 0).unwrap()
    }

    fn input(on_chain_id: u64, deadline: DateTime<Utc>) -> NewAgreement {
        NewAgreement {
            on_chain_id,
            title: Some("Translation job".into()),
            detail: Some("EN to PT, 40 pages".into()),
            payer: PAYER.into(),
            payee: PAYEE.into(),
            arbiter: ARBITER.into(),
            amount: AmountInput::Text("2500000000000000000".into()),
            deadline,
        }
    }

    fn service() -> (AgreementService, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        let service = AgreementService::new(Arc::new(MemoryStore::new()), clock.clone())
            .with_retry(RetryConfig {
                max_retries: 3,
                base_delay_ms: 1,
            });
        (service, clock)
    }

    #[test]
    fn retry_config_exponential_backoff() {
        let config = RetryConfig {
            max_retries: 5,
            base_delay_ms: 10,
        };
        assert_eq!(config.delay_for_attempt(1), 10);
        assert_eq!(config.delay_for_attempt(2), 20);
        assert_eq!(config.delay_for_attempt(3), 40);
        assert_eq!(config.delay_for_attempt(200), u64::MAX);
    }

    #[tokio::test]
    async fn scenario_mutual_release() {
        let (service, _clock) = service();
        let created = service
            .create(input(1, start() + TimeDelta::hours(1)))
            .await
            .unwrap();
        assert_eq!(created.current_state, AgreementState::Funded);

        service
            .request_confirmation(created.id, PAYER, Party::Payer, None)
            .await
            .unwrap();
        service
            .request_confirmation(created.id, PAYEE, Party::Payee, None)
            .await
            .unwrap();
        let released = service.release_funds(created.id, PAYER, None).await.unwrap();

        assert_eq!(released.current_state, AgreementState::Completed);
        assert_eq!(released.dispute_winner, None);
        assert_eq!(released.version, 3);
    }

    #[tokio::test]
    async fn scenario_dispute_after_deadline() {
        let (service, clock) = service();
        let created = service
            .create(input(2, start() + TimeDelta::hours(1)))
            .await
            .unwrap();
        service
            .request_confirmation(created.id, PAYER, Party::Payer, None)
            .await
            .unwrap();

        let err = service.raise_dispute(created.id, PAYER, None).await.unwrap_err();
        assert_eq!(err.guard(), Some(Guard::DeadlineNotPassed));

        clock.advance(TimeDelta::hours(2));
        let disputed = service.raise_dispute(created.id, PAYER, None).await.unwrap();
        assert_eq!(disputed.current_state, AgreementState::InDispute);

        let err = service
            .resolve_dispute(created.id, ARBITER, "nobody", None)
            .await
            .unwrap_err();
        assert!(matches!(err, AgreementError::InvalidWinner(_)));

        let resolved = service
            .resolve_dispute(created.id, ARBITER, "payee", None)
            .await
            .unwrap();
        assert_eq!(resolved.current_state, AgreementState::Completed);
        assert_eq!(resolved.dispute_winner, Some(Party::Payee));
    }

    #[tokio::test]
    async fn scenario_expired_without_confirmations() {
        let (service, _clock) = service();
        let created = service
            .create(input(3, start() - TimeDelta::hours(1)))
            .await
            .unwrap();

        let err = service.raise_dispute(created.id, PAYEE, None).await.unwrap_err();
        assert!(matches!(err, AgreementError::NotEligible { .. }));

        let canceled = service.cancel_expired(created.id, PAYER, None).await.unwrap();
        assert_eq!(canceled.current_state, AgreementState::Canceled);
    }

    #[tokio::test]
    async fn past_deadline_stays_funded_until_someone_acts() {
        let (service, clock) = service();
        let created = service
            .create(input(4, start() + TimeDelta::minutes(5)))
            .await
            .unwrap();
        clock.advance(TimeDelta::days(30));

        let current = service.get(created.id).await.unwrap();
        assert_eq!(current.current_state, AgreementState::Funded);
    }

    #[tokio::test]
    async fn extend_deadline_then_frozen_by_payee_confirmation() {
        let (service, _clock) = service();
        let created = service
            .create(input(5, start() + TimeDelta::hours(1)))
            .await
            .unwrap();
        let new_deadline = start() + TimeDelta::days(2);

        let extended = service
            .extend_deadline(created.id, PAYER, new_deadline, None)
            .await
            .unwrap();
        assert_eq!(extended.deadline, new_deadline);

        service
            .request_confirmation(created.id, PAYEE, Party::Payee, None)
            .await
            .unwrap();
        let err = service
            .extend_deadline(created.id, PAYER, new_deadline + TimeDelta::days(1), None)
            .await
            .unwrap_err();
        assert_eq!(err.guard(), Some(Guard::PayeeConfirmed));
    }

    #[tokio::test]
    async fn duplicate_on_chain_id_and_unknown_ids() {
        let (service, _clock) = service();
        service.create(input(6, start())).await.unwrap();
        let err = service.create(input(6, start())).await.unwrap_err();
        assert!(matches!(err, AgreementError::Duplicate(6)));

        let missing = Uuid::new_v4();
        assert!(matches!(
            service.get(missing).await,
            Err(AgreementError::NotFound(id)) if id == missing
        ));
        assert!(matches!(
            service.raise_dispute(missing, PAYER, None).await,
            Err(AgreementError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn malformed_caller_is_a_validation_error() {
        let (service, _clock) = service();
        let created = service.create(input(7, start())).await.unwrap();
        let err = service
            .request_confirmation(created.id, "0x123", Party::Payer, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AgreementError::Validation(_)));
    }

    #[tokio::test]
    async fn role_listing_counts_disputes_and_resolutions() {
        let (service, clock) = service();
        let deadline = start() + TimeDelta::hours(1);
        let open = service.create(input(10, deadline)).await.unwrap();
        let disputed = service.create(input(11, deadline)).await.unwrap();
        let resolved = service.create(input(12, deadline)).await.unwrap();

        for id in [disputed.id, resolved.id] {
            service
                .request_confirmation(id, PAYEE, Party::Payee, None)
                .await
                .unwrap();
        }
        clock.advance(TimeDelta::hours(2));
        for id in [disputed.id, resolved.id] {
            service.raise_dispute(id, PAYEE, None).await.unwrap();
        }
        service
            .resolve_dispute(resolved.id, ARBITER, "payer", None)
            .await
            .unwrap();

        let listing = service.list_by_role(Role::Arbiter, ARBITER).await.unwrap();
        assert_eq!(listing.agreements.len(), 3);
        assert_eq!(listing.dispute_count, 1);
        assert_eq!(listing.resolve_count, 1);
        assert!(listing.agreements.iter().any(|a| a.id == open.id));

        let empty = service.list_by_role(Role::Payee, ARBITER).await.unwrap();
        assert!(empty.agreements.is_empty());

        let err = service.list_by_role(Role::Payer, "0x0").await.unwrap_err();
        assert!(matches!(err, AgreementError::Validation(_)));
    }

    #[tokio::test]
    async fn concurrent_disputes_apply_once() {
        let (service, clock) = service();
        let created = service
            .create(input(20, start() + TimeDelta::hours(1)))
            .await
            .unwrap();
        service
            .request_confirmation(created.id, PAYER, Party::Payer, None)
            .await
            .unwrap();
        clock.advance(TimeDelta::hours(2));

        let (first, second) = tokio::join!(
            service.raise_dispute(created.id, PAYER, None),
            service.raise_dispute(created.id, PAYEE, None),
        );
        let successes = [&first, &second].iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1);
        let failure = if first.is_err() { first } else { second };
        assert!(matches!(
            failure,
            Err(AgreementError::InvalidState {
                state: AgreementState::InDispute,
                ..
            })
        ));

        let stored = service.get(created.id).await.unwrap();
        assert_eq!(stored.version, 2);
    }

    /// Store whose updates always lose the race.
    struct ContendedStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl AgreementStore for ContendedStore {
        fn backend(&self) -> &'static str {
            "contended"
        }

        async fn insert(&self, agreement: &Agreement) -> Result<(), StoreError> {
            self.inner.insert(agreement).await
        }

        async fn get(&self, id: Uuid) -> Result<Option<Agreement>, StoreError> {
            self.inner.get(id).await
        }

        async fn list_by_role(
            &self,
            role: Role,
            address: &Address,
        ) -> Result<Vec<Agreement>, StoreError> {
            self.inner.list_by_role(role, address).await
        }

        async fn update(
            &self,
            agreement: &Agreement,
            _claim: Option<&ReceiptClaim>,
        ) -> Result<Agreement, StoreError> {
            Err(StoreError::Conflict(agreement.id))
        }

        async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
            self.inner.delete(id).await
        }
    }

    #[tokio::test]
    async fn persistent_conflict_returns_retryable_error() {
        let clock = Arc::new(ManualClock::new(start()));
        let store = Arc::new(ContendedStore {
            inner: MemoryStore::new(),
        });
        let service = AgreementService::new(store, clock).with_retry(RetryConfig {
            max_retries: 2,
            base_delay_ms: 1,
        });
        let created = service.create(input(30, start())).await.unwrap();

        let err = service
            .request_confirmation(created.id, PAYER, Party::Payer, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AgreementError::Conflict(_)));
        assert!(err.is_retryable());
    }

    /// Answers every lookup with a receipt whose event names `on_chain_id`.
    struct StubOracle {
        result: Result<Option<bool>, u16>,
        on_chain_id: u64,
    }

    #[async_trait]
    impl ChainOracle for StubOracle {
        async fn receipt(&self, tx_hash: &TxHash) -> Result<Option<Receipt>, OracleError> {
            match self.result {
                Ok(Some(succeeded)) => Ok(Some(Receipt {
                    transaction_hash: tx_hash.to_string(),
                    block_number: Some(1),
                    succeeded,
                    to: Some(CONTRACT.into()),
                    logs: vec![ReceiptLog {
                        address: CONTRACT.into(),
                        topics: vec![
                            format!("0x{}", "e1".repeat(32)),
                            agreement_topic(self.on_chain_id),
                        ],
                    }],
                })),
                Ok(None) => Ok(None),
                Err(status) => Err(OracleError::Status {
                    status,
                    message: "unavailable".into(),
                }),
            }
        }
    }

    const CONTRACT: &str = "0x5fbdb2315678afecb367f032d93f642f64180aa3";

    fn tx() -> String {
        format!("0x{}", "ab".repeat(32))
    }

    async fn service_with_oracle(
        result: Result<Option<bool>, u16>,
        require: bool,
    ) -> (AgreementService, Uuid) {
        let (service, _clock) = service();
        let oracle = StubOracle {
            result,
            on_chain_id: 40,
        };
        let service = service.with_oracle(Arc::new(oracle), require);
        let created = service
            .create(input(40, start() + TimeDelta::hours(1)))
            .await
            .unwrap();
        (service, created.id)
    }

    #[tokio::test]
    async fn successful_receipt_lets_the_action_through() {
        let (service, id) = service_with_oracle(Ok(Some(true)), true).await;
        let updated = service
            .request_confirmation(id, PAYER, Party::Payer, Some(&tx()))
            .await
            .unwrap();
        assert!(updated.payer_confirmed);
    }

    #[tokio::test]
    async fn reverted_or_unknown_receipt_is_not_eligible() {
        for result in [Ok(Some(false)), Ok(None)] {
            let (service, id) = service_with_oracle(result, false).await;
            let err = service
                .request_confirmation(id, PAYER, Party::Payer, Some(&tx()))
                .await
                .unwrap_err();
            assert_eq!(err.guard(), Some(Guard::ReceiptNotSuccessful));
            assert!(!service.get(id).await.unwrap().payer_confirmed);
        }
    }

    #[tokio::test]
    async fn required_receipt_must_be_supplied() {
        let (service, id) = service_with_oracle(Ok(Some(true)), true).await;
        let err = service
            .request_confirmation(id, PAYER, Party::Payer, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AgreementError::Validation(_)));

        let err = service
            .request_confirmation(id, PAYER, Party::Payer, Some("0xdeadbeef"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgreementError::Validation(_)));
    }

    #[tokio::test]
    async fn one_transaction_authorizes_one_transition() {
        let (service, first) = service_with_oracle(Ok(Some(true)), true).await;
        let second = service
            .create(input(41, start() + TimeDelta::hours(1)))
            .await
            .unwrap()
            .id;

        service
            .request_confirmation(first, PAYER, Party::Payer, Some(&tx()))
            .await
            .unwrap();

        // The receipt's event names agreement 40, not 41.
        let err = service
            .request_confirmation(second, PAYER, Party::Payer, Some(&tx()))
            .await
            .unwrap_err();
        assert_eq!(err.guard(), Some(Guard::ReceiptMismatch));
        assert!(!service.get(second).await.unwrap().payer_confirmed);

        // Same agreement, another action: the hash is already spent.
        let err = service
            .request_confirmation(first, PAYEE, Party::Payee, Some(&tx()))
            .await
            .unwrap_err();
        assert_eq!(err.guard(), Some(Guard::ReceiptAlreadyUsed));
        assert!(!service.get(first).await.unwrap().payee_confirmed);

        let fresh = format!("0x{}", "cd".repeat(32));
        let updated = service
            .request_confirmation(first, PAYEE, Party::Payee, Some(&fresh))
            .await
            .unwrap();
        assert!(updated.payee_confirmed);
    }

    #[tokio::test]
    async fn receipt_policy_pins_the_escrow_contract() {
        let (service, id) = service_with_oracle(Ok(Some(true)), true).await;
        let service = service.with_receipt_policy(ReceiptPolicy {
            contract: Some(Address::parse("0x9999999999999999999999999999999999999999").unwrap()),
            ..ReceiptPolicy::default()
        });
        let err = service
            .request_confirmation(id, PAYER, Party::Payer, Some(&tx()))
            .await
            .unwrap_err();
        assert_eq!(err.guard(), Some(Guard::ReceiptMismatch));
    }

    #[tokio::test]
    async fn oracle_outage_is_retryable() {
        let (service, id) = service_with_oracle(Err(503), false).await;
        let err = service
            .request_confirmation(id, PAYER, Party::Payer, Some(&tx()))
            .await
            .unwrap_err();
        assert!(matches!(err, AgreementError::Oracle(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn delete_requires_matching_admin_token() {
        let (service, _clock) = service();
        let created = service.create(input(50, start())).await.unwrap();

        assert!(matches!(
            service.delete(created.id, Some("anything")).await,
            Err(AgreementError::Forbidden(_))
        ));

        let service = service.with_admin_token(Some("s3cret".into()));
        assert!(matches!(
            service.delete(created.id, Some("wrong")).await,
            Err(AgreementError::Forbidden(_))
        ));
        assert!(matches!(
            service.delete(created.id, None).await,
            Err(AgreementError::Forbidden(_))
        ));
        service.delete(created.id, Some("s3cret")).await.unwrap();
        assert!(matches!(
            service.delete(created.id, Some("s3cret")).await,
            Err(AgreementError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn bootstrap_requires_rpc_url_for_mandatory_receipts() {
        let config = EscrowConfig {
            require_receipts: true,
            ..EscrowConfig::default()
        };
        assert!(AgreementService::bootstrap(&config).await.is_err());

        let service = AgreementService::bootstrap(&EscrowConfig::default())
            .await
            .unwrap();
        assert_eq!(service.backend(), "memory");
    }
}
