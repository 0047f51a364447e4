use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::model::{
    Address, Agreement, AgreementState, Amount, AmountInput, NewAgreement, Party, Role,
};
use crate::error::AgreementError;

/// A lifecycle operation requested against one agreement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// A party signals readiness to complete.
    Confirm(Party),
    RaiseDispute,
    /// The arbiter awards the dispute to the given party.
    ResolveDispute(Party),
    ReleaseFunds,
    CancelExpired,
    ExtendDeadline(DateTime<Utc>),
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Confirm(_) => ActionKind::Confirm,
            Action::RaiseDispute => ActionKind::RaiseDispute,
            Action::ResolveDispute(_) => ActionKind::ResolveDispute,
            Action::ReleaseFunds => ActionKind::ReleaseFunds,
            Action::CancelExpired => ActionKind::CancelExpired,
            Action::ExtendDeadline(_) => ActionKind::ExtendDeadline,
        }
    }
}

/// Payload-free name of an [`Action`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Confirm,
    RaiseDispute,
    ResolveDispute,
    ReleaseFunds,
    CancelExpired,
    ExtendDeadline,
}

impl ActionKind {
    pub const ALL: [ActionKind; 6] = [
        ActionKind::Confirm,
        ActionKind::RaiseDispute,
        ActionKind::ResolveDispute,
        ActionKind::ReleaseFunds,
        ActionKind::CancelExpired,
        ActionKind::ExtendDeadline,
    ];

    /// Wire name, matching the serde representation.
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Confirm => "confirm",
            ActionKind::RaiseDispute => "raise_dispute",
            ActionKind::ResolveDispute => "resolve_dispute",
            ActionKind::ReleaseFunds => "release_funds",
            ActionKind::CancelExpired => "cancel_expired",
            ActionKind::ExtendDeadline => "extend_deadline",
        }
    }
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown action '{s}'"))
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ActionKind::Confirm => "confirm",
            ActionKind::RaiseDispute => "raise a dispute",
            ActionKind::ResolveDispute => "resolve the dispute",
            ActionKind::ReleaseFunds => "release funds",
            ActionKind::CancelExpired => "cancel",
            ActionKind::ExtendDeadline => "extend the deadline",
        };
        f.write_str(label)
    }
}

/// The guard that rejected an otherwise well-formed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Guard {
    DeadlineNotPassed,
    /// Dispute needs disagreement; both parties already confirmed.
    BothConfirmed,
    /// Dispute needs disagreement; nobody confirmed.
    NeitherConfirmed,
    NotBothConfirmed,
    PartyConfirmed,
    PayeeConfirmed,
    CallerNotPayer,
    CallerNotPayee,
    CallerNotArbiter,
    CallerNotParty,
    ReceiptNotSuccessful,
    /// The receipt is for another contract, agreement or action.
    ReceiptMismatch,
    /// The transaction already authorized an earlier transition.
    ReceiptAlreadyUsed,
}

impl fmt::Display for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Guard::DeadlineNotPassed => "the deadline has not passed yet",
            Guard::BothConfirmed => "both parties have confirmed",
            Guard::NeitherConfirmed => "neither party has confirmed",
            Guard::NotBothConfirmed => "both parties must confirm first",
            Guard::PartyConfirmed => "a party has already confirmed",
            Guard::PayeeConfirmed => "the payee has already confirmed",
            Guard::CallerNotPayer => "caller is not the payer of record",
            Guard::CallerNotPayee => "caller is not the payee of record",
            Guard::CallerNotArbiter => "caller is not the arbiter of record",
            Guard::CallerNotParty => "caller is neither payer nor payee of record",
            Guard::ReceiptNotSuccessful => "no successful on-chain receipt for this action",
            Guard::ReceiptMismatch => {
                "the on-chain receipt does not belong to this agreement and action"
            }
            Guard::ReceiptAlreadyUsed => "the transaction already authorized another transition",
        };
        f.write_str(reason)
    }
}

/// Actions one role may currently take on an agreement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleActions {
    pub role: Role,
    pub actions: Vec<ActionKind>,
}

/// The agreement lifecycle engine.
///
/// Every function is pure over `(record, now, caller, input)`. Persistence
/// and concurrency live in the service layer; the guard table lives here and
/// nowhere else.
///
/// ```text
/// Funded ──both confirmed──────────────▶ Completed (no winner)
///   │ ───past deadline, one confirmed──▶ InDispute ──arbiter──▶ Completed (winner)
///   │ ───past deadline, none confirmed─▶ Canceled
///   └─── extend deadline (payer, payee unconfirmed) ─▶ Funded
/// ```
pub struct Lifecycle;

impl Lifecycle {
    /// Validate a creation request and build the initial `Funded` record.
    pub fn create(input: NewAgreement, now: DateTime<Utc>) -> Result<Agreement, AgreementError> {
        let payer = parse_party_address("payer", &input.payer)?;
        let payee = parse_party_address("payee", &input.payee)?;
        let arbiter = parse_party_address("arbiter", &input.arbiter)?;
        if payer == payee || payer == arbiter || payee == arbiter {
            return Err(AgreementError::Validation(
                "payer, payee and arbiter must be three distinct addresses".into(),
            ));
        }

        let amount = parse_amount(&input.amount)?;

        Ok(Agreement {
            id: Uuid::new_v4(),
            on_chain_id: input.on_chain_id,
            title: input.title,
            detail: input.detail,
            payer,
            payee,
            arbiter,
            amount,
            deadline: input.deadline,
            current_state: AgreementState::Funded,
            payer_confirmed: false,
            payee_confirmed: false,
            dispute_winner: None,
            version: 0,
            created_at: now,
            updated_at: now,
        })
    }

    /// Decide whether `caller` may perform `action` at `now`.
    ///
    /// State is checked first (`InvalidState`), then the caller's role, then
    /// timing and confirmation guards (`NotEligible`).
    pub fn check(
        agreement: &Agreement,
        action: &Action,
        caller: &Address,
        now: DateTime<Utc>,
    ) -> Result<(), AgreementError> {
        let kind = action.kind();
        let not_eligible = |guard| AgreementError::NotEligible { action: kind, guard };

        match action {
            Action::Confirm(party) => {
                require_state(agreement, kind, AgreementState::Funded)?;
                let guard = match party {
                    Party::Payer => Guard::CallerNotPayer,
                    Party::Payee => Guard::CallerNotPayee,
                };
                if !has_role(agreement, caller, &[Role::from(*party)]) {
                    return Err(not_eligible(guard));
                }
                if agreement.is_confirmed(*party) {
                    return Err(AgreementError::AlreadyConfirmed(*party));
                }
            }
            Action::RaiseDispute => {
                require_state(agreement, kind, AgreementState::Funded)?;
                if !has_role(agreement, caller, &[Role::Payer, Role::Payee]) {
                    return Err(not_eligible(Guard::CallerNotParty));
                }
                if !agreement.is_past_deadline(now) {
                    return Err(not_eligible(Guard::DeadlineNotPassed));
                }
                match (agreement.payer_confirmed, agreement.payee_confirmed) {
                    (true, true) => return Err(not_eligible(Guard::BothConfirmed)),
                    (false, false) => return Err(not_eligible(Guard::NeitherConfirmed)),
                    _ => {}
                }
            }
            Action::ResolveDispute(_) => {
                require_state(agreement, kind, AgreementState::InDispute)?;
                if !has_role(agreement, caller, &[Role::Arbiter]) {
                    return Err(not_eligible(Guard::CallerNotArbiter));
                }
            }
            Action::ReleaseFunds => {
                require_state(agreement, kind, AgreementState::Funded)?;
                if !has_role(agreement, caller, &[Role::Payer, Role::Payee]) {
                    return Err(not_eligible(Guard::CallerNotParty));
                }
                if agreement.confirmations() != 2 {
                    return Err(not_eligible(Guard::NotBothConfirmed));
                }
            }
            Action::CancelExpired => {
                require_state(agreement, kind, AgreementState::Funded)?;
                if !has_role(agreement, caller, &[Role::Payer]) {
                    return Err(not_eligible(Guard::CallerNotPayer));
                }
                if !agreement.is_past_deadline(now) {
                    return Err(not_eligible(Guard::DeadlineNotPassed));
                }
                if agreement.confirmations() != 0 {
                    return Err(not_eligible(Guard::PartyConfirmed));
                }
            }
            Action::ExtendDeadline(new_deadline) => {
                // Once the payee has confirmed, the deadline is frozen in every state.
                if agreement.payee_confirmed {
                    return Err(not_eligible(Guard::PayeeConfirmed));
                }
                require_state(agreement, kind, AgreementState::Funded)?;
                if !has_role(agreement, caller, &[Role::Payer]) {
                    return Err(not_eligible(Guard::CallerNotPayer));
                }
                if *new_deadline <= now {
                    return Err(AgreementError::Validation(
                        "new deadline must be in the future".into(),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Check `action` and, if admissible, return the record after its effect.
    ///
    /// The returned record keeps the input's `version`; the store bumps it on
    /// a successful compare-and-swap.
    pub fn apply(
        agreement: &Agreement,
        action: &Action,
        caller: &Address,
        now: DateTime<Utc>,
    ) -> Result<Agreement, AgreementError> {
        Self::check(agreement, action, caller, now)?;

        let mut next = agreement.clone();
        match action {
            Action::Confirm(Party::Payer) => next.payer_confirmed = true,
            Action::Confirm(Party::Payee) => next.payee_confirmed = true,
            Action::RaiseDispute => next.current_state = AgreementState::InDispute,
            Action::ResolveDispute(winner) => {
                next.current_state = AgreementState::Completed;
                next.dispute_winner = Some(*winner);
            }
            Action::ReleaseFunds => next.current_state = AgreementState::Completed,
            Action::CancelExpired => next.current_state = AgreementState::Canceled,
            Action::ExtendDeadline(new_deadline) => next.deadline = *new_deadline,
        }
        next.updated_at = now;

        Ok(next)
    }

    /// Lifecycle actions each role could perform right now.
    ///
    /// Derived from [`Lifecycle::check`] so dashboards never re-implement the
    /// eligibility rules.
    pub fn available_actions(agreement: &Agreement, now: DateTime<Utc>) -> Vec<RoleActions> {
        let candidates = [
            Action::Confirm(Party::Payer),
            Action::Confirm(Party::Payee),
            Action::RaiseDispute,
            Action::ResolveDispute(Party::Payer),
            Action::ReleaseFunds,
            Action::CancelExpired,
            Action::ExtendDeadline(now + TimeDelta::days(1)),
        ];

        Role::ALL
            .into_iter()
            .map(|role| {
                let caller = agreement.address_of(role);
                let actions = candidates
                    .iter()
                    .filter(|action| Self::check(agreement, action, caller, now).is_ok())
                    .map(Action::kind)
                    .collect();
                RoleActions { role, actions }
            })
            .collect()
    }
}

fn require_state(
    agreement: &Agreement,
    action: ActionKind,
    expected: AgreementState,
) -> Result<(), AgreementError> {
    if agreement.current_state == expected {
        Ok(())
    } else {
        Err(AgreementError::InvalidState {
            action,
            state: agreement.current_state,
        })
    }
}

fn has_role(agreement: &Agreement, caller: &Address, allowed: &[Role]) -> bool {
    agreement
        .role_of(caller)
        .is_some_and(|role| allowed.contains(&role))
}

fn parse_party_address(field: &str, raw: &str) -> Result<Address, AgreementError> {
    Address::parse(raw)
        .map_err(|err| AgreementError::Validation(format!("{field} address is invalid: {err}")))
}

fn parse_amount(input: &AmountInput) -> Result<Amount, AgreementError> {
    let amount = match input {
        AmountInput::Number(number) => match (number.as_u64(), number.as_i64()) {
            (Some(value), _) => Ok(Amount::new(u128::from(value))),
            (None, Some(_)) => Err("amount must be positive".to_string()),
            // Beyond u64 or fractional: JSON numbers lose precision there.
            (None, None) => Err(format!(
                "amount {number} must be a whole number of wei; send large values as a string"
            )),
        },
        AmountInput::Text(text) => text.parse::<Amount>(),
    }
    .map_err(AgreementError::Validation)?;

    if amount.is_zero() {
        return Err(AgreementError::Validation("amount must be positive".into()));
    }
    Ok(amount)
}
