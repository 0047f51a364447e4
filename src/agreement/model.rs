use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Number of hex digits in an account address after the `0x` prefix.
const ADDRESS_HEX_LEN: usize = 40;

/// Reasons an address string is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address is empty")]
    Empty,
    #[error("address must be 0x followed by 40 hex digits")]
    Malformed,
    #[error("the zero address is not allowed")]
    Zero,
}

/// A 20-byte account address, kept in lowercase `0x`-prefixed hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    pub fn parse(raw: &str) -> Result<Self, AddressError> {
        if raw.is_empty() {
            return Err(AddressError::Empty);
        }
        let digits = raw
            .strip_prefix("0x")
            .or_else(|| raw.strip_prefix("0X"))
            .ok_or(AddressError::Malformed)?;
        if digits.len() != ADDRESS_HEX_LEN || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(AddressError::Malformed);
        }
        if digits.chars().all(|c| c == '0') {
            return Err(AddressError::Zero);
        }
        Ok(Self(format!("0x{}", digits.to_ascii_lowercase())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Address::parse(&value)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.0
    }
}

/// Escrowed value in the chain's smallest native unit (wei).
///
/// Serialized as a decimal string so large values survive JSON clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Amount(u128);

impl Amount {
    pub fn new(wei: u128) -> Self {
        Self(wei)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Amount {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u128>()
            .map(Amount)
            .map_err(|_| format!("'{s}' is not a whole number of wei"))
    }
}

impl TryFrom<String> for Amount {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Amount> for String {
    fn from(amount: Amount) -> Self {
        amount.0.to_string()
    }
}

/// Lifecycle state mirrored from the escrow contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgreementState {
    Funded,
    InDispute,
    Completed,
    Canceled,
}

impl AgreementState {
    pub const ALL: [AgreementState; 4] = [
        AgreementState::Funded,
        AgreementState::InDispute,
        AgreementState::Completed,
        AgreementState::Canceled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AgreementState::Funded => "Funded",
            AgreementState::InDispute => "InDispute",
            AgreementState::Completed => "Completed",
            AgreementState::Canceled => "Canceled",
        }
    }
}

impl fmt::Display for AgreementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgreementState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AgreementState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown agreement state '{s}'"))
    }
}

/// One of the three roles bound to an agreement at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Payer,
    Payee,
    Arbiter,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Payer, Role::Payee, Role::Arbiter];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Payer => "payer",
            Role::Payee => "payee",
            Role::Arbiter => "arbiter",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|role| role.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown role '{s}', expected payer, payee or arbiter"))
    }
}

/// The two confirming parties; also the possible dispute winners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Party {
    Payer,
    Payee,
}

impl Party {
    pub fn as_str(self) -> &'static str {
        Role::from(self).as_str()
    }
}

impl From<Party> for Role {
    fn from(party: Party) -> Self {
        match party {
            Party::Payer => Role::Payer,
            Party::Payee => Role::Payee,
        }
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Party {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "payer" => Ok(Party::Payer),
            "payee" => Ok(Party::Payee),
            _ => Err(format!("unknown party '{s}', expected payer or payee")),
        }
    }
}

/// Amount as submitted by a client: a decimal string or a JSON number.
///
/// Numbers are kept as [`serde_json::Number`] so out-of-range, negative and
/// fractional values reach amount validation instead of failing to parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AmountInput {
    Number(serde_json::Number),
    Text(String),
}

/// Creation input, mirroring the funding transaction the payer just sent.
///
/// Addresses and amount arrive unvalidated; [`Lifecycle::create`] checks them.
///
/// [`Lifecycle::create`]: super::Lifecycle::create
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAgreement {
    pub on_chain_id: u64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub detail: Option<String>,
    pub payer: String,
    pub payee: String,
    pub arbiter: String,
    pub amount: AmountInput,
    pub deadline: DateTime<Utc>,
}

/// The off-chain record of one escrow contract instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agreement {
    pub id: Uuid,
    pub on_chain_id: u64,
    pub title: Option<String>,
    pub detail: Option<String>,
    pub payer: Address,
    pub payee: Address,
    pub arbiter: Address,
    pub amount: Amount,
    pub deadline: DateTime<Utc>,
    pub current_state: AgreementState,
    pub payer_confirmed: bool,
    pub payee_confirmed: bool,
    pub dispute_winner: Option<Party>,
    /// Write counter used for compare-and-swap updates.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agreement {
    pub fn address_of(&self, role: Role) -> &Address {
        match role {
            Role::Payer => &self.payer,
            Role::Payee => &self.payee,
            Role::Arbiter => &self.arbiter,
        }
    }

    /// Role held by `address` on this agreement. Roles never share an address.
    pub fn role_of(&self, address: &Address) -> Option<Role> {
        Role::ALL
            .into_iter()
            .find(|role| self.address_of(*role) == address)
    }

    pub fn is_confirmed(&self, party: Party) -> bool {
        match party {
            Party::Payer => self.payer_confirmed,
            Party::Payee => self.payee_confirmed,
        }
    }

    pub fn confirmations(&self) -> usize {
        usize::from(self.payer_confirmed) + usize::from(self.payee_confirmed)
    }

    /// Deadline comparisons are strict: the deadline instant itself is not "past".
    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        now > self.deadline
    }

    /// Completed through arbitration rather than mutual release.
    pub fn was_resolved_by_arbiter(&self) -> bool {
        self.current_state == AgreementState::Completed && self.dispute_winner.is_some()
    }
}
