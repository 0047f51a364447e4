//! Off-chain index and lifecycle engine for on-chain escrow agreements.
//!
//! The chain holds the funds; this crate mirrors each agreement, enforces the
//! lifecycle guards before a transition is recorded, and serves the records
//! over HTTP.

pub mod agreement;
pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod oracle;
pub mod service;
pub mod store;
