//! # Realm Ledger
//!
//! On-chain indexing, reconciliation and payment-verification backend for a
//! multi-chain game economy.
//!
//! The system continuously ingests blockchain state (token transfers, LP
//! staking, quest rewards, bridge flows, combat events) from several
//! heterogeneous chains, persists it with exactly-once semantics per event,
//! and exposes derived analytics: TVL by pool, per-hero reward history,
//! bridge flow, pricing reconciliation and payment matching.
//!
//! ## Architecture
//!
//! - `chain`: Uniform multi-endpoint RPC access per chain
//! - `events`: Typed event decoding and the decoder registry
//! - `indexer`: The checkpointed scan loop, pool worker sets, native scanner
//! - `db`: SQLite persistence and the repository
//! - `payments`: The payment-matching state machine
//! - `pricing`: Priority-ordered USD price resolution with provenance
//! - `valuation`: TVL derivation from stakes, reserves and prices
//! - `scheduler`: Periodic jobs and indexer lifecycle
//! - `api`: The REST read-model surface
//!
//! The system is strictly read-only against every chain.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod api;
pub mod app_state;
pub mod chain;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod indexer;
pub mod observability;
pub mod payments;
pub mod pricing;
pub mod scheduler;
pub mod valuation;
