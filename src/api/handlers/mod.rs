//! Request handlers for the REST API.

pub mod admin;
pub mod bridge;
pub mod health;
pub mod payments;
pub mod pools;
pub mod rewards;
pub mod status;
pub mod wallets;
