//! HTTP API module exposing the read models over REST.

pub mod docs;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod server;
