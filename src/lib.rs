//! Leader/follower replication for MEXC futures accounts.
//!
//! The engine polls one leader account, diffs its open positions and resting
//! orders between ticks, mirrors every change onto a set of follower
//! accounts, and reconciles what each follower actually got filled at.

pub mod accounts;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod models;
pub mod notify;
pub mod reconcile;
pub mod registry;
pub mod report;
pub mod retry;
pub mod sizing;
pub mod tracker;

pub use client::AccountClient;
pub use engine::{Engine, EngineSettings, Leader};
pub use error::{EngineError, RemoteError};
pub use fanout::Follower;
