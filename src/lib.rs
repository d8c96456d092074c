//! Core of an upstream relay that brokers chat/completion requests from many API-key-scoped
//! clients to a single vendor API across a pool of vendor accounts.
//!
//! This crate is the hard part of that service: a long-lived multiplexed HTTP/2 transport, a
//! request-body preparer, a streaming SSE tap that forwards bytes verbatim while tapping usage
//! telemetry, an account health state machine, and the orchestrator tying them together. The
//! key-value store, OAuth refresh, API-key auth, and the scheduler's ranking policy are treated
//! as external collaborators — see [`collab`] for the traits this crate calls through rather
//! than implements.

pub mod beta;
pub mod collab;
pub mod config;
pub mod dump;
pub mod fingerprint;
pub mod health;
pub mod model;
pub mod prepare;
pub mod proxy_agent;
pub mod relay;
pub mod retry;
pub mod sse_tap;
pub mod telemetry;
pub mod transport;

pub use collab::{AccountService, ClaudeCodeValidator, CollabError, KvStore, PricingTable, Scheduler};
pub use config::RelayConfig;
pub use model::{Account, AccountSelection, RequestBody, SessionHash, UsageRecord};
pub use relay::{IngressSink, RelayCore, RelayError, RelayOpts, RelayResponse};
