//! # Space Server - Location Synchronization Node
//!
//! Transport and node plumbing for the Meridian location core. This crate
//! assembles one cluster node: the session stream layer carrying
//! multiplexed substreams between endpoints, the stream reuse/retry
//! manager for reliable application messaging, session tracking with an
//! authentication seam, and the wiring that turns local location churn
//! into update batches for subscribed remotes (and received batches back
//! into replica state).
//!
//! ## Architecture Overview
//!
//! * **Session Stream Layer** ([`stream`]) - endpoint-addressed, reliable,
//!   ordered byte streams with independent substreams per port and an
//!   unreliable-semantics datagram side channel
//! * **Messaging Manager** ([`messaging`]) - canonical-stream reuse with
//!   deterministic tie-break, presence bookkeeping, timer-driven retry
//! * **Sessions & Auth** ([`session`], [`auth`]) - per-participant session
//!   lifecycle gated by a pluggable credential check
//! * **Server wiring** ([`server`]) - the [`SpaceServer`] facade binding
//!   the location core to the transport
//!
//! ## Concurrency
//!
//! Each connection's callbacks run on that connection's single read task;
//! shared state uses async-safe structures (`Arc<RwLock<..>>`), so nothing
//! in this crate requires locking beyond what the types already carry.
//!
//! ## Error Handling
//!
//! Transport failures surface as error codes on the relevant callbacks and
//! as bounded, log-visible retries; malformed remote input is dropped and
//! logged, never allowed to become a panic.

// Re-export core types and functions for easy access
pub use auth::{AllowAllAuthenticator, Authenticator, TicketAuthenticator};
pub use config::{PeerConfig, ServerConfig};
pub use error::ServerError;
pub use server::{SpaceServer, TransportBinding, UpdateForwarder};

// Public module declarations
pub mod auth;
pub mod config;
pub mod error;
pub mod messaging;
pub mod server;
pub mod session;
pub mod stream;

// Cross-component integration tests
#[cfg(test)]
mod tests;
