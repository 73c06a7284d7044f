//! Telemetry collection relay
//!
//! Relays running on remote hosts register named collectors with a central
//! server over a persistent TCP connection. The server polls them on demand
//! or on an interval and fans the collected values out to pluggable sinks.
//!
//! ```text
//! scheduler ──► registry ──► get ──► relay (collectors)
//!                                       │
//!   sinks ◄── plexer ◄── MessageSet ◄── got
//! ```

pub mod collector;
pub mod config;
pub mod plexer;
pub mod protocol;
pub mod relay;
pub mod scheduler;
pub mod server;
pub mod sinks;
pub mod transport;
pub mod util;

pub use collector::Collector;
pub use plexer::{Message, MessageSet, Observer, Plexer, Publisher};
pub use relay::{Relay, RelayError};
pub use server::Server;
