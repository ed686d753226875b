//! Access envelope service library.
//!
//! A lightweight admission gateway that fronts a measurement service on a
//! shared host. Clients present a short-lived signed access token; on
//! success the gateway temporarily opens the host firewall for the client
//! address and holds the opening for the lifetime of a client WebSocket.
//!
//! ```text
//!  Client ──▶ token gate ──▶ rate gate ──▶ session coordinator
//!                 │              │               │
//!                 ▼              ▼               ▼
//!              token::       controller::     firewall::
//!              Verifier      TxController     IpManager
//! ```

// Core subsystems
pub mod config;
pub mod controller;
pub mod firewall;
pub mod http;
pub mod session;
pub mod token;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use config::EnvelopeConfig;
pub use http::EnvelopeServer;
pub use lifecycle::Shutdown;
