//! HTTP serving subsystem.

pub mod server;

pub use server::{EnvelopeServer, ServerError, ACCESS_PATH};
