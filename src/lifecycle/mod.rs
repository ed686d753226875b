//! Lifecycle management: coordinated shutdown across the accept loop,
//! the rate-sampler loop, and every open session.

pub mod shutdown;

pub use shutdown::Shutdown;
