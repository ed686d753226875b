//! Admission gates applied in front of the envelope handler.
//!
//! The gates must run in a fixed order: the access-token gate first, then
//! the transmit-rate gate, which inspects the claim attached by the token
//! gate to let monitoring traffic through.

pub mod token_gate;
pub mod tx;

use std::collections::HashSet;

use crate::token::Claims;

pub use token_gate::{token_limit, TokenController};
pub use tx::{tx_limit, TxController, TxError};

/// Subject reserved for monitoring credentials; exempt from rate gating.
pub const MONITOR_SUBJECT: &str = "monitoring";

/// Reports whether the (possibly absent) claim is from a monitoring
/// credential.
pub fn is_monitoring(claim: Option<&Claims>) -> bool {
    claim.map(|cl| cl.sub == MONITOR_SUBJECT).unwrap_or(false)
}

/// The set of HTTP resource paths on which the admission gates enforce
/// authorization. Requests to any path outside the set are allowed.
#[derive(Debug, Clone, Default)]
pub struct Paths(HashSet<String>);

impl Paths {
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Paths(paths.into_iter().map(Into::into).collect())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.0.contains(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitoring_requires_reserved_subject() {
        assert!(!is_monitoring(None));

        let mut claim = Claims::default();
        claim.sub = "envelope".to_string();
        assert!(!is_monitoring(Some(&claim)));

        claim.sub = MONITOR_SUBJECT.to_string();
        assert!(is_monitoring(Some(&claim)));
    }

    #[test]
    fn paths_membership() {
        let paths = Paths::new(["/v0/envelope/access"]);
        assert!(paths.contains("/v0/envelope/access"));
        assert!(!paths.contains("/metrics"));
    }
}
