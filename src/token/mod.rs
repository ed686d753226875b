//! Access-token support: parsing serialized JSON Web Keys, verifying
//! compact signed JWTs against a key set, and signing tokens for tests
//! and tooling.

pub mod keys;
pub mod verifier;

pub use keys::{load_jwk, KeyDescriptor, VerifyingKey};
pub use verifier::{Audience, Claims, Expected, Signer, TokenError, Verifier};
