//! Compact JWT verification against a kid-keyed set of public keys.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, EncodingKey, Header, Validation};
use serde::de::{SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::token::keys::{load_jwk, VerifyingKey};

/// Errors surfaced by key loading, verification, and claim validation.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("jwt error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("key id not found for given token header: {0}")]
    KeyIdNotFound(String),
    #[error("duplicate key id found: {0}")]
    DuplicateKeyId(String),
    #[error("invalid JSON web key: {0}")]
    InvalidKey(String),
    #[error("token already expired")]
    Expired,
    #[error("claim mismatch: {0}")]
    ClaimMismatch(&'static str),
}

/// The `aud` claim: a single string or an array of strings on the wire,
/// normalized to a list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Audience(Vec<String>);

impl Audience {
    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|aud| aud == name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<String>> for Audience {
    fn from(names: Vec<String>) -> Self {
        Audience(names)
    }
}

impl From<&str> for Audience {
    fn from(name: &str) -> Self {
        Audience(vec![name.to_string()])
    }
}

impl Serialize for Audience {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for name in &self.0 {
            seq.serialize_element(name)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Audience {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct AudienceVisitor;

        impl<'de> Visitor<'de> for AudienceVisitor {
            type Value = Audience;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a string or an array of strings")
            }

            fn visit_str<E: serde::de::Error>(self, value: &str) -> Result<Audience, E> {
                Ok(Audience(vec![value.to_string()]))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Audience, A::Error> {
                let mut names = Vec::new();
                while let Some(name) = seq.next_element::<String>()? {
                    names.push(name);
                }
                Ok(Audience(names))
            }
        }

        deserializer.deserialize_any(AudienceVisitor)
    }
}

/// The decoded payload of a verified token. Fields this service does not
/// interpret are preserved in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub iss: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sub: String,
    #[serde(default, skip_serializing_if = "Audience::is_empty")]
    pub aud: Audience,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Claims {
    /// The expiry instant, when the claim carries one.
    pub fn expiry(&self) -> Option<SystemTime> {
        let exp = self.exp?;
        Some(UNIX_EPOCH + Duration::from_secs(exp.max(0) as u64))
    }

    /// Validate the claim against the expected pattern with zero leeway.
    pub fn validate(&self, expected: &Expected) -> Result<(), TokenError> {
        if !expected.issuer.is_empty() && self.iss != expected.issuer {
            return Err(TokenError::ClaimMismatch("wrong issuer"));
        }
        if !expected.audience.is_empty()
            && !expected.audience.iter().any(|aud| self.aud.contains(aud))
        {
            return Err(TokenError::ClaimMismatch("audience not found"));
        }
        if let Some(expiry) = self.expiry() {
            // Strict comparison: the evaluation instant must precede expiry.
            if expected.time >= expiry {
                return Err(TokenError::Expired);
            }
        }
        Ok(())
    }
}

/// Expected claim pattern, fixed per controller instance apart from the
/// per-request evaluation instant.
#[derive(Debug, Clone)]
pub struct Expected {
    pub issuer: String,
    pub audience: Vec<String>,
    pub time: SystemTime,
}

/// Verifies compact signed tokens against a set of public keys, selecting
/// the key by the `kid` named in the token header. Multiple keys with
/// distinct kids support signer key rotation.
#[derive(Debug)]
pub struct Verifier {
    keys: HashMap<String, VerifyingKey>,
}

impl Verifier {
    /// Load serialized public JWK descriptors into a key set. Each must
    /// carry a distinct kid.
    pub fn new(raw_keys: &[Vec<u8>]) -> Result<Self, TokenError> {
        let mut keys = HashMap::new();
        for raw in raw_keys {
            let key = load_jwk(raw, true)?.verifying_key()?;
            if keys.contains_key(&key.kid) {
                return Err(TokenError::DuplicateKeyId(key.kid));
            }
            keys.insert(key.kid.clone(), key);
        }
        Ok(Verifier { keys })
    }

    /// Extract the claims from a signed token without validating them
    /// against any expected pattern. The signature is still checked.
    pub fn claims(&self, token: &str) -> Result<Claims, TokenError> {
        let header = jsonwebtoken::decode_header(token)?;
        if !matches!(
            header.alg,
            Algorithm::EdDSA | Algorithm::ES256 | Algorithm::RS256
        ) {
            return Err(TokenError::UnsupportedAlgorithm(format!("{:?}", header.alg)));
        }
        let kid = header.kid.unwrap_or_default();
        let key = self
            .keys
            .get(&kid)
            .ok_or_else(|| TokenError::KeyIdNotFound(kid.clone()))?;

        // The claim checks run separately in validate() so that the
        // expected pattern can carry its own evaluation instant.
        let mut validation = Validation::new(key.alg);
        validation.leeway = 0;
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims = Default::default();
        let data = jsonwebtoken::decode::<Claims>(token, &key.key, &validation)?;
        Ok(data.claims)
    }

    /// Check the token signature and that the claims match the expected
    /// pattern.
    pub fn verify(&self, token: &str, expected: &Expected) -> Result<Claims, TokenError> {
        let claims = self.claims(token)?;
        claims.validate(expected)?;
        Ok(claims)
    }
}

/// Signs claims into compact tokens under a private Ed25519 descriptor.
/// The production service only verifies; signing exists for tests and the
/// example tooling.
pub struct Signer {
    kid: String,
    alg: Algorithm,
    key: EncodingKey,
}

impl Signer {
    pub fn new(raw: &[u8]) -> Result<Self, TokenError> {
        let descriptor = load_jwk(raw, false)?;
        Ok(Signer {
            kid: descriptor.kid.clone(),
            alg: descriptor.algorithm()?,
            key: descriptor.signing_key()?,
        })
    }

    /// Generate a signed JWT in compact form.
    pub fn sign(&self, claims: &Claims) -> Result<String, TokenError> {
        let mut header = Header::new(self.alg);
        header.kid = Some(self.kid.clone());
        Ok(jsonwebtoken::encode(&header, claims, &self.key)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::testdata;

    fn claims(subject: &str, machine: &str, expires_in: i64) -> Claims {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock before epoch")
            .as_secs() as i64;
        Claims {
            iss: "locate.measurementlab.net".to_string(),
            sub: subject.to_string(),
            aud: Audience::from(machine),
            exp: Some(now + expires_in),
            extra: Default::default(),
        }
    }

    fn expected(machine: &str) -> Expected {
        Expected {
            issuer: "locate.measurementlab.net".to_string(),
            audience: vec![machine.to_string()],
            time: SystemTime::now(),
        }
    }

    #[test]
    fn verify_roundtrip() {
        let signer = testdata::signer("k1");
        let verifier = testdata::verifier("k1");
        let token = signer.sign(&claims("envelope", "mlab1.fake0", 60)).expect("sign");

        let verified = verifier.verify(&token, &expected("mlab1.fake0")).expect("verify");
        assert_eq!(verified.sub, "envelope");
        assert_eq!(verified.iss, "locate.measurementlab.net");
        assert!(verified.aud.contains("mlab1.fake0"));
    }

    #[test]
    fn verify_rejects_tampered_token() {
        let signer = testdata::signer("k1");
        let verifier = testdata::verifier("k1");
        let token = signer.sign(&claims("envelope", "mlab1.fake0", 60)).expect("sign");

        // Flip one character in the signature segment.
        let mut tampered = token.clone();
        let last = tampered.pop().expect("non-empty token");
        tampered.push(if last == 'A' { 'B' } else { 'A' });
        assert!(matches!(
            verifier.verify(&tampered, &expected("mlab1.fake0")),
            Err(TokenError::Jwt(_))
        ));

        // Splice the payload of a different token onto the signature.
        let other = signer.sign(&claims("other", "mlab1.fake0", 60)).expect("sign");
        let payload = other.split('.').nth(1).expect("payload segment").to_string();
        let mut parts: Vec<&str> = token.split('.').collect();
        parts[1] = &payload;
        let spliced = parts.join(".");
        assert!(verifier.verify(&spliced, &expected("mlab1.fake0")).is_err());
    }

    #[test]
    fn verify_rejects_malformed_token() {
        let verifier = testdata::verifier("k1");
        assert!(matches!(
            verifier.claims("not-a-token"),
            Err(TokenError::Jwt(_))
        ));
    }

    #[test]
    fn verify_supports_key_rotation() {
        let old = testdata::ed25519_jwk("old", &testdata::KEY1_PUBLIC, None);
        let new = testdata::ed25519_jwk("new", &testdata::KEY2_PUBLIC, None);
        let verifier = Verifier::new(&[old, new]).expect("verifier");

        let signer =
            Signer::new(&testdata::ed25519_jwk("old", &testdata::KEY1_PUBLIC, Some(&testdata::KEY1_SEED)))
                .expect("old signer");
        let token = signer.sign(&claims("envelope", "mlab1.fake0", 60)).expect("sign");
        assert!(verifier.verify(&token, &expected("mlab1.fake0")).is_ok());

        let signer =
            Signer::new(&testdata::ed25519_jwk("new", &testdata::KEY2_PUBLIC, Some(&testdata::KEY2_SEED)))
                .expect("new signer");
        let token = signer.sign(&claims("envelope", "mlab1.fake0", 60)).expect("sign");
        assert!(verifier.verify(&token, &expected("mlab1.fake0")).is_ok());
    }

    #[test]
    fn verifier_rejects_duplicate_kid() {
        let jwk = testdata::ed25519_jwk("k1", &testdata::KEY1_PUBLIC, None);
        let err = Verifier::new(&[jwk.clone(), jwk]).expect_err("duplicate kid");
        assert!(matches!(err, TokenError::DuplicateKeyId(kid) if kid == "k1"));
    }

    #[test]
    fn verify_rejects_unknown_kid() {
        let signer = testdata::signer("k1");
        let verifier = testdata::verifier("other-kid");
        let token = signer.sign(&claims("envelope", "mlab1.fake0", 60)).expect("sign");
        assert!(matches!(
            verifier.verify(&token, &expected("mlab1.fake0")),
            Err(TokenError::KeyIdNotFound(kid)) if kid == "k1"
        ));
    }

    #[test]
    fn verify_rejects_expired_token_with_zero_leeway() {
        let signer = testdata::signer("k1");
        let verifier = testdata::verifier("k1");
        let token = signer.sign(&claims("envelope", "mlab1.fake0", -3600)).expect("sign");
        assert!(matches!(
            verifier.verify(&token, &expected("mlab1.fake0")),
            Err(TokenError::Expired)
        ));
    }

    #[test]
    fn verify_rejects_wrong_audience() {
        let signer = testdata::signer("k1");
        let verifier = testdata::verifier("k1");
        let token = signer.sign(&claims("envelope", "mlab1.fake0", 60)).expect("sign");
        assert!(matches!(
            verifier.verify(&token, &expected("mlab2.fake0")),
            Err(TokenError::ClaimMismatch("audience not found"))
        ));
    }

    #[test]
    fn verify_rejects_wrong_issuer() {
        let signer = testdata::signer("k1");
        let verifier = testdata::verifier("k1");
        let token = signer.sign(&claims("envelope", "mlab1.fake0", 60)).expect("sign");
        let exp = Expected {
            issuer: "someone-else".to_string(),
            audience: vec!["mlab1.fake0".to_string()],
            time: SystemTime::now(),
        };
        assert!(matches!(
            verifier.verify(&token, &exp),
            Err(TokenError::ClaimMismatch("wrong issuer"))
        ));
    }

    #[test]
    fn verify_skips_issuer_check_when_unset() {
        let signer = testdata::signer("k1");
        let verifier = testdata::verifier("k1");
        let token = signer.sign(&claims("envelope", "mlab1.fake0", 60)).expect("sign");
        let exp = Expected {
            issuer: String::new(),
            audience: vec!["mlab1.fake0".to_string()],
            time: SystemTime::now(),
        };
        assert!(verifier.verify(&token, &exp).is_ok());
    }

    #[test]
    fn claims_skips_expected_pattern() {
        let signer = testdata::signer("k1");
        let verifier = testdata::verifier("k1");
        let token = signer.sign(&claims("envelope", "mlab1.fake0", -3600)).expect("sign");
        // Expired for verify(), but claims() only checks the signature.
        let claims = verifier.claims(&token).expect("claims");
        assert_eq!(claims.sub, "envelope");
    }

    #[test]
    fn audience_accepts_string_and_array_forms() {
        let single: Claims = serde_json::from_str(r#"{"aud": "mlab1.fake0"}"#).expect("single");
        assert!(single.aud.contains("mlab1.fake0"));
        let many: Claims =
            serde_json::from_str(r#"{"aud": ["a", "b"]}"#).expect("array");
        assert!(many.aud.contains("b"));
    }

    #[test]
    fn claims_preserve_unknown_fields() {
        let parsed: Claims =
            serde_json::from_str(r#"{"sub": "envelope", "jti": "abc123"}"#).expect("parse");
        assert_eq!(parsed.extra.get("jti").and_then(|v| v.as_str()), Some("abc123"));
    }
}
