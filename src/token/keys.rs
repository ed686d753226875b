//! Serialized key descriptors.
//!
//! A descriptor is a JSON Web Key restricted to the signature algorithms
//! this service accepts: EdDSA over Ed25519, ES256 over P-256, and RS256.
//! A descriptor carrying a `d` member holds private material; everything
//! else is public-only.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey};
use serde::Deserialize;

use crate::token::verifier::TokenError;

/// PKCS#8 v1 framing for a raw Ed25519 seed (RFC 5958 + RFC 8410).
const ED25519_PKCS8_PREFIX: &[u8] = &[
    0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x04, 0x22, 0x04,
    0x20,
];

/// A parsed JWK descriptor. Immutable after load.
#[derive(Debug, Clone, Deserialize)]
pub struct KeyDescriptor {
    pub kty: String,
    #[serde(default)]
    pub kid: String,
    #[serde(default)]
    pub alg: Option<String>,
    #[serde(default)]
    pub crv: Option<String>,
    #[serde(default)]
    pub x: Option<String>,
    #[serde(default)]
    pub y: Option<String>,
    #[serde(default)]
    pub n: Option<String>,
    #[serde(default)]
    pub e: Option<String>,
    #[serde(default)]
    pub d: Option<String>,
}

/// A key ready for signature verification, keyed by `kid` in the key set.
pub struct VerifyingKey {
    pub kid: String,
    pub alg: Algorithm,
    pub key: DecodingKey,
}

impl std::fmt::Debug for VerifyingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerifyingKey")
            .field("kid", &self.kid)
            .field("alg", &self.alg)
            .finish_non_exhaustive()
    }
}

/// Parse and validate a serialized JWK. `public` declares the kind the
/// caller expects; a mismatch fails the load.
pub fn load_jwk(raw: &[u8], public: bool) -> Result<KeyDescriptor, TokenError> {
    let descriptor: KeyDescriptor =
        serde_json::from_slice(raw).map_err(|err| TokenError::InvalidKey(err.to_string()))?;
    descriptor.algorithm()?;
    if descriptor.is_public() != public {
        return Err(TokenError::InvalidKey(
            "public/private key kind mismatch".to_string(),
        ));
    }
    Ok(descriptor)
}

impl KeyDescriptor {
    /// Whether the descriptor holds public-only material.
    pub fn is_public(&self) -> bool {
        self.d.is_none()
    }

    /// The declared signature algorithm, restricted to the accepted set.
    pub fn algorithm(&self) -> Result<Algorithm, TokenError> {
        match self.alg.as_deref() {
            Some("EdDSA") => Ok(Algorithm::EdDSA),
            Some("ES256") => Ok(Algorithm::ES256),
            Some("RS256") => Ok(Algorithm::RS256),
            Some(other) => Err(TokenError::UnsupportedAlgorithm(other.to_string())),
            None => Err(TokenError::InvalidKey(
                "missing signature algorithm".to_string(),
            )),
        }
    }

    /// Build the verification key from the public components.
    pub fn verifying_key(&self) -> Result<VerifyingKey, TokenError> {
        let alg = self.algorithm()?;
        let key = match (self.kty.as_str(), alg) {
            ("OKP", Algorithm::EdDSA) => {
                if self.crv.as_deref() != Some("Ed25519") {
                    return Err(invalid("unsupported OKP curve"));
                }
                let x = self.x.as_deref().ok_or_else(|| invalid("missing x coordinate"))?;
                DecodingKey::from_ed_components(x)
                    .map_err(|err| TokenError::InvalidKey(err.to_string()))?
            }
            ("EC", Algorithm::ES256) => {
                if self.crv.as_deref() != Some("P-256") {
                    return Err(invalid("unsupported EC curve"));
                }
                let x = self.x.as_deref().ok_or_else(|| invalid("missing x coordinate"))?;
                let y = self.y.as_deref().ok_or_else(|| invalid("missing y coordinate"))?;
                DecodingKey::from_ec_components(x, y)
                    .map_err(|err| TokenError::InvalidKey(err.to_string()))?
            }
            ("RSA", Algorithm::RS256) => {
                let n = self.n.as_deref().ok_or_else(|| invalid("missing modulus"))?;
                let e = self.e.as_deref().ok_or_else(|| invalid("missing exponent"))?;
                DecodingKey::from_rsa_components(n, e)
                    .map_err(|err| TokenError::InvalidKey(err.to_string()))?
            }
            _ => return Err(invalid("key type does not match declared algorithm")),
        };
        Ok(VerifyingKey {
            kid: self.kid.clone(),
            alg,
            key,
        })
    }

    /// Build the signing key from the private components. Only Ed25519
    /// descriptors carry enough material to reconstruct a signing key.
    pub fn signing_key(&self) -> Result<EncodingKey, TokenError> {
        let alg = self.algorithm()?;
        match (self.kty.as_str(), alg) {
            ("OKP", Algorithm::EdDSA) => {
                if self.crv.as_deref() != Some("Ed25519") {
                    return Err(invalid("unsupported OKP curve"));
                }
                let d = self.d.as_deref().ok_or_else(|| invalid("missing private component"))?;
                let seed = URL_SAFE_NO_PAD
                    .decode(d)
                    .map_err(|err| TokenError::InvalidKey(err.to_string()))?;
                if seed.len() != 32 {
                    return Err(invalid("bad Ed25519 seed length"));
                }
                let mut der = Vec::with_capacity(ED25519_PKCS8_PREFIX.len() + seed.len());
                der.extend_from_slice(ED25519_PKCS8_PREFIX);
                der.extend_from_slice(&seed);
                Ok(EncodingKey::from_ed_der(&der))
            }
            _ => Err(invalid("signing requires an Ed25519 descriptor")),
        }
    }
}

fn invalid(reason: &str) -> TokenError {
    TokenError::InvalidKey(reason.to_string())
}
