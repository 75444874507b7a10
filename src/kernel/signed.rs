//! Signed-class tokens.
//!
//! A signed class carries an RS256 token whose only claim is the identity
//! marker of the class it was minted for. Verification is a compatibility
//! check: every failure, from an unparsable key to a stale identity, is
//! reported as `false`.

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct IdentityClaims {
    id: u64,
}

/// Mint a token binding `id` with the PEM-encoded RSA private key.
pub fn sign(private_pem: &[u8], id: u64) -> Result<String, jsonwebtoken::errors::Error> {
    let key = EncodingKey::from_rsa_pem(private_pem)?;
    jsonwebtoken::encode(&Header::new(Algorithm::RS256), &IdentityClaims { id }, &key)
}

/// Whether `token` validates against the PEM-encoded public key and
/// carries `id`.
pub fn verify(token: &str, public_pem: &[u8], id: u64) -> bool {
    let key = match DecodingKey::from_rsa_pem(public_pem) {
        Ok(key) => key,
        Err(error) => {
            tracing::debug!(%error, "unusable verification key");
            return false;
        }
    };
    let mut validation = Validation::new(Algorithm::RS256);
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    match jsonwebtoken::decode::<IdentityClaims>(token, &key, &validation) {
        Ok(data) => data.claims.id == id,
        Err(error) => {
            tracing::debug!(%error, "signed class token rejected");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRIVATE: &[u8] = include_bytes!("../../tests/fixtures/signing_key.pem");
    const PUBLIC: &[u8] = include_bytes!("../../tests/fixtures/signing_key.pub.pem");
    const OTHER_PUBLIC: &[u8] = include_bytes!("../../tests/fixtures/other_key.pub.pem");

    #[test]
    fn test_token_binds_identity() {
        let token = sign(PRIVATE, 42).unwrap();
        assert!(verify(&token, PUBLIC, 42));
        assert!(!verify(&token, PUBLIC, 43));
    }

    #[test]
    fn test_wrong_key_or_garbage_is_false() {
        let token = sign(PRIVATE, 7).unwrap();
        assert!(!verify(&token, OTHER_PUBLIC, 7));
        assert!(!verify("not.a.token", PUBLIC, 7));
        assert!(!verify(&token, b"no key here", 7));
        assert!(sign(b"no key here", 7).is_err());
    }
}
