use std::collections::HashMap;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::config::IntakeConfig;
use crate::error::SignatureError;
use crate::types::Provider;

type HmacSha256 = Hmac<Sha256>;

/// Compute the hex-encoded HMAC-SHA256 of `payload`.
pub fn compute_signature(secret: &[u8], payload: &[u8]) -> String {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return String::new();
    };
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a hex signature over the raw payload bytes in constant time.
///
/// A leading `sha256=` (GitHub style) is accepted.
pub fn verify_signature(secret: &[u8], payload: &[u8], signature: &str) -> bool {
    let signature_hex = signature.trim();
    let signature_hex = signature_hex.strip_prefix("sha256=").unwrap_or(signature_hex);

    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(payload);

    mac.verify_slice(&signature).is_ok()
}

/// Find `header_name` in a header list, ignoring case.
pub fn parse_signature_header<'a, I>(headers: I, header_name: &str) -> Option<String>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    headers
        .into_iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(header_name))
        .map(|(_, value)| value.to_string())
}

/// Checks inbound payloads against per-provider secrets.
#[derive(Clone, Default)]
pub struct SignatureVerifier {
    secrets: HashMap<Provider, Vec<u8>>,
}

impl SignatureVerifier {
    pub fn new(secrets: HashMap<Provider, Vec<u8>>) -> Self {
        Self { secrets }
    }

    pub fn from_config(config: &IntakeConfig) -> Self {
        Self::new(config.secrets.clone())
    }

    pub fn verify(
        &self,
        provider: &Provider,
        payload: &[u8],
        signature: Option<&str>,
    ) -> Result<(), SignatureError> {
        let signature = signature
            .filter(|s| !s.trim().is_empty())
            .ok_or(SignatureError::MissingSignature)?;

        let secret = self
            .secrets
            .get(provider)
            .ok_or_else(|| SignatureError::UnknownProvider(provider.clone()))?;

        if verify_signature(secret, payload, signature) {
            Ok(())
        } else {
            Err(SignatureError::InvalidSignature)
        }
    }
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("providers", &self.secrets.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier() -> SignatureVerifier {
        let mut secrets = HashMap::new();
        secrets.insert(Provider::Stripe, b"whsec_test".to_vec());
        secrets.insert(Provider::Github, b"gh_secret".to_vec());
        SignatureVerifier::new(secrets)
    }

    #[test]
    fn known_vector() {
        // RFC 4231 test case 2.
        assert_eq!(
            compute_signature(b"Jefe", b"what do ya want for nothing?"),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn accepts_matching_signature() {
        let payload = br#"{"id":"evt_1","type":"payment.succeeded"}"#;
        let signature = compute_signature(b"whsec_test", payload);
        assert_eq!(verifier().verify(&Provider::Stripe, payload, Some(&signature)), Ok(()));
    }

    #[test]
    fn accepts_github_prefix() {
        let payload = br#"{"id":"evt_1"}"#;
        let signature = format!("sha256={}", compute_signature(b"gh_secret", payload));
        assert!(verifier().verify(&Provider::Github, payload, Some(&signature)).is_ok());
    }

    #[test]
    fn rejects_tampered_payload() {
        let payload = br#"{"id":"evt_1","amount":100}"#.to_vec();
        let signature = compute_signature(b"whsec_test", &payload);

        for index in 0..payload.len() {
            let mut tampered = payload.clone();
            tampered[index] ^= 0x01;
            assert_eq!(
                verifier().verify(&Provider::Stripe, &tampered, Some(&signature)),
                Err(SignatureError::InvalidSignature)
            );
        }
    }

    #[test]
    fn rejects_wrong_length_and_garbage() {
        let payload = b"body";
        let signature = compute_signature(b"whsec_test", payload);
        let truncated = &signature[..signature.len() - 2];

        let v = verifier();
        assert_eq!(v.verify(&Provider::Stripe, payload, Some(truncated)), Err(SignatureError::InvalidSignature));
        assert_eq!(v.verify(&Provider::Stripe, payload, Some("not-hex")), Err(SignatureError::InvalidSignature));
    }

    #[test]
    fn missing_signature_is_reported_before_provider_lookup() {
        let v = verifier();
        assert_eq!(v.verify(&Provider::Paypal, b"x", None), Err(SignatureError::MissingSignature));
        assert_eq!(v.verify(&Provider::Stripe, b"x", Some("  ")), Err(SignatureError::MissingSignature));
        assert_eq!(
            v.verify(&Provider::Paypal, b"x", Some("abcd")),
            Err(SignatureError::UnknownProvider(Provider::Paypal))
        );
    }

    #[test]
    fn header_lookup_ignores_case() {
        let headers = vec![("Content-Type", "application/json"), ("Stripe-Signature", "abc")];
        assert_eq!(
            parse_signature_header(headers.iter().map(|(k, v)| (*k, *v)), "stripe-signature"),
            Some("abc".to_string())
        );
        assert_eq!(parse_signature_header(headers.iter().map(|(k, v)| (*k, *v)), "paypal-signature"), None);
    }
}
