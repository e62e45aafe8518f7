//! Rule signature verification
//!
//! Signatures are detached Ed25519 signatures over the raw upstream rule
//! content, hex encoded, as is the verifying key.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use pgc_core::VerificationStatus;

/// Reasons the gate refuses a rule
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntegrityError {
    #[error("rule is unsigned but signatures are required")]
    Unsigned,

    #[error("rule is signed but no verifying key is configured")]
    NoVerifyingKey,

    #[error("signature does not verify")]
    InvalidSignature,
}

/// Verify a hex signature over `content` with a hex Ed25519 public key.
///
/// Returns `true` when no signature is attached. Malformed hex, wrong
/// lengths or an invalid key verify as `false`.
pub fn verify_signature(content: &str, signature: Option<&str>, public_key: Option<&str>) -> bool {
    let Some(signature) = signature else {
        return true;
    };
    let Some(public_key) = public_key else {
        return false;
    };

    let Some(signature) = decode::<64>(signature).map(|bytes| Signature::from_bytes(&bytes)) else {
        return false;
    };
    let Some(key) = decode::<32>(public_key).and_then(|bytes| VerifyingKey::from_bytes(&bytes).ok())
    else {
        return false;
    };

    key.verify(content.as_bytes(), &signature).is_ok()
}

fn decode<const N: usize>(text: &str) -> Option<[u8; N]> {
    hex::decode(text.trim()).ok()?.try_into().ok()
}

/// Ingestion policy for rule signatures
#[derive(Debug, Clone, Default)]
pub struct IntegrityGate {
    public_key: Option<String>,
    require_signatures: bool,
}

impl IntegrityGate {
    /// Create a gate with an optional hex verifying key
    pub fn new(public_key: Option<String>, require_signatures: bool) -> Self {
        Self {
            public_key,
            require_signatures,
        }
    }

    /// Whether unsigned rules are refused
    pub fn requires_signatures(&self) -> bool {
        self.require_signatures
    }

    /// Check one rule's signature against the configured key
    pub fn check(
        &self,
        content: &str,
        signature: Option<&str>,
    ) -> Result<VerificationStatus, IntegrityError> {
        match signature {
            None if self.require_signatures => Err(IntegrityError::Unsigned),
            None => Ok(VerificationStatus::Pending),
            Some(signature) => {
                let key = self
                    .public_key
                    .as_deref()
                    .ok_or(IntegrityError::NoVerifyingKey)?;
                if verify_signature(content, Some(signature), Some(key)) {
                    Ok(VerificationStatus::Verified)
                } else {
                    Err(IntegrityError::InvalidSignature)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    const RULE: &str = "permit(U, A, R) :- hasRole(U, \"admin\").";

    fn keypair() -> (SigningKey, String) {
        let signing_key = SigningKey::from_bytes(&[7u8; 32]);
        let public = hex::encode(signing_key.verifying_key().as_bytes());
        (signing_key, public)
    }

    fn sign(key: &SigningKey, content: &str) -> String {
        hex::encode(key.sign(content.as_bytes()).to_bytes())
    }

    #[test]
    fn test_valid_signature() {
        let (key, public) = keypair();
        let signature = sign(&key, RULE);
        assert!(verify_signature(RULE, Some(&signature), Some(&public)));
    }

    #[test]
    fn test_tampered_content() {
        let (key, public) = keypair();
        let signature = sign(&key, RULE);
        assert!(!verify_signature("permit(U, A, R).", Some(&signature), Some(&public)));
    }

    #[test]
    fn test_unsigned_content_passes() {
        assert!(verify_signature(RULE, None, None));
    }

    #[test]
    fn test_malformed_input_never_panics() {
        let (key, public) = keypair();
        let signature = sign(&key, RULE);

        assert!(!verify_signature(RULE, Some("not hex"), Some(&public)));
        assert!(!verify_signature(RULE, Some("abcd"), Some(&public)));
        assert!(!verify_signature(RULE, Some(&signature), Some("zz")));
        assert!(!verify_signature(RULE, Some(&signature), Some(&"00".repeat(31))));
        assert!(!verify_signature(RULE, Some(&signature), None));
        assert!(!verify_signature(RULE, Some(""), Some("")));
    }

    #[test]
    fn test_gate_policies() {
        let (key, public) = keypair();
        let signature = sign(&key, RULE);

        let lenient = IntegrityGate::new(Some(public.clone()), false);
        assert_eq!(lenient.check(RULE, None), Ok(VerificationStatus::Pending));
        assert_eq!(
            lenient.check(RULE, Some(&signature)),
            Ok(VerificationStatus::Verified)
        );
        assert_eq!(
            lenient.check("tampered", Some(&signature)),
            Err(IntegrityError::InvalidSignature)
        );

        let strict = IntegrityGate::new(Some(public), true);
        assert_eq!(strict.check(RULE, None), Err(IntegrityError::Unsigned));

        let keyless = IntegrityGate::default();
        assert_eq!(
            keyless.check(RULE, Some(&signature)),
            Err(IntegrityError::NoVerifyingKey)
        );
    }
}
