//! Password hashing via bcrypt.

use crate::error::{AuthError, Result};

/// One-way password hashing capability.
///
/// Implementations are CPU-bound; callers on the async runtime should run
/// them on the blocking pool.
pub trait CredentialVerifier: Send + Sync {
    /// Hash a plaintext password into a salted digest.
    fn hash(&self, plain: &str) -> Result<String>;

    /// Check `plain` against `digest`. Returns false on mismatch and on a
    /// malformed digest.
    fn verify(&self, digest: &str, plain: &str) -> bool;
}

/// bcrypt-backed [`CredentialVerifier`].
#[derive(Debug, Clone, Copy)]
pub struct BcryptVerifier {
    cost: u32,
}

impl BcryptVerifier {
    pub fn new(cost: u32) -> Self {
        Self { cost }
    }
}

impl Default for BcryptVerifier {
    fn default() -> Self {
        Self::new(bcrypt::DEFAULT_COST)
    }
}

impl CredentialVerifier for BcryptVerifier {
    fn hash(&self, plain: &str) -> Result<String> {
        bcrypt::hash(plain, self.cost).map_err(|e| AuthError::Internal(format!("bcrypt hash: {e}")))
    }

    fn verify(&self, digest: &str, plain: &str) -> bool {
        bcrypt::verify(plain, digest).unwrap_or(false)
    }
}

/// Minimum accepted password length.
pub const MIN_PASSWORD_LENGTH: usize = 8;

/// bcrypt only considers the first 72 bytes.
pub const MAX_PASSWORD_BYTES: usize = 72;

/// Reject passwords that are too short or exceed what bcrypt can hash.
pub fn validate_password(password: &str) -> Result<()> {
    if password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(AuthError::Validation(format!(
            "Password must be at least {MIN_PASSWORD_LENGTH} characters"
        )));
    }
    if password.len() > MAX_PASSWORD_BYTES {
        return Err(AuthError::Validation(format!(
            "Password must be at most {MAX_PASSWORD_BYTES} bytes"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier() -> BcryptVerifier {
        BcryptVerifier::new(4)
    }

    #[test]
    fn hash_then_verify() {
        let v = verifier();
        let digest = v.hash("correct horse").unwrap();
        assert_ne!(digest, "correct horse");
        assert!(v.verify(&digest, "correct horse"));
        assert!(!v.verify(&digest, "battery staple"));
    }

    #[test]
    fn hashes_are_salted() {
        let v = verifier();
        assert_ne!(v.hash("same").unwrap(), v.hash("same").unwrap());
    }

    #[test]
    fn malformed_digest_is_false_not_error() {
        assert!(!verifier().verify("not-a-bcrypt-digest", "whatever"));
        assert!(!verifier().verify("", ""));
    }

    #[test]
    fn password_length_rules() {
        assert!(validate_password("short").is_err());
        assert!(validate_password("long enough").is_ok());
        assert!(validate_password(&"x".repeat(73)).is_err());
    }
}
