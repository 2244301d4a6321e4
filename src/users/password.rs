//! Password hashing and strength rules
//!
//! [`Argon2Hasher`] produces Argon2id PHC strings with a random salt, so the
//! algorithm parameters and salt travel inside the stored hash.

use crate::core::error::CrudError;
use argon2::Argon2;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher as _, PasswordVerifier, SaltString};

/// Minimum password length accepted by [`validate_password_strength`]
pub const MIN_PASSWORD_LENGTH: usize = 8;

/// Hashes and verifies passwords
pub trait PasswordHasher: Send + Sync {
    fn hash(&self, password: &str) -> Result<String, CrudError>;

    /// `Ok(false)` on a mismatch; `Err` only when `hash` is unusable
    fn verify(&self, password: &str, hash: &str) -> Result<bool, CrudError>;
}

/// Argon2id with default parameters
#[derive(Debug, Clone, Copy, Default)]
pub struct Argon2Hasher;

impl PasswordHasher for Argon2Hasher {
    fn hash(&self, password: &str) -> Result<String, CrudError> {
        if password.is_empty() {
            return Err(CrudError::business("Password cannot be empty."));
        }
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| CrudError::Internal(format!("password hashing failed: {}", e)))
    }

    fn verify(&self, password: &str, hash: &str) -> Result<bool, CrudError> {
        if password.is_empty() || hash.is_empty() {
            return Ok(false);
        }
        let parsed = PasswordHash::new(hash)
            .map_err(|e| CrudError::Internal(format!("stored password hash is invalid: {}", e)))?;
        match Argon2::default().verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(CrudError::Internal(format!("password verification failed: {}", e))),
        }
    }
}

/// At least eight characters, with both letters and digits
pub fn validate_password_strength(password: &str) -> Result<(), CrudError> {
    if password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(CrudError::business(format!(
            "Password must be at least {} characters long.",
            MIN_PASSWORD_LENGTH
        )));
    }
    let has_alpha = password.chars().any(char::is_alphabetic);
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    if !(has_alpha && has_digit) {
        return Err(CrudError::business("Password must include letters and numbers."));
    }
    Ok(())
}
