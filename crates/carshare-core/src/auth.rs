//! Credential verification for terminal logins.
//!
//! Password hashes are stored as argon2 PHC strings
//! (`$argon2id$v=19$m=...,t=...,p=...$<salt>$<hash>`). Verification reads the
//! parameters back out of the stored string, so hashes written with cheaper
//! parameters keep verifying after the defaults change.

use std::sync::Arc;

use argon2::{
    password_hash::{
        self, rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
    },
    Algorithm, Argon2, Params, Version,
};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::errors::AuthError;
use crate::store::BookingStore;
use crate::types::PersonId;

/// Verifies a username/password pair.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Returns the person's id when the credentials are valid, `None` when
    /// the user is unknown or the password does not match.
    async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<PersonId>, AuthError>;
}

/// Hash a password with a fresh random salt and the default argon2id
/// parameters.
pub fn hash_password(password: &str) -> Result<String, AuthError> {
    hash_with(&Argon2::default(), password)
}

/// Hash with explicit argon2id cost parameters.
pub fn hash_password_with_params(password: &str, params: Params) -> Result<String, AuthError> {
    hash_with(&Argon2::new(Algorithm::Argon2id, Version::V0x13, params), password)
}

fn hash_with(argon2: &Argon2<'_>, password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AuthError::Hashing(e.to_string()))
}

/// Check `password` against a stored PHC string.
///
/// # Returns
/// `Ok(false)` on mismatch, `Err` when the stored hash cannot be parsed or
/// names an algorithm other than argon2.
pub fn verify_password(password: &str, stored: &str) -> Result<bool, password_hash::Error> {
    let parsed = PasswordHash::new(stored)?;
    match Argon2::default().verify_password(password.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(password_hash::Error::Password) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Authenticator backed by the person registry of a [`BookingStore`].
pub struct StoreAuthenticator<S: BookingStore + ?Sized> {
    store: Arc<S>,
}

impl<S: BookingStore + ?Sized> StoreAuthenticator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: BookingStore + ?Sized> Authenticator for StoreAuthenticator<S> {
    async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<PersonId>, AuthError> {
        let Some(person) = self.store.find_person_by_username(username).await? else {
            debug!(username, "login for unknown user");
            return Ok(None);
        };

        match verify_password(password, &person.password_hash) {
            Ok(true) => Ok(Some(person.id)),
            Ok(false) => {
                debug!(username, "password mismatch");
                Ok(None)
            }
            Err(reason) => {
                warn!(username, %reason, "stored password hash is malformed");
                Err(AuthError::MalformedHash(username.to_string()))
            }
        }
    }
}
