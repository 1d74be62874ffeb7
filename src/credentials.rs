//! Credential resolution. The engine never sees where a secret came from,
//! only a [`Secret`] that wipes its buffer on drop.

use zeroize::Zeroize;

use crate::errors::{ArchiveError, ArchiveResult};
use crate::types::{Account, CredentialRef};

/// A password or bearer token. The buffer is zeroed when dropped so the
/// secret does not linger in freed memory after authentication.
pub struct Secret(String);

impl Secret {
    pub fn new(value: String) -> Self {
        Self(value)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(..)")
    }
}

/// Resolves the secret for an account at connect time.
pub trait CredentialResolver: Send + Sync {
    fn resolve(&self, account: &Account) -> ArchiveResult<Secret>;
}

/// Default resolver: environment variables and the OS keyring, selected by
/// the account's credential reference.
pub struct SystemCredentials;

impl CredentialResolver for SystemCredentials {
    fn resolve(&self, account: &Account) -> ArchiveResult<Secret> {
        match &account.credential {
            CredentialRef::Env(var) => std::env::var(var)
                .map(Secret::new)
                .map_err(|_| ArchiveError::AuthFailed(format!("environment variable {var} not set"))),
            CredentialRef::Keyring { service, user } => {
                let entry = keyring::Entry::new(service, user).map_err(|e| {
                    ArchiveError::AuthFailed(format!("keyring entry {service}/{user}: {e}"))
                })?;
                entry.get_password().map(Secret::new).map_err(|e| {
                    ArchiveError::AuthFailed(format!("keyring entry {service}/{user}: {e}"))
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_debug_hides_value() {
        let secret = Secret::new("hunter2".into());
        assert_eq!(format!("{secret:?}"), "Secret(..)");
    }
}
