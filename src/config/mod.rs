//! TOML configuration: account descriptors plus the engine tuning knobs.
//!
//! The file is looked up explicitly (`--config`), then via `MAGPIE_CONFIG`,
//! then at the platform config directory.

use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::types::{Account, Tuning};

const CONFIG_FILE_NAME: &str = "magpie.toml";

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Archive root. Overridable with `--root` or `MAGPIE_ROOT`.
    pub root: Option<PathBuf>,
    #[serde(default)]
    pub archive: Tuning,
    #[serde(default)]
    pub accounts: Vec<Account>,
}

impl Config {
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => match env::var("MAGPIE_CONFIG") {
                Ok(path) => PathBuf::from(path),
                Err(_) => default_config_path()?,
            },
        };

        let raw = fs::read_to_string(&path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config =
            toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.accounts.is_empty() {
            bail!("config defines no accounts");
        }
        let mut names = HashSet::new();
        for account in &self.accounts {
            if account.name.trim().is_empty() {
                bail!("account with empty name");
            }
            if account.host.trim().is_empty() {
                bail!("account {} has no host", account.name);
            }
            if !names.insert(&account.name) {
                bail!("duplicate account name {}", account.name);
            }
        }
        Ok(())
    }

    /// Archive root precedence: `MAGPIE_ROOT`, then the config file, then
    /// the platform data directory.
    pub fn store_root(&self) -> PathBuf {
        if let Ok(root) = env::var("MAGPIE_ROOT") {
            return PathBuf::from(root);
        }
        if let Some(root) = &self.root {
            return root.clone();
        }
        dirs::data_dir()
            .map(|dir| dir.join("magpie").join("archive"))
            .unwrap_or_else(|| PathBuf::from("magpie-archive"))
    }
}

fn default_config_path() -> Result<PathBuf> {
    let base = dirs::config_dir().context("no config directory on this platform")?;
    Ok(base.join("magpie").join(CONFIG_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AuthKind, CredentialRef};

    #[test]
    fn parses_minimal_config() {
        let raw = r#"
            root = "/tmp/archive"

            [archive]
            global_concurrency = 3

            [[accounts]]
            name = "personal"
            host = "imap.example.org"
            username = "me@example.org"
            credential = { env = "MAGPIE_PERSONAL" }
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        config.validate().unwrap();

        assert_eq!(config.archive.global_concurrency, 3);
        assert_eq!(config.archive.per_host_concurrency, 2);

        let account = &config.accounts[0];
        assert_eq!(account.port, 993);
        assert!(account.tls);
        assert_eq!(account.auth, AuthKind::Password);
        assert!(matches!(&account.credential, CredentialRef::Env(var) if var == "MAGPIE_PERSONAL"));
    }

    #[test]
    fn rejects_duplicate_accounts() {
        let raw = r#"
            [[accounts]]
            name = "a"
            host = "h"
            username = "u"
            credential = { env = "X" }

            [[accounts]]
            name = "a"
            host = "h"
            username = "u"
            credential = { env = "X" }
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_oauth_keyring_account() {
        let raw = r#"
            [[accounts]]
            name = "work"
            host = "imap.corp.example"
            port = 143
            tls = false
            username = "me@corp.example"
            auth = "oauth2"
            credential = { keyring = { service = "magpie", user = "me@corp.example" } }
            folders = ["INBOX", "Sent"]
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        let account = &config.accounts[0];
        assert_eq!(account.auth, AuthKind::OAuth2);
        assert!(!account.tls);
        assert_eq!(account.folders, vec!["INBOX", "Sent"]);
    }
}
