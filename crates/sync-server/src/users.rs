//! Accounts allowed to connect.
//!
//! Loaded from a TOML file holding SHA-256 digests of each password:
//!
//! ```toml
//! [users.alice]
//! password_sha256 = "2bb80d537b1da3e38bd30361aa855686bde0eacd7162fef6a25fe97bf527a25b"
//!
//! [users.bob]
//! password_sha256 = "..."
//! active = false
//! ```
//!
//! A digest can be produced with `printf %s 'secret' | sha256sum`.

use anyhow::{Context, Result};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct UserEntry {
    password_sha256: String,
    #[serde(default = "default_true")]
    active: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Users {
    #[serde(default)]
    users: HashMap<String, UserEntry>,
}

impl Users {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read users file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut users: Users = toml::from_str(text)?;
        for (name, entry) in users.users.iter_mut() {
            entry.password_sha256.make_ascii_lowercase();
            anyhow::ensure!(
                entry.password_sha256.len() == 64
                    && entry.password_sha256.bytes().all(|b| b.is_ascii_hexdigit()),
                "User {} has a malformed password_sha256",
                name
            );
        }
        Ok(users)
    }

    /// Add an active user with a plaintext password.
    pub fn with_user(mut self, name: impl Into<String>, password: &str) -> Self {
        let entry = UserEntry {
            password_sha256: digest(password),
            active: true,
        };
        self.users.insert(name.into(), entry);
        self
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Check a username and password against the active accounts.
    pub fn verify(&self, name: &str, password: &str) -> bool {
        self.users
            .get(name)
            .is_some_and(|user| user.active && user.password_sha256 == digest(password))
    }
}

fn digest(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_checks_password_and_active_flag() {
        let text = format!(
            "[users.alice]\npassword_sha256 = \"{}\"\n\n[users.bob]\npassword_sha256 = \"{}\"\nactive = false\n",
            digest("wonderland").to_uppercase(),
            digest("builder")
        );
        let users = Users::parse(&text).unwrap();
        assert_eq!(users.len(), 2);

        assert!(users.verify("alice", "wonderland"));
        assert!(!users.verify("alice", "Wonderland"));
        assert!(!users.verify("bob", "builder"));
        assert!(!users.verify("carol", "wonderland"));
    }

    #[test]
    fn test_malformed_digest_rejected() {
        assert!(Users::parse("[users.alice]\npassword_sha256 = \"abc\"\n").is_err());
        assert!(Users::parse("[users.alice]\npassword = \"plain\"\n").is_err());
    }

    #[test]
    fn test_with_user() {
        let users = Users::default().with_user("alice", "secret");
        assert!(users.verify("alice", "secret"));
        assert!(!users.verify("alice", ""));
    }
}
