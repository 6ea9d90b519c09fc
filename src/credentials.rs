use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::config::get_config_dir;
use crate::hub::AccessTokenProvider;
use crate::models::UserId;

pub const TOKEN_ENV: &str = "HUBLINE_TOKEN";
pub const USER_ID_ENV: &str = "HUBLINE_USER_ID";

/// Saved session: who we are and the opaque token handed to the hubs
#[derive(Serialize, Deserialize, Clone, PartialEq)]
pub struct Credentials {
    pub server: String,
    pub user_id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("server", &self.server)
            .field("user_id", &self.user_id)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Credentials {
    pub fn new(server: &str, user_id: UserId, token: &str) -> Self {
        Credentials {
            server: server.to_string(),
            user_id,
            token: Some(BASE64.encode(token)),
        }
    }

    pub fn get_token(&self) -> Option<String> {
        self.token.as_ref().and_then(|encoded| {
            BASE64
                .decode(encoded)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        })
    }

    /// Environment overrides for the user id and token
    pub fn apply_env(mut self) -> Self {
        if let Some(user_id) = env::var(USER_ID_ENV).ok().and_then(|v| v.trim().parse().ok()) {
            self.user_id = user_id;
        }
        if let Ok(token) = env::var(TOKEN_ENV) {
            if !token.trim().is_empty() {
                self.token = Some(BASE64.encode(token.trim()));
            }
        }
        self
    }
}

fn get_credentials_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join("credentials.json"))
}

pub fn save_credentials(credentials: &Credentials) -> Result<()> {
    save_credentials_to(&get_credentials_path()?, credentials)
}

pub fn save_credentials_to(path: &Path, credentials: &Credentials) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, credentials)?;

    info!("Credentials saved for user {}", credentials.user_id);
    Ok(())
}

pub fn load_credentials() -> Result<Option<Credentials>> {
    load_credentials_from(&get_credentials_path()?)
}

pub fn load_credentials_from(path: &Path) -> Result<Option<Credentials>> {
    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(path)?;
    let credentials: Credentials = serde_json::from_str(&contents)
        .map_err(|e| anyhow!("invalid credentials file {}: {}", path.display(), e))?;
    info!(
        "Loaded credentials for user {} from {}",
        credentials.user_id,
        path.display()
    );

    Ok(Some(credentials))
}

/// Token provider backed by a fixed token
#[derive(Clone)]
pub struct StaticTokenProvider {
    token: Option<String>,
}

impl StaticTokenProvider {
    pub fn new(token: Option<String>) -> Self {
        StaticTokenProvider { token }
    }

    pub fn from_credentials(credentials: &Credentials) -> Self {
        StaticTokenProvider::new(credentials.get_token())
    }
}

impl AccessTokenProvider for StaticTokenProvider {
    fn access_token(&self) -> Option<String> {
        let token = self.token.clone().filter(|token| !token.is_empty());
        if token.is_none() {
            debug!("No access token configured");
        }
        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_is_encoded_at_rest() {
        let credentials = Credentials::new("http://localhost:5279", 4, "eyJhbGciOi.payload.sig");
        assert_ne!(credentials.token.as_deref(), Some("eyJhbGciOi.payload.sig"));
        assert_eq!(credentials.get_token().as_deref(), Some("eyJhbGciOi.payload.sig"));
        assert!(!format!("{:?}", credentials).contains("payload"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        assert!(load_credentials_from(&path).unwrap().is_none());

        let credentials = Credentials::new("http://localhost:5279", 12, "secret");
        save_credentials_to(&path, &credentials).unwrap();
        assert_eq!(load_credentials_from(&path).unwrap(), Some(credentials));
    }

    #[test]
    fn test_static_provider() {
        assert_eq!(StaticTokenProvider::new(Some("t".into())).access_token().as_deref(), Some("t"));
        assert!(StaticTokenProvider::new(Some(String::new())).access_token().is_none());
        assert!(StaticTokenProvider::new(None).access_token().is_none());
    }
}
