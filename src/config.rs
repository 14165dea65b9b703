use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use url::Url;

use crate::error::{Error, Result};

pub const SERVER_URL_ENV: &str = "PHPIPAM_SERVER_URL";
pub const USERNAME_ENV: &str = "PHPIPAM_USERNAME";
pub const PASSWORD_ENV: &str = "PHPIPAM_PASSWORD";

const REDACTED: &str = "********";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server_url: Option<String>,
    pub app_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Owner tag attached to every address this tool allocates.
    pub client_tag: String,
    pub timeout_seconds: u64,
    pub state_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: None,
            app_id: "ipamlease".to_string(),
            username: None,
            password: None,
            client_tag: "ipamlease".to_string(),
            timeout_seconds: 30,
            state_file: "ipamlease.state.json".to_string(),
        }
    }
}

impl Config {
    /// Loads the config file if it exists, otherwise starts from defaults.
    ///
    /// Credentials are not required to be present in the file; see
    /// [`Config::with_env_fallback`].
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Fills unset connection settings from `PHPIPAM_*` environment variables.
    pub fn with_env_fallback(self) -> Self {
        self.fill_from(|key| std::env::var(key).ok())
    }

    /// Fills unset or empty connection settings from `lookup`.
    ///
    /// Values already present in the config take precedence.
    pub fn fill_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        for (slot, key) in [
            (&mut self.server_url, SERVER_URL_ENV),
            (&mut self.username, USERNAME_ENV),
            (&mut self.password, PASSWORD_ENV),
        ] {
            if slot.as_deref().is_none_or(str::is_empty) {
                *slot = lookup(key).filter(|value| !value.is_empty());
            }
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        let server_url = self.server_url.as_deref().unwrap_or_default();
        if server_url.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "server_url must be set (or {})",
                SERVER_URL_ENV
            )));
        }

        let url = Url::parse(server_url).map_err(|error| {
            Error::InvalidConfig(format!("server_url {:?} is invalid: {}", server_url, error))
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(Error::InvalidConfig(format!(
                "server_url must use http or https, found {}",
                url.scheme()
            )));
        }

        if self.username().is_empty() {
            return Err(Error::InvalidConfig(format!(
                "username must be set (or {})",
                USERNAME_ENV
            )));
        }

        if self.password().is_empty() {
            return Err(Error::InvalidConfig(format!(
                "password must be set (or {})",
                PASSWORD_ENV
            )));
        }

        if self.app_id.is_empty() {
            return Err(Error::InvalidConfig("app_id must not be empty".to_string()));
        }

        if self.timeout_seconds == 0 {
            return Err(Error::InvalidConfig(
                "timeout_seconds must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn server_url(&self) -> &str {
        self.server_url.as_deref().unwrap_or_default()
    }

    pub fn username(&self) -> &str {
        self.username.as_deref().unwrap_or_default()
    }

    pub fn password(&self) -> &str {
        self.password.as_deref().unwrap_or_default()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Copy safe to print: the password is masked.
    pub fn redacted(&self) -> Self {
        Self {
            password: self.password.as_ref().map(|_| REDACTED.to_string()),
            ..self.clone()
        }
    }
}
