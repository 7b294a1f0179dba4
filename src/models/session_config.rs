use crate::session::MAX_TTL;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Session cookie and lifetime configuration
///
/// The cookie attributes act as a template: every issued session cookie copies
/// them verbatim, only the value (the session id) and the expiry change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SessionConfig {
    /// Name of the session cookie
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    /// Session lifetime, renewed on every request
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
    /// Cookie scope path
    #[serde(default = "default_cookie_path")]
    pub cookie_path: String,
    #[serde(default)]
    pub cookie_domain: Option<String>,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub same_site: Option<SameSitePolicy>,
    /// How often the background sweep looks for expired sessions
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

fn default_cookie_name() -> String {
    "sessionid".to_string()
}

fn default_ttl_seconds() -> u64 {
    180
}

fn default_cookie_path() -> String {
    "/".to_string()
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: default_cookie_name(),
            ttl_seconds: default_ttl_seconds(),
            cookie_path: default_cookie_path(),
            cookie_domain: None,
            secure: false,
            http_only: false,
            same_site: None,
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SameSitePolicy {
    Strict,
    Lax,
    None,
}

impl From<SameSitePolicy> for cookie::SameSite {
    fn from(policy: SameSitePolicy) -> Self {
        match policy {
            SameSitePolicy::Strict => cookie::SameSite::Strict,
            SameSitePolicy::Lax => cookie::SameSite::Lax,
            SameSitePolicy::None => cookie::SameSite::None,
        }
    }
}

impl SessionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.cookie_name.is_empty() {
            return Err("Cookie name must not be empty".to_string());
        }

        if self
            .cookie_name
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || matches!(c, '=' | ';' | ','))
        {
            return Err(format!(
                "Cookie name '{}' contains characters not allowed in a cookie name",
                self.cookie_name
            ));
        }

        if !self.cookie_path.starts_with('/') {
            return Err(format!(
                "Cookie path '{}' must start with '/'",
                self.cookie_path
            ));
        }

        if self.ttl_seconds == 0 {
            return Err("Session TTL must be at least one second".to_string());
        }

        if self.ttl() > MAX_TTL {
            return Err(format!(
                "Session TTL of {}s exceeds the maximum of {}s",
                self.ttl_seconds,
                MAX_TTL.as_secs()
            ));
        }

        if self.sweep_interval_ms == 0 {
            return Err("Sweep interval must be greater than zero".to_string());
        }

        Ok(())
    }
}
