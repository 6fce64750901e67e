use std::time::Duration;

use common::{crypto::INSECURE_DEFAULT_SECRET, CredentialCipher};
use rocket::data::{ByteUnit, ToByteUnit};

use crate::discovery::{ScanSettings, DEFAULT_BATCH_SIZE, DEFAULT_PORT, DEFAULT_PROBE_TIMEOUT};

/// The configuration of the proxy, extracted with [`Rocket`](https://rocket.rs/guide/v0.5/configuration/#extracting-values)
/// from the `Proxy_Rocket.toml` file, `ROCKET_*` variables and the raw `COOKIE_SECRET` variable.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ProxyConfig {
    /// The secret the cookie key is derived from. Falls back to an insecure default when unset.
    #[serde(default)]
    pub cookie_secret: Option<String>,
    /// Whether cookies get the `Secure` flag when the request carries no `X-Forwarded-Proto`.
    /// Defaults to `true` for the release profile only.
    #[serde(default)]
    pub secure_cookies: Option<bool>,
    /// The port probed by the LAN scan.
    #[serde(default = "default_scan_port")]
    pub scan_port: u16,
    /// Connect timeout of a single probe, in milliseconds.
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,
    /// How many probes run at the same time.
    #[serde(default = "default_scan_batch_size")]
    pub scan_batch_size: usize,
    /// Uploads above this size are rejected without contacting the upstream server.
    #[serde(default = "default_upload_limit")]
    pub upload_limit: ByteUnit,
    /// Origins allowed to call the proxy with credentials.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

fn default_scan_port() -> u16 {
    DEFAULT_PORT
}

fn default_scan_timeout_ms() -> u64 {
    DEFAULT_PROBE_TIMEOUT.as_millis() as u64
}

fn default_scan_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_upload_limit() -> ByteUnit {
    1.gibibytes()
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            cookie_secret: None,
            secure_cookies: None,
            scan_port: default_scan_port(),
            scan_timeout_ms: default_scan_timeout_ms(),
            scan_batch_size: default_scan_batch_size(),
            upload_limit: default_upload_limit(),
            allowed_origins: Vec::new(),
        }
    }
}

impl ProxyConfig {
    /// Derive the cookie cipher from the configured secret.
    pub fn cipher(&self) -> CredentialCipher {
        let secret = match self.cookie_secret.as_deref() {
            Some(secret) if !secret.is_empty() => secret,
            _ => {
                log::warn!("No `COOKIE_SECRET` configured, sealing cookies with the insecure default secret!");
                INSECURE_DEFAULT_SECRET
            }
        };
        CredentialCipher::new(secret)
    }

    /// Resolve the `Secure` fallback against the active profile.
    pub fn resolve_secure_cookies(&mut self, profile: &rocket::figment::Profile) {
        if self.secure_cookies.is_none() {
            self.secure_cookies = Some(*profile == rocket::Config::RELEASE_PROFILE);
        }
    }

    pub fn scan_settings(&self) -> ScanSettings {
        ScanSettings {
            port: self.scan_port,
            timeout: Duration::from_millis(self.scan_timeout_ms),
            batch_size: self.scan_batch_size.max(1),
        }
    }
}
