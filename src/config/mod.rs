//! Manages runtime configuration loaded from environment variables.
//!
//! This module defines the `Config` struct which holds every tunable named
//! in the protocol specification (size limits, timeouts, AUTH policy, TLS
//! paths, LMTP mode, PROXY protocol timeout) and provides `from_env` to
//! populate it. It supports loading variables from a `.env` file via the
//! `dotenv` crate and provides defaults for every optional setting.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::env;

/// Default max command-line length per RFC 5321 4.5.3.1.4 (octets incl. CRLF).
pub const DEFAULT_LINE_LENGTH_LIMIT: usize = 1001;
/// Default max DATA block size in bytes (32 MiB).
pub const DEFAULT_DATA_SIZE_LIMIT: usize = 33_554_432;
/// Default idle timeout between commands, in seconds.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 300;
/// Default maximum failed AUTH attempts before the server closes the connection.
pub const DEFAULT_AUTH_MAX_ATTEMPTS: u32 = 3;

/// Holds the core's runtime configuration, typically loaded from environment
/// variables prefixed `SMTP_CORE_`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Hostname the server identifies itself with in the banner and EHLO reply.
    /// (Optional: `SMTP_CORE_HOSTNAME`, Default: "localhost")
    pub server_hostname: String,

    /// The IP address the SMTP/LMTP listener should bind to.
    /// (Optional: `SMTP_CORE_BIND_ADDRESS`, Default: "::1")
    pub smtp_bind_address: String,

    /// The network port the listener should bind to.
    /// (Optional: `SMTP_CORE_PORT`, Default: 8025)
    pub smtp_port: u16,

    /// Path to a UNIX domain socket to listen on instead of TCP. When set,
    /// `smtp_bind_address`/`smtp_port` are ignored.
    /// (Optional: `SMTP_CORE_UNIX_SOCKET`)
    pub unix_socket_path: Option<String>,

    /// Run in LMTP mode (RFC 2033): `LHLO` replaces `HELO`/`EHLO`, and
    /// `handle_DATA` reports one status line per recipient.
    /// (Optional: `SMTP_CORE_LMTP`, Default: false)
    pub lmtp_mode: bool,

    /// Maximum octets (including CRLF) accepted in a single command line.
    /// (Optional: `SMTP_CORE_LINE_LENGTH_LIMIT`, Default: 1001)
    pub line_length_limit: usize,

    /// Maximum bytes accepted for a single DATA block.
    /// (Optional: `SMTP_CORE_DATA_SIZE_LIMIT`, Default: 33554432)
    pub data_size_limit: usize,

    /// Idle timeout between commands, in seconds.
    /// (Optional: `SMTP_CORE_COMMAND_TIMEOUT`, Default: 300)
    pub command_timeout_secs: u64,

    /// Seconds to wait for a PROXY protocol preamble before the banner is
    /// sent. Zero disables PROXY protocol support entirely.
    /// (Optional: `SMTP_CORE_PROXY_TIMEOUT`, Default: 0)
    pub proxy_protocol_timeout_secs: u64,

    /// When true, only EHLO/HELO, NOOP, RSET, STARTTLS, QUIT, HELP are
    /// accepted until TLS is active.
    /// (Optional: `SMTP_CORE_REQUIRE_STARTTLS`, Default: false)
    pub require_starttls: bool,

    /// Path to a PEM certificate chain used for STARTTLS/implicit TLS.
    /// (Optional: `SMTP_CORE_TLS_CERT`)
    pub tls_cert_path: Option<String>,

    /// Path to the PEM private key matching `tls_cert_path`.
    /// (Optional: `SMTP_CORE_TLS_KEY`)
    pub tls_key_path: Option<String>,

    /// Negotiate TLS immediately on accept (SMTPS) instead of via STARTTLS.
    /// Mutually exclusive with STARTTLS within one listener.
    /// (Optional: `SMTP_CORE_IMPLICIT_TLS`, Default: false)
    pub implicit_tls: bool,

    /// Require successful AUTH before MAIL/RCPT/DATA are accepted.
    /// (Optional: `SMTP_CORE_AUTH_REQUIRED`, Default: false)
    pub auth_required: bool,

    /// Require an active TLS session before AUTH is advertised/usable.
    /// (Optional: `SMTP_CORE_AUTH_REQUIRE_TLS`, Default: true)
    pub auth_require_tls: bool,

    /// Failed AUTH attempts allowed before the server replies 421 and closes.
    /// (Optional: `SMTP_CORE_AUTH_MAX_ATTEMPTS`, Default: 3)
    pub auth_max_attempts: u32,

    /// Mechanism names (e.g. "LOGIN") excluded from advertisement and use.
    /// (Optional: `SMTP_CORE_AUTH_EXCLUDE`, comma-separated)
    pub auth_exclude_mechanism: Vec<String>,

    /// Advertise and accept the SMTPUTF8 extension (RFC 6531).
    /// (Optional: `SMTP_CORE_ENABLE_SMTPUTF8`, Default: true)
    pub enable_smtputf8: bool,

    /// Advertise the 8BITMIME extension.
    /// (Optional: `SMTP_CORE_ENABLE_8BITMIME`, Default: true)
    pub enable_8bitmime: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server_hostname: "localhost".to_string(),
            smtp_bind_address: "::1".to_string(),
            smtp_port: 8025,
            unix_socket_path: None,
            lmtp_mode: false,
            line_length_limit: DEFAULT_LINE_LENGTH_LIMIT,
            data_size_limit: DEFAULT_DATA_SIZE_LIMIT,
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
            proxy_protocol_timeout_secs: 0,
            require_starttls: false,
            tls_cert_path: None,
            tls_key_path: None,
            implicit_tls: false,
            auth_required: false,
            auth_require_tls: true,
            auth_max_attempts: DEFAULT_AUTH_MAX_ATTEMPTS,
            auth_exclude_mechanism: Vec::new(),
            enable_smtputf8: true,
            enable_8bitmime: true,
        }
    }
}

impl Config {
    /// Loads configuration from environment variables, falling back to the
    /// defaults in [`Config::default`] for anything unset.
    ///
    /// Reads variables prefixed with `SMTP_CORE_`. Supports loading from a
    /// `.env` file if present. Logs the configuration values being used.
    ///
    /// # Errors
    ///
    /// Returns an `Err` if a variable that must parse as a number or bool is
    /// set but malformed.
    pub fn from_env() -> Result<Self> {
        // Attempt to load variables from a .env file, if it exists. Ignore errors.
        let _ = dotenv::dotenv();

        let mut config = Config::default();

        if let Ok(val) = env::var("SMTP_CORE_HOSTNAME") {
            log::info!("Config: Using server_hostname from env: {}", val);
            config.server_hostname = val;
        }

        if let Ok(val) = env::var("SMTP_CORE_BIND_ADDRESS") {
            log::info!("Config: Using smtp_bind_address from env: {}", val);
            config.smtp_bind_address = val;
        }

        if let Ok(val) = env::var("SMTP_CORE_PORT") {
            config.smtp_port = val
                .parse()
                .map_err(|e| anyhow!("SMTP_CORE_PORT ('{}') must be a valid u16: {}", val, e))?;
        }
        log::info!("Config: Using smtp_port: {}", config.smtp_port);

        if let Ok(val) = env::var("SMTP_CORE_UNIX_SOCKET") {
            log::info!("Config: Using unix_socket_path from env: {}", val);
            config.unix_socket_path = Some(val);
        }

        config.lmtp_mode = parse_bool_env("SMTP_CORE_LMTP", config.lmtp_mode)?;
        log::info!("Config: Using lmtp_mode: {}", config.lmtp_mode);

        if let Ok(val) = env::var("SMTP_CORE_LINE_LENGTH_LIMIT") {
            config.line_length_limit = val.parse().map_err(|e| {
                anyhow!(
                    "SMTP_CORE_LINE_LENGTH_LIMIT ('{}') must be a valid usize: {}",
                    val,
                    e
                )
            })?;
        }

        if let Ok(val) = env::var("SMTP_CORE_DATA_SIZE_LIMIT") {
            config.data_size_limit = val.parse().map_err(|e| {
                anyhow!(
                    "SMTP_CORE_DATA_SIZE_LIMIT ('{}') must be a valid usize: {}",
                    val,
                    e
                )
            })?;
        }
        log::info!("Config: Using data_size_limit: {}", config.data_size_limit);

        if let Ok(val) = env::var("SMTP_CORE_COMMAND_TIMEOUT") {
            config.command_timeout_secs = val.parse().map_err(|e| {
                anyhow!(
                    "SMTP_CORE_COMMAND_TIMEOUT ('{}') must be a valid u64: {}",
                    val,
                    e
                )
            })?;
        }

        if let Ok(val) = env::var("SMTP_CORE_PROXY_TIMEOUT") {
            config.proxy_protocol_timeout_secs = val.parse().map_err(|e| {
                anyhow!(
                    "SMTP_CORE_PROXY_TIMEOUT ('{}') must be a valid u64: {}",
                    val,
                    e
                )
            })?;
        }

        config.require_starttls =
            parse_bool_env("SMTP_CORE_REQUIRE_STARTTLS", config.require_starttls)?;

        if let Ok(val) = env::var("SMTP_CORE_TLS_CERT") {
            config.tls_cert_path = Some(val);
        }
        if let Ok(val) = env::var("SMTP_CORE_TLS_KEY") {
            config.tls_key_path = Some(val);
        }

        config.implicit_tls = parse_bool_env("SMTP_CORE_IMPLICIT_TLS", config.implicit_tls)?;
        if config.implicit_tls && config.require_starttls {
            return Err(anyhow!(
                "SMTP_CORE_IMPLICIT_TLS and SMTP_CORE_REQUIRE_STARTTLS are mutually exclusive"
            ));
        }

        config.auth_required = parse_bool_env("SMTP_CORE_AUTH_REQUIRED", config.auth_required)?;
        config.auth_require_tls =
            parse_bool_env("SMTP_CORE_AUTH_REQUIRE_TLS", config.auth_require_tls)?;

        if let Ok(val) = env::var("SMTP_CORE_AUTH_MAX_ATTEMPTS") {
            config.auth_max_attempts = val.parse().map_err(|e| {
                anyhow!(
                    "SMTP_CORE_AUTH_MAX_ATTEMPTS ('{}') must be a valid u32: {}",
                    val,
                    e
                )
            })?;
        }

        config.auth_exclude_mechanism = env::var("SMTP_CORE_AUTH_EXCLUDE")
            .map(|val| {
                val.split(',')
                    .map(|m| m.trim().to_uppercase())
                    .filter(|m| !m.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        config.enable_smtputf8 =
            parse_bool_env("SMTP_CORE_ENABLE_SMTPUTF8", config.enable_smtputf8)?;
        config.enable_8bitmime =
            parse_bool_env("SMTP_CORE_ENABLE_8BITMIME", config.enable_8bitmime)?;

        Ok(config)
    }
}

/// Parses an optional boolean environment variable, keeping `default` if unset.
fn parse_bool_env(key: &str, default: bool) -> Result<bool> {
    match env::var(key) {
        Ok(val) => val
            .parse::<bool>()
            .map_err(|e| anyhow!("{} ('{}') must be 'true' or 'false': {}", key, val, e)),
        Err(_) => Ok(default),
    }
}

// The inline tests module has been moved to src/config/tests.rs
// and is included via `mod tests;` below.
mod tests;
