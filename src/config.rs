// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : flash_close — emergency flat-and-cancel tool for Bitget futures
Module  : <module_name>.rs
Version : 0.1.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
Email   : kukuhtw@gmail.com
WhatsApp: https://wa.me/628129893706
LinkedIn: https://id.linkedin.com/in/kukuhtw
License : MIT (see LICENSE)

Summary : Closes every open position and cancels every trigger, TP/SL and
          limit order on one Bitget futures account, retrying rate-limited
          calls with exponential backoff, then re-checks the account and
          reports anything still open.

(c) 2025 Kukuh TW. All rights reserved where applicable.
=============================================================================
*/
use std::env;
use std::fmt;
use std::str::FromStr;

use clap::Parser;
use dotenvy::dotenv;
use thiserror::Error;
use tokio::time::Duration;

use crate::domain::ProductType;
use crate::retry::{RetryPolicy, DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS};

pub const DEFAULT_REST_URL: &str = "https://api.bitget.com";
pub const DEFAULT_ACCOUNT: &str = "BITGET";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown product type {0:?} (expected USDT-FUTURES or USDC-FUTURES)")]
    ProductType(String),
    #[error("unknown venue mode {0:?} (expected mock or bitget)")]
    VenueMode(String),
    #[error("invalid API credentials for account {account}: {missing} is not set")]
    MissingCredential { account: String, missing: String },
}

/// Flags override the matching env var.
#[derive(Debug, Default, Parser)]
#[command(name = "flash_close", version, about = "Close all positions and cancel all orders on a Bitget futures account")]
pub struct Cli {
    /// mock | bitget (env VENUE_MODE)
    #[arg(long)]
    pub venue: Option<String>,
    /// USDT-FUTURES | USDC-FUTURES (env PRODUCT_TYPE)
    #[arg(long)]
    pub product_type: Option<String>,
    /// Credential prefix, e.g. BITGET1 reads BITGET1_API_KEY (env BITGET_ACCOUNT)
    #[arg(long)]
    pub account: Option<String>,
    /// Append JSONL audit events here (env RECORD_FILE)
    #[arg(long)]
    pub record_file: Option<String>,
    /// Write prometheus text metrics here at exit (env METRICS_FILE)
    #[arg(long)]
    pub metrics_file: Option<String>,
    /// Print the final report as JSON
    #[arg(long)]
    pub json: bool,
}

/// Mode venue trading
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VenueMode {
    Mock,
    Bitget,
}

impl VenueMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mock" => Some(VenueMode::Mock),
            "bitget" | "bitget_mainnet" => Some(VenueMode::Bitget),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VenueMode::Mock => "mock",
            VenueMode::Bitget => "bitget",
        }
    }
}

#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub secret: String,
    pub passphrase: String,
}

impl Credentials {
    /// Reads `<ACCOUNT>_API_KEY`, `<ACCOUNT>_API_SECRET`, `<ACCOUNT>_API_PASSPHRASE`.
    pub fn from_lookup(account: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let prefix = account.trim().to_ascii_uppercase();
        let get = |suffix: &str| {
            let key = format!("{prefix}_{suffix}");
            lookup(&key).filter(|v| !v.trim().is_empty()).ok_or(ConfigError::MissingCredential {
                account: prefix.clone(),
                missing: key,
            })
        };
        let api_key = get("API_KEY")?;
        let secret = get("API_SECRET")?;
        // passphrase boleh kosong di sisi loader; Bitget yang akan menolak
        let passphrase = lookup(&format!("{prefix}_API_PASSPHRASE")).unwrap_or_default();
        Ok(Self { api_key, secret, passphrase })
    }

    pub fn from_env(account: &str) -> Result<Self, ConfigError> {
        Self::from_lookup(account, |k| env::var(k).ok())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("passphrase", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct Args {
    pub venue_mode: VenueMode,
    pub product_type: ProductType,
    pub account: String,
    pub rest_url: String,

    // files
    pub record_file: Option<String>,
    pub metrics_file: Option<String>,
    pub json: bool,

    // pacing / retry
    pub retry: RetryPolicy,
    pub request_spacing: Duration,
    pub http_timeout: Duration,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

pub fn load(cli: &Cli) -> Result<Args, ConfigError> {
    // Pastikan .env dibaca (agar kredensial, PRODUCT_TYPE, dll ter-load)
    let _ = dotenv();
    build(cli, |k| env::var(k).ok())
}

fn build(cli: &Cli, lookup: impl Fn(&str) -> Option<String>) -> Result<Args, ConfigError> {
    let pick = |flag: &Option<String>, key: &str| flag.clone().or_else(|| lookup(key));

    // ===== Mode =====
    let venue_mode = match pick(&cli.venue, "VENUE_MODE") {
        Some(v) => VenueMode::parse(&v).ok_or(ConfigError::VenueMode(v))?,
        None => VenueMode::Bitget,
    };
    let product_type = match pick(&cli.product_type, "PRODUCT_TYPE") {
        Some(v) => ProductType::parse(&v).ok_or(ConfigError::ProductType(v))?,
        None => ProductType::UsdtFutures,
    };
    let account = pick(&cli.account, "BITGET_ACCOUNT").unwrap_or_else(|| DEFAULT_ACCOUNT.to_string());
    let rest_url = lookup("BITGET_REST_URL").unwrap_or_else(|| DEFAULT_REST_URL.to_string());

    // ===== Files =====
    let record_file = pick(&cli.record_file, "RECORD_FILE");
    let metrics_file = pick(&cli.metrics_file, "METRICS_FILE");

    // ===== Retry / pacing =====
    let num = |key: &str, default: u64| lookup(key).and_then(|s| s.trim().parse().ok()).unwrap_or(default);
    let max_attempts = num("RETRY_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS as u64) as u32;
    let base_delay = Duration::from_millis(num("RETRY_BASE_DELAY_MS", DEFAULT_BASE_DELAY.as_millis() as u64));
    let request_spacing = Duration::from_millis(num("REQUEST_SPACING_MS", 100));
    let http_timeout = Duration::from_secs(num("HTTP_TIMEOUT_SECS", 10));

    Ok(Args {
        venue_mode,
        product_type,
        account,
        rest_url,
        record_file,
        metrics_file,
        json: cli.json,
        retry: RetryPolicy::new(max_attempts, base_delay),
        request_spacing,
        http_timeout,
    })
}

/// `RUST_LOG` wins, otherwise `info`.
pub fn log_filter() -> String {
    env_or("RUST_LOG", "info".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k: &str| map.get(k).cloned()
    }

    #[test]
    fn defaults_match_a_live_usdt_run() {
        let args = build(&Cli::default(), lookup(&[])).unwrap();
        assert_eq!(args.venue_mode, VenueMode::Bitget);
        assert_eq!(args.product_type, ProductType::UsdtFutures);
        assert_eq!(args.account, "BITGET");
        assert_eq!(args.rest_url, DEFAULT_REST_URL);
        assert_eq!(args.retry, RetryPolicy::default());
        assert_eq!(args.request_spacing, Duration::from_millis(100));
        assert_eq!(args.http_timeout, Duration::from_secs(10));
        assert!(args.record_file.is_none());
    }

    #[test]
    fn flags_override_env() {
        let cli = Cli { product_type: Some("USDC-FUTURES".into()), venue: Some("mock".into()), ..Default::default() };
        let env = lookup(&[
            ("PRODUCT_TYPE", "USDT-FUTURES"),
            ("VENUE_MODE", "bitget"),
            ("RETRY_MAX_ATTEMPTS", "3"),
            ("RETRY_BASE_DELAY_MS", "250"),
        ]);
        let args = build(&cli, env).unwrap();
        assert_eq!(args.product_type, ProductType::UsdcFutures);
        assert_eq!(args.venue_mode, VenueMode::Mock);
        assert_eq!(args.retry, RetryPolicy::new(3, Duration::from_millis(250)));
    }

    #[test]
    fn unknown_product_type_is_rejected() {
        let err = build(&Cli::default(), lookup(&[("PRODUCT_TYPE", "COIN-FUTURES")])).unwrap_err();
        assert!(matches!(err, ConfigError::ProductType(_)));
    }

    #[test]
    fn credentials_use_account_prefix() {
        let creds = Credentials::from_lookup(
            "bitget1",
            lookup(&[
                ("BITGET1_API_KEY", "k"),
                ("BITGET1_API_SECRET", "s"),
                ("BITGET1_API_PASSPHRASE", "p"),
            ]),
        )
        .unwrap();
        assert_eq!(creds.api_key, "k");
        assert_eq!(creds.passphrase, "p");
        let dbg = format!("{creds:?}");
        assert!(dbg.contains("<redacted>"));
        assert!(!dbg.contains("\"s\""));
    }

    #[test]
    fn missing_secret_names_the_variable() {
        let err = Credentials::from_lookup("BITGET", lookup(&[("BITGET_API_KEY", "k")])).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid API credentials for account BITGET: BITGET_API_SECRET is not set"
        );
    }
}
