//! Configuration loading from `.env` files.

use std::{env, path::PathBuf, time::Duration};

use anyhow::{Context, Result};

use crate::{codec::DEFAULT_SLUG_PRICE, relay::DEFAULT_RELAYS};

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory of the local advisory cache.
    pub cache_root: PathBuf,
    /// Relays every publish and subscription fans out to.
    pub relays: Vec<String>,
    /// Optional Tor SOCKS proxy (host:port).
    pub tor_socks: Option<String>,
    /// Drop subscription events whose id or signature does not verify.
    pub verify_sig: bool,
    /// Hex secret key of the user identity, if one is configured.
    pub secret_key: Option<String>,
    /// Wait bound for board config publishes.
    pub publish_timeout: Duration,
    /// Wait bound for lightweight publishes such as slug claims.
    pub light_publish_timeout: Duration,
    /// Wait bound for one-shot relay queries.
    pub query_timeout: Duration,
    /// Advertised slug price in sats.
    pub slug_price: u64,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let cache_root = PathBuf::from(env::var("CACHE_ROOT").context("CACHE_ROOT not set")?);
        let mut relays = csv_strings(env::var("RELAYS").unwrap_or_default());
        if relays.is_empty() {
            relays = DEFAULT_RELAYS.iter().map(|r| r.to_string()).collect();
        }
        let tor_socks = env::var("TOR_SOCKS").ok().filter(|s| !s.is_empty());
        let verify_sig = env::var("VERIFY_SIG").unwrap_or_else(|_| "1".into()) != "0";
        let secret_key = env::var("SECRET_KEY").ok().filter(|s| !s.trim().is_empty());
        let publish_timeout = Duration::from_secs(secs_or("PUBLISH_TIMEOUT_SECS", 5));
        let light_publish_timeout = Duration::from_secs(secs_or("LIGHT_PUBLISH_TIMEOUT_SECS", 3));
        let query_timeout = Duration::from_secs(secs_or("QUERY_TIMEOUT_SECS", 5));
        let slug_price = env::var("SLUG_PRICE")
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(DEFAULT_SLUG_PRICE);
        Ok(Self {
            cache_root,
            relays,
            tor_socks,
            verify_sig,
            secret_key,
            publish_timeout,
            light_publish_timeout,
            query_timeout,
            slug_price,
        })
    }
}

fn secs_or(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .filter(|s| *s > 0)
        .unwrap_or(default)
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    let s = input.as_ref();
    s.split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}
