//! Relay settings read from the environment.

use std::net::SocketAddr;

const DEFAULT_ADDR: &str = "0.0.0.0:3000";

#[derive(thiserror::Error, Debug)]
pub enum RelayConfigError {
    #[error("invalid {key} value {value:?}: {source}")]
    Addr {
        key: &'static str,
        value: String,
        #[source]
        source: std::net::AddrParseError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub addr: SocketAddr,
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, RelayConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// `DICE_RUSH_RELAY_ADDR` wins over `PORT`, which binds all interfaces.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, RelayConfigError> {
        let (key, raw) = if let Some(addr) = lookup("DICE_RUSH_RELAY_ADDR") {
            ("DICE_RUSH_RELAY_ADDR", addr)
        } else if let Some(port) = lookup("PORT") {
            ("PORT", format!("0.0.0.0:{}", port.trim()))
        } else {
            ("DICE_RUSH_RELAY_ADDR", DEFAULT_ADDR.to_string())
        };
        let addr = raw.trim().parse().map_err(|source| RelayConfigError::Addr {
            key,
            value: raw.clone(),
            source,
        })?;
        Ok(Self { addr })
    }
}
