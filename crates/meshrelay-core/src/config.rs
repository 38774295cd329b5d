//! Relay configuration

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Relay data-plane configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayConfig {
    /// TCP address the data plane listens on
    pub listen_addr: SocketAddr,

    /// Endpoint advertised in stream grants; the bound address when unset
    pub endpoint: Option<String>,

    /// TTL applied when a caller does not pick one
    pub default_ttl: Duration,

    /// Deadline for the first frame on an inbound connection
    pub handshake_timeout: Duration,

    /// How often the TTL collector sweeps
    pub sweep_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 24002)),
            endpoint: None,
            default_ttl: Duration::from_secs(60), // one minute rendezvous window
            handshake_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

impl RelayConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.default_ttl.is_zero() {
            return Err("Default TTL must be non-zero".into());
        }
        if self.handshake_timeout.is_zero() {
            return Err("Handshake timeout must be non-zero".into());
        }
        if self.sweep_interval.is_zero() {
            return Err("Sweep interval must be non-zero".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(RelayConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let config = RelayConfig {
            default_ttl: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
