#![allow(dead_code)]

use std::collections::HashSet;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use aurora_client::{AuroraClient, SharedLine};
use types::DeviceIdentity;

/// One physical serial line and the bus addresses of the inverters on it.
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone)]
pub struct LineConfig {
    pub port: String,
    pub baud_rate: u32,
    pub addresses: Vec<u8>,
}

impl Default for LineConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 19_200,
            addresses: vec![2],
        }
    }
}

#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub lines: Vec<LineConfig>,
    /// Per-request timeout applied to every client, in milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            lines: vec![LineConfig::default()],
            request_timeout_ms: 1_000,
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no serial lines configured")]
    NoLines,
    #[error("line {port} has no addresses configured")]
    NoAddresses { port: String },
    #[error("line {port} lists address {address} more than once")]
    DuplicateAddress { port: String, address: u8 },
}

/// Builds ready-to-use clients from the line configuration.
///
/// Every address on one line shares a single [`SharedLine`] handle; clients
/// are returned in configuration order, which is also the order the
/// acquisition loop polls them in.
pub fn register(config: &RegistryConfig) -> Result<Vec<(DeviceIdentity, AuroraClient)>, RegistryError> {
    if config.lines.is_empty() {
        return Err(RegistryError::NoLines);
    }

    let timeout = Duration::from_millis(config.request_timeout_ms);
    let mut clients = Vec::new();

    for line_config in &config.lines {
        if line_config.addresses.is_empty() {
            return Err(RegistryError::NoAddresses {
                port: line_config.port.clone(),
            });
        }

        let mut seen = HashSet::new();
        let line = SharedLine::new(line_config.port.clone(), line_config.baud_rate);
        for &address in &line_config.addresses {
            if !seen.insert(address) {
                return Err(RegistryError::DuplicateAddress {
                    port: line_config.port.clone(),
                    address,
                });
            }

            let identity = DeviceIdentity {
                port: line_config.port.clone(),
                address,
            };
            clients.push((identity, AuroraClient::new(line.clone(), address, timeout)));
        }

        info!(
            port = %line_config.port,
            addresses = line_config.addresses.len(),
            "serial line registered"
        );
    }

    Ok(clients)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_clients_in_configuration_order() {
        let config = RegistryConfig {
            lines: vec![
                LineConfig {
                    port: "/dev/ttyUSB2".to_string(),
                    baud_rate: 19_200,
                    addresses: vec![2, 3],
                },
                LineConfig {
                    port: "/dev/ttyUSB3".to_string(),
                    baud_rate: 19_200,
                    addresses: vec![2],
                },
            ],
            request_timeout_ms: 500,
        };

        let clients = register(&config).expect("register");
        assert_eq!(clients.len(), 3);
        assert_eq!(clients[0].0.port, "/dev/ttyUSB2");
        assert_eq!(clients[0].0.address, 2);
        assert_eq!(clients[1].0.address, 3);
        assert_eq!(clients[2].0.port, "/dev/ttyUSB3");
    }

    #[test]
    fn addresses_on_one_port_share_the_line() {
        let config = RegistryConfig {
            lines: vec![LineConfig {
                port: "/dev/ttyUSB2".to_string(),
                baud_rate: 19_200,
                addresses: vec![2, 3],
            }],
            request_timeout_ms: 500,
        };

        let clients = register(&config).expect("register");
        assert!(clients[0].1.line().same_line(clients[1].1.line()));
    }

    #[test]
    fn empty_lines_are_rejected() {
        let config = RegistryConfig {
            lines: Vec::new(),
            request_timeout_ms: 500,
        };
        assert!(matches!(register(&config), Err(RegistryError::NoLines)));
    }

    #[test]
    fn duplicate_addresses_are_rejected() {
        let config = RegistryConfig {
            lines: vec![LineConfig {
                port: "/dev/ttyUSB2".to_string(),
                baud_rate: 19_200,
                addresses: vec![2, 2],
            }],
            request_timeout_ms: 500,
        };
        assert!(matches!(
            register(&config),
            Err(RegistryError::DuplicateAddress { address: 2, .. })
        ));
    }
}
