//! Client address resolution behind trusted proxies.
//!
//! `X-Forwarded-For` is walked right to left; every hop that belongs to a
//! trusted network is skipped and the first untrusted address is the client.
//! `X-Forwarded-Proto` is honoured only when the direct peer is trusted.

use std::{net::IpAddr, str::FromStr};

use http::HeaderMap;

/// CIDR network representation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpNetwork {
    addr: IpAddr,
    prefix_len: u8,
}

impl IpNetwork {
    /// Create a new IP network from an address and prefix length
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self, String> {
        match addr {
            IpAddr::V4(_) if prefix_len > 32 => {
                return Err("IPv4 prefix length must be <= 32".to_string());
            }
            IpAddr::V6(_) if prefix_len > 128 => {
                return Err("IPv6 prefix length must be <= 128".to_string());
            }
            _ => {}
        }

        Ok(Self { addr, prefix_len })
    }

    /// Parse from CIDR notation (e.g., "192.168.1.0/24") or a bare address.
    pub fn parse(s: &str) -> Result<Self, String> {
        if let Some((ip_str, prefix_str)) = s.split_once('/') {
            let addr = IpAddr::from_str(ip_str).map_err(|e| format!("Invalid IP address: {e}"))?;
            let prefix_len: u8 = prefix_str
                .parse()
                .map_err(|e| format!("Invalid prefix length: {e}"))?;
            Self::new(addr, prefix_len)
        } else {
            let addr = IpAddr::from_str(s).map_err(|e| format!("Invalid IP address: {e}"))?;
            let prefix_len = match addr {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            Ok(Self { addr, prefix_len })
        }
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Check if an IP address is contained in this network
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip.to_canonical()) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = if self.prefix_len == 0 {
                    0
                } else {
                    !0u32 << (32 - self.prefix_len)
                };
                (u32::from(net) & mask) == (u32::from(addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = if self.prefix_len == 0 {
                    0
                } else {
                    !0u128 << (128 - self.prefix_len)
                };
                (u128::from(net) & mask) == (u128::from(addr) & mask)
            }
            _ => false,
        }
    }
}

impl FromStr for IpNetwork {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IpNetwork::parse(s)
    }
}

/// Address and scheme of the end client as seen through the proxy chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientAddress {
    pub ip: IpAddr,
    pub scheme: String,
}

#[derive(Debug, Clone, Default)]
pub struct TrustedProxies {
    networks: Vec<IpNetwork>,
}

impl TrustedProxies {
    pub fn new(networks: Vec<IpNetwork>) -> Self {
        Self { networks }
    }

    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self, String> {
        let networks = entries
            .iter()
            .map(|entry| IpNetwork::parse(entry.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(networks))
    }

    pub fn is_trusted(&self, ip: IpAddr) -> bool {
        self.networks.iter().any(|net| net.contains(ip))
    }

    /// Resolve the client behind `peer`, the address of the direct connection.
    pub fn resolve(&self, peer: IpAddr, headers: &HeaderMap, listener_scheme: &str) -> ClientAddress {
        let peer = peer.to_canonical();
        if !self.is_trusted(peer) {
            return ClientAddress {
                ip: peer,
                scheme: listener_scheme.to_string(),
            };
        }

        let mut client = peer;
        let hops = headers
            .get_all("x-forwarded-for")
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .filter(|hop| !hop.is_empty())
            .collect::<Vec<_>>();
        for hop in hops.iter().rev() {
            let Ok(ip) = hop.parse::<IpAddr>() else {
                break;
            };
            client = ip.to_canonical();
            if !self.is_trusted(client) {
                break;
            }
        }

        let scheme = headers
            .get("x-forwarded-proto")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(|value| value.trim().to_ascii_lowercase())
            .filter(|value| value == "http" || value == "https")
            .unwrap_or_else(|| listener_scheme.to_string());

        ClientAddress { ip: client, scheme }
    }
}
