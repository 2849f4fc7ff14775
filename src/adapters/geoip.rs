use std::net::IpAddr;

use eyre::{Result, eyre};

use crate::{
    config::GeoIpEntry,
    core::client_ip::IpNetwork,
    ports::geoip::{GeoIpResolver, GeoLocation, GeoPoint},
};

/// CIDR table lookup; the most specific matching network wins.
#[derive(Debug, Default, Clone)]
pub struct StaticGeoIp {
    entries: Vec<(IpNetwork, u8, GeoLocation)>,
}

impl StaticGeoIp {
    pub fn new(entries: &[GeoIpEntry]) -> Result<Self> {
        let mut table = Vec::with_capacity(entries.len());
        for entry in entries {
            let network = IpNetwork::parse(&entry.cidr)
                .map_err(|e| eyre!("Invalid geoip network '{}': {}", entry.cidr, e))?;
            let location = match (entry.lat, entry.lon) {
                (Some(lat), Some(lon)) => Some(GeoPoint { lat, lon }),
                _ => None,
            };
            let prefix_len = network.prefix_len();
            table.push((
                network,
                prefix_len,
                GeoLocation {
                    country: entry.country.clone(),
                    region: entry.region.clone(),
                    city: entry.city.clone(),
                    location,
                },
            ));
        }
        table.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(Self { entries: table })
    }
}

impl GeoIpResolver for StaticGeoIp {
    fn lookup(&self, ip: IpAddr) -> Option<GeoLocation> {
        self.entries
            .iter()
            .find(|(network, _, _)| network.contains(ip))
            .map(|(_, _, location)| location.clone())
    }
}
