use std::net::IpAddr;

use serde::Serialize;

/// Geographic coordinates, serialized the way search indexes expect a geo point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct GeoLocation {
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub location: Option<GeoPoint>,
}

/// Maps a client address to a location. Lookups are in-memory and must not block.
pub trait GeoIpResolver: Send + Sync {
    fn lookup(&self, ip: IpAddr) -> Option<GeoLocation>;
}
