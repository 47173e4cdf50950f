//! Multicast output addresses (`group:port`).

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

use crate::error::CoreError;

/// Conventional port for auto-suggested outputs.
pub const DEFAULT_MULTICAST_PORT: u16 = 5000;

/// MPEG-TS payload size per UDP datagram (7 x 188 bytes).
pub const TS_PACKET_PAYLOAD: u32 = 1316;

/// Multicast TTL used by the relay.
pub const MULTICAST_TTL: u8 = 5;

/// A validated IPv4 multicast `group:port`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MulticastAddr(SocketAddrV4);

impl MulticastAddr {
    pub fn parse(input: &str) -> Result<Self, CoreError> {
        let input = input.trim();
        let addr: SocketAddrV4 = input.parse().map_err(|_| {
            CoreError::Validation(format!(
                "Multicast output '{input}' must be an IPv4 group:port, e.g. 239.1.1.1:5000"
            ))
        })?;
        if !addr.ip().is_multicast() {
            return Err(CoreError::Validation(format!(
                "Multicast output '{input}' is not in 224.0.0.0/4"
            )));
        }
        if addr.port() == 0 {
            return Err(CoreError::Validation("Multicast port must not be 0".into()));
        }
        Ok(Self(addr))
    }

    pub fn group(&self) -> Ipv4Addr {
        *self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    /// Relay destination: `udp://group:port?pkt_size=1316&ttl=5`.
    pub fn relay_target(&self) -> String {
        format!("udp://{}?pkt_size={TS_PACKET_PAYLOAD}&ttl={MULTICAST_TTL}", self.0)
    }

    /// Source URL for a capture process joining the group.
    pub fn capture_source(&self) -> String {
        format!("udp://@{}", self.0)
    }
}

impl fmt::Display for MulticastAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for MulticastAddr {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Suggest the output for a server's next channel: `239.1.1.<n+1>:5000`.
///
/// `existing_channels` is the number of channels the server already has.
/// The last octet wraps within 1..=254.
pub fn suggest_next(existing_channels: usize) -> String {
    let octet = (existing_channels % 254) + 1;
    format!("239.1.1.{octet}:{DEFAULT_MULTICAST_PORT}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn parses_multicast_group() {
        let addr = MulticastAddr::parse("239.1.1.1:5000").unwrap();
        assert_eq!(addr.group(), Ipv4Addr::new(239, 1, 1, 1));
        assert_eq!(addr.port(), 5000);
        assert_eq!(addr.to_string(), "239.1.1.1:5000");
    }

    #[test]
    fn rejects_unicast_and_garbage() {
        assert_matches!(MulticastAddr::parse("10.0.0.1:5000"), Err(CoreError::Validation(_)));
        assert_matches!(MulticastAddr::parse("239.1.1.1"), Err(CoreError::Validation(_)));
        assert_matches!(MulticastAddr::parse("239.1.1.1:0"), Err(CoreError::Validation(_)));
        assert_matches!(MulticastAddr::parse("group:5000"), Err(CoreError::Validation(_)));
    }

    #[test]
    fn relay_and_capture_urls() {
        let addr = MulticastAddr::parse("239.1.1.7:5001").unwrap();
        assert_eq!(addr.relay_target(), "udp://239.1.1.7:5001?pkt_size=1316&ttl=5");
        assert_eq!(addr.capture_source(), "udp://@239.1.1.7:5001");
    }

    #[test]
    fn suggestion_increments_per_channel() {
        assert_eq!(suggest_next(0), "239.1.1.1:5000");
        assert_eq!(suggest_next(3), "239.1.1.4:5000");
        assert_eq!(suggest_next(254), "239.1.1.1:5000");
    }
}
