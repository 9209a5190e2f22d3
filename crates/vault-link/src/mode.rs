use std::fmt;
use std::net::IpAddr;

/// Which physical transport a session uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// The vault answers HTTP on the same machine.
    Local,
    /// The vault is only reachable over a peer channel.
    Remote,
}

impl TransportMode {
    /// Local when the client itself is served from a loopback host.
    pub fn from_host(host: &str) -> Self {
        let host = host.trim().trim_start_matches('[').trim_end_matches(']');
        if host.eq_ignore_ascii_case("localhost") {
            return TransportMode::Local;
        }
        match host.parse::<IpAddr>() {
            Ok(addr) if addr.is_loopback() => TransportMode::Local,
            _ => TransportMode::Remote,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransportMode::Local => "local",
            TransportMode::Remote => "remote",
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
