//! Endpoint discovery seam

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

/// Source of candidate receiver addresses
pub trait Discovery: Send + Sync {
    fn candidates(&self) -> Vec<SocketAddr>;
}

/// Fixed list of receivers, typically from the command line or config
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    addrs: Vec<SocketAddr>,
}

impl StaticDiscovery {
    pub fn new(addrs: Vec<SocketAddr>) -> Self {
        Self { addrs }
    }

    /// Resolve `host` or `host:port` entries. Unresolvable entries are
    /// logged and skipped.
    pub fn resolve<S: AsRef<str>>(entries: &[S], default_port: u16) -> Self {
        let mut addrs = Vec::new();
        for entry in entries {
            let entry = entry.as_ref().trim();
            let resolved = if let Ok(addr) = entry.parse::<SocketAddr>() {
                Ok(vec![addr])
            } else if let Ok(ip) = entry.parse::<IpAddr>() {
                Ok(vec![SocketAddr::new(ip, default_port)])
            } else if entry.rsplit_once(':').is_some_and(|(_, port)| port.parse::<u16>().is_ok()) {
                entry.to_socket_addrs().map(|found| found.collect())
            } else {
                (entry, default_port).to_socket_addrs().map(|found| found.collect())
            };
            match resolved {
                Ok(found) => match found.into_iter().next() {
                    Some(addr) if !addrs.contains(&addr) => addrs.push(addr),
                    Some(_) => {}
                    None => tracing::warn!("{} did not resolve to an address", entry),
                },
                Err(e) => tracing::warn!("Cannot resolve {}: {}", entry, e),
            }
        }
        Self { addrs }
    }
}

impl Discovery for StaticDiscovery {
    fn candidates(&self) -> Vec<SocketAddr> {
        self.addrs.clone()
    }
}
