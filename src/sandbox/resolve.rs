/// Host name resolution used by connection checks
use std::collections::BTreeMap;
use std::net::{IpAddr, ToSocketAddrs};

pub trait HostResolver: Send + Sync {
    /// Every address `host` resolves to. Empty when resolution fails.
    fn resolve(&self, host: &str) -> Vec<IpAddr>;
}

/// Resolver backed by the system's name service
pub struct SystemResolver;

impl HostResolver for SystemResolver {
    fn resolve(&self, host: &str) -> Vec<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return vec![ip];
        }
        match (host, 0u16).to_socket_addrs() {
            Ok(addrs) => {
                let mut ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
                ips.sort();
                ips.dedup();
                ips
            }
            Err(e) => {
                log::debug!("Could not resolve {}: {}", host, e);
                Vec::new()
            }
        }
    }
}

/// Fixed host table, for hosts without name service.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    table: BTreeMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: &str, ips: &[IpAddr]) -> Self {
        self.table
            .entry(host.to_ascii_lowercase())
            .or_default()
            .extend_from_slice(ips);
        self
    }
}

impl HostResolver for StaticResolver {
    fn resolve(&self, host: &str) -> Vec<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return vec![ip];
        }
        self.table
            .get(&host.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_addresses_resolve_to_themselves() {
        let ip: IpAddr = "10.0.0.7".parse().unwrap();
        assert_eq!(SystemResolver.resolve("10.0.0.7"), vec![ip]);
        assert_eq!(StaticResolver::new().resolve("10.0.0.7"), vec![ip]);
    }

    #[test]
    fn test_static_table_is_case_insensitive() {
        let ip: IpAddr = "192.0.2.1".parse().unwrap();
        let resolver = StaticResolver::new().with_host("Games.Example.org", &[ip]);
        assert_eq!(resolver.resolve("games.example.ORG"), vec![ip]);
        assert!(resolver.resolve("other.example.org").is_empty());
    }
}
