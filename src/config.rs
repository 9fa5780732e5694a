//! Runtime configuration: the local port range to bind and the bootstrap
//! sweep used for discovery.
//!
//! Port ranges are written `"9200-9300"` (inclusive) or as a single port.
//! Bootstrap entries are `"host:9200-9300"` and expand into the cartesian
//! product of the host and every port in the range, so a single entry can
//! sweep a whole block of candidate peers.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// An inclusive port range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self { start: port, end: port }
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }

    pub fn len(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

impl FromStr for PortRange {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let range = match s.split_once('-') {
            Some((start, end)) => Self {
                start: start.trim().parse().context("invalid range start")?,
                end: end.trim().parse().context("invalid range end")?,
            },
            None => Self::single(s.trim().parse().context("invalid port")?),
        };
        if range.end < range.start {
            anyhow::bail!("port range end {} below start {}", range.end, range.start);
        }
        Ok(range)
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// A bootstrap target: one host, a range of candidate ports.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapEntry {
    pub host: String,
    pub ports: PortRange,
}

impl FromStr for BootstrapEntry {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, ports) = s
            .rsplit_once(':')
            .context("bootstrap entry must be host:port or host:start-end")?;
        Ok(Self {
            host: host.to_string(),
            ports: ports.parse()?,
        })
    }
}

impl fmt::Display for BootstrapEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.ports)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Candidate local ports, tried in order until one binds.
    pub ports: PortRange,
    /// Discovery sweep targets.
    pub bootstrap: Vec<BootstrapEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ports: PortRange { start: 9200, end: 9300 },
            bootstrap: vec![BootstrapEntry {
                host: "localhost".to_string(),
                ports: PortRange { start: 9200, end: 9300 },
            }],
        }
    }
}

impl Config {
    /// Expand the bootstrap list into concrete socket addresses. Hosts that
    /// fail to resolve are skipped with a log line; IPv4 addresses are
    /// preferred when a name resolves to both families.
    pub fn bootstrap_addrs(&self) -> Vec<SocketAddr> {
        let mut addrs = Vec::new();
        for entry in &self.bootstrap {
            for port in entry.ports.iter() {
                let target = format!("{}:{}", entry.host, port);
                match target.to_socket_addrs() {
                    Ok(resolved) => {
                        let mut resolved: Vec<SocketAddr> = resolved.collect();
                        resolved.sort_by_key(|a| !a.is_ipv4());
                        if let Some(addr) = resolved.first() {
                            addrs.push(*addr);
                        }
                    }
                    Err(e) => {
                        debug!(target = %target, error = %e, "skipping unresolvable bootstrap entry");
                    }
                }
            }
        }
        addrs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_range() {
        let range: PortRange = "9200-9300".parse().unwrap();
        assert_eq!(range.start, 9200);
        assert_eq!(range.end, 9300);
        assert_eq!(range.len(), 101);
    }

    #[test]
    fn parses_a_single_port() {
        let range: PortRange = "9200".parse().unwrap();
        assert_eq!(range, PortRange::single(9200));
        assert_eq!(range.iter().count(), 1);
    }

    #[test]
    fn rejects_inverted_ranges() {
        assert!("9300-9200".parse::<PortRange>().is_err());
        assert!("nope".parse::<PortRange>().is_err());
    }

    #[test]
    fn bootstrap_entry_round_trip() {
        let entry: BootstrapEntry = "198.51.100.7:9200-9205".parse().unwrap();
        assert_eq!(entry.host, "198.51.100.7");
        assert_eq!(entry.ports.len(), 6);
        assert_eq!(entry.to_string().parse::<BootstrapEntry>().unwrap(), entry);
    }

    #[test]
    fn bootstrap_expansion_is_the_cartesian_product() {
        let config = Config {
            ports: PortRange::single(9200),
            bootstrap: vec![
                "127.0.0.1:9200-9202".parse().unwrap(),
                "127.0.0.2:9300".parse().unwrap(),
            ],
        };
        let addrs = config.bootstrap_addrs();
        assert_eq!(addrs.len(), 4);
        assert!(addrs.contains(&"127.0.0.1:9201".parse().unwrap()));
        assert!(addrs.contains(&"127.0.0.2:9300".parse().unwrap()));
    }
}
