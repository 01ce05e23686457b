//! Server addresses a connection transport dials, and `fmprpc://` URIs.

use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use rand::seq::SliceRandom;

use crate::error::{Result, RpcError};

/// A source of `host:port` addresses to dial.
pub trait Remote: Send + Sync + fmt::Display {
    /// The address to dial now. Successive calls may rotate through peers.
    fn get_address(&self) -> String;

    /// The address the next [`Remote::get_address`] would return.
    fn peek(&self) -> String;

    /// Called after a connection succeeds; rotation starts over.
    fn reset(&self);
}

/// Splits `host:port`, accepting bracketed IPv6 hosts.
pub fn split_host_port(addr: &str) -> Result<(&str, u16)> {
    let invalid = |reason: &str| RpcError::InvalidAddress {
        addr: addr.to_string(),
        reason: reason.to_string(),
    };
    let (host, port) = addr.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
    if host.is_empty() {
        return Err(invalid("missing host"));
    }
    let port = port.parse::<u16>().map_err(|_| invalid("invalid port"))?;
    Ok((host, port))
}

/// Always the same address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingleRemote {
    addr: String,
}

impl SingleRemote {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

impl fmt::Display for SingleRemote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.addr)
    }
}

impl Remote for SingleRemote {
    fn get_address(&self) -> String {
        self.addr.clone()
    }

    fn peek(&self) -> String {
        self.addr.clone()
    }

    fn reset(&self) {}
}

#[derive(Debug)]
struct Rotation {
    order: Vec<String>,
    next: usize,
}

/// Peers in priority groups. Each group is shuffled, and all peers of a
/// group are tried before any peer of the next. Once every peer has been
/// handed out the rotation wraps to the first group again.
///
/// Parsed from `"a:1,b:2;c:3"`: `;` separates groups and `,` separates
/// peers inside a group.
#[derive(Debug)]
pub struct PrioritizedRoundRobinRemote {
    groups: Vec<Vec<String>>,
    rotation: Mutex<Rotation>,
}

impl PrioritizedRoundRobinRemote {
    pub fn new(groups: Vec<Vec<String>>) -> Result<Self> {
        let groups: Vec<Vec<String>> = groups.into_iter().filter(|g| !g.is_empty()).collect();
        if groups.is_empty() {
            return Err(RpcError::InvalidAddress {
                addr: String::new(),
                reason: "no addresses".to_string(),
            });
        }
        for addr in groups.iter().flatten() {
            split_host_port(addr)?;
        }
        let order = shuffled(&groups);
        Ok(Self {
            groups,
            rotation: Mutex::new(Rotation { order, next: 0 }),
        })
    }

    pub fn parse(s: &str) -> Result<Self> {
        let groups = s
            .split(';')
            .map(|group| {
                group
                    .split(',')
                    .map(str::trim)
                    .filter(|a| !a.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .collect();
        Self::new(groups).map_err(|e| match e {
            RpcError::InvalidAddress { addr, reason } if addr.is_empty() => {
                RpcError::InvalidAddress {
                    addr: s.to_string(),
                    reason,
                }
            }
            other => other,
        })
    }

    pub fn groups(&self) -> &[Vec<String>] {
        &self.groups
    }

    /// Number of distinct peers across all groups.
    pub fn len(&self) -> usize {
        self.groups.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn shuffled(groups: &[Vec<String>]) -> Vec<String> {
    let mut rng = rand::thread_rng();
    groups
        .iter()
        .flat_map(|group| {
            let mut group = group.clone();
            group.shuffle(&mut rng);
            group
        })
        .collect()
}

impl FromStr for PrioritizedRoundRobinRemote {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for PrioritizedRoundRobinRemote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let groups: Vec<String> = self.groups.iter().map(|g| g.join(",")).collect();
        f.write_str(&groups.join(";"))
    }
}

impl Remote for PrioritizedRoundRobinRemote {
    fn get_address(&self) -> String {
        let mut rotation = self.rotation.lock().unwrap_or_else(PoisonError::into_inner);
        let addr = rotation.order[rotation.next].clone();
        rotation.next = (rotation.next + 1) % rotation.order.len();
        addr
    }

    fn peek(&self) -> String {
        let rotation = self.rotation.lock().unwrap_or_else(PoisonError::into_inner);
        rotation.order[rotation.next].clone()
    }

    fn reset(&self) {
        let mut rotation = self.rotation.lock().unwrap_or_else(PoisonError::into_inner);
        rotation.order = shuffled(&self.groups);
        rotation.next = 0;
    }
}

/// URI scheme of an [`FmpUri`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Plain,
    Tls,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Plain => "fmprpc",
            Scheme::Tls => "fmprpc+tls",
        }
    }
}

/// `fmprpc://host:port` or `fmprpc+tls://host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FmpUri {
    scheme: Scheme,
    host_port: String,
}

impl FmpUri {
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = |reason: &str| RpcError::InvalidAddress {
            addr: s.to_string(),
            reason: reason.to_string(),
        };
        let (scheme, rest) = s.split_once("://").ok_or_else(|| invalid("missing scheme"))?;
        let scheme = match scheme.to_ascii_lowercase().as_str() {
            "fmprpc" => Scheme::Plain,
            "fmprpc+tls" => Scheme::Tls,
            _ => return Err(invalid("unknown scheme")),
        };
        let host_port = rest.trim_end_matches('/');
        if host_port.contains('/') {
            return Err(invalid("unexpected path"));
        }
        split_host_port(host_port)?;
        Ok(Self {
            scheme,
            host_port: host_port.to_string(),
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn use_tls(&self) -> bool {
        self.scheme == Scheme::Tls
    }

    pub fn host_port(&self) -> &str {
        &self.host_port
    }

    pub fn host(&self) -> &str {
        self.host_port
            .rsplit_once(':')
            .map(|(h, _)| h)
            .unwrap_or(&self.host_port)
    }

    pub fn remote(&self) -> SingleRemote {
        SingleRemote::new(self.host_port.clone())
    }
}

impl FromStr for FmpUri {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for FmpUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme.as_str(), self.host_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_single_remote() {
        let r = SingleRemote::new("localhost:4000");
        assert_eq!(r.get_address(), "localhost:4000");
        assert_eq!(r.peek(), "localhost:4000");
        r.reset();
        assert_eq!(r.to_string(), "localhost:4000");
    }

    #[test]
    fn test_parse_groups() {
        let r = PrioritizedRoundRobinRemote::parse("a:1, b:2;c:3").unwrap();
        assert_eq!(r.groups().len(), 2);
        assert_eq!(r.len(), 3);
        assert_eq!(r.to_string(), "a:1,b:2;c:3");
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(PrioritizedRoundRobinRemote::parse("").is_err());
        assert!(PrioritizedRoundRobinRemote::parse(";;").is_err());
        assert!(PrioritizedRoundRobinRemote::parse("a:1;nope").is_err());
        assert!(PrioritizedRoundRobinRemote::parse("a:99999").is_err());
    }

    #[test]
    fn test_peek_matches_next_address() {
        let r = PrioritizedRoundRobinRemote::parse("a:1,b:2,c:3").unwrap();
        for _ in 0..6 {
            let peeked = r.peek();
            assert_eq!(r.get_address(), peeked);
        }
    }

    #[test]
    fn test_reset_restarts_at_first_group() {
        let r = PrioritizedRoundRobinRemote::parse("a:1;b:2").unwrap();
        assert_eq!(r.get_address(), "a:1");
        assert_eq!(r.peek(), "b:2");
        r.reset();
        assert_eq!(r.get_address(), "a:1");
    }

    #[test]
    fn test_uri_parse() {
        let uri = FmpUri::parse("fmprpc+tls://example.com:443").unwrap();
        assert!(uri.use_tls());
        assert_eq!(uri.host(), "example.com");
        assert_eq!(uri.host_port(), "example.com:443");
        assert_eq!(uri.to_string(), "fmprpc+tls://example.com:443");

        let plain: FmpUri = "fmprpc://127.0.0.1:4000/".parse().unwrap();
        assert_eq!(plain.scheme(), Scheme::Plain);
        assert_eq!(plain.remote().get_address(), "127.0.0.1:4000");
    }

    #[test]
    fn test_uri_rejects_bad_input() {
        assert!(FmpUri::parse("http://a:1").is_err());
        assert!(FmpUri::parse("fmprpc://a").is_err());
        assert!(FmpUri::parse("a:1").is_err());
        assert!(FmpUri::parse("fmprpc://a:1/path").is_err());
    }

    fn groups_strategy() -> impl Strategy<Value = Vec<Vec<String>>> {
        prop::collection::vec(1usize..5, 1..5).prop_map(|sizes| {
            let mut port = 1000u16;
            sizes
                .into_iter()
                .map(|n| {
                    (0..n)
                        .map(|_| {
                            port += 1;
                            format!("host:{}", port)
                        })
                        .collect()
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn prop_rotation_exhausts_groups_in_priority_order(groups in groups_strategy()) {
            let r = PrioritizedRoundRobinRemote::new(groups.clone()).unwrap();
            let total = r.len();
            for _round in 0..2 {
                let handed: Vec<String> = (0..total).map(|_| r.get_address()).collect();
                let unique: HashSet<&String> = handed.iter().collect();
                prop_assert_eq!(unique.len(), total);

                let mut offset = 0;
                for group in &groups {
                    let slice: HashSet<&String> = handed[offset..offset + group.len()].iter().collect();
                    let expected: HashSet<&String> = group.iter().collect();
                    prop_assert_eq!(slice, expected);
                    offset += group.len();
                }
            }
        }
    }
}
