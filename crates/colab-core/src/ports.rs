//! Port allocation: bind the configured port, falling back to nearby ports.
//!
//! The candidate sequence starts with up to five sequential ports so the common
//! "port busy" case stays predictable, then fills the retry budget with random ports
//! near the base. Candidates are not deduplicated, so a duplicate simply costs one
//! attempt; the total number of attempts is always `retries + 1`.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use rand::Rng;
use tracing::{debug, info, warn};

use crate::error::BindError;

const SEQUENTIAL_CANDIDATES: usize = 5;

/// The address and port actually bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundEndpoint {
    /// `None` when listening on all interfaces.
    pub address: Option<IpAddr>,
    pub port: u16,
    pub secure: bool,
}

impl BoundEndpoint {
    pub fn scheme(&self) -> &'static str {
        if self.secure {
            "https"
        } else {
            "http"
        }
    }

    /// Hostname clients should use to connect.
    pub fn hostname(&self) -> String {
        match self.address {
            Some(ip) => ip.to_string(),
            None => "localhost".to_string(),
        }
    }

    /// URL for humans; spells out the all-interfaces case.
    pub fn display_url(&self) -> String {
        match self.address {
            Some(ip) => self.url_for(&host_literal(ip)),
            None => self.url_for("[all ip addresses on your system]"),
        }
    }

    /// URL a local client can actually connect to.
    pub fn connection_url(&self) -> String {
        match self.address {
            Some(ip) => self.url_for(&host_literal(ip)),
            None => self.url_for("localhost"),
        }
    }

    fn url_for(&self, host: &str) -> String {
        format!("{}://{}:{}", self.scheme(), host, self.port)
    }
}

fn host_literal(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{v6}]"),
    }
}

/// Something that can bind a listening socket.
pub trait Binder {
    type Listener;

    fn bind(&mut self, addr: SocketAddr) -> io::Result<Self::Listener>;
}

/// Binds real TCP sockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpBinder;

impl Binder for TcpBinder {
    type Listener = std::net::TcpListener;

    fn bind(&mut self, addr: SocketAddr) -> io::Result<Self::Listener> {
        std::net::TcpListener::bind(addr)
    }
}

/// A bound listener together with where it is bound.
#[derive(Debug)]
pub struct Bound<L> {
    pub listener: L,
    pub endpoint: BoundEndpoint,
}

/// Lazily generate `retries + 1` candidate ports around `base`.
pub fn candidate_ports<R: Rng + ?Sized>(
    base: u16,
    retries: usize,
    rng: &mut R,
) -> impl Iterator<Item = u16> + '_ {
    let total = retries.saturating_add(1);
    let sequential = total.min(SEQUENTIAL_CANDIDATES);
    // Offsets past the port range would only clamp.
    let spread = i64::from(u16::try_from(retries).unwrap_or(u16::MAX)) * 2;
    let base = i64::from(base);

    (0..total).map(move |i| {
        if i < sequential {
            clamp_port(base + i as i64)
        } else {
            clamp_port(base + rng.random_range(-spread..=spread))
        }
    })
}

fn clamp_port(port: i64) -> u16 {
    port.clamp(1, u16::MAX as i64) as u16
}

/// Bind the first available candidate port near `base`.
pub fn allocate<B: Binder>(
    binder: &mut B,
    address: Option<IpAddr>,
    base: u16,
    retries: usize,
    secure: bool,
) -> Result<Bound<B::Listener>, BindError> {
    let mut rng = rand::rng();
    allocate_from(binder, address, candidate_ports(base, retries, &mut rng), secure)
}

/// Try each candidate in order. Only "in use" and "permission denied" are retried.
pub fn allocate_from<B, I>(
    binder: &mut B,
    address: Option<IpAddr>,
    candidates: I,
    secure: bool,
) -> Result<Bound<B::Listener>, BindError>
where
    B: Binder,
    I: IntoIterator<Item = u16>,
{
    let ip = address.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let mut attempts = 0;

    for port in candidates {
        attempts += 1;
        match binder.bind(SocketAddr::new(ip, port)) {
            Ok(listener) => {
                debug!(port, "bound listening socket");
                return Ok(Bound {
                    listener,
                    endpoint: BoundEndpoint {
                        address,
                        port,
                        secure,
                    },
                });
            }
            Err(e) => match classify(port, e) {
                BindError::Retryable { port, source } => {
                    if source.kind() == io::ErrorKind::PermissionDenied {
                        warn!("Permission to listen on port {} denied", port);
                    } else {
                        info!(
                            "The port {} is already in use, trying another port.",
                            port
                        );
                    }
                }
                fatal => return Err(fatal),
            },
        }
    }

    Err(BindError::NoAvailablePort { attempts })
}

fn classify(port: u16, source: io::Error) -> BindError {
    match source.kind() {
        io::ErrorKind::AddrInUse | io::ErrorKind::PermissionDenied => {
            BindError::Retryable { port, source }
        }
        _ => BindError::Fatal { port, source },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Fails with the configured error for listed ports, succeeds elsewhere.
    struct FakeBinder {
        busy: Vec<u16>,
        kind: io::ErrorKind,
        attempts: Vec<u16>,
    }

    impl FakeBinder {
        fn new(busy: Vec<u16>, kind: io::ErrorKind) -> Self {
            Self {
                busy,
                kind,
                attempts: vec![],
            }
        }
    }

    impl Binder for FakeBinder {
        type Listener = u16;

        fn bind(&mut self, addr: SocketAddr) -> io::Result<u16> {
            self.attempts.push(addr.port());
            if self.busy.contains(&addr.port()) {
                Err(io::Error::from(self.kind))
            } else {
                Ok(addr.port())
            }
        }
    }

    #[test]
    fn test_candidate_count_and_sequential_prefix() {
        let mut rng = StdRng::seed_from_u64(7);
        for n in [0usize, 1, 3, 4, 5, 10, 50] {
            let ports: Vec<u16> = candidate_ports(8844, n, &mut rng).collect();
            assert_eq!(ports.len(), n + 1, "retries={n}");
            let sequential = (n + 1).min(5);
            for (i, port) in ports.iter().take(sequential).enumerate() {
                assert_eq!(*port, 8844 + i as u16);
            }
        }
    }

    #[test]
    fn test_random_candidates_within_spread() {
        let mut rng = StdRng::seed_from_u64(42);
        let n = 20;
        let ports: Vec<u16> = candidate_ports(8844, n, &mut rng).collect();
        for port in &ports[5..] {
            assert!((8844 - 40..=8844 + 40).contains(port), "{port} out of range");
        }
    }

    #[test]
    fn test_candidates_clamped_to_valid_range() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(candidate_ports(1, 30, &mut rng).all(|p| p >= 1));
        let high: Vec<u16> = candidate_ports(u16::MAX - 1, 10, &mut rng).collect();
        assert_eq!(high[0], u16::MAX - 1);
        assert_eq!(high[1], u16::MAX);
        assert_eq!(high[2], u16::MAX);
    }

    #[test]
    fn test_duplicate_candidates_are_kept() {
        // Repeats are not removed; each one costs an attempt.
        let mut rng = StdRng::seed_from_u64(3);
        let ports: Vec<u16> = candidate_ports(100, 1, &mut rng).collect();
        assert_eq!(ports, vec![100, 101]);

        let ports: Vec<u16> = candidate_ports(100, 200, &mut rng).collect();
        let mut unique = ports.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(ports.len(), 201);
        assert!(unique.len() < ports.len());
    }

    #[test]
    fn test_huge_retry_budget_is_generated_lazily() {
        let mut rng = StdRng::seed_from_u64(9);
        let ports: Vec<u16> = candidate_ports(8844, usize::MAX, &mut rng).take(1000).collect();
        assert_eq!(ports.len(), 1000);
        assert_eq!(&ports[..5], &[8844, 8845, 8846, 8847, 8848]);
        assert!(ports.iter().all(|p| *p >= 1));

        let mut binder = FakeBinder::new(vec![9000], io::ErrorKind::AddrInUse);
        let bound = allocate(&mut binder, None, 9000, usize::MAX, false).unwrap();
        assert_eq!(bound.endpoint.port, 9001);
        assert_eq!(binder.attempts, vec![9000, 9001]);
    }

    #[test]
    fn test_allocate_skips_busy_ports() {
        let mut binder = FakeBinder::new(vec![9000, 9001, 9002], io::ErrorKind::AddrInUse);
        let bound = allocate(&mut binder, None, 9000, 10, false).unwrap();
        assert_eq!(bound.endpoint.port, 9003);
        assert_eq!(bound.listener, 9003);
        assert_eq!(binder.attempts, vec![9000, 9001, 9002, 9003]);
    }

    #[test]
    fn test_permission_denied_is_retryable() {
        let mut binder = FakeBinder::new(vec![80], io::ErrorKind::PermissionDenied);
        let bound = allocate(&mut binder, None, 80, 2, true).unwrap();
        assert_eq!(bound.endpoint.port, 81);
        assert!(bound.endpoint.secure);
    }

    #[test]
    fn test_other_errors_are_fatal() {
        let mut binder = FakeBinder::new(vec![9000], io::ErrorKind::AddrNotAvailable);
        let err = allocate(&mut binder, None, 9000, 10, false).unwrap_err();
        assert!(matches!(err, BindError::Fatal { port: 9000, .. }));
        assert_eq!(binder.attempts.len(), 1);
    }

    #[test]
    fn test_exhaustion_reports_no_available_port() {
        let candidates: Vec<u16> = (9000..9006).collect();
        let mut binder = FakeBinder::new(candidates.clone(), io::ErrorKind::AddrInUse);
        let err = allocate_from(&mut binder, None, candidates.clone(), false).unwrap_err();
        assert!(matches!(err, BindError::NoAvailablePort { attempts: 6 }));
        assert_eq!(binder.attempts, candidates);
    }

    #[test]
    fn test_duplicates_each_cost_an_attempt() {
        let candidates = [9000, 9000, 9000];
        let mut binder = FakeBinder::new(vec![9000], io::ErrorKind::AddrInUse);
        let err = allocate_from(&mut binder, None, candidates, false).unwrap_err();
        assert!(matches!(err, BindError::NoAvailablePort { attempts: 3 }));
        assert_eq!(binder.attempts.len(), 3);
    }

    #[test]
    fn test_real_socket_in_use_is_retried() {
        let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let busy = held.local_addr().unwrap().port();
        let ip = Some(IpAddr::from([127, 0, 0, 1]));
        let err = allocate_from(&mut TcpBinder, ip, [busy, busy], false).unwrap_err();
        assert!(matches!(err, BindError::NoAvailablePort { attempts: 2 }));
    }

    #[test]
    fn test_urls() {
        let endpoint = BoundEndpoint {
            address: None,
            port: 8844,
            secure: false,
        };
        assert_eq!(endpoint.connection_url(), "http://localhost:8844");
        assert_eq!(
            endpoint.display_url(),
            "http://[all ip addresses on your system]:8844"
        );
        assert_eq!(endpoint.hostname(), "localhost");

        let v6 = BoundEndpoint {
            address: Some("::1".parse().unwrap()),
            port: 443,
            secure: true,
        };
        assert_eq!(v6.connection_url(), "https://[::1]:443");
        assert_eq!(v6.hostname(), "::1");
    }
}
