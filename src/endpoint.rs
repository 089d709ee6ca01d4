//! Value-type wrapper over an IPv4 or IPv6 socket address.
//!
//! Grounded on `original_source/annety/include/EndPoint.h` and the Rust
//! treatment of the same idea in
//! `examples/SleepingPills-bushhammer/.../neutronium/src/net/endpoint.rs`.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

/// A value-type IPv4 or IPv6 socket address. Standard-layout, trivially
/// copyable (wraps `std::net::SocketAddr`, itself a plain value type).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint(SocketAddr);

impl Endpoint {
    /// Binds to `port` on all interfaces, or loopback only if requested.
    pub fn new(port: u16, loopback_only: bool, ipv6: bool) -> Self {
        let ip = if ipv6 {
            if loopback_only {
                IpAddr::V6(Ipv6Addr::LOCALHOST)
            } else {
                IpAddr::V6(Ipv6Addr::UNSPECIFIED)
            }
        } else if loopback_only {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        };
        Endpoint(SocketAddr::new(ip, port))
    }

    pub fn from_ip_port(ip: &str, port: u16) -> io::Result<Self> {
        let addr: IpAddr = ip
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid ip address"))?;
        Ok(Endpoint(SocketAddr::new(addr, port)))
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Endpoint(addr)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    pub fn to_ip(&self) -> String {
        self.0.ip().to_string()
    }

    pub fn to_ip_port(&self) -> String {
        format!("{}:{}", self.0.ip(), self.0.port())
    }

    pub fn family(&self) -> Family {
        match self.0 {
            SocketAddr::V4(_) => Family::V4,
            SocketAddr::V6(_) => Family::V6,
        }
    }

    /// Raw `sockaddr_storage` usable with `bind`/`connect`/`sendto`.
    pub fn as_sockaddr_storage(&self) -> (libc::sockaddr_storage, libc::socklen_t) {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let len = match self.0 {
            SocketAddr::V4(v4) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: v4.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(v4.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                unsafe {
                    std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
                }
                std::mem::size_of::<libc::sockaddr_in>()
            }
            SocketAddr::V6(v6) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: v6.port().to_be(),
                    sin6_flowinfo: v6.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: v6.ip().octets(),
                    },
                    sin6_scope_id: v6.scope_id(),
                };
                unsafe {
                    std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
                }
                std::mem::size_of::<libc::sockaddr_in6>()
            }
        };
        (storage, len as libc::socklen_t)
    }

    /// Thread-safe blocking resolve of a host/service pair to an address.
    /// Leaves `port` untouched on failure (returns `Err` without mutating
    /// any output).
    pub fn resolve(node: &str, service_port: u16) -> io::Result<Endpoint> {
        let query = format!("{}:{}", node, service_port);
        let mut addrs = query.to_socket_addrs()?;
        addrs
            .next()
            .map(Endpoint::from_socket_addr)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address resolved"))
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_ip_port())
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Endpoint(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_ipv4() {
        let ep = Endpoint::from_ip_port("127.0.0.1", 1669).unwrap();
        assert_eq!(ep.to_ip_port(), "127.0.0.1:1669");
        assert_eq!(ep.family(), Family::V4);
        assert_eq!(ep.port(), 1669);
    }

    #[test]
    fn round_trip_ipv6() {
        let ep = Endpoint::from_ip_port("::1", 9999).unwrap();
        assert_eq!(ep.family(), Family::V6);
        assert_eq!(ep.port(), 9999);
    }

    #[test]
    fn loopback_only_binds_localhost() {
        let ep = Endpoint::new(0, true, false);
        assert_eq!(ep.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn resolve_localhost() {
        let ep = Endpoint::resolve("localhost", 80).unwrap();
        assert_eq!(ep.port(), 80);
    }
}
