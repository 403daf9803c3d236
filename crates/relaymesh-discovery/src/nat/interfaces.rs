//! Local network interface enumeration.
//!
//! Interface addresses are advertised next to the external address so that
//! nodes in the same network can connect without going through a NAT.

use crate::error::{DiscoveryError, Result};
use relaymesh_core::Address;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Which interface addresses to report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceOptions {
    /// Report IPv4 addresses
    pub use_ipv4: bool,
    /// Report IPv6 addresses
    pub use_ipv6: bool,
    /// Include private IPv4 ranges (10/8, 172.16/12, 192.168/16)
    pub include_private_ipv4: bool,
    /// Include 127.0.0.0/8
    pub include_localhost_ipv4: bool,
    /// Include ::1
    pub include_localhost_ipv6: bool,
    /// Only consider this interface
    pub interface: Option<String>,
}

impl Default for InterfaceOptions {
    fn default() -> Self {
        Self {
            use_ipv4: true,
            use_ipv6: false,
            include_private_ipv4: false,
            include_localhost_ipv4: false,
            include_localhost_ipv6: false,
            interface: None,
        }
    }
}

impl InterfaceOptions {
    /// Options used for advertised interface addresses: IPv4 including
    /// private and loopback ranges.
    #[must_use]
    pub fn local() -> Self {
        Self {
            include_private_ipv4: true,
            include_localhost_ipv4: true,
            ..Self::default()
        }
    }

    /// Validate the options
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::InvalidConfig`] if both families are
    /// disabled or if private/loopback addresses are requested for a
    /// disabled family.
    pub fn validate(&self) -> Result<()> {
        if !self.use_ipv4 && !self.use_ipv6 {
            return Err(DiscoveryError::InvalidConfig(
                "must use at least IPv4 or IPv6".to_string(),
            ));
        }

        if !self.use_ipv4 && (self.include_private_ipv4 || self.include_localhost_ipv4) {
            return Err(DiscoveryError::InvalidConfig(
                "cannot include private or localhost IPv4 addresses when IPv4 is disabled"
                    .to_string(),
            ));
        }

        if !self.use_ipv6 && self.include_localhost_ipv6 {
            return Err(DiscoveryError::InvalidConfig(
                "cannot include localhost IPv6 addresses when IPv6 is disabled".to_string(),
            ));
        }

        Ok(())
    }
}

/// One address of one local interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterface {
    /// Interface name, e.g. `eth0`
    pub name: String,
    /// Address assigned to it
    pub ip: IpAddr,
}

/// Whether `ip` lies in one of the RFC 1918 private IPv4 ranges
#[must_use]
pub fn is_private_ipv4(ip: &Ipv4Addr) -> bool {
    ip.is_private()
}

/// Whether `ip` is link-local (169.254/16 or fe80::/10)
#[must_use]
pub fn is_link_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => ip.is_link_local(),
        IpAddr::V6(ip) => (ip.segments()[0] & 0xffc0) == 0xfe80,
    }
}

/// Whether `ip` is routable on the public internet
#[must_use]
pub fn is_public(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                // Shared address space (100.64.0.0/10)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xc0) == 64))
        }
        IpAddr::V6(v6) => {
            !(v6.is_loopback()
                || v6.is_unspecified()
                || is_link_local(ip)
                // Unique local (fc00::/7)
                || (v6.segments()[0] & 0xfe00) == 0xfc00)
        }
    }
}

/// Enumerate the addresses of all local interfaces
///
/// # Errors
///
/// Returns an error if the operating system refuses to list interfaces.
#[cfg(unix)]
pub fn list_interfaces() -> std::io::Result<Vec<NetworkInterface>> {
    use std::ffi::CStr;

    let mut head: *mut libc::ifaddrs = std::ptr::null_mut();

    // SAFETY: getifaddrs writes a pointer to a heap-allocated linked list into
    // `head`, which is released with freeifaddrs below.
    if unsafe { libc::getifaddrs(&mut head) } != 0 {
        return Err(std::io::Error::last_os_error());
    }

    let mut interfaces = Vec::new();
    let mut cursor = head;
    while !cursor.is_null() {
        // SAFETY: `cursor` is a non-null node of the list returned by
        // getifaddrs and stays valid until freeifaddrs.
        let entry = unsafe { &*cursor };
        cursor = entry.ifa_next;

        if entry.ifa_addr.is_null() || entry.ifa_name.is_null() {
            continue;
        }

        // SAFETY: ifa_name is a NUL-terminated string owned by the list.
        let name = unsafe { CStr::from_ptr(entry.ifa_name) }
            .to_string_lossy()
            .into_owned();

        // SAFETY: ifa_addr is non-null; sa_family tells which sockaddr
        // variant it points to, and both casts match that variant.
        let ip = unsafe {
            match i32::from((*entry.ifa_addr).sa_family) {
                libc::AF_INET => {
                    let sin = &*(entry.ifa_addr as *const libc::sockaddr_in);
                    IpAddr::V4(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)))
                }
                libc::AF_INET6 => {
                    let sin6 = &*(entry.ifa_addr as *const libc::sockaddr_in6);
                    IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr))
                }
                _ => continue,
            }
        };

        interfaces.push(NetworkInterface { name, ip });
    }

    // SAFETY: `head` came from a successful getifaddrs call and is freed once.
    unsafe { libc::freeifaddrs(head) };

    Ok(interfaces)
}

/// Enumerate the addresses of all local interfaces
///
/// # Errors
///
/// Never fails on this platform; no interfaces are reported.
#[cfg(not(unix))]
pub fn list_interfaces() -> std::io::Result<Vec<NetworkInterface>> {
    tracing::warn!("interface enumeration is not supported on this platform");
    Ok(Vec::new())
}

/// Apply `opts` to a list of interface addresses.
///
/// Link-local addresses are always dropped, loopback and private addresses
/// only kept when requested.
///
/// # Errors
///
/// Returns an error if `opts` is invalid or names an interface that does not
/// exist.
pub fn filter_interfaces(
    interfaces: &[NetworkInterface],
    opts: &InterfaceOptions,
) -> Result<Vec<IpAddr>> {
    opts.validate()?;

    if let Some(name) = &opts.interface {
        if !interfaces.iter().any(|iface| &iface.name == name) {
            return Err(DiscoveryError::Interface(format!(
                "machine does not have requested interface {}",
                name
            )));
        }
    }

    let mut result: Vec<IpAddr> = Vec::new();
    for iface in interfaces {
        if opts.interface.as_ref().is_some_and(|name| name != &iface.name) {
            continue;
        }
        if is_link_local(&iface.ip) {
            continue;
        }

        let keep = match iface.ip {
            IpAddr::V4(ip) => {
                opts.use_ipv4
                    && (!ip.is_loopback() || opts.include_localhost_ipv4)
                    && (!is_private_ipv4(&ip) || opts.include_private_ipv4)
            }
            IpAddr::V6(ip) => opts.use_ipv6 && (!ip.is_loopback() || opts.include_localhost_ipv6),
        };

        if keep && !result.contains(&iface.ip) {
            result.push(iface.ip);
        }
    }

    Ok(result)
}

/// Addresses under which a TCP listener on `port` is reachable through the
/// local interfaces.
///
/// # Errors
///
/// Returns an error if the options are invalid or interfaces cannot be
/// listed.
pub fn get_addrs(port: u16, opts: &InterfaceOptions) -> Result<Vec<Address>> {
    let interfaces = list_interfaces()?;
    Ok(filter_interfaces(&interfaces, opts)?
        .into_iter()
        .map(|ip| Address::tcp(SocketAddr::new(ip, port)))
        .collect())
}

/// Resolve the host to bind on when the node is restricted to interface
/// `name`.
///
/// An unspecified `host` is replaced by the first non-loopback address of the
/// interface with the same family; a concrete `host` must belong to the
/// interface.
///
/// # Errors
///
/// Returns [`DiscoveryError::Interface`] if the interface has no address of
/// the right family or `host` is not one of them.
pub fn select_interface_address(
    interfaces: &[NetworkInterface],
    name: &str,
    host: IpAddr,
) -> Result<IpAddr> {
    let usable: Vec<IpAddr> = interfaces
        .iter()
        .filter(|iface| {
            iface.name == name && iface.ip.is_ipv4() == host.is_ipv4() && !iface.ip.is_loopback()
        })
        .map(|iface| iface.ip)
        .collect();

    let Some(first) = usable.first().copied() else {
        return Err(DiscoveryError::Interface(format!(
            "desired interface <{}> does not exist or does not have any external addresses",
            name
        )));
    };

    if !host.is_unspecified() && !usable.contains(&host) {
        return Err(DiscoveryError::Interface(format!(
            "could not bind to interface {} on address {} because it was configured with different addresses: {:?}",
            name, host, usable
        )));
    }

    if host.is_unspecified() { Ok(first) } else { Ok(host) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(name: &str, ip: &str) -> NetworkInterface {
        NetworkInterface {
            name: name.to_string(),
            ip: ip.parse().unwrap(),
        }
    }

    fn sample() -> Vec<NetworkInterface> {
        vec![
            iface("lo", "127.0.0.1"),
            iface("lo", "::1"),
            iface("eth0", "192.168.1.20"),
            iface("eth0", "fe80::1"),
            iface("eth0", "2001:db8::20"),
            iface("eth1", "203.0.113.9"),
            iface("eth1", "169.254.3.3"),
        ]
    }

    #[test]
    fn test_default_keeps_public_ipv4_only() {
        let addrs = filter_interfaces(&sample(), &InterfaceOptions::default()).unwrap();
        assert_eq!(addrs, vec!["203.0.113.9".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn test_local_includes_private_and_loopback() {
        let addrs = filter_interfaces(&sample(), &InterfaceOptions::local()).unwrap();
        assert_eq!(addrs.len(), 3);
        assert!(addrs.iter().all(IpAddr::is_ipv4));
    }

    #[test]
    fn test_ipv6_without_link_local() {
        let opts = InterfaceOptions {
            use_ipv4: false,
            use_ipv6: true,
            include_localhost_ipv6: true,
            ..InterfaceOptions::default()
        };
        let addrs = filter_interfaces(&sample(), &opts).unwrap();
        assert_eq!(
            addrs,
            vec![
                "::1".parse::<IpAddr>().unwrap(),
                "2001:db8::20".parse().unwrap()
            ]
        );
    }

    #[test]
    fn test_interface_restriction() {
        let opts = InterfaceOptions {
            include_private_ipv4: true,
            interface: Some("eth0".to_string()),
            ..InterfaceOptions::default()
        };
        let addrs = filter_interfaces(&sample(), &opts).unwrap();
        assert_eq!(addrs, vec!["192.168.1.20".parse::<IpAddr>().unwrap()]);

        let missing = InterfaceOptions {
            interface: Some("wlan7".to_string()),
            ..InterfaceOptions::default()
        };
        assert!(matches!(
            filter_interfaces(&sample(), &missing),
            Err(DiscoveryError::Interface(_))
        ));
    }

    #[test]
    fn test_invalid_options() {
        let none = InterfaceOptions {
            use_ipv4: false,
            ..InterfaceOptions::default()
        };
        assert!(none.validate().is_err());

        let private_without_v4 = InterfaceOptions {
            use_ipv4: false,
            use_ipv6: true,
            include_private_ipv4: true,
            ..InterfaceOptions::default()
        };
        assert!(private_without_v4.validate().is_err());

        let lo6_without_v6 = InterfaceOptions {
            include_localhost_ipv6: true,
            ..InterfaceOptions::default()
        };
        assert!(lo6_without_v6.validate().is_err());
    }

    #[test]
    fn test_select_interface_address() {
        let ifaces = sample();
        let any: IpAddr = "0.0.0.0".parse().unwrap();

        assert_eq!(
            select_interface_address(&ifaces, "eth0", any).unwrap(),
            "192.168.1.20".parse::<IpAddr>().unwrap()
        );
        assert!(select_interface_address(&ifaces, "eth0", "10.0.0.1".parse().unwrap()).is_err());
        assert!(select_interface_address(&ifaces, "lo", any).is_err());
    }

    #[test]
    fn test_is_public() {
        assert!(is_public(&"1.2.3.4".parse().unwrap()));
        assert!(!is_public(&"10.1.2.3".parse().unwrap()));
        assert!(!is_public(&"127.0.0.1".parse().unwrap()));
        assert!(!is_public(&"100.64.1.1".parse().unwrap()));
        assert!(!is_public(&"fd00::1".parse().unwrap()));
        assert!(is_public(&"2a00:1450::1".parse().unwrap()));
    }

    #[cfg(unix)]
    #[test]
    fn test_list_interfaces_has_loopback() {
        let ifaces = list_interfaces().unwrap();
        assert!(ifaces.iter().any(|i| i.ip.is_loopback()));
    }
}
