//! External address determination.
//!
//! A random subset of the candidate STUN servers is asked in parallel which
//! address our packets arrive from. If fewer than two of them answer, the
//! public fallback servers are asked as well. The external address is only
//! accepted if every answer agrees on address and port: different answers
//! mean the NAT maps each destination to its own port (symmetric NAT), which
//! makes the observed address useless to other peers.

use super::interfaces::is_public;
use super::stun::{STUN_TIMEOUT, StunSocket};
use futures::future::join_all;
use rand::seq::SliceRandom;
use std::net::SocketAddr;
use std::time::Duration;

/// Number of candidate servers asked in the first round
pub const DEFAULT_STUN_SUBSET: usize = 4;

/// Answers needed before the fallback servers are skipped
pub const MIN_STUN_RESPONSES: usize = 2;

/// Public STUN servers asked when the candidates do not answer
pub const PUBLIC_STUN_SERVERS: &[&str] = &[
    "stun.l.google.com:19302",
    "stun1.l.google.com:19302",
    "stun2.l.google.com:19302",
    "stun3.l.google.com:19302",
    "stun4.l.google.com:19302",
    "stun.cloudflare.com:3478",
    "stun.nextcloud.com:443",
    "stun.sipgate.net:3478",
];

/// External address determination settings
#[derive(Debug, Clone)]
pub struct ExternalAddressConfig {
    /// Number of candidate servers asked in parallel
    pub subset_size: usize,
    /// Timeout per binding request
    pub timeout: Duration,
    /// Answers below which the fallback servers are asked
    pub min_responses: usize,
    /// Fallback servers as `host:port`, resolved on demand
    pub fallback_servers: Vec<String>,
    /// Accept private and loopback results (local test networks)
    pub running_locally: bool,
}

impl Default for ExternalAddressConfig {
    fn default() -> Self {
        Self {
            subset_size: DEFAULT_STUN_SUBSET,
            timeout: STUN_TIMEOUT,
            min_responses: MIN_STUN_RESPONSES,
            fallback_servers: PUBLIC_STUN_SERVERS.iter().map(ToString::to_string).collect(),
            running_locally: false,
        }
    }
}

/// Whether a STUN result can be advertised.
///
/// Only IPv4 results are used. In local mode only private and loopback
/// addresses qualify, otherwise only public ones.
#[must_use]
pub fn is_usable_result(addr: &SocketAddr, running_locally: bool) -> bool {
    match addr {
        SocketAddr::V6(_) => false,
        SocketAddr::V4(v4) => {
            let ip = v4.ip();
            if running_locally {
                ip.is_private() || ip.is_loopback()
            } else {
                is_public(&addr.ip())
            }
        }
    }
}

/// The address every response agrees on, `None` if there are no responses
/// or they differ
#[must_use]
pub fn agreed_address(responses: &[SocketAddr]) -> Option<SocketAddr> {
    let first = responses.first()?;
    responses.iter().all(|r| r == first).then_some(*first)
}

/// Determine the external address of `socket`.
///
/// `candidates` are typically other relaymesh nodes, which answer STUN on
/// their listening port. Returns `None` if no address could be determined or
/// the answers disagree.
pub async fn determine_external_address(
    socket: &StunSocket,
    candidates: &[SocketAddr],
    config: &ExternalAddressConfig,
) -> Option<SocketAddr> {
    let subset: Vec<SocketAddr> = candidates
        .choose_multiple(&mut rand::thread_rng(), config.subset_size)
        .copied()
        .collect();

    let mut responses = query(socket, &subset, config).await;
    tracing::debug!(
        "{} of {} STUN servers answered with usable results",
        responses.len(),
        subset.len()
    );

    if responses.len() < config.min_responses && !config.fallback_servers.is_empty() {
        let fallback: Vec<SocketAddr> = resolve_fallback(socket, &config.fallback_servers)
            .await
            .into_iter()
            .filter(|server| !subset.contains(server))
            .collect();

        tracing::debug!(
            "asking {} fallback STUN servers after {} usable responses",
            fallback.len(),
            responses.len()
        );
        responses.extend(query(socket, &fallback, config).await);
    }

    let agreed = agreed_address(&responses);
    match agreed {
        Some(addr) => tracing::debug!("external address is {}", addr),
        None if responses.is_empty() => tracing::debug!("no STUN server answered"),
        None => tracing::warn!(
            "STUN servers disagree on external address ({:?}), likely behind symmetric NAT",
            responses
        ),
    }
    agreed
}

async fn query(
    socket: &StunSocket,
    servers: &[SocketAddr],
    config: &ExternalAddressConfig,
) -> Vec<SocketAddr> {
    let results = join_all(
        servers
            .iter()
            .map(|server| socket.request(*server, config.timeout)),
    )
    .await;

    servers
        .iter()
        .zip(results)
        .filter_map(|(server, result)| match result {
            Ok(addr) if is_usable_result(&addr, config.running_locally) => Some(addr),
            Ok(addr) => {
                tracing::trace!("STUN server {} returned unusable {}", server, addr);
                None
            }
            Err(e) => {
                tracing::trace!("STUN request to {} failed: {}", server, e);
                None
            }
        })
        .collect()
}

/// Resolve fallback host names to addresses of the socket's family
async fn resolve_fallback(socket: &StunSocket, hosts: &[String]) -> Vec<SocketAddr> {
    let want_ipv4 = socket.local_addr().map(|a| a.is_ipv4()).unwrap_or(true);

    let lookups = join_all(hosts.iter().map(|host| tokio::net::lookup_host(host.as_str()))).await;

    let mut resolved = Vec::new();
    for (host, lookup) in hosts.iter().zip(lookups) {
        match lookup {
            Ok(addrs) => {
                if let Some(addr) = addrs.into_iter().find(|a| a.is_ipv4() == want_ipv4) {
                    resolved.push(addr);
                }
            }
            Err(e) => tracing::debug!("could not resolve STUN server {}: {}", host, e),
        }
    }
    resolved
}
