use std::net::{IpAddr, SocketAddr};

use axum::{extract::ConnectInfo, http::HeaderMap};
use ipnet::IpNet;

/// Forwarding headers consulted when the peer is a trusted proxy, in order.
const CLIENT_IP_HEADERS: &[&str] = &[
    "x-real-ip",
    "x-forwarded-for",
    "cf-connecting-ip",
    "true-client-ip",
];

/// Where a request really came from, and whether it arrived over TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOrigin {
    pub ip: IpAddr,
    pub https: bool,
}

pub fn is_trusted(peer: IpAddr, trusted: &[IpNet]) -> bool {
    trusted.iter().any(|net| net.contains(&peer))
}

/// Forwarding headers are honoured only when the direct peer is a trusted proxy;
/// otherwise the peer address is the answer.
pub fn resolve_client_ip(peer: IpAddr, headers: &HeaderMap, trusted: &[IpNet]) -> IpAddr {
    if !is_trusted(peer, trusted) {
        return peer;
    }
    CLIENT_IP_HEADERS
        .iter()
        .filter_map(|name| headers.get(*name)?.to_str().ok())
        // x-forwarded-for is "client, proxy1, proxy2"
        .filter_map(|value| value.split(',').next())
        .find_map(|candidate| candidate.trim().parse().ok())
        .unwrap_or(peer)
}

/// `x-forwarded-proto: https` from a trusted proxy. Direct connections are
/// plain HTTP since the server does not terminate TLS itself.
pub fn forwarded_https(peer: IpAddr, headers: &HeaderMap, trusted: &[IpNet]) -> bool {
    is_trusted(peer, trusted)
        && headers
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .is_some_and(|proto| proto.trim().eq_ignore_ascii_case("https"))
}

pub fn client_origin(
    connect_info: Option<&ConnectInfo<SocketAddr>>,
    headers: &HeaderMap,
    trusted: &[IpNet],
) -> ClientOrigin {
    let peer = connect_info
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::from([127, 0, 0, 1]));
    ClientOrigin {
        ip: resolve_client_ip(peer, headers, trusted),
        https: forwarded_https(peer, headers, trusted),
    }
}
