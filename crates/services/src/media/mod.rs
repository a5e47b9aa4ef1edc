pub mod codecs;
pub mod consumer_registry;
pub mod producer_registry;
pub mod router_registry;
pub mod transport_registry;
pub mod worker_pool;

use mediasoup::prelude::MediaKind;

pub fn kind_str(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Audio => "audio",
        MediaKind::Video => "video",
    }
}

/// First usable IPv4 on a physical interface; used when no announced IP is
/// configured. Loopback and container bridges never reach clients.
pub fn detect_announced_ip() -> Option<String> {
    let addrs = nix::ifaddrs::getifaddrs().ok()?;
    for ifaddr in addrs {
        let name = &ifaddr.interface_name;
        if name == "lo"
            || name.starts_with("docker")
            || name.starts_with("br-")
            || name.starts_with("veth")
        {
            continue;
        }
        if let Some(sin) = ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in()) {
            let ip = sin.ip();
            if !ip.is_loopback() {
                return Some(ip.to_string());
            }
        }
    }
    None
}
