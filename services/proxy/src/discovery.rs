//! Best-effort discovery of file servers on the local network.
//!
//! Every local IPv4 address is assumed to live in a /24 network: the sweep covers `.1` to `.254`
//! of each block, whatever the real netmask is. Filtered ports and slow hosts are simply missed.

use std::{
    collections::HashSet,
    future::Future,
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use futures_util::future::join_all;
use tokio::net::TcpStream;

/// The well-known port of the upstream file server.
pub const DEFAULT_PORT: u16 = 3923;
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(200);
/// Upper bound of concurrent connection attempts.
pub const DEFAULT_BATCH_SIZE: usize = 50;

#[derive(Debug, Clone, Copy)]
pub struct ScanSettings {
    pub port: u16,
    pub timeout: Duration,
    pub batch_size: usize,
}

impl Default for ScanSettings {
    fn default() -> Self {
        ScanSettings {
            port: DEFAULT_PORT,
            timeout: DEFAULT_PROBE_TIMEOUT,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Placeholder targets used by the demo mode never trigger a scan.
pub fn is_demo_target(server_url: &str) -> bool {
    server_url.trim().starts_with("demo://")
}

/// The non-loopback IPv4 addresses bound to the local interfaces.
pub fn local_ipv4_addrs() -> io::Result<Vec<Ipv4Addr>> {
    let addrs = if_addrs::get_if_addrs()?
        .into_iter()
        .filter(|iface| !iface.is_loopback())
        .filter_map(|iface| match iface.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
        .collect();
    Ok(addrs)
}

/// Loopback first, then every host of the /24 block of each local address, without duplicates.
pub fn candidates(local_addrs: &[Ipv4Addr]) -> Vec<Ipv4Addr> {
    let mut seen = HashSet::new();
    let mut candidates = Vec::new();
    let mut push = |ip: Ipv4Addr| {
        if seen.insert(ip) {
            candidates.push(ip);
        }
    };
    push(Ipv4Addr::LOCALHOST);
    for local in local_addrs {
        let [a, b, c, _] = local.octets();
        for host in 1..=254 {
            push(Ipv4Addr::new(a, b, c, host));
        }
    }
    candidates
}

/// Whether `addr` accepts a TCP connection on `port` within `timeout`.
pub async fn probe(addr: Ipv4Addr, port: u16, timeout: Duration) -> bool {
    let target = SocketAddr::new(IpAddr::V4(addr), port);
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(target)).await,
        Ok(Ok(_))
    )
}

/// Run `probe` over the candidates, `batch_size` at a time, and return the ones that answered.
/// Batches run one after the other; the probes of a batch run concurrently.
pub async fn sweep<F, Fut>(candidates: &[Ipv4Addr], batch_size: usize, probe: F) -> Vec<Ipv4Addr>
where
    F: Fn(Ipv4Addr) -> Fut,
    Fut: Future<Output = bool>,
{
    let mut found = Vec::new();
    let mut seen = HashSet::new();
    for batch in candidates.chunks(batch_size.max(1)) {
        let results = join_all(batch.iter().map(|ip| {
            let check = probe(*ip);
            async move { (*ip, check.await) }
        }))
        .await;
        for (ip, open) in results {
            if open && seen.insert(ip) {
                found.push(ip);
            }
        }
    }
    found
}

/// Sweep the local networks for servers listening on the configured port.
pub async fn scan(settings: ScanSettings) -> io::Result<Vec<Ipv4Addr>> {
    let local_addrs = local_ipv4_addrs()?;
    let candidates = candidates(&local_addrs);
    log::debug!(
        "Scanning {} candidates from local addresses `{:?}` on port {}",
        candidates.len(),
        local_addrs,
        settings.port
    );
    let found = sweep(&candidates, settings.batch_size, |ip| {
        probe(ip, settings.port, settings.timeout)
    })
    .await;
    log::info!("LAN scan found {} server(s): `{:?}`", found.len(), found);
    Ok(found)
}
