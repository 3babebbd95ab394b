//! Edge IP liveness and latency probing.

pub mod candidates;
mod insecure_tls;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

pub const DEFAULT_CONCURRENCY: usize = 32;
pub const TCP_TIMEOUT: Duration = Duration::from_secs(2);
pub const TLS_TIMEOUT: Duration = Duration::from_secs(4);
pub const TLS_TOP_N: usize = 6;
pub const HTTP_TOP_N: usize = 4;

/// Added to a TLS probe's latency when the reply did not look like HTTP.
const NO_SIGNAL_PENALTY_MS: f64 = 5000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMode {
    TcpOnly,
    TlsHttpProbe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Tcp,
    TlsHttp,
}

impl ProbeMode {
    pub fn kind(&self) -> ProbeKind {
        match self {
            ProbeMode::TcpOnly => ProbeKind::Tcp,
            ProbeMode::TlsHttpProbe => ProbeKind::TlsHttp,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub address: IpAddr,
    pub latency_ms: Option<f64>,
    pub reachable: bool,
    pub kind: ProbeKind,
    /// Ranking key: latency, plus a penalty for a TLS reply without an
    /// HTTP signal. Infinite when unreachable.
    pub score: f64,
}

impl ProbeResult {
    pub fn unreachable(address: IpAddr, kind: ProbeKind) -> Self {
        Self {
            address,
            latency_ms: None,
            reachable: false,
            kind,
            score: f64::INFINITY,
        }
    }

    fn reached(address: IpAddr, kind: ProbeKind, latency_ms: f64, penalty_ms: f64) -> Self {
        Self {
            address,
            latency_ms: Some(latency_ms),
            reachable: true,
            kind,
            score: latency_ms + penalty_ms,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProbeOptions {
    pub concurrency: usize,
    /// Per-probe timeout.
    pub timeout: Duration,
    /// Whole-round deadline; unfinished probes are aborted and count as unreachable.
    pub round_deadline: Option<Duration>,
    /// SNI and Host header for TLS probes. Defaults to the address itself.
    pub host: Option<String>,
    pub path: String,
}

impl ProbeOptions {
    pub fn for_mode(mode: ProbeMode) -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            timeout: match mode {
                ProbeMode::TcpOnly => TCP_TIMEOUT,
                ProbeMode::TlsHttpProbe => TLS_TIMEOUT,
            },
            round_deadline: None,
            host: None,
            path: "/".to_string(),
        }
    }

    fn deadline_for(&self, candidates: usize) -> Duration {
        self.round_deadline.unwrap_or_else(|| {
            let waves = candidates.div_ceil(self.concurrency.max(1)).max(1) as u32;
            self.timeout * waves + Duration::from_secs(2)
        })
    }
}

/// Lowercased reply head mentions something HTTP-ish.
fn has_http_signal(head: &[u8]) -> bool {
    let text = String::from_utf8_lossy(head).to_ascii_lowercase();
    ["http/1.", "http/2", "cloudflare", "<html", "200 ok"]
        .iter()
        .any(|needle| text.contains(needle))
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

async fn probe_tcp(addr: SocketAddr) -> Option<f64> {
    let start = Instant::now();
    TcpStream::connect(addr).await.ok()?;
    Some(elapsed_ms(start))
}

/// Returns the round-trip time and whether the first reply chunk looked like HTTP.
async fn probe_tls_http(
    connector: &TlsConnector,
    addr: SocketAddr,
    host: &str,
    path: &str,
) -> Option<(f64, bool)> {
    let start = Instant::now();
    let tcp = TcpStream::connect(addr).await.ok()?;
    let name = ServerName::try_from(host.to_string()).ok()?;
    let mut tls = connector.connect(name, tcp).await.ok()?;

    let request = format!(
        "GET {path} HTTP/1.1\r\nHost: {host}\r\nUser-Agent: tunnelsub-probe/1.0\r\nConnection: close\r\n\r\n"
    );
    tls.write_all(request.as_bytes()).await.ok()?;
    let mut head = [0u8; 1024];
    let n = tls.read(&mut head).await.ok()?;
    Some((elapsed_ms(start), n > 0 && has_http_signal(&head[..n])))
}

async fn probe_one(
    address: IpAddr,
    port: u16,
    mode: ProbeMode,
    connector: Option<TlsConnector>,
    options: Arc<ProbeOptions>,
) -> ProbeResult {
    let addr = SocketAddr::new(address, port);
    let kind = mode.kind();
    match (mode, connector) {
        (ProbeMode::TlsHttpProbe, Some(connector)) => {
            let host = options
                .host
                .clone()
                .filter(|h| !h.is_empty())
                .unwrap_or_else(|| address.to_string());
            let probe = probe_tls_http(&connector, addr, &host, &options.path);
            match tokio::time::timeout(options.timeout, probe).await {
                Ok(Some((ms, true))) => ProbeResult::reached(address, kind, ms, 0.0),
                Ok(Some((ms, false))) => ProbeResult::reached(address, kind, ms, NO_SIGNAL_PENALTY_MS),
                _ => ProbeResult::unreachable(address, kind),
            }
        }
        _ => match tokio::time::timeout(options.timeout, probe_tcp(addr)).await {
            Ok(Some(ms)) => ProbeResult::reached(address, kind, ms, 0.0),
            _ => ProbeResult::unreachable(address, kind),
        },
    }
}

/// Probes every candidate with at most `options.concurrency` in flight.
/// Results come back in candidate order; probes still running at the
/// round deadline are aborted and reported unreachable.
pub async fn probe_all(
    pool: &[IpAddr],
    port: u16,
    mode: ProbeMode,
    options: ProbeOptions,
) -> Vec<ProbeResult> {
    let kind = mode.kind();
    let connector = match mode {
        ProbeMode::TcpOnly => None,
        ProbeMode::TlsHttpProbe => match insecure_tls::probe_connector() {
            Ok(c) => Some(c),
            Err(e) => {
                warn!("TLS probe context unavailable, falling back to TCP: {e}");
                None
            }
        },
    };

    let deadline = tokio::time::Instant::now() + options.deadline_for(pool.len());
    let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let options = Arc::new(options);
    let mut tasks = JoinSet::new();

    for (idx, &address) in pool.iter().enumerate() {
        let semaphore = semaphore.clone();
        let connector = connector.clone();
        let options = options.clone();
        tasks.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return (idx, ProbeResult::unreachable(address, kind));
            };
            (idx, probe_one(address, port, mode, connector, options).await)
        });
    }

    let mut results: Vec<Option<ProbeResult>> = vec![None; pool.len()];
    loop {
        match tokio::time::timeout_at(deadline, tasks.join_next()).await {
            Ok(Some(Ok((idx, result)))) => results[idx] = Some(result),
            Ok(Some(Err(e))) => debug!("Probe task failed: {e}"),
            Ok(None) => break,
            Err(_) => {
                warn!("Probe round deadline hit, aborting {} probe(s)", tasks.len());
                tasks.abort_all();
                break;
            }
        }
    }

    pool.iter()
        .zip(results)
        .map(|(&address, r)| r.unwrap_or_else(|| ProbeResult::unreachable(address, kind)))
        .collect()
}

/// Stable sort: reachable first, then ascending score. Keeps at most `top_n`.
pub fn rank(mut results: Vec<ProbeResult>, top_n: usize) -> Vec<ProbeResult> {
    results.sort_by(|a, b| {
        (!a.reachable)
            .cmp(&!b.reachable)
            .then(a.score.total_cmp(&b.score))
    });
    results.truncate(top_n);
    results
}

/// The `top_n` best addresses from `pool`. Never fails: when nothing is
/// reachable the best-ranked unreachable entries are returned.
pub async fn select_best(
    pool: &[IpAddr],
    port: u16,
    top_n: usize,
    mode: ProbeMode,
    timeout: Duration,
) -> Vec<IpAddr> {
    let options = ProbeOptions {
        timeout,
        ..ProbeOptions::for_mode(mode)
    };
    select_best_with(pool, port, top_n, mode, options).await
}

pub async fn select_best_with(
    pool: &[IpAddr],
    port: u16,
    top_n: usize,
    mode: ProbeMode,
    options: ProbeOptions,
) -> Vec<IpAddr> {
    let results = probe_all(pool, port, mode, options).await;
    let reachable = results.iter().filter(|r| r.reachable).count();
    debug!("Probed {} candidates on port {port}: {reachable} reachable", results.len());
    rank(results, top_n).into_iter().map(|r| r.address).collect()
}

/// Best edge IPs for TLS (443) and plaintext (80) links.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreferredEdges {
    pub tls: Vec<String>,
    pub http: Vec<String>,
}

/// Samples Cloudflare's ranges and keeps the fastest edges. TLS candidates
/// are checked with a real handshake and request against `domain` unless
/// `fast` is set or no domain is known.
pub async fn prefer_edges(domain: Option<&str>, ws_path: &str, fast: bool) -> PreferredEdges {
    let pool: Vec<IpAddr> = match reqwest::Client::builder().build() {
        Ok(client) => candidates::fetch_candidates(&client, candidates::MAX_CANDIDATES).await,
        Err(e) => {
            warn!("HTTP client unavailable, using fallback candidates: {e}");
            candidates::fallback_candidates()
        }
    }
    .into_iter()
    .map(IpAddr::V4)
    .collect();

    let tls_mode = if fast || domain.is_none() {
        ProbeMode::TcpOnly
    } else {
        ProbeMode::TlsHttpProbe
    };
    let tls_options = ProbeOptions {
        host: domain.map(String::from),
        path: ws_path.to_string(),
        ..ProbeOptions::for_mode(tls_mode)
    };
    let tls = select_best_with(&pool, 443, TLS_TOP_N, tls_mode, tls_options).await;
    let http = select_best_with(
        &pool,
        80,
        HTTP_TOP_N,
        ProbeMode::TcpOnly,
        ProbeOptions::for_mode(ProbeMode::TcpOnly),
    )
    .await;

    PreferredEdges {
        tls: tls.iter().map(IpAddr::to_string).collect(),
        http: http.iter().map(IpAddr::to_string).collect(),
    }
}
