use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::time::Duration;

use rand::seq::SliceRandom;
use tracing::warn;

pub const CF_IPV4_URL: &str = "https://www.cloudflare.com/ips-v4";
pub const MAX_CANDIDATES: usize = 80;

const FALLBACK: [Ipv4Addr; 8] = [
    Ipv4Addr::new(104, 16, 0, 1),
    Ipv4Addr::new(104, 17, 0, 1),
    Ipv4Addr::new(104, 18, 0, 1),
    Ipv4Addr::new(104, 19, 0, 1),
    Ipv4Addr::new(104, 20, 0, 1),
    Ipv4Addr::new(104, 21, 0, 1),
    Ipv4Addr::new(104, 22, 0, 1),
    Ipv4Addr::new(104, 24, 0, 1),
];

/// Turns a CIDR list into one probe address per prefix (`a.b.c.1`),
/// deduplicated and in input order.
pub fn parse_prefixes(text: &str) -> Vec<Ipv4Addr> {
    let mut seen = HashSet::new();
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| l.split('/').next()?.trim().parse::<Ipv4Addr>().ok())
        .map(|ip| {
            let [a, b, c, _] = ip.octets();
            Ipv4Addr::new(a, b, c, 1)
        })
        .filter(|ip| seen.insert(*ip))
        .collect()
}

pub fn fallback_candidates() -> Vec<Ipv4Addr> {
    FALLBACK.to_vec()
}

/// Shuffled sample of at most `max` addresses.
pub fn sample(mut candidates: Vec<Ipv4Addr>, max: usize) -> Vec<Ipv4Addr> {
    candidates.shuffle(&mut rand::rng());
    candidates.truncate(max);
    candidates
}

/// Cloudflare's published IPv4 ranges as probe candidates, or a fixed
/// list when they cannot be fetched.
pub async fn fetch_candidates(client: &reqwest::Client, max: usize) -> Vec<Ipv4Addr> {
    let fetched = async {
        client
            .get(CF_IPV4_URL)
            .timeout(Duration::from_secs(8))
            .send()
            .await?
            .error_for_status()?
            .text()
            .await
    }
    .await;

    let parsed = match fetched {
        Ok(body) => parse_prefixes(&body),
        Err(e) => {
            warn!("Failed to fetch Cloudflare ranges, using fallback list: {e}");
            Vec::new()
        }
    };
    if parsed.is_empty() {
        let mut fallback = fallback_candidates();
        fallback.truncate(max);
        return fallback;
    }
    sample(parsed, max)
}
