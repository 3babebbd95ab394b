use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::materialize::engine::ws_path;
use crate::store::{InstallRecord, InstallationConfig};

/// Ports on which Cloudflare terminates TLS for proxied hostnames.
pub const CF_HTTPS_PORTS: [u16; 6] = [443, 2053, 2083, 2087, 2096, 8443];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Vmess,
    Vless,
    Trojan,
}

impl Scheme {
    pub const ALL: [Scheme; 3] = [Scheme::Vmess, Scheme::Vless, Scheme::Trojan];

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Vmess => "vmess",
            Scheme::Vless => "vless",
            Scheme::Trojan => "trojan",
        }
    }

    /// Suffix appended to the uuid prefix to form the websocket path.
    pub fn path_suffix(&self) -> &'static str {
        match self {
            Scheme::Vmess => "-vm",
            Scheme::Vless => "-vl",
            Scheme::Trojan => "-tr",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vmess" | "vm" => Ok(Scheme::Vmess),
            "vless" | "vl" => Ok(Scheme::Vless),
            "trojan" | "tr" => Ok(Scheme::Trojan),
            other => Err(CoreError::config(format!("unknown protocol: {other}"))),
        }
    }
}

/// An address clients will dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
    pub tls: bool,
    /// The tunnel hostname itself rather than an edge IP or CDN host.
    pub direct: bool,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: u16, tls: bool) -> Self {
        Self {
            address: address.into(),
            port,
            tls,
            direct: false,
        }
    }

    pub fn direct(domain: impl Into<String>, port: u16, tls: bool) -> Self {
        Self {
            direct: true,
            ..Self::new(domain, port, tls)
        }
    }
}

/// Builds the non-direct endpoint pool: preferred TLS IPs on 443,
/// preferred plaintext IPs on 80, then an optional CDN host.
pub fn candidate_endpoints(
    tls_ips: &[String],
    http_ips: &[String],
    cdn: Option<(&str, u16)>,
) -> Vec<Endpoint> {
    let mut pool: Vec<Endpoint> = tls_ips
        .iter()
        .map(|ip| Endpoint::new(ip.clone(), 443, true))
        .chain(http_ips.iter().map(|ip| Endpoint::new(ip.clone(), 80, false)))
        .collect();
    if let Some((host, port)) = cdn.filter(|(h, _)| !h.trim().is_empty()) {
        pool.push(Endpoint::new(host.trim(), port, CF_HTTPS_PORTS.contains(&port)));
    }
    pool
}

#[derive(Debug, Clone)]
pub struct LinkOptions {
    pub protocols: Vec<Scheme>,
    /// Node label used in remarks.
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyLink {
    pub scheme: Scheme,
    pub remark: String,
    /// Ordered fields. For vmess these are the JSON keys; for vless and
    /// trojan they are the user, address and port followed by query params.
    pub fields: Vec<(String, String)>,
}

impl ProxyLink {
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The uuid embedded in the link.
    pub fn credential(&self) -> Option<&str> {
        match self.scheme {
            Scheme::Trojan => self.field("password"),
            _ => self.field("id"),
        }
    }

    pub fn host(&self) -> Option<&str> {
        self.field("host")
    }

    pub fn is_valid_for(&self, config: &InstallationConfig) -> bool {
        self.host().is_some_and(|h| !h.is_empty()) && self.credential() == Some(config.uuid.as_str())
    }

    pub fn to_uri(&self) -> String {
        match self.scheme {
            Scheme::Vmess => {
                let body = self
                    .fields
                    .iter()
                    .map(|(k, v)| format!("{}:{}", json_str(k), json_str(v)))
                    .collect::<Vec<_>>()
                    .join(",");
                format!("vmess://{}", STANDARD_NO_PAD.encode(format!("{{{body}}}")))
            }
            Scheme::Vless | Scheme::Trojan => {
                let user_key = if self.scheme == Scheme::Trojan { "password" } else { "id" };
                let user = self.field(user_key).unwrap_or_default();
                let add = self.field("add").unwrap_or_default();
                let port = self.field("port").unwrap_or_default();
                let params: Vec<String> = self
                    .fields
                    .iter()
                    .filter(|(k, _)| k != user_key && k != "add" && k != "port")
                    .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
                    .collect();
                format!(
                    "{}://{}@{}:{}?{}#{}",
                    self.scheme,
                    user,
                    bracket_ipv6(add),
                    port,
                    params.join("&"),
                    urlencoding::encode(&self.remark)
                )
            }
        }
    }
}

impl fmt::Display for ProxyLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_uri())
    }
}

fn json_str(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

fn bracket_ipv6(addr: &str) -> String {
    if addr.contains(':') && !addr.starts_with('[') {
        format!("[{addr}]")
    } else {
        addr.to_string()
    }
}

/// `<scheme>-ws-<tls|http>-<label>-<address>-<port>`
fn remark(scheme: Scheme, label: &str, endpoint: &Endpoint) -> String {
    format!(
        "{}-ws-{}-{}-{}-{}",
        scheme,
        if endpoint.tls { "tls" } else { "http" },
        label,
        endpoint.address.replace(['.', ':'], "-"),
        endpoint.port
    )
}

fn build_link(
    scheme: Scheme,
    config: &InstallationConfig,
    domain: &str,
    label: &str,
    endpoint: &Endpoint,
) -> ProxyLink {
    let path = format!("{}?ed=2048", ws_path(config.path_prefix(), scheme));
    let remark = remark(scheme, label, endpoint);
    let sni = if endpoint.tls { domain } else { "" };
    let security = if endpoint.tls { "tls" } else { "none" };

    let fields: Vec<(&str, String)> = match scheme {
        Scheme::Vmess => vec![
            ("v", "2".into()),
            ("ps", remark.clone()),
            ("add", endpoint.address.clone()),
            ("port", endpoint.port.to_string()),
            ("id", config.uuid.clone()),
            ("aid", "0".into()),
            ("net", "ws".into()),
            ("type", "none".into()),
            ("host", domain.into()),
            ("path", path),
            ("tls", if endpoint.tls { "tls".into() } else { String::new() }),
            ("sni", sni.into()),
        ],
        Scheme::Vless => {
            let mut fields = vec![
                ("id", config.uuid.clone()),
                ("add", endpoint.address.clone()),
                ("port", endpoint.port.to_string()),
                ("encryption", "none".into()),
                ("security", security.into()),
            ];
            if endpoint.tls {
                fields.push(("sni", sni.into()));
                fields.push(("fp", "chrome".into()));
            }
            fields.extend([("type", "ws".into()), ("host", domain.into()), ("path", path)]);
            fields
        }
        Scheme::Trojan => {
            let mut fields = vec![
                ("password", config.uuid.clone()),
                ("add", endpoint.address.clone()),
                ("port", endpoint.port.to_string()),
                ("security", security.into()),
            ];
            if endpoint.tls {
                fields.push(("sni", sni.into()));
                fields.push(("fp", "chrome".into()));
            }
            fields.extend([("type", "ws".into()), ("host", domain.into()), ("path", path)]);
            fields
        }
    };

    ProxyLink {
        scheme,
        remark,
        fields: fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
    }
}

/// Builds one link per (protocol, endpoint). Pool endpoints come first,
/// then the domain itself on 443 (TLS) and 80. Duplicate
/// (scheme, address, port) triples keep their first occurrence.
pub fn assemble(
    config: &InstallationConfig,
    domain: &str,
    pool: &[Endpoint],
    options: &LinkOptions,
) -> Result<Vec<ProxyLink>> {
    let domain = domain.trim();
    if domain.is_empty() {
        return Err(CoreError::config("cannot build links without a domain"));
    }
    if config.uuid.trim().is_empty() {
        return Err(CoreError::config("cannot build links without a uuid"));
    }
    if options.protocols.is_empty() {
        return Err(CoreError::config("no protocols enabled"));
    }

    let direct = [Endpoint::direct(domain, 443, true), Endpoint::direct(domain, 80, false)];
    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for endpoint in pool.iter().chain(direct.iter()) {
        for &scheme in &options.protocols {
            if !seen.insert((scheme, endpoint.address.clone(), endpoint.port)) {
                continue;
            }
            links.push(build_link(scheme, config, domain, &options.label, endpoint));
        }
    }
    Ok(links)
}

/// Links for a persisted installation: its preferred IPs, CDN host and
/// public domain.
pub fn links_for_record(record: &InstallRecord, label: &str) -> Result<Vec<ProxyLink>> {
    let domain = record
        .effective_domain()
        .ok_or_else(|| CoreError::config("no public domain known for this installation"))?;
    let pool = candidate_endpoints(
        &record.preferred_ips_tls,
        &record.preferred_ips_http,
        record.cdn_host.as_deref().map(|h| (h, record.cdn_port)),
    );
    assemble(
        &record.config,
        domain,
        &pool,
        &LinkOptions {
            protocols: record.protocols.clone(),
            label: label.to_string(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> InstallationConfig {
        InstallationConfig {
            uuid: "11111111-2222-3333-4444-555555555555".to_string(),
            listen_port: 12345,
            domain: None,
            tunnel_token: None,
            subscription_port: 8000,
        }
    }

    fn options(protocols: &[Scheme]) -> LinkOptions {
        LinkOptions {
            protocols: protocols.to_vec(),
            label: "node".to_string(),
        }
    }

    fn decode_vmess(uri: &str) -> serde_json::Value {
        let payload = uri.strip_prefix("vmess://").unwrap();
        let raw = STANDARD_NO_PAD.decode(payload).unwrap();
        serde_json::from_slice(&raw).unwrap()
    }

    #[test]
    fn vmess_link_carries_uuid_domain_and_path() {
        let links = assemble(&config(), "example.trycloudflare.com", &[], &options(&[Scheme::Vmess])).unwrap();
        assert!(!links.is_empty());

        let json = decode_vmess(&links[0].to_uri());
        assert_eq!(json["add"], "example.trycloudflare.com");
        assert_eq!(json["id"], "11111111-2222-3333-4444-555555555555");
        assert!(json["path"].as_str().unwrap().starts_with("/11111111-vm"));
        assert_eq!(json["tls"], "tls");
        assert_eq!(json["sni"], "example.trycloudflare.com");
    }

    #[test]
    fn vmess_json_keeps_field_order() {
        let links = assemble(&config(), "a.example.com", &[], &options(&[Scheme::Vmess])).unwrap();
        let payload = links[0].to_uri();
        let raw = STANDARD_NO_PAD
            .decode(payload.strip_prefix("vmess://").unwrap())
            .unwrap();
        let text = String::from_utf8(raw).unwrap();
        let order = ["\"v\"", "\"ps\"", "\"add\"", "\"port\"", "\"id\"", "\"aid\"", "\"net\"", "\"type\"", "\"host\"", "\"path\"", "\"tls\"", "\"sni\""];
        let positions: Vec<usize> = order.iter().map(|k| text.find(k).unwrap()).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{text}");
        assert!(!payload.ends_with('='));
    }

    #[test]
    fn pool_links_precede_direct_links() {
        let pool = candidate_endpoints(&["104.16.0.1".into()], &["104.17.0.1".into()], None);
        let links = assemble(&config(), "a.example.com", &pool, &options(&[Scheme::Vmess])).unwrap();
        let adds: Vec<&str> = links.iter().map(|l| l.field("add").unwrap()).collect();
        assert_eq!(adds, ["104.16.0.1", "104.17.0.1", "a.example.com", "a.example.com"]);
        assert_eq!(links[1].field("tls"), Some(""));
        assert_eq!(links[1].field("port"), Some("80"));
    }

    #[test]
    fn duplicate_endpoints_are_dropped_and_remarks_unique() {
        let pool = vec![
            Endpoint::new("104.16.0.1", 443, true),
            Endpoint::new("104.16.0.1", 443, true),
            Endpoint::new("a.example.com", 443, true),
        ];
        let links = assemble(&config(), "a.example.com", &pool, &options(&Scheme::ALL)).unwrap();
        // 2 distinct pool endpoints + plaintext direct, each for 3 schemes
        assert_eq!(links.len(), 9);
        let remarks: HashSet<&str> = links.iter().map(|l| l.remark.as_str()).collect();
        assert_eq!(remarks.len(), links.len());
    }

    #[test]
    fn vless_and_trojan_uris() {
        let pool = vec![Endpoint::new("104.16.0.1", 443, true)];
        let links = assemble(&config(), "a.example.com", &pool, &options(&[Scheme::Vless, Scheme::Trojan])).unwrap();

        let vless = links[0].to_uri();
        assert!(vless.starts_with("vless://11111111-2222-3333-4444-555555555555@104.16.0.1:443?encryption=none&security=tls&sni=a.example.com&fp=chrome&type=ws&host=a.example.com&path=%2F11111111-vl%3Fed%3D2048#"));
        assert!(vless.ends_with("#vless-ws-tls-node-104-16-0-1-443"));

        let trojan = links[1].to_uri();
        assert!(trojan.starts_with("trojan://11111111-2222-3333-4444-555555555555@104.16.0.1:443?security=tls"));
        assert!(trojan.contains("path=%2F11111111-tr%3Fed%3D2048"));
    }

    #[test]
    fn every_link_is_valid_for_its_config() {
        let cfg = config();
        let pool = candidate_endpoints(&["104.16.0.1".into()], &[], Some(("cdn.example.com", 8443)));
        let links = assemble(&cfg, "a.example.com", &pool, &options(&Scheme::ALL)).unwrap();
        assert!(links.iter().all(|l| l.is_valid_for(&cfg)));
        assert!(pool[1].tls);
    }

    #[test]
    fn empty_domain_is_rejected() {
        assert!(assemble(&config(), "  ", &[], &options(&[Scheme::Vmess])).is_err());
        assert!(assemble(&config(), "a.example.com", &[], &options(&[])).is_err());
    }

    #[test]
    fn scheme_parses_short_and_long_names() {
        assert_eq!("VLESS".parse::<Scheme>().unwrap(), Scheme::Vless);
        assert_eq!("tr".parse::<Scheme>().unwrap(), Scheme::Trojan);
        assert!("ss".parse::<Scheme>().is_err());
    }
}
