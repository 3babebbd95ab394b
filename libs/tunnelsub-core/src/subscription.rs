use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{CoreError, IoContext, Result};
use crate::store::{write_atomic, InstallPaths};

pub const DEFAULT_KEEPALIVE_URL: &str = "https://oooo.serv00.net";

/// A single URL segment of letters, digits, `-`, `_` or `.`.
pub fn validate_sub_path(sub_path: &str) -> Result<&str> {
    let trimmed = sub_path.trim().trim_matches('/');
    let ok = !trimmed.is_empty()
        && trimmed != "."
        && trimmed != ".."
        && trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(trimmed)
    } else {
        Err(CoreError::config(format!("invalid subscription path: {sub_path:?}")))
    }
}

/// Newline-joined links with a trailing newline.
pub fn render_plain<S: AsRef<str>>(links: &[S]) -> String {
    let mut text = String::new();
    for link in links {
        text.push_str(link.as_ref());
        text.push('\n');
    }
    text
}

pub fn encode_subscription<S: AsRef<str>>(links: &[S]) -> String {
    STANDARD.encode(render_plain(links))
}

pub fn decode_subscription(blob: &str) -> Result<Vec<String>> {
    let raw = STANDARD
        .decode(blob.trim())
        .map_err(|e| CoreError::config(format!("subscription is not valid base64: {e}")))?;
    let text = String::from_utf8(raw)
        .map_err(|e| CoreError::config(format!("subscription is not UTF-8: {e}")))?;
    Ok(text.lines().filter(|l| !l.is_empty()).map(String::from).collect())
}

/// Writes `allnodes.txt` and `subscription_base64.txt`. Returns the base64 blob.
pub fn publish<S: AsRef<str>>(paths: &InstallPaths, links: &[S]) -> Result<String> {
    let plain = render_plain(links);
    let blob = STANDARD.encode(&plain);
    write_atomic(&paths.links_file(), plain.as_bytes())?;
    write_atomic(&paths.subscription_file(), blob.as_bytes())?;
    info!("Published {} link(s) to {}", links.len(), paths.links_file().display());
    Ok(blob)
}

/// Reads back the published links, `None` if nothing was published yet.
pub fn read_links(paths: &InstallPaths) -> Result<Option<Vec<String>>> {
    let path = paths.links_file();
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&path).with_path(&path)?;
    Ok(Some(text.lines().filter(|l| !l.is_empty()).map(String::from).collect()))
}

#[derive(Serialize)]
struct SubscriptionsBody<'a> {
    subscription: Vec<&'a str>,
}

#[derive(Serialize)]
struct NodesBody<'a> {
    nodes: &'a [String],
}

#[derive(Serialize)]
struct KeepAliveBody<'a> {
    url: &'a str,
}

/// Pushes links or the subscription URL to an aggregation service.
#[derive(Clone)]
pub struct Uploader {
    client: Client,
    base_url: String,
}

impl Uploader {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// `<project>/<sub_path>`, the public address of our subscription.
    pub fn subscription_url(project_url: &str, sub_path: &str) -> String {
        format!(
            "{}/{}",
            project_url.trim_end_matches('/'),
            sub_path.trim_start_matches('/')
        )
    }

    async fn post<T: Serialize>(&self, endpoint: &str, body: &T) -> Result<()> {
        let url = format!("{}{}", self.base_url, endpoint);
        debug!("POST {url}");
        self.client
            .post(&url)
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn add_subscription(&self, subscription_url: &str) -> Result<()> {
        self.post(
            "/api/add-subscriptions",
            &SubscriptionsBody {
                subscription: vec![subscription_url],
            },
        )
        .await?;
        info!("Registered subscription {subscription_url}");
        Ok(())
    }

    pub async fn add_nodes(&self, links: &[String]) -> Result<()> {
        self.post("/api/add-nodes", &NodesBody { nodes: links }).await?;
        info!("Uploaded {} node(s)", links.len());
        Ok(())
    }

    pub async fn delete_nodes(&self, links: &[String]) -> Result<()> {
        self.post("/api/delete-nodes", &NodesBody { nodes: links }).await?;
        info!("Deleted {} node(s) from aggregator", links.len());
        Ok(())
    }
}

/// Asks a keep-alive service to visit `project_url` periodically.
pub async fn register_keepalive(service_url: &str, project_url: &str) -> Result<()> {
    let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
    client
        .post(format!("{}/add-url", service_url.trim_end_matches('/')))
        .json(&KeepAliveBody { url: project_url })
        .send()
        .await?
        .error_for_status()?;
    info!("Registered {project_url} for keep-alive");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    type Seen = Arc<Mutex<Vec<(String, String)>>>;

    /// Reads one HTTP/1.1 request and returns its path and body.
    async fn read_request(sock: &mut TcpStream) -> Option<(String, String)> {
        let mut raw = Vec::new();
        let mut buf = [0u8; 4096];
        let (head_len, body_len) = loop {
            let n = sock.read(&mut buf).await.ok()?;
            if n == 0 {
                return None;
            }
            raw.extend_from_slice(&buf[..n]);
            if let Some(end) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&raw[..end]).to_ascii_lowercase();
                let len = head
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(0);
                break (end + 4, len);
            }
        };
        while raw.len() < head_len + body_len {
            let n = sock.read(&mut buf).await.ok()?;
            if n == 0 {
                return None;
            }
            raw.extend_from_slice(&buf[..n]);
        }
        let head = String::from_utf8_lossy(&raw[..head_len]).into_owned();
        let path = head.split_whitespace().nth(1)?.to_string();
        let body = String::from_utf8_lossy(&raw[head_len..head_len + body_len]).into_owned();
        Some((path, body))
    }

    /// Loopback aggregator that records every request and answers 200.
    async fn aggregator() -> (String, Seen) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen: Seen = Arc::default();
        let recorder = seen.clone();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                if let Some(request) = read_request(&mut sock).await {
                    recorder.lock().unwrap().push(request);
                }
                let _ = sock
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                    .await;
            }
        });
        (format!("http://{addr}"), seen)
    }

    fn entry(path: &str, body: &str) -> (String, String) {
        (path.to_string(), body.to_string())
    }

    #[test]
    fn encode_matches_known_blob() {
        let blob = encode_subscription(&["vmess://abc", "vless://def"]);
        assert_eq!(blob, STANDARD.encode("vmess://abc\nvless://def\n"));
    }

    #[test]
    fn decode_restores_ordered_links() {
        let links = vec![
            "vmess://eyJ2IjoiMiJ9".to_string(),
            "trojan://u@1.2.3.4:443?security=tls#a".to_string(),
            "vless://u@h:80?security=none#b".to_string(),
        ];
        assert_eq!(decode_subscription(&encode_subscription(&links)).unwrap(), links);
        assert!(decode_subscription("%%%").is_err());
    }

    #[test]
    fn publish_writes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let paths = InstallPaths::new(dir.path());
        assert!(read_links(&paths).unwrap().is_none());

        let links = vec!["vmess://abc".to_string(), "vless://def".to_string()];
        let blob = publish(&paths, &links).unwrap();
        assert_eq!(
            std::fs::read_to_string(paths.links_file()).unwrap(),
            "vmess://abc\nvless://def\n"
        );
        assert_eq!(std::fs::read_to_string(paths.subscription_file()).unwrap(), blob);
        assert_eq!(read_links(&paths).unwrap().unwrap(), links);
    }

    #[test]
    fn sub_path_validation() {
        assert_eq!(validate_sub_path("/sub").unwrap(), "sub");
        assert_eq!(validate_sub_path("my-sub_1").unwrap(), "my-sub_1");
        assert!(validate_sub_path("").is_err());
        assert!(validate_sub_path("a/b").is_err());
        assert!(validate_sub_path("{x}").is_err());
    }

    #[test]
    fn subscription_url_joins_cleanly() {
        assert_eq!(
            Uploader::subscription_url("https://app.example.com/", "/sub"),
            "https://app.example.com/sub"
        );
    }

    #[tokio::test]
    async fn upload_to_closed_port_is_an_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let uploader = Uploader::new(&format!("http://127.0.0.1:{port}")).unwrap();
        assert!(uploader.add_nodes(&["vmess://abc".to_string()]).await.is_err());
    }

    #[tokio::test]
    async fn uploader_hits_aggregator_endpoints() {
        let (base, seen) = aggregator().await;
        let uploader = Uploader::new(&format!("{base}/")).unwrap();
        let links = vec!["vmess://abc".to_string(), "trojan://u@h:443#x".to_string()];

        uploader.add_subscription("https://app.example.com/sub").await.unwrap();
        uploader.add_nodes(&links).await.unwrap();
        uploader.delete_nodes(&links[..1]).await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                entry(
                    "/api/add-subscriptions",
                    r#"{"subscription":["https://app.example.com/sub"]}"#
                ),
                entry(
                    "/api/add-nodes",
                    r#"{"nodes":["vmess://abc","trojan://u@h:443#x"]}"#
                ),
                entry("/api/delete-nodes", r#"{"nodes":["vmess://abc"]}"#),
            ]
        );
    }

    #[tokio::test]
    async fn keepalive_registers_project_url() {
        let (base, seen) = aggregator().await;
        register_keepalive(&base, "https://app.example.com").await.unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![entry("/add-url", r#"{"url":"https://app.example.com"}"#)]
        );
    }
}
