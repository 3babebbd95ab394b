use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::launcher::{Component, LaunchSpec, ProcessLauncher};

/// Extracts the quick-tunnel hostname cloudflared prints to its log.
pub struct QuickTunnelLog;

impl QuickTunnelLog {
    fn pattern() -> Option<&'static Regex> {
        static RE: OnceLock<Option<Regex>> = OnceLock::new();
        RE.get_or_init(|| Regex::new(r"(?i)https://([a-z0-9][a-z0-9-]*)\.trycloudflare\.com").ok())
            .as_ref()
    }

    /// First `<label>.trycloudflare.com` in `text`. The `api` label only
    /// shows up in cloudflared's own error lines and is skipped.
    pub fn scan(text: &str) -> Option<String> {
        Self::pattern()?
            .captures_iter(text)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str().to_ascii_lowercase())
            .find(|label| label != "api")
            .map(|label| format!("{label}.trycloudflare.com"))
    }

    pub async fn read(path: &Path) -> Option<String> {
        let bytes = tokio::fs::read(path).await.ok()?;
        Self::scan(&String::from_utf8_lossy(&bytes))
    }
}

/// What the resolver needs from a running tunnel client.
#[async_trait]
pub trait TunnelControl: Send {
    fn log_path(&self) -> PathBuf;

    /// Kill the client, discard its log and start it again.
    async fn restart(&mut self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct ResolvePolicy {
    /// Restarts allowed after the initial window.
    pub max_attempts: u32,
    pub poll_interval: Duration,
    pub polls_per_attempt: u32,
}

impl Default for ResolvePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            poll_interval: Duration::from_secs(3),
            polls_per_attempt: 8,
        }
    }
}

/// Polls the tunnel log for its hostname. The first window runs against
/// the already-started client; each further attempt restarts it first.
/// `Ok(None)` means every attempt ran out.
pub async fn resolve<C>(control: &mut C, policy: &ResolvePolicy) -> Result<Option<String>>
where
    C: TunnelControl + ?Sized,
{
    let polls = policy.polls_per_attempt.max(1);
    for attempt in 0..=policy.max_attempts {
        if attempt > 0 {
            warn!(
                "Tunnel hostname not found, restarting tunnel ({attempt}/{})",
                policy.max_attempts
            );
            control.restart().await?;
        }
        for poll in 0..polls {
            if let Some(host) = QuickTunnelLog::read(&control.log_path()).await {
                info!("Tunnel hostname resolved: {host}");
                return Ok(Some(host));
            }
            let last = attempt == policy.max_attempts && poll + 1 == polls;
            if !last {
                tokio::time::sleep(policy.poll_interval).await;
            }
        }
        debug!("Resolve window {attempt} elapsed without a hostname");
    }
    Ok(None)
}

/// A launched tunnel client and, once known, its public hostname.
pub struct TunnelSession {
    pub pid: Option<u32>,
    pub log_path: PathBuf,
    pub resolved_domain: Option<String>,
    launcher: ProcessLauncher,
    spec: LaunchSpec,
}

impl TunnelSession {
    /// Starts the tunnel client with a fresh log.
    pub async fn start(launcher: ProcessLauncher, spec: LaunchSpec) -> Result<Self> {
        let mut session = Self {
            pid: None,
            log_path: launcher.paths().log_file(Component::Tunnel),
            resolved_domain: None,
            launcher,
            spec,
        };
        session.restart().await?;
        Ok(session)
    }

    pub async fn resolve_domain(&mut self, policy: &ResolvePolicy) -> Result<Option<String>> {
        let found = resolve(&mut *self, policy).await?;
        if found.is_some() {
            self.resolved_domain = found.clone();
        }
        Ok(found)
    }
}

#[async_trait]
impl TunnelControl for TunnelSession {
    fn log_path(&self) -> PathBuf {
        self.log_path.clone()
    }

    async fn restart(&mut self) -> Result<()> {
        self.launcher.stop(Component::Tunnel).await;
        let _ = tokio::fs::remove_file(&self.log_path).await;
        self.pid = Some(self.launcher.launch(Component::Tunnel, &self.spec)?);
        Ok(())
    }
}
