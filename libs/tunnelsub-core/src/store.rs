use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoreError, IoContext, Result};
use crate::launcher::Component;
use crate::links::Scheme;
use crate::persistence::PersistenceMode;

/// Parameters chosen at install time. Immutable until an explicit update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallationConfig {
    pub uuid: String,
    #[serde(rename = "port")]
    pub listen_port: u16,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(rename = "argo_token", default)]
    pub tunnel_token: Option<String>,
    pub subscription_port: u16,
}

impl InstallationConfig {
    /// First eight characters of the uuid, used as the websocket path prefix.
    pub fn path_prefix(&self) -> &str {
        self.uuid.get(..8).unwrap_or(&self.uuid)
    }

    pub fn validate(&self) -> Result<()> {
        if uuid::Uuid::parse_str(&self.uuid).is_err() {
            return Err(CoreError::config(format!("uuid is not valid: {}", self.uuid)));
        }
        if self.listen_port == 0 {
            return Err(CoreError::config("listen port must be non-zero"));
        }
        if self.subscription_port == 0 {
            return Err(CoreError::config("subscription port must be non-zero"));
        }
        if self.listen_port == self.subscription_port {
            return Err(CoreError::config(
                "listen port and subscription port must differ",
            ));
        }
        let has_token = self.tunnel_token.as_deref().is_some_and(|t| !t.trim().is_empty());
        let has_domain = self.domain.as_deref().is_some_and(|d| !d.trim().is_empty());
        if has_token && !has_domain {
            return Err(CoreError::config(
                "a tunnel token requires --domain to be set",
            ));
        }
        Ok(())
    }
}

/// The authoritative on-disk installation record (`config.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallRecord {
    #[serde(flatten)]
    pub config: InstallationConfig,
    pub install_date: String,
    #[serde(default = "default_sub_path")]
    pub sub_path: String,
    #[serde(default = "default_protocols")]
    pub protocols: Vec<Scheme>,
    #[serde(default)]
    pub node_name: Option<String>,
    #[serde(default)]
    pub cdn_host: Option<String>,
    #[serde(default = "default_cdn_port")]
    pub cdn_port: u16,
    #[serde(default)]
    pub upload_url: Option<String>,
    #[serde(default)]
    pub project_url: Option<String>,
    #[serde(default)]
    pub auto_access: bool,
    #[serde(default)]
    pub mirror: Option<String>,
    #[serde(default)]
    pub persistence: PersistenceMode,
    #[serde(default)]
    pub fast: bool,
    #[serde(default)]
    pub no_probe: bool,
    /// Hostname discovered from a quick tunnel's log.
    #[serde(default)]
    pub tunnel_domain: Option<String>,
    #[serde(default)]
    pub preferred_ips_tls: Vec<String>,
    #[serde(default)]
    pub preferred_ips_http: Vec<String>,
}

fn default_sub_path() -> String {
    "sub".to_string()
}

fn default_protocols() -> Vec<Scheme> {
    vec![Scheme::Vmess]
}

fn default_cdn_port() -> u16 {
    443
}

impl InstallRecord {
    pub fn new(config: InstallationConfig) -> Self {
        Self {
            config,
            install_date: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            sub_path: default_sub_path(),
            protocols: default_protocols(),
            node_name: None,
            cdn_host: None,
            cdn_port: default_cdn_port(),
            upload_url: None,
            project_url: None,
            auto_access: false,
            mirror: None,
            persistence: PersistenceMode::default(),
            fast: false,
            no_probe: false,
            tunnel_domain: None,
            preferred_ips_tls: Vec::new(),
            preferred_ips_http: Vec::new(),
        }
    }

    /// The public hostname links point at: the fixed domain, else the
    /// one resolved from the quick tunnel.
    pub fn effective_domain(&self) -> Option<&str> {
        self.config
            .domain
            .as_deref()
            .filter(|d| !d.is_empty())
            .or(self.tunnel_domain.as_deref().filter(|d| !d.is_empty()))
    }
}

/// File layout of one installation directory.
#[derive(Debug, Clone)]
pub struct InstallPaths {
    pub root: PathBuf,
}

impl InstallPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `$HOME/.tunnelsub`, or `/tmp/.tunnelsub` when no home is set.
    pub fn default_root() -> PathBuf {
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".tunnelsub")
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn engine_config(&self) -> PathBuf {
        self.root.join("sb.json")
    }

    pub fn tunnel_yaml(&self) -> PathBuf {
        self.root.join("tunnel.yml")
    }

    pub fn tunnel_credentials(&self) -> PathBuf {
        self.root.join("tunnel.json")
    }

    pub fn engine_bin(&self) -> PathBuf {
        self.root.join("sing-box")
    }

    pub fn tunnel_bin(&self) -> PathBuf {
        self.root.join("cloudflared")
    }

    pub fn links_file(&self) -> PathBuf {
        self.root.join("allnodes.txt")
    }

    pub fn subscription_file(&self) -> PathBuf {
        self.root.join("subscription_base64.txt")
    }

    pub fn debug_log(&self) -> PathBuf {
        self.root.join("debug.log")
    }

    pub fn pid_file(&self, component: Component) -> PathBuf {
        self.root.join(format!("{}.pid", component.name()))
    }

    pub fn log_file(&self, component: Component) -> PathBuf {
        self.root.join(component.log_name())
    }

    pub fn ensure_root(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root).with_path(&self.root)
    }
}

/// Typed access to `config.json`.
#[derive(Debug, Clone)]
pub struct InstallationStore {
    path: PathBuf,
}

impl InstallationStore {
    pub fn new(paths: &InstallPaths) -> Self {
        Self {
            path: paths.config_file(),
        }
    }

    pub fn at(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn load(&self) -> Result<InstallRecord> {
        let raw = std::fs::read_to_string(&self.path).with_path(&self.path)?;
        let record: InstallRecord = serde_json::from_str(&raw)?;
        Ok(record)
    }

    /// Returns `None` when nothing has been installed yet.
    pub fn load_optional(&self) -> Result<Option<InstallRecord>> {
        if !self.exists() {
            return Ok(None);
        }
        self.load().map(Some)
    }

    pub fn save(&self, record: &InstallRecord) -> Result<()> {
        let body = serde_json::to_string_pretty(record)?;
        write_atomic(&self.path, body.as_bytes())?;
        debug!("Saved installation record to {}", self.path.display());
        Ok(())
    }

    /// Deletes `config.json`. Returns whether there was one.
    pub fn remove(&self) -> Result<bool> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CoreError::io(&self.path, e)),
        }
    }

    /// Loads, applies `f`, and saves back.
    pub fn update<F>(&self, f: F) -> Result<InstallRecord>
    where
        F: FnOnce(&mut InstallRecord),
    {
        let mut record = self.load()?;
        f(&mut record);
        self.save(&record)?;
        Ok(record)
    }
}

/// Writes through a sibling temp file and renames it into place.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| CoreError::config(format!("invalid path: {}", path.display())))?;
    std::fs::create_dir_all(parent).with_path(parent)?;

    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| CoreError::config(format!("invalid file name: {}", path.display())))?;
    let tmp = parent.join(format!(
        ".{}.tmp.{}",
        file_name,
        uuid::Uuid::new_v4().simple()
    ));
    std::fs::write(&tmp, contents).with_path(&tmp)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(CoreError::io(path, e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> InstallationConfig {
        InstallationConfig {
            uuid: "11111111-2222-3333-4444-555555555555".to_string(),
            listen_port: 12345,
            domain: None,
            tunnel_token: None,
            subscription_port: 8000,
        }
    }

    #[test]
    fn record_uses_on_disk_key_names() {
        let record = InstallRecord::new(sample_config());
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["port"], 12345);
        assert_eq!(value["subscription_port"], 8000);
        assert!(value.get("argo_token").is_some());
        assert!(value.get("install_date").is_some());
        assert!(value["preferred_ips_tls"].as_array().unwrap().is_empty());
    }

    #[test]
    fn remove_forgets_the_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = InstallationStore::new(&InstallPaths::new(dir.path()));
        assert!(!store.remove().unwrap());

        store.save(&InstallRecord::new(sample_config())).unwrap();
        assert!(store.remove().unwrap());
        assert!(!store.exists());
    }

    #[test]
    fn store_round_trips_record() {
        let dir = tempfile::tempdir().unwrap();
        let paths = InstallPaths::new(dir.path());
        let store = InstallationStore::new(&paths);
        assert!(store.load_optional().unwrap().is_none());

        let mut record = InstallRecord::new(sample_config());
        record.preferred_ips_tls = vec!["104.16.0.1".into()];
        store.save(&record).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded, record);

        let updated = store
            .update(|r| r.tunnel_domain = Some("abc.trycloudflare.com".into()))
            .unwrap();
        assert_eq!(updated.effective_domain(), Some("abc.trycloudflare.com"));
    }

    #[test]
    fn reads_minimal_legacy_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"uuid":"11111111-2222-3333-4444-555555555555","port":12345,"domain":"a.example.com","argo_token":null,"install_date":"2024-01-01","subscription_port":8000,"preferred_ips_tls":[],"preferred_ips_http":[]}"#,
        )
        .unwrap();
        let record = InstallationStore::at(&path).load().unwrap();
        assert_eq!(record.sub_path, "sub");
        assert_eq!(record.protocols, vec![Scheme::Vmess]);
        assert_eq!(record.effective_domain(), Some("a.example.com"));
    }

    #[test]
    fn token_without_domain_is_rejected() {
        let mut config = sample_config();
        config.tunnel_token = Some("eyJh".into());
        assert!(config.validate().is_err());
        config.domain = Some("proxy.example.com".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn path_prefix_is_first_eight_chars() {
        assert_eq!(sample_config().path_prefix(), "11111111");
    }
}
