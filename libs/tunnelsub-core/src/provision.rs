use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use reqwest::Client;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::arch::Arch;
use crate::error::{CoreError, IoContext, Result};

pub const DEFAULT_MIRROR: &str = "https://github.91chi.fun/";
const FALLBACK_ENGINE_VERSION: &str = "1.11.15";
const ENGINE_RELEASE_API: &str = "https://api.github.com/repos/SagerNet/sing-box/releases/latest";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveKind {
    /// The download is the executable itself.
    Raw,
    /// A gzip'd tarball holding the executable under `member`.
    TarGz { member: String },
}

/// A named binary and where to get it for each architecture.
#[derive(Debug, Clone)]
pub struct BinarySpec {
    pub name: String,
    pub url_by_arch: HashMap<Arch, String>,
    pub archive: ArchiveKind,
}

impl BinarySpec {
    pub fn url_for(&self, arch: Arch) -> Result<&str> {
        self.url_by_arch
            .get(&arch)
            .map(String::as_str)
            .ok_or_else(|| CoreError::Provision {
                binary: self.name.clone(),
                reason: format!("no download available for {arch}"),
            })
    }
}

/// sing-box release archive for `version` (without the leading `v`).
pub fn engine_spec(version: &str) -> BinarySpec {
    let url_by_arch = [Arch::Amd64, Arch::Arm64, Arch::Arm]
        .into_iter()
        .map(|arch| {
            let url = format!(
                "https://github.com/SagerNet/sing-box/releases/download/v{version}/sing-box-{version}-linux-{}.tar.gz",
                arch.engine_asset_name()
            );
            (arch, url)
        })
        .collect();
    BinarySpec {
        name: "sing-box".to_string(),
        url_by_arch,
        archive: ArchiveKind::TarGz {
            member: "sing-box".to_string(),
        },
    }
}

pub fn tunnel_spec() -> BinarySpec {
    let url_by_arch = [Arch::Amd64, Arch::Arm64, Arch::Arm]
        .into_iter()
        .map(|arch| {
            let url = format!(
                "https://github.com/cloudflare/cloudflared/releases/latest/download/cloudflared-linux-{arch}"
            );
            (arch, url)
        })
        .collect();
    BinarySpec {
        name: "cloudflared".to_string(),
        url_by_arch,
        archive: ArchiveKind::Raw,
    }
}

/// Prefixes `url` with a GitHub mirror such as `https://mirror.example/`.
pub fn mirror_url(mirror: &str, url: &str) -> String {
    if mirror.ends_with('/') {
        format!("{mirror}{url}")
    } else {
        format!("{mirror}/{url}")
    }
}

#[derive(Deserialize)]
struct Release {
    tag_name: String,
}

pub struct Provisioner {
    client: Client,
    install_dir: PathBuf,
    mirror: Option<String>,
}

impl Provisioner {
    pub fn new(install_dir: impl Into<PathBuf>, mirror: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("tunnelsub/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(300))
            .build()?;
        Ok(Self {
            client,
            install_dir: install_dir.into(),
            mirror: mirror.filter(|m| !m.trim().is_empty()),
        })
    }

    /// Latest sing-box version tag, or a pinned fallback when GitHub is unreachable.
    pub async fn latest_engine_version(&self) -> String {
        let fetch = async {
            let release: Release = self
                .client
                .get(ENGINE_RELEASE_API)
                .timeout(Duration::from_secs(10))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            Ok::<_, reqwest::Error>(release.tag_name)
        };
        match fetch.await {
            Ok(tag) => tag.trim_start_matches('v').to_string(),
            Err(e) => {
                warn!("Failed to query latest sing-box release, using {FALLBACK_ENGINE_VERSION}: {e}");
                FALLBACK_ENGINE_VERSION.to_string()
            }
        }
    }

    /// Returns the binary's path, downloading it first if it is not present.
    pub async fn ensure(&self, spec: &BinarySpec, arch: Arch) -> Result<PathBuf> {
        self.ensure_with(spec, arch, false).await
    }

    /// Like [`ensure`](Self::ensure); `force` re-downloads an existing binary.
    pub async fn ensure_with(&self, spec: &BinarySpec, arch: Arch, force: bool) -> Result<PathBuf> {
        let target = self.install_dir.join(&spec.name);
        if target.exists() && !force {
            debug!("{} already present at {}", spec.name, target.display());
            return Ok(target);
        }
        std::fs::create_dir_all(&self.install_dir).with_path(&self.install_dir)?;

        let url = spec.url_for(arch)?;
        let primary_err = match self.fetch(url, spec, &target).await {
            Ok(()) => return Ok(target),
            Err(e) => e,
        };

        let Some(mirror) = &self.mirror else {
            return Err(CoreError::Provision {
                binary: spec.name.clone(),
                reason: primary_err.to_string(),
            });
        };

        let backup = mirror_url(mirror, url);
        warn!("Download of {} failed ({primary_err}), retrying via {backup}", spec.name);
        self.fetch(&backup, spec, &target)
            .await
            .map_err(|e| CoreError::Provision {
                binary: spec.name.clone(),
                reason: format!("primary: {primary_err}; mirror: {e}"),
            })?;
        Ok(target)
    }

    async fn fetch(&self, url: &str, spec: &BinarySpec, target: &Path) -> Result<()> {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} Downloading {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(spec.name.clone());
        pb.enable_steady_tick(Duration::from_millis(100));

        let result = self.fetch_inner(url, spec, target).await;
        match &result {
            Ok(()) => pb.finish_with_message(format!("✅ {}", spec.name)),
            Err(_) => pb.finish_with_message(format!("❌ {}", spec.name)),
        }
        result
    }

    async fn fetch_inner(&self, url: &str, spec: &BinarySpec, target: &Path) -> Result<()> {
        let tmp_tag = uuid::Uuid::new_v4().simple().to_string();
        let download = self.install_dir.join(format!(".{}.download.{tmp_tag}", spec.name));
        let staged = self.install_dir.join(format!(".{}.tmp.{tmp_tag}", spec.name));

        let result: Result<()> = async {
            self.download_to(url, &download).await?;
            match &spec.archive {
                ArchiveKind::Raw => {
                    tokio::fs::rename(&download, &staged)
                        .await
                        .with_path(&staged)?;
                }
                ArchiveKind::TarGz { member } => {
                    let archive = download.clone();
                    let member = member.clone();
                    let out = staged.clone();
                    tokio::task::spawn_blocking(move || extract_member(&archive, &member, &out))
                        .await
                        .map_err(|e| CoreError::Provision {
                            binary: spec.name.clone(),
                            reason: e.to_string(),
                        })??;
                }
            }

            std::fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o755))
                .with_path(&staged)?;
            // Rename over the old file so a running binary is never truncated.
            std::fs::rename(&staged, target).with_path(target)?;
            Ok(())
        }
        .await;

        let _ = std::fs::remove_file(&download);
        let _ = std::fs::remove_file(&staged);
        if result.is_ok() {
            info!("Installed {} to {}", spec.name, target.display());
        }
        result
    }

    /// Streams the response body to `dest` chunk by chunk.
    async fn download_to(&self, url: &str, dest: &Path) -> Result<()> {
        debug!("GET {url}");
        let mut response = self.client.get(url).send().await?.error_for_status()?;
        let mut file = tokio::fs::File::create(dest).await.with_path(dest)?;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await.with_path(dest)?;
        }
        file.sync_all().await.with_path(dest)?;
        Ok(())
    }
}

/// Copies the first regular file named `member` out of a `.tar.gz`.
fn extract_member(archive: &Path, member: &str, dest: &Path) -> Result<()> {
    let file = std::fs::File::open(archive).with_path(archive)?;
    let mut tar = tar::Archive::new(flate2::read::GzDecoder::new(file));
    for entry in tar.entries().with_path(archive)? {
        let mut entry = entry.with_path(archive)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let is_member = entry
            .path()
            .ok()
            .and_then(|p| p.file_name().map(|n| n == member))
            .unwrap_or(false);
        if is_member {
            entry.unpack(dest).with_path(dest)?;
            return Ok(());
        }
    }
    Err(CoreError::Provision {
        binary: member.to_string(),
        reason: format!("{} does not contain {member}", archive.display()),
    })
}
