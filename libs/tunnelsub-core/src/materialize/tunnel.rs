use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::links::Scheme;
use crate::materialize::engine::{inbound_port, ws_path};
use crate::store::InstallationConfig;

/// Named-tunnel credentials as downloaded from the Cloudflare dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelCredentials {
    #[serde(rename = "AccountTag")]
    pub account_tag: String,
    #[serde(rename = "TunnelSecret")]
    pub tunnel_secret: String,
    #[serde(rename = "TunnelID")]
    pub tunnel_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TunnelMode {
    /// Ephemeral `trycloudflare.com` hostname assigned at startup.
    Quick,
    /// Named tunnel driven by a connector token; ingress lives on the dashboard.
    Token(String),
    /// Named tunnel driven by a local credentials file and ingress YAML.
    Credentials(TunnelCredentials),
}

impl TunnelMode {
    pub fn from_token(token: Option<&str>) -> Result<Self> {
        let Some(token) = token.map(str::trim).filter(|t| !t.is_empty()) else {
            return Ok(TunnelMode::Quick);
        };
        if token.contains("TunnelSecret") {
            let credentials: TunnelCredentials = serde_json::from_str(token)
                .map_err(|e| CoreError::config(format!("tunnel credentials JSON is invalid: {e}")))?;
            return Ok(TunnelMode::Credentials(credentials));
        }
        Ok(TunnelMode::Token(token.to_string()))
    }

    pub fn name(&self) -> &'static str {
        match self {
            TunnelMode::Quick => "quick",
            TunnelMode::Token(_) => "token",
            TunnelMode::Credentials(_) => "credentials",
        }
    }

    pub fn is_quick(&self) -> bool {
        matches!(self, TunnelMode::Quick)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngressRule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub service: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelFile {
    pub tunnel: String,
    #[serde(rename = "credentials-file")]
    pub credentials_file: String,
    pub protocol: String,
    pub ingress: Vec<IngressRule>,
}

/// Ingress routing each protocol's websocket path to its local inbound,
/// followed by the catch-all 404.
pub fn render_ingress(
    credentials: &TunnelCredentials,
    credentials_file: &Path,
    config: &InstallationConfig,
    domain: &str,
    protocols: &[Scheme],
) -> Result<TunnelFile> {
    let mut ingress = protocols
        .iter()
        .enumerate()
        .map(|(i, &scheme)| {
            Ok(IngressRule {
                hostname: Some(domain.to_string()),
                path: Some(format!("^{}", ws_path(config.path_prefix(), scheme))),
                service: format!("http://localhost:{}", inbound_port(config, i)?),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    ingress.push(IngressRule {
        hostname: None,
        path: None,
        service: "http_status:404".to_string(),
    });

    Ok(TunnelFile {
        tunnel: credentials.tunnel_id.clone(),
        credentials_file: credentials_file.display().to_string(),
        protocol: "http2".to_string(),
        ingress,
    })
}

/// Arguments passed to `cloudflared` for the given mode.
pub fn tunnel_args(mode: &TunnelMode, listen_port: u16, tunnel_yaml: &Path) -> Vec<String> {
    let mut args: Vec<String> = ["tunnel", "--edge-ip-version", "auto", "--no-autoupdate"]
        .into_iter()
        .map(String::from)
        .collect();
    match mode {
        TunnelMode::Quick => {
            args.extend([
                "--protocol".to_string(),
                "http2".to_string(),
                "--url".to_string(),
                format!("http://localhost:{listen_port}"),
            ]);
        }
        TunnelMode::Token(token) => {
            args.extend([
                "--protocol".to_string(),
                "http2".to_string(),
                "run".to_string(),
                "--token".to_string(),
                token.clone(),
            ]);
        }
        TunnelMode::Credentials(_) => {
            args.extend([
                "--config".to_string(),
                tunnel_yaml.display().to_string(),
                "run".to_string(),
            ]);
        }
    }
    args
}
