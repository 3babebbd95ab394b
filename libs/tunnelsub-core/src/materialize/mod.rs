//! Renders the proxy engine and tunnel client configuration into the
//! installation directory.

pub mod engine;
pub mod tunnel;

use tracing::info;

use crate::error::{CoreError, Result};
use crate::store::{write_atomic, InstallPaths, InstallRecord};
use tunnel::TunnelMode;

/// What the launcher needs to start the tunnel client.
#[derive(Debug, Clone)]
pub struct Materialized {
    pub mode: TunnelMode,
    pub tunnel_args: Vec<String>,
}

/// Writes `sb.json` and, for credential tunnels, `tunnel.json` + `tunnel.yml`.
pub fn materialize(paths: &InstallPaths, record: &InstallRecord) -> Result<Materialized> {
    let config = &record.config;
    config.validate()?;

    let mode = TunnelMode::from_token(config.tunnel_token.as_deref())?;
    if !matches!(mode, TunnelMode::Credentials(_)) && record.protocols.len() > 1 {
        return Err(CoreError::config(format!(
            "{} tunnels route a single port; multiple protocols need a credentials JSON token",
            mode.name()
        )));
    }

    let engine_config = engine::render(config, &record.protocols)?;
    let engine_path = paths.engine_config();
    write_atomic(&engine_path, serde_json::to_string_pretty(&engine_config)?.as_bytes())?;
    info!("Wrote engine config to {}", engine_path.display());

    if let TunnelMode::Credentials(credentials) = &mode {
        let domain = config
            .domain
            .as_deref()
            .filter(|d| !d.is_empty())
            .ok_or_else(|| CoreError::config("credential tunnels require --domain"))?;
        let creds_path = paths.tunnel_credentials();
        write_atomic(&creds_path, serde_json::to_string(credentials)?.as_bytes())?;

        let file = tunnel::render_ingress(credentials, &creds_path, config, domain, &record.protocols)?;
        let yaml_path = paths.tunnel_yaml();
        write_atomic(&yaml_path, serde_yaml::to_string(&file)?.as_bytes())?;
        info!("Wrote tunnel ingress to {}", yaml_path.display());
    }

    let tunnel_args = tunnel::tunnel_args(&mode, config.listen_port, &paths.tunnel_yaml());
    Ok(Materialized { mode, tunnel_args })
}
