use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::links::Scheme;
use crate::store::InstallationConfig;

/// Websocket path for one protocol, e.g. `/11111111-vm`.
pub fn ws_path(prefix: &str, scheme: Scheme) -> String {
    format!("/{}{}", prefix, scheme.path_suffix())
}

/// Local port of the `index`-th enabled protocol.
pub fn inbound_port(config: &InstallationConfig, index: usize) -> Result<u16> {
    u16::try_from(index)
        .ok()
        .and_then(|i| config.listen_port.checked_add(i))
        .ok_or_else(|| {
            CoreError::config(format!(
                "port {} leaves no room for {} inbound(s)",
                config.listen_port,
                index + 1
            ))
        })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    pub log: LogConfig,
    pub inbounds: Vec<Inbound>,
    pub outbounds: Vec<Outbound>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogConfig {
    pub disabled: bool,
    pub level: String,
    pub timestamp: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Inbound {
    #[serde(rename = "type")]
    pub protocol_type: Scheme,
    pub tag: String,
    pub listen: String,
    pub listen_port: u16,
    pub users: Vec<EngineUser>,
    pub transport: Transport,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EngineUser {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(rename = "alterId", skip_serializing_if = "Option::is_none")]
    pub alter_id: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transport {
    #[serde(rename = "type")]
    pub transport_type: String,
    pub path: String,
    pub max_early_data: u32,
    pub early_data_header_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Outbound {
    #[serde(rename = "type")]
    pub outbound_type: String,
    pub tag: String,
}

fn user_for(scheme: Scheme, uuid: &str) -> EngineUser {
    match scheme {
        Scheme::Vmess => EngineUser {
            uuid: Some(uuid.to_string()),
            alter_id: Some(0),
            ..Default::default()
        },
        Scheme::Vless => EngineUser {
            uuid: Some(uuid.to_string()),
            ..Default::default()
        },
        Scheme::Trojan => EngineUser {
            password: Some(uuid.to_string()),
            ..Default::default()
        },
    }
}

/// One loopback websocket inbound per protocol, on consecutive ports.
pub fn render(config: &InstallationConfig, protocols: &[Scheme]) -> Result<EngineConfig> {
    if protocols.is_empty() {
        return Err(CoreError::config("no protocols enabled"));
    }

    let inbounds = protocols
        .iter()
        .enumerate()
        .map(|(i, &scheme)| {
            Ok(Inbound {
                protocol_type: scheme,
                tag: format!("{scheme}-ws-in"),
                listen: "127.0.0.1".to_string(),
                listen_port: inbound_port(config, i)?,
                users: vec![user_for(scheme, &config.uuid)],
                transport: Transport {
                    transport_type: "ws".to_string(),
                    path: ws_path(config.path_prefix(), scheme),
                    max_early_data: 2048,
                    early_data_header_name: "Sec-WebSocket-Protocol".to_string(),
                },
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(EngineConfig {
        log: LogConfig {
            disabled: false,
            level: "info".to_string(),
            timestamp: true,
        },
        inbounds,
        outbounds: vec![Outbound {
            outbound_type: "direct".to_string(),
            tag: "direct".to_string(),
        }],
    })
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

    #[test]
    fn vmess_inbound_matches_engine_schema() {
        let rendered = render(&config(), &[Scheme::Vmess]).unwrap();
        let value = serde_json::to_value(&rendered).unwrap();
        let inbound = &value["inbounds"][0];
        assert_eq!(inbound["type"], "vmess");
        assert_eq!(inbound["listen"], "127.0.0.1");
        assert_eq!(inbound["listen_port"], 12345);
        assert_eq!(inbound["users"][0]["uuid"], "11111111-2222-3333-4444-555555555555");
        assert_eq!(inbound["users"][0]["alterId"], 0);
        assert_eq!(inbound["transport"]["path"], "/11111111-vm");
        assert_eq!(inbound["transport"]["early_data_header_name"], "Sec-WebSocket-Protocol");
        assert_eq!(value["outbounds"][0]["type"], "direct");
    }

    #[test]
    fn protocols_get_consecutive_ports_and_own_users() {
        let rendered = render(&config(), &Scheme::ALL).unwrap();
        let ports: Vec<u16> = rendered.inbounds.iter().map(|i| i.listen_port).collect();
        assert_eq!(ports, [12345, 12346, 12347]);

        let trojan = serde_json::to_value(&rendered.inbounds[2]).unwrap();
        assert_eq!(trojan["users"][0]["password"], "11111111-2222-3333-4444-555555555555");
        assert!(trojan["users"][0].get("uuid").is_none());
        assert_eq!(trojan["transport"]["path"], "/11111111-tr");
    }

    #[test]
    fn port_overflow_is_a_config_error() {
        let mut cfg = config();
        cfg.listen_port = u16::MAX;
        assert!(render(&cfg, &Scheme::ALL).is_err());
    }
}
