use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

const META_URL: &str = "https://speed.cloudflare.com/meta";

#[derive(Debug, Deserialize)]
struct Meta {
    #[serde(default)]
    country: Option<String>,
    #[serde(rename = "asOrganization", default)]
    as_organization: Option<String>,
}

/// `<country>-<isp>` from Cloudflare's meta endpoint, underscores for spaces.
fn label_from(meta: &Meta) -> Option<String> {
    let parts: Vec<String> = [meta.country.as_deref(), meta.as_organization.as_deref()]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.replace(' ', "_"))
        .collect();
    (!parts.is_empty()).then(|| parts.join("-"))
}

/// Best-effort ISP/region label for link remarks.
pub async fn isp_label() -> Option<String> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .ok()?;
    let meta: Meta = match client.get(META_URL).send().await {
        Ok(resp) => resp.json().await.ok()?,
        Err(e) => {
            debug!("ISP lookup failed: {e}");
            return None;
        }
    };
    label_from(&meta)
}

/// `NAME` if set, else the first ten characters of the host name.
pub fn node_label(name: Option<&str>, hostname: &str, isp: Option<&str>) -> String {
    let base = name
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(String::from)
        .unwrap_or_else(|| hostname.chars().take(10).collect());
    match isp {
        Some(isp) if !isp.is_empty() => format!("{base}-{isp}"),
        _ => base,
    }
}
