use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use tunnelsub_core::links::links_for_record;
use tunnelsub_core::materialize::materialize;
use tunnelsub_core::subscription::{decode_subscription, publish};
use tunnelsub_core::{InstallPaths, InstallRecord, InstallationConfig, InstallationStore, Scheme};

fn record() -> InstallRecord {
    InstallRecord::new(InstallationConfig {
        uuid: "11111111-2222-3333-4444-555555555555".to_string(),
        listen_port: 12345,
        domain: None,
        tunnel_token: None,
        subscription_port: 8000,
    })
}

#[test]
fn quick_tunnel_install_produces_decodable_subscription() {
    let dir = tempfile::tempdir().unwrap();
    let paths = InstallPaths::new(dir.path());
    let store = InstallationStore::new(&paths);

    let mut rec = record();
    store.save(&rec).unwrap();
    let out = materialize(&paths, &rec).unwrap();
    assert!(out.tunnel_args.contains(&"http://localhost:12345".to_string()));

    rec = store
        .update(|r| {
            r.tunnel_domain = Some("example.trycloudflare.com".into());
            r.preferred_ips_tls = vec!["104.16.0.1".into(), "104.17.0.1".into()];
            r.preferred_ips_http = vec!["104.18.0.1".into()];
        })
        .unwrap();

    let links = links_for_record(&rec, "node").unwrap();
    assert_eq!(links.len(), 5);
    assert!(links.iter().all(|l| l.is_valid_for(&rec.config)));

    let uris: Vec<String> = links.iter().map(|l| l.to_uri()).collect();
    let blob = publish(&paths, &uris).unwrap();
    let decoded = decode_subscription(&blob).unwrap();
    assert_eq!(decoded, uris);

    let last = decoded.last().unwrap().strip_prefix("vmess://").unwrap();
    let json: serde_json::Value =
        serde_json::from_slice(&STANDARD_NO_PAD.decode(last).unwrap()).unwrap();
    assert_eq!(json["add"], "example.trycloudflare.com");
    assert_eq!(json["id"], "11111111-2222-3333-4444-555555555555");
    assert!(json["path"].as_str().unwrap().starts_with("/11111111-vm"));
}

#[test]
fn fixed_domain_with_credentials_serves_all_protocols() {
    let dir = tempfile::tempdir().unwrap();
    let paths = InstallPaths::new(dir.path());

    let mut rec = record();
    rec.config.domain = Some("proxy.example.com".into());
    rec.config.tunnel_token =
        Some(r#"{"AccountTag":"a","TunnelSecret":"s","TunnelID":"t"}"#.into());
    rec.protocols = Scheme::ALL.to_vec();
    materialize(&paths, &rec).unwrap();

    let links = links_for_record(&rec, "node").unwrap();
    let schemes: Vec<&str> = links.iter().map(|l| l.scheme.as_str()).collect();
    assert_eq!(schemes, ["vmess", "vless", "trojan", "vmess", "vless", "trojan"]);
    assert!(links[1].to_uri().contains("path=%2F11111111-vl%3Fed%3D2048"));
}

#[test]
fn links_need_a_domain() {
    assert!(links_for_record(&record(), "node").is_err());
}
