use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use rand::Rng;
use tracing::{info, warn};
use tunnelsub_core::arch::Arch;
use tunnelsub_core::error::CoreError;
use tunnelsub_core::links::links_for_record;
use tunnelsub_core::materialize::engine::ws_path;
use tunnelsub_core::materialize::{materialize, Materialized};
use tunnelsub_core::probe::prefer_edges;
use tunnelsub_core::provision::{engine_spec, tunnel_spec, Provisioner};
use tunnelsub_core::subscription::{self, validate_sub_path, Uploader};
use tunnelsub_core::{
    meta, persistence, Component, InstallPaths, InstallRecord, InstallationConfig,
    InstallationStore, LaunchSpec, ProcessLauncher, ResolvePolicy, Scheme, TunnelSession,
};

use crate::cli::InstallArgs;

/// Everything commands need to act on one installation directory.
pub struct Context {
    pub paths: InstallPaths,
    pub store: InstallationStore,
    pub launcher: ProcessLauncher,
}

impl Context {
    pub fn new(paths: InstallPaths) -> Self {
        Self {
            store: InstallationStore::new(&paths),
            launcher: ProcessLauncher::new(paths.clone()),
            paths,
        }
    }
}

fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Turns CLI/env options into a validated installation record.
pub fn build_record(args: &InstallArgs) -> Result<InstallRecord> {
    let uuid = non_empty(args.uuid.clone()).unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let listen_port = args
        .port
        .unwrap_or_else(|| rand::rng().random_range(10000..60000));

    let config = InstallationConfig {
        uuid,
        listen_port,
        domain: non_empty(args.domain.clone()),
        tunnel_token: non_empty(args.token.clone()),
        subscription_port: args.subs_port,
    };
    config.validate()?;

    let mut protocols: Vec<Scheme> = Vec::new();
    for p in &args.protocols {
        let scheme = Scheme::from(*p);
        if !protocols.contains(&scheme) {
            protocols.push(scheme);
        }
    }
    if protocols.is_empty() {
        bail!("at least one protocol must be enabled");
    }
    let last_port = u32::from(listen_port) + protocols.len() as u32 - 1;
    if (u32::from(listen_port)..=last_port).contains(&u32::from(args.subs_port)) {
        bail!(
            "subscription port {} collides with inbound ports {}-{}",
            args.subs_port,
            listen_port,
            last_port
        );
    }

    let mut record = InstallRecord::new(config);
    record.sub_path = validate_sub_path(&args.sub_path)?.to_string();
    record.protocols = protocols;
    record.node_name = non_empty(args.name.clone());
    record.cdn_host = non_empty(args.cdn_host.clone());
    record.cdn_port = args.cdn_port;
    record.upload_url = non_empty(args.upload_url.clone());
    record.project_url = non_empty(args.project_url.clone());
    record.auto_access = args.auto_access;
    record.mirror = non_empty(Some(args.mirror.clone()));
    record.persistence = args.persistence.into();
    record.fast = args.fast;
    record.no_probe = args.no_probe;
    Ok(record)
}

/// Makes sure sing-box and cloudflared are present; `force` re-downloads both.
pub async fn provision_binaries(paths: &InstallPaths, mirror: Option<String>, force: bool) -> Result<()> {
    let arch = Arch::detect()?;
    info!("Detected architecture {arch}");
    let provisioner = Provisioner::new(&paths.root, mirror)?;

    if force || !paths.engine_bin().exists() {
        let version = provisioner.latest_engine_version().await;
        provisioner.ensure_with(&engine_spec(&version), arch, force).await?;
    }
    provisioner.ensure_with(&tunnel_spec(), arch, force).await?;
    Ok(())
}

fn engine_launch(paths: &InstallPaths) -> LaunchSpec {
    LaunchSpec::new(
        paths.engine_bin(),
        vec![
            "run".to_string(),
            "-c".to_string(),
            paths.engine_config().display().to_string(),
        ],
    )
}

fn subscription_launch(paths: &InstallPaths) -> Result<LaunchSpec> {
    let exe = std::env::current_exe().context("Failed to locate own executable")?;
    Ok(LaunchSpec::new(
        exe,
        vec![
            "--dir".to_string(),
            paths.root.display().to_string(),
            "serve".to_string(),
        ],
    ))
}

/// Starts engine, subscription server and tunnel.
pub async fn bring_up(
    ctx: &Context,
    record: &mut InstallRecord,
    materialized: &Materialized,
    policy: &ResolvePolicy,
) -> Result<()> {
    ctx.launcher.launch(Component::Engine, &engine_launch(&ctx.paths))?;
    ctx.launcher
        .launch(Component::Subscription, &subscription_launch(&ctx.paths)?)?;
    start_tunnel(ctx, record, materialized, policy).await
}

/// Starts the tunnel client. Only a quick tunnel without a fixed domain
/// waits for its trycloudflare hostname, which is stored on `record`.
pub async fn start_tunnel(
    ctx: &Context,
    record: &mut InstallRecord,
    materialized: &Materialized,
    policy: &ResolvePolicy,
) -> Result<()> {
    let tunnel = LaunchSpec::new(ctx.paths.tunnel_bin(), materialized.tunnel_args.clone());
    let fixed_domain = record.config.domain.as_deref().is_some_and(|d| !d.is_empty());
    if !materialized.mode.is_quick() || fixed_domain {
        ctx.launcher.launch(Component::Tunnel, &tunnel)?;
        record.tunnel_domain = None;
        return Ok(());
    }

    let pb = spinner("Waiting for the quick tunnel hostname");
    let mut session = TunnelSession::start(ctx.launcher.clone(), tunnel).await?;
    let resolved = session.resolve_domain(policy).await;
    match resolved {
        Ok(Some(domain)) => {
            pb.finish_with_message(format!("✅ Tunnel hostname {domain}"));
            record.tunnel_domain = Some(domain);
            Ok(())
        }
        Ok(None) => {
            pb.finish_with_message("❌ Tunnel hostname not found");
            Err(CoreError::DomainUnresolved {
                attempts: policy.max_attempts,
            }
            .into())
        }
        Err(e) => {
            pb.finish_with_message("❌ Tunnel restart failed");
            Err(e.into())
        }
    }
}

/// Stops whatever a failed install started and forgets its record, so the
/// next `install` does not need `--force`.
pub async fn roll_back(ctx: &Context) {
    ctx.launcher.stop_all().await;
    match ctx.store.remove() {
        Ok(_) => info!("Rolled back partial install in {}", ctx.paths.root.display()),
        Err(e) => warn!("Could not remove installation record: {}", e),
    }
}

/// Re-probes edge IPs and stores the winners on `record`. `fast` limits
/// the TLS round to plain TCP connects.
pub async fn refresh_edges(record: &mut InstallRecord, fast: bool) {
    if record.no_probe {
        record.preferred_ips_tls.clear();
        record.preferred_ips_http.clear();
        return;
    }
    let scheme = record.protocols.first().copied().unwrap_or(Scheme::Vmess);
    let path = format!("{}?ed=2048", ws_path(record.config.path_prefix(), scheme));
    let domain = record.effective_domain().map(String::from);

    let pb = spinner("Probing Cloudflare edge IPs");
    let edges = prefer_edges(domain.as_deref(), &path, fast).await;
    pb.finish_with_message(format!(
        "✅ Preferred edges: {} TLS, {} HTTP",
        edges.tls.len(),
        edges.http.len()
    ));
    record.preferred_ips_tls = edges.tls;
    record.preferred_ips_http = edges.http;
}

/// Assembles links for `record` and writes the subscription files.
pub async fn publish_links(ctx: &Context, record: &InstallRecord) -> Result<Vec<String>> {
    let hostname = sysinfo::System::host_name().unwrap_or_else(|| "node".to_string());
    let isp = meta::isp_label().await;
    let label = meta::node_label(record.node_name.as_deref(), &hostname, isp.as_deref());

    let links = links_for_record(record, &label)?;
    let uris: Vec<String> = links.iter().map(|l| l.to_uri()).collect();
    subscription::publish(&ctx.paths, &uris)?;
    Ok(uris)
}

/// Upload and keep-alive registration. Failures are logged and ignored.
pub async fn announce(record: &InstallRecord, uris: &[String]) {
    if let Some(upload_url) = &record.upload_url {
        let result = match Uploader::new(upload_url) {
            Ok(uploader) => match &record.project_url {
                Some(project) => {
                    let url = Uploader::subscription_url(project, &record.sub_path);
                    uploader.add_subscription(&url).await
                }
                None => uploader.add_nodes(uris).await,
            },
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!("Upload to {} failed: {}", upload_url, e);
        }
    }

    if record.auto_access {
        match &record.project_url {
            Some(project) => {
                if let Err(e) =
                    subscription::register_keepalive(subscription::DEFAULT_KEEPALIVE_URL, project).await
                {
                    warn!("Keep-alive registration failed: {}", e);
                }
            }
            None => warn!("AUTO_ACCESS is set but PROJECT_URL is empty, skipping keep-alive"),
        }
    }
}

pub fn print_summary(ctx: &Context, record: &InstallRecord, uris: &[String]) {
    let host = sysinfo::System::host_name().unwrap_or_else(|| "<server-ip>".to_string());
    println!();
    println!("{}", style("Installation ready").bold().green());
    println!("  Directory:     {}", ctx.paths.root.display());
    println!("  Domain:        {}", record.effective_domain().unwrap_or("-"));
    println!("  UUID:          {}", record.config.uuid);
    println!(
        "  Protocols:     {}",
        record
            .protocols
            .iter()
            .map(Scheme::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!(
        "  Subscription:  http://{}:{}/{}",
        host, record.config.subscription_port, record.sub_path
    );
    if let Some(project) = &record.project_url {
        println!(
            "  Public sub:    {}",
            Uploader::subscription_url(project, &record.sub_path)
        );
    }
    println!();
    for uri in uris {
        println!("{uri}");
    }
    println!();
}

pub async fn install(ctx: &Context, args: &InstallArgs) -> Result<()> {
    if ctx.store.exists() && !args.force {
        bail!(
            "already installed in {}; run `update`, or `install --force` to start over",
            ctx.paths.root.display()
        );
    }
    let mut record = build_record(args)?;
    ctx.paths.ensure_root()?;
    if args.force {
        ctx.launcher.stop_all().await;
    }

    provision_binaries(&ctx.paths, record.mirror.clone(), false).await?;
    let materialized = materialize(&ctx.paths, &record)?;
    info!("Tunnel mode: {}", materialized.mode.name());
    ctx.store.save(&record)?;

    let policy = ResolvePolicy {
        max_attempts: args.resolve_attempts,
        ..ResolvePolicy::default()
    };
    if let Err(e) = bring_up(ctx, &mut record, &materialized, &policy).await {
        roll_back(ctx).await;
        return Err(e);
    }
    let fast = record.fast;
    refresh_edges(&mut record, fast).await;
    ctx.store.save(&record)?;

    let uris = publish_links(ctx, &record).await?;
    announce(&record, &uris).await;

    let exe = std::env::current_exe().context("Failed to locate own executable")?;
    match persistence::install(record.persistence, &exe, &ctx.paths.root) {
        Ok(()) => info!("Persistence: {}", record.persistence),
        Err(e) => warn!("Could not set up {} persistence: {}", record.persistence, e),
    }

    print_summary(ctx, &record, &uris);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Commands};
    use clap::Parser;
    use std::sync::{Arc, Mutex};
    use tunnelsub_core::materialize::tunnel::TunnelMode;
    use tunnelsub_core::InstallPaths;

    fn parse(extra: &[&str]) -> InstallArgs {
        let mut argv = vec!["tunnelsub", "install"];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Install(args) => args,
            _ => unreachable!(),
        }
    }

    #[test]
    fn record_defaults_fill_uuid_and_port() {
        let record = build_record(&parse(&[])).unwrap();
        assert!(uuid::Uuid::parse_str(&record.config.uuid).is_ok());
        assert!((10000..60000).contains(&record.config.listen_port));
        assert_eq!(record.protocols, [Scheme::Vmess]);
    }

    #[test]
    fn token_without_domain_fails() {
        assert!(build_record(&parse(&["--token", "eyJh"])).is_err());
    }

    #[test]
    fn subscription_port_cannot_overlap_inbounds() {
        let err = build_record(&parse(&[
            "--port",
            "8000",
            "--subs-port",
            "8001",
            "--protocols",
            "vmess,vless",
        ]));
        assert!(err.is_err());
    }

    #[test]
    fn duplicate_protocols_collapse() {
        let record = build_record(&parse(&["--protocols", "vless,vless"])).unwrap();
        assert_eq!(record.protocols, [Scheme::Vless]);
    }

    fn record_for(domain: Option<&str>) -> InstallRecord {
        InstallRecord::new(InstallationConfig {
            uuid: "11111111-2222-3333-4444-555555555555".to_string(),
            listen_port: 20000,
            domain: domain.map(String::from),
            tunnel_token: None,
            subscription_port: 8000,
        })
    }

    /// Points `cloudflared` at `/bin/sh` so `script` plays the tunnel client.
    fn fake_tunnel(ctx: &Context, script: &str) -> Materialized {
        ctx.paths.ensure_root().unwrap();
        std::os::unix::fs::symlink("/bin/sh", ctx.paths.tunnel_bin()).unwrap();
        Materialized {
            mode: TunnelMode::Quick,
            tunnel_args: vec!["-c".to_string(), script.to_string()],
        }
    }

    fn short_policy(max_attempts: u32, polls_per_attempt: u32) -> ResolvePolicy {
        ResolvePolicy {
            max_attempts,
            poll_interval: Duration::from_millis(50),
            polls_per_attempt,
        }
    }

    #[tokio::test]
    async fn supplied_domain_skips_hostname_wait() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::new(InstallPaths::new(dir.path()));
        let materialized = fake_tunnel(&ctx, "exec sleep 30");
        let mut record = record_for(Some("proxy.example.com"));

        start_tunnel(&ctx, &mut record, &materialized, &short_policy(0, 1))
            .await
            .unwrap();
        assert!(ctx.launcher.state(Component::Tunnel).is_running());
        assert_eq!(record.tunnel_domain, None);
        assert_eq!(record.effective_domain(), Some("proxy.example.com"));

        ctx.launcher.stop_all().await;
    }

    #[tokio::test]
    async fn quick_tunnel_hostname_comes_from_log() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::new(InstallPaths::new(dir.path()));
        let materialized = fake_tunnel(
            &ctx,
            "echo 'INF |  https://calm-lake-7.trycloudflare.com  |'; exec sleep 30",
        );
        let mut record = record_for(None);

        start_tunnel(&ctx, &mut record, &materialized, &short_policy(0, 40))
            .await
            .unwrap();
        assert_eq!(
            record.tunnel_domain.as_deref(),
            Some("calm-lake-7.trycloudflare.com")
        );

        ctx.launcher.stop_all().await;
    }

    #[tokio::test]
    async fn unresolved_hostname_rolls_back_install() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::new(InstallPaths::new(dir.path()));
        let materialized = fake_tunnel(&ctx, "exec sleep 30");
        let mut record = record_for(None);
        ctx.store.save(&record).unwrap();
        let engine = LaunchSpec::new("/bin/sh", vec!["-c".to_string(), "exec sleep 30".to_string()]);
        let engine_pid = ctx.launcher.launch(Component::Engine, &engine).unwrap();

        let err = start_tunnel(&ctx, &mut record, &materialized, &short_policy(0, 2))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CoreError>(),
            Some(CoreError::DomainUnresolved { .. })
        ));

        roll_back(&ctx).await;
        assert!(!ctx.store.exists());
        assert!(!tunnelsub_core::launcher::pid_alive(engine_pid));
        assert!(!ctx.launcher.state(Component::Tunnel).is_running());
    }

    type Seen = Arc<Mutex<Vec<(String, String)>>>;

    /// Aggregator stand-in recording each request's path and body.
    async fn aggregator() -> (String, Seen) {
        let seen: Seen = Arc::default();
        let recorder = seen.clone();
        let app = axum::Router::new().fallback(move |uri: axum::http::Uri, body: String| {
            let recorder = recorder.clone();
            async move {
                recorder.lock().unwrap().push((uri.path().to_string(), body));
                axum::http::StatusCode::OK
            }
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{addr}"), seen)
    }

    #[tokio::test]
    async fn announce_registers_subscription_when_project_url_set() {
        let (base, seen) = aggregator().await;
        let mut record = record_for(None);
        record.upload_url = Some(base);
        record.project_url = Some("https://app.example.com".to_string());

        announce(&record, &["vmess://abc".to_string()]).await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(
                "/api/add-subscriptions".to_string(),
                r#"{"subscription":["https://app.example.com/sub"]}"#.to_string()
            )]
        );
    }

    #[tokio::test]
    async fn announce_pushes_nodes_without_project_url() {
        let (base, seen) = aggregator().await;
        let mut record = record_for(None);
        record.upload_url = Some(base);

        announce(&record, &["vmess://abc".to_string(), "vless://def".to_string()]).await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(
                "/api/add-nodes".to_string(),
                r#"{"nodes":["vmess://abc","vless://def"]}"#.to_string()
            )]
        );
    }
}
