use anyhow::{bail, Result};
use console::style;
use tracing::warn;
use tunnelsub_core::materialize::materialize;
use tunnelsub_core::materialize::tunnel::TunnelMode;
use tunnelsub_core::subscription::{self, Uploader};
use tunnelsub_core::{persistence, Component, ComponentState, InstallRecord, ResolvePolicy};

use crate::install::{
    announce, bring_up, print_summary, provision_binaries, publish_links, refresh_edges, Context,
};

fn load(ctx: &Context) -> Result<InstallRecord> {
    match ctx.store.load_optional()? {
        Some(record) => Ok(record),
        None => bail!(
            "nothing installed in {}; run `install` first",
            ctx.paths.root.display()
        ),
    }
}

pub async fn status(ctx: &Context) -> Result<()> {
    let Some(record) = ctx.store.load_optional()? else {
        println!("ℹ️ Not installed in {}", ctx.paths.root.display());
        return Ok(());
    };

    println!("{}", style("Components").bold());
    for (component, state) in ctx.launcher.status() {
        match state {
            ComponentState::Running(pid) => println!(
                "  {} {:<13} running (pid {})",
                style("●").green(),
                component.name(),
                pid
            ),
            ComponentState::Stopped(Some(pid)) => println!(
                "  {} {:<13} stopped (stale pid {})",
                style("●").red(),
                component.name(),
                pid
            ),
            ComponentState::Stopped(None) => {
                println!("  {} {:<13} stopped", style("●").red(), component.name())
            }
        }
    }

    let mode = TunnelMode::from_token(record.config.tunnel_token.as_deref())
        .map(|m| m.name())
        .unwrap_or("invalid");
    let links = subscription::read_links(&ctx.paths)?.unwrap_or_default();

    println!("{}", style("Installation").bold());
    println!("  Directory:     {}", ctx.paths.root.display());
    println!("  Installed:     {}", record.install_date);
    println!("  Tunnel mode:   {}", mode);
    println!("  Domain:        {}", record.effective_domain().unwrap_or("-"));
    println!("  UUID:          {}", record.config.uuid);
    println!("  Inbound port:  {}", record.config.listen_port);
    println!(
        "  Subscription:  :{}/{}",
        record.config.subscription_port, record.sub_path
    );
    println!("  Persistence:   {}", record.persistence);
    println!("  TLS edges:     {}", record.preferred_ips_tls.join(", "));
    println!("  HTTP edges:    {}", record.preferred_ips_http.join(", "));
    println!("  Links:         {}", links.len());
    println!("  Debug log:     {}", ctx.paths.debug_log().display());
    Ok(())
}

pub fn cat(ctx: &Context) -> Result<()> {
    match subscription::read_links(&ctx.paths)? {
        Some(links) if !links.is_empty() => {
            for link in links {
                println!("{link}");
            }
            Ok(())
        }
        _ => bail!("no links generated yet in {}", ctx.paths.root.display()),
    }
}

pub async fn stop(ctx: &Context) -> Result<()> {
    for component in Component::ALL {
        if ctx.launcher.stop(component).await {
            println!("✅ Stopped {}", component.name());
        } else {
            println!("ℹ️ {} not running, skipping", component.name());
        }
    }
    Ok(())
}

/// Relaunches from the saved record. A quick tunnel comes back with a new
/// hostname, so links are regenerated in that case.
pub async fn start(ctx: &Context) -> Result<()> {
    let mut record = load(ctx)?;
    ctx.launcher.stop_all().await;

    let materialized = materialize(&ctx.paths, &record)?;
    let previous = record.tunnel_domain.clone();
    bring_up(ctx, &mut record, &materialized, &ResolvePolicy::default()).await?;
    ctx.store.save(&record)?;

    let links_missing = subscription::read_links(&ctx.paths)?.map_or(true, |l| l.is_empty());
    if record.tunnel_domain != previous || links_missing {
        let uris = publish_links(ctx, &record).await?;
        announce(&record, &uris).await;
    }
    println!("{}", style("All components started").green());
    Ok(())
}

/// Whether this run probes with TCP only. An override applies to the
/// current run and is never written back to the record.
fn probe_fast(record: &InstallRecord, fast_override: Option<bool>) -> bool {
    fast_override.unwrap_or(record.fast)
}

pub async fn update(ctx: &Context, binaries: bool, fast_override: Option<bool>) -> Result<()> {
    let mut record = load(ctx)?;
    let fast = probe_fast(&record, fast_override);
    ctx.launcher.stop_all().await;

    if binaries {
        provision_binaries(&ctx.paths, record.mirror.clone(), true).await?;
    }
    let materialized = materialize(&ctx.paths, &record)?;
    bring_up(ctx, &mut record, &materialized, &ResolvePolicy::default()).await?;
    refresh_edges(&mut record, fast).await;
    ctx.store.save(&record)?;

    let uris = publish_links(ctx, &record).await?;
    announce(&record, &uris).await;
    print_summary(ctx, &record, &uris);
    Ok(())
}

pub async fn uninstall(ctx: &Context) -> Result<()> {
    println!("{}", style("Uninstalling tunnelsub...").bold());
    let record = match ctx.store.load_optional() {
        Ok(record) => record,
        Err(e) => {
            warn!("Installation record unreadable, continuing: {}", e);
            None
        }
    };

    // Nodes pushed directly (no project URL) are withdrawn from the aggregator.
    if let Some(record) = &record {
        if let (Some(upload_url), None) = (&record.upload_url, &record.project_url) {
            let links = subscription::read_links(&ctx.paths).ok().flatten().unwrap_or_default();
            if !links.is_empty() {
                let result = match Uploader::new(upload_url) {
                    Ok(uploader) => uploader.delete_nodes(&links).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    warn!("Failed to delete nodes from {}: {}", upload_url, e);
                }
            }
        }
    }

    stop(ctx).await?;

    match persistence::remove(&ctx.paths.root) {
        Ok(removed) if removed.is_empty() => println!("ℹ️ No boot entries found, skipping"),
        Ok(removed) => {
            for entry in removed {
                println!("✅ Removed {}", entry);
            }
        }
        Err(e) => warn!("Failed to remove boot entries: {}", e),
    }

    if ctx.paths.root.exists() {
        std::fs::remove_dir_all(&ctx.paths.root)?;
        println!("✅ Removed {}", ctx.paths.root.display());
    } else {
        println!("ℹ️ {} not found, skipping", ctx.paths.root.display());
    }

    println!("{}", style("Uninstall complete").green());
    Ok(())
}
