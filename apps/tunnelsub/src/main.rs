use clap::Parser;
use console::style;
use std::process::exit;
use tunnelsub_core::InstallPaths;

mod cli;
mod install;
mod logging;
mod manage;
mod server;

use cli::{fast_override, Cli, Commands};
use install::Context;

async fn run(cli: Cli, ctx: Context) -> anyhow::Result<()> {
    match cli.command {
        Commands::Install(args) => {
            println!("{}", style(format!("tunnelsub v{}", env!("CARGO_PKG_VERSION"))).bold().cyan());
            println!("{}", style("=================").cyan());
            install::install(&ctx, &args).await
        }
        Commands::Status => manage::status(&ctx).await,
        Commands::Update {
            binaries,
            fast,
            no_fast,
        } => manage::update(&ctx, binaries, fast_override(fast, no_fast)).await,
        Commands::Uninstall => manage::uninstall(&ctx).await,
        Commands::Cat => manage::cat(&ctx),
        Commands::Start => manage::start(&ctx).await,
        Commands::Stop => manage::stop(&ctx).await,
        Commands::Serve => server::serve(ctx.paths).await,
    }
}

#[tokio::main]
async fn main() {
    // A missing .env is the normal case.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let paths = InstallPaths::new(cli.dir.clone().unwrap_or_else(InstallPaths::default_root));
    if matches!(cli.command, Commands::Install(_)) {
        if let Err(e) = paths.ensure_root() {
            eprintln!("{}", style(format!("Error: {}", e)).red());
            exit(1);
        }
    }
    let guard = logging::init(&paths);

    let code = match run(cli, Context::new(paths)).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("{}", style(format!("Error: {:#}", e)).red());
            1
        }
    };
    drop(guard);
    exit(code);
}
