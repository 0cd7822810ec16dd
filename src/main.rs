//! lspipe - supervised JSON-RPC transport for language servers

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lspipe::app::App;
use lspipe::cli::{Cli, Commands};

fn main() {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries JSON output, or frames in echo mode
    let default_filter = if cli.verbose {
        "lspipe=debug"
    } else {
        "lspipe=warn"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!(
                r#"{{"success":false,"error":"Failed to create runtime: {}"}}"#,
                e
            );
            std::process::exit(1);
        }
    };
    let result = runtime.block_on(async_main(cli));

    if let Err(e) = result {
        let response = serde_json::json!({
            "success": false,
            "error": format!("{:#}", e)
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&response)
                .unwrap_or_else(|_| { format!(r#"{{"success":false,"error":"{}"}}"#, e) })
        );
        std::process::exit(2);
    }
}

async fn async_main(cli: Cli) -> anyhow::Result<()> {
    use lspipe::cli::commands;

    let server = cli.server.as_deref();
    match cli.command {
        // The stub peer needs no configuration
        Commands::Echo(args) => commands::echo::execute(args).await,
        Commands::Complete(args) => {
            let app = load_app(server).await?;
            commands::complete::execute(args, &app).await
        }
        Commands::Send(args) => {
            let app = load_app(server).await?;
            commands::send::execute(args, &app).await
        }
        Commands::Config(args) => {
            let app = load_app(server).await?;
            commands::config::execute(args, &app).await
        }
    }
}

async fn load_app(server: Option<&str>) -> anyhow::Result<App> {
    App::new(server)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to initialize: {}", e))
}
