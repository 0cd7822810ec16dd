//! Config command implementation

use anyhow::Result;
use clap::{Args, Subcommand};
use serde::Serialize;

use crate::app::App;

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Initialize configuration file
    Init {
        /// Initialize global config (~/.config/lspipe)
        #[arg(long)]
        global: bool,

        /// Force overwrite existing config
        #[arg(short, long)]
        force: bool,
    },

    /// Show current configuration
    Show {
        /// Show global config only
        #[arg(long)]
        global: bool,
    },

    /// Show config file path
    Path {
        /// Show global config path
        #[arg(long)]
        global: bool,
    },
}

#[derive(Serialize)]
struct ConfigInitResponse {
    status: &'static str,
    path: String,
    level: &'static str,
}

#[derive(Serialize)]
struct ConfigShowResponse {
    level: &'static str,
    config: serde_json::Value,
}

#[derive(Serialize)]
struct ConfigPathResponse {
    level: &'static str,
    path: String,
    exists: bool,
}

fn level(global: bool) -> &'static str {
    if global { "global" } else { "project" }
}

pub async fn execute(args: ConfigArgs, app: &App) -> Result<()> {
    let ctx = &app.output;

    match args.command {
        ConfigCommand::Init { global, force } => {
            match app.config_service.init(global, force).await {
                Ok(path) => ctx.print_success_flat(ConfigInitResponse {
                    status: "created",
                    path: ctx.relative_path(&path),
                    level: level(global),
                }),
                Err(e) => ctx.print_error(&e.to_string()),
            }
        }

        ConfigCommand::Show { global } => {
            // Without --global, show what commands actually run with
            let loaded = if global {
                app.config_service.load(true).await
            } else {
                Ok(app.config().clone())
            };
            match loaded {
                Ok(config) => ctx.print_success_flat(ConfigShowResponse {
                    level: if global { "global" } else { "effective" },
                    config: serde_json::to_value(&config)?,
                }),
                Err(e) => ctx.print_error(&e.to_string()),
            }
        }

        ConfigCommand::Path { global } => {
            let path = app.config_service.config_path(global);
            ctx.print_success_flat(ConfigPathResponse {
                level: level(global),
                path: ctx.relative_path(&path),
                exists: path.exists(),
            });
        }
    }

    Ok(())
}
