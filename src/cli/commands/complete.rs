//! Complete command implementation

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use serde_json::Value;

use crate::app::App;
use crate::infra::lsp::protocol::Position;
use crate::services::session::{JsonSession, SchemaAssociations};

#[derive(Args, Debug)]
pub struct CompleteArgs {
    /// JSON document to open
    pub file: PathBuf,

    /// Zero-based line
    #[arg(short, long, default_value_t = 1)]
    pub line: u32,

    /// Zero-based UTF-16 character offset
    #[arg(short, long, default_value_t = 1)]
    pub character: u32,

    /// Schema association as NAME=URI (repeatable)
    #[arg(long = "schema", value_name = "NAME=URI", value_parser = parse_schema)]
    pub schemas: Vec<(String, String)>,

    /// Also request hover and document symbols
    #[arg(long)]
    pub detail: bool,
}

#[derive(Serialize)]
struct CompleteResponse {
    file: String,
    position: Position,
    completion: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    hover: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    symbols: Option<Value>,
}

fn parse_schema(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((name, uri)) if !name.is_empty() && !uri.is_empty() => {
            Ok((name.to_string(), uri.to_string()))
        }
        _ => Err(format!("expected NAME=URI, got '{value}'")),
    }
}

fn associations(schemas: &[(String, String)]) -> SchemaAssociations {
    let mut associations = SchemaAssociations::new();
    for (name, uri) in schemas {
        associations
            .entry(name.clone())
            .or_default()
            .push(uri.clone());
    }
    associations
}

pub async fn execute(args: CompleteArgs, app: &App) -> Result<()> {
    let file = if args.file.is_absolute() {
        args.file.clone()
    } else {
        app.root().join(&args.file)
    };
    if !file.is_file() {
        anyhow::bail!("File not found: {}", args.file.display());
    }

    let session = JsonSession::start(app.config(), app.root())
        .await
        .context("Failed to start language server")?;
    let result = run(&session, &args, &file).await;
    if let Err(e) = session.shutdown().await {
        tracing::warn!("Shutdown failed: {}", e);
    }

    let mut response = result?;
    response.file = app.output.relative_path(&file);
    app.output.print_success_flat(response);
    Ok(())
}

async fn run(session: &JsonSession, args: &CompleteArgs, file: &Path) -> Result<CompleteResponse> {
    session
        .associate_schemas(&associations(&args.schemas))
        .await?;
    let uri = session.open(file).await?;
    let position = Position::new(args.line, args.character);

    let completion = session.complete(&uri, position).await?;
    let (hover, symbols) = if args.detail {
        (
            Some(session.hover(&uri, position).await?),
            Some(session.document_symbols(&uri).await?),
        )
    } else {
        (None, None)
    };

    Ok(CompleteResponse {
        file: file.display().to_string(),
        position,
        completion,
        hover,
        symbols,
    })
}
