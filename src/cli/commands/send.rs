//! Send command implementation

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use serde_json::Value;

use crate::app::App;
use crate::services::session::JsonSession;

#[derive(Args, Debug)]
pub struct SendArgs {
    /// JSON-RPC method, e.g. textDocument/documentSymbol
    pub method: String,

    /// Params as a JSON value
    #[arg(short, long)]
    pub params: Option<String>,

    /// Send as a notification and do not wait for a response
    #[arg(short, long)]
    pub notify: bool,
}

#[derive(Serialize)]
struct SendResponse {
    method: String,
    kind: &'static str,
    result: Value,
}

fn parse_params(raw: Option<&str>) -> Result<Option<Value>> {
    raw.map(|raw| serde_json::from_str(raw).context("--params is not valid JSON"))
        .transpose()
}

pub async fn execute(args: SendArgs, app: &App) -> Result<()> {
    let params = parse_params(args.params.as_deref())?;

    let session = JsonSession::start(app.config(), app.root())
        .await
        .context("Failed to start language server")?;
    let client = session.client();
    let result = if args.notify {
        client
            .notify(&args.method, params)
            .await
            .map(|()| Value::Null)
    } else {
        client.request_value(&args.method, params).await
    };
    if let Err(e) = session.shutdown().await {
        tracing::warn!("Shutdown failed: {}", e);
    }

    app.output.print_success_flat(SendResponse {
        method: args.method,
        kind: if args.notify { "notification" } else { "request" },
        result: result?,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_params() {
        assert_eq!(parse_params(None).unwrap(), None);
        assert_eq!(
            parse_params(Some(r#"{"textDocument":{"uri":"file:///a.json"}}"#)).unwrap(),
            Some(serde_json::json!({ "textDocument": { "uri": "file:///a.json" } }))
        );
        assert!(parse_params(Some("{uri:")).is_err());
    }
}
