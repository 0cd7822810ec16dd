//! JSON language server session
//!
//! Drives a JSON language server through the usual editor handshake:
//! `initialize`, `initialized`, schema associations, `didOpen`, then feature
//! requests against the opened document, and finally a staged shutdown.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Value, json};

use crate::error::{ClientError, LspipeError, LspipeResult};
use crate::infra::lsp::protocol::{
    ClientInfo, DidOpenTextDocumentParams, InitializeParams, InitializeResult, Position,
    TextDocumentIdentifier, TextDocumentItem, TextDocumentPositionParams,
};
use crate::infra::lsp::{Client, ProcessExit};
use crate::models::LspipeConfig;

const LANGUAGE_ID: &str = "json";

/// File name pattern to schema URIs, sent with `json/schemaAssociations`
pub type SchemaAssociations = BTreeMap<String, Vec<String>>;

pub struct JsonSession {
    client: Arc<Client>,
    root: PathBuf,
    server: InitializeResult,
}

impl JsonSession {
    /// Start the configured server in `root` and complete the handshake.
    pub async fn start(config: &LspipeConfig, root: &Path) -> LspipeResult<Self> {
        let client = Client::new(config.into(), config.into());
        client.transport().on_diagnostic(|chunk: &[u8]| {
            tracing::debug!("server stderr: {}", String::from_utf8_lossy(chunk).trim_end());
        });

        let mut spec = config.server.spec();
        if spec.working_dir.is_none() {
            spec = spec.with_working_dir(root);
        }
        client.start(&spec)?;

        match Self::initialize(&client, root).await {
            Ok(server) => Ok(Self {
                client,
                root: root.to_path_buf(),
                server,
            }),
            Err(err) => {
                let _ = client.shutdown().await;
                Err(err.into())
            }
        }
    }

    async fn initialize(client: &Client, root: &Path) -> Result<InitializeResult, ClientError> {
        let params = InitializeParams {
            process_id: Some(std::process::id()),
            root_path: Some(root.to_string_lossy().into_owned()),
            root_uri: Some(path_to_uri(root)),
            capabilities: json!({
                "textDocument": {
                    "completion": { "completionItem": { "snippetSupport": false } },
                    "hover": { "contentFormat": ["plaintext", "markdown"] },
                    "documentSymbol": { "hierarchicalDocumentSymbolSupport": true }
                }
            }),
            client_info: Some(ClientInfo {
                name: "lspipe".to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
            initialization_options: Some(json!({ "languageIds": LANGUAGE_ID })),
        };

        let result: InitializeResult = client
            .request("initialize", Some(serde_json::to_value(params)?))
            .await?;
        if let Some(info) = &result.server_info {
            tracing::debug!("Initialized {} {}", info.name, info.version.as_deref().unwrap_or(""));
        }
        client.notify("initialized", Some(json!({}))).await?;
        Ok(result)
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn server(&self) -> &InitializeResult {
        &self.server
    }

    pub async fn associate_schemas(
        &self,
        associations: &SchemaAssociations,
    ) -> Result<(), ClientError> {
        if associations.is_empty() {
            return Ok(());
        }
        self.client
            .notify(
                "json/schemaAssociations",
                Some(serde_json::to_value(associations)?),
            )
            .await
    }

    /// Read `path` from disk and send it with `didOpen`. Returns its URI.
    pub async fn open(&self, path: &Path) -> LspipeResult<String> {
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        let text = tokio::fs::read_to_string(&path).await?;
        let uri = path_to_uri(&path);

        let params = DidOpenTextDocumentParams {
            text_document: TextDocumentItem {
                uri: uri.clone(),
                language_id: LANGUAGE_ID.to_string(),
                version: 1,
                text,
            },
        };
        self.client
            .notify(
                "textDocument/didOpen",
                Some(serde_json::to_value(params).map_err(ClientError::from)?),
            )
            .await?;
        Ok(uri)
    }

    pub async fn complete(&self, uri: &str, position: Position) -> Result<Value, ClientError> {
        self.client
            .request_value("textDocument/completion", Some(position_params(uri, position)?))
            .await
    }

    pub async fn hover(&self, uri: &str, position: Position) -> Result<Value, ClientError> {
        self.client
            .request_value("textDocument/hover", Some(position_params(uri, position)?))
            .await
    }

    pub async fn document_symbols(&self, uri: &str) -> Result<Value, ClientError> {
        self.client
            .request_value(
                "textDocument/documentSymbol",
                Some(json!({ "textDocument": TextDocumentIdentifier::new(uri) })),
            )
            .await
    }

    pub async fn shutdown(self) -> Result<Option<ProcessExit>, LspipeError> {
        Ok(self.client.shutdown().await?)
    }
}

fn position_params(uri: &str, position: Position) -> Result<Value, ClientError> {
    Ok(serde_json::to_value(TextDocumentPositionParams {
        text_document: TextDocumentIdentifier::new(uri),
        position,
    })?)
}

/// Convert a file path to a `file://` URI, percent-encoding reserved bytes
pub fn path_to_uri(path: &Path) -> String {
    let abs_path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().unwrap_or_default().join(path)
    };

    let path_str = abs_path.to_string_lossy().replace('\\', "/");
    let mut encoded = String::with_capacity(path_str.len() + 8);
    if !path_str.starts_with('/') {
        encoded.push('/');
    }
    for byte in path_str.bytes() {
        match byte {
            b'/' | b'.' | b'-' | b'_' | b'~' | b':' => encoded.push(byte as char),
            b if b.is_ascii_alphanumeric() => encoded.push(b as char),
            b => encoded.push_str(&format!("%{:02X}", b)),
        }
    }

    format!("file://{encoded}")
}
