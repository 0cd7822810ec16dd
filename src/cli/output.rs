//! Output formatting for CLI commands
//!
//! Every command prints one JSON object on stdout with a `success` field.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{Value, json};

#[derive(Debug, Clone)]
pub struct OutputContext {
    /// Paths under this root are printed relative to it
    root: PathBuf,
}

impl OutputContext {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn relative_path(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| path.display().to_string())
    }

    /// Print `data` with `success: true` merged into its top level
    pub fn print_success_flat<T: Serialize>(&self, data: T) {
        print_json(&envelope(data));
    }

    pub fn print_error(&self, message: &str) {
        print_json(&json!({
            "success": false,
            "error": message
        }));
    }
}

fn envelope<T: Serialize>(data: T) -> Value {
    match serde_json::to_value(data) {
        Ok(Value::Object(mut obj)) => {
            obj.insert("success".to_string(), Value::Bool(true));
            Value::Object(obj)
        }
        Ok(other) => json!({ "success": true, "data": other }),
        Err(e) => json!({ "success": false, "error": e.to_string() }),
    }
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("Failed to serialize output: {e}"),
    }
}
