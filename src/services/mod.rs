//! Service layer for lspipe

pub mod config;
pub mod session;

pub use config::{ConfigService, DefaultConfigService};
pub use session::{JsonSession, SchemaAssociations};
