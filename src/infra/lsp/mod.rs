//! LSP Infrastructure for lspipe
//!
//! Provides the stdio channel to a language server:
//! - Content-Length frame codec
//! - Process supervision with exactly-once exit notification and tree kill
//! - Transport wiring the codec to the supervised process
//! - JSON-RPC 2.0 protocol types
//! - Client with atomic request IDs and response correlation

pub mod client;
pub mod codec;
pub mod process;
pub mod protocol;
pub mod transport;

pub use client::{Client, ClientSettings};
pub use codec::{FrameDecoder, Frames};
pub use process::{
    ExitSignal, ExitSource, ProcessExit, ProcessSpec, ProcessSupervisor, StreamHandlers,
    SupervisorSettings,
};
pub use transport::{CloseReason, Transport, TransportSettings};
