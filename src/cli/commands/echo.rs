//! Echo command implementation
//!
//! A framed stdio peer used as a stand-in language server. By default every
//! frame read from stdin is written back unchanged. With `--respond` it acts
//! like a minimal JSON-RPC server instead:
//!
//! - requests are answered with their own params as the result, after
//!   `params.delayMs` milliseconds when present
//! - `shutdown` is answered with `null`
//! - the `exit` notification ends the process with status 0
//! - a `crash` request ends the process with status 3 without answering

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::infra::lsp::codec::{self, FrameDecoder};
use crate::infra::lsp::protocol::{Message, Request, Response};

const CRASH_STATUS: i32 = 3;

#[derive(Args, Debug)]
pub struct EchoArgs {
    /// Answer requests instead of echoing frames
    #[arg(long)]
    pub respond: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    /// stdin reached end of stream
    Eof,
    Exit(i32),
}

pub async fn execute(args: EchoArgs) -> Result<()> {
    match serve(tokio::io::stdin(), tokio::io::stdout(), args.respond).await? {
        Outcome::Eof => Ok(()),
        Outcome::Exit(status) => std::process::exit(status),
    }
}

async fn serve<R, W>(mut reader: R, writer: W, respond: bool) -> Result<Outcome>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let writer = Arc::new(Mutex::new(writer));
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; 1024];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(Outcome::Eof);
        }

        let frames = decoder.feed(&buf[..n]).collect::<Result<Vec<_>, _>>()?;
        for payload in frames {
            if !respond {
                write_frame(&writer, &payload).await?;
                continue;
            }
            match Message::parse(&payload) {
                Ok(Message::Request(request)) if request.method == "crash" => {
                    return Ok(Outcome::Exit(CRASH_STATUS));
                }
                Ok(Message::Request(request)) => {
                    let writer = Arc::clone(&writer);
                    tokio::spawn(async move {
                        let (delay, response) = reply(request);
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        if let Ok(payload) = serde_json::to_vec(&response) {
                            let _ = write_frame(&writer, &payload).await;
                        }
                    });
                }
                Ok(Message::Notification(notification)) if notification.method == "exit" => {
                    return Ok(Outcome::Exit(0));
                }
                Ok(_) => {}
                Err(e) => tracing::debug!("echo: ignoring payload: {}", e),
            }
        }
    }
}

fn reply(request: Request) -> (Duration, Response) {
    let params = request.params.unwrap_or(Value::Null);
    let delay = params
        .get("delayMs")
        .and_then(Value::as_u64)
        .map_or(Duration::ZERO, Duration::from_millis);
    let result = if request.method == "shutdown" {
        Value::Null
    } else {
        params
    };
    (delay, Response::success(request.id, result))
}

async fn write_frame<W>(writer: &Mutex<W>, payload: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut writer = writer.lock().await;
    writer.write_all(&codec::encode(payload)).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::lsp::protocol::RequestId;

    #[tokio::test]
    async fn test_echo_writes_frames_back() {
        let first = codec::encode(br#"{"id":1}"#);
        let second = codec::encode(b"");
        let mut input = first.to_vec();
        input.extend_from_slice(&second);

        let reader = tokio_test::io::Builder::new()
            .read(&input[..7])
            .read(&input[7..])
            .build();
        let writer = tokio_test::io::Builder::new()
            .write(&first)
            .write(&second)
            .build();

        assert_eq!(serve(reader, writer, false).await.unwrap(), Outcome::Eof);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_an_error() {
        let reader = tokio_test::io::Builder::new()
            .read(b"Content-Length: abc\r\n\r\n")
            .build();
        let writer = tokio_test::io::Builder::new().build();
        assert!(serve(reader, writer, false).await.is_err());
    }

    #[tokio::test]
    async fn test_exit_notification_ends_respond_mode() {
        let reader = tokio_test::io::Builder::new()
            .read(&codec::encode(br#"{"jsonrpc":"2.0","method":"exit"}"#))
            .build();
        let writer = tokio_test::io::Builder::new().build();
        assert_eq!(serve(reader, writer, true).await.unwrap(), Outcome::Exit(0));
    }

    #[test]
    fn test_reply_echoes_params() {
        let request = Request::new(
            5,
            "textDocument/hover",
            Some(serde_json::json!({ "delayMs": 20, "x": 1 })),
        );
        let (delay, response) = reply(request);
        assert_eq!(delay, Duration::from_millis(20));
        assert_eq!(response.id, Some(RequestId::Number(5)));
        assert_eq!(response.result.unwrap()["x"], 1);
    }

    #[test]
    fn test_shutdown_reply_is_null() {
        let (delay, response) = reply(Request::new(2, "shutdown", None));
        assert!(delay.is_zero());
        assert_eq!(response.result, Some(Value::Null));
        assert!(response.is_success());
    }
}
