//! Minimal QMP client over the per-VM monitor socket.
//!
//! QEMU frames QMP as newline-delimited JSON and may interleave
//! asynchronous event objects with command responses, so the reader
//! consumes one JSON value per line and skips anything carrying an `event`
//! key until the command's `return`/`error` arrives. Exactly one command is
//! sent per connection; callers open a fresh connection per request.

use std::path::Path;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::error::Error;

const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Run a single QMP command against `socket` and return its response
/// object (the full frame, including `return` or `error`).
pub async fn execute(socket: &Path, command: Value) -> Result<Value, Error> {
    tokio::time::timeout(EXCHANGE_TIMEOUT, exchange(socket, command))
        .await
        .map_err(|_| Error::Timeout(format!("qmp exchange on {}", socket.display())))?
}

/// `{"execute": name}` with no arguments.
pub async fn execute_simple(socket: &Path, name: &str) -> Result<Value, Error> {
    execute(socket, json!({ "execute": name })).await
}

async fn exchange(socket: &Path, command: Value) -> Result<Value, Error> {
    let stream = UnixStream::connect(socket)
        .await
        .map_err(|e| Error::Protocol(format!("connect {}: {e}", socket.display())))?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half).lines();

    let greeting = next_frame(&mut reader).await?;
    if greeting.get("QMP").is_none() {
        return Err(Error::Protocol(format!("unexpected greeting: {greeting}")));
    }

    send(&mut write_half, &json!({ "execute": "qmp_capabilities" })).await?;
    let caps = read_response(&mut reader).await?;
    if caps.get("error").is_some() {
        return Err(Error::Protocol(format!("capabilities negotiation failed: {caps}")));
    }

    send(&mut write_half, &command).await?;
    let response = read_response(&mut reader).await?;
    if let Some(err) = response.get("error") {
        return Err(Error::Protocol(format!("command failed: {err}")));
    }
    Ok(response)
}

async fn send<W: AsyncWriteExt + Unpin>(writer: &mut W, value: &Value) -> Result<(), Error> {
    let mut frame = value.to_string();
    frame.push('\n');
    writer
        .write_all(frame.as_bytes())
        .await
        .map_err(|e| Error::Protocol(format!("write: {e}")))?;
    Ok(())
}

async fn next_frame<R: AsyncBufReadExt + Unpin>(
    reader: &mut tokio::io::Lines<R>,
) -> Result<Value, Error> {
    loop {
        let line = reader
            .next_line()
            .await
            .map_err(|e| Error::Protocol(format!("read: {e}")))?
            .ok_or_else(|| Error::Protocol("connection closed".into()))?;
        if line.trim().is_empty() {
            continue;
        }
        return serde_json::from_str(&line)
            .map_err(|e| Error::Protocol(format!("bad frame {line:?}: {e}")));
    }
}

/// Skip asynchronous events until a command response arrives.
async fn read_response<R: AsyncBufReadExt + Unpin>(
    reader: &mut tokio::io::Lines<R>,
) -> Result<Value, Error> {
    loop {
        let frame = next_frame(reader).await?;
        if is_event(&frame) {
            continue;
        }
        if frame.get("return").is_some() || frame.get("error").is_some() {
            return Ok(frame);
        }
        // Neither event nor response; keep scanning rather than guess.
    }
}

fn is_event(frame: &Value) -> bool {
    frame.get("event").is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    async fn response_from(input: &str) -> Result<Value, Error> {
        let mut lines = BufReader::new(input.as_bytes()).lines();
        read_response(&mut lines).await
    }

    #[tokio::test]
    async fn events_before_the_response_are_discarded() {
        let input = "\
{\"event\": \"POWERDOWN\", \"timestamp\": {\"seconds\": 1}}\n\
{\"event\": \"SHUTDOWN\", \"timestamp\": {\"seconds\": 2}}\n\
{\"return\": {}}\n";
        let resp = response_from(input).await.unwrap();
        assert_eq!(resp, json!({ "return": {} }));
    }

    #[tokio::test]
    async fn error_frames_are_returned_for_the_caller_to_map() {
        let input = "{\"error\": {\"class\": \"CommandNotFound\", \"desc\": \"nope\"}}\n";
        let resp = response_from(input).await.unwrap();
        assert!(resp.get("error").is_some());
    }

    #[tokio::test]
    async fn closed_stream_is_a_protocol_error() {
        let err = response_from("").await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn garbage_frames_are_protocol_errors() {
        let err = response_from("not json at all\n").await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn blank_lines_are_skipped() {
        let input = "\n\n{\"return\": [{\"name\": \"net0\"}]}\n";
        let resp = response_from(input).await.unwrap();
        assert_eq!(resp["return"][0]["name"], "net0");
    }
}
