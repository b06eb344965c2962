use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::tm::process::ProcessStatus;

pub const DEFAULT_SOCKET: &str = "/tmp/taskmaster.sock";

/// One control request. Framing is one JSON object per line in each
/// direction; a connection may carry any number of exchanges.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Request {
    List,
    Status { name: String },
    GetPid { name: String },
    Start { name: String },
    Stop { name: String },
    ReloadConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,

    /// Human-readable error when `ok` is false. Sentinel strings cross
    /// here verbatim; see the error module.
    #[serde(default)]
    pub message: String,

    #[serde(default)]
    pub names: Vec<String>,

    #[serde(default)]
    pub status: Option<ProcessStatus>,

    #[serde(default)]
    pub pid: Option<i32>,

    #[serde(default)]
    pub changed: Option<bool>,
}

impl Response {
    pub fn success() -> Response {
        Response { ok: true, ..Response::default() }
    }

    pub fn failure(err: impl fmt::Display) -> Response {
        Response { ok: false, message: err.to_string(), ..Response::default() }
    }
}

/// Errors raised by the client side of the control socket. Transport
/// failures are distinguished so the interactive client can announce
/// "service is closed" and leave its loop.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("failed to reach taskmaster daemon at {path}: {source}")]
    Transport {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid response from daemon: {0}")]
    Protocol(String),

    /// The daemon answered `ok: false`; the message is the error string.
    #[error("{0}")]
    Daemon(String),
}

impl CallError {
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, CallError::Transport { .. })
    }
}

/// Performs one request/response exchange on a fresh connection.
pub async fn client_call(sock: &Path, req: &Request) -> Result<Response, CallError> {
    let transport = |e: std::io::Error| CallError::Transport {
        path: sock.display().to_string(),
        source: e,
    };

    let mut stream = UnixStream::connect(sock).await.map_err(transport)?;
    let line = serde_json::to_string(req).map_err(|e| CallError::Protocol(e.to_string()))? + "\n";
    stream.write_all(line.as_bytes()).await.map_err(transport)?;
    stream.flush().await.map_err(transport)?;

    let mut reader = BufReader::new(stream);
    let mut resp_line = String::new();
    let n = reader.read_line(&mut resp_line).await.map_err(transport)?;
    if n == 0 || resp_line.trim().is_empty() {
        return Err(CallError::Transport {
            path: sock.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "connection closed"),
        });
    }

    let resp: Response = serde_json::from_str(resp_line.trim_end())
        .map_err(|e| CallError::Protocol(e.to_string()))?;
    if !resp.ok {
        return Err(CallError::Daemon(resp.message));
    }
    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tm::error::Error;

    #[test]
    fn request_wire_shape_is_tagged() {
        let req = Request::Start { name: "web".into() };
        let s = serde_json::to_string(&req).unwrap();
        assert_eq!(s, r#"{"type":"Start","data":{"name":"web"}}"#);
        let back: Request = serde_json::from_str(&s).unwrap();
        assert!(matches!(back, Request::Start { name } if name == "web"));
    }

    #[test]
    fn failure_response_carries_the_sentinel() {
        let resp = Response::failure(Error::AlreadyStarted);
        assert!(!resp.ok);
        assert_eq!(resp.message, "process already started");
    }

    #[test]
    fn daemon_error_preserves_message() {
        let e = CallError::Daemon("process unknown".into());
        assert_eq!(e.to_string(), "process unknown");
        assert!(!e.is_connection_lost());
    }
}
