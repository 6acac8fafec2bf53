//! Control socket client used by the CLI

use crate::control::{ApiRequest, ApiResponse, ControlCommand};
use crate::error::{ProvisionError, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

/// Upper bound on one request/response exchange
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Sends one request per connection and reads one reply
#[derive(Debug, Clone)]
pub struct ControlClient {
    socket_path: PathBuf,
}

impl ControlClient {
    /// Client for the socket at `socket_path`
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    /// Send `command` with a generated request id
    pub async fn send(&self, command: ControlCommand) -> Result<ApiResponse> {
        let id = format!("cli-{}", std::process::id());
        self.request(ApiRequest::new(id, command)).await
    }

    /// Send a request and wait for its response
    pub async fn request(&self, request: ApiRequest) -> Result<ApiResponse> {
        tokio::time::timeout(REQUEST_TIMEOUT, self.exchange(request))
            .await
            .map_err(|_| ProvisionError::Timeout("control request".to_string()))?
    }

    async fn exchange(&self, request: ApiRequest) -> Result<ApiResponse> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            ProvisionError::Io(std::io::Error::new(
                e.kind(),
                format!("cannot connect to {:?}: {}", self.socket_path, e),
            ))
        })?;
        let (reader, mut writer) = stream.into_split();

        let mut line = request
            .to_json()
            .map_err(|e| ProvisionError::Serialization(e.to_string()))?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;

        let mut reply = String::new();
        BufReader::new(reader).read_line(&mut reply).await?;
        if reply.is_empty() {
            return Err(ProvisionError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "control socket closed without a response",
            )));
        }

        ApiResponse::from_json(reply.trim()).map_err(|e| ProvisionError::Serialization(e.to_string()))
    }
}
