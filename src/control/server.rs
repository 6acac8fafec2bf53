//! Control server for the Unix socket
//!
//! This module implements the server that listens for incoming control
//! connections and dispatches commands to the handler.

use crate::control::{ApiError, ApiRequest, ApiResponse, CommandHandler};
use std::future::Future;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info};

/// Default socket path
pub const DEFAULT_SOCKET_PATH: &str = "/run/wg-provisioner/control.sock";

/// Control server manages the control API socket
pub struct ControlServer {
    /// Path to Unix socket
    socket_path: PathBuf,
    /// Command handler
    handler: Arc<CommandHandler>,
}

impl ControlServer {
    /// Create a new control server
    pub fn new(socket_path: PathBuf, handler: Arc<CommandHandler>) -> Self {
        Self {
            socket_path,
            handler,
        }
    }

    /// Socket path
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the socket, owner access only
    pub fn bind(&self) -> Result<UnixListener, ApiError> {
        if self.socket_path.exists() {
            info!("Removing existing socket at {:?}", self.socket_path);
            std::fs::remove_file(&self.socket_path).map_err(|e| {
                ApiError::InternalError(format!("Failed to remove existing socket: {}", e))
            })?;
        }

        let parent = match self.socket_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        if !parent.exists() {
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(parent)
                .map_err(|e| {
                    ApiError::InternalError(format!("Failed to create socket directory: {}", e))
                })?;
        }

        // the socket hands out client private keys: bind it inside a private
        // directory and restrict it before it becomes reachable at its path
        let staging = tempfile::Builder::new()
            .prefix(".control-")
            .tempdir_in(parent)
            .map_err(|e| ApiError::InternalError(format!("Failed to create staging directory: {}", e)))?;
        let staged = staging.path().join("control.sock");

        let listener = UnixListener::bind(&staged).map_err(|e| {
            ApiError::InternalError(format!("Failed to bind Unix socket: {}", e))
        })?;
        std::fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o600)).map_err(|e| {
            ApiError::InternalError(format!("Failed to restrict socket permissions: {}", e))
        })?;
        std::fs::rename(&staged, &self.socket_path).map_err(|e| {
            ApiError::InternalError(format!("Failed to move socket into place: {}", e))
        })?;

        Ok(listener)
    }

    /// Serve connections until `shutdown` resolves, then remove the socket
    pub async fn serve<F>(&self, listener: UnixListener, shutdown: F) -> Result<(), ApiError>
    where
        F: Future<Output = ()>,
    {
        info!("Control server listening at {:?}", self.socket_path);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let handler = self.handler.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, handler).await {
                                error!("Connection handler error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },
            }
        }

        self.shutdown()
    }

    /// Bind and serve until `shutdown` resolves
    pub async fn start<F>(&self, shutdown: F) -> Result<(), ApiError>
    where
        F: Future<Output = ()>,
    {
        let listener = self.bind()?;
        self.serve(listener, shutdown).await
    }

    /// Remove the socket file
    pub fn shutdown(&self) -> Result<(), ApiError> {
        info!("Shutting down control server");

        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| {
                ApiError::InternalError(format!("Failed to remove socket: {}", e))
            })?;
        }

        Ok(())
    }
}

/// Handle a single client connection
async fn handle_connection(stream: UnixStream, handler: Arc<CommandHandler>) -> Result<(), ApiError> {
    debug!("New client connection");

    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();

        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("Client disconnected");
                break;
            }
            Ok(_) => {
                let request_str = line.trim();
                if request_str.is_empty() {
                    continue;
                }

                let response = match ApiRequest::from_json(request_str) {
                    Ok(request) => handler.handle_request(request).await,
                    Err(e) => {
                        error!("Failed to parse request: {}", e);
                        ApiResponse::error("unknown".to_string(), e)
                    }
                };

                let mut response_str = response.to_json()?;
                response_str.push('\n');

                writer
                    .write_all(response_str.as_bytes())
                    .await
                    .map_err(|e| ApiError::InternalError(format!("Failed to write response: {}", e)))?;
                writer
                    .flush()
                    .await
                    .map_err(|e| ApiError::InternalError(format!("Failed to flush response: {}", e)))?;
            }
            Err(e) => {
                error!("Failed to read from socket: {}", e);
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlClient;
    use crate::control::ControlCommand;
    use crate::monitoring::Monitor;
    use crate::registry::{MemoryStore, PeerRegistry, Subnet};
    use crate::wireguard::render::{ConfigRenderer, RenderSettings};
    use crate::wireguard::{MockDaemonController, NativeKeyProvider, ServerConfigSynchronizer};
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::oneshot;

    fn handler(dir: &TempDir) -> Arc<CommandHandler> {
        let subnet: Subnet = "10.8.0.0/24".parse().unwrap();
        let registry = Arc::new(
            PeerRegistry::open(Box::new(MemoryStore::new()), subnet, Arc::new(NativeKeyProvider))
                .unwrap(),
        );
        let renderer = ConfigRenderer::new(RenderSettings {
            interface: "wg0".to_string(),
            server_address: Ipv4Addr::new(10, 8, 0, 1),
            subnet,
            listen_port: 51820,
            dns: vec![],
            public_endpoint: "vpn.example.com:51820".to_string(),
            persistent_keepalive: 0,
        });
        let synchronizer = Arc::new(ServerConfigSynchronizer::new(
            renderer,
            Arc::new(MockDaemonController::new()),
            dir.path(),
            Some("eth0".to_string()),
        ));
        let monitor = Arc::new(Monitor::new(Duration::from_secs(30)));
        Arc::new(CommandHandler::new(registry, synchronizer, monitor, 3))
    }

    #[tokio::test]
    async fn test_socket_permissions_and_cleanup() {
        let tmp_dir = TempDir::new().unwrap();
        let run_dir = tmp_dir.path().join("run");
        let socket_path = run_dir.join("control.sock");
        let server = ControlServer::new(socket_path.clone(), handler(&tmp_dir));

        let listener = server.bind().unwrap();
        let mode = std::fs::metadata(&socket_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let dir_mode = std::fs::metadata(&run_dir).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);

        server.serve(listener, async {}).await.unwrap();
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn test_bind_in_shared_directory_leaves_only_the_socket() {
        let tmp_dir = TempDir::new().unwrap();
        let shared = tmp_dir.path().join("shared");
        std::fs::create_dir(&shared).unwrap();
        std::fs::set_permissions(&shared, std::fs::Permissions::from_mode(0o755)).unwrap();
        let socket_path = shared.join("control.sock");
        std::fs::write(&socket_path, b"stale").unwrap();

        let server = ControlServer::new(socket_path.clone(), handler(&tmp_dir));
        let listener = server.bind().unwrap();

        let meta = std::fs::symlink_metadata(&socket_path).unwrap();
        assert!(std::os::unix::fs::FileTypeExt::is_socket(&meta.file_type()));
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);

        let entries: Vec<_> = std::fs::read_dir(&shared)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("control.sock")]);

        // the renamed socket still accepts connections
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            server
                .serve(listener, async {
                    let _ = stop_rx.await;
                })
                .await
        });
        let resp = ControlClient::new(&socket_path).send(ControlCommand::ListAccounts).await.unwrap();
        assert!(resp.success);

        stop_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn test_request_over_socket() {
        let tmp_dir = TempDir::new().unwrap();
        let socket_path = tmp_dir.path().join("control.sock");
        let server = ControlServer::new(socket_path.clone(), handler(&tmp_dir));
        let listener = server.bind().unwrap();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            server
                .serve(listener, async {
                    let _ = stop_rx.await;
                })
                .await
        });

        let client = ControlClient::new(&socket_path);
        let resp = client
            .send(ControlCommand::CreateAccount {
                account: "alice".to_string(),
                max_connections: None,
            })
            .await
            .unwrap();
        assert!(resp.success);
        assert_eq!(resp.data.unwrap()["max_connections"], 3);

        let resp = client.send(ControlCommand::ListAccounts).await.unwrap();
        assert_eq!(resp.data.unwrap().as_array().unwrap().len(), 1);

        stop_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn test_malformed_line_gets_parse_error() {
        let tmp_dir = TempDir::new().unwrap();
        let socket_path = tmp_dir.path().join("control.sock");
        let server = ControlServer::new(socket_path.clone(), handler(&tmp_dir));
        let listener = server.bind().unwrap();
        let task = tokio::spawn(async move { server.serve(listener, std::future::pending()).await });

        let stream = UnixStream::connect(&socket_path).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        writer.write_all(b"not json\n").await.unwrap();

        let mut line = String::new();
        BufReader::new(reader).read_line(&mut line).await.unwrap();
        let resp = ApiResponse::from_json(line.trim()).unwrap();
        assert_eq!(resp.id, "unknown");
        assert!(matches!(resp.error, Some(ApiError::ParseError(_))));

        task.abort();
    }
}
