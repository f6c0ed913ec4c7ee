//! TCP debug server

use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use crate::protocol::{DebugCommand, DebugResponse};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind debug server on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Trait that the application implements to handle debug commands
pub trait DebugHandler: Send + Sync + 'static {
    fn handle_command(&mut self, cmd: DebugCommand) -> DebugResponse;
}

/// Debug server handle - keep this alive to keep the server running
pub struct DebugServer {
    handle: tokio::task::JoinHandle<()>,
    local_addr: SocketAddr,
}

impl DebugServer {
    /// Start the debug server on the given port of the loopback interface.
    /// The handler is called for each incoming command.
    /// Returns once the port is bound -- the server runs in background on
    /// `runtime`.
    pub fn start(
        handler: Arc<Mutex<dyn DebugHandler>>,
        port: u16,
        runtime: &tokio::runtime::Handle,
    ) -> Result<Self, ServerError> {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let std_listener = std::net::TcpListener::bind(addr)
            .and_then(|l| l.set_nonblocking(true).map(|()| l))
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = std_listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        let handle = runtime.spawn(async move {
            let listener = match TcpListener::from_std(std_listener) {
                Ok(l) => {
                    log::info!("Debug server listening on {}", local_addr);
                    l
                }
                Err(e) => {
                    log::error!("Failed to register debug listener on {}: {}", local_addr, e);
                    return;
                }
            };
            serve(listener, handler).await;
        });

        Ok(Self { handle, local_addr })
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for DebugServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Accept clients forever, one task per connection
pub async fn serve(listener: TcpListener, handler: Arc<Mutex<dyn DebugHandler>>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                log::info!("Debug client connected from {}", peer);
                let handler = handler.clone();
                tokio::spawn(async move {
                    handle_connection(stream, handler).await;
                    log::info!("Debug client disconnected: {}", peer);
                });
            }
            Err(e) => {
                log::error!("Debug server accept error: {}", e);
            }
        }
    }
}

/// Answer one request line; the reply is newline-terminated JSON
pub async fn respond(line: &str, handler: &Mutex<dyn DebugHandler>) -> String {
    let response = match serde_json::from_str::<DebugCommand>(line) {
        Ok(cmd) => {
            log::debug!("Debug command: {:?}", cmd);
            let mut h = handler.lock().await;
            h.handle_command(cmd)
        }
        Err(e) => DebugResponse::error(format!("Invalid command JSON: {}", e)),
    };

    let mut resp_json = serde_json::to_string(&response).unwrap_or_else(|e| {
        format!(
            "{{\"status\":\"error\",\"message\":\"Serialize error: {}\"}}",
            e
        )
    });
    resp_json.push('\n');
    resp_json
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    handler: Arc<Mutex<dyn DebugHandler>>,
) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break, // Connection closed
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                let resp_json = respond(trimmed, &handler).await;

                if let Err(e) = writer.write_all(resp_json.as_bytes()).await {
                    log::error!("Debug server write error: {}", e);
                    break;
                }
                if let Err(e) = writer.flush().await {
                    log::error!("Debug server flush error: {}", e);
                    break;
                }
            }
            Err(e) => {
                log::error!("Debug server read error: {}", e);
                break;
            }
        }
    }
}
