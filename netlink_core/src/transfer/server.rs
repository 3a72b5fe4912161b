use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::TransferEvent;
use crate::error::{Result, TransferError};

use super::progress::{NoProgress, ProgressReporter};
use super::receiver::{ReceiveOutcome, receive_connection};

/// Accepts transfers one connection at a time.
///
/// Each connection is handled inline on the accept loop, so a second sender
/// waits in the listen backlog until the first one is done.
pub struct TransferServer {
    listener: TcpListener,
    download_dir: PathBuf,
    events: Option<mpsc::Sender<TransferEvent>>,
}

impl TransferServer {
    /// Bind `addr` and make sure `download_dir` exists.
    pub async fn bind(addr: SocketAddr, download_dir: impl Into<PathBuf>) -> Result<Self> {
        let download_dir = download_dir.into();
        tokio::fs::create_dir_all(&download_dir)
            .await
            .map_err(|e| TransferError::fs(&download_dir, e))?;

        let listener = TcpListener::bind(addr).await?;
        info!(
            "Transfer server listening on {}, saving to {}",
            listener.local_addr()?,
            download_dir.display()
        );

        Ok(Self {
            listener,
            download_dir,
            events: None,
        })
    }

    /// Publish status, progress and completion events on `events`.
    pub fn with_events(mut self, events: mpsc::Sender<TransferEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Accept and serve connections until `shutdown` is cancelled.
    ///
    /// A failing connection is logged and dropped; the loop keeps going.
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (mut stream, peer) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, dropping connection from {}", peer);
                    break;
                }
                _ = self.handle_connection(&mut stream, peer) => {}
            }
        }
        info!("Transfer server stopped");
    }

    /// Run [`run`](Self::run) on a background task.
    pub fn spawn(self) -> Result<ServerHandle> {
        let local_addr = self.local_addr()?;
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(self.run(shutdown.clone()));
        Ok(ServerHandle {
            shutdown,
            task,
            local_addr,
        })
    }

    async fn handle_connection(&self, stream: &mut TcpStream, peer: SocketAddr) {
        info!("Connection from {}", peer);
        self.emit(TransferEvent::Status(format!("Connection from {}", peer)))
            .await;
        let _ = stream.set_nodelay(true);

        let outcome = match &self.events {
            Some(events) => receive_connection(stream, &self.download_dir, events).await,
            None => receive_connection(stream, &self.download_dir, &NoProgress).await,
        };

        match outcome {
            Ok(ReceiveOutcome::Completed(files)) => {
                for file in files {
                    info!("Received {} ({} bytes)", file.file_name, file.size);
                    self.emit(TransferEvent::FileReceived {
                        file_name: file.file_name,
                        size: file.size,
                        path: file.path,
                    })
                    .await;
                }
            }
            Ok(ReceiveOutcome::AwaitingResume {
                file_name,
                received,
                size,
            }) => {
                self.emit(TransferEvent::ResumePending {
                    file_name,
                    received,
                    size,
                })
                .await;
            }
            Err(e) => {
                error!("Transfer from {} failed: {}", peer, e);
                self.emit(TransferEvent::Error(format!(
                    "Transfer from {} failed: {}",
                    peer, e
                )))
                .await;
            }
        }
        debug!("Connection from {} closed", peer);
    }

    /// Progress samples are lossy; these are not, so a full channel waits.
    async fn emit(&self, event: TransferEvent) {
        if let Some(events) = &self.events {
            if events.send(event).await.is_err() {
                debug!("Event receiver gone, dropping server event");
            }
        }
    }
}

/// A server running on a background task.
pub struct ServerHandle {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Cancel the accept loop and wait for it to exit.
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            warn!("Transfer server task ended abnormally: {}", e);
        }
    }
}
