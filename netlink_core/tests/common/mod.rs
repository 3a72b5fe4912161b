#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail};
use rand::RngCore;
use tokio::sync::mpsc;

use netlink_core::TransferEvent;
use netlink_core::transfer::{ServerHandle, TransferClient, TransferServer};

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Route library logs through the test harness; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct TestServer {
    pub handle: ServerHandle,
    pub events: mpsc::Receiver<TransferEvent>,
}

impl TestServer {
    pub async fn start(download_dir: &Path) -> Result<Self> {
        init_tracing();
        let (tx, events) = mpsc::channel(1024);
        let server = TransferServer::bind((Ipv4Addr::LOCALHOST, 0).into(), download_dir)
            .await?
            .with_events(tx);
        Ok(Self {
            handle: server.spawn()?,
            events,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.handle.local_addr()
    }

    pub fn client(&self) -> TransferClient {
        TransferClient::new("127.0.0.1", self.addr().port())
    }

    /// Wait for the first event `pick` accepts, skipping the rest.
    pub async fn wait_for<T>(&mut self, mut pick: impl FnMut(TransferEvent) -> Option<T>) -> Result<T> {
        let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
        loop {
            let event = match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => bail!("server event channel closed"),
                Err(_) => bail!("timed out waiting for server event"),
            };
            if let Some(found) = pick(event) {
                return Ok(found);
            }
        }
    }

    pub async fn next_received(&mut self) -> Result<(String, PathBuf)> {
        self.wait_for(|event| match event {
            TransferEvent::FileReceived {
                file_name, path, ..
            } => Some((file_name, path)),
            _ => None,
        })
        .await
    }

    pub async fn next_error(&mut self) -> Result<String> {
        self.wait_for(|event| match event {
            TransferEvent::Error(message) => Some(message),
            _ => None,
        })
        .await
    }
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::rng().fill_bytes(&mut data);
    data
}

pub fn write_random_file(dir: &Path, name: &str, len: usize) -> Result<PathBuf> {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, random_bytes(len))?;
    Ok(path)
}

/// A port that was free a moment ago.
pub fn free_tcp_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

pub fn free_udp_port() -> Result<u16> {
    Ok(free_udp_ports(1)?[0])
}

/// Distinct UDP ports, all held until every one has been picked.
pub fn free_udp_ports(count: usize) -> Result<Vec<u16>> {
    let sockets = (0..count)
        .map(|_| std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)))
        .collect::<std::io::Result<Vec<_>>>()?;
    sockets
        .iter()
        .map(|s| Ok(s.local_addr()?.port()))
        .collect()
}
