//! Transport lifecycle: starting the gRPC server (with or without TLS) on
//! its own dedicated thread and joining it again on shutdown, mirroring the
//! `StartInsecure` / `StartSSL` / `Stop` trio of the original batching
//! server.

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::thread::{self, JoinHandle};

use batching_proto::batching_server::BatchingServer;
use thiserror::Error;
use tokio::sync::oneshot;
use tonic::transport::{Identity, Server, ServerTlsConfig};
use tracing::{error, info};

use crate::service::BatchingService;

#[derive(Error, Debug)]
pub enum ServeError {
    #[error("failed to read TLS material from disk: {0}")]
    Io(#[from] io::Error),
    #[error("failed to start transport: {0}")]
    Transport(#[from] tonic::transport::Error),
    #[error("failed to build a Tokio runtime for the serving thread: {0}")]
    Runtime(io::Error),
}

/// Either a PEM blob or a filesystem path to one, exactly as the original
/// `StartSSL(addr, key, cert)` accepted either form, detected by a leading
/// `-----` (the start of a PEM header).
#[derive(Debug, Clone)]
pub enum TlsMaterial {
    Pem(String),
    Path(String),
}

impl TlsMaterial {
    pub fn from_str_or_path(value: impl Into<String>) -> Self {
        let value = value.into();
        if value.trim_start().starts_with("-----") {
            TlsMaterial::Pem(value)
        } else {
            TlsMaterial::Path(value)
        }
    }

    fn into_bytes(self) -> Result<Vec<u8>, io::Error> {
        match self {
            TlsMaterial::Pem(pem) => Ok(pem.into_bytes()),
            TlsMaterial::Path(path) => std::fs::read(Path::new(&path)),
        }
    }
}

/// A running server: the dedicated thread it serves on plus a channel used
/// to signal graceful shutdown.
pub struct ServerHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    fn spawn(
        addr: SocketAddr,
        service: BatchingService,
        tls: Option<ServerTlsConfig>,
    ) -> Result<Self, ServeError> {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), ServeError>>();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let thread = thread::Builder::new()
            .name("batching-transport".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_multi_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(err) => {
                        let _ = ready_tx.send(Err(ServeError::Runtime(err)));
                        return;
                    }
                };

                runtime.block_on(async move {
                    let mut builder = Server::builder();
                    if let Some(tls) = tls {
                        builder = match builder.tls_config(tls) {
                            Ok(builder) => builder,
                            Err(err) => {
                                let _ = ready_tx.send(Err(ServeError::Transport(err)));
                                return;
                            }
                        };
                    }

                    let router = builder.add_service(BatchingServer::new(service));
                    let _ = ready_tx.send(Ok(()));

                    let serving = router.serve_with_shutdown(addr, async {
                        let _ = shutdown_rx.await;
                    });

                    if let Err(err) = serving.await {
                        error!(error = %err, "batching transport exited with an error");
                    }
                });
            })
            .map_err(ServeError::Runtime)?;

        ready_rx.recv().unwrap_or_else(|_| {
            Err(io::Error::new(
                io::ErrorKind::Other,
                "serving thread exited before starting",
            )
            .into())
        })?;
        info!(%addr, "batching transport started");

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    /// Starts the transport without TLS, on its own thread.
    pub fn start_insecure(addr: SocketAddr, service: BatchingService) -> Result<Self, ServeError> {
        Self::spawn(addr, service, None)
    }

    /// Starts the transport with TLS, accepting either a PEM string or a
    /// path for `key`/`cert`.
    pub fn start_ssl(
        addr: SocketAddr,
        service: BatchingService,
        key: TlsMaterial,
        cert: TlsMaterial,
    ) -> Result<Self, ServeError> {
        let key_bytes = key.into_bytes()?;
        let cert_bytes = cert.into_bytes()?;
        let identity = Identity::from_pem(cert_bytes, key_bytes);
        let tls = ServerTlsConfig::new().identity(identity);
        Self::spawn(addr, service, Some(tls))
    }

    /// Initiates graceful shutdown and joins the serving thread.
    pub fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
