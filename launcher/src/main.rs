//! Thin composition root: parses startup arguments, installs tracing and
//! metrics, builds the `SessionRegistry` and `Batcher`, binds the chosen
//! reference backend, and starts the transport. Carries no batching logic
//! of its own — mirrors the role a launcher binary plays relative to its
//! router and backend crates in this codebase's lineage.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use batching_backend_reference::{AffineBackend, AlwaysFailsBackend, EchoBackend};
use batching_router::backend::BindSource;
use batching_router::serve::{ServerHandle, TlsMaterial};
use batching_router::service::BatchingService;
use batching_router::{Batcher, SessionRegistry};
use clap::{Parser, ValueEnum};
use tracing::{error, info};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendKind {
    /// Returns every item unchanged.
    Echo,
    /// `y = scale * x + offset`, configured by `--affine-scale`/`--affine-offset`.
    Affine,
    /// Always fails; exercises the wake-with-error recovery path.
    AlwaysFails,
}

#[derive(Debug, Parser)]
#[command(name = "batching-launcher", about = "Starts the batching RPC server")]
struct Args {
    /// Address to bind the batching RPC service to.
    #[arg(long, env, default_value = "0.0.0.0:8033")]
    addr: SocketAddr,

    /// Address to bind the Prometheus metrics exporter to. Disabled if absent.
    #[arg(long, env)]
    metrics_addr: Option<SocketAddr>,

    /// Initial batch capacity; adjustable at runtime via `SetBatchSize`.
    #[arg(long, env, default_value_t = 32)]
    initial_batch_size: usize,

    /// Which reference backend to bind at startup.
    #[arg(long, env, value_enum, default_value_t = BackendKind::Echo)]
    backend: BackendKind,

    #[arg(long, env, default_value_t = 2.0)]
    affine_scale: f32,

    #[arg(long, env, default_value_t = 1.0)]
    affine_offset: f32,

    /// PEM contents or filesystem path to the TLS private key. Requires `--tls-cert`.
    #[arg(long, env)]
    tls_key: Option<String>,

    /// PEM contents or filesystem path to the TLS certificate. Requires `--tls-key`.
    #[arg(long, env)]
    tls_cert: Option<String>,

    #[arg(long, env, default_value = "info")]
    log_level: String,

    #[arg(long, env, value_enum, default_value_t = LogFormatArg::Text)]
    log_format: LogFormatArg,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Text,
    Json,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let log_format = match args.log_format {
        LogFormatArg::Text => batching_router::telemetry::LogFormat::Text,
        LogFormatArg::Json => batching_router::telemetry::LogFormat::Json,
    };
    batching_router::telemetry::init_tracing(&args.log_level, log_format);

    if let Some(metrics_addr) = args.metrics_addr {
        if let Err(err) = batching_router::telemetry::init_metrics(metrics_addr) {
            error!(error = %err, "failed to start metrics exporter");
            return ExitCode::FAILURE;
        }
    }

    let batcher = Arc::new(Batcher::new(args.initial_batch_size));
    let bind_source = match args.backend {
        BackendKind::Echo => BindSource::InMemory(Box::new(EchoBackend)),
        BackendKind::Affine => BindSource::InMemory(Box::new(AffineBackend::new(
            args.affine_scale,
            args.affine_offset,
        ))),
        BackendKind::AlwaysFails => BindSource::InMemory(Box::new(AlwaysFailsBackend)),
    };
    if let Err(err) = batcher.bind(bind_source) {
        error!(error = %err, "failed to bind backend");
        return ExitCode::FAILURE;
    }

    let sessions = Arc::new(SessionRegistry::new());
    let service = BatchingService::new(Arc::clone(&batcher), Arc::clone(&sessions));

    let handle = match (&args.tls_key, &args.tls_cert) {
        (Some(key), Some(cert)) => ServerHandle::start_ssl(
            args.addr,
            service,
            TlsMaterial::from_str_or_path(key.clone()),
            TlsMaterial::from_str_or_path(cert.clone()),
        ),
        (None, None) => ServerHandle::start_insecure(args.addr, service),
        _ => {
            error!("--tls-key and --tls-cert must be supplied together");
            return ExitCode::FAILURE;
        }
    };

    let handle = match handle {
        Ok(handle) => handle,
        Err(err) => {
            error!(error = %err, "failed to start batching transport");
            return ExitCode::FAILURE;
        }
    };

    info!(addr = %args.addr, "batching server running, press Ctrl-C to stop");
    if let Err(err) = wait_for_shutdown_signal() {
        error!(error = %err, "failed to install shutdown signal handler");
    }

    handle.stop();
    ExitCode::SUCCESS
}

fn wait_for_shutdown_signal() -> std::io::Result<()> {
    // A tiny single-threaded runtime just to await the Ctrl-C future; the
    // transport itself runs on its own dedicated thread/runtime started by
    // `ServerHandle`.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async { tokio::signal::ctrl_c().await })
}
