//! Reference worker process: serves EchoWorker over stdin/stdout.

use std::sync::Arc;

use anyhow::Context;
use workercall::echo::{DEFAULT_CHUNK_SIZE, EchoWorker};
use workercall::logging::init_tracing;
use workercall::worker::run_worker;

fn chunk_size_from_env() -> anyhow::Result<usize> {
    match std::env::var("WORKERCALL_CHUNK_SIZE") {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("invalid WORKERCALL_CHUNK_SIZE: {raw:?}")),
        Err(_) => Ok(DEFAULT_CHUNK_SIZE),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    tracing::info!("workercall echo worker {}", env!("CARGO_PKG_VERSION"));

    let worker = Arc::new(EchoWorker::with_chunk_size(chunk_size_from_env()?));
    run_worker(worker, tokio::io::stdin(), tokio::io::stdout())
        .await
        .context("worker loop failed")?;
    Ok(())
}
