mod generation;

use std::time::{Duration, Instant};

use clap::Parser;
use generation::{worker_task, Message};
use tokio::sync::mpsc;
use tonic::transport::Channel;

/// Drives the batching server's `Process` RPC at a configurable
/// concurrency and payload size, reporting latency and throughput.
#[derive(Debug, Parser)]
#[command(name = "batching-benchmark")]
struct Args {
    /// Server address, e.g. http://127.0.0.1:8033.
    #[arg(long, default_value = "http://127.0.0.1:8033")]
    endpoint: String,

    /// Number of concurrent simulated clients.
    #[arg(long, default_value_t = 8)]
    concurrency: usize,

    /// Number of sequential `Process` calls issued by each client.
    #[arg(long, default_value_t = 50)]
    calls_per_worker: usize,

    /// Number of float elements per `Process` call.
    #[arg(long, default_value_t = 128)]
    payload_size: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let channel = Channel::from_shared(args.endpoint.clone())?
        .connect()
        .await?;

    let (tx, mut rx) = mpsc::channel(args.concurrency * 4);
    for worker_id in 0..args.concurrency {
        let channel = channel.clone();
        let tx = tx.clone();
        tokio::spawn(worker_task(
            channel,
            worker_id,
            args.calls_per_worker,
            args.payload_size,
            tx,
        ));
    }
    drop(tx);

    let run_start = Instant::now();
    let mut latencies = Vec::with_capacity(args.concurrency * args.calls_per_worker);
    let mut errors = 0usize;
    let mut workers_done = 0usize;

    while let Some(message) = rx.recv().await {
        match message {
            Message::Call(Ok(result)) => latencies.push(result.latency),
            Message::Call(Err(status)) => {
                errors += 1;
                tracing::warn!(%status, "Process call failed");
            }
            Message::WorkerDone => {
                workers_done += 1;
                if workers_done == args.concurrency {
                    break;
                }
            }
        }
    }
    let elapsed = run_start.elapsed();

    report(&latencies, errors, elapsed, args.concurrency, args.payload_size);
    Ok(())
}

fn report(
    latencies: &[Duration],
    errors: usize,
    elapsed: Duration,
    concurrency: usize,
    payload_size: usize,
) {
    let mut sorted = latencies.to_vec();
    sorted.sort();

    let n = sorted.len();
    println!("concurrency:      {concurrency}");
    println!("payload size:     {payload_size} items/call");
    println!("completed calls:  {n}");
    println!("failed calls:     {errors}");
    println!("wall time:        {elapsed:?}");

    if n == 0 {
        return;
    }

    let total: Duration = sorted.iter().sum();
    let mean = total / n as u32;
    let p50 = sorted[n / 2];
    let p99 = sorted[(n * 99 / 100).min(n - 1)];
    let throughput = n as f64 / elapsed.as_secs_f64();

    println!("latency mean:     {mean:?}");
    println!("latency p50:      {p50:?}");
    println!("latency p99:      {p99:?}");
    println!("throughput:       {throughput:.1} calls/sec");
}
