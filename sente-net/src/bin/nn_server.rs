use clap::Parser;
use sente_core::eval::DummyEvaluator;
use sente_net::server::InferenceServer;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// Inference worker serving network evaluations over TCP.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Port to listen on.
    #[arg(long, default_value_t = 9600)]
    port: u16,

    /// 64-bit fingerprint of the served weights, exchanged on connect.
    #[arg(long, default_value_t = 0)]
    weights_hash: u64,

    /// Maximum concurrent worker connections. Defaults to the CPU count.
    #[arg(long)]
    num_threads: Option<usize>,

    /// Simulated per-request latency of the built-in evaluator, in
    /// microseconds.
    #[arg(long, default_value_t = 200)]
    eval_delay_us: u64,
}

fn main() -> anyhow::Result<()> {
    sente_util::logging::setup_logging();

    let cli = Cli::parse();
    let num_threads = cli.num_threads.unwrap_or_else(num_cpus::get);

    info!(
        "serving evaluations on port {} with {} workers (weights fingerprint {:#x})",
        cli.port, num_threads, cli.weights_hash
    );

    let evaluator = Arc::new(DummyEvaluator::new(Duration::from_micros(cli.eval_delay_us)));
    let server = InferenceServer::new(evaluator, num_threads);
    server.listen(cli.port, cli.weights_hash)?;

    Ok(())
}
