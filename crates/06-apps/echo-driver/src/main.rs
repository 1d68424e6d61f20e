//! Reference driver: attaches to a task queue and echoes every payload back.
//!
//! The test hooks (`--crash-after`, `--fail-code`, `--delay-ms`) let the
//! client-side tests exercise crashes, driver-reported failures, and backpressure
//! against a real second process.

use std::ops::ControlFlow;
use std::process;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use task_queue::{RegionName, ServeExit, Task, TaskOutcome, TaskQueueServer};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about = "Echo driver for the shared-memory task queue")]
struct Args {
    /// Name of the queue region created by the client (e.g. /render-queue-42-...)
    #[arg(long)]
    queue: String,

    /// Milliseconds to sleep before answering each task
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,

    /// Abort the process after dequeuing this many tasks, without answering the last one
    #[arg(long)]
    crash_after: Option<u64>,

    /// Report every task as failed with this code instead of echoing it
    #[arg(long)]
    fail_code: Option<u32>,

    /// Seconds to wait for the client to drain a full result ring
    #[arg(long, default_value_t = 5)]
    result_timeout_secs: u64,
}

fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();
    let name = RegionName::new(args.queue.clone())
        .with_context(|| format!("invalid queue name {:?}", args.queue))?;
    let mut server =
        TaskQueueServer::open(&name).with_context(|| format!("failed to open queue {name}"))?;
    info!(
        queue = %name,
        pid = server.pid(),
        capacity = server.capacity(),
        slot_size = server.slot_size(),
        "driver attached"
    );

    let delay = Duration::from_millis(args.delay_ms);
    let mut seen = 0u64;
    let report = server
        .serve(Duration::from_secs(args.result_timeout_secs), |task| {
            seen += 1;
            if args.crash_after.is_some_and(|limit| seen >= limit) {
                warn!(id = %task.id(), "crash hook reached, aborting");
                process::abort();
            }
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            ControlFlow::Continue(respond(task, args.fail_code))
        })
        .context("failed to post result")?;

    match report.exit {
        ServeExit::ClientLost => info!(served = report.served, "client gone, exiting"),
        ServeExit::Stopped => info!(served = report.served, "stopped"),
    }
    Ok(())
}

fn respond(task: &Task, fail_code: Option<u32>) -> TaskOutcome {
    match fail_code {
        Some(code) => TaskOutcome::Failed { code },
        None => TaskOutcome::Done(task.payload().to_vec()),
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // Stdout belongs to the parent; keep diagnostics on stderr.
    let _ = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}
