use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use fm_dispatch::dispatcher::Dispatcher;
use fm_dispatch::pool::DispatchPool;
use fm_dispatch::shutdown::ShutdownSignal;
use fm_dispatch::worker::ProcessWorker;

use super::open_context;
use crate::exit_codes;

/// Dispatch workers for ready tasks until the plan settles or Ctrl-C
/// cancels the run. Returns the exit code (`DISPATCH_TIMEOUT` when any
/// worker hit its timeout).
pub async fn run(
    project_root: &Path,
    max_parallel: Option<usize>,
    timeout_secs: Option<u64>,
) -> anyhow::Result<i32> {
    let ctx = open_context(project_root)?;
    let timeout = Duration::from_secs(timeout_secs.unwrap_or(ctx.config.worker.timeout_secs));

    let shutdown = ShutdownSignal::new();
    let ctrl_c_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, cancelling run");
            ctrl_c_signal.trigger();
        }
    });

    let backend = Arc::new(ProcessWorker::from_config(&ctx.config.worker));
    let dispatcher = Arc::new(Dispatcher::new(
        backend,
        ctx.sync.clone(),
        timeout,
        shutdown.clone(),
    ));
    let pool = DispatchPool::new(ctx.sync.clone(), ctx.manager.clone(), dispatcher, shutdown)
        .with_max_parallel(max_parallel);

    let summary = pool.run().await?;

    println!("Run finished:");
    println!("  dispatched:      {}", summary.dispatched);
    println!("  completed:       {}", summary.completed);
    println!("  blocked:         {}", summary.blocked);
    if summary.timeouts > 0 {
        println!("  timed out:       {}", summary.timeouts);
    }
    if summary.failed_to_start > 0 {
        println!("  failed to start: {}", summary.failed_to_start);
    }
    if summary.conflict_warnings > 0 {
        println!("  conflict warnings: {}", summary.conflict_warnings);
    }
    println!();
    println!("Next: fm status, then fm reconcile for completed tasks.");

    if summary.timeouts > 0 {
        Ok(exit_codes::DISPATCH_TIMEOUT)
    } else {
        Ok(exit_codes::OK)
    }
}
