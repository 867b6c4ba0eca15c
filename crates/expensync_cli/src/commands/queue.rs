//! Queue command implementation.

use super::open_store;
use expensync_sync::{PendingOperation, PendingQueue};
use std::path::Path;
use std::sync::Arc;

/// Runs the queue command.
pub fn run(path: &Path, limit: Option<usize>, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(open_store(path)?);
    let queue = PendingQueue::new(Arc::clone(&store));
    let mut ops = queue.list()?;
    let total = ops.len();
    if let Some(limit) = limit {
        ops.truncate(limit);
    }
    store.close()?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&ops)?),
        _ => {
            println!("{total} pending operation(s)");
            for op in &ops {
                print_operation(op);
            }
            if ops.len() < total {
                println!("... {} more", total - ops.len());
            }
        }
    }
    Ok(())
}

pub(crate) fn print_operation(op: &PendingOperation) {
    println!(
        "  #{:<6} {:<7} {}/{}  retries={}",
        op.operation_id,
        op.kind,
        op.collection,
        op.target_id().unwrap_or("?"),
        op.retry_count
    );
    if let Some(error) = &op.last_error {
        println!("          last error: {error}");
    }
}
