//! Dead-letter commands.

use super::open_store;
use super::queue::print_operation;
use expensync_core::LocalStore;
use expensync_sync::PendingQueue;
use std::path::Path;
use std::sync::Arc;

fn open(path: &Path) -> Result<(Arc<LocalStore>, PendingQueue), Box<dyn std::error::Error>> {
    let store = Arc::new(open_store(path)?);
    let queue = PendingQueue::new(Arc::clone(&store));
    Ok((store, queue))
}

/// Lists dead letters.
pub fn list(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let (store, queue) = open(path)?;
    let letters = queue.dead_letters()?;
    store.close()?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&letters)?),
        _ => {
            println!("{} dead letter(s)", letters.len());
            for letter in &letters {
                print_operation(&letter.operation);
                println!("          abandoned: {}", letter.reason);
            }
        }
    }
    Ok(())
}

/// Puts a dead letter back on the queue.
pub fn requeue(path: &Path, operation_id: u64) -> Result<(), Box<dyn std::error::Error>> {
    let (store, queue) = open(path)?;
    let requeued = queue.requeue(operation_id)?;
    store.close()?;

    match requeued {
        Some(op) => {
            println!("✓ Requeued #{operation_id} as #{}", op.operation_id);
            Ok(())
        }
        None => Err(format!("No dead letter #{operation_id}").into()),
    }
}

/// Deletes a dead letter.
pub fn discard(path: &Path, operation_id: u64) -> Result<(), Box<dyn std::error::Error>> {
    let (store, queue) = open(path)?;
    let discarded = queue.discard(operation_id)?;
    store.close()?;

    if discarded {
        println!("✓ Discarded #{operation_id}");
        Ok(())
    } else {
        Err(format!("No dead letter #{operation_id}").into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::seed_store;
    use expensync_sync::OperationKind;

    #[test]
    fn requeue_and_discard() {
        let dir = tempfile::tempdir().unwrap();
        seed_store(dir.path());
        {
            let (store, queue) = open(dir.path()).unwrap();
            let a = queue.enqueue(OperationKind::Delete, "expenses", Some("e1"), None, None).unwrap();
            let b = queue.enqueue(OperationKind::Delete, "expenses", Some("e2"), None, None).unwrap();
            queue.abandon(&a, "rejected").unwrap();
            queue.abandon(&b, "rejected").unwrap();
            store.close().unwrap();
        }

        requeue(dir.path(), 1).unwrap();
        discard(dir.path(), 2).unwrap();
        assert!(discard(dir.path(), 2).is_err());

        let (_store, queue) = open(dir.path()).unwrap();
        assert!(queue.dead_letters().unwrap().is_empty());
        let pending = queue.list().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].target_id(), Some("e1"));
    }
}
