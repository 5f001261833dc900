//! Bounded-concurrency fan-out.
//!
//! Tasks run with at most `concurrency` children in flight; results come
//! back in input order regardless of completion order. Fail-fast rides the
//! group's cancellation signal: peers that have not started are skipped
//! outright, peers in flight are cancelled and reported as skipped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Semaphore};

use crate::domain::StepResult;
use crate::runner::ResolvedStep;

use super::executor::{run_sync, ExecContext};

/// Hard cap on top-level parallel fan-out.
pub const MAX_PARALLEL: usize = 16;

/// Default number of concurrently running children.
pub const MAX_CONCURRENCY: usize = 4;

/// Run a group of tasks with bounded concurrency.
///
/// Each entry carries its own context (artifact namespacing differs per
/// task); the contexts' cancel receivers are replaced with the group's
/// signal, which is tripped by the outer cancel or by a fail-fast failure.
pub async fn run_group(
    tasks: Vec<(ResolvedStep, ExecContext)>,
    concurrency: usize,
    fail_fast: bool,
    outer_cancel: watch::Receiver<bool>,
) -> Vec<StepResult> {
    let total = tasks.len();
    if total == 0 {
        return Vec::new();
    }

    // 0 or negative bounds coerce to strictly sequential.
    let concurrency = concurrency.max(1);

    let (group_tx, group_rx) = watch::channel(false);
    let group_tx = Arc::new(group_tx);
    let failed = Arc::new(AtomicBool::new(false));
    let semaphore = Arc::new(Semaphore::new(concurrency));

    // Forward the outer cancellation into the group signal.
    let forwarder = {
        let group_tx = Arc::clone(&group_tx);
        let mut outer = outer_cancel.clone();
        tokio::spawn(async move {
            let mut fire = { *outer.borrow() };
            if !fire && outer.changed().await.is_ok() {
                fire = *outer.borrow();
            }
            if fire {
                let _ = group_tx.send(true);
            }
        })
    };

    let agent_names: Vec<String> = tasks.iter().map(|(step, _)| step.agent.clone()).collect();

    let mut handles = Vec::with_capacity(total);
    for (index, (step, mut ctx)) in tasks.into_iter().enumerate() {
        ctx.cancel = group_rx.clone();
        let semaphore = Arc::clone(&semaphore);
        let failed = Arc::clone(&failed);
        let group_tx = Arc::clone(&group_tx);

        handles.push(tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return (index, StepResult::skipped(&step.agent));
            };
            if fail_fast && failed.load(Ordering::SeqCst) {
                return (index, StepResult::skipped(&step.agent));
            }

            let result = run_sync(&step, &ctx).await;

            if fail_fast && !result.succeeded() && !result.was_skipped() {
                failed.store(true, Ordering::SeqCst);
                let _ = group_tx.send(true);
            }
            (index, result)
        }));
    }

    let mut slots: Vec<Option<StepResult>> = (0..total).map(|_| None).collect();
    for handle in handles {
        if let Ok((index, result)) = handle.await {
            slots[index] = Some(result);
        }
    }
    forwarder.abort();

    let group_failed = failed.load(Ordering::SeqCst);
    let outer_cancelled = *outer_cancel.borrow();

    slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| {
            let result = slot.unwrap_or_else(|| StepResult::skipped(&agent_names[index]));
            // A peer cancelled by the fail-fast trip (not by the caller)
            // counts as skipped, not cancelled.
            if group_failed
                && !outer_cancelled
                && result.exit_code == StepResult::EXIT_CANCELLED
            {
                StepResult::skipped(&agent_names[index])
            } else {
                result
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrency_clamp() {
        // The clamp itself: 0 coerces to 1.
        assert_eq!(0usize.max(1), 1);
        assert_eq!(MAX_CONCURRENCY, 4);
        assert_eq!(MAX_PARALLEL, 16);
    }

    #[tokio::test]
    async fn test_empty_group_returns_empty() {
        let (_tx, rx) = watch::channel(false);
        let results = run_group(Vec::new(), 4, false, rx).await;
        assert!(results.is_empty());
    }
}
