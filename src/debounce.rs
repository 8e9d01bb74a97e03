//! Async debounce.
//!
//! [`Debounce`] collapses overlapping invocations of a parameterless async
//! task into at most one in-flight run plus one queued follow-up. Callers
//! arriving while a run is in flight all share the same follow-up future;
//! callers arriving while the slot is idle start a fresh run. The backend
//! recalculation is wrapped in this: it reads the whole backend state and is
//! not reentrant-safe, so the collapse is part of its contract.

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

type TaskFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// A shared handle to one scheduled run of the task.
pub type DebouncedRun = Shared<BoxFuture<'static, ()>>;

#[derive(Default)]
struct Slots {
    in_flight: Option<DebouncedRun>,
    queued: Option<DebouncedRun>,
}

/// Debounced wrapper around an async task.
pub struct Debounce {
    task: TaskFn,
    slots: Arc<Mutex<Slots>>,
}

impl Debounce {
    /// Wrap `task`.
    pub fn new<F>(task: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        Self {
            task: Arc::new(task),
            slots: Arc::new(Mutex::new(Slots::default())),
        }
    }

    /// Request a run.
    ///
    /// Returns a future resolving when the run this call was folded into
    /// completes. The run is driven by a spawned task, so the returned
    /// future may be dropped without stalling the work.
    pub fn call(&self) -> DebouncedRun {
        let mut slots = self.slots.lock();

        if let Some(queued) = &slots.queued {
            return queued.clone();
        }

        if let Some(current) = slots.in_flight.clone() {
            let fut = schedule(self.slots.clone(), self.task.clone(), Some(current));
            slots.queued = Some(fut.clone());
            tokio::spawn(fut.clone());
            return fut;
        }

        let fut = schedule(self.slots.clone(), self.task.clone(), None);
        slots.in_flight = Some(fut.clone());
        tokio::spawn(fut.clone());
        fut
    }
}

/// Build one run: wait for the predecessor, execute the task, then promote
/// any queued follow-up into the in-flight slot.
fn schedule(slots: Arc<Mutex<Slots>>, task: TaskFn, prev: Option<DebouncedRun>) -> DebouncedRun {
    async move {
        if let Some(prev) = prev {
            prev.await;
        }
        task().await;
        let mut s = slots.lock();
        s.in_flight = s.queued.take();
    }
    .boxed()
    .shared()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting_debounce(delay: Duration) -> (Debounce, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let debounce = Debounce::new(move || {
            let c = c.clone();
            async move {
                tokio::time::sleep(delay).await;
                c.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        });
        (debounce, count)
    }

    #[tokio::test]
    async fn single_call_runs_once() {
        let (debounce, count) = counting_debounce(Duration::from_millis(5));
        debounce.call().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn overlapping_calls_collapse_into_one_follow_up() {
        let (debounce, count) = counting_debounce(Duration::from_millis(30));

        let first = debounce.call();
        let second = debounce.call();
        let third = debounce.call();
        let fourth = debounce.call();

        first.await;
        second.await;
        third.await;
        fourth.await;

        // One in-flight run plus a single queued follow-up.
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn queued_callers_share_the_same_future() {
        let (debounce, _count) = counting_debounce(Duration::from_millis(30));

        let _first = debounce.call();
        let second = debounce.call();
        let third = debounce.call();
        assert!(second.ptr_eq(&third));
    }

    #[tokio::test]
    async fn sequential_calls_each_run() {
        let (debounce, count) = counting_debounce(Duration::from_millis(1));
        for _ in 0..3 {
            debounce.call().await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn runs_even_when_the_returned_future_is_dropped() {
        let (debounce, count) = counting_debounce(Duration::from_millis(1));
        drop(debounce.call());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn call_during_follow_up_queues_a_third_run() {
        let (debounce, count) = counting_debounce(Duration::from_millis(20));

        let first = debounce.call();
        let second = debounce.call();
        first.await;
        // The follow-up is now in flight; this call must queue a new run.
        let third = debounce.call();
        assert!(!second.ptr_eq(&third));
        second.await;
        third.await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
