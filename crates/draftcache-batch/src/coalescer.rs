//! Window-based request coalescing.
//!
//! Requests accumulate in an open window. The first `request` future polled in a
//! window yields once, then closes the window and flushes it: one backend call per
//! distinct group key (split into chunks of at most `max_items_per_call`), with
//! every request handed the subset of its group's records that match it.
//!
//! `queue` adds to the window without flushing, and `flush` closes the window
//! immediately. Both are for callers that control timing themselves.
//!
//! # Example
//!
//! ```ignore
//! let batcher = BatchCoalescer::new(EvaluatorSource::new(backend));
//! let a = batcher.request(&cx, query_a);
//! let b = batcher.request(&cx, query_b);
//!
//! // One call for both queries if they share a group key.
//! let (a, b) = (a.await?, b.await?);
//! ```

use crate::key::serialize_key;
use asupersync::{Cx, Outcome};
use draftcache_core::{Error, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

/// A backend that can answer many requests of one group with a single call.
pub trait BatchSource: Send + Sync {
    type Item: Serialize + Clone + Send + Sync;
    type Record: Clone + Send + Sync;

    /// Requests with the same group key are merged into one call.
    fn group_key(&self, item: &Self::Item) -> String;

    /// Identity of a request, used for deduplication within a window.
    fn serialize_key(&self, item: &Self::Item) -> Result<String> {
        serialize_key(item)
    }

    /// Fetch the records for a set of requests sharing one group key.
    fn fetch_group(
        &self,
        cx: &Cx,
        group: &str,
        items: &[Self::Item],
    ) -> impl Future<Output = Outcome<Vec<Self::Record>, Error>> + Send;

    /// Whether a record answers a request.
    fn matches(&self, item: &Self::Item, record: &Self::Record) -> bool;
}

/// Configuration for batch flushing.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Upper bound on requests merged into a single backend call.
    pub max_items_per_call: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_items_per_call: 256,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct SlotState<R> {
    result: Option<Result<Vec<R>>>,
    wakers: Vec<Waker>,
}

/// Result cell shared by every handle on one deduplicated request.
struct Slot<R> {
    state: Mutex<SlotState<R>>,
}

impl<R> Slot<R> {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                result: None,
                wakers: Vec::new(),
            }),
        }
    }

    fn resolved(result: Result<Vec<R>>) -> Self {
        Self {
            state: Mutex::new(SlotState {
                result: Some(result),
                wakers: Vec::new(),
            }),
        }
    }

    fn is_resolved(&self) -> bool {
        lock(&self.state).result.is_some()
    }

    /// Set the result once; later calls are ignored.
    fn resolve(&self, result: Result<Vec<R>>) {
        let wakers = {
            let mut state = lock(&self.state);
            if state.result.is_some() {
                return;
            }
            state.result = Some(result);
            std::mem::take(&mut state.wakers)
        };
        for waker in wakers {
            waker.wake();
        }
    }
}

/// Handle on a queued request, resolved when its window is flushed.
pub struct PendingRequest<R> {
    slot: Arc<Slot<R>>,
}

impl<R> Clone for PendingRequest<R> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<R> std::fmt::Debug for PendingRequest<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("resolved", &self.slot.is_resolved())
            .finish()
    }
}

impl<R: Clone> PendingRequest<R> {
    /// Result if the window has been flushed.
    pub fn try_result(&self) -> Option<Result<Vec<R>>> {
        lock(&self.slot.state).result.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.slot.is_resolved()
    }

    /// Check if two handles share one deduplicated request.
    pub fn same_request(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

impl<R: Clone> Future for PendingRequest<R> {
    type Output = Result<Vec<R>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = lock(&self.slot.state);
        if let Some(result) = &state.result {
            return Poll::Ready(result.clone());
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

struct Entry<I, R> {
    group: String,
    item: I,
    slot: Arc<Slot<R>>,
}

/// Requests collected between two flushes.
struct Window<I, R> {
    generation: u64,
    entries: Vec<Entry<I, R>>,
    by_key: HashMap<String, usize>,
}

impl<I, R> Window<I, R> {
    fn open(generation: u64) -> Self {
        Self {
            generation,
            entries: Vec::new(),
            by_key: HashMap::new(),
        }
    }
}

/// Returns `Pending` once, so requests made in the same tick join the window.
struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

/// A closed window being flushed.
///
/// Dropping it before every slot resolved (the flush was cancelled) fails the
/// leftover requests, so no waiter is stranded.
struct ClosedWindow<I, R> {
    entries: Vec<Entry<I, R>>,
}

impl<I, R> ClosedWindow<I, R> {
    fn fail_all(&self, error: &Error) {
        for entry in &self.entries {
            entry
                .slot
                .resolve(Err(Error::BatchFailure(Box::new(error.clone()))));
        }
    }
}

impl<I, R> Drop for ClosedWindow<I, R> {
    fn drop(&mut self) {
        let pending = self.entries.iter().filter(|e| !e.slot.is_resolved()).count();
        if pending > 0 {
            tracing::warn!(pending = pending, "Batch flush ended before resolving requests");
            self.fail_all(&Error::Custom("batch flush was cancelled".to_string()));
        }
    }
}

/// What one flush did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Distinct requests in the window.
    pub requests: usize,
    pub groups: usize,
    /// Backend calls made.
    pub calls: usize,
    /// Records returned across all calls.
    pub records: usize,
}

/// Coalesces requests into grouped backend calls.
pub struct BatchCoalescer<S: BatchSource> {
    source: S,
    config: BatchConfig,
    window: Mutex<Window<S::Item, S::Record>>,
}

impl<S: BatchSource> BatchCoalescer<S> {
    pub fn new(source: S) -> Self {
        Self::with_config(source, BatchConfig::default())
    }

    pub fn with_config(source: S, config: BatchConfig) -> Self {
        Self {
            source,
            config,
            window: Mutex::new(Window::open(0)),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Number of distinct requests waiting in the open window.
    pub fn pending(&self) -> usize {
        lock(&self.window).entries.len()
    }

    /// Queue a request in the open window without scheduling a flush.
    ///
    /// A request equal (by serialize key) to one already queued shares its result.
    pub fn queue(&self, item: S::Item) -> PendingRequest<S::Record> {
        self.enqueue(item).0
    }

    /// Queue a request and resolve it with its records.
    ///
    /// Every request made before the first of them is polled twice lands in the
    /// same window, which that future then flushes. A window already closed by
    /// `flush` or another request is not flushed again.
    pub fn request<'a>(
        &'a self,
        cx: &'a Cx,
        item: S::Item,
    ) -> impl Future<Output = Result<Vec<S::Record>>> + 'a {
        let (pending, generation) = self.enqueue(item);
        async move {
            if let Some(generation) = generation {
                YieldNow { yielded: false }.await;
                if let Some(closed) = self.close_window(Some(generation)) {
                    if let Outcome::Err(e) = self.run(cx, closed).await {
                        tracing::debug!(error = %e, "Scheduled batch flush failed");
                    }
                }
            }
            pending.await
        }
    }

    /// Add to the open window, returning its generation unless already resolved.
    #[tracing::instrument(level = "trace", skip_all)]
    fn enqueue(&self, item: S::Item) -> (PendingRequest<S::Record>, Option<u64>) {
        let key = match self.source.serialize_key(&item) {
            Ok(key) => key,
            Err(e) => {
                let pending = PendingRequest {
                    slot: Arc::new(Slot::resolved(Err(e))),
                };
                return (pending, None);
            }
        };
        let group = self.source.group_key(&item);

        let mut window = lock(&self.window);
        let generation = window.generation;
        if let Some(&index) = window.by_key.get(&key) {
            tracing::trace!(key = %key, "Joined queued request");
            let pending = PendingRequest {
                slot: Arc::clone(&window.entries[index].slot),
            };
            return (pending, Some(generation));
        }
        let slot = Arc::new(Slot::new());
        let index = window.entries.len();
        window.entries.push(Entry {
            group,
            item,
            slot: Arc::clone(&slot),
        });
        window.by_key.insert(key, index);
        (PendingRequest { slot }, Some(generation))
    }

    /// Swap in a fresh window. With `only`, do nothing unless the open window is
    /// that generation.
    fn close_window(&self, only: Option<u64>) -> Option<ClosedWindow<S::Item, S::Record>> {
        let mut window = lock(&self.window);
        if only.is_some_and(|g| g != window.generation) {
            return None;
        }
        let next = Window::open(window.generation.wrapping_add(1));
        let entries = std::mem::replace(&mut *window, next).entries;
        Some(ClosedWindow { entries })
    }

    /// Close the open window now and resolve every request in it.
    ///
    /// Requests made while the flush is running go into a new window. If any call
    /// fails, every request of the closed window fails with that error.
    #[tracing::instrument(level = "info", skip(self, cx))]
    pub async fn flush(&self, cx: &Cx) -> Outcome<FlushReport, Error> {
        match self.close_window(None) {
            Some(closed) => self.run(cx, closed).await,
            None => Outcome::Ok(FlushReport::default()),
        }
    }

    async fn run(
        &self,
        cx: &Cx,
        closed: ClosedWindow<S::Item, S::Record>,
    ) -> Outcome<FlushReport, Error> {
        let mut report = FlushReport {
            requests: closed.entries.len(),
            ..FlushReport::default()
        };
        if closed.entries.is_empty() {
            return Outcome::Ok(report);
        }

        // Group order follows first appearance in the window.
        let mut groups: Vec<(&str, Vec<usize>)> = Vec::new();
        for (index, entry) in closed.entries.iter().enumerate() {
            match groups.iter_mut().find(|(g, _)| *g == entry.group) {
                Some((_, members)) => members.push(index),
                None => groups.push((entry.group.as_str(), vec![index])),
            }
        }
        report.groups = groups.len();

        tracing::info!(
            requests = report.requests,
            groups = report.groups,
            "Flushing batch window"
        );
        let start = std::time::Instant::now();
        let chunk_size = self.config.max_items_per_call.max(1);

        let mut results: Vec<Vec<S::Record>> = Vec::with_capacity(groups.len());
        for (group, members) in &groups {
            let mut records = Vec::new();
            for chunk in members.chunks(chunk_size) {
                let items: Vec<S::Item> = chunk
                    .iter()
                    .map(|&i| closed.entries[i].item.clone())
                    .collect();
                report.calls += 1;
                match self.source.fetch_group(cx, group, &items).await {
                    Outcome::Ok(batch) => records.extend(batch),
                    Outcome::Err(e) => {
                        tracing::warn!(group = %group, error = %e, "Batch call failed");
                        closed.fail_all(&e);
                        return Outcome::Err(e);
                    }
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }
            report.records += records.len();
            results.push(records);
        }

        for ((_, members), records) in groups.iter().zip(&results) {
            for &index in members {
                let entry = &closed.entries[index];
                let matched: Vec<S::Record> = records
                    .iter()
                    .filter(|r| self.source.matches(&entry.item, r))
                    .cloned()
                    .collect();
                entry.slot.resolve(Ok(matched));
            }
        }

        tracing::info!(
            elapsed_ms = start.elapsed().as_millis(),
            calls = report.calls,
            records = report.records,
            "Batch flush complete"
        );
        Outcome::Ok(report)
    }

    /// Queue every item, flush, and return each item's records in input order.
    pub async fn fetch_many(
        &self,
        cx: &Cx,
        items: Vec<S::Item>,
    ) -> Outcome<Vec<Vec<S::Record>>, Error> {
        let pending: Vec<PendingRequest<S::Record>> =
            items.into_iter().map(|item| self.queue(item)).collect();
        match self.flush(cx).await {
            Outcome::Ok(_) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        let mut out = Vec::with_capacity(pending.len());
        for request in pending {
            match request.try_result() {
                Some(Ok(records)) => out.push(records),
                Some(Err(e)) => return Outcome::Err(e),
                // Flushed by a concurrent caller that has not finished yet.
                None => match request.await {
                    Ok(records) => out.push(records),
                    Err(e) => return Outcome::Err(e),
                },
            }
        }
        Outcome::Ok(out)
    }
}
