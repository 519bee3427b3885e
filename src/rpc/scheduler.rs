//! Process Scheduler
//!
//! Work arrives tagged Serial or Parallel and is grouped into batches: a
//! batch stays open while items of its type keep arriving and closes the
//! moment an item of the other type is submitted. A single driver task
//! drains batches strictly in the order they were opened:
//!
//! - Serial batch: one item at a time, in submission order
//! - Parallel batch: all items concurrently, up to an optional global cap
//!
//! A later batch never starts before every item of the earlier one has
//! settled. Closing a Parallel batch fires its content-modified signal,
//! which aborts whatever in that batch has not finished yet.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use super::handler::ProcessType;

#[derive(Debug, Clone, Default)]
pub struct SchedulerOptions {
    /// Cap on concurrently running Parallel items, unbounded when `None`
    pub max_concurrency: Option<usize>,
    /// Fire content-modified when a Parallel batch is closed
    pub content_modified: bool,
}

/// Why a work item stopped before finishing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    Cancelled,
    ContentModified,
    TimedOut,
}

type AbortCallback = Box<dyn FnOnce(AbortReason) + Send>;

/// One schedulable unit
pub struct WorkItem {
    name: String,
    run: BoxFuture<'static, ()>,
    cancel: CancellationToken,
    content_modified: CancellationToken,
    timeout: Option<Duration>,
    on_abort: Option<AbortCallback>,
}

impl WorkItem {
    pub fn new<F>(name: impl Into<String>, run: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: run.boxed(),
            cancel: CancellationToken::new(),
            content_modified: CancellationToken::new(),
            timeout: None,
            on_abort: None,
        }
    }

    /// Race the item against this token; it is also fired when the item
    /// loses to a timeout or content change.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Limit measured from when the item starts running
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn on_abort(mut self, callback: impl FnOnce(AbortReason) + Send + 'static) -> Self {
        self.on_abort = Some(Box::new(callback));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

struct OpenBatch {
    process_type: ProcessType,
    items: mpsc::UnboundedSender<WorkItem>,
    content_modified: CancellationToken,
}

struct QueuedBatch {
    process_type: ProcessType,
    items: mpsc::UnboundedReceiver<WorkItem>,
}

struct SchedulerState {
    current: Option<OpenBatch>,
    batches: Option<mpsc::UnboundedSender<QueuedBatch>>,
}

pub struct ProcessScheduler {
    options: SchedulerOptions,
    state: Mutex<SchedulerState>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessScheduler {
    /// Start the scheduler. Must be called inside a Tokio runtime.
    pub fn new(options: SchedulerOptions) -> Self {
        let (batches_tx, batches_rx) = mpsc::unbounded_channel();
        let limit = options
            .max_concurrency
            .map(|n| Arc::new(Semaphore::new(n.max(1))));
        let driver = tokio::spawn(drive(batches_rx, limit));

        Self {
            options,
            state: Mutex::new(SchedulerState {
                current: None,
                batches: Some(batches_tx),
            }),
            driver: Mutex::new(Some(driver)),
        }
    }

    /// Queue one item. `factory` receives the content-modified signal of
    /// the batch the item joins (a signal that never fires for Serial
    /// batches or when the feature is off). Returns false once the
    /// scheduler is shut down; the factory is not called then.
    pub fn submit<F>(&self, process_type: ProcessType, factory: F) -> bool
    where
        F: FnOnce(&CancellationToken) -> WorkItem,
    {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(batches) = state.batches.clone() else {
            return false;
        };

        let switch = state
            .current
            .as_ref()
            .is_none_or(|batch| batch.process_type != process_type);
        if switch {
            if let Some(closed) = state.current.take() {
                tracing::debug!(
                    from = ?closed.process_type,
                    to = ?process_type,
                    "Closing batch"
                );
                if closed.process_type == ProcessType::Parallel && self.options.content_modified {
                    closed.content_modified.cancel();
                }
            }

            let (items_tx, items_rx) = mpsc::unbounded_channel();
            if batches
                .send(QueuedBatch {
                    process_type,
                    items: items_rx,
                })
                .is_err()
            {
                return false;
            }
            state.current = Some(OpenBatch {
                process_type,
                items: items_tx,
                content_modified: CancellationToken::new(),
            });
        }

        let Some(batch) = state.current.as_ref() else {
            return false;
        };
        let signal = if process_type == ProcessType::Parallel && self.options.content_modified {
            batch.content_modified.clone()
        } else {
            CancellationToken::new()
        };

        let mut item = factory(&signal);
        item.content_modified = signal;
        batch.items.send(item).is_ok()
    }

    /// Stop accepting work and wait for everything queued to drain.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.current = None;
            state.batches = None;
        }

        let driver = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(driver) = driver
            && let Err(e) = driver.await
        {
            tracing::error!("Scheduler driver failed: {e}");
        }
    }
}

async fn drive(mut batches: mpsc::UnboundedReceiver<QueuedBatch>, limit: Option<Arc<Semaphore>>) {
    while let Some(batch) = batches.recv().await {
        tracing::debug!(process_type = ?batch.process_type, "Draining batch");
        match batch.process_type {
            ProcessType::Serial => drain_serial(batch.items).await,
            ProcessType::Parallel => drain_parallel(batch.items, limit.clone()).await,
        }
    }
}

async fn drain_serial(mut items: mpsc::UnboundedReceiver<WorkItem>) {
    while let Some(item) = items.recv().await {
        run_item(item).await;
    }
}

async fn drain_parallel(
    mut items: mpsc::UnboundedReceiver<WorkItem>,
    limit: Option<Arc<Semaphore>>,
) {
    let mut running = JoinSet::new();
    let mut open = true;

    loop {
        tokio::select! {
            item = items.recv(), if open => match item {
                Some(item) => {
                    let limit = limit.clone();
                    running.spawn(async move {
                        let _permit = match limit {
                            Some(semaphore) => semaphore.acquire_owned().await.ok(),
                            None => None,
                        };
                        run_item(item).await;
                    });
                }
                None => open = false,
            },
            Some(joined) = running.join_next(), if !running.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!("Parallel work item task failed: {e}");
                }
            }
            else => break,
        }
    }
}

/// Race an item against its abort sources. The losing future is dropped.
async fn run_item(item: WorkItem) {
    let WorkItem {
        name,
        run,
        cancel,
        content_modified,
        timeout,
        on_abort,
    } = item;

    let deadline = async {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };

    let aborted = tokio::select! {
        biased;
        _ = content_modified.cancelled() => Some(AbortReason::ContentModified),
        _ = cancel.cancelled() => Some(AbortReason::Cancelled),
        _ = deadline => Some(AbortReason::TimedOut),
        outcome = AssertUnwindSafe(run).catch_unwind() => {
            if outcome.is_err() {
                tracing::error!(item = %name, "Work item panicked");
            }
            None
        }
    };

    if let Some(reason) = aborted {
        cancel.cancel();
        tracing::debug!(item = %name, ?reason, "Work item aborted");
        if let Some(on_abort) = on_abort {
            on_abort(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::oneshot;

    use super::*;

    type Log = Arc<Mutex<Vec<String>>>;

    fn push(log: &Log, entry: impl Into<String>) {
        log.lock().unwrap().push(entry.into());
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    fn recorded(log: &Log, name: &str, delay_ms: u64) -> impl FnOnce(&CancellationToken) -> WorkItem {
        let log = Arc::clone(log);
        let name = name.to_string();
        move |_: &CancellationToken| {
            WorkItem::new(name.clone(), async move {
                push(&log, format!("{name}:start"));
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                push(&log, format!("{name}:end"));
            })
        }
    }

    fn position(log: &[String], entry: &str) -> usize {
        log.iter()
            .position(|e| e == entry)
            .unwrap_or_else(|| panic!("missing {entry} in {log:?}"))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_serial_items_run_in_order() {
        let scheduler = ProcessScheduler::new(SchedulerOptions::default());
        let log: Log = Arc::default();

        assert!(scheduler.submit(ProcessType::Serial, recorded(&log, "a", 30)));
        assert!(scheduler.submit(ProcessType::Serial, recorded(&log, "b", 10)));
        assert!(scheduler.submit(ProcessType::Serial, recorded(&log, "c", 0)));
        scheduler.shutdown().await;

        assert_eq!(
            entries(&log),
            vec!["a:start", "a:end", "b:start", "b:end", "c:start", "c:end"]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_batches_are_isolated() {
        let scheduler = ProcessScheduler::new(SchedulerOptions::default());
        let log: Log = Arc::default();

        scheduler.submit(ProcessType::Serial, recorded(&log, "s1", 20));
        scheduler.submit(ProcessType::Parallel, recorded(&log, "p1", 40));
        scheduler.submit(ProcessType::Parallel, recorded(&log, "p2", 40));
        scheduler.submit(ProcessType::Serial, recorded(&log, "s2", 0));
        scheduler.shutdown().await;

        let log = entries(&log);
        assert!(position(&log, "s1:end") < position(&log, "p1:start"));
        assert!(position(&log, "s1:end") < position(&log, "p2:start"));
        // p1 and p2 overlap
        assert!(position(&log, "p1:start") < position(&log, "p2:end"));
        assert!(position(&log, "p2:start") < position(&log, "p1:end"));
        assert!(position(&log, "p1:end") < position(&log, "s2:start"));
        assert!(position(&log, "p2:end") < position(&log, "s2:start"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_cap() {
        let scheduler = ProcessScheduler::new(SchedulerOptions {
            max_concurrency: Some(2),
            content_modified: false,
        });
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for i in 0..6 {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            scheduler.submit(ProcessType::Parallel, move |_| {
                WorkItem::new(format!("p{i}"), async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                })
            });
        }
        scheduler.shutdown().await;

        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_content_modified_aborts_running_parallel_item() {
        let scheduler = ProcessScheduler::new(SchedulerOptions {
            max_concurrency: None,
            content_modified: true,
        });
        let (started_tx, started_rx) = oneshot::channel();
        let (abort_tx, abort_rx) = oneshot::channel();
        let finished = Arc::new(AtomicUsize::new(0));
        let observed_token = Arc::new(Mutex::new(None));

        {
            let finished = Arc::clone(&finished);
            let observed_token = Arc::clone(&observed_token);
            scheduler.submit(ProcessType::Parallel, move |signal| {
                assert!(!signal.is_cancelled());
                let token = CancellationToken::new();
                *observed_token.lock().unwrap() = Some(token.clone());
                WorkItem::new("slow", async move {
                    let _ = started_tx.send(());
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                })
                .with_cancellation(token)
                .on_abort(move |reason| {
                    let _ = abort_tx.send(reason);
                })
            });
        }

        started_rx.await.unwrap();
        scheduler.submit(ProcessType::Serial, |signal| {
            assert!(!signal.is_cancelled());
            WorkItem::new("edit", async {})
        });

        assert_eq!(abort_rx.await.unwrap(), AbortReason::ContentModified);
        let token = observed_token.lock().unwrap().take().unwrap();
        assert!(token.is_cancelled());
        scheduler.shutdown().await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_content_modified_disabled() {
        let scheduler = ProcessScheduler::new(SchedulerOptions::default());
        let log: Log = Arc::default();

        scheduler.submit(ProcessType::Parallel, recorded(&log, "p", 20));
        scheduler.submit(ProcessType::Serial, recorded(&log, "s", 0));
        scheduler.shutdown().await;

        assert_eq!(entries(&log), vec!["p:start", "p:end", "s:start", "s:end"]);
    }

    #[tokio::test]
    async fn test_explicit_cancellation() {
        let scheduler = ProcessScheduler::new(SchedulerOptions::default());
        let token = CancellationToken::new();
        let (abort_tx, abort_rx) = oneshot::channel();

        let item_token = token.clone();
        scheduler.submit(ProcessType::Serial, move |_| {
            WorkItem::new("forever", std::future::pending())
                .with_cancellation(item_token)
                .on_abort(move |reason| {
                    let _ = abort_tx.send(reason);
                })
        });

        token.cancel();
        assert_eq!(abort_rx.await.unwrap(), AbortReason::Cancelled);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_only_affects_its_item() {
        let scheduler = ProcessScheduler::new(SchedulerOptions::default());
        let log: Log = Arc::default();
        let (abort_tx, abort_rx) = oneshot::channel();

        scheduler.submit(ProcessType::Parallel, move |_| {
            WorkItem::new("stuck", std::future::pending())
                .with_timeout(Some(Duration::from_secs(5)))
                .on_abort(move |reason| {
                    let _ = abort_tx.send(reason);
                })
        });
        scheduler.submit(ProcessType::Parallel, recorded(&log, "sibling", 1));

        assert_eq!(abort_rx.await.unwrap(), AbortReason::TimedOut);
        scheduler.shutdown().await;
        assert_eq!(entries(&log), vec!["sibling:start", "sibling:end"]);
    }

    #[tokio::test]
    async fn test_panicking_item_does_not_stop_pipeline() {
        let scheduler = ProcessScheduler::new(SchedulerOptions::default());
        let log: Log = Arc::default();

        scheduler.submit(ProcessType::Serial, |_| {
            WorkItem::new("bad", async { panic!("item failure"); })
        });
        scheduler.submit(ProcessType::Parallel, |_| {
            WorkItem::new("bad-parallel", async { panic!("item failure"); })
        });
        scheduler.submit(ProcessType::Serial, recorded(&log, "after", 0));
        scheduler.shutdown().await;

        assert_eq!(entries(&log), vec!["after:start", "after:end"]);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown() {
        let scheduler = ProcessScheduler::new(SchedulerOptions::default());
        scheduler.shutdown().await;
        assert!(!scheduler.submit(ProcessType::Serial, |_| {
            panic!("factory must not run after shutdown")
        }));
    }
}
