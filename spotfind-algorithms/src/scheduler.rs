//! Parallel task scheduling with in-order delivery.
//!
//! Tasks are grouped into contiguous chunks. Worker threads claim chunks from
//! a shared cursor, run every task in the chunk and send the outputs back over
//! a bounded channel. The calling thread buffers completed chunks in a
//! min-heap keyed by chunk id and hands outputs to the consumer strictly in
//! task order, so the consumer never observes a gap.
//!
//! Workers never run more than [`SchedulerPlan::reorder_window`] chunks ahead
//! of the next chunk to deliver, which bounds the number of buffered outputs.
//!
//! Log records produced by a task are captured in a [`TaskLog`] and replayed
//! on the calling thread once the owning chunk has been merged.

use spotfind_core::{ChunkSize, Error, Result, SchedulerConfig};
use std::any::Any;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::ops::Range;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::{Condvar, Mutex, PoisonError};

/// A unit of work that can be run on any worker thread.
pub trait Task: Sync {
    /// Per-thread state, created once on the thread that uses it.
    type Worker;
    /// Result of one task.
    type Output: Send;

    /// Creates the per-thread state, e.g. an image reader.
    ///
    /// # Errors
    /// Returns an error if the worker resources cannot be acquired.
    fn start_worker(&self) -> Result<Self::Worker>;

    /// Runs the task with the given index.
    ///
    /// # Errors
    /// Returns an error if the task fails; remaining chunks are then cancelled.
    fn run(&self, worker: &mut Self::Worker, index: usize, log: &mut TaskLog)
        -> Result<Self::Output>;
}

/// One captured log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Severity.
    pub level: log::Level,
    /// Formatted message.
    pub message: String,
}

/// Log records captured while running a task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskLog {
    records: Vec<LogRecord>,
}

impl TaskLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Captures a record.
    pub fn push(&mut self, level: log::Level, message: impl Into<String>) {
        self.records.push(LogRecord {
            level,
            message: message.into(),
        });
    }

    /// Captures an info record.
    pub fn info(&mut self, message: impl Into<String>) {
        self.push(log::Level::Info, message);
    }

    /// Captures a debug record.
    pub fn debug(&mut self, message: impl Into<String>) {
        self.push(log::Level::Debug, message);
    }

    /// Captures a warning.
    pub fn warn(&mut self, message: impl Into<String>) {
        self.push(log::Level::Warn, message);
    }

    /// Captured records in emission order.
    #[must_use]
    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    /// Emits every captured record through the `log` facade and clears the log.
    pub fn replay(&mut self) {
        for record in self.records.drain(..) {
            log::log!(record.level, "{}", record.message);
        }
    }
}

/// Resolved worker layout for a number of tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerPlan {
    /// Worker threads per job.
    pub worker_count: usize,
    /// Number of jobs.
    pub job_count: usize,
    /// Tasks per chunk.
    pub chunk_size: usize,
    /// Number of tasks.
    pub num_tasks: usize,
}

impl SchedulerPlan {
    /// Clamps the configured counts to the number of tasks.
    ///
    /// When there are more threads than tasks, the worker count is limited to
    /// the task count and the job count to `ceil(tasks / workers)`. An automatic
    /// chunk size splits the tasks evenly over all threads, and any chunk size
    /// is capped at `max(1, floor(tasks / threads))`.
    #[must_use]
    pub fn resolve(config: &SchedulerConfig, num_tasks: usize) -> Self {
        let mut worker_count = config.worker_count.max(1);
        let mut job_count = config.job_count.max(1);
        if num_tasks > 0 && worker_count.saturating_mul(job_count) > num_tasks {
            worker_count = worker_count.min(num_tasks);
            job_count = num_tasks.div_ceil(worker_count);
        }
        let threads = worker_count.saturating_mul(job_count);
        let chunk_size = match config.chunk_size {
            ChunkSize::Auto => num_tasks.div_ceil(threads),
            ChunkSize::Fixed(size) => size,
        };
        let cap = (num_tasks / threads).max(1);
        Self {
            worker_count,
            job_count,
            chunk_size: chunk_size.clamp(1, cap),
            num_tasks,
        }
    }

    /// Total number of worker threads.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.worker_count.saturating_mul(self.job_count)
    }

    /// Maximum number of chunks that may be claimed beyond the next chunk to
    /// deliver.
    #[must_use]
    pub fn reorder_window(&self) -> usize {
        self.thread_count().saturating_mul(2)
    }

    /// True when tasks run on the calling thread.
    #[must_use]
    pub fn is_sequential(&self) -> bool {
        self.thread_count() == 1
    }

    /// Number of chunks.
    #[must_use]
    pub fn num_chunks(&self) -> usize {
        self.num_tasks.div_ceil(self.chunk_size)
    }

    /// Task indices covered by a chunk.
    #[must_use]
    pub fn chunk_range(&self, chunk: usize) -> Range<usize> {
        let start = chunk * self.chunk_size;
        start..(start + self.chunk_size).min(self.num_tasks)
    }
}

/// Tracks delivery progress so workers stay within the reorder window.
struct DeliveryWindow {
    delivered: Mutex<usize>,
    advanced: Condvar,
    size: usize,
}

impl DeliveryWindow {
    fn new(size: usize) -> Self {
        Self {
            delivered: Mutex::new(0),
            advanced: Condvar::new(),
            size: size.max(1),
        }
    }

    /// Blocks until `chunk` is within the window. Returns false on cancellation.
    fn wait_for(&self, chunk: usize, cancel: &AtomicBool) -> bool {
        let mut delivered = self.delivered.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if cancel.load(AtomicOrdering::SeqCst) {
                return false;
            }
            if chunk < delivered.saturating_add(self.size) {
                return true;
            }
            delivered = self
                .advanced
                .wait(delivered)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn advance(&self, delivered: usize) {
        *self.delivered.lock().unwrap_or_else(PoisonError::into_inner) = delivered;
        self.advanced.notify_all();
    }

    /// Sets the cancel flag and wakes every waiting worker.
    fn cancel(&self, cancel: &AtomicBool) {
        let _guard = self.delivered.lock().unwrap_or_else(PoisonError::into_inner);
        cancel.store(true, AtomicOrdering::SeqCst);
        self.advanced.notify_all();
    }
}

/// Completed chunk waiting to be merged.
struct ChunkResult<O> {
    chunk: usize,
    outcome: Result<Vec<O>>,
    log: TaskLog,
}

// Order by chunk id (reverse for Min-Heap)
impl<O> PartialEq for ChunkResult<O> {
    fn eq(&self, other: &Self) -> bool {
        self.chunk == other.chunk
    }
}

impl<O> Eq for ChunkResult<O> {}

impl<O> PartialOrd for ChunkResult<O> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<O> Ord for ChunkResult<O> {
    fn cmp(&self, other: &Self) -> Ordering {
        other.chunk.cmp(&self.chunk)
    }
}

/// Runs tasks over a pool of scoped threads and merges outputs in order.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParallelScheduler {
    config: SchedulerConfig,
}

impl ParallelScheduler {
    /// Creates a scheduler.
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    /// Runs tasks `0..num_tasks` and passes each output to `consume` in index order.
    ///
    /// With a single thread, tasks run on the calling thread, their logs are
    /// emitted immediately and task errors are returned unchanged. Otherwise
    /// a task error is returned as [`Error::WorkerFault`] and a panic as
    /// [`Error::WorkerPanic`]; both stop the claiming of further chunks.
    /// Outputs are delivered for a gap-free prefix of the tasks only.
    ///
    /// # Errors
    /// Returns the first failing task's error in task order, or the first
    /// error returned by `consume`.
    pub fn run<T, F>(&self, task: &T, num_tasks: usize, mut consume: F) -> Result<()>
    where
        T: Task,
        F: FnMut(usize, T::Output) -> Result<()>,
    {
        self.config.validate()?;
        if num_tasks == 0 {
            return Ok(());
        }
        let plan = SchedulerPlan::resolve(&self.config, num_tasks);
        if self.config.chunk_size == ChunkSize::Auto {
            log::info!("Setting chunksize={}", plan.chunk_size);
        }
        if plan.job_count > 1 {
            log::info!(
                " Using {} parallel job(s) and {} threads per job",
                plan.job_count,
                plan.worker_count
            );
        } else {
            log::info!(" Using {} parallel thread(s)", plan.worker_count);
        }

        if plan.is_sequential() {
            Self::run_sequential(&plan, task, &mut consume)
        } else {
            Self::run_parallel(&plan, task, &mut consume)
        }
    }

    fn run_sequential<T, F>(plan: &SchedulerPlan, task: &T, consume: &mut F) -> Result<()>
    where
        T: Task,
        F: FnMut(usize, T::Output) -> Result<()>,
    {
        let mut worker = task.start_worker()?;
        for index in 0..plan.num_tasks {
            let mut log = TaskLog::new();
            let outcome = catch_unwind(AssertUnwindSafe(|| task.run(&mut worker, index, &mut log)));
            log.replay();
            match outcome {
                Ok(result) => consume(index, result?)?,
                Err(payload) => {
                    return Err(Error::WorkerPanic {
                        chunk: index / plan.chunk_size,
                        message: panic_message(payload.as_ref()),
                    })
                }
            }
        }
        Ok(())
    }

    fn run_parallel<T, F>(plan: &SchedulerPlan, task: &T, consume: &mut F) -> Result<()>
    where
        T: Task,
        F: FnMut(usize, T::Output) -> Result<()>,
    {
        let num_chunks = plan.num_chunks();
        let threads = plan.thread_count().min(num_chunks);
        let cursor = AtomicUsize::new(0);
        let cancel = AtomicBool::new(false);
        let window = DeliveryWindow::new(plan.reorder_window());

        std::thread::scope(|scope| {
            let (tx, rx) = sync_channel::<ChunkResult<T::Output>>(threads * 2);
            for _ in 0..threads {
                let tx = tx.clone();
                let cursor = &cursor;
                let cancel = &cancel;
                let window = &window;
                scope.spawn(move || {
                    let mut worker: Option<T::Worker> = None;
                    loop {
                        if cancel.load(AtomicOrdering::SeqCst) {
                            break;
                        }
                        let chunk = cursor.fetch_add(1, AtomicOrdering::SeqCst);
                        if chunk >= num_chunks || !window.wait_for(chunk, cancel) {
                            break;
                        }
                        let mut log = TaskLog::new();
                        let outcome = catch_unwind(AssertUnwindSafe(|| {
                            run_chunk(plan, task, &mut worker, chunk, cancel, &mut log)
                        }));
                        let outcome = match outcome {
                            Ok(Some(result)) => result,
                            // Cancelled part way through the chunk
                            Ok(None) => break,
                            Err(payload) => Err(Error::WorkerPanic {
                                chunk,
                                message: panic_message(payload.as_ref()),
                            }),
                        };
                        let failed = outcome.is_err();
                        if failed {
                            window.cancel(cancel);
                        }
                        if tx.send(ChunkResult { chunk, outcome, log }).is_err() || failed {
                            break;
                        }
                    }
                });
            }
            drop(tx);

            let result = merge_in_order(&rx, num_chunks, plan, &window, consume);
            if result.is_err() {
                window.cancel(&cancel);
            }
            result
        })
    }
}

/// Runs one chunk. Returns `None` if cancellation was observed.
fn run_chunk<T: Task>(
    plan: &SchedulerPlan,
    task: &T,
    worker: &mut Option<T::Worker>,
    chunk: usize,
    cancel: &AtomicBool,
    log: &mut TaskLog,
) -> Option<Result<Vec<T::Output>>> {
    let state = match worker {
        Some(state) => state,
        None => match task.start_worker() {
            Ok(state) => worker.insert(state),
            Err(err) => return Some(Err(err)),
        },
    };
    let range = plan.chunk_range(chunk);
    let mut outputs = Vec::with_capacity(range.len());
    for index in range {
        if cancel.load(AtomicOrdering::SeqCst) {
            return None;
        }
        match task.run(state, index, log) {
            Ok(output) => outputs.push(output),
            Err(err) => return Some(Err(err)),
        }
    }
    Some(Ok(outputs))
}

fn merge_in_order<O, F>(
    rx: &Receiver<ChunkResult<O>>,
    num_chunks: usize,
    plan: &SchedulerPlan,
    window: &DeliveryWindow,
    consume: &mut F,
) -> Result<()>
where
    F: FnMut(usize, O) -> Result<()>,
{
    let mut heap = BinaryHeap::new();
    let mut next = 0;
    while next < num_chunks {
        while heap
            .peek()
            .is_some_and(|head: &ChunkResult<O>| head.chunk == next)
        {
            if let Some(result) = heap.pop() {
                deliver(result, plan, consume)?;
                next += 1;
                window.advance(next);
            }
        }
        if next == num_chunks {
            break;
        }
        match rx.recv() {
            Ok(result) => heap.push(result),
            Err(_) => break,
        }
    }
    if next == num_chunks {
        return Ok(());
    }

    // All workers stopped with chunks missing; report the earliest failure
    while let Some(mut result) = heap.pop() {
        result.log.replay();
        if let Err(err) = result.outcome {
            return Err(wrap_fault(result.chunk, err));
        }
    }
    Err(Error::Inconsistent(format!(
        "workers stopped after {next} of {num_chunks} chunks without reporting an error"
    )))
}

fn deliver<O, F>(mut result: ChunkResult<O>, plan: &SchedulerPlan, consume: &mut F) -> Result<()>
where
    F: FnMut(usize, O) -> Result<()>,
{
    result.log.replay();
    let outputs = result
        .outcome
        .map_err(|err| wrap_fault(result.chunk, err))?;
    for (index, output) in plan.chunk_range(result.chunk).zip(outputs) {
        consume(index, output)?;
    }
    Ok(())
}

fn wrap_fault(chunk: usize, err: Error) -> Error {
    match err {
        Error::WorkerPanic { .. } => err,
        other => Error::WorkerFault {
            chunk,
            source: Box::new(other),
        },
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
