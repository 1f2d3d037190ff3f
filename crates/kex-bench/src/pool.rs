use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::error::TimerFailure;
use crate::timer::{HandshakeTimer, SampleVector};

type Reply = (usize, Result<SampleVector, TimerFailure>);

/// One `time_once` call queued for a worker.
struct Job {
    index: usize,
    configuration: Arc<str>,
    samples: usize,
    cancelled: Arc<AtomicBool>,
    reply: Sender<Reply>,
}

/// Fixed set of worker threads that fan out timer invocations.
///
/// Each worker shells out to the timing program, so at most `size` timer
/// processes run at once. Jobs travel over a crossbeam channel; every
/// collection gets its own reply channel tagged with submission indices.
///
/// Dropping the pool closes the job queue and joins every worker.
pub struct MeasurementPool {
    job_tx: Option<Sender<Job>>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl MeasurementPool {
    pub fn new(size: usize, timer: Arc<HandshakeTimer>) -> std::io::Result<Self> {
        let (job_tx, job_rx) = unbounded::<Job>();
        let mut pool = Self {
            job_tx: Some(job_tx),
            handles: Vec::with_capacity(size),
        };

        for worker in 0..size {
            let jobs = job_rx.clone();
            let timer = timer.clone();
            // On error `pool` drops here, joining the workers already started.
            let handle = thread::Builder::new()
                .name(format!("kex-timer-{worker}"))
                .spawn(move || timer_worker(worker, jobs, timer))?;
            pool.handles.push(handle);
        }

        tracing::debug!(size, "timer pool started");
        Ok(pool)
    }

    /// Number of live worker threads; zero after [`shutdown`](Self::shutdown).
    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Runs `timer_count` identical timer invocations across the pool and
    /// concatenates their samples in submission order.
    ///
    /// Any failed task fails the whole collection. Tasks still queued when a
    /// failure is seen are skipped, and the call returns only once every
    /// dispatched task has replied. The failure reported is the real one with
    /// the lowest submission index.
    pub fn collect(
        &self,
        configuration: &str,
        timer_count: usize,
        samples_per_timer: usize,
    ) -> Result<SampleVector, TimerFailure> {
        let job_tx = self.job_tx.as_ref().ok_or(TimerFailure::PoolClosed)?;
        let (reply_tx, reply_rx) = unbounded::<Reply>();
        let cancelled = Arc::new(AtomicBool::new(false));
        let configuration: Arc<str> = Arc::from(configuration);

        let mut dispatched = 0;
        for index in 0..timer_count {
            let job = Job {
                index,
                configuration: configuration.clone(),
                samples: samples_per_timer,
                cancelled: cancelled.clone(),
                reply: reply_tx.clone(),
            };
            if job_tx.send(job).is_err() {
                cancelled.store(true, Ordering::Relaxed);
                break;
            }
            dispatched += 1;
        }
        drop(reply_tx);

        let outcome = gather(&reply_rx, &cancelled, dispatched, timer_count);
        if dispatched < timer_count && outcome.is_ok() {
            return Err(TimerFailure::PoolClosed);
        }
        outcome
    }

    /// Closes the job queue and joins all workers. Idempotent.
    pub fn shutdown(&mut self) {
        if self.job_tx.take().is_none() && self.handles.is_empty() {
            return;
        }
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::warn!("timer worker exited by panic");
            }
        }
        tracing::debug!("timer pool stopped");
    }
}

impl Drop for MeasurementPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn gather(
    replies: &Receiver<Reply>,
    cancelled: &AtomicBool,
    dispatched: usize,
    timer_count: usize,
) -> Result<SampleVector, TimerFailure> {
    let mut slots: Vec<Option<SampleVector>> = vec![None; timer_count];
    let mut failure: Option<(usize, TimerFailure)> = None;
    let mut received = 0;

    while received < dispatched {
        let Ok((index, result)) = replies.recv() else {
            break;
        };
        received += 1;
        match result {
            Ok(samples) => slots[index] = Some(samples),
            Err(TimerFailure::Cancelled) => {}
            Err(err) => {
                cancelled.store(true, Ordering::Relaxed);
                if failure.as_ref().map_or(true, |(first, _)| index < *first) {
                    failure = Some((index, err));
                }
            }
        }
    }

    if let Some((index, err)) = failure {
        tracing::error!(task = index, error = %err, "timer task failed");
        return Err(err);
    }
    if received < dispatched {
        return Err(TimerFailure::WorkerLost {
            missing: dispatched - received,
        });
    }

    Ok(slots.into_iter().flatten().flatten().collect())
}

fn timer_worker(worker: usize, jobs: Receiver<Job>, timer: Arc<HandshakeTimer>) {
    while let Ok(job) = jobs.recv() {
        let result = if job.cancelled.load(Ordering::Relaxed) {
            Err(TimerFailure::Cancelled)
        } else {
            panic::catch_unwind(AssertUnwindSafe(|| {
                timer.time_once(&job.configuration, job.samples)
            }))
            .unwrap_or(Err(TimerFailure::WorkerPanicked { worker }))
        };
        // The collector may have given up on a lost sibling; nothing to do.
        let _ = job.reply.send((job.index, result));
    }
}
