use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{channel, RecvTimeoutError},
        Arc,
    },
    time::Duration,
};

use anyhow::Context;
use itertools::Itertools;
use rayon::ThreadPoolBuilder;
use tracing::{debug, error, warn};

use crate::{partition::const_time_partition, progress::ProgressReporter, Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A shared flag that is set once to ask running workers to stop.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Something that advances its chains in batches.
///
/// A worker is only ever driven by one thread at a time.
pub trait Worker: Send {
    /// Number of chains advanced by one iteration, used to weight progress.
    fn weight(&self) -> u64;

    fn run_batch(&mut self, iterations: u64) -> anyhow::Result<()>;
}

/// Runs `iterations` updates on each of a set of workers, one thread per
/// worker, in batches of roughly constant duration.
pub struct ParallelUpdate<'a> {
    iterations: u64,
    period: Duration,
    threads: Option<usize>,
    interrupt: &'a CancelToken,
    progress: &'a dyn ProgressReporter,
}

impl<'a> ParallelUpdate<'a> {
    pub fn new(
        iterations: u64,
        period: Duration,
        interrupt: &'a CancelToken,
        progress: &'a dyn ProgressReporter,
    ) -> Self {
        Self {
            iterations,
            period,
            threads: None,
            interrupt,
            progress,
        }
    }

    /// Limit the number of worker threads. `None` uses one per worker.
    pub fn threads(mut self, threads: Option<usize>) -> Self {
        self.threads = threads;
        self
    }

    pub fn run<W: Worker>(&self, workers: &mut [W]) -> Result<()> {
        if workers.is_empty() || self.iterations == 0 {
            return Ok(());
        }
        let threads = self
            .threads
            .unwrap_or(workers.len())
            .clamp(1, workers.len());
        if threads == 1 {
            self.run_sequential(workers)
        } else {
            self.run_parallel(workers, threads)
        }
    }

    fn run_sequential<W: Worker>(&self, workers: &mut [W]) -> Result<()> {
        debug!(workers = workers.len(), "running updates on the calling thread");
        for (instance, worker) in workers.iter_mut().enumerate() {
            run_worker(worker, self.iterations, self.period, self.interrupt, self.progress)
                .map_err(|err| Error::Execution {
                    instance,
                    source: err.into(),
                })?;
            if self.interrupt.is_cancelled() {
                warn!(instance, "update interrupted");
                return Err(Error::Interrupted);
            }
        }
        Ok(())
    }

    fn run_parallel<W: Worker>(&self, workers: &mut [W], threads: usize) -> Result<()> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads + 1) // One more thread because the controller also uses one
            .thread_name(|i| format!("multichain-worker-{}", i))
            .build()
            .context("Could not start thread pool")?;

        let iterations = self.iterations;
        let period = self.period;
        let interrupt = self.interrupt;
        let progress = self.progress;
        let cancel = CancelToken::new();
        let (results_tx, results_rx) = channel();
        let jobs = workers.iter_mut().enumerate().collect_vec();
        let num_jobs = jobs.len();
        debug!(workers = num_jobs, threads, "starting parallel update");

        let (failure, interrupted) = pool.scope_fifo(move |scope| {
            for (instance, worker) in jobs {
                let results = results_tx.clone();
                let cancel = cancel.clone();
                scope.spawn_fifo(move |_| {
                    let result = run_worker(worker, iterations, period, &cancel, progress);
                    if result.is_err() {
                        cancel.cancel();
                    }
                    // The controller only hangs up after all workers are done
                    let _ = results.send((instance, result));
                });
            }
            drop(results_tx);

            let mut failure = None;
            let mut interrupted = false;
            let mut finished = 0;
            loop {
                if !interrupted && interrupt.is_cancelled() {
                    warn!("update interrupted, waiting for workers to finish their batch");
                    interrupted = true;
                    cancel.cancel();
                }
                match results_rx.recv_timeout(POLL_INTERVAL) {
                    Ok((instance, Ok(()))) => {
                        finished += 1;
                        debug!(instance, finished, total = num_jobs, "worker finished");
                    }
                    Ok((instance, Err(err))) => {
                        finished += 1;
                        error!(instance, "worker failed: {:#}", err);
                        cancel.cancel();
                        if failure.is_none() {
                            failure = Some(Error::Execution {
                                instance,
                                source: err.into(),
                            });
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            (failure, interrupted)
        });

        match failure {
            Some(err) => {
                if interrupted {
                    warn!("interrupt ignored because a worker failed");
                }
                Err(err)
            }
            None if interrupted => Err(Error::Interrupted),
            None => Ok(()),
        }
    }
}

fn run_worker<W: Worker + ?Sized>(
    worker: &mut W,
    iterations: u64,
    period: Duration,
    cancel: &CancelToken,
    progress: &dyn ProgressReporter,
) -> anyhow::Result<()> {
    for batch in const_time_partition(iterations, period) {
        if cancel.is_cancelled() {
            debug!("worker cancelled");
            break;
        }
        worker.run_batch(batch)?;
        progress.report(worker.weight() * batch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::AtomicU64,
        thread,
        time::{Duration, Instant},
    };

    use anyhow::bail;
    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Default)]
    struct Counter(AtomicU64);

    impl ProgressReporter for Counter {
        fn update(&self, iterations: u64, _force: bool) {
            self.0.fetch_add(iterations, Ordering::SeqCst);
        }
    }

    struct FakeWorker {
        chains: u64,
        done: u64,
        batches: usize,
        fail_at: Option<usize>,
        pause: Duration,
    }

    impl FakeWorker {
        fn new(chains: u64) -> Self {
            Self {
                chains,
                done: 0,
                batches: 0,
                fail_at: None,
                pause: Duration::ZERO,
            }
        }
    }

    impl Worker for FakeWorker {
        fn weight(&self) -> u64 {
            self.chains
        }

        fn run_batch(&mut self, iterations: u64) -> anyhow::Result<()> {
            if self.fail_at == Some(self.batches) {
                bail!("Engine exploded");
            }
            thread::sleep(self.pause);
            self.batches += 1;
            self.done += iterations;
            Ok(())
        }
    }

    #[test]
    fn every_worker_runs_all_iterations() -> Result<()> {
        let counter = Counter::default();
        let interrupt = CancelToken::new();
        let mut workers = vec![FakeWorker::new(2), FakeWorker::new(2), FakeWorker::new(1)];
        ParallelUpdate::new(500, Duration::from_millis(5), &interrupt, &counter).run(&mut workers)?;
        assert_eq!(workers.iter().map(|w| w.done).collect_vec(), vec![500, 500, 500]);
        assert_eq!(counter.0.load(Ordering::SeqCst), 5 * 500);
        Ok(())
    }

    #[test]
    fn single_thread_runs_in_order() -> Result<()> {
        let counter = Counter::default();
        let interrupt = CancelToken::new();
        let mut workers = vec![FakeWorker::new(3), FakeWorker::new(1)];
        ParallelUpdate::new(40, Duration::from_millis(5), &interrupt, &counter)
            .threads(Some(1))
            .run(&mut workers)?;
        assert_eq!(workers[0].done, 40);
        assert_eq!(workers[1].done, 40);
        assert_eq!(counter.0.load(Ordering::SeqCst), 160);
        Ok(())
    }

    #[test]
    fn first_failure_stops_the_others() {
        let counter = Counter::default();
        let interrupt = CancelToken::new();
        let total = 1_000_000_000;
        let mut workers = (0..3)
            .map(|_| FakeWorker {
                pause: Duration::from_millis(1),
                ..FakeWorker::new(1)
            })
            .collect_vec();
        workers[1].fail_at = Some(0);

        let result =
            ParallelUpdate::new(total, Duration::from_millis(5), &interrupt, &counter).run(&mut workers);
        assert!(matches!(result, Err(Error::Execution { instance: 1, .. })));
        assert!(workers.iter().all(|worker| worker.done < total));
    }

    #[test]
    fn failure_on_single_thread() {
        let counter = Counter::default();
        let interrupt = CancelToken::new();
        let mut workers = vec![FakeWorker::new(1), FakeWorker::new(1)];
        workers[1].fail_at = Some(2);
        let result = ParallelUpdate::new(100, Duration::from_millis(5), &interrupt, &counter)
            .threads(Some(1))
            .run(&mut workers);
        assert!(matches!(result, Err(Error::Execution { instance: 1, .. })));
        assert_eq!(workers[0].done, 100);
    }

    #[test]
    fn interrupt_drains_workers() {
        let counter = Counter::default();
        let interrupt = CancelToken::new();
        let total = 1_000_000_000;
        let mut workers = (0..2)
            .map(|_| FakeWorker {
                pause: Duration::from_millis(2),
                ..FakeWorker::new(1)
            })
            .collect_vec();

        let start = Instant::now();
        let result = thread::scope(|scope| {
            let handle = interrupt.clone();
            scope.spawn(move || {
                thread::sleep(Duration::from_millis(30));
                handle.cancel();
            });
            ParallelUpdate::new(total, Duration::from_millis(5), &interrupt, &counter)
                .run(&mut workers)
        });
        assert!(matches!(result, Err(Error::Interrupted)));
        assert!(start.elapsed() < Duration::from_secs(30));
        assert!(workers.iter().all(|worker| worker.done < total));
    }

    #[test]
    fn interrupt_before_start() {
        let counter = Counter::default();
        let interrupt = CancelToken::new();
        interrupt.cancel();
        let mut workers = vec![FakeWorker::new(1)];
        let result =
            ParallelUpdate::new(10, Duration::from_millis(5), &interrupt, &counter).run(&mut workers);
        assert!(matches!(result, Err(Error::Interrupted)));
        assert_eq!(workers[0].done, 0);
    }

    #[test]
    fn token_can_be_reset() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
        token.reset();
        assert!(!clone.is_cancelled());
    }
}
