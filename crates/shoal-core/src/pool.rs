//! Bounded FIFO worker pool.
//!
//! A pool owns one bounded mpsc queue and N worker tasks that drain it
//! in arrival order. The bounded queue is the flow-control valve: when
//! the pool is saturated, `schedule().await` blocks the producer
//! instead of quietly growing an unbounded backlog.
//!
//! Queue and execution behavior is observable through the pool's
//! [`PoolMatrix`]: enqueue count, executed count, and the accumulated
//! queue/execute times in microseconds.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::Error;
use crate::matrix::PoolMatrix;

/// Queue capacity. Deep enough to absorb bursts, shallow enough that
/// backpressure reaches producers before memory does.
const QUEUE_CAP: usize = 4096;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct Queued {
    job: Job,
    enqueued_at: Instant,
}

/// A named worker pool with a shared FIFO queue.
pub struct WorkerPool {
    name: String,
    matrix: Arc<PoolMatrix>,
    tx: Mutex<Option<mpsc::Sender<Queued>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Creates the pool without starting any workers.
    pub fn new(name: &str, matrix: Arc<PoolMatrix>) -> Self {
        Self {
            name: name.to_string(),
            matrix,
            tx: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Starts `size` worker tasks draining the queue.
    pub fn startup(&self, size: usize) -> Result<(), Error> {
        if size == 0 {
            return Err(Error::Internal(format!(
                "worker pool {} needs at least one worker",
                self.name
            )));
        }
        let (tx, rx) = mpsc::channel::<Queued>(QUEUE_CAP);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut workers = self.workers.lock().expect("pool lock");
        for _ in 0..size {
            let rx = Arc::clone(&rx);
            let matrix = Arc::clone(&self.matrix);
            workers.push(tokio::spawn(async move {
                loop {
                    // hold the receiver lock only while waiting; run
                    // the job with it released so siblings can pick up
                    // the next item
                    let queued = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(queued) = queued else { break };

                    let waited = queued.enqueued_at.elapsed();
                    matrix
                        .queue_time
                        .fetch_add(waited.as_micros() as u64, std::sync::atomic::Ordering::Relaxed);

                    let started = Instant::now();
                    queued.job.await;
                    matrix
                        .execute_time
                        .fetch_add(
                            started.elapsed().as_micros() as u64,
                            std::sync::atomic::Ordering::Relaxed,
                        );
                    matrix
                        .executed
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
            }));
        }
        *self.tx.lock().expect("pool lock") = Some(tx);
        debug!(pool = %self.name, size, "worker pool started");
        Ok(())
    }

    /// Enqueues a job, awaiting queue space when the pool is saturated.
    ///
    /// Returns `Busy` once the pool has stopped.
    pub async fn schedule<F>(&self, job: F) -> Result<(), Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let tx = {
            let guard = self.tx.lock().expect("pool lock");
            guard.clone()
        };
        let Some(tx) = tx else {
            return Err(Error::Busy(format!("worker pool {} stopped", self.name)));
        };

        self.matrix
            .in_queue
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        tx.send(Queued {
            job: Box::pin(job),
            enqueued_at: Instant::now(),
        })
        .await
        .map_err(|_| Error::Busy(format!("worker pool {} stopped", self.name)))
    }

    /// Closes the queue and joins the workers. Jobs already queued run
    /// to completion first.
    pub async fn stop(&self) {
        self.tx.lock().expect("pool lock").take();
        let workers = {
            let mut guard = self.workers.lock().expect("pool lock");
            std::mem::take(&mut *guard)
        };
        for worker in workers {
            let _ = worker.await;
        }
        debug!(pool = %self.name, "worker pool stopped");
    }

    /// The pool's matrix, shared with the monitor.
    pub fn matrix(&self) -> &Arc<PoolMatrix> {
        &self.matrix
    }
}
