/// Background job scheduler
///
/// A small thread-pool-backed unit-of-work queue. Slow work (pyramid
/// generation, decodes, source rescans) is wrapped in a [`Job`] and submitted
/// here so nothing blocks the foreground thread. Each job finishes or fails
/// exactly once; the outcome is logged with the job's title.

use parking_lot::Mutex;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::error::Result;

/// A unit of background work.
pub trait Job: Send {
    /// Short human-readable description, used in logs.
    fn title(&self) -> String;

    /// Run to completion. `Ok` marks the job finished, `Err` failed.
    fn run(&mut self) -> Result<()>;
}

enum Command {
    Run(Box<dyn Job>),
    Shutdown,
}

/// Thread-pool job queue with FIFO dispatch.
pub struct BackgroundScheduler {
    tx: Sender<Command>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundScheduler {
    /// Spawn a scheduler with the given number of worker threads.
    pub fn new(workers: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<Command>();
        let rx = Arc::new(Mutex::new(rx));

        let handles = (0..workers.max(1))
            .map(|i| {
                let rx = Arc::clone(&rx);
                std::thread::Builder::new()
                    .name(format!("photo-cache-worker-{}", i))
                    .spawn(move || worker_loop(rx))
                    .expect("failed to spawn scheduler worker")
            })
            .collect();

        Arc::new(BackgroundScheduler {
            tx,
            workers: Mutex::new(handles),
        })
    }

    /// Queue a job. Returns immediately.
    pub fn submit(&self, job: Box<dyn Job>) {
        // Send only fails after shutdown; late submissions are dropped.
        let _ = self.tx.send(Command::Run(job));
    }
}

fn worker_loop(rx: Arc<Mutex<Receiver<Command>>>) {
    loop {
        let command = {
            let guard = rx.lock();
            guard.recv()
        };
        match command {
            Ok(Command::Run(mut job)) => {
                let title = job.title();
                tracing::debug!(job = %title, "job started");
                match job.run() {
                    Ok(()) => tracing::debug!(job = %title, "job finished"),
                    Err(err) => tracing::warn!(job = %title, %err, "job failed"),
                }
            }
            Ok(Command::Shutdown) | Err(_) => break,
        }
    }
}

impl Drop for BackgroundScheduler {
    fn drop(&mut self) {
        let mut workers = self.workers.lock();
        for _ in workers.iter() {
            let _ = self.tx.send(Command::Shutdown);
        }
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for BackgroundScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundScheduler").finish()
    }
}
