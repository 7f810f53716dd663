use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, trace, warn};
use tokio::sync::mpsc;

/// Work done for one vehicle at a time
#[async_trait]
pub trait VehicleWorker: Send + Sync + 'static {
    type Job: Send + 'static;

    async fn run(&self, job: Self::Job);
}

struct Mailbox<J> {
    tx: mpsc::UnboundedSender<J>,
    /// Jobs queued or running; a worker at zero is idle
    backlog: Arc<AtomicUsize>,
    last_used: Instant,
}

/// Routes jobs to one task per vehicle.
///
/// Each vehicle gets a task draining its own mailbox, so its jobs run one at
/// a time in arrival order while other vehicles proceed in parallel.
/// [`dispatch`](Self::dispatch) never waits: a vehicle stuck behind a slow
/// job only grows its own backlog, which is logged once it passes
/// `backlog_warning`.
pub struct VehicleDispatcher<W: VehicleWorker> {
    worker: Arc<W>,
    mailboxes: DashMap<String, Mailbox<W::Job>>,
    backlog_warning: usize,
    backlogged: AtomicUsize,
}

impl<W: VehicleWorker> VehicleDispatcher<W> {
    pub fn new(worker: Arc<W>, backlog_warning: usize) -> Self {
        Self {
            worker,
            mailboxes: DashMap::new(),
            backlog_warning: backlog_warning.max(1),
            backlogged: AtomicUsize::new(0),
        }
    }

    pub fn dispatch(&self, vehicle_id: &str, job: W::Job) {
        let Err(job) = self.enqueue(vehicle_id, job) else {
            return;
        };

        // The vehicle's task is gone (it panicked); start a fresh one.
        warn!("Worker for vehicle {} stopped, restarting", vehicle_id);
        self.mailboxes.remove(vehicle_id);
        if self.enqueue(vehicle_id, job).is_err() {
            warn!("Dropping job for vehicle {}: worker unavailable", vehicle_id);
        }
    }

    /// Vehicles that currently own a worker task
    pub fn active_vehicles(&self) -> usize {
        self.mailboxes.len()
    }

    /// Jobs queued or running for a vehicle
    pub fn backlog(&self, vehicle_id: &str) -> usize {
        self.mailboxes
            .get(vehicle_id)
            .map(|mailbox| mailbox.backlog.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Jobs that were queued behind a backlog over the warning threshold
    pub fn backlogged_jobs(&self) -> usize {
        self.backlogged.load(Ordering::Relaxed)
    }

    /// Stop the tasks of vehicles with no queued or running job and no new
    /// job for longer than `max_idle`. Returns how many workers were
    /// released.
    pub fn reap_idle(&self, max_idle: Duration) -> usize {
        let before = self.mailboxes.len();
        self.mailboxes.retain(|vehicle_id, mailbox| {
            let keep = mailbox.backlog.load(Ordering::Acquire) > 0
                || mailbox.last_used.elapsed() <= max_idle;
            if !keep {
                trace!("Releasing idle worker for vehicle {}", vehicle_id);
            }
            keep
        });
        let released = before.saturating_sub(self.mailboxes.len());
        if released > 0 {
            debug!("Released {} idle vehicle worker(s)", released);
        }
        released
    }

    fn enqueue(&self, vehicle_id: &str, job: W::Job) -> Result<(), W::Job> {
        let (tx, backlog) = self.mailbox(vehicle_id);
        // counted before sending so the worker's decrement always follows
        let queued = backlog.fetch_add(1, Ordering::AcqRel) + 1;
        if let Err(mpsc::error::SendError(job)) = tx.send(job) {
            backlog.fetch_sub(1, Ordering::AcqRel);
            return Err(job);
        }

        if queued > self.backlog_warning {
            self.backlogged.fetch_add(1, Ordering::Relaxed);
            if queued == self.backlog_warning + 1 {
                warn!(
                    "Vehicle {} has more than {} queued job(s)",
                    vehicle_id, self.backlog_warning
                );
            }
        }
        Ok(())
    }

    fn mailbox(&self, vehicle_id: &str) -> (mpsc::UnboundedSender<W::Job>, Arc<AtomicUsize>) {
        let mut mailbox = self
            .mailboxes
            .entry(vehicle_id.to_string())
            .or_insert_with(|| self.spawn_worker(vehicle_id));
        mailbox.last_used = Instant::now();
        (mailbox.tx.clone(), Arc::clone(&mailbox.backlog))
    }

    fn spawn_worker(&self, vehicle_id: &str) -> Mailbox<W::Job> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let backlog = Arc::new(AtomicUsize::new(0));
        let worker = Arc::clone(&self.worker);
        let pending = Arc::clone(&backlog);
        let vehicle_id = vehicle_id.to_string();

        tokio::spawn(async move {
            trace!("Worker for vehicle {} started", vehicle_id);
            while let Some(job) = rx.recv().await {
                worker.run(job).await;
                pending.fetch_sub(1, Ordering::AcqRel);
            }
            trace!("Worker for vehicle {} finished", vehicle_id);
        });

        Mailbox {
            tx,
            backlog,
            last_used: Instant::now(),
        }
    }
}
