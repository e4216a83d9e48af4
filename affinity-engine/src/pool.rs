// ---------------------------------------------------------------------------
// Bounded worker pool
// ---------------------------------------------------------------------------
//
// A fixed set of core workers drains a bounded job queue. When the queue
// backs up, elastic workers are added up to `max` and retire again after
// `keep_alive` without work. A job that finds the queue full runs on the
// submitting task instead of being dropped. Shutdown closes the queue,
// waits up to `shutdown_wait` for in-flight work, then aborts the rest.
// ---------------------------------------------------------------------------

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::error::AffinityError;

type Job = BoxFuture<'static, ()>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
	pub name: String,
	pub core: usize,
	pub max: usize,
	pub queue: usize,
	pub keep_alive_secs: u64,
	pub shutdown_wait_secs: u64,
}

impl PoolConfig {
	/// Pool for cache cleanup and Top-K refreshes.
	pub fn general() -> Self {
		Self {
			name: "general".into(),
			core: 4,
			max: 8,
			queue: 100,
			keep_alive_secs: 60,
			shutdown_wait_secs: 60,
		}
	}

	/// Pool for full similarity recomputes.
	pub fn similarity() -> Self {
		Self {
			name: "similarity".into(),
			core: 2,
			max: 4,
			queue: 50,
			keep_alive_secs: 300,
			shutdown_wait_secs: 120,
		}
	}

	fn validate(&self) -> Result<(), AffinityError> {
		if self.core == 0 || self.queue == 0 || self.max < self.core {
			return Err(AffinityError::Config(format!(
				"pool {}: need core >= 1, queue >= 1, max >= core (core={}, max={}, queue={})",
				self.name, self.core, self.max, self.queue
			)));
		}
		Ok(())
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
	pub name: String,
	pub live_workers: usize,
	pub busy_workers: usize,
	pub queued: usize,
	pub completed: u64,
	pub caller_runs: u64,
}

// ---------------------------------------------------------------------------
// WorkerPool
// ---------------------------------------------------------------------------

struct Shared {
	name: String,
	rx: AsyncMutex<mpsc::Receiver<Job>>,
	live: AtomicUsize,
	busy: AtomicUsize,
	completed: AtomicU64,
	caller_runs: AtomicU64,
}

pub struct WorkerPool {
	config: PoolConfig,
	tx: Mutex<Option<mpsc::Sender<Job>>>,
	shared: Arc<Shared>,
	handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
	/// Start the core workers. Must be called from inside a Tokio runtime.
	pub fn new(config: PoolConfig) -> Result<Self, AffinityError> {
		config.validate()?;
		let (tx, rx) = mpsc::channel(config.queue);
		let shared = Arc::new(Shared {
			name: config.name.clone(),
			rx: AsyncMutex::new(rx),
			live: AtomicUsize::new(0),
			busy: AtomicUsize::new(0),
			completed: AtomicU64::new(0),
			caller_runs: AtomicU64::new(0),
		});
		let pool = Self {
			config,
			tx: Mutex::new(Some(tx)),
			shared,
			handles: Mutex::new(Vec::new()),
		};
		for _ in 0..pool.config.core {
			pool.spawn_worker(None);
		}
		tracing::debug!(pool = %pool.config.name, core = pool.config.core, max = pool.config.max, "Worker pool started");
		Ok(pool)
	}

	pub fn name(&self) -> &str {
		&self.config.name
	}

	fn spawn_worker(&self, idle_timeout: Option<Duration>) {
		self.shared.live.fetch_add(1, Ordering::SeqCst);
		let handle = tokio::spawn(worker_loop(self.shared.clone(), idle_timeout));
		let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
		handles.retain(|h| !h.is_finished());
		handles.push(handle);
	}

	fn sender(&self) -> Result<mpsc::Sender<Job>, AffinityError> {
		self.tx
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.clone()
			.ok_or_else(|| AffinityError::PoolShutdown(self.config.name.clone()))
	}

	/// Add an elastic worker when jobs are waiting and the pool is below max.
	fn maybe_grow(&self, tx: &mpsc::Sender<Job>) {
		let queued = self.config.queue.saturating_sub(tx.capacity());
		if queued == 0 {
			return;
		}
		let live = self.shared.live.load(Ordering::SeqCst);
		if live >= self.config.max || self.shared.busy.load(Ordering::SeqCst) < live {
			return;
		}
		tracing::debug!(pool = %self.config.name, live, queued, "Adding elastic worker");
		self.spawn_worker(Some(Duration::from_secs(self.config.keep_alive_secs)));
	}

	/// Queue a job. If the queue is full the job runs to completion on the
	/// calling task before this returns.
	pub async fn submit<F>(&self, job: F) -> Result<(), AffinityError>
	where
		F: Future<Output = ()> + Send + 'static,
	{
		let tx = self.sender()?;
		match tx.try_send(job.boxed()) {
			Ok(()) => {
				self.maybe_grow(&tx);
				Ok(())
			}
			Err(TrySendError::Full(job)) => {
				self.shared.caller_runs.fetch_add(1, Ordering::Relaxed);
				tracing::warn!(pool = %self.config.name, "Queue full, running job on caller");
				drop(tx);
				run_job(&self.shared.name, job).await;
				Ok(())
			}
			Err(TrySendError::Closed(_)) => Err(AffinityError::PoolShutdown(self.config.name.clone())),
		}
	}

	pub fn stats(&self) -> PoolStats {
		let queued = self
			.tx
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.as_ref()
			.map(|tx| self.config.queue.saturating_sub(tx.capacity()))
			.unwrap_or(0);
		PoolStats {
			name: self.config.name.clone(),
			live_workers: self.shared.live.load(Ordering::SeqCst),
			busy_workers: self.shared.busy.load(Ordering::SeqCst),
			queued,
			completed: self.shared.completed.load(Ordering::Relaxed),
			caller_runs: self.shared.caller_runs.load(Ordering::Relaxed),
		}
	}

	/// Stop accepting jobs and drain. Returns `true` when every worker
	/// finished inside the wait, `false` when stragglers were aborted.
	pub async fn shutdown(&self) -> bool {
		let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
		if tx.is_none() {
			return true;
		}
		drop(tx);

		let handles: Vec<JoinHandle<()>> =
			std::mem::take(&mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner));
		let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
		let wait = Duration::from_secs(self.config.shutdown_wait_secs);

		match tokio::time::timeout(wait, join_all(handles)).await {
			Ok(_) => {
				tracing::info!(pool = %self.config.name, "Worker pool drained");
				true
			}
			Err(_) => {
				for abort in aborts {
					abort.abort();
				}
				tracing::warn!(
					pool = %self.config.name,
					wait_secs = self.config.shutdown_wait_secs,
					"Worker pool did not drain in time, aborting"
				);
				false
			}
		}
	}
}

async fn run_job(pool: &str, job: Job) {
	if AssertUnwindSafe(job).catch_unwind().await.is_err() {
		tracing::error!(pool, "Job panicked");
	}
}

async fn worker_loop(shared: Arc<Shared>, idle_timeout: Option<Duration>) {
	loop {
		let next = async {
			let mut rx = shared.rx.lock().await;
			rx.recv().await
		};
		let job = match idle_timeout {
			None => next.await,
			Some(idle) => match tokio::time::timeout(idle, next).await {
				Ok(job) => job,
				Err(_) => {
					tracing::debug!(pool = %shared.name, "Elastic worker retiring");
					break;
				}
			},
		};
		let Some(job) = job else {
			break;
		};
		shared.busy.fetch_add(1, Ordering::SeqCst);
		run_job(&shared.name, job).await;
		shared.busy.fetch_sub(1, Ordering::SeqCst);
		shared.completed.fetch_add(1, Ordering::Relaxed);
	}
	shared.live.fetch_sub(1, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::AtomicBool;
	use tokio::sync::{oneshot, Notify};

	fn small(core: usize, max: usize, queue: usize) -> PoolConfig {
		PoolConfig {
			name: "test".into(),
			core,
			max,
			queue,
			keep_alive_secs: 1,
			shutdown_wait_secs: 5,
		}
	}

	#[tokio::test]
	async fn runs_submitted_jobs() {
		let pool = WorkerPool::new(small(2, 2, 16)).unwrap();
		let count = Arc::new(AtomicUsize::new(0));
		for _ in 0..10 {
			let count = count.clone();
			pool.submit(async move {
				count.fetch_add(1, Ordering::SeqCst);
			})
			.await
			.unwrap();
		}
		assert!(pool.shutdown().await);
		assert_eq!(count.load(Ordering::SeqCst), 10);
		assert_eq!(pool.stats().completed + pool.stats().caller_runs, 10);
	}

	#[tokio::test]
	async fn full_queue_runs_on_caller() {
		let pool = WorkerPool::new(small(1, 1, 1)).unwrap();
		let gate = Arc::new(Notify::new());
		let (started_tx, started_rx) = oneshot::channel();

		let g = gate.clone();
		pool.submit(async move {
			let _ = started_tx.send(());
			g.notified().await;
		})
		.await
		.unwrap();
		started_rx.await.unwrap();

		// Fills the single queue slot.
		pool.submit(async {}).await.unwrap();

		let ran_inline = Arc::new(AtomicBool::new(false));
		let flag = ran_inline.clone();
		pool.submit(async move {
			flag.store(true, Ordering::SeqCst);
		})
		.await
		.unwrap();
		assert!(ran_inline.load(Ordering::SeqCst));
		assert_eq!(pool.stats().caller_runs, 1);

		gate.notify_one();
		assert!(pool.shutdown().await);
	}

	#[tokio::test]
	async fn elastic_workers_grow_and_retire() {
		let pool = WorkerPool::new(small(1, 3, 10)).unwrap();
		let gate = Arc::new(Notify::new());
		let (started_tx, started_rx) = oneshot::channel();
		let g = gate.clone();
		pool.submit(async move {
			let _ = started_tx.send(());
			g.notified().await;
		})
		.await
		.unwrap();
		started_rx.await.unwrap();

		pool.submit(async {}).await.unwrap();
		assert!(pool.stats().live_workers >= 2);

		gate.notify_one();
		tokio::time::sleep(Duration::from_millis(1_500)).await;
		assert_eq!(pool.stats().live_workers, 1);
		assert!(pool.shutdown().await);
	}

	#[tokio::test]
	async fn submit_after_shutdown_fails() {
		let pool = WorkerPool::new(small(1, 1, 4)).unwrap();
		assert!(pool.shutdown().await);
		let err = pool.submit(async {}).await.unwrap_err();
		assert!(matches!(err, AffinityError::PoolShutdown(_)));
	}

	#[tokio::test]
	async fn stuck_jobs_are_aborted() {
		let mut config = small(1, 1, 4);
		config.shutdown_wait_secs = 0;
		let pool = WorkerPool::new(config).unwrap();
		pool.submit(futures::future::pending::<()>()).await.unwrap();
		tokio::task::yield_now().await;
		assert!(!pool.shutdown().await);
	}

	#[tokio::test]
	async fn panicking_job_does_not_kill_worker() {
		let pool = WorkerPool::new(small(1, 1, 4)).unwrap();
		pool.submit(async { panic!("boom") }).await.unwrap();
		let done = Arc::new(AtomicBool::new(false));
		let flag = done.clone();
		pool.submit(async move {
			flag.store(true, Ordering::SeqCst);
		})
		.await
		.unwrap();
		assert!(pool.shutdown().await);
		assert!(done.load(Ordering::SeqCst));
		assert_eq!(pool.stats().completed, 2);
	}

	#[test]
	fn rejects_bad_config() {
		assert!(PoolConfig::general().validate().is_ok());
		assert!(small(0, 1, 1).validate().is_err());
		assert!(small(2, 1, 1).validate().is_err());
	}
}
