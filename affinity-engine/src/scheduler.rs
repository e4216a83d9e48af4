// ---------------------------------------------------------------------------
// Background scheduler
// ---------------------------------------------------------------------------
//
// Owns the two worker pools and the periodic tickers. Every job goes through
// `trigger`, which coalesces: a trigger for a job that is already running
// marks one re-run instead of starting a second copy. Jobs that finish
// partially (an upstream stayed down) are re-triggered after a delay.
// ---------------------------------------------------------------------------

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::AffinityError;
use crate::locks::KeyedMutex;
use crate::pool::{PoolConfig, PoolStats, WorkerPool};
use crate::types::{JobReport, RecomputeTarget};

/// The work a scheduler can dispatch.
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
	async fn recompute(&self, target: RecomputeTarget) -> JobReport;
	async fn refresh_topk(&self) -> JobReport;
	async fn cleanup(&self) -> JobReport;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Job {
	Recompute(RecomputeTarget),
	RefreshTopK,
	Cleanup,
}

impl fmt::Display for Job {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Recompute(target) => write!(f, "recompute:{}", target),
			Self::RefreshTopK => write!(f, "refresh-topk"),
			Self::Cleanup => write!(f, "cleanup"),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TriggerOutcome {
	Started,
	/// The job was already running; one re-run is queued behind it.
	Coalesced,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerConfig {
	/// Start the periodic tickers. Manual triggers work either way.
	pub enabled: bool,
	pub full_recompute_secs: u64,
	pub topk_refresh_secs: u64,
	pub cleanup_secs: u64,
	pub partial_retry_secs: u64,
}

impl Default for SchedulerConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			full_recompute_secs: 4 * 60 * 60,
			topk_refresh_secs: 30 * 60,
			cleanup_secs: 24 * 60 * 60,
			partial_retry_secs: 60,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
	pub enabled: bool,
	pub running: Vec<String>,
	pub pending_reruns: usize,
	pub triggered: u64,
	pub coalesced: u64,
	pub general: PoolStats,
	pub similarity: PoolStats,
	pub last_reports: BTreeMap<String, JobReport>,
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct Slot {
	rerun: bool,
}

struct Inner {
	config: SchedulerConfig,
	runner: Arc<dyn JobRunner>,
	general: WorkerPool,
	similarity: WorkerPool,
	slots: Mutex<HashMap<Job, Slot>>,
	locks: KeyedMutex<Job>,
	last: Mutex<BTreeMap<String, JobReport>>,
	triggered: AtomicU64,
	coalesced: AtomicU64,
	cancel: CancellationToken,
}

impl Inner {
	fn pool_for(&self, job: Job) -> &WorkerPool {
		match job {
			Job::Recompute(_) => &self.similarity,
			Job::RefreshTopK | Job::Cleanup => &self.general,
		}
	}

	/// Run one job under its lock, so a pool run and an inline run of the
	/// same job never overlap.
	async fn execute(&self, job: Job) -> JobReport {
		let _guard = self.locks.lock(&job).await;
		let run_id = Uuid::new_v4();
		tracing::info!(job = %job, %run_id, "Job started");
		let run = async {
			match job {
				Job::Recompute(target) => self.runner.recompute(target).await,
				Job::RefreshTopK => self.runner.refresh_topk().await,
				Job::Cleanup => self.runner.cleanup().await,
			}
		};
		// A panic counts as a failed run; the slot is released either way.
		let report = match AssertUnwindSafe(run).catch_unwind().await {
			Ok(report) => report,
			Err(_) => {
				tracing::error!(job = %job, %run_id, "Job panicked");
				JobReport {
					failed: 1,
					..JobReport::default()
				}
			}
		};
		tracing::info!(
			job = %job,
			%run_id,
			processed = report.processed,
			skipped = report.skipped,
			failed = report.failed,
			partial = report.partial,
			elapsed_ms = report.elapsed_ms,
			"Job finished"
		);
		self.last
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.insert(job.to_string(), report.clone());
		report
	}
}

async fn trigger(inner: &Arc<Inner>, job: Job) -> Result<TriggerOutcome, AffinityError> {
	{
		let mut slots = inner.slots.lock().unwrap_or_else(PoisonError::into_inner);
		if let Some(slot) = slots.get_mut(&job) {
			slot.rerun = true;
			inner.coalesced.fetch_add(1, Ordering::Relaxed);
			tracing::debug!(job = %job, "Already running, coalescing trigger");
			return Ok(TriggerOutcome::Coalesced);
		}
		slots.insert(job, Slot { rerun: false });
	}
	inner.triggered.fetch_add(1, Ordering::Relaxed);

	let result = inner
		.pool_for(job)
		.submit(run_coalesced(inner.clone(), job))
		.await;
	if let Err(e) = result {
		inner
			.slots
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.remove(&job);
		return Err(e);
	}
	Ok(TriggerOutcome::Started)
}

async fn run_coalesced(inner: Arc<Inner>, job: Job) {
	loop {
		let report = inner.execute(job).await;
		let again = {
			let mut slots = inner.slots.lock().unwrap_or_else(PoisonError::into_inner);
			match slots.get_mut(&job) {
				Some(slot) if slot.rerun => {
					slot.rerun = false;
					true
				}
				_ => {
					slots.remove(&job);
					false
				}
			}
		};
		if again {
			continue;
		}
		if report.partial {
			schedule_retry(inner.clone(), job);
		}
		break;
	}
}

fn schedule_retry(inner: Arc<Inner>, job: Job) {
	let delay = Duration::from_secs(inner.config.partial_retry_secs);
	tracing::warn!(job = %job, delay_secs = delay.as_secs(), "Job finished partially, retrying later");
	tokio::spawn(async move {
		tokio::select! {
			_ = inner.cancel.cancelled() => {}
			_ = tokio::time::sleep(delay) => {
				if let Err(e) = trigger(&inner, job).await {
					tracing::debug!(job = %job, error = %e, "Retry trigger dropped");
				}
			}
		}
	});
}

fn spawn_ticker(inner: &Arc<Inner>, job: Job, every_secs: u64) -> Option<JoinHandle<()>> {
	if every_secs == 0 {
		return None;
	}
	let inner = inner.clone();
	Some(tokio::spawn(async move {
		let period = Duration::from_secs(every_secs);
		let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
		loop {
			tokio::select! {
				_ = inner.cancel.cancelled() => break,
				_ = ticker.tick() => {
					if let Err(e) = trigger(&inner, job).await {
						tracing::warn!(job = %job, error = %e, "Scheduled trigger failed");
					}
				}
			}
		}
	}))
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
	inner: Arc<Inner>,
	tickers: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
	/// Start the pools and, when enabled, the periodic tickers. Must be
	/// called from inside a Tokio runtime.
	pub fn start(
		config: SchedulerConfig,
		general: PoolConfig,
		similarity: PoolConfig,
		runner: Arc<dyn JobRunner>,
	) -> Result<Self, AffinityError> {
		let inner = Arc::new(Inner {
			general: WorkerPool::new(general)?,
			similarity: WorkerPool::new(similarity)?,
			config,
			runner,
			slots: Mutex::new(HashMap::new()),
			locks: KeyedMutex::new(),
			last: Mutex::new(BTreeMap::new()),
			triggered: AtomicU64::new(0),
			coalesced: AtomicU64::new(0),
			cancel: CancellationToken::new(),
		});

		let mut tickers = Vec::new();
		if inner.config.enabled {
			let schedule = [
				(Job::Recompute(RecomputeTarget::All), inner.config.full_recompute_secs),
				(Job::RefreshTopK, inner.config.topk_refresh_secs),
				(Job::Cleanup, inner.config.cleanup_secs),
			];
			for (job, every) in schedule {
				if let Some(handle) = spawn_ticker(&inner, job, every) {
					tracing::info!(job = %job, every_secs = every, "Scheduled");
					tickers.push(handle);
				}
			}
		}

		Ok(Self {
			inner,
			tickers: Mutex::new(tickers),
		})
	}

	/// Queue a job on its pool. Returns immediately unless the pool is
	/// saturated, in which case the job runs on the caller.
	pub async fn trigger(&self, job: Job) -> Result<TriggerOutcome, AffinityError> {
		if self.inner.cancel.is_cancelled() {
			return Err(AffinityError::PoolShutdown("scheduler".into()));
		}
		trigger(&self.inner, job).await
	}

	/// Run a job on the calling task and return its report.
	pub async fn run_now(&self, job: Job) -> Result<JobReport, AffinityError> {
		if self.inner.cancel.is_cancelled() {
			return Err(AffinityError::PoolShutdown("scheduler".into()));
		}
		Ok(self.inner.execute(job).await)
	}

	pub fn status(&self) -> SchedulerStatus {
		let (running, pending_reruns) = {
			let slots = self.inner.slots.lock().unwrap_or_else(PoisonError::into_inner);
			let mut running: Vec<String> = slots.keys().map(|j| j.to_string()).collect();
			running.sort();
			(running, slots.values().filter(|s| s.rerun).count())
		};
		SchedulerStatus {
			enabled: self.inner.config.enabled,
			running,
			pending_reruns,
			triggered: self.inner.triggered.load(Ordering::Relaxed),
			coalesced: self.inner.coalesced.load(Ordering::Relaxed),
			general: self.inner.general.stats(),
			similarity: self.inner.similarity.stats(),
			last_reports: self
				.inner
				.last
				.lock()
				.unwrap_or_else(PoisonError::into_inner)
				.clone(),
		}
	}

	/// Stop the tickers and drain both pools.
	pub async fn shutdown(&self) {
		self.inner.cancel.cancel();
		let tickers: Vec<JoinHandle<()>> =
			std::mem::take(&mut *self.tickers.lock().unwrap_or_else(PoisonError::into_inner));
		for t in tickers {
			t.abort();
		}
		let (general, similarity) =
			tokio::join!(self.inner.general.shutdown(), self.inner.similarity.shutdown());
		tracing::info!(general_drained = general, similarity_drained = similarity, "Scheduler stopped");
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicBool, AtomicUsize};
	use tokio::sync::Semaphore;

	struct FakeRunner {
		recomputes: AtomicUsize,
		refreshes: AtomicUsize,
		cleanups: AtomicUsize,
		gate: Semaphore,
		partial_once: AtomicBool,
		panic_once: AtomicBool,
	}

	impl FakeRunner {
		fn new(open: bool) -> Arc<Self> {
			Arc::new(Self {
				recomputes: AtomicUsize::new(0),
				refreshes: AtomicUsize::new(0),
				cleanups: AtomicUsize::new(0),
				gate: Semaphore::new(if open { Semaphore::MAX_PERMITS } else { 0 }),
				partial_once: AtomicBool::new(false),
				panic_once: AtomicBool::new(false),
			})
		}
	}

	#[async_trait]
	impl JobRunner for FakeRunner {
		async fn recompute(&self, _target: RecomputeTarget) -> JobReport {
			self.recomputes.fetch_add(1, Ordering::SeqCst);
			if self.panic_once.swap(false, Ordering::SeqCst) {
				panic!("recompute blew up");
			}
			if let Ok(permit) = self.gate.acquire().await {
				permit.forget();
			}
			JobReport {
				processed: 1,
				partial: self.partial_once.swap(false, Ordering::SeqCst),
				..JobReport::default()
			}
		}

		async fn refresh_topk(&self) -> JobReport {
			self.refreshes.fetch_add(1, Ordering::SeqCst);
			JobReport::default()
		}

		async fn cleanup(&self) -> JobReport {
			self.cleanups.fetch_add(1, Ordering::SeqCst);
			JobReport::default()
		}
	}

	fn manual() -> SchedulerConfig {
		SchedulerConfig {
			enabled: false,
			..SchedulerConfig::default()
		}
	}

	async fn wait_idle(scheduler: &Scheduler) {
		for _ in 0..200 {
			if scheduler.status().running.is_empty() {
				return;
			}
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
		panic!("scheduler never went idle");
	}

	#[tokio::test]
	async fn repeated_triggers_coalesce_into_one_rerun() {
		let runner = FakeRunner::new(false);
		let scheduler =
			Scheduler::start(manual(), PoolConfig::general(), PoolConfig::similarity(), runner.clone())
				.unwrap();
		let job = Job::Recompute(RecomputeTarget::All);

		assert_eq!(scheduler.trigger(job).await.unwrap(), TriggerOutcome::Started);
		while runner.recomputes.load(Ordering::SeqCst) == 0 {
			tokio::task::yield_now().await;
		}
		assert_eq!(scheduler.trigger(job).await.unwrap(), TriggerOutcome::Coalesced);
		assert_eq!(scheduler.trigger(job).await.unwrap(), TriggerOutcome::Coalesced);
		assert_eq!(scheduler.status().pending_reruns, 1);

		runner.gate.add_permits(10);
		wait_idle(&scheduler).await;
		assert_eq!(runner.recomputes.load(Ordering::SeqCst), 2);
		let status = scheduler.status();
		assert_eq!(status.triggered, 1);
		assert_eq!(status.coalesced, 2);
		assert!(status.last_reports.contains_key("recompute:all"));
		scheduler.shutdown().await;
	}

	#[tokio::test]
	async fn different_targets_run_independently() {
		let runner = FakeRunner::new(true);
		let scheduler =
			Scheduler::start(manual(), PoolConfig::general(), PoolConfig::similarity(), runner.clone())
				.unwrap();
		for place_id in 1..=3 {
			let outcome = scheduler
				.trigger(Job::Recompute(RecomputeTarget::Place { place_id }))
				.await
				.unwrap();
			assert_eq!(outcome, TriggerOutcome::Started);
		}
		wait_idle(&scheduler).await;
		assert_eq!(runner.recomputes.load(Ordering::SeqCst), 3);
		scheduler.shutdown().await;
	}

	#[tokio::test]
	async fn run_now_returns_report() {
		let runner = FakeRunner::new(true);
		let scheduler =
			Scheduler::start(manual(), PoolConfig::general(), PoolConfig::similarity(), runner.clone())
				.unwrap();
		let report = scheduler
			.run_now(Job::Recompute(RecomputeTarget::Pair { a: 1, b: 2 }))
			.await
			.unwrap();
		assert_eq!(report.processed, 1);
		assert!(scheduler.status().last_reports.contains_key("recompute:pair:1-2"));
		scheduler.shutdown().await;
	}

	#[tokio::test]
	async fn panicking_job_releases_its_slot() {
		let runner = FakeRunner::new(true);
		runner.panic_once.store(true, Ordering::SeqCst);
		let scheduler =
			Scheduler::start(manual(), PoolConfig::general(), PoolConfig::similarity(), runner.clone())
				.unwrap();
		let job = Job::Recompute(RecomputeTarget::All);

		assert_eq!(scheduler.trigger(job).await.unwrap(), TriggerOutcome::Started);
		wait_idle(&scheduler).await;
		assert_eq!(scheduler.status().last_reports["recompute:all"].failed, 1);

		for expected in 2..=4 {
			assert_eq!(scheduler.trigger(job).await.unwrap(), TriggerOutcome::Started);
			wait_idle(&scheduler).await;
			assert_eq!(runner.recomputes.load(Ordering::SeqCst), expected);
		}
		assert_eq!(scheduler.status().coalesced, 0);
		scheduler.shutdown().await;
	}

	#[tokio::test(start_paused = true)]
	async fn partial_job_is_retried_after_delay() {
		let runner = FakeRunner::new(true);
		runner.partial_once.store(true, Ordering::SeqCst);
		let scheduler =
			Scheduler::start(manual(), PoolConfig::general(), PoolConfig::similarity(), runner.clone())
				.unwrap();
		scheduler
			.trigger(Job::Recompute(RecomputeTarget::All))
			.await
			.unwrap();
		tokio::time::sleep(Duration::from_secs(1)).await;
		assert_eq!(runner.recomputes.load(Ordering::SeqCst), 1);

		tokio::time::sleep(Duration::from_secs(61)).await;
		assert_eq!(runner.recomputes.load(Ordering::SeqCst), 2);
		scheduler.shutdown().await;
	}

	#[tokio::test(start_paused = true)]
	async fn tickers_fire_on_schedule_without_immediate_run() {
		let runner = FakeRunner::new(true);
		let config = SchedulerConfig {
			enabled: true,
			full_recompute_secs: 0,
			topk_refresh_secs: 10,
			cleanup_secs: 30,
			partial_retry_secs: 60,
		};
		let scheduler =
			Scheduler::start(config, PoolConfig::general(), PoolConfig::similarity(), runner.clone())
				.unwrap();
		tokio::time::sleep(Duration::from_secs(1)).await;
		assert_eq!(runner.refreshes.load(Ordering::SeqCst), 0);

		tokio::time::sleep(Duration::from_secs(30)).await;
		assert_eq!(runner.refreshes.load(Ordering::SeqCst), 3);
		assert_eq!(runner.cleanups.load(Ordering::SeqCst), 1);
		assert_eq!(runner.recomputes.load(Ordering::SeqCst), 0);
		scheduler.shutdown().await;
	}

	#[tokio::test]
	async fn trigger_after_shutdown_fails() {
		let runner = FakeRunner::new(true);
		let scheduler =
			Scheduler::start(manual(), PoolConfig::general(), PoolConfig::similarity(), runner).unwrap();
		scheduler.shutdown().await;
		let err = scheduler.trigger(Job::Cleanup).await.unwrap_err();
		assert!(matches!(err, AffinityError::PoolShutdown(_)));
	}

	#[test]
	fn job_names_are_stable() {
		assert_eq!(Job::Recompute(RecomputeTarget::All).to_string(), "recompute:all");
		assert_eq!(
			Job::Recompute(RecomputeTarget::Place { place_id: 4 }).to_string(),
			"recompute:place:4"
		);
		assert_eq!(Job::RefreshTopK.to_string(), "refresh-topk");
	}
}
