use chrono::NaiveDate;
use ndarray::Array2;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::types::{BoolMask, GridSpec, ProviderError};

/// One satellite observation over the working grid: surface reflectance in
/// the red and near-infrared bands plus a per-pixel validity mask derived
/// from the provider's cloud/QA flags.
#[derive(Debug, Clone)]
pub struct Scene {
    pub acquired: NaiveDate,
    pub red: Array2<f32>,
    pub nir: Array2<f32>,
    /// True where the observation is usable (cloud-free, QA-clean)
    pub valid: BoolMask,
}

impl Scene {
    /// All bands must share the grid's dimensions
    pub fn conforms_to(&self, grid: &GridSpec) -> bool {
        let shape = grid.shape();
        self.red.dim() == shape && self.nir.dim() == shape && self.valid.dim() == shape
    }
}

/// A request for all scenes over an extent within an inclusive date range
#[derive(Debug, Clone)]
pub struct SceneQuery {
    pub grid: GridSpec,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Source of co-registered satellite scenes. Implementations wrap a concrete
/// imagery archive or service; the compositor only sees this trait.
///
/// Returning an empty collection is a valid response (no acquisitions in the
/// window), not an error.
pub trait SceneProvider: Send + Sync {
    fn query(&self, query: &SceneQuery) -> Result<Vec<Scene>, ProviderError>;
}

/// Retry schedule for transient provider failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_backoff: Duration,
    /// Multiplier applied to the delay after each failed attempt
    pub backoff_factor: f64,
    /// Upper bound on any single delay
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-based)
    fn backoff_after(&self, attempt: u32) -> Duration {
        let scaled =
            self.initial_backoff.as_secs_f64() * self.backoff_factor.powi(attempt as i32 - 1);
        Duration::from_secs_f64(scaled.min(self.max_backoff.as_secs_f64()))
    }
}

/// Wraps any `SceneProvider` with bounded retries and exponential backoff.
///
/// Transient errors are retried per the policy; fatal errors and retry
/// exhaustion surface to the caller so the event is recorded as failed
/// rather than silently zeroed.
pub struct RetryingProvider<P> {
    inner: P,
    policy: RetryPolicy,
}

impl<P: SceneProvider> RetryingProvider<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(inner: P, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

impl<P: SceneProvider> SceneProvider for RetryingProvider<P> {
    fn query(&self, query: &SceneQuery) -> Result<Vec<Scene>, ProviderError> {
        let mut last_error = None;

        for attempt in 1..=self.policy.max_attempts {
            log::debug!(
                "Scene query attempt {} of {} ({} to {})",
                attempt,
                self.policy.max_attempts,
                query.start,
                query.end
            );

            match self.inner.query(query) {
                Ok(scenes) => {
                    log::debug!("Scene query returned {} scenes", scenes.len());
                    return Ok(scenes);
                }
                Err(e) if e.is_transient() => {
                    if attempt < self.policy.max_attempts {
                        let delay = self.policy.backoff_after(attempt);
                        log::warn!(
                            "Transient provider error on attempt {}: {}. Retrying in {:.1}s",
                            attempt,
                            e,
                            delay.as_secs_f64()
                        );
                        std::thread::sleep(delay);
                    }
                    last_error = Some(e);
                }
                Err(e) => {
                    log::error!("Fatal provider error: {}", e);
                    return Err(e);
                }
            }
        }

        let detail = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no error recorded".to_string());
        Err(ProviderError::Fatal(format!(
            "scene query failed after {} attempts: {}",
            self.policy.max_attempts, detail
        )))
    }
}

/// State of an asynchronous export/processing job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed(String),
    Cancelled,
}

/// An imagery backend that processes queries asynchronously: the query is
/// submitted as a job, polled for completion, and its result fetched once
/// done. Job identifiers are backend-assigned opaque strings.
pub trait ExportBackend: Send + Sync {
    fn submit(&self, query: &SceneQuery) -> Result<String, ProviderError>;
    fn status(&self, job_id: &str) -> Result<JobStatus, ProviderError>;
    fn cancel(&self, job_id: &str) -> Result<(), ProviderError>;
    fn fetch(&self, job_id: &str) -> Result<Vec<Scene>, ProviderError>;
}

/// Polling schedule for asynchronous export jobs
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Delay between status checks
    pub interval: Duration,
    /// Bound on the total wait for one job
    pub max_wait: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_wait: Duration::from_secs(600),
        }
    }
}

/// Adapts an asynchronous `ExportBackend` to the synchronous `SceneProvider`
/// contract: submit, poll with bounded wait, fetch.
///
/// The shared abort flag cancels the in-flight job and returns early, so a
/// batch shutdown never leaves orphaned jobs running on the backend.
pub struct ExportBackedProvider<B> {
    backend: B,
    poll: PollConfig,
    abort: Arc<AtomicBool>,
}

impl<B: ExportBackend> ExportBackedProvider<B> {
    pub fn new(backend: B, poll: PollConfig, abort: Arc<AtomicBool>) -> Self {
        Self {
            backend,
            poll,
            abort,
        }
    }

    fn cancel_quietly(&self, job_id: &str) {
        if let Err(e) = self.backend.cancel(job_id) {
            log::warn!("Failed to cancel export job {}: {}", job_id, e);
        }
    }
}

impl<B: ExportBackend> SceneProvider for ExportBackedProvider<B> {
    fn query(&self, query: &SceneQuery) -> Result<Vec<Scene>, ProviderError> {
        let job_id = self.backend.submit(query)?;
        log::info!("Submitted export job {}", job_id);

        let deadline = Instant::now() + self.poll.max_wait;
        loop {
            if self.abort.load(Ordering::SeqCst) {
                log::warn!("Abort requested, cancelling export job {}", job_id);
                self.cancel_quietly(&job_id);
                return Err(ProviderError::Fatal(format!(
                    "export job {} aborted",
                    job_id
                )));
            }

            match self.backend.status(&job_id)? {
                JobStatus::Completed => {
                    log::debug!("Export job {} completed", job_id);
                    return self.backend.fetch(&job_id);
                }
                JobStatus::Failed(reason) => {
                    return Err(ProviderError::Fatal(format!(
                        "export job {} failed: {}",
                        job_id, reason
                    )));
                }
                JobStatus::Cancelled => {
                    return Err(ProviderError::Fatal(format!(
                        "export job {} was cancelled by the backend",
                        job_id
                    )));
                }
                JobStatus::Pending | JobStatus::Running => {}
            }

            if Instant::now() >= deadline {
                log::warn!(
                    "Export job {} exceeded max wait of {:.0}s, cancelling",
                    job_id,
                    self.poll.max_wait.as_secs_f64()
                );
                self.cancel_quietly(&job_id);
                return Err(ProviderError::Transient(format!(
                    "export job {} timed out",
                    job_id
                )));
            }

            std::thread::sleep(self.poll.interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    fn small_grid() -> GridSpec {
        let bbox = BoundingBox {
            min_lon: 0.0,
            max_lon: 0.4,
            min_lat: 0.0,
            max_lat: 0.4,
        };
        GridSpec::from_bbox(&bbox, 0.1).unwrap()
    }

    fn clear_scene(grid: &GridSpec, day: u32) -> Scene {
        let shape = grid.shape();
        Scene {
            acquired: NaiveDate::from_ymd_opt(2024, 7, day).unwrap(),
            red: Array2::from_elem(shape, 0.1),
            nir: Array2::from_elem(shape, 0.3),
            valid: Array2::from_elem(shape, true),
        }
    }

    fn test_query() -> SceneQuery {
        SceneQuery {
            grid: small_grid(),
            start: NaiveDate::from_ymd_opt(2024, 7, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2024, 7, 31).unwrap(),
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(1),
            backoff_factor: 2.0,
            max_backoff: Duration::from_millis(4),
        }
    }

    /// Fails with transient errors a fixed number of times, then succeeds
    struct FlakyProvider {
        failures_remaining: AtomicU32,
        calls: AtomicU32,
    }

    impl SceneProvider for FlakyProvider {
        fn query(&self, query: &SceneQuery) -> Result<Vec<Scene>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
                return Err(ProviderError::Transient("rate limited".to_string()));
            }
            Ok(vec![clear_scene(&query.grid, 10)])
        }
    }

    #[test]
    fn retry_recovers_from_transient_failures() {
        let provider = RetryingProvider::with_policy(
            FlakyProvider {
                failures_remaining: AtomicU32::new(3),
                calls: AtomicU32::new(0),
            },
            fast_policy(),
        );
        let scenes = provider.query(&test_query()).unwrap();
        assert_eq!(scenes.len(), 1);
        assert_eq!(provider.inner.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn retry_exhaustion_is_terminal() {
        let provider = RetryingProvider::with_policy(
            FlakyProvider {
                failures_remaining: AtomicU32::new(100),
                calls: AtomicU32::new(0),
            },
            fast_policy(),
        );
        let err = provider.query(&test_query()).unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(provider.inner.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn fatal_errors_are_not_retried() {
        struct AlwaysFatal {
            calls: AtomicU32,
        }
        impl SceneProvider for AlwaysFatal {
            fn query(&self, _query: &SceneQuery) -> Result<Vec<Scene>, ProviderError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::Fatal("bad geometry".to_string()))
            }
        }
        let provider = RetryingProvider::with_policy(
            AlwaysFatal {
                calls: AtomicU32::new(0),
            },
            fast_policy(),
        );
        assert!(provider.query(&test_query()).is_err());
        assert_eq!(provider.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_grows_and_saturates() {
        let policy = fast_policy();
        assert_eq!(policy.backoff_after(1), Duration::from_millis(1));
        assert_eq!(policy.backoff_after(2), Duration::from_millis(2));
        assert_eq!(policy.backoff_after(3), Duration::from_millis(4));
        // Capped at max_backoff
        assert_eq!(policy.backoff_after(10), Duration::from_millis(4));
    }

    /// In-memory export backend that completes after a set number of polls
    struct StepBackend {
        polls_until_done: u32,
        polls_seen: AtomicU32,
        cancelled: Mutex<Vec<String>>,
    }

    impl ExportBackend for StepBackend {
        fn submit(&self, _query: &SceneQuery) -> Result<String, ProviderError> {
            Ok("job-1".to_string())
        }

        fn status(&self, _job_id: &str) -> Result<JobStatus, ProviderError> {
            let seen = self.polls_seen.fetch_add(1, Ordering::SeqCst) + 1;
            if seen >= self.polls_until_done {
                Ok(JobStatus::Completed)
            } else {
                Ok(JobStatus::Running)
            }
        }

        fn cancel(&self, job_id: &str) -> Result<(), ProviderError> {
            self.cancelled.lock().unwrap().push(job_id.to_string());
            Ok(())
        }

        fn fetch(&self, _job_id: &str) -> Result<Vec<Scene>, ProviderError> {
            Ok(vec![clear_scene(&small_grid(), 12)])
        }
    }

    fn fast_poll(max_wait: Duration) -> PollConfig {
        PollConfig {
            interval: Duration::from_millis(1),
            max_wait,
        }
    }

    #[test]
    fn export_job_polls_to_completion() {
        let provider = ExportBackedProvider::new(
            StepBackend {
                polls_until_done: 3,
                polls_seen: AtomicU32::new(0),
                cancelled: Mutex::new(Vec::new()),
            },
            fast_poll(Duration::from_secs(5)),
            Arc::new(AtomicBool::new(false)),
        );
        let scenes = provider.query(&test_query()).unwrap();
        assert_eq!(scenes.len(), 1);
        assert!(provider.backend.cancelled.lock().unwrap().is_empty());
    }

    #[test]
    fn export_job_timeout_cancels() {
        let provider = ExportBackedProvider::new(
            StepBackend {
                polls_until_done: u32::MAX,
                polls_seen: AtomicU32::new(0),
                cancelled: Mutex::new(Vec::new()),
            },
            fast_poll(Duration::from_millis(10)),
            Arc::new(AtomicBool::new(false)),
        );
        let err = provider.query(&test_query()).unwrap_err();
        assert!(err.is_transient());
        assert_eq!(
            provider.backend.cancelled.lock().unwrap().as_slice(),
            &["job-1".to_string()]
        );
    }

    #[test]
    fn abort_flag_cancels_job() {
        let abort = Arc::new(AtomicBool::new(true));
        let provider = ExportBackedProvider::new(
            StepBackend {
                polls_until_done: u32::MAX,
                polls_seen: AtomicU32::new(0),
                cancelled: Mutex::new(Vec::new()),
            },
            fast_poll(Duration::from_secs(5)),
            abort,
        );
        let err = provider.query(&test_query()).unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(
            provider.backend.cancelled.lock().unwrap().as_slice(),
            &["job-1".to_string()]
        );
    }
}
