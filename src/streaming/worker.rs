//! Decode worker pool
//!
//! Jobs run on a dedicated tokio runtime. Reading and decoding are blocking
//! and run through `spawn_blocking`; a `JoinSet` caps how many run at once.
//! Results come back over an unbounded channel drained without blocking.

use crate::streaming::catalog::GridBlobRef;
use crate::streaming::disk_io::{DecodeError, DecodedGrid, GridSource};
use crate::streaming::key::FrameKey;
use crate::streaming::priority::CancelToken;
use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// One read + decode job
#[derive(Debug, Clone)]
pub struct DecodeJob {
    pub key: FrameKey,
    pub blob: GridBlobRef,
    pub token: CancelToken,
}

#[derive(Debug)]
pub enum DecodeOutcome {
    Decoded(DecodedGrid),
    /// The token was cancelled at a safe point; the work was discarded
    Cancelled,
    Failed(DecodeError),
}

#[derive(Debug)]
pub struct DecodeResult {
    pub key: FrameKey,
    pub outcome: DecodeOutcome,
}

/// Fixed-size pool of decode workers
pub struct DecodeWorkerPool {
    /// Channel for sending jobs to the worker loop
    job_tx: mpsc::UnboundedSender<DecodeJob>,
    /// Channel for receiving decode results
    result_rx: mpsc::UnboundedReceiver<DecodeResult>,
    /// Keys submitted and not yet reported back
    pending: HashSet<FrameKey>,
    worker_count: usize,
    runtime: Option<Runtime>,
}

impl DecodeWorkerPool {
    /// Start the pool
    ///
    /// # Arguments
    /// * `source` - Grid source shared by all workers
    /// * `worker_count` - Maximum number of concurrent decode jobs
    pub fn new(source: Arc<dyn GridSource>, worker_count: usize) -> Result<Self, io::Error> {
        let worker_count = worker_count.max(1);
        let (job_tx, job_rx) = mpsc::unbounded_channel::<DecodeJob>();
        let (result_tx, result_rx) = mpsc::unbounded_channel::<DecodeResult>();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(worker_count)
            .thread_name("vdb-decode")
            .enable_all()
            .build()?;

        runtime.spawn(Self::worker_loop(source, worker_count, job_rx, result_tx));
        log::info!("Decode worker pool started with {} workers", worker_count);

        Ok(Self {
            job_tx,
            result_rx,
            pending: HashSet::new(),
            worker_count,
            runtime: Some(runtime),
        })
    }

    /// Worker loop that runs jobs with concurrency control
    async fn worker_loop(
        source: Arc<dyn GridSource>,
        max_concurrent: usize,
        mut job_rx: mpsc::UnboundedReceiver<DecodeJob>,
        result_tx: mpsc::UnboundedSender<DecodeResult>,
    ) {
        let mut active_tasks = JoinSet::new();
        let mut queued: Vec<DecodeJob> = Vec::new();
        let mut accepting = true;

        loop {
            tokio::select! {
                request = job_rx.recv(), if accepting => {
                    match request {
                        Some(job) => queued.push(job),
                        None => accepting = false,
                    }
                }

                Some(joined) = active_tasks.join_next(), if !active_tasks.is_empty() => {
                    match joined {
                        Ok(result) => {
                            let _ = result_tx.send(result);
                        }
                        Err(e) => log::error!("Decode task failed to join: {}", e),
                    }
                }

                else => break,
            }

            // Jobs arrive in dispatch order; start them first come first served
            while active_tasks.len() < max_concurrent && !queued.is_empty() {
                let job = queued.remove(0);
                let source = Arc::clone(&source);
                active_tasks.spawn(async move {
                    let key = job.key;
                    match tokio::task::spawn_blocking(move || run_job(source.as_ref(), job)).await {
                        Ok(result) => result,
                        Err(e) => {
                            log::error!("Decode of {} panicked: {}", key, e);
                            DecodeResult {
                                key,
                                outcome: DecodeOutcome::Failed(DecodeError::Worker(e.to_string())),
                            }
                        }
                    }
                });
            }
        }
        log::debug!("Decode worker loop exited");
    }

    /// Submit a job.
    ///
    /// Returns `false` if the key is already being decoded.
    pub fn submit(&mut self, job: DecodeJob) -> bool {
        if !self.pending.insert(job.key) {
            return false;
        }
        let key = job.key;
        if self.job_tx.send(job).is_err() {
            log::error!("Decode worker loop is gone, dropping {}", key);
            self.pending.remove(&key);
            return false;
        }
        true
    }

    /// Poll for completed jobs (non-blocking)
    pub fn poll_results(&mut self) -> Vec<DecodeResult> {
        let mut results = Vec::new();
        while let Ok(result) = self.result_rx.try_recv() {
            self.pending.remove(&result.key);
            results.push(result);
        }
        results
    }

    /// Jobs submitted and not yet reported back
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, key: FrameKey) -> bool {
        self.pending.contains(&key)
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Handle of the pool's runtime, for services that share it
    pub fn runtime_handle(&self) -> Option<tokio::runtime::Handle> {
        self.runtime.as_ref().map(|rt| rt.handle().clone())
    }
}

impl Drop for DecodeWorkerPool {
    fn drop(&mut self) {
        // Don't wait for blocking reads still in progress
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// Read and decode one blob, checking the token at each safe point
fn run_job(source: &dyn GridSource, job: DecodeJob) -> DecodeResult {
    let key = job.key;
    let cancelled = DecodeResult { key, outcome: DecodeOutcome::Cancelled };

    if job.token.is_cancelled() {
        return cancelled;
    }

    let bytes = match source.read(&job.blob) {
        Ok(bytes) => bytes,
        Err(e) => return DecodeResult { key, outcome: DecodeOutcome::Failed(e) },
    };
    if job.token.is_cancelled() {
        return cancelled;
    }

    let outcome = match source.decode(&job.blob, &bytes) {
        Ok(grid) => DecodeOutcome::Decoded(grid),
        Err(e) => DecodeOutcome::Failed(e),
    };
    if job.token.is_cancelled() {
        return cancelled;
    }

    log::trace!("Decoded {}", key);
    DecodeResult { key, outcome }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Aabb;
    use crate::streaming::key::SequenceId;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    /// Source that decodes any blob, failing on offsets listed as corrupt
    struct FakeSource {
        corrupt_offset: Option<u64>,
        reads: AtomicUsize,
        panic_offset: Option<u64>,
    }

    impl FakeSource {
        fn new() -> Self {
            Self { corrupt_offset: None, reads: AtomicUsize::new(0), panic_offset: None }
        }
    }

    impl GridSource for FakeSource {
        fn read(&self, blob: &GridBlobRef) -> Result<Vec<u8>, DecodeError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.panic_offset == Some(blob.offset) {
                panic!("simulated decoder crash");
            }
            Ok(vec![0u8; blob.length as usize])
        }

        fn decode(&self, blob: &GridBlobRef, bytes: &[u8]) -> Result<DecodedGrid, DecodeError> {
            if self.corrupt_offset == Some(blob.offset) {
                return Err(DecodeError::Corrupt("bad magic".into()));
            }
            Ok(DecodedGrid { bounds: Aabb::unit(), active_voxel_count: 1, tree: bytes.to_vec() })
        }
    }

    fn job(frame: u32) -> DecodeJob {
        DecodeJob {
            key: FrameKey::new(SequenceId(0), frame, 0),
            blob: GridBlobRef {
                path: Arc::new(PathBuf::from("unused.vdbs")),
                offset: u64::from(frame),
                length: 16,
                uncompressed_size: 64,
            },
            token: CancelToken::new(),
        }
    }

    fn wait_for(pool: &mut DecodeWorkerPool, count: usize) -> Vec<DecodeResult> {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut results = Vec::new();
        while results.len() < count && Instant::now() < deadline {
            results.extend(pool.poll_results());
            std::thread::sleep(Duration::from_millis(2));
        }
        results
    }

    #[test]
    fn test_decodes_jobs() {
        let mut pool = DecodeWorkerPool::new(Arc::new(FakeSource::new()), 2).expect("pool starts");
        for frame in 0..5 {
            assert!(pool.submit(job(frame)));
        }
        let results = wait_for(&mut pool, 5);
        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|r| matches!(&r.outcome, DecodeOutcome::Decoded(g) if g.tree.len() == 16)));
        assert_eq!(pool.pending_count(), 0);
    }

    #[test]
    fn test_duplicate_submit_refused() {
        let mut pool = DecodeWorkerPool::new(Arc::new(FakeSource::new()), 1).expect("pool starts");
        assert!(pool.submit(job(3)));
        assert!(!pool.submit(job(3)));
        assert!(pool.is_pending(FrameKey::new(SequenceId(0), 3, 0)));
        wait_for(&mut pool, 1);
    }

    #[test]
    fn test_cancelled_before_start_is_not_read() {
        let source = Arc::new(FakeSource::new());
        let mut pool = DecodeWorkerPool::new(source.clone(), 1).expect("pool starts");
        let job = job(1);
        job.token.cancel();
        pool.submit(job);

        let results = wait_for(&mut pool, 1);
        assert!(matches!(results[0].outcome, DecodeOutcome::Cancelled));
        assert_eq!(source.reads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failure_is_local_to_key() {
        let source = FakeSource { corrupt_offset: Some(5), ..FakeSource::new() };
        let mut pool = DecodeWorkerPool::new(Arc::new(source), 2).expect("pool starts");
        pool.submit(job(5));
        pool.submit(job(6));

        let results = wait_for(&mut pool, 2);
        for result in &results {
            match result.key.frame {
                5 => assert!(matches!(result.outcome, DecodeOutcome::Failed(DecodeError::Corrupt(_)))),
                6 => assert!(matches!(result.outcome, DecodeOutcome::Decoded(_))),
                other => panic!("unexpected frame {}", other),
            }
        }
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_panicking_decode_reports_failure() {
        let source = FakeSource { panic_offset: Some(2), ..FakeSource::new() };
        let mut pool = DecodeWorkerPool::new(Arc::new(source), 1).expect("pool starts");
        pool.submit(job(2));
        pool.submit(job(3));

        let results = wait_for(&mut pool, 2);
        assert_eq!(results.len(), 2);
        let crashed = results.iter().find(|r| r.key.frame == 2).expect("frame 2 reported");
        assert!(matches!(crashed.outcome, DecodeOutcome::Failed(DecodeError::Worker(_))));
    }
}
