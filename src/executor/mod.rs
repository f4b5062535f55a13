//! Parallel copy execution.
//!
//! A fixed pool of blocking workers copies the planned jobs in true parallel,
//! each with its own [`Storage`] clone and an unbounded back-channel to the
//! coordinator. The coordinator owns the manifest exclusively: workers only
//! send typed messages, which are drained after every worker has finished.
//! A 1-second poll watches for worker failures, joinability and the
//! copy-phase timeout; any fatal condition cancels the survivors and leaves
//! the temp tree intact for a later resume.

pub mod plan;
pub mod resume;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::fs::{CopyOptions, CopyOutcome, Storage};
use crate::manifest::{Manifest, ATTR_CHECKSUM};
use crate::utils::errors::{EngineError, Result};

use plan::{CopyClass, CopyJob, CopyPlan};

/// Hard ceiling on copy workers, bounding database-side I/O concurrency.
pub const MAX_WORKERS: usize = 32;

/// Files at or below this size are balanced by count, larger ones by bytes.
pub const SMALL_FILE_THRESHOLD: u64 = 65_536;

/// Small backups stay single-worker: one worker per ten jobs.
const JOBS_PER_WORKER: usize = 10;

/// Mutations a worker wants applied to the manifest. Messages preserve
/// emission order within one worker's channel; no cross-channel order is
/// needed since each message names its target entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerMessage {
    Checksum {
        section: String,
        key: String,
        checksum: String,
    },
    /// The source vanished mid-backup: the database removed it, drop the
    /// manifest entry
    Remove { section: String, key: String },
}

#[derive(Debug, Clone, Copy)]
pub struct ExecuteOptions {
    pub process_max: usize,
    pub compress: bool,
    pub checksum: bool,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CopyStats {
    pub copied_files: usize,
    pub copied_bytes: u64,
    pub linked_files: usize,
    pub skipped_files: usize,
    pub removed_files: usize,
    pub checksummed_files: usize,
}

#[derive(Debug, Default)]
struct WorkerStats {
    copied_files: usize,
    copied_bytes: u64,
    removed_files: usize,
    checksummed_files: usize,
}

/// Number of workers for a job count: the request, capped at [`MAX_WORKERS`]
/// and at one worker per ten jobs.
pub fn worker_count(requested: usize, total_jobs: usize) -> usize {
    let by_jobs = total_jobs.div_ceil(JOBS_PER_WORKER).max(1);
    requested.clamp(1, MAX_WORKERS).min(by_jobs)
}

/// Deal jobs into per-worker bins.
///
/// Large files advance the bin once its accumulated bytes reach an equal
/// byte share; small files advance once the count reaches an equal count
/// share. The dual binning keeps one multi-GB file from pinning a worker
/// while preserving the planner's deterministic order within each bin.
pub fn partition(jobs: Vec<CopyJob>, workers: usize) -> Vec<Vec<CopyJob>> {
    let mut bins: Vec<Vec<CopyJob>> = (0..workers).map(|_| Vec::new()).collect();
    let (large, small): (Vec<_>, Vec<_>) =
        jobs.into_iter().partition(|j| j.size > SMALL_FILE_THRESHOLD);

    let total_large_bytes: u64 = large.iter().map(|j| j.size).sum();
    let byte_share = total_large_bytes / workers as u64;
    let mut worker = 0;
    let mut bytes = 0u64;
    for job in large {
        bytes += job.size;
        bins[worker].push(job);
        if bytes >= byte_share {
            worker = (worker + 1) % workers;
            bytes = 0;
        }
    }

    let count_share = small.len() / workers;
    let mut worker = 0;
    let mut count = 0;
    for job in small {
        count += 1;
        bins[worker].push(job);
        if count >= count_share {
            worker = (worker + 1) % workers;
            count = 0;
        }
    }

    bins
}

/// Append the compress extension when compression is on.
fn written_name(path: &Path, compress: bool, ext: &str) -> PathBuf {
    if compress {
        let mut name = path.as_os_str().to_os_string();
        name.push(".");
        name.push(ext);
        PathBuf::from(name)
    } else {
        path.to_path_buf()
    }
}

/// Run the copy phase and fold the workers' messages into the manifest.
pub async fn execute<S: Storage>(
    storage: &S,
    manifest: &mut Manifest,
    plan: CopyPlan,
    options: &ExecuteOptions,
) -> Result<CopyStats> {
    let ext = storage.compress_extension().to_string();
    let mut stats = CopyStats {
        skipped_files: plan.skipped,
        ..Default::default()
    };

    // Hard links from referenced backups are metadata operations and stay on
    // the coordinator.
    for link in &plan.links {
        let src = written_name(&link.source, options.compress, &ext);
        let dst = written_name(&link.dest, options.compress, &ext);
        storage.link_create(&src, &dst, true, false)?;
        stats.linked_files += 1;
    }

    if plan.jobs.is_empty() {
        return Ok(stats);
    }

    let workers = worker_count(options.process_max, plan.jobs.len());
    info!(
        workers,
        jobs = plan.jobs.len(),
        bytes = plan.copy_bytes,
        "starting copy phase"
    );

    let token = CancellationToken::new();
    let failed = Arc::new(AtomicBool::new(false));
    let deadline = options.timeout.map(|t| Instant::now() + t);

    let mut handles = Vec::with_capacity(workers);
    let mut receivers: Vec<UnboundedReceiver<WorkerMessage>> = Vec::with_capacity(workers);

    for (idx, bin) in partition(plan.jobs, workers).into_iter().enumerate() {
        let (tx, rx) = mpsc::unbounded_channel();
        receivers.push(rx);

        let worker_storage = storage.clone_for_worker(idx);
        let worker_token = token.clone();
        let worker_failed = Arc::clone(&failed);
        let compress = options.compress;
        let checksum = options.checksum;
        let worker_ext = ext.clone();

        handles.push(tokio::task::spawn_blocking(move || {
            worker_run(
                idx,
                worker_storage,
                bin,
                compress,
                checksum,
                &worker_ext,
                tx,
                worker_token,
                worker_failed,
            )
        }));
    }

    // Poll at 1-second granularity: worker errors, joinability, timeout.
    let mut timed_out = false;
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        interval.tick().await;

        if failed.load(Ordering::SeqCst) {
            token.cancel();
        }
        if let Some(deadline) = deadline {
            if !timed_out && Instant::now() >= deadline {
                warn!("copy phase timeout expired, cancelling workers");
                token.cancel();
                timed_out = true;
            }
        }
        if handles.iter().all(|h| h.is_finished()) {
            break;
        }
    }

    let mut first_error: Option<EngineError> = None;
    for handle in handles {
        match handle.await {
            Ok(Ok(worker_stats)) => {
                stats.copied_files += worker_stats.copied_files;
                stats.copied_bytes += worker_stats.copied_bytes;
                stats.removed_files += worker_stats.removed_files;
                stats.checksummed_files += worker_stats.checksummed_files;
            }
            Ok(Err(e)) => {
                error!(error = %e, "copy worker failed");
                first_error.get_or_insert(e);
            }
            Err(e) => {
                first_error.get_or_insert(EngineError::Assert(format!(
                    "copy worker panicked: {e}"
                )));
            }
        }
    }

    if timed_out {
        return Err(EngineError::Protocol(
            "backup aborted: copy phase exceeded the configured timeout".to_string(),
        ));
    }
    if let Some(e) = first_error {
        return Err(e);
    }

    // Only the coordinator mutates the manifest, after all workers are done.
    for mut receiver in receivers {
        while let Ok(message) = receiver.try_recv() {
            match message {
                WorkerMessage::Checksum {
                    section,
                    key,
                    checksum,
                } => {
                    manifest.set(&section, &key, ATTR_CHECKSUM, checksum);
                }
                WorkerMessage::Remove { section, key } => {
                    manifest.remove_key(&section, &key);
                }
            }
        }
    }

    info!(
        copied = stats.copied_files,
        bytes = stats.copied_bytes,
        linked = stats.linked_files,
        skipped = stats.skipped_files,
        removed = stats.removed_files,
        "copy phase complete"
    );
    Ok(stats)
}

#[allow(clippy::too_many_arguments)]
fn worker_run<S: Storage>(
    worker: usize,
    storage: S,
    jobs: Vec<CopyJob>,
    compress: bool,
    checksum: bool,
    ext: &str,
    tx: UnboundedSender<WorkerMessage>,
    token: CancellationToken,
    failed: Arc<AtomicBool>,
) -> Result<WorkerStats> {
    let mut stats = WorkerStats::default();

    for job in &jobs {
        if token.is_cancelled() {
            debug!(worker, "worker cancelled");
            break;
        }

        let result = run_job(&storage, job, compress, checksum, ext, &tx, &mut stats);
        if let Err(e) = result {
            failed.store(true, Ordering::SeqCst);
            return Err(e);
        }
    }

    Ok(stats)
}

fn run_job<S: Storage>(
    storage: &S,
    job: &CopyJob,
    compress: bool,
    checksum: bool,
    ext: &str,
    tx: &UnboundedSender<WorkerMessage>,
    stats: &mut WorkerStats,
) -> Result<()> {
    match job.class {
        CopyClass::Copy => {
            let outcome = storage.copy(
                &job.source,
                &job.dest,
                &CopyOptions {
                    src_compressed: false,
                    dst_compress: compress,
                    ignore_missing: true,
                    permission: job.permission.clone(),
                    modification_time: job.modification_time,
                    create_dirs: false,
                },
            )?;

            match outcome {
                CopyOutcome::Copied => {
                    stats.copied_files += 1;
                    stats.copied_bytes += job.size;
                    if checksum {
                        let written = written_name(&job.dest, compress, ext);
                        let digest = storage.hash(&written, compress).map_err(|e| {
                            EngineError::Checksum(format!(
                                "hashing '{}' failed: {e}",
                                written.display()
                            ))
                        })?;
                        let _ = tx.send(WorkerMessage::Checksum {
                            section: job.section.clone(),
                            key: job.key.clone(),
                            checksum: digest,
                        });
                    }
                }
                CopyOutcome::SourceMissing => {
                    // the database removed the file during the backup
                    info!(file = %job.source.display(), "source removed during backup");
                    stats.removed_files += 1;
                    let _ = tx.send(WorkerMessage::Remove {
                        section: job.section.clone(),
                        key: job.key.clone(),
                    });
                }
            }
        }
        CopyClass::ChecksumOnly => {
            let written = written_name(&job.dest, compress, ext);
            let digest = storage.hash(&written, compress).map_err(|e| {
                EngineError::Checksum(format!("hashing '{}' failed: {e}", written.display()))
            })?;
            stats.checksummed_files += 1;
            let _ = tx.send(WorkerMessage::Checksum {
                section: job.section.clone(),
                key: job.key.clone(),
                checksum: digest,
            });
        }
        CopyClass::Skip | CopyClass::Link => {
            return Err(EngineError::Assert(format!(
                "{:?} job dispatched to a copy worker",
                job.class
            )));
        }
    }

    Ok(())
}
