//! Incremental index builder.
//!
//! Discovers videos under a root, fans them out to a fixed pool of worker
//! threads (each with its own encoders) and merges the results into the
//! index store on the calling thread, which is the only one that mutates
//! the store. The store is persisted every `batch_size` merged videos and
//! once more at the end.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use serde::Serialize;

use crate::index::{Fingerprint, IndexStorage, IndexStore, StoreError};
use crate::pipeline::{ProcessedVideo, Stage, VideoFailure, VideoProcessor, VideoTask};
use crate::sampler::SampleError;

/// Upper bound on parallel workers. Each one holds a full set of models.
pub const MAX_WORKERS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    /// Clear the store and process every video.
    Rebuild,
    /// Process only new videos and videos whose fingerprint changed.
    Incremental,
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub mode: BuildMode,
    pub workers: usize,
    /// Merged videos between two persists
    pub batch_size: usize,
    pub video_extensions: Vec<String>,
    /// Directory names skipped during discovery, case-insensitive
    pub skip_dirs: Vec<String>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            mode: BuildMode::Incremental,
            workers: 2,
            batch_size: 16,
            video_extensions: crate::config::default_video_extensions(),
            skip_dirs: vec!["raw".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildSummary {
    /// Mode actually used; an incremental request can escalate to a rebuild
    pub mode: BuildMode,
    pub discovered: usize,
    pub succeeded: usize,
    pub skipped_unchanged: usize,
    pub failed: Vec<VideoFailure>,
    /// Queued videos never picked up because the build was cancelled
    pub not_started: usize,
    pub persisted_batches: usize,
    pub generation: u64,
    pub total_indexed: usize,
    pub cancelled: bool,
}

impl BuildSummary {
    fn new(mode: BuildMode) -> Self {
        Self {
            mode,
            discovered: 0,
            succeeded: 0,
            skipped_unchanged: 0,
            failed: Vec::new(),
            not_started: 0,
            persisted_batches: 0,
            generation: 0,
            total_indexed: 0,
            cancelled: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no videos indexed: all {discovered} discovered videos failed")]
    NoVideosIndexed {
        discovered: usize,
        failed: Vec<VideoFailure>,
    },

    #[error("videos directory {0} is not readable: {1}")]
    VideosDir(PathBuf, std::io::Error),

    #[error("failed to prepare worker {worker}: {reason}")]
    WorkerSetup { worker: usize, reason: String },

    #[error("index store error: {0}")]
    Store(#[from] StoreError),
}

/// Builder events, delivered on the aggregating thread.
pub trait BuildProgress {
    fn started(&mut self, _queued: usize, _skipped: usize) {}
    fn video_finished(&mut self, _path: &Path, _failure: Option<&VideoFailure>) {}
    fn persisted(&mut self, _generation: u64, _videos: usize) {}
}

impl BuildProgress for () {}

pub struct IndexBuilder {
    storage: IndexStorage,
    options: BuildOptions,
    encoder_signature: String,
    cancel: Arc<AtomicBool>,
}

impl IndexBuilder {
    pub fn new(storage: IndexStorage, options: BuildOptions, encoder_signature: impl Into<String>) -> Self {
        Self {
            storage,
            options,
            encoder_signature: encoder_signature.into(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Setting this flag stops workers from taking further videos. Videos
    /// already in flight finish and are persisted.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn worker_count(&self) -> usize {
        self.options.workers.clamp(1, MAX_WORKERS)
    }

    /// Index everything under `videos_dir`.
    ///
    /// `make_processor` is called once per worker, on the calling thread,
    /// before any video is dispatched.
    pub fn build<F>(
        &self,
        videos_dir: &Path,
        mut make_processor: F,
        progress: &mut dyn BuildProgress,
    ) -> Result<BuildSummary, BuildError>
    where
        F: FnMut(usize) -> anyhow::Result<Box<dyn VideoProcessor>>,
    {
        let (mut store, mode) = self.open_store()?;
        let mut summary = BuildSummary::new(mode);

        let videos = discover(videos_dir, &self.options.video_extensions, &self.options.skip_dirs)
            .map_err(|e| BuildError::VideosDir(videos_dir.to_path_buf(), e))?;
        summary.discovered = videos.len();
        log::info!("discovered {} videos under {}", videos.len(), videos_dir.display());

        let mut tasks = Vec::with_capacity(videos.len());
        for path in videos {
            let task = match fingerprinted_task(path) {
                Ok(task) => task,
                Err(failure) => {
                    log::warn!(
                        "{}: {} -> failed: {}",
                        failure.path.display(),
                        failure.stage,
                        failure.reason
                    );
                    summary.failed.push(failure);
                    continue;
                }
            };

            if mode == BuildMode::Incremental {
                let unchanged = store
                    .record(task.video_id)
                    .is_some_and(|r| r.fingerprint == task.fingerprint);
                if unchanged {
                    log::debug!("{}: unchanged, skipping", task.path.display());
                    summary.skipped_unchanged += 1;
                    continue;
                }
            }

            tasks.push(task);
        }

        progress.started(tasks.len(), summary.skipped_unchanged);

        // The cleared store must reach disk even if nothing gets merged
        let mut dirty = mode == BuildMode::Rebuild;

        if !tasks.is_empty() {
            let mut processors = Vec::with_capacity(self.worker_count());
            for worker in 0..self.worker_count().min(tasks.len()) {
                let processor = make_processor(worker).map_err(|e| BuildError::WorkerSetup {
                    worker,
                    reason: format!("{e:#}"),
                })?;
                processors.push(processor);
            }

            log::info!(
                "processing {} videos with {} workers ({} unchanged)",
                tasks.len(),
                processors.len(),
                summary.skipped_unchanged
            );

            self.run_workers(processors, tasks, &mut store, &mut summary, &mut dirty, progress)?;
        }

        summary.cancelled = self.cancel.load(Ordering::Relaxed);

        let nothing_indexed = summary.discovered > 0
            && summary.succeeded + summary.skipped_unchanged == 0
            && !summary.cancelled;
        if nothing_indexed {
            return Err(BuildError::NoVideosIndexed {
                discovered: summary.discovered,
                failed: summary.failed,
            });
        }

        if dirty {
            self.persist(&mut store, &mut summary, progress)?;
        }

        summary.generation = store.generation();
        summary.total_indexed = store.len();

        log::info!(
            "build finished: {} indexed, {} unchanged, {} failed{}",
            summary.succeeded,
            summary.skipped_unchanged,
            summary.failed.len(),
            if summary.cancelled { " (cancelled)" } else { "" }
        );

        Ok(summary)
    }

    /// Starting store and the mode that will actually run.
    fn open_store(&self) -> Result<(IndexStore, BuildMode), BuildError> {
        match self.options.mode {
            BuildMode::Rebuild => Ok((IndexStore::new(&self.encoder_signature), BuildMode::Rebuild)),
            BuildMode::Incremental => {
                let store = match self.storage.load_or_empty(&self.encoder_signature) {
                    Err(StoreError::VersionMismatch(found, supported)) => {
                        log::warn!("index format {found} predates {supported}, rebuilding");
                        return Ok((IndexStore::new(&self.encoder_signature), BuildMode::Rebuild));
                    }
                    other => other?,
                };
                if store.encoder_signature() != self.encoder_signature {
                    log::warn!(
                        "index was built with different models ({} videos), rebuilding",
                        store.len()
                    );
                    return Ok((IndexStore::new(&self.encoder_signature), BuildMode::Rebuild));
                }
                Ok((store, BuildMode::Incremental))
            }
        }
    }

    fn run_workers(
        &self,
        processors: Vec<Box<dyn VideoProcessor>>,
        tasks: Vec<VideoTask>,
        store: &mut IndexStore,
        summary: &mut BuildSummary,
        dirty: &mut bool,
        progress: &mut dyn BuildProgress,
    ) -> Result<(), BuildError> {
        let queued = tasks.len();

        let (task_tx, task_rx) = mpsc::channel::<VideoTask>();
        for task in tasks {
            // Receiver is alive until the scope below ends
            let _ = task_tx.send(task);
        }
        drop(task_tx);
        let task_rx = Arc::new(Mutex::new(task_rx));

        let (result_tx, result_rx) = mpsc::channel::<(VideoTask, Result<ProcessedVideo, VideoFailure>)>();

        std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(processors.len());

            for (worker, mut processor) in processors.into_iter().enumerate() {
                let task_rx = task_rx.clone();
                let result_tx = result_tx.clone();
                let cancel = self.cancel.clone();

                handles.push(scope.spawn(move || {
                    let _span = tracing::debug_span!("worker", id = worker).entered();
                    loop {
                        if cancel.load(Ordering::Relaxed) {
                            log::debug!("cancelled, worker {worker} stopping");
                            break;
                        }

                        let next = match task_rx.lock() {
                            Ok(rx) => rx.recv(),
                            Err(_) => break,
                        };
                        let Ok(task) = next else {
                            break;
                        };

                        let outcome = processor.process(&task);
                        if result_tx.send((task, outcome)).is_err() {
                            break;
                        }
                    }
                }));
            }
            drop(result_tx);

            let mut received = 0usize;
            let mut pending = 0usize;
            let mut result = Ok(());

            for (task, outcome) in result_rx.iter() {
                received += 1;

                let failure = match outcome {
                    Ok(processed) => self.merge(store, processed).err(),
                    Err(failure) => Some(failure),
                };

                match &failure {
                    None => {
                        summary.succeeded += 1;
                        pending += 1;
                        *dirty = true;
                    }
                    Some(f) => {
                        log::warn!("{}: {} -> failed: {}", f.path.display(), f.stage, f.reason);
                    }
                }
                progress.video_finished(&task.path, failure.as_ref());
                if let Some(f) = failure {
                    summary.failed.push(f);
                }

                if pending >= self.options.batch_size.max(1) && result.is_ok() {
                    pending = 0;
                    if let Err(e) = self.persist(store, summary, progress) {
                        log::error!("persist failed, stopping workers: {e}");
                        self.cancel.store(true, Ordering::Relaxed);
                        result = Err(e);
                    } else {
                        *dirty = false;
                    }
                }
            }

            for handle in handles {
                if let Err(err) = handle.join() {
                    log::error!("worker panicked: {err:?}");
                }
            }

            summary.not_started = queued.saturating_sub(received);
            result
        })
    }

    fn merge(&self, store: &mut IndexStore, processed: ProcessedVideo) -> Result<(), VideoFailure> {
        let path = processed.record.path.clone();
        let id = processed.record.video_id;

        store
            .upsert(processed.record, &processed.visual, &processed.text)
            .map_err(|e| VideoFailure::new(&path, Stage::Extracted, e))?;

        log::debug!("{} [{}]: {} -> {}", path.display(), id, Stage::Extracted, Stage::Upserted);
        Ok(())
    }

    fn persist(
        &self,
        store: &mut IndexStore,
        summary: &mut BuildSummary,
        progress: &mut dyn BuildProgress,
    ) -> Result<(), BuildError> {
        self.storage.save(store)?;
        summary.persisted_batches += 1;
        log::info!(
            "persisted generation {} ({} videos)",
            store.generation(),
            store.len()
        );
        progress.persisted(store.generation(), store.len());
        Ok(())
    }
}

/// Recursively find video files under `root`.
///
/// Matches extensions case-insensitively, skips any directory named in
/// `skip_dirs`, and drops files whose content is recognisably not video.
/// Returns sorted absolute paths.
/// A file that vanished or became unreadable since discovery fails the
/// same way as one the decoder cannot open.
fn fingerprinted_task(path: PathBuf) -> Result<VideoTask, VideoFailure> {
    match Fingerprint::of(&path) {
        Ok(fingerprint) => Ok(VideoTask::new(path, fingerprint)),
        Err(e) => {
            let reason = SampleError::unreadable(&path, e.to_string());
            Err(VideoFailure::new(path, Stage::Discovered, reason))
        }
    }
}

pub fn discover(root: &Path, extensions: &[String], skip_dirs: &[String]) -> std::io::Result<Vec<PathBuf>> {
    let root = root.canonicalize()?;
    let extensions: Vec<String> = extensions
        .iter()
        .map(|e| e.trim_start_matches('.').to_lowercase())
        .collect();
    let skip_dirs: Vec<String> = skip_dirs.iter().map(|d| d.to_lowercase()).collect();

    let mut found = Vec::new();
    let mut pending = vec![root];

    while let Some(dir) = pending.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("cannot read {}: {}", dir.display(), e);
                continue;
            }
        };

        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let Ok(file_type) = entry.file_type() else {
                continue;
            };

            if file_type.is_dir() {
                let name = entry.file_name().to_string_lossy().to_lowercase();
                if skip_dirs.contains(&name) {
                    log::debug!("skipping directory {}", path.display());
                } else {
                    pending.push(path);
                }
                continue;
            }

            let has_video_extension = path
                .extension()
                .map(|ext| extensions.contains(&ext.to_string_lossy().to_lowercase()))
                .unwrap_or(false);
            if !has_video_extension || !path.is_file() {
                continue;
            }

            if let Ok(Some(kind)) = infer::get_from_path(&path) {
                if kind.matcher_type() != infer::MatcherType::Video {
                    log::debug!("{}: looks like {}, skipping", path.display(), kind.mime_type());
                    continue;
                }
            }

            found.push(path);
        }
    }

    found.sort();
    found.dedup();
    Ok(found)
}
