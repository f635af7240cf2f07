use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod builder;
mod cli;
mod config;
mod extract;
mod fusion;
mod index;
mod lock;
mod models;
mod pipeline;
mod query;
mod sampler;
mod search;
#[cfg(test)]
mod tests;
mod video;

use builder::{BuildError, BuildMode, BuildOptions, BuildProgress, BuildSummary, IndexBuilder};
use config::Config;
use extract::FeatureExtractor;
use fusion::FusionWeights;
use index::{IndexStorage, StoreStats};
use lock::FileLock;
use models::{EncoderSet, QueryEncoders};
use pipeline::{Pipeline, VideoFailure, VideoProcessor};
use query::{QueryProcessor, Thesaurus};
use sampler::FrameSampler;
use search::{SearchHit, SearchRequest, SearchService};
use video::{FfmpegSource, VideoSource};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = cli::Args::parse();

    match args.command {
        cli::Command::Preprocess {
            videos_dir,
            out_dir,
            workers,
            max_frames,
            force_rebuild,
            wait,
        } => {
            let summary = preprocess(&videos_dir, &out_dir, workers, max_frames, force_rebuild, wait)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }

        cli::Command::Search {
            out_dir,
            query,
            top_k,
            clip_weight,
            text_weight,
            tfidf_weight,
            directory,
        } => {
            let weights = [clip_weight, text_weight, tfidf_weight];
            let hits = search(&out_dir, query, top_k, weights, directory)?;
            println!("{}", serde_json::to_string_pretty(&hits)?);
        }

        cli::Command::Stats { out_dir } => {
            let stats = stats(&out_dir)?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}

fn preprocess(
    videos_dir: &Path,
    out_dir: &Path,
    workers: Option<usize>,
    max_frames: Option<usize>,
    force_rebuild: bool,
    wait: bool,
) -> anyhow::Result<BuildSummary> {
    let mut config = Config::load_with(out_dir)?;
    if let Some(workers) = workers {
        config.workers = workers;
    }
    if let Some(max_frames) = max_frames {
        if max_frames == 0 {
            bail!("--max-frames must be greater than 0");
        }
        config.max_frames = max_frames;
    }

    let _lock = if wait {
        FileLock::acquire_blocking(out_dir)
    } else {
        FileLock::try_acquire(out_dir)
    }
    .with_context(|| format!("cannot lock {}", out_dir.display()))?;

    let options = BuildOptions {
        mode: if force_rebuild {
            BuildMode::Rebuild
        } else {
            BuildMode::Incremental
        },
        workers: config.workers,
        batch_size: config.batch_size,
        video_extensions: config.video_extensions.clone(),
        skip_dirs: config.skip_dirs.clone(),
    };
    let signature = models::encoder_signature(&config.models);
    let builder = IndexBuilder::new(IndexStorage::new(out_dir), options, signature);

    let cancel = builder.cancel_flag();
    ctrlc::set_handler(move || {
        log::warn!("interrupted, finishing videos in progress");
        cancel.store(true, Ordering::Relaxed);
    })
    .context("failed to set Ctrl-C handler")?;

    let source: Arc<dyn VideoSource> = Arc::new(FfmpegSource::new(config.frame_edge));
    let make_processor = |worker: usize| -> anyhow::Result<Box<dyn VideoProcessor>> {
        log::info!("worker {worker}: loading models");
        let encoders = EncoderSet::load(&config.models)
            .with_context(|| format!("failed to load models for worker {worker}"))?;
        let extractor = FeatureExtractor::new(
            Box::new(encoders.visual),
            Box::new(encoders.captioner),
            Box::new(encoders.text),
            config.frame_batch_size,
        );
        Ok(Box::new(Pipeline::new(
            source.clone(),
            FrameSampler::new(config.max_frames),
            extractor,
        )))
    };

    let mut progress = ProgressReporter::default();
    let result = builder.build(videos_dir, make_processor, &mut progress);
    progress.finish();

    match result {
        Ok(summary) => Ok(summary),
        Err(BuildError::NoVideosIndexed { discovered, failed }) => {
            for failure in &failed {
                log::error!("{}: {}: {}", failure.path.display(), failure.stage, failure.reason);
            }
            Err(BuildError::NoVideosIndexed { discovered, failed }.into())
        }
        Err(e) => Err(e.into()),
    }
}

fn search(
    out_dir: &Path,
    query: String,
    top_k: usize,
    [clip, text, tfidf]: [Option<f32>; 3],
    directory: Option<PathBuf>,
) -> anyhow::Result<Vec<SearchHit>> {
    let config = Config::load_existing(out_dir)?;

    let storage = IndexStorage::new(out_dir);
    if !storage.exists() {
        bail!("no index in {}, run preprocess first", out_dir.display());
    }
    let store = storage
        .load()
        .with_context(|| format!("failed to load index from {}", out_dir.display()))?;

    if store.encoder_signature() != models::encoder_signature(&config.models) {
        log::warn!("index was built with different models than configured; rerun preprocess");
    }

    let weights = FusionWeights {
        clip: clip.unwrap_or(config.weights.clip),
        text: text.unwrap_or(config.weights.text),
        tfidf: tfidf.unwrap_or(config.weights.tfidf),
    };
    for value in [weights.clip, weights.text, weights.tfidf] {
        if !value.is_finite() || value < 0.0 {
            bail!("weights must be non-negative numbers, got {value}");
        }
    }

    let encoders = QueryEncoders::load(&config.models).context("failed to load query models")?;
    let processor = QueryProcessor::new(
        Box::new(Thesaurus::with_overrides(&config.expansion.synonyms)),
        Box::new(encoders.text),
        Some(Box::new(encoders.joint)),
        config.expansion.settings(),
    );
    let service = SearchService::new(Arc::new(store), processor, config.candidate_pool);

    let mut request = SearchRequest::new(query, top_k);
    request.weights = weights;
    request.directory = directory;

    if let Some(dir) = &request.directory {
        log::info!(
            "{} of {} indexed videos under {}",
            service.video_count_under(dir),
            service.store().len(),
            dir.display()
        );
    }

    Ok(service.search(&request))
}

fn stats(out_dir: &Path) -> anyhow::Result<StoreStats> {
    let config = Config::load_existing(out_dir)?;
    let store = IndexStorage::new(out_dir)
        .load_or_empty(&models::encoder_signature(&config.models))
        .with_context(|| format!("failed to load index from {}", out_dir.display()))?;
    Ok(store.stats())
}

/// Progress bar on stderr fed by the builder.
#[derive(Default)]
struct ProgressReporter {
    bar: Option<ProgressBar>,
}

impl ProgressReporter {
    fn finish(&self) {
        if let Some(bar) = &self.bar {
            bar.finish_and_clear();
        }
    }
}

impl BuildProgress for ProgressReporter {
    fn started(&mut self, queued: usize, skipped: usize) {
        if queued == 0 {
            return;
        }

        let bar = ProgressBar::new(queued as u64);
        if let Ok(style) =
            ProgressStyle::default_bar().template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            bar.set_style(style.progress_chars("#>-"));
        }
        if skipped > 0 {
            bar.println(format!("{skipped} videos unchanged"));
        }
        self.bar = Some(bar);
    }

    fn video_finished(&mut self, path: &Path, failure: Option<&VideoFailure>) {
        let Some(bar) = &self.bar else {
            return;
        };
        bar.inc(1);

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        match failure {
            Some(f) => bar.println(format!("failed {name}: {}", f.reason)),
            None => bar.set_message(name),
        }
    }

    fn persisted(&mut self, generation: u64, videos: usize) {
        if let Some(bar) = &self.bar {
            bar.set_message(format!("saved generation {generation} ({videos} videos)"));
        }
    }
}
