use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Index every video under a directory.
    Preprocess {
        /// Directory scanned recursively for videos
        #[clap(short, long)]
        videos_dir: PathBuf,

        /// Index directory; holds config.yaml and the index files
        #[clap(short, long)]
        out_dir: PathBuf,

        /// Parallel workers (1-3). Overrides config.
        #[clap(short, long)]
        workers: Option<usize>,

        /// Frame budget per video. Overrides config.
        #[clap(short, long)]
        max_frames: Option<usize>,

        /// Discard the existing index and process every video again
        #[clap(long, default_value = "false")]
        force_rebuild: bool,

        /// Wait for another build on the same index instead of failing
        #[clap(long, default_value = "false")]
        wait: bool,
    },

    /// Search an index with a natural-language query.
    Search {
        /// Index directory
        #[clap(short, long)]
        out_dir: PathBuf,

        #[clap(short, long, allow_hyphen_values = true)]
        query: String,

        /// Number of results
        #[clap(short = 'k', long, default_value = "10")]
        top_k: usize,

        /// Weight of the visual modality. Overrides config.
        #[clap(long)]
        clip_weight: Option<f32>,

        /// Weight of the caption modality. Overrides config.
        #[clap(long)]
        text_weight: Option<f32>,

        /// Weight of the keyword modality. Overrides config.
        #[clap(long)]
        tfidf_weight: Option<f32>,

        /// Only return videos under this directory
        #[clap(short, long)]
        directory: Option<PathBuf>,
    },

    /// Print index statistics.
    Stats {
        /// Index directory
        #[clap(short, long)]
        out_dir: PathBuf,
    },
}
