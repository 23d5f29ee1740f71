//! Command-line interface for live-nx-iree.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Drive a native IREE engine from the command line.
#[derive(Parser, Debug)]
#[command(name = "live-nx-iree")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Engine and configuration locations shared by every subcommand.
#[derive(Args, Debug)]
pub struct EngineArgs {
    /// Path to the engine shared library.
    ///
    /// Overrides `engine.library_path` from the config file.
    #[arg(short, long)]
    pub library: Option<PathBuf>,

    /// Path to optional YAML config file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List the devices the engine can create.
    Devices {
        #[command(flatten)]
        engine: EngineArgs,

        /// Only list devices of this driver (e.g. local-sync, cuda).
        #[arg(long)]
        driver: Option<String>,
    },

    /// Run a function once on tensor inputs.
    Call {
        #[command(flatten)]
        engine: EngineArgs,

        /// Path to the base64-encoded bytecode.
        #[arg(short, long)]
        bytecode: PathBuf,

        /// Device URI. Overrides `device.uri`.
        #[arg(short, long)]
        device: Option<String>,

        /// Path to a JSON list of `{ "type", "shape", "data" }` inputs.
        #[arg(short, long, conflicts_with = "encoded")]
        input: Option<PathBuf>,

        /// Pre-encoded base64 input. Repeat for each input.
        #[arg(short, long)]
        encoded: Vec<String>,

        /// Number of outputs. Overrides `invocation.num_outputs`.
        #[arg(short, long)]
        num_outputs: Option<usize>,

        /// Function signature, logged with the call.
        #[arg(short, long)]
        signature: Option<String>,

        /// Output format (json, pretty).
        #[arg(short, long, default_value = "json")]
        format: String,
    },

    /// Run the image entry point once on a PNG.
    Image {
        #[command(flatten)]
        engine: EngineArgs,

        /// Path to the base64-encoded bytecode.
        #[arg(short, long)]
        bytecode: PathBuf,

        /// Device URI. Overrides `device.uri`.
        #[arg(short, long)]
        device: Option<String>,

        /// Input image.
        #[arg(short, long)]
        input: PathBuf,

        /// Where to write the output PNG.
        #[arg(short, long)]
        output: PathBuf,

        /// Target width. Overrides `capture.width`.
        #[arg(long)]
        width: Option<u32>,

        /// Target height. Overrides `capture.height`.
        #[arg(long)]
        height: Option<u32>,

        /// Noise seed. Random when unset.
        #[arg(long)]
        seed: Option<u32>,

        /// Noise amount in [0, 1].
        #[arg(long)]
        noise: Option<f32>,
    },

    /// Run the capture loop over a directory of PNG frames.
    Capture {
        #[command(flatten)]
        engine: EngineArgs,

        /// Path to the base64-encoded bytecode.
        #[arg(short, long)]
        bytecode: PathBuf,

        /// Device URI. Overrides `device.uri`.
        #[arg(short, long)]
        device: Option<String>,

        /// Directory of PNG frames, replayed in name order.
        #[arg(long)]
        frames: PathBuf,

        /// Directory the published frames are written to.
        #[arg(short, long)]
        output_dir: PathBuf,

        /// Stop after this many published frames.
        #[arg(short = 'n', long, default_value_t = 10)]
        count: usize,

        /// Tick interval in milliseconds. Overrides `capture.tick_interval_ms`.
        #[arg(long)]
        interval_ms: Option<u64>,

        /// Noise amount in [0, 1]. Overrides `capture.noise_amount`.
        #[arg(long)]
        noise: Option<f32>,

        /// Fixed noise seed. Overrides `capture.seed`.
        #[arg(long)]
        seed: Option<u32>,
    },
}

impl Cli {
    /// Parse command line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
