// src/runtime_interface.rs

use clap::{Parser, Subcommand};
use std::error::Error;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use log::info;

use crate::brain::Brain;
use crate::config::{GenerationConfig, NetConfig};
use crate::corpus::{self, TrainingOptions, TrainingProgress};
use crate::error::NetError;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Train, query and maintain a growing character-level brain", long_about = None)]
pub struct CliArgs {
    /// Snapshot file of the brain to operate on.
    #[clap(long, value_parser, default_value = "brain.safetensors")]
    pub brain: PathBuf,

    /// Optional JSON file with network hyperparameters.
    #[clap(long, value_parser)]
    pub config: Option<PathBuf>,

    #[clap(long, short, action)]
    pub verbose: bool,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Learn from a text file or from every .txt file in a folder.
    Train {
        #[clap(value_parser)]
        input: PathBuf,
        #[clap(long, value_parser, default_value_t = 5)]
        epochs: usize,
        #[clap(long, value_parser, default_value_t = corpus::DEFAULT_BLOCK_CHARS)]
        block_chars: usize,
        #[clap(long, value_parser, default_value_t = 100)]
        checkpoint_every: usize,
    },
    /// Learn a single line of text.
    Learn {
        #[clap(value_parser)]
        text: String,
        #[clap(long, value_parser, default_value_t = 1)]
        epochs: usize,
        #[clap(long, value_parser)]
        learning_rate: Option<f32>,
    },
    /// Continue a seed text.
    Generate {
        #[clap(value_parser)]
        seed: String,
        #[clap(long, value_parser, default_value_t = 80)]
        max_length: usize,
        #[clap(long, value_parser, default_value_t = 0.8)]
        temperature: f32,
        #[clap(long, value_parser, default_value_t = 0.9)]
        top_p: f32,
        #[clap(long, value_parser, default_value_t = 1.2)]
        repetition_penalty: f32,
    },
    /// Mean probability the brain assigns to each next character of a text.
    Score {
        #[clap(value_parser)]
        text: String,
    },
    /// Prune, reinforce and decay.
    Sleep {
        #[clap(long, value_parser, default_value_t = 0.01)]
        prune: f32,
        #[clap(long, value_parser, default_value_t = 1.1)]
        factor: f32,
    },
    /// Reinforce and decay lightly, without pruning.
    Siesta {
        #[clap(long, value_parser, default_value_t = 1.05)]
        factor: f32,
    },
    /// Print brain statistics as JSON.
    Info,
    /// Replace the brain with an external snapshot.
    Import {
        #[clap(value_parser)]
        source: PathBuf,
    },
}

#[derive(Debug)]
enum RuntimeError {
    Net(NetError),
    Json(serde_json::Error),
    Message(String),
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeError::Net(e) => write!(f, "Brain error: {}", e),
            RuntimeError::Json(e) => write!(f, "JSON error: {}", e),
            RuntimeError::Message(s) => write!(f, "Runtime error: {}", s),
        }
    }
}

impl Error for RuntimeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RuntimeError::Net(e) => Some(e),
            RuntimeError::Json(e) => Some(e),
            RuntimeError::Message(_) => None,
        }
    }
}

impl From<NetError> for RuntimeError {
    fn from(err: NetError) -> Self {
        RuntimeError::Net(err)
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(err: serde_json::Error) -> Self {
        RuntimeError::Json(err)
    }
}

pub fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

fn brain_name(path: &std::path::Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("brain")
        .to_string()
}

fn print_progress(progress: &TrainingProgress) {
    if progress.blocks_done % 10 == 0 || progress.blocks_done == progress.blocks_total {
        let source = progress
            .source
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "text".to_string());
        eprintln!(
            "{}: {}/{} blocks, {} characters",
            source, progress.blocks_done, progress.blocks_total, progress.characters_done
        );
    }
}

pub fn run(args: CliArgs) -> Result<(), Box<dyn Error>> {
    let config = match &args.config {
        Some(path) => NetConfig::load(path).map_err(RuntimeError::from)?,
        None => NetConfig::default(),
    };
    let brain = Brain::open_or_create(&brain_name(&args.brain), &args.brain, &config);

    match args.command {
        Command::Train {
            input,
            epochs,
            block_chars,
            checkpoint_every,
        } => {
            let options = TrainingOptions {
                epochs,
                block_chars,
                checkpoint_every,
            };
            let stop = AtomicBool::new(false);
            let summary = if input.is_dir() {
                corpus::train_folder(&[&brain], &input, &options, &stop, print_progress)
            } else {
                let bytes = std::fs::read(&input).map_err(|e| RuntimeError::Net(e.into()))?;
                let text = String::from_utf8_lossy(&bytes);
                corpus::train_text(&[&brain], &text, &options, &stop, print_progress)
            }
            .map_err(RuntimeError::from)?;
            info!(
                "trained on {} blocks ({} characters) from {} file(s)",
                summary.blocks, summary.characters, summary.files
            );
            println!("{}", serde_json::to_string_pretty(&brain.stats()).map_err(RuntimeError::from)?);
        }
        Command::Learn {
            text,
            epochs,
            learning_rate,
        } => {
            let loss = brain.learn(&text, epochs, learning_rate);
            brain.save().map_err(RuntimeError::from)?;
            match loss {
                Some(loss) => println!("loss: {:.4}", loss),
                None => println!("nothing to learn from {:?}", text),
            }
        }
        Command::Generate {
            seed,
            max_length,
            temperature,
            top_p,
            repetition_penalty,
        } => {
            if max_length == 0 {
                return Err(Box::new(RuntimeError::Message(
                    "max_length must be at least 1".to_string(),
                )));
            }
            let generation = GenerationConfig {
                max_length,
                temperature,
                top_p,
                repetition_penalty,
            };
            println!("{}{}", seed, brain.generate(&seed, &generation));
        }
        Command::Score { text } => {
            println!("{:.4}", brain.confidence(&text));
        }
        Command::Sleep { prune, factor } => {
            let report = brain.sleep(prune, factor);
            brain.save().map_err(RuntimeError::from)?;
            println!("{}", serde_json::to_string_pretty(&report).map_err(RuntimeError::from)?);
        }
        Command::Siesta { factor } => {
            let report = brain.rest_lightly(factor);
            brain.save().map_err(RuntimeError::from)?;
            println!("{}", serde_json::to_string_pretty(&report).map_err(RuntimeError::from)?);
        }
        Command::Info => {
            println!("{}", serde_json::to_string_pretty(&brain.stats()).map_err(RuntimeError::from)?);
            if let Some(bytes) = brain.snapshot_size_bytes() {
                println!("snapshot size: {:.2} MB", bytes as f64 / (1024.0 * 1024.0));
            }
        }
        Command::Import { source } => {
            let hidden = brain.replace_from(&source).map_err(RuntimeError::from)?;
            println!("imported {} (hidden size {})", source.display(), hidden);
        }
    }
    Ok(())
}

pub fn run_cli() -> Result<(), Box<dyn Error>> {
    let args = CliArgs::parse();
    init_tracing(args.verbose);
    run(args)
}
