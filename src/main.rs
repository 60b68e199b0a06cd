//! CLI entry point for slnet-rs.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use slnet_rs::{EnsembleTrainer, Result, SlnetConfig, SlnetError};

#[derive(Parser)]
#[command(name = "slnet")]
#[command(about = "Ensemble trainer for sparse + low-rank decomposition of microscopy volumes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: String,
    },
    /// Start or resume training
    Train {
        /// Path to configuration file
        #[arg(long, conflicts_with = "preset")]
        config: Option<String>,
        /// Start from a preset instead of a file
        #[arg(long)]
        preset: Option<String>,
        /// Resume from a checkpoint directory (model_N) or its checkpoint.json
        #[arg(long)]
        checkpoint: Option<PathBuf>,
        /// Override training.max_epochs
        #[arg(long)]
        max_epochs: Option<usize>,
        /// Override training.learning_rate
        #[arg(long)]
        learning_rate: Option<f64>,
        /// Override training.batch_size
        #[arg(long)]
        batch_size: Option<usize>,
        /// Override preprocessing.dark_current
        #[arg(long)]
        dark_current: Option<f64>,
        /// Override preprocessing.dark_current_sparse
        #[arg(long)]
        dark_current_sparse: Option<f64>,
        /// Override data.images_to_use (comma separated)
        #[arg(long, value_delimiter = ',')]
        images_to_use: Option<Vec<usize>>,
        /// Override data.test_path
        #[arg(long)]
        test_data: Option<PathBuf>,
        /// Override output_dir
        #[arg(long)]
        output_dir: Option<String>,
    },
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "config.yaml")]
        output: String,
        /// Preset (xlfm-fish, synthetic-small)
        #[arg(long, default_value = "xlfm-fish")]
        preset: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config);
            let config = SlnetConfig::from_file(&config)?;
            config.validate()?;
            println!("✓ Configuration is valid");
            println!("  Data: {:?} {}", config.data.source, config.data.path.display());
            println!("  Rank budget: {}", config.decomposition.rank);
            println!("  Epochs: {}", config.training.max_epochs);
        }
        Commands::Train {
            config,
            preset,
            checkpoint,
            max_epochs,
            learning_rate,
            batch_size,
            dark_current,
            dark_current_sparse,
            images_to_use,
            test_data,
            output_dir,
        } => {
            let mut config = match (config, preset) {
                (Some(path), _) => {
                    tracing::info!("Starting training with config: {}", path);
                    SlnetConfig::from_file(&path)?
                }
                (None, Some(preset)) => SlnetConfig::from_preset(&preset)?,
                (None, None) => {
                    return Err(SlnetError::Config(
                        "either --config or --preset is required".into(),
                    ))
                }
            };
            if let Some(v) = max_epochs {
                config.training.max_epochs = v;
            }
            if let Some(v) = learning_rate {
                config.training.learning_rate = v;
            }
            if let Some(v) = batch_size {
                config.training.batch_size = v;
            }
            if let Some(v) = dark_current {
                config.preprocessing.dark_current = v;
            }
            if let Some(v) = dark_current_sparse {
                config.preprocessing.dark_current_sparse = v;
            }
            if let Some(v) = images_to_use {
                config.data.images_to_use = v;
            }
            if test_data.is_some() {
                config.data.test_path = test_data;
            }
            if let Some(v) = output_dir {
                config.output_dir = v;
            }
            config.validate()?;

            let mut trainer = match checkpoint {
                Some(path) => EnsembleTrainer::resume(config, &path)?,
                None => EnsembleTrainer::new(config)?,
            };
            trainer.train()?;
            println!("✓ Run written to: {}", trainer.run_dir().display());
        }
        Commands::Init { output, preset } => {
            tracing::info!("Generating config for preset: {}", preset);
            let config = SlnetConfig::from_preset(&preset)?;
            config.to_file(&output)?;
            println!("✓ Configuration written to: {output}");
        }
    }

    Ok(())
}
