use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use chrono::Local;
use clap::Parser;
use fashion_mnist_playground::config::{CLASSES, ConfigSnapshot};
use fashion_mnist_playground::dataset::{load_csv, load_pixel_row};
use fashion_mnist_playground::{
    BatchMethod, LayerSizes, ParameterStore, Result, TrainingConfig, TrainingSession, predict,
};
use tracing_subscriber::EnvFilter;

/// Train a four-layer Fashion-MNIST classifier, or classify a single image.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// How each epoch is cut into minibatches.
    #[arg(long, value_enum, default_value_t = BatchMethod::Experimental)]
    batch_method: BatchMethod,

    #[arg(long, default_value_t = 0.001)]
    learning_rate: f32,

    #[arg(long, default_value_t = 32)]
    batch_size: usize,

    /// Probability of keeping a hidden unit during training.
    #[arg(long, default_value_t = 0.8)]
    keep_prob: f32,

    /// Number of epochs.
    #[arg(long = "epoch", default_value_t = 1500)]
    epochs: usize,

    /// Producer threads for the queue batch method.
    #[arg(long, default_value_t = 2)]
    thread_count: usize,

    /// Bounded queue capacity for the queue batch method.
    #[arg(long, default_value_t = 100)]
    queue_capacity: usize,

    #[arg(long, default_value_t = 50)]
    l1: usize,
    #[arg(long, default_value_t = 25)]
    l2: usize,
    #[arg(long, default_value_t = 12)]
    l3: usize,
    #[arg(long, default_value_t = CLASSES)]
    l4: usize,

    /// Training CSV (label followed by 784 pixels per row). `.gz` is decompressed.
    #[arg(long, default_value = "dataset/fashion-mnist_train.csv")]
    train_csv: PathBuf,

    #[arg(long, default_value = "dataset/fashion-mnist_test.csv")]
    test_csv: PathBuf,

    /// Where trained parameters are written, and read from when predicting.
    #[arg(long, default_value = "parameters.json")]
    parameters: PathBuf,

    /// Directory for timestamped hyperparameter snapshots.
    #[arg(long, default_value = "hyperparameters")]
    hyperparameters_dir: PathBuf,

    /// Write the recorded `(epoch, cost)` history here as CSV.
    #[arg(long)]
    cost_history: Option<PathBuf>,

    /// Classify the 784 pixel values in this file with saved parameters instead of training.
    #[arg(long, value_name = "PATH")]
    predict_image_class: Option<PathBuf>,
}

impl Cli {
    fn training_config(&self) -> TrainingConfig {
        TrainingConfig {
            batch_method: self.batch_method,
            learning_rate: self.learning_rate,
            batch_size: self.batch_size,
            keep_prob: self.keep_prob,
            epochs: self.epochs,
            thread_count: self.thread_count,
            queue_capacity: self.queue_capacity,
            layers: LayerSizes {
                l1: self.l1,
                l2: self.l2,
                l3: self.l3,
                l4: self.l4,
            },
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let outcome = match &cli.predict_image_class {
        Some(image) => classify(image, &cli.parameters),
        None => train(&cli),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn classify(image: &Path, parameters: &Path) -> Result<()> {
    let parameters = ParameterStore::load(parameters)?;
    let pixels = load_pixel_row(image)?;
    let prediction = predict(pixels.view(), &parameters)?;
    tracing::info!(
        class = prediction.class,
        scores = ?prediction.scores.to_vec(),
        "classified {}",
        image.display()
    );
    println!("{}", prediction.class);
    Ok(())
}

fn train(cli: &Cli) -> Result<()> {
    let config = cli.training_config();
    config.validate()?;

    let now = Local::now();
    let snapshot = ConfigSnapshot::new(&config, now).write_to(&cli.hyperparameters_dir, now)?;
    tracing::info!("hyperparameters written to {}", snapshot.display());

    let train = Arc::new(load_csv(&cli.train_csv, CLASSES)?);
    let test = load_csv(&cli.test_csv, CLASSES)?;

    let mut session =
        TrainingSession::new(config, train.feature_count())?.with_checkpoint(&cli.parameters);
    let report = session.run(&train, &test)?;

    tracing::info!(
        train_accuracy = report.train_accuracy,
        test_accuracy = report.test_accuracy,
        "training complete after {} epochs",
        report.epochs_run
    );

    if let Some(path) = &cli.cost_history {
        report.write_cost_history(path)?;
    }
    Ok(())
}
