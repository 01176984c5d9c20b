use std::path::{Path, PathBuf};
use std::sync::Arc;

use ndarray_rand::rand::SeedableRng;
use ndarray_rand::rand::rngs::StdRng;

use crate::config::TrainingConfig;
use crate::dataset::Dataset;
use crate::error::{Error, Result};
use crate::network::{Mode, accuracy, backpropagate, cost, forward};
use crate::optim::Adam;
use crate::params::{DEFAULT_INIT_SEED, ParameterStore, Parameters};
use crate::scheduler::{Minibatch, MinibatchScheduler, batch_count, scheduler_for};

// Seed the minibatch shuffle starts from; it is bumped before every epoch.
pub const INITIAL_SHUFFLE_SEED: u64 = 3;
const DROPOUT_SEED: u64 = 0;

// Record the epoch cost every this many epochs.
pub const COST_RECORD_INTERVAL: usize = 5;
// Log the epoch cost every this many epochs.
pub const COST_LOG_INTERVAL: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingState {
    Initialized,
    // 1-based epoch currently being trained.
    Running { epoch: usize },
    Evaluating,
    Completed,
    Aborted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
    // `(epoch, mean cost)` for every recorded epoch (0-based epoch numbers).
    pub costs: Vec<(usize, f32)>,
    // Mean cost of the final epoch, if any epoch ran.
    pub last_epoch_cost: Option<f32>,
    pub epochs_run: usize,
    pub train_accuracy: f32,
    pub test_accuracy: f32,
}

impl TrainingReport {
    // Writes the recorded cost history as an `epoch,cost` CSV file for external plotting.
    pub fn write_cost_history(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(["epoch", "cost"])?;
        for (epoch, cost) in &self.costs {
            writer.write_record([epoch.to_string(), cost.to_string()])?;
        }
        writer.flush()?;
        Ok(())
    }
}

// Running cost of the epoch in progress.
struct EpochState {
    cost: f32,
    minibatches: usize,
    expected_minibatches: usize,
}

impl EpochState {
    fn new(expected_minibatches: usize) -> EpochState {
        EpochState {
            cost: 0.0,
            minibatches: 0,
            expected_minibatches,
        }
    }

    fn record(&mut self, minibatch_cost: f32) {
        self.cost += minibatch_cost / self.expected_minibatches as f32;
        self.minibatches += 1;
    }
}

// Everything one training run needs. A session is built, run once, and then
// either read for its parameters or dropped.
pub struct TrainingSession {
    config: TrainingConfig,
    store: ParameterStore,
    optimizer: Adam,
    scheduler: Box<dyn MinibatchScheduler>,
    dropout_rng: StdRng,
    seed: u64,
    state: TrainingState,
    checkpoint: Option<PathBuf>,
}

impl TrainingSession {
    // A session with freshly Xavier-initialized parameters for inputs of
    // `input_size` features.
    pub fn new(config: TrainingConfig, input_size: usize) -> Result<TrainingSession> {
        let store = ParameterStore::initialize(input_size, &config.layers, DEFAULT_INIT_SEED);
        TrainingSession::with_store(config, store)
    }

    pub fn with_parameters(config: TrainingConfig, parameters: Parameters) -> Result<TrainingSession> {
        TrainingSession::with_store(config, ParameterStore::new(parameters))
    }

    fn with_store(config: TrainingConfig, store: ParameterStore) -> Result<TrainingSession> {
        config.validate()?;
        let parameters = store.read();
        if parameters.layer_sizes() != config.layers {
            return Err(Error::InvalidConfig(format!(
                "parameters have layers {:?}, config asks for {:?}",
                parameters.layer_sizes(),
                config.layers
            )));
        }

        Ok(TrainingSession {
            scheduler: scheduler_for(&config),
            optimizer: Adam::new(config.learning_rate),
            store,
            dropout_rng: StdRng::seed_from_u64(DROPOUT_SEED),
            seed: INITIAL_SHUFFLE_SEED,
            state: TrainingState::Initialized,
            checkpoint: None,
            config,
        })
    }

    // Replaces the scheduler picked from the configuration.
    pub fn with_scheduler(mut self, scheduler: Box<dyn MinibatchScheduler>) -> TrainingSession {
        self.scheduler = scheduler;
        self
    }

    // Where to write the parameters once training completes.
    pub fn with_checkpoint(mut self, path: impl Into<PathBuf>) -> TrainingSession {
        self.checkpoint = Some(path.into());
        self
    }

    pub fn state(&self) -> TrainingState {
        self.state
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn parameters(&self) -> &Parameters {
        self.store.read()
    }

    pub fn into_parameters(self) -> Parameters {
        self.store.into_parameters()
    }

    // Trains for the configured number of epochs, evaluates on both sets and
    // writes the checkpoint, if one was requested.
    pub fn run(&mut self, train: &Arc<Dataset>, test: &Dataset) -> Result<TrainingReport> {
        if self.state != TrainingState::Initialized {
            return Err(Error::InvalidConfig(format!(
                "a training session runs once, this one is {:?}",
                self.state
            )));
        }
        self.check_shapes("training set", train)?;
        self.check_shapes("test set", test)?;

        tracing::info!(
            batch_method = ?self.config.batch_method,
            learning_rate = self.config.learning_rate,
            batch_size = self.config.batch_size,
            keep_prob = self.config.keep_prob,
            epochs = self.config.epochs,
            examples = train.len(),
            "training started"
        );

        let (costs, last_epoch_cost) = match self.train_epochs(train) {
            Ok(history) => history,
            Err(err) => {
                self.state = TrainingState::Aborted;
                return Err(err);
            }
        };

        self.state = TrainingState::Evaluating;
        let parameters = self.store.read();
        let train_accuracy = accuracy(parameters, train);
        let test_accuracy = accuracy(parameters, test);
        tracing::info!(train_accuracy, test_accuracy, "parameters have been trained");

        if let Some(path) = &self.checkpoint {
            if let Err(err) = self.store.save(path) {
                self.state = TrainingState::Aborted;
                return Err(err);
            }
        }
        self.state = TrainingState::Completed;

        Ok(TrainingReport {
            costs,
            last_epoch_cost,
            epochs_run: self.config.epochs,
            train_accuracy,
            test_accuracy,
        })
    }

    fn check_shapes(&self, name: &str, dataset: &Dataset) -> Result<()> {
        let parameters = self.store.read();
        let expected = [parameters.input_size(), parameters.output_size()];
        let got = [dataset.feature_count(), dataset.class_count()];
        if expected != got {
            return Err(Error::ShapeMismatch {
                name: format!("{name} (features, classes)"),
                expected: expected.to_vec(),
                got: got.to_vec(),
            });
        }
        Ok(())
    }

    fn train_epochs(&mut self, train: &Arc<Dataset>) -> Result<(Vec<(usize, f32)>, Option<f32>)> {
        let batch_size = self.config.batch_size;
        let num_minibatches = batch_count(train.len(), batch_size);
        let mut costs = Vec::new();
        let mut last_epoch_cost = None;

        for epoch in 0..self.config.epochs {
            self.state = TrainingState::Running { epoch: epoch + 1 };
            self.seed += 1;

            let mut epoch_state = EpochState::new(num_minibatches);
            let mut minibatches = self.scheduler.generate(train, batch_size, self.seed)?;
            let mut diverged = None;
            for minibatch in &mut minibatches {
                let minibatch_cost = self.step(&minibatch);
                if !minibatch_cost.is_finite() {
                    diverged = Some(minibatch_cost);
                    break;
                }
                epoch_state.record(minibatch_cost);
            }
            // Producers are always joined before the epoch ends, also when it is about to abort.
            minibatches.finish()?;

            if let Some(cost) = diverged {
                tracing::warn!(epoch, cost, "cost diverged, aborting training");
                return Err(Error::Diverged { epoch, cost });
            }

            tracing::debug!(
                epoch,
                minibatches = epoch_state.minibatches,
                cost = epoch_state.cost,
                "epoch finished"
            );
            if epoch % COST_LOG_INTERVAL == 0 {
                tracing::info!("Cost after epoch {epoch}: {:.6}", epoch_state.cost);
            }
            if epoch % COST_RECORD_INTERVAL == 0 {
                costs.push((epoch, epoch_state.cost));
            }
            last_epoch_cost = Some(epoch_state.cost);
        }

        Ok((costs, last_epoch_cost))
    }

    // One forward + backward + Adam update on a single minibatch. Returns the minibatch cost.
    fn step(&mut self, minibatch: &Minibatch) -> f32 {
        let parameters = self.store.read();
        let pass = forward(
            parameters,
            &minibatch.inputs,
            Mode::Train {
                keep_prob: self.config.keep_prob,
                rng: &mut self.dropout_rng,
            },
        );
        let minibatch_cost = cost(pass.logits(), &minibatch.labels);
        let gradients = backpropagate(parameters, &pass, &minibatch.labels);
        self.store.apply_update(&gradients, &mut self.optimizer);
        minibatch_cost
    }
}
