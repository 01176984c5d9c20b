// Fashion-MNIST classifier training with interchangeable minibatch schedulers.
//
// A four-layer fully-connected network (ReLU hidden layers, dropout while
// training, softmax cross-entropy, Adam) is trained on 28x28 grayscale images
// of ten clothing classes. Each epoch's minibatches come from one of three
// `MinibatchScheduler`s, one of which streams examples through a bounded
// queue filled by producer threads. Trained parameters are written as JSON and
// reused by `predict`.

pub mod config;
pub mod dataset;
pub mod error;
pub mod network;
pub mod optim;
pub mod params;
pub mod predict;
pub mod queue;
pub mod scheduler;
pub mod trainer;

pub use config::{BatchMethod, ConfigSnapshot, LayerSizes, TrainingConfig};
pub use dataset::Dataset;
pub use error::{Error, Result};
pub use params::{ParameterDocument, ParameterStore, Parameters};
pub use predict::{Prediction, predict};
pub use queue::{BoundedQueue, QueueScheduler};
pub use scheduler::{BasicScheduler, Epoch, ExperimentalScheduler, Minibatch, MinibatchScheduler};
pub use trainer::{TrainingReport, TrainingSession, TrainingState};
