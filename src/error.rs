use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("dataset is empty")]
    EmptyDataset,

    #[error("feature matrix holds {features} examples but label matrix holds {labels}")]
    ExampleCountMismatch { features: usize, labels: usize },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("shape mismatch for {name}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("malformed tensor {name}: {reason}")]
    MalformedTensor { name: String, reason: String },

    #[error("cost diverged at epoch {epoch}: {cost}")]
    Diverged { epoch: usize, cost: f32 },

    #[error("failed to spawn producer thread: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    #[error("{0} producer thread(s) panicked before joining")]
    WorkerJoin(usize),

    #[error("{}:{line}: {reason}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

pub type Result<T> = std::result::Result<T, Error>;
