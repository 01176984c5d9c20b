// Cutting a training set into shuffled minibatches, once per epoch.
//
// Three interchangeable policies implement `MinibatchScheduler`:
//
// - `BasicScheduler`: shuffle with the epoch seed, emit every complete batch
//   and then the short remainder, if any.
// - `ExperimentalScheduler`: the same shuffle, partitioned by chunking the
//   permutation. It yields exactly the same batches as `Basic`.
// - `QueueScheduler`: producer threads push
//   single examples through a bounded queue that the training loop drains.
//
// The first two compute the whole epoch up front and are fully determined by
// the seed. The queue policy streams, and only the set of examples per epoch
// is fixed; their interleaving across producers is not.

use std::sync::Arc;

use itertools::Itertools;
use ndarray::Array2;
use ndarray_rand::rand::SeedableRng;
use ndarray_rand::rand::rngs::StdRng;
use ndarray_rand::rand::seq::SliceRandom;

use crate::config::{BatchMethod, TrainingConfig};
use crate::dataset::Dataset;
use crate::error::{Error, Result};
use crate::queue::{QueueEpoch, QueueScheduler};

// One optimizer step's worth of examples.
#[derive(Debug, Clone, PartialEq)]
pub struct Minibatch {
    // [features x len] inputs.
    pub inputs: Array2<f32>,
    // [classes x len] one-hot labels.
    pub labels: Array2<f32>,
    // Position of each column in the unshuffled dataset.
    pub indices: Vec<usize>,
}

impl Minibatch {
    pub fn from_indices(dataset: &Dataset, indices: Vec<usize>) -> Minibatch {
        let (inputs, labels) = dataset.columns(&indices);
        Minibatch {
            inputs,
            labels,
            indices,
        }
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

pub trait MinibatchScheduler: Send {
    // Starts a fresh epoch over `dataset`.
    fn generate(&self, dataset: &Arc<Dataset>, batch_size: usize, seed: u64) -> Result<Epoch>;
}

// The minibatches of one epoch, in the order they should be trained on.
pub enum Epoch {
    Prepared(std::vec::IntoIter<Minibatch>),
    Queued(QueueEpoch),
}

impl Iterator for Epoch {
    type Item = Minibatch;

    fn next(&mut self) -> Option<Minibatch> {
        match self {
            Epoch::Prepared(batches) => batches.next(),
            Epoch::Queued(queue) => queue.next(),
        }
    }
}

impl Epoch {
    // Ends the epoch. For the queue policy this stops and joins every producer,
    // which must happen before the epoch counts as complete.
    pub fn finish(self) -> Result<()> {
        match self {
            Epoch::Prepared(_) => Ok(()),
            Epoch::Queued(queue) => queue.finish(),
        }
    }
}

// Number of batches an epoch over `examples` examples yields.
pub fn batch_count(examples: usize, batch_size: usize) -> usize {
    examples.div_ceil(batch_size)
}

// A seeded shuffle of `0..len`.
pub fn permutation(len: usize, seed: u64) -> Vec<usize> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut order: Vec<usize> = (0..len).collect();
    order.shuffle(&mut rng);
    order
}

pub(crate) fn check_preconditions(dataset: &Dataset, batch_size: usize) -> Result<()> {
    if dataset.is_empty() {
        return Err(Error::EmptyDataset);
    }
    if batch_size == 0 {
        return Err(Error::InvalidConfig("batch_size must be > 0".to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BasicScheduler;

impl MinibatchScheduler for BasicScheduler {
    fn generate(&self, dataset: &Arc<Dataset>, batch_size: usize, seed: u64) -> Result<Epoch> {
        check_preconditions(dataset, batch_size)?;
        let examples = dataset.len();
        let shuffled = permutation(examples, seed);

        let complete = examples / batch_size;
        let mut batches = Vec::with_capacity(batch_count(examples, batch_size));
        for k in 0..complete {
            let indices = shuffled[k * batch_size..(k + 1) * batch_size].to_vec();
            batches.push(Minibatch::from_indices(dataset, indices));
        }
        // The end case: whatever is left over forms one last, smaller batch.
        if examples % batch_size != 0 {
            let indices = shuffled[complete * batch_size..].to_vec();
            batches.push(Minibatch::from_indices(dataset, indices));
        }

        Ok(Epoch::Prepared(batches.into_iter()))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExperimentalScheduler;

impl MinibatchScheduler for ExperimentalScheduler {
    fn generate(&self, dataset: &Arc<Dataset>, batch_size: usize, seed: u64) -> Result<Epoch> {
        check_preconditions(dataset, batch_size)?;
        let chunks = permutation(dataset.len(), seed).into_iter().chunks(batch_size);
        let batches: Vec<_> = chunks
            .into_iter()
            .map(|chunk| Minibatch::from_indices(dataset, chunk.collect()))
            .collect();
        Ok(Epoch::Prepared(batches.into_iter()))
    }
}

// The scheduler a configuration asks for.
pub fn scheduler_for(config: &TrainingConfig) -> Box<dyn MinibatchScheduler> {
    match config.batch_method {
        BatchMethod::Basic => Box::new(BasicScheduler),
        BatchMethod::Experimental => Box::new(ExperimentalScheduler),
        BatchMethod::Queue => Box::new(QueueScheduler::new(
            config.thread_count,
            config.queue_capacity,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::one_hot;

    fn numbered(examples: usize) -> Arc<Dataset> {
        // Feature row 0 holds the example's own index so batches can be traced back.
        let features = Array2::from_shape_fn((2, examples), |(row, col)| {
            if row == 0 { col as f32 } else { 1.0 }
        });
        let labels: Vec<usize> = (0..examples).map(|i| i % 3).collect();
        Arc::new(Dataset::new(features, one_hot(&labels, 3).unwrap()).unwrap())
    }

    fn sizes(epoch: Epoch) -> Vec<usize> {
        epoch.map(|batch| batch.len()).collect()
    }

    #[test]
    fn basic_emits_short_final_batch() {
        let epoch = BasicScheduler.generate(&numbered(100), 32, 4).unwrap();
        assert_eq!(sizes(epoch), vec![32, 32, 32, 4]);
    }

    #[test]
    fn experimental_matches_basic() {
        let dataset = numbered(77);
        let basic: Vec<_> = BasicScheduler.generate(&dataset, 10, 9).unwrap().collect();
        let experimental: Vec<_> = ExperimentalScheduler.generate(&dataset, 10, 9).unwrap().collect();
        assert_eq!(basic, experimental);
    }

    #[test]
    fn columns_follow_indices() {
        let dataset = numbered(20);
        for batch in BasicScheduler.generate(&dataset, 6, 1).unwrap() {
            let traced: Vec<usize> = batch.inputs.row(0).iter().map(|&v| v as usize).collect();
            assert_eq!(traced, batch.indices);
            for (column, &index) in batch.indices.iter().enumerate() {
                assert_eq!(batch.labels.column(column), dataset.labels().column(index));
            }
        }
    }

    #[test]
    fn oversized_batch_yields_single_batch() {
        let dataset = numbered(5);
        let queue = QueueScheduler::new(2, 4);
        let schedulers: [&dyn MinibatchScheduler; 3] = [&BasicScheduler, &ExperimentalScheduler, &queue];
        for scheduler in schedulers {
            assert_eq!(sizes(scheduler.generate(&dataset, 8, 0).unwrap()), vec![5]);
            assert_eq!(sizes(scheduler.generate(&dataset, 5, 0).unwrap()), vec![5]);
        }
    }

    #[test]
    fn zero_batch_size_fails_fast() {
        assert!(matches!(
            BasicScheduler.generate(&numbered(3), 0, 0),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn permutation_is_seeded() {
        assert_eq!(permutation(50, 3), permutation(50, 3));
        assert_ne!(permutation(50, 3), permutation(50, 4));

        let mut sorted = permutation(50, 3);
        sorted.sort_unstable();
        assert_eq!(sorted, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn batch_count_rounds_up() {
        assert_eq!(batch_count(100, 32), 4);
        assert_eq!(batch_count(96, 32), 3);
        assert_eq!(batch_count(5, 8), 1);
    }
}
