// The concurrent minibatch policy: producer threads feeding a bounded queue.
//
// Every epoch gets a fresh seeded permutation of the dataset. The permutation
// is cut into one contiguous shard per producer, and each producer pushes its
// shard's examples one at a time, in permutation order, into a shared
// `BoundedQueue`. The training loop is the only consumer.
//
// Backpressure works in both directions. A producer blocks while the queue
// holds `capacity` items. The consumer blocks until at least
// `max(min_fill, min(wanted, capacity))` items are buffered, where
// `min_fill = capacity / 4` and `wanted` is what the current batch still
// lacks. Once every producer has finished, the consumer takes whatever is
// left, so the final batch of an epoch may be short, and only then.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use ndarray::{Array1, Array2};

use crate::dataset::Dataset;
use crate::error::{Error, Result};
use crate::scheduler::{Epoch, Minibatch, MinibatchScheduler, check_preconditions, permutation};

pub struct BoundedQueue<T> {
    state: Mutex<QueueState<T>>,
    readable: Condvar,
    writable: Condvar,
    capacity: usize,
    min_fill: usize,
}

struct QueueState<T> {
    buffer: VecDeque<T>,
    active_producers: usize,
    stopped: bool,
    lowest_level: Option<usize>,
}

impl<T> QueueState<T> {
    fn exhausted(&self) -> bool {
        self.stopped || self.active_producers == 0
    }
}

impl<T> BoundedQueue<T> {
    // A queue expecting `producers` calls to `producer_finished`
    // before it counts as exhausted.
    pub fn new(capacity: usize, producers: usize) -> BoundedQueue<T> {
        BoundedQueue {
            state: Mutex::new(QueueState {
                buffer: VecDeque::with_capacity(capacity),
                active_producers: producers,
                stopped: false,
                lowest_level: None,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
            capacity,
            min_fill: capacity / 4,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn min_fill(&self) -> usize {
        self.min_fill
    }

    pub fn len(&self) -> usize {
        self.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Nothing panics while holding the lock, so a poisoned state is still consistent.
    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Blocks while the queue is full. Returns `false`, dropping `item`, once
    // the queue has been stopped.
    pub fn push(&self, item: T) -> bool {
        let mut state = self.lock();
        while state.buffer.len() >= self.capacity && !state.stopped {
            state = self
                .writable
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if state.stopped {
            return false;
        }
        state.buffer.push_back(item);
        drop(state);
        self.readable.notify_one();
        true
    }

    pub fn producer_finished(&self) {
        let mut state = self.lock();
        state.active_producers = state.active_producers.saturating_sub(1);
        drop(state);
        self.readable.notify_all();
    }

    // Wakes every blocked producer and consumer. Producers stop pushing; the
    // consumer may still drain what is buffered.
    pub fn stop(&self) {
        self.lock().stopped = true;
        self.readable.notify_all();
        self.writable.notify_all();
    }

    // Dequeues `batch_size` items. Returns fewer only after the producers are
    // exhausted, and `None` once the queue is exhausted and empty.
    pub fn pop_batch(&self, batch_size: usize) -> Option<Vec<T>> {
        let mut batch = Vec::with_capacity(batch_size);
        let mut state = self.lock();

        while batch.len() < batch_size {
            let wanted = batch_size - batch.len();
            // A batch larger than the queue is assembled over several full drains.
            let ready = wanted.min(self.capacity).max(self.min_fill).max(1);
            while state.buffer.len() < ready && !state.exhausted() {
                state = self
                    .readable
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }

            if state.buffer.is_empty() {
                break;
            }
            if !state.exhausted() {
                let level = state.buffer.len();
                state.lowest_level = Some(state.lowest_level.map_or(level, |low| low.min(level)));
            }

            let take = wanted.min(state.buffer.len());
            batch.extend(state.buffer.drain(..take));
            self.writable.notify_all();
        }

        (!batch.is_empty()).then_some(batch)
    }

    // The fewest buffered items seen by any dequeue made while producers were
    // still running.
    pub fn lowest_level_before_exhaustion(&self) -> Option<usize> {
        self.lock().lowest_level
    }
}

// Marks a producer finished even if it unwinds, so the consumer can never wait on a dead thread.
struct ProducerGuard<'a, T>(&'a BoundedQueue<T>);

impl<T> Drop for ProducerGuard<'_, T> {
    fn drop(&mut self) {
        self.0.producer_finished();
    }
}

// A single example travelling through the queue.
#[derive(Debug, Clone)]
pub struct QueuedExample {
    pub index: usize,
    pub features: Array1<f32>,
    pub label: Array1<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueScheduler {
    thread_count: usize,
    queue_capacity: usize,
}

impl QueueScheduler {
    pub fn new(thread_count: usize, queue_capacity: usize) -> QueueScheduler {
        QueueScheduler {
            thread_count,
            queue_capacity,
        }
    }
}

impl MinibatchScheduler for QueueScheduler {
    fn generate(&self, dataset: &Arc<Dataset>, batch_size: usize, seed: u64) -> Result<Epoch> {
        check_preconditions(dataset, batch_size)?;
        if self.thread_count == 0 || self.queue_capacity == 0 {
            return Err(Error::InvalidConfig(format!(
                "queue needs at least one thread and one slot, got {} threads and capacity {}",
                self.thread_count, self.queue_capacity
            )));
        }

        let threads = self.thread_count;
        let queue = Arc::new(BoundedQueue::new(self.queue_capacity, threads));
        tracing::debug!(
            threads,
            capacity = queue.capacity(),
            min_fill = queue.min_fill(),
            batch_size,
            seed,
            "starting minibatch producers"
        );

        let order = permutation(dataset.len(), seed);
        let examples = order.len();
        let mut workers = Vec::with_capacity(threads);
        for worker in 0..threads {
            let shard = order[worker * examples / threads..(worker + 1) * examples / threads].to_vec();
            let queue_cloned = Arc::clone(&queue);
            let dataset_cloned = Arc::clone(dataset);

            let spawned = thread::Builder::new()
                .name(format!("minibatch-producer-{worker}"))
                .spawn(move || produce(worker, &dataset_cloned, shard, &queue_cloned));

            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    queue.stop();
                    for handle in workers {
                        handle.join().ok();
                    }
                    return Err(Error::WorkerSpawn(err));
                }
            }
        }

        Ok(Epoch::Queued(QueueEpoch {
            queue,
            workers,
            batch_size,
            feature_count: dataset.feature_count(),
            class_count: dataset.class_count(),
        }))
    }
}

fn produce(worker: usize, dataset: &Dataset, shard: Vec<usize>, queue: &BoundedQueue<QueuedExample>) {
    let _finished = ProducerGuard(queue);
    let total = shard.len();
    for (pushed, index) in shard.into_iter().enumerate() {
        let (features, label) = dataset.example(index);
        let example = QueuedExample {
            index,
            features: features.to_owned(),
            label: label.to_owned(),
        };
        if !queue.push(example) {
            tracing::debug!(worker, pushed, total, "producer stopped early");
            return;
        }
    }
    tracing::debug!(worker, total, "producer exhausted its shard");
}

// One epoch of the queue policy. Iterating yields batches as they are
// dequeued; `finish` stops and joins the producers.
pub struct QueueEpoch {
    queue: Arc<BoundedQueue<QueuedExample>>,
    workers: Vec<JoinHandle<()>>,
    batch_size: usize,
    feature_count: usize,
    class_count: usize,
}

impl QueueEpoch {
    pub fn queue(&self) -> &BoundedQueue<QueuedExample> {
        &self.queue
    }

    pub fn finish(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        self.queue.stop();
        let panicked = self
            .workers
            .drain(..)
            .map(JoinHandle::join)
            .filter(std::result::Result::is_err)
            .count();
        if panicked > 0 {
            return Err(Error::WorkerJoin(panicked));
        }
        Ok(())
    }

    fn assemble(&self, examples: Vec<QueuedExample>) -> Minibatch {
        let mut inputs = Array2::zeros((self.feature_count, examples.len()));
        let mut labels = Array2::zeros((self.class_count, examples.len()));
        let mut indices = Vec::with_capacity(examples.len());

        for (column, example) in examples.into_iter().enumerate() {
            inputs.column_mut(column).assign(&example.features);
            labels.column_mut(column).assign(&example.label);
            indices.push(example.index);
        }

        Minibatch {
            inputs,
            labels,
            indices,
        }
    }
}

impl Iterator for QueueEpoch {
    type Item = Minibatch;

    fn next(&mut self) -> Option<Minibatch> {
        let examples = self.queue.pop_batch(self.batch_size)?;
        Some(self.assemble(examples))
    }
}

impl Drop for QueueEpoch {
    fn drop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        if let Err(err) = self.shutdown() {
            tracing::error!(%err, "minibatch producers did not shut down cleanly");
        }
    }
}
