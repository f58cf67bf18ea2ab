use rand::seq::SliceRandom;

/// One training example with host-resident values.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Sample {
    /// Values fed to the network, in storage order of its input shape.
    pub input: Vec<f32>,
    /// Values the network should produce.
    pub expected: Vec<f32>,
}

impl Sample {
    /// Pairs an input with its expected output.
    #[must_use]
    pub const fn new(input: Vec<f32>, expected: Vec<f32>) -> Self {
        Self { input, expected }
    }
}

/// Source of training batches.
///
/// Called from the training worker, once per epoch. Returning an empty batch
/// ends training early.
pub trait SampleProvider: Send {
    /// Up to `count` samples for the next batch.
    fn next_batch(&mut self, count: usize) -> Vec<Sample>;
}

impl<F> SampleProvider for F
where
    F: FnMut(usize) -> Vec<Sample> + Send,
{
    fn next_batch(&mut self, count: usize) -> Vec<Sample> {
        self(count)
    }
}

/// A fixed set of samples served in passes.
///
/// Each pass visits every sample once; with shuffling enabled the order is
/// redrawn at the start of every pass. A batch never holds the same sample
/// twice, so batches are capped at the number of samples.
#[derive(Debug, Clone)]
pub struct InMemorySamples {
    samples: Vec<Sample>,
    order: Vec<usize>,
    cursor: usize,
    shuffle: bool,
}

impl InMemorySamples {
    /// Serves `samples` in a fresh random order every pass.
    #[must_use]
    pub fn shuffled(samples: Vec<Sample>) -> Self {
        Self::with_order(samples, true)
    }

    /// Serves `samples` in the order given.
    #[must_use]
    pub fn sequential(samples: Vec<Sample>) -> Self {
        Self::with_order(samples, false)
    }

    fn with_order(samples: Vec<Sample>, shuffle: bool) -> Self {
        let len = samples.len();
        Self {
            samples,
            order: (0..len).collect(),
            cursor: len,
            shuffle,
        }
    }

    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether there are no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    fn start_pass(&mut self) {
        if self.shuffle {
            self.order.shuffle(&mut rand::rng());
        }
        self.cursor = 0;
    }
}

impl SampleProvider for InMemorySamples {
    fn next_batch(&mut self, count: usize) -> Vec<Sample> {
        let count = count.min(self.samples.len());
        let mut batch = Vec::with_capacity(count);
        while batch.len() < count {
            if self.cursor == self.order.len() {
                self.start_pass();
            }
            batch.push(self.samples[self.order[self.cursor]].clone());
            self.cursor += 1;
        }
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(count: usize) -> Vec<Sample> {
        (0..count)
            .map(|i| Sample::new(vec![i as f32], vec![0.0]))
            .collect()
    }

    #[test]
    fn sequential_batches_wrap_around() {
        let mut samples = InMemorySamples::sequential(numbered(3));
        let first: Vec<f32> = samples.next_batch(2).iter().map(|s| s.input[0]).collect();
        let second: Vec<f32> = samples.next_batch(2).iter().map(|s| s.input[0]).collect();
        assert_eq!(first, [0.0, 1.0]);
        assert_eq!(second, [2.0, 0.0]);
    }

    #[test]
    fn batches_are_capped_at_sample_count() {
        let mut samples = InMemorySamples::shuffled(numbered(4));
        let mut batch: Vec<f32> = samples.next_batch(10).iter().map(|s| s.input[0]).collect();
        batch.sort_by(f32::total_cmp);
        assert_eq!(batch, [0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn empty_set_yields_empty_batches() {
        let mut samples = InMemorySamples::shuffled(Vec::new());
        assert!(samples.next_batch(8).is_empty());
    }

    #[test]
    fn closures_are_providers() {
        let mut calls = 0;
        let mut provider = |count: usize| {
            calls += 1;
            numbered(count)
        };
        assert_eq!(SampleProvider::next_batch(&mut provider, 5).len(), 5);
        assert_eq!(calls, 1);
    }
}
