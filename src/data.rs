//! Tensor dataset and batching loader
//!
//! `TensorDataset` adapts a list of encoded examples into an indexed,
//! length-known container. `DataLoader` iterates it in batches with optional
//! shuffling and drop-last semantics; batches convert to candle tensors with
//! U32 ids/labels and an F32 attention mask.

use anyhow::{ensure, Result};
use candle_core::{DType, Device, Tensor};
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::encoding::EncodedExample;

/// Indexed container over encoded examples.
#[derive(Debug, Clone, Default)]
pub struct TensorDataset {
    examples: Vec<EncodedExample>,
}

impl TensorDataset {
    pub fn new(examples: Vec<EncodedExample>) -> Self {
        Self { examples }
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&EncodedExample> {
        self.examples.get(index)
    }

    pub fn examples(&self) -> &[EncodedExample] {
        &self.examples
    }
}

/// A batch of encoded examples, convertible to device tensors.
#[derive(Debug, Clone)]
pub struct Batch {
    examples: Vec<EncodedExample>,
}

impl Batch {
    pub fn new(examples: Vec<EncodedExample>) -> Self {
        Self { examples }
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn examples(&self) -> &[EncodedExample] {
        &self.examples
    }

    /// Split into up to `parts` contiguous shards of near-equal size.
    ///
    /// Used to spread one batch across model replicas. Empty shards are not
    /// produced; fewer than `parts` shards come back when the batch is small.
    pub fn shard(&self, parts: usize) -> Vec<Batch> {
        let parts = parts.max(1);
        let chunk = (self.examples.len() + parts - 1) / parts.max(1);
        if chunk == 0 {
            return Vec::new();
        }
        self.examples
            .chunks(chunk)
            .map(|c| Batch::new(c.to_vec()))
            .collect()
    }

    /// Stack input ids into a `[batch, max_length]` U32 tensor.
    pub fn input_ids(&self, device: &Device) -> Result<Tensor> {
        self.stack(device, DType::U32, |e| Some(&e.input_ids))
    }

    /// Stack attention masks into a `[batch, max_length]` F32 tensor.
    pub fn attention_mask(&self, device: &Device) -> Result<Tensor> {
        self.stack(device, DType::F32, |e| Some(&e.attention_mask))
    }

    /// Stack labels into a `[batch, max_length_output]` U32 tensor.
    ///
    /// Errors if any example in the batch lacks labels.
    pub fn labels(&self, device: &Device) -> Result<Tensor> {
        ensure!(
            self.examples.iter().all(|e| e.labels.is_some()),
            "batch contains examples without labels"
        );
        self.stack(device, DType::U32, |e| e.labels.as_deref())
    }

    fn stack<'a>(
        &'a self,
        device: &Device,
        dtype: DType,
        field: impl Fn(&'a EncodedExample) -> Option<&'a [u32]>,
    ) -> Result<Tensor> {
        ensure!(!self.examples.is_empty(), "cannot stack an empty batch");
        let rows = self.examples.len();
        let cols = field(&self.examples[0])
            .map(|f| f.len())
            .unwrap_or_default();
        let mut flat = Vec::with_capacity(rows * cols);
        for example in &self.examples {
            let values = field(example).unwrap_or_default();
            ensure!(
                values.len() == cols,
                "ragged field length: {} != {}",
                values.len(),
                cols
            );
            flat.extend_from_slice(values);
        }
        let tensor = Tensor::from_vec(flat, (rows, cols), device)?;
        Ok(tensor.to_dtype(dtype)?)
    }
}

/// Batching loader over a tensor dataset.
///
/// Yields `Batch`es of `batch_size` examples; the final batch may be smaller
/// unless `drop_last` is set. With `shuffle`, the visitation order is
/// re-drawn from the seed each time `iter` is called.
#[derive(Debug, Clone)]
pub struct DataLoader {
    dataset: TensorDataset,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
    seed: Option<u64>,
}

impl DataLoader {
    /// Create a loader. `batch_size = None` means one batch holding the
    /// entire dataset.
    pub fn new(
        dataset: TensorDataset,
        batch_size: Option<usize>,
        shuffle: bool,
        drop_last: bool,
    ) -> Self {
        let batch_size = batch_size.unwrap_or_else(|| dataset.len().max(1));
        Self {
            dataset,
            batch_size,
            shuffle,
            drop_last,
            seed: None,
        }
    }

    /// Use a fixed shuffle seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn dataset(&self) -> &TensorDataset {
        &self.dataset
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of batches one pass yields.
    pub fn num_batches(&self) -> usize {
        if self.drop_last {
            self.dataset.len() / self.batch_size
        } else {
            (self.dataset.len() + self.batch_size - 1) / self.batch_size
        }
    }

    /// Iterate the dataset in batches.
    pub fn iter(&self) -> BatchIter<'_> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            let mut rng = match self.seed {
                Some(seed) => rand::rngs::StdRng::seed_from_u64(seed),
                None => rand::rngs::StdRng::from_entropy(),
            };
            order.shuffle(&mut rng);
        }
        BatchIter {
            loader: self,
            order,
            cursor: 0,
        }
    }
}

/// Iterator over loader batches.
pub struct BatchIter<'a> {
    loader: &'a DataLoader,
    order: Vec<usize>,
    cursor: usize,
}

impl<'a> Iterator for BatchIter<'a> {
    type Item = Batch;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.loader.batch_size).min(self.order.len());
        if self.loader.drop_last && end - self.cursor < self.loader.batch_size {
            self.cursor = self.order.len();
            return None;
        }
        let examples = self.order[self.cursor..end]
            .iter()
            .filter_map(|&i| self.loader.dataset.get(i).cloned())
            .collect::<Vec<_>>();
        self.cursor = end;
        if examples.is_empty() {
            None
        } else {
            Some(Batch::new(examples))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example(tag: u32) -> EncodedExample {
        EncodedExample {
            input_ids: vec![tag, tag + 1, 0, 0],
            attention_mask: vec![1, 1, 0, 0],
            labels: Some(vec![tag, 0]),
        }
    }

    fn dataset(n: u32) -> TensorDataset {
        TensorDataset::new((0..n).map(example).collect())
    }

    #[test]
    fn test_batch_counts() {
        let loader = DataLoader::new(dataset(10), Some(3), false, false);
        let batches: Vec<_> = loader.iter().collect();
        assert_eq!(batches.len(), 4);
        assert_eq!(batches[0].len(), 3);
        assert_eq!(batches[3].len(), 1);
    }

    #[test]
    fn test_drop_last() {
        let loader = DataLoader::new(dataset(10), Some(3), false, true);
        let batches: Vec<_> = loader.iter().collect();
        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|b| b.len() == 3));
    }

    #[test]
    fn test_default_batch_is_everything() {
        let loader = DataLoader::new(dataset(7), None, false, false);
        let batches: Vec<_> = loader.iter().collect();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 7);
    }

    #[test]
    fn test_shuffle_preserves_membership() {
        let loader = DataLoader::new(dataset(10), Some(10), true, false).with_seed(7);
        let batch = loader.iter().next().unwrap();
        let mut tags: Vec<u32> = batch.examples().iter().map(|e| e.input_ids[0]).collect();
        tags.sort_unstable();
        assert_eq!(tags, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_unshuffled_order_is_input_order() {
        let loader = DataLoader::new(dataset(5), Some(2), false, false);
        let tags: Vec<u32> = loader
            .iter()
            .flat_map(|b| b.examples().iter().map(|e| e.input_ids[0]).collect::<Vec<_>>())
            .collect();
        assert_eq!(tags, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_batch_tensors() {
        let batch = Batch::new((0..3).map(example).collect());
        let device = Device::Cpu;
        let ids = batch.input_ids(&device).unwrap();
        assert_eq!(ids.dims(), &[3, 4]);
        assert_eq!(ids.dtype(), DType::U32);
        let mask = batch.attention_mask(&device).unwrap();
        assert_eq!(mask.dtype(), DType::F32);
        let labels = batch.labels(&device).unwrap();
        assert_eq!(labels.dims(), &[3, 2]);
    }

    #[test]
    fn test_labels_missing_is_error() {
        let mut e = example(0);
        e.labels = None;
        let batch = Batch::new(vec![e]);
        assert!(batch.labels(&Device::Cpu).is_err());
    }

    #[test]
    fn test_shard() {
        let batch = Batch::new((0..5).map(example).collect());
        let shards = batch.shard(2);
        assert_eq!(shards.len(), 2);
        assert_eq!(shards[0].len(), 3);
        assert_eq!(shards[1].len(), 2);

        let more_parts = Batch::new((0..2).map(example).collect()).shard(4);
        assert_eq!(more_parts.iter().map(Batch::len).sum::<usize>(), 2);
    }
}
