//! Parallel batch preprocessing with an on-disk feature cache
//!
//! Fans the pair encoder out across a rayon pool over a list of text pairs,
//! drops overflowed entries, optionally persists the surviving list to a
//! caller-given path, and wraps the result in a batching loader. The parallel
//! map is order-preserving and blocks until the whole list is encoded.
//!
//! The cache is a blind trust boundary: a readable file at the cache path is
//! served verbatim, even when the current inputs or encoder config differ
//! from whatever produced it. Callers who change config must change the path.

use anyhow::{ensure, Context, Result};
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use crate::data::{DataLoader, TensorDataset};
use crate::encoding::{EncodedExample, PairEncoder};

/// Options for one preprocessing run.
#[derive(Debug, Clone, Default)]
pub struct LoaderOptions {
    /// Examples per batch; `None` means one batch holding everything.
    pub batch_size: Option<usize>,
    /// Worker threads for the parallel map; 0 uses all host processors.
    pub num_workers: usize,
    /// Shuffle batches on each pass.
    pub shuffle: bool,
    /// Drop a final batch smaller than `batch_size`.
    pub drop_last: bool,
    /// Drop pairs exceeding the length budgets instead of truncating them.
    /// Read by callers that construct the encoder per run (the model
    /// wrapper); a `Preprocessor` built around an existing encoder follows
    /// that encoder's own config.
    pub drop_overflow_text: bool,
    /// Cache file for the encoded list.
    pub cache_path: Option<PathBuf>,
}

/// Fans a `PairEncoder` out over text pairs and assembles a `DataLoader`.
pub struct Preprocessor {
    encoder: PairEncoder,
}

impl Preprocessor {
    pub fn new(encoder: PairEncoder) -> Self {
        Self { encoder }
    }

    pub fn encoder(&self) -> &PairEncoder {
        &self.encoder
    }

    /// Encode `inputs` (optionally paired with `outputs`) into a batching
    /// loader.
    ///
    /// Fails immediately when `outputs` is given with a different length than
    /// `inputs`. When `cache_path` names an existing file its contents are
    /// returned verbatim and no encoding happens.
    pub fn build_loader(
        &self,
        inputs: &[String],
        outputs: Option<&[String]>,
        options: &LoaderOptions,
    ) -> Result<DataLoader> {
        if let Some(outputs) = outputs {
            ensure!(
                outputs.len() == inputs.len(),
                "{} != {}",
                outputs.len(),
                inputs.len()
            );
        }

        let examples = match &options.cache_path {
            Some(path) if path.exists() => {
                tracing::info!("loading preprocessed feature from {:?}", path);
                load_cache(path)?
            }
            _ => {
                let encoded = self.encode_all(inputs, outputs, options.num_workers)?;
                tracing::info!("encode all the data       : {}", encoded.len());
                let survivors: Vec<EncodedExample> =
                    encoded.into_iter().flatten().collect();
                tracing::info!("after remove the overflow : {}", survivors.len());

                if let Some(path) = &options.cache_path {
                    save_cache(path, &survivors)?;
                    tracing::info!("preprocessed feature is saved at {:?}", path);
                }
                survivors
            }
        };

        Ok(DataLoader::new(
            TensorDataset::new(examples),
            options.batch_size,
            options.shuffle,
            options.drop_last,
        ))
    }

    /// Order-preserving parallel map of the encoder over the pairs.
    ///
    /// Output index i is the encoding of input index i regardless of worker
    /// count; the call blocks until every pair is processed.
    fn encode_all(
        &self,
        inputs: &[String],
        outputs: Option<&[String]>,
        num_workers: usize,
    ) -> Result<Vec<Option<EncodedExample>>> {
        let encode = |i: usize| {
            let output = outputs.map(|o| o[i].as_str());
            self.encoder.encode_pair(&inputs[i], output)
        };

        if num_workers == 0 {
            (0..inputs.len())
                .into_par_iter()
                .map(encode)
                .collect::<Result<Vec<_>>>()
        } else {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(num_workers)
                .build()
                .context("Failed to build preprocessing thread pool")?;
            pool.install(|| {
                (0..inputs.len())
                    .into_par_iter()
                    .map(encode)
                    .collect::<Result<Vec<_>>>()
            })
        }
    }
}

fn load_cache(path: &Path) -> Result<Vec<EncodedExample>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open cache file: {:?}", path))?;
    let examples = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to parse cache file: {:?}", path))?;
    Ok(examples)
}

fn save_cache(path: &Path, examples: &[EncodedExample]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create cache directory: {:?}", parent))?;
        }
    }
    let file =
        File::create(path).with_context(|| format!("Failed to write cache file: {:?}", path))?;
    serde_json::to_writer(BufWriter::new(file), examples)
        .with_context(|| format!("Failed to serialize cache to {:?}", path))?;
    Ok(())
}
