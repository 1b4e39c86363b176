//! T5/mT5 model wrapper
//!
//! Owns the tokenizer/model pair and exposes the training and generation
//! entry points. Construction resolves the model identifier through the Hub
//! (network first, local cache fallback), validates the model family,
//! injects the reserved tokens and resizes the embedding table to match,
//! then places a replica of the model on every detected device. The wrapper
//! is single-owner; replicas use a `Mutex` only because the candle T5
//! forward pass takes `&mut self`.

use anyhow::{anyhow, ensure, Context, Result};
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{VarBuilder, VarMap};
use candle_transformers::models::t5;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use crate::data::{Batch, DataLoader};
use crate::device::{DevicePreference, DeviceTopology};
use crate::encoding::{EncoderConfig, PairEncoder};
use crate::generation::{beam_search, BeamSearchConfig, DecoderStep};
use crate::hub::{HubModelConfig, ModelResolver};
use crate::preprocess::{LoaderOptions, Preprocessor};
use crate::tokenizer::TokenizerWrapper;

/// Wrapper configuration.
#[derive(Debug, Clone)]
pub struct T5GenConfig {
    /// Model identifier: Hub id or local directory.
    pub model: String,
    /// Length budget for input texts.
    pub max_length: usize,
    /// Length budget for output texts (also the generation cap).
    pub max_length_output: usize,
    /// Device preference; the topology is resolved once at construction.
    pub device: DevicePreference,
}

impl T5GenConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            max_length: 128,
            max_length_output: 128,
            device: DevicePreference::Auto,
        }
    }

    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn with_max_length_output(mut self, max_length_output: usize) -> Self {
        self.max_length_output = max_length_output;
        self
    }

    pub fn with_device(mut self, device: DevicePreference) -> Self {
        self.device = device;
        self
    }
}

/// Explicit training/eval mode. Toggled only by `train()`/`eval()`; no
/// operation infers a mode change besides generation, which sets eval as the
/// first thing it does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

/// One model instance pinned to a device.
struct Replica {
    model: Mutex<t5::T5ForConditionalGeneration>,
    device: Device,
}

/// T5/mT5 conditional-generation wrapper.
pub struct T5Gen {
    config: T5GenConfig,
    tokenizer: TokenizerWrapper,
    topology: DeviceTopology,
    /// Primary replica first; extras carry constant copies of the weights.
    replicas: Vec<Replica>,
    /// Trainable variables of the primary replica.
    var_map: VarMap,
    /// The raw config.json, vocab size updated, kept for `save`.
    config_json: serde_json::Value,
    mode: Mode,
    pad_id: u32,
    eos_id: u32,
    decoder_start_id: u32,
}

impl T5Gen {
    /// Load a model by identifier with default settings.
    pub fn from_pretrained(model: &str) -> Result<Self> {
        Self::new(T5GenConfig::new(model))
    }

    /// Load a model from a wrapper configuration.
    pub fn new(config: T5GenConfig) -> Result<Self> {
        tracing::info!("instantiate T5 wrapper with `{}`", config.model);

        let resolver = ModelResolver::new();
        let files = resolver.resolve(&config.model)?;
        HubModelConfig::from_file(&files.config_file)?.validate_family()?;

        let tokenizer = TokenizerWrapper::from_model_files(&files)?;

        let config_str = std::fs::read_to_string(&files.config_file)
            .with_context(|| format!("Failed to read config: {:?}", files.config_file))?;
        let mut config_json: serde_json::Value =
            serde_json::from_str(&config_str).context("Failed to parse config.json")?;
        let mut model_config: t5::Config =
            serde_json::from_str(&config_str).context("Failed to parse T5 config")?;
        // Decoding feeds the full prefix each step; the internal kv cache
        // cannot be reordered across beam hypotheses.
        model_config.use_cache = false;

        let topology = DeviceTopology::detect(config.device)?;

        // Resize once on the CPU, then fan the tensors out to the devices.
        let tensors = candle_core::safetensors::load(&files.weights_file, &Device::Cpu)
            .with_context(|| format!("Failed to load weights: {:?}", files.weights_file))?;
        let tensors: HashMap<String, Tensor> = tensors
            .into_iter()
            .map(|(name, tensor)| Ok((name, tensor.to_dtype(DType::F32)?)))
            .collect::<Result<_>>()?;

        let new_vocab = tokenizer.vocab_size().max(model_config.vocab_size);
        let tensors = resize_token_embeddings(tensors, new_vocab)?;
        model_config.vocab_size = new_vocab;
        config_json["vocab_size"] = serde_json::json!(new_vocab);

        // The primary replica is backed by trainable variables so that a
        // loss computed through it can drive an external optimizer.
        let var_map = VarMap::new();
        let primary_device = topology.primary().clone();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &primary_device);
        let model = t5::T5ForConditionalGeneration::load(vb, &model_config)
            .context("Failed to build T5 model")?;
        {
            let data = var_map
                .data()
                .lock()
                .map_err(|e| anyhow!("var map lock poisoned: {}", e))?;
            for (name, var) in data.iter() {
                let tensor = tensors
                    .get(name)
                    .ok_or_else(|| anyhow!("missing tensor `{}` in checkpoint", name))?;
                var.set(&tensor.to_device(&primary_device)?)?;
            }
        }
        let mut replicas = vec![Replica {
            model: Mutex::new(model),
            device: primary_device,
        }];

        for device in topology.devices().iter().skip(1) {
            let on_device: HashMap<String, Tensor> = tensors
                .iter()
                .map(|(name, tensor)| Ok((name.clone(), tensor.to_device(device)?)))
                .collect::<Result<_>>()?;
            let vb = VarBuilder::from_tensors(on_device, DType::F32, device);
            let model = t5::T5ForConditionalGeneration::load(vb, &model_config)
                .context("Failed to build T5 replica")?;
            replicas.push(Replica {
                model: Mutex::new(model),
                device: device.clone(),
            });
        }

        let pad_id = model_config.pad_token_id as u32;
        let eos_id = model_config.eos_token_id as u32;
        let decoder_start_id = model_config
            .decoder_start_token_id
            .unwrap_or(model_config.pad_token_id) as u32;

        Ok(Self {
            config,
            tokenizer,
            topology,
            replicas,
            var_map,
            config_json,
            mode: Mode::Eval,
            pad_id,
            eos_id,
            decoder_start_id,
        })
    }

    // =========================================================================
    // Mode
    // =========================================================================

    /// Switch to training mode.
    pub fn train(&mut self) {
        self.mode = Mode::Train;
    }

    /// Switch to evaluation mode.
    pub fn eval(&mut self) {
        self.mode = Mode::Eval;
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_training(&self) -> bool {
        self.mode == Mode::Train
    }

    // =========================================================================
    // Data loading
    // =========================================================================

    /// Encode raw text pairs into a batching loader using this wrapper's
    /// length budgets.
    pub fn get_data_loader(
        &self,
        inputs: &[String],
        outputs: Option<&[String]>,
        options: &LoaderOptions,
    ) -> Result<DataLoader> {
        let encoder = PairEncoder::new(
            self.tokenizer.clone(),
            EncoderConfig {
                max_length: self.config.max_length,
                max_length_output: self.config.max_length_output,
                drop_overflow_text: options.drop_overflow_text,
            },
        );
        Preprocessor::new(encoder).build_loader(inputs, outputs, options)
    }

    // =========================================================================
    // Loss
    // =========================================================================

    /// Teacher-forced loss over one labeled batch, as a scalar tensor.
    ///
    /// With replication the batch is sharded across devices and the
    /// per-replica losses are averaged into one scalar; gradients reach the
    /// primary replica's variables.
    pub fn encode_to_loss(&self, batch: &Batch) -> Result<Tensor> {
        ensure!(!batch.is_empty(), "cannot compute loss on an empty batch");

        if !self.topology.is_replicated() {
            return self.replica_loss(&self.replicas[0], batch);
        }

        let shards = batch.shard(self.replicas.len());
        let mut losses = Vec::with_capacity(shards.len());
        for (replica, shard) in self.replicas.iter().zip(shards.iter()) {
            losses.push(self.replica_loss(replica, shard)?);
        }

        let primary = &self.replicas[0].device;
        let count = losses.len();
        let mut iter = losses.into_iter();
        let mut total = iter
            .next()
            .ok_or_else(|| anyhow!("batch produced no shards"))?
            .to_device(primary)?;
        for loss in iter {
            total = (&total + &loss.to_device(primary)?)?;
        }
        Ok((total / count as f64)?)
    }

    fn replica_loss(&self, replica: &Replica, batch: &Batch) -> Result<Tensor> {
        let device = &replica.device;
        let input_ids = batch.input_ids(device)?;
        let labels = batch.labels(device)?;
        let (_, target_len) = labels.dims2()?;
        ensure!(target_len > 0, "labels are empty");

        let decoder_input = shift_right(&labels, self.decoder_start_id)?;
        let mask = labels.ne(self.pad_id)?.to_dtype(DType::F32)?;

        let mut model = replica
            .model
            .lock()
            .map_err(|e| anyhow!("model lock poisoned: {}", e))?;
        model.clear_kv_cache();
        let encoder_output = model.encode(&input_ids)?;

        // The decoder exposes only last-position logits, so the
        // teacher-forced loss walks the prefixes.
        let mut nll_sum: Option<Tensor> = None;
        for t in 0..target_len {
            let prefix = decoder_input.narrow(1, 0, t + 1)?;
            let logits = model.decode(&prefix, &encoder_output)?;
            let logits = if logits.dims().len() == 3 {
                let len = logits.dim(1)?;
                logits.narrow(1, len - 1, 1)?.squeeze(1)?
            } else {
                logits
            };
            let logprobs =
                candle_nn::ops::log_softmax(&logits.to_dtype(DType::F32)?, D::Minus1)?;
            let target = labels.narrow(1, t, 1)?;
            let step_nll = logprobs.gather(&target, D::Minus1)?.squeeze(1)?.neg()?;
            let step_mask = mask.narrow(1, t, 1)?.squeeze(1)?;
            let masked = (step_nll * step_mask)?.sum_all()?;
            nll_sum = Some(match nll_sum {
                Some(acc) => (&acc + &masked)?,
                None => masked,
            });
        }

        let nll_sum = nll_sum.ok_or_else(|| anyhow!("labels are empty"))?;
        let token_count = mask.sum_all()?.to_scalar::<f32>()? as f64;
        ensure!(token_count > 0.0, "all label positions are padding");
        Ok((nll_sum / token_count)?)
    }

    // =========================================================================
    // Generation
    // =========================================================================

    /// Generate one output text per input, in input order.
    ///
    /// Inputs are encoded through the preprocessor (no cache), batched, and
    /// decoded with beam search up to `max_length_output` tokens. Generation
    /// always runs on the primary replica, detached from the gradient graph.
    pub fn get_prediction(
        &mut self,
        inputs: &[String],
        batch_size: Option<usize>,
        num_workers: usize,
        num_beams: usize,
    ) -> Result<Vec<String>> {
        self.eval();
        let loader = self.get_data_loader(
            inputs,
            None,
            &LoaderOptions {
                batch_size,
                num_workers,
                ..Default::default()
            },
        )?;

        let replica = &self.replicas[0];
        let beam_config = BeamSearchConfig {
            num_beams,
            max_length: self.config.max_length_output,
            decoder_start_id: self.decoder_start_id,
            eos_id: self.eos_id,
            length_penalty: 1.0,
        };

        let mut outputs = Vec::with_capacity(inputs.len());
        for batch in loader.iter() {
            let input_ids = batch.input_ids(&replica.device)?;
            let encoder_output = {
                let mut model = replica
                    .model
                    .lock()
                    .map_err(|e| anyhow!("model lock poisoned: {}", e))?;
                model.clear_kv_cache();
                model.encode(&input_ids)?.detach()
            };

            for i in 0..batch.len() {
                let mut step = T5DecoderStep {
                    model: &replica.model,
                    encoder_output: encoder_output.narrow(0, i, 1)?,
                };
                let tokens = beam_search(&mut step, &replica.device, &beam_config)?;
                outputs.push(self.tokenizer.decode(&tokens, true)?);
            }
        }
        Ok(outputs)
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Save model weights, config and tokenizer to a directory in the
    /// Hub-compatible layout. Only the primary replica is written; the
    /// extras carry the same weights.
    pub fn save(&self, save_dir: impl AsRef<Path>) -> Result<()> {
        let dir = save_dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create save directory: {:?}", dir))?;

        self.var_map
            .save(dir.join("model.safetensors"))
            .context("Failed to save model weights")?;
        std::fs::write(
            dir.join("config.json"),
            serde_json::to_string_pretty(&self.config_json)?,
        )
        .context("Failed to save config.json")?;
        self.tokenizer.save(dir)?;

        tracing::info!("Saved model to {:?}", dir);
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn model_name(&self) -> &str {
        &self.config.model
    }

    pub fn tokenizer(&self) -> &TokenizerWrapper {
        &self.tokenizer
    }

    /// The device topology resolved at construction.
    pub fn topology(&self) -> &DeviceTopology {
        &self.topology
    }

    pub fn max_length(&self) -> usize {
        self.config.max_length
    }

    pub fn max_length_output(&self) -> usize {
        self.config.max_length_output
    }
}

/// Decoder of the primary replica driving the beam search for one input.
struct T5DecoderStep<'a> {
    model: &'a Mutex<t5::T5ForConditionalGeneration>,
    /// Encoder output for this input, `[1, source_len, d_model]`.
    encoder_output: Tensor,
}

impl DecoderStep for T5DecoderStep<'_> {
    fn step(&mut self, decoder_ids: &Tensor) -> Result<Tensor> {
        let beams = decoder_ids.dim(0)?;
        let encoder_output = self.encoder_output.repeat((beams, 1, 1))?;
        let mut model = self
            .model
            .lock()
            .map_err(|e| anyhow!("model lock poisoned: {}", e))?;
        Ok(model.decode(decoder_ids, &encoder_output)?.detach())
    }
}

/// Decoder inputs are the labels shifted right with the start token.
fn shift_right(labels: &Tensor, decoder_start_id: u32) -> Result<Tensor> {
    let (batch, len) = labels.dims2()?;
    let start = Tensor::full(decoder_start_id, (batch, 1), labels.device())?;
    Ok(Tensor::cat(&[&start, &labels.narrow(1, 0, len - 1)?], 1)?)
}

/// Grow the vocabulary rows of the embedding table (and the untied lm head
/// when present), initializing new rows from the mean embedding.
fn resize_token_embeddings(
    mut tensors: HashMap<String, Tensor>,
    new_vocab: usize,
) -> Result<HashMap<String, Tensor>> {
    for name in ["shared.weight", "lm_head.weight"] {
        let Some(tensor) = tensors.get(name) else {
            continue;
        };
        let (rows, _) = tensor.dims2()?;
        if rows >= new_vocab {
            continue;
        }
        let mean = tensor.mean(0)?;
        let extra = mean.unsqueeze(0)?.repeat((new_vocab - rows, 1))?;
        let grown = Tensor::cat(&[tensor, &extra], 0)?;
        tracing::info!("resized {} from {} to {} rows", name, rows, new_vocab);
        tensors.insert(name.to_string(), grown);
    }
    Ok(tensors)
}
