//! # t5qg
//!
//! A convenience layer over T5/mT5 conditional generation with candle.
//!
//! ## Overview
//!
//! t5qg wraps a Hub-hosted (or local) T5-family checkpoint behind a small
//! API geared at question-generation style workloads:
//!
//! - Fixed-length pair encoding with overflow dropping
//! - Parallel batch preprocessing with an on-disk feature cache
//! - In-memory tensor dataset with a shuffling, batching loader
//! - Model loading with family validation, reserved-token injection and
//!   embedding resize
//! - Teacher-forced loss computation, sharded across accelerators
//! - Beam-search text generation and Hub-layout saving
//!
//! ## Architecture
//!
//! The crate is organized into small, composable modules:
//!
//! - `task` - Task prefixes and reserved tokens
//! - `hub` - Model file resolution and family validation
//! - `device` - Accelerator detection and replication topology
//! - `tokenizer` - Tokenizer loading with reserved-token injection
//! - `encoding` - Fixed-length pair encoding
//! - `preprocess` - Parallel preprocessing and the feature cache
//! - `data` - Tensor dataset, batches and the loader
//! - `generation` - Beam-search decoding
//! - `model` - The T5/mT5 wrapper tying it all together
//! - `utils` - Logging and cache-directory helpers

pub mod data;
pub mod device;
pub mod encoding;
pub mod generation;
pub mod hub;
pub mod model;
pub mod preprocess;
pub mod task;
pub mod tokenizer;
pub mod utils;

// Re-export commonly used types
pub use anyhow::{Error, Result};

pub use data::{Batch, DataLoader, TensorDataset};
pub use device::{DevicePreference, DeviceTopology};
pub use encoding::{EncodedExample, EncoderConfig, PairEncoder};
pub use model::{Mode, T5Gen, T5GenConfig};
pub use preprocess::{LoaderOptions, Preprocessor};
pub use task::{TaskPrefix, ADDITIONAL_SPECIAL_TOKENS, HL_TOKEN, SEP_TOKEN};
pub use tokenizer::TokenizerWrapper;
