//! Pair encoding into fixed-length examples
//!
//! `PairEncoder` turns an (input text, optional output text) pair into an
//! `EncodedExample`, or signals "drop" when overflow-dropping is enabled and
//! either text exceeds its length budget before truncation. Encoding is a
//! pure function of the encoder config and its inputs.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::tokenizer::TokenizerWrapper;

/// One encoded text pair. All examples produced under the same config share
/// one length per field (padding to the configured maximum).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedExample {
    /// Token ids of the input text, truncated/padded to `max_length`.
    pub input_ids: Vec<u32>,
    /// Attention mask over `input_ids` (1 real, 0 padding).
    pub attention_mask: Vec<u32>,
    /// Token ids of the output text, truncated/padded to `max_length_output`.
    /// Present iff an output text was given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<u32>>,
}

/// Encoder configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Length budget for input texts.
    pub max_length: usize,
    /// Length budget for output texts.
    pub max_length_output: usize,
    /// Drop pairs whose untruncated token count exceeds a budget.
    pub drop_overflow_text: bool,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            max_length: 512,
            max_length_output: 34,
            drop_overflow_text: true,
        }
    }
}

/// Encodes text pairs into fixed-length examples.
#[derive(Clone)]
pub struct PairEncoder {
    tokenizer: TokenizerWrapper,
    config: EncoderConfig,
}

impl PairEncoder {
    pub fn new(tokenizer: TokenizerWrapper, config: EncoderConfig) -> Self {
        Self { tokenizer, config }
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Encode one pair. `Ok(None)` means the pair was dropped for overflow.
    pub fn encode_pair(
        &self,
        input_text: &str,
        output_text: Option<&str>,
    ) -> Result<Option<EncodedExample>> {
        if self.config.drop_overflow_text {
            if self.tokenizer.token_count(input_text)? > self.config.max_length {
                return Ok(None);
            }
            if let Some(output) = output_text {
                if self.tokenizer.token_count(output)? > self.config.max_length_output {
                    return Ok(None);
                }
            }
        }

        let (input_ids, attention_mask) = self
            .tokenizer
            .encode_fixed(input_text, self.config.max_length)?;

        let labels = match output_text {
            Some(output) => {
                let (ids, _) = self
                    .tokenizer
                    .encode_fixed(output, self.config.max_length_output)?;
                Some(ids)
            }
            None => None,
        };

        Ok(Some(EncodedExample {
            input_ids,
            attention_mask,
            labels,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::test_support::tiny_tokenizer;

    fn encoder(max_length: usize, max_length_output: usize, drop: bool) -> PairEncoder {
        PairEncoder::new(
            tiny_tokenizer(),
            EncoderConfig {
                max_length,
                max_length_output,
                drop_overflow_text: drop,
            },
        )
    }

    #[test]
    fn test_encode_within_budget() {
        let encoder = encoder(8, 4, true);
        let example = encoder
            .encode_pair("the cat sat", Some("the mat"))
            .unwrap()
            .unwrap();
        assert_eq!(example.input_ids.len(), 8);
        assert_eq!(example.attention_mask.len(), 8);
        assert_eq!(example.labels.as_ref().unwrap().len(), 4);
    }

    #[test]
    fn test_input_only_has_no_labels() {
        let encoder = encoder(8, 4, true);
        let example = encoder.encode_pair("the cat", None).unwrap().unwrap();
        assert!(example.labels.is_none());
    }

    #[test]
    fn test_overflow_input_dropped() {
        let encoder = encoder(4, 4, true);
        let dropped = encoder
            .encode_pair("the cat sat on the mat the dog ran", None)
            .unwrap();
        assert!(dropped.is_none());
    }

    #[test]
    fn test_overflow_output_dropped() {
        let encoder = encoder(16, 2, true);
        let dropped = encoder
            .encode_pair("the cat", Some("the dog ran on the mat"))
            .unwrap();
        assert!(dropped.is_none());
    }

    #[test]
    fn test_overflow_kept_when_dropping_disabled() {
        let encoder = encoder(4, 4, false);
        let example = encoder
            .encode_pair("the cat sat on the mat the dog ran", None)
            .unwrap()
            .unwrap();
        // Truncated to the budget instead of dropped.
        assert_eq!(example.input_ids.len(), 4);
    }
}
