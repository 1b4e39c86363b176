//! Tokenizer wrapper for T5/mT5 models
//!
//! Loads a HuggingFace tokenizer, injects the reserved `<sep>`/`<hl>` tokens,
//! and provides fixed-length encoding (truncate + pad to a length budget) and
//! decoding. All sequences encoded with one budget share that length, which
//! is what makes the encoded examples stackable into batch tensors.

use anyhow::Result;
use std::path::Path;
use tokenizers::{AddedToken, PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};

use crate::hub::ModelFiles;
use crate::task::ADDITIONAL_SPECIAL_TOKENS;

/// Wrapper around a HuggingFace tokenizer with the reserved tokens injected.
#[derive(Clone)]
pub struct TokenizerWrapper {
    tokenizer: Tokenizer,
    pad_id: u32,
    pad_token: String,
}

impl TokenizerWrapper {
    /// Load a tokenizer from a tokenizer.json file and inject `<sep>`/`<hl>`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(path.as_ref())
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer: {}", e))?;
        Ok(Self::new(tokenizer))
    }

    /// Load the tokenizer belonging to a resolved model.
    pub fn from_model_files(files: &ModelFiles) -> Result<Self> {
        Self::from_file(&files.tokenizer_file)
    }

    /// Wrap an existing tokenizer, injecting the reserved tokens.
    pub fn new(mut tokenizer: Tokenizer) -> Self {
        let added: Vec<AddedToken> = ADDITIONAL_SPECIAL_TOKENS
            .iter()
            .map(|t| AddedToken::from(t.to_string(), true))
            .collect();
        let injected = tokenizer.add_special_tokens(&added);
        if injected > 0 {
            tracing::info!("Injected {} reserved special tokens", injected);
        }

        // T5 pads with <pad> (id 0); fall back to id 0 if the vocabulary
        // names it differently.
        let (pad_id, pad_token) = match tokenizer.token_to_id("<pad>") {
            Some(id) => (id, "<pad>".to_string()),
            None => (0, "<pad>".to_string()),
        };

        Self {
            tokenizer,
            pad_id,
            pad_token,
        }
    }

    /// Vocabulary size including injected tokens.
    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    /// The padding token id.
    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }

    /// Untruncated token count of a text, special tokens included.
    ///
    /// This is the length checked against the overflow budget before any
    /// truncation is applied.
    pub fn token_count(&self, text: &str) -> Result<usize> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow::anyhow!("Tokenization failed: {}", e))?;
        Ok(encoding.get_ids().len())
    }

    /// Encode a text truncated and padded to exactly `max_length` tokens.
    ///
    /// Returns (input ids, attention mask), both of length `max_length`.
    pub fn encode_fixed(&self, text: &str, max_length: usize) -> Result<(Vec<u32>, Vec<u32>)> {
        let mut tokenizer = self.tokenizer.clone();
        tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::Fixed(max_length),
            pad_id: self.pad_id,
            pad_token: self.pad_token.clone(),
            ..Default::default()
        }));
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length,
                ..Default::default()
            }))
            .map_err(|e| anyhow::anyhow!("Failed to set truncation: {}", e))?;

        let encoding = tokenizer
            .encode(text, true)
            .map_err(|e| anyhow::anyhow!("Tokenization failed: {}", e))?;

        Ok((
            encoding.get_ids().to_vec(),
            encoding.get_attention_mask().to_vec(),
        ))
    }

    /// Decode token ids back to text.
    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.tokenizer
            .decode(ids, skip_special_tokens)
            .map_err(|e| anyhow::anyhow!("Decoding failed: {}", e))
    }

    /// Decode a batch of id sequences, preserving order.
    pub fn decode_batch(&self, sequences: &[Vec<u32>], skip_special_tokens: bool) -> Result<Vec<String>> {
        sequences
            .iter()
            .map(|ids| self.decode(ids, skip_special_tokens))
            .collect()
    }

    /// Save tokenizer state to a directory (tokenizer.json).
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let path = dir.as_ref().join("tokenizer.json");
        self.tokenizer
            .save(&path, false)
            .map_err(|e| anyhow::anyhow!("Failed to save tokenizer: {}", e))?;
        tracing::info!("Saved tokenizer to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! A tiny in-memory word-level tokenizer so encoding paths are testable
    //! without downloading a real model.

    use super::TokenizerWrapper;
    use std::collections::HashMap;
    use tokenizers::models::wordlevel::WordLevel;
    use tokenizers::pre_tokenizers::whitespace::Whitespace;
    use tokenizers::Tokenizer;

    pub fn tiny_tokenizer() -> TokenizerWrapper {
        let mut vocab = HashMap::new();
        for (id, token) in [
            "<pad>", "</s>", "<unk>", "the", "a", "cat", "dog", "sat", "ran", "on", "mat",
            "what", "is", "capital", "of", "japan", "tokyo",
        ]
        .iter()
        .enumerate()
        {
            vocab.insert(token.to_string(), id as u32);
        }
        let model = WordLevel::builder()
            .vocab(vocab)
            .unk_token("<unk>".to_string())
            .build()
            .unwrap();
        let mut tokenizer = Tokenizer::new(model);
        tokenizer.with_pre_tokenizer(Whitespace {});
        tokenizer.add_special_tokens(&[
            tokenizers::AddedToken::from("<pad>".to_string(), true),
            tokenizers::AddedToken::from("</s>".to_string(), true),
            tokenizers::AddedToken::from("<unk>".to_string(), true),
        ]);
        TokenizerWrapper::new(tokenizer)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::tiny_tokenizer;
    use super::*;
    use crate::task::{HL_TOKEN, SEP_TOKEN};

    #[test]
    fn test_reserved_tokens_injected() {
        let tokenizer = tiny_tokenizer();
        let base = 17; // vocab entries in the tiny tokenizer
        assert_eq!(tokenizer.vocab_size(), base + 2);
        assert!(tokenizer.tokenizer.token_to_id(SEP_TOKEN).is_some());
        assert!(tokenizer.tokenizer.token_to_id(HL_TOKEN).is_some());
    }

    #[test]
    fn test_encode_fixed_length() {
        let tokenizer = tiny_tokenizer();
        let (ids, mask) = tokenizer.encode_fixed("the cat sat", 8).unwrap();
        assert_eq!(ids.len(), 8);
        assert_eq!(mask.len(), 8);
        // Padded tail carries pad ids with mask zero.
        assert_eq!(*ids.last().unwrap(), tokenizer.pad_id());
        assert_eq!(*mask.last().unwrap(), 0);

        // Over budget: truncated, mask fully set.
        let (ids, mask) = tokenizer
            .encode_fixed("the cat sat on the mat the dog ran", 4)
            .unwrap();
        assert_eq!(ids.len(), 4);
        assert!(mask.iter().all(|&m| m == 1));
    }

    #[test]
    fn test_token_count_unbounded() {
        let tokenizer = tiny_tokenizer();
        let short = tokenizer.token_count("the cat").unwrap();
        let long = tokenizer
            .token_count("the cat sat on the mat the dog ran on the mat")
            .unwrap();
        assert!(long > short);
    }

    #[test]
    fn test_decode_round_trip_is_stable() {
        let tokenizer = tiny_tokenizer();
        let (ids, _) = tokenizer.encode_fixed("the cat sat", 8).unwrap();
        let text = tokenizer.decode(&ids, true).unwrap();
        let (ids2, _) = tokenizer.encode_fixed(&text, 8).unwrap();
        let text2 = tokenizer.decode(&ids2, true).unwrap();
        assert_eq!(text, text2);
    }

    #[test]
    #[ignore]
    fn test_real_tokenizer_load() {
        use crate::hub::ModelResolver;
        let resolver = ModelResolver::new();
        let files = resolver.resolve("t5-small").unwrap();
        let tokenizer = TokenizerWrapper::from_model_files(&files).unwrap();
        assert!(tokenizer.vocab_size() > 32000);
    }
}
