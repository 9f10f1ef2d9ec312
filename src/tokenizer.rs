//! Text encoders
//!
//! The measurement code only needs "text in, token ids out". Two backends are
//! supported: a Hugging Face `tokenizer.json` and the tiktoken GPT-2 BPE.

use crate::error::MeasurementError;
use std::path::Path;
use tiktoken_rs::CoreBPE;
use tokenizers::Tokenizer;
use tracing::warn;

/// Number of ids produced by the GPT-2 BPE
pub const GPT2_VOCAB_SIZE: usize = 50_257;

pub trait TextEncoder {
    fn encode(&self, text: &str) -> Result<Vec<u32>, MeasurementError>;

    /// Encodes `text` and keeps at most the first `max_tokens` ids
    fn encode_truncated(&self, text: &str, max_tokens: usize) -> Result<Vec<u32>, MeasurementError> {
        let mut ids = self.encode(text)?;
        ids.truncate(max_tokens);
        Ok(ids)
    }
}

/// Special tokens are added, matching a Hugging Face tokenizer called with
/// its defaults. Prefix and full-text encodings therefore agree on the
/// position of the first content token.
impl TextEncoder for Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>, MeasurementError> {
        let encoding = (**self)
            .encode(text, true)
            .map_err(|e| MeasurementError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }
}

impl TextEncoder for CoreBPE {
    fn encode(&self, text: &str) -> Result<Vec<u32>, MeasurementError> {
        Ok(self.encode_with_special_tokens(text))
    }
}

/// Tokenizer chosen for a model directory
pub enum ModelTokenizer {
    HuggingFace(Box<Tokenizer>),
    Gpt2Bpe(CoreBPE),
}

impl ModelTokenizer {
    /// Loads `tokenizer.json` when given, otherwise falls back to the GPT-2 BPE.
    ///
    /// The fallback is refused for a model whose embedding table cannot hold
    /// every GPT-2 id.
    pub fn load(tokenizer_file: Option<&Path>, vocab_size: usize) -> anyhow::Result<Self> {
        match tokenizer_file {
            Some(path) => {
                let tokenizer = Tokenizer::from_file(path).map_err(|e| {
                    anyhow::anyhow!("Unable to load tokenizer {}: {e}", path.display())
                })?;
                Ok(Self::HuggingFace(Box::new(tokenizer)))
            }
            None => {
                if vocab_size < GPT2_VOCAB_SIZE {
                    anyhow::bail!(
                        "Checkpoint has no tokenizer.json and its vocabulary of {vocab_size} \
                        is smaller than the GPT-2 BPE fallback ({GPT2_VOCAB_SIZE})"
                    );
                }
                warn!("Checkpoint has no tokenizer.json, falling back to the GPT-2 BPE");
                Ok(Self::Gpt2Bpe(tiktoken_rs::r50k_base()?))
            }
        }
    }
}

impl TextEncoder for ModelTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>, MeasurementError> {
        match self {
            ModelTokenizer::HuggingFace(tokenizer) => TextEncoder::encode(tokenizer.as_ref(), text),
            ModelTokenizer::Gpt2Bpe(bpe) => TextEncoder::encode(bpe, text),
        }
    }
}
