//! Perplexity and loss measurements
//!
//! A `MeasurementProvider` never panics on bad input; every failure comes
//! back as a `MeasurementError` so the caller can decide what to record.

use crate::{
    error::MeasurementError,
    model::{CausalLanguageModel, DEFAULT_IGNORE_INDEX},
    tokenizer::TextEncoder,
};

/// Mean per-token negative log-likelihood and its exponential
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub perplexity: f64,
    pub loss: f64,
}

impl Measurement {
    /// Recorded in place of a measurement whose forward pass failed
    pub const FAILED: Self = Self {
        perplexity: 0.,
        loss: 0.,
    };

    pub fn from_loss(loss: f64) -> Result<Self, MeasurementError> {
        let perplexity = loss.exp();
        if !loss.is_finite() || !perplexity.is_finite() {
            return Err(MeasurementError::NonFinite(loss));
        }
        Ok(Self { perplexity, loss })
    }
}

pub trait MeasurementProvider {
    /// Number of tokens `text` encodes to, capped at `max_tokens`
    fn count_tokens(&self, text: &str, max_tokens: usize) -> Result<usize, MeasurementError>;

    /// Loss over the whole of `text`, truncated to `max_tokens`
    fn whole_text_loss(&self, text: &str, max_tokens: usize)
        -> Result<Measurement, MeasurementError>;

    /// Loss over `text` from the last occurrence of `target_span` to the end
    fn masked_loss(
        &self,
        text: &str,
        target_span: &str,
        max_tokens: usize,
    ) -> Result<Measurement, MeasurementError>;
}

/// Byte offset where the loss starts: the rightmost occurrence of
/// `target_span` in `text`.
pub fn mask_boundary(text: &str, target_span: &str) -> Result<usize, MeasurementError> {
    if target_span.is_empty() {
        return Err(MeasurementError::EmptySpan);
    }
    text.rfind(target_span)
        .ok_or(MeasurementError::SpanNotFound)
}

/// Labels equal to `input_ids` with the first `num_masked` replaced by the
/// ignore index
pub fn masked_labels(input_ids: &[u32], num_masked: usize) -> Vec<i64> {
    input_ids
        .iter()
        .enumerate()
        .map(|(ix, &id)| {
            if ix < num_masked {
                DEFAULT_IGNORE_INDEX
            } else {
                id as i64
            }
        })
        .collect()
}

/// Measurement provider backed by a causal LM and its tokenizer
pub struct ModelMeasurer<M, E> {
    model: M,
    encoder: E,
}

impl<M: CausalLanguageModel, E: TextEncoder> ModelMeasurer<M, E> {
    pub fn new(model: M, encoder: E) -> Self {
        Self { model, encoder }
    }

    pub fn model(&self) -> &M {
        &self.model
    }
}

impl<M: CausalLanguageModel, E: TextEncoder> MeasurementProvider for ModelMeasurer<M, E> {
    fn count_tokens(&self, text: &str, max_tokens: usize) -> Result<usize, MeasurementError> {
        Ok(self.encoder.encode_truncated(text, max_tokens)?.len())
    }

    fn whole_text_loss(
        &self,
        text: &str,
        max_tokens: usize,
    ) -> Result<Measurement, MeasurementError> {
        let input_ids = self.encoder.encode_truncated(text, max_tokens)?;
        let labels = masked_labels(&input_ids, 0);
        Measurement::from_loss(self.model.mean_nll(&input_ids, &labels)?)
    }

    fn masked_loss(
        &self,
        text: &str,
        target_span: &str,
        max_tokens: usize,
    ) -> Result<Measurement, MeasurementError> {
        let input_ids = self.encoder.encode_truncated(text, max_tokens)?;
        let start_index = mask_boundary(text, target_span)?;
        let start_token = self.encoder.encode(&text[..start_index])?.len();
        let labels = masked_labels(&input_ids, start_token);
        Measurement::from_loss(self.model.mean_nll(&input_ids, &labels)?)
    }
}
