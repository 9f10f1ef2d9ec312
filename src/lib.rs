//! Instruction-Following Difficulty scoring of instruction-tuning data
//!
//! The pipeline has two stages. [`scorer::Scorer`] measures every record of a
//! dataset four times with a causal language model and appends the raw
//! perplexities and losses to a resumable analysis stream.
//! [`merger::merge_files`] then joins that stream back onto the dataset and
//! derives the IFD and reverse-IFD ratios used to rank records.

pub mod analysis;
pub mod config;
pub mod data;
pub mod error;
pub mod measure;
pub mod merger;
pub mod model;
pub mod prompts;
pub mod scorer;
pub mod tokenizer;
pub mod variants;
