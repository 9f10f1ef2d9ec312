//! Prompt templates
//!
//! Each template family renders an instruction either on its own or together
//! with an input. Rendering is plain string substitution, so braces inside
//! user text are never interpreted.

use crate::data::InstructionExample;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

const ALPACA_PREAMBLE_INPUT: &str = "Below is an instruction that describes a task, \
paired with an input that provides further context. \
Write a response that appropriately completes the request.";
const ALPACA_PREAMBLE_NO_INPUT: &str = "Below is an instruction that describes a task. \
Write a response that appropriately completes the request.";
const VICUNA_PREAMBLE: &str = "A chat between a curious user and an artificial \
intelligence assistant. The assistant gives helpful, detailed, and polite answers \
to the user's questions.";

pub trait PromptFormatter {
    fn format_no_input(&self, instruction: &str) -> String;

    fn format_with_input(&self, instruction: &str, input: &str) -> String;

    /// Renders the prompt for `entry`, picking the no-input template when the
    /// entry has no input
    fn format_input<T: InstructionExample>(&self, entry: &T) -> String {
        match entry.input_or_empty() {
            "" => self.format_no_input(entry.instruction()),
            input => self.format_with_input(entry.instruction(), input),
        }
    }
}

/// Stanford Alpaca prompt style
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlpacaPromptFormatter;

impl PromptFormatter for AlpacaPromptFormatter {
    fn format_no_input(&self, instruction: &str) -> String {
        format!("{ALPACA_PREAMBLE_NO_INPUT}\n\n### Instruction:\n{instruction}\n\n### Response:")
    }

    fn format_with_input(&self, instruction: &str, input: &str) -> String {
        format!(
            "{ALPACA_PREAMBLE_INPUT}\n\n### Instruction:\n{instruction}\n\n\
            ### Input:\n{input}\n\n### Response:"
        )
    }
}

/// WizardLM prompt style
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WizardLmPromptFormatter;

impl PromptFormatter for WizardLmPromptFormatter {
    fn format_no_input(&self, instruction: &str) -> String {
        format!("{instruction}\n\n### Response:")
    }

    fn format_with_input(&self, instruction: &str, input: &str) -> String {
        format!("{instruction}\n{input}\n\n### Response:")
    }
}

/// Vicuna chat prompt style
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VicunaPromptFormatter;

impl PromptFormatter for VicunaPromptFormatter {
    fn format_no_input(&self, instruction: &str) -> String {
        format!("{VICUNA_PREAMBLE} USER: {instruction} ASSISTANT:")
    }

    fn format_with_input(&self, instruction: &str, input: &str) -> String {
        format!("{VICUNA_PREAMBLE} USER: {instruction}\nInput:\n{input} ASSISTANT:")
    }
}

/// Selects one of the supported template families
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PromptStyle {
    Alpaca,
    Wiz,
    #[default]
    Vicuna,
}

impl PromptFormatter for PromptStyle {
    fn format_no_input(&self, instruction: &str) -> String {
        match self {
            PromptStyle::Alpaca => AlpacaPromptFormatter.format_no_input(instruction),
            PromptStyle::Wiz => WizardLmPromptFormatter.format_no_input(instruction),
            PromptStyle::Vicuna => VicunaPromptFormatter.format_no_input(instruction),
        }
    }

    fn format_with_input(&self, instruction: &str, input: &str) -> String {
        match self {
            PromptStyle::Alpaca => AlpacaPromptFormatter.format_with_input(instruction, input),
            PromptStyle::Wiz => WizardLmPromptFormatter.format_with_input(instruction, input),
            PromptStyle::Vicuna => VicunaPromptFormatter.format_with_input(instruction, input),
        }
    }
}

impl Display for PromptStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PromptStyle::Alpaca => "alpaca",
            PromptStyle::Wiz => "wiz",
            PromptStyle::Vicuna => "vicuna",
        };
        write!(f, "{name}")
    }
}
