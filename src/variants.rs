//! Conditioning variants
//!
//! Every record is measured four times: the instruction and the output on
//! their own ("direct"), and each of them preceded by a context that is masked
//! out of the loss ("condition").

use crate::{
    data::InstructionExample, error::Result, measure::MeasurementProvider,
    prompts::PromptFormatter,
};

/// Meta-instruction asking the model to recover the instruction from a response
pub fn reverse_instruction(output: &str) -> String {
    format!(
        "Below is the response to an instruction, please guess the corresponding \
        instruction for the given response.\n{output}\nGenerate the instruction for \
        the above response."
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regime {
    /// Loss over the whole text
    Direct,
    /// Loss from the last occurrence of the target span to the end
    Condition,
}

/// One text to measure along with its masking span and token budget
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditioningVariant {
    pub text: String,
    pub target_span: Option<String>,
    pub max_tokens: usize,
}

impl ConditioningVariant {
    fn direct(text: String, max_tokens: usize) -> Self {
        Self {
            text,
            target_span: None,
            max_tokens,
        }
    }

    fn condition(text: String, target_span: &str, max_tokens: usize) -> Self {
        Self {
            text,
            target_span: Some(target_span.to_string()),
            max_tokens,
        }
    }

    pub fn regime(&self) -> Regime {
        match self.target_span {
            Some(_) => Regime::Condition,
            None => Regime::Direct,
        }
    }
}

/// The four variants of a record, in measurement order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditioningVariants {
    pub instruction_alone: ConditioningVariant,
    pub output_alone: ConditioningVariant,
    pub instruction_condition: ConditioningVariant,
    pub output_condition: ConditioningVariant,
}

impl ConditioningVariants {
    /// Builds the variants of `entry`.
    ///
    /// The direct variants get a budget of `max_length - prompt_len + 1`
    /// where `prompt_len` is the token length of the opposite conditional
    /// prompt, so that direct and conditional passes cover a comparable
    /// number of tokens.
    pub fn build<T, F, P>(
        entry: &T,
        prompt_formatter: &F,
        provider: &P,
        max_length: usize,
    ) -> Result<Self>
    where
        T: InstructionExample,
        F: PromptFormatter,
        P: MeasurementProvider + ?Sized,
    {
        let instruction = entry.instruction();
        let input = entry.input_or_empty();
        let output = entry.output();

        let instruction_prompt = prompt_formatter.format_input(entry);
        let instruction_prompt_len = provider.count_tokens(&instruction_prompt, max_length)?;

        let reverse_prompt = prompt_formatter.format_no_input(&reverse_instruction(output));
        let reverse_prompt_len = provider.count_tokens(&reverse_prompt, max_length)?;

        let instruction_and_input = format!("{instruction}{input}");

        Ok(Self {
            instruction_alone: ConditioningVariant::direct(
                instruction_and_input.clone(),
                max_length - reverse_prompt_len + 1,
            ),
            output_alone: ConditioningVariant::direct(
                output.to_string(),
                max_length - instruction_prompt_len + 1,
            ),
            instruction_condition: ConditioningVariant::condition(
                reverse_prompt + &instruction_and_input,
                instruction,
                max_length,
            ),
            output_condition: ConditioningVariant::condition(
                instruction_prompt + output,
                output,
                max_length,
            ),
        })
    }

    /// Variants in the fixed analysis order
    pub fn in_order(&self) -> [&ConditioningVariant; 4] {
        [
            &self.instruction_alone,
            &self.output_alone,
            &self.instruction_condition,
            &self.output_condition,
        ]
    }
}
