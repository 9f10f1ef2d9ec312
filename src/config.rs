//! Command line and file configuration of the two pipeline stages

use crate::{
    error::{IfdError, Result},
    prompts::PromptStyle,
    scorer::end_index_from_cli,
};
use clap::Args;
use serde::Deserialize;
use std::{fs::read_to_string, path::PathBuf};

/// Settings of the scoring stage
#[derive(Args, Debug, Clone, PartialEq)]
#[command(rename_all = "snake_case")]
pub struct ScorerConfig {
    /// JSON file whose keys override the command line values
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Instruction dataset, a JSON array of records
    #[arg(long, default_value = "")]
    pub data_path: String,

    /// Analysis stream to create or resume
    #[arg(long, default_value = "")]
    pub save_path: String,

    /// Hugging Face hub id or local directory of a GPT-2 checkpoint
    #[arg(long, default_value = "")]
    pub model_name_or_path: String,

    /// Token budget per measurement
    #[arg(long, default_value_t = 2_048)]
    pub max_length: usize,

    #[arg(long, default_value_t = 0)]
    pub start_idx: usize,

    /// Exclusive end of the slice to score, -1 for the end of the dataset
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    pub end_idx: i64,

    #[arg(long, value_enum, default_value_t = PromptStyle::default())]
    pub prompt: PromptStyle,
}

/// Keys accepted in a scorer config file; absent keys leave the current
/// value in place and unknown keys are ignored
#[derive(Debug, Default, Deserialize)]
struct ScorerOverlay {
    data_path: Option<String>,
    save_path: Option<String>,
    model_name_or_path: Option<String>,
    max_length: Option<usize>,
    start_idx: Option<usize>,
    end_idx: Option<i64>,
    prompt: Option<PromptStyle>,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            config: None,
            data_path: String::new(),
            save_path: String::new(),
            model_name_or_path: String::new(),
            max_length: 2_048,
            start_idx: 0,
            end_idx: -1,
            prompt: PromptStyle::default(),
        }
    }
}

impl ScorerConfig {
    /// Applies the `--config` file, if any, then validates
    pub fn resolve(mut self) -> Result<Self> {
        if let Some(path) = self.config.clone() {
            let json_str = read_to_string(&path).map_err(|e| IfdError::io(&path, e))?;
            let overlay: ScorerOverlay =
                serde_json::from_str(&json_str).map_err(|e| IfdError::json(&path, e))?;
            self.apply(overlay);
        }
        self.validate()?;
        Ok(self)
    }

    fn apply(&mut self, overlay: ScorerOverlay) {
        if let Some(data_path) = overlay.data_path {
            self.data_path = data_path;
        }
        if let Some(save_path) = overlay.save_path {
            self.save_path = save_path;
        }
        if let Some(model_name_or_path) = overlay.model_name_or_path {
            self.model_name_or_path = model_name_or_path;
        }
        if let Some(max_length) = overlay.max_length {
            self.max_length = max_length;
        }
        if let Some(start_idx) = overlay.start_idx {
            self.start_idx = start_idx;
        }
        if let Some(end_idx) = overlay.end_idx {
            self.end_idx = end_idx;
        }
        if let Some(prompt) = overlay.prompt {
            self.prompt = prompt;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let required = [
            ("data_path", &self.data_path),
            ("save_path", &self.save_path),
            ("model_name_or_path", &self.model_name_or_path),
        ];
        if let Some((name, _)) = required.iter().find(|(_, value)| value.is_empty()) {
            return Err(IfdError::InvalidConfig {
                reason: format!("`{name}` is required"),
            });
        }
        if self.max_length == 0 {
            return Err(IfdError::InvalidConfig {
                reason: "`max_length` must be positive".to_string(),
            });
        }
        self.end_idx().map(|_| ())
    }

    /// Exclusive end of the slice, `None` meaning the end of the dataset
    pub fn end_idx(&self) -> Result<Option<usize>> {
        end_index_from_cli(self.end_idx)
    }
}

/// Settings of the merge stage
#[derive(Args, Debug, Clone, PartialEq)]
#[command(rename_all = "snake_case")]
pub struct MergerConfig {
    /// Analysis stream written by `score`
    #[arg(long)]
    pub pt_data_path: PathBuf,

    /// The dataset that was scored
    #[arg(long)]
    pub json_data_path: PathBuf,

    /// Where to write the merged dataset
    #[arg(long)]
    pub json_save_path: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use clap::Parser;
    use rstest::*;
    use std::fs::write;
    use tempfile::TempDir;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        scorer: ScorerConfig,
    }

    fn parse(args: &[&str]) -> ScorerConfig {
        TestCli::parse_from(std::iter::once("ifd").chain(args.iter().copied())).scorer
    }

    #[rstest]
    fn test_defaults() {
        let config = parse(&[
            "--data_path",
            "d.json",
            "--save_path",
            "a.jsonl",
            "--model_name_or_path",
            "gpt2",
        ]);
        assert_eq!(config.max_length, 2_048);
        assert_eq!(config.start_idx, 0);
        assert_eq!(config.end_idx, -1);
        assert_eq!(config.prompt, PromptStyle::Vicuna);
        assert!(config.validate().is_ok());
    }

    #[rstest]
    fn test_negative_end_idx_parses() {
        let config = parse(&["--end_idx", "-1", "--prompt", "alpaca"]);
        assert_eq!(config.end_idx, -1);
        assert_eq!(config.prompt, PromptStyle::Alpaca);
    }

    #[rstest]
    fn test_file_keys_override_cli() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("config.json");
        write(
            &path,
            r#"{"data_path": "from_file.json", "end_idx": 10, "prompt": "wiz", "unused": true}"#,
        )?;
        let config = parse(&[
            "--config",
            path.to_str().unwrap_or_default(),
            "--data_path",
            "from_cli.json",
            "--save_path",
            "a.jsonl",
            "--model_name_or_path",
            "gpt2",
            "--max_length",
            "512",
        ])
        .resolve()?;

        assert_eq!(config.data_path, "from_file.json");
        assert_eq!(config.save_path, "a.jsonl");
        assert_eq!(config.max_length, 512);
        assert_eq!(config.end_idx()?, Some(10));
        assert_eq!(config.prompt, PromptStyle::Wiz);
        Ok(())
    }

    #[rstest]
    #[case(ScorerConfig { data_path: "".into(), ..valid() })]
    #[case(ScorerConfig { model_name_or_path: "".into(), ..valid() })]
    #[case(ScorerConfig { max_length: 0, ..valid() })]
    #[case(ScorerConfig { end_idx: -3, ..valid() })]
    fn test_invalid_configs(#[case] config: ScorerConfig) {
        assert!(matches!(config.validate(), Err(IfdError::InvalidConfig { .. })));
    }

    fn valid() -> ScorerConfig {
        ScorerConfig {
            data_path: "d.json".into(),
            save_path: "a.jsonl".into(),
            model_name_or_path: "gpt2".into(),
            ..Default::default()
        }
    }
}
