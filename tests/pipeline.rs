use anyhow::Result;
use ifd_select_rs::{
    analysis::{read_analysis_stream, AnalysisResult, AnalysisSink},
    data::load_instruction_data,
    error::{IfdError, MeasurementError},
    measure::{Measurement, MeasurementProvider},
    merger::merge_files,
    prompts::PromptStyle,
    scorer::Scorer,
};
use rstest::*;
use serde_json::Value;
use std::{cell::Cell, fs};
use tempfile::TempDir;

/// Loss grows with the text length; token counting stops working after
/// `count_budget` calls, which aborts the run the way a crash would
struct LengthProvider {
    count_budget: Cell<usize>,
}

impl LengthProvider {
    fn new(count_budget: usize) -> Self {
        Self {
            count_budget: Cell::new(count_budget),
        }
    }
}

impl MeasurementProvider for LengthProvider {
    fn count_tokens(&self, text: &str, max_tokens: usize) -> Result<usize, MeasurementError> {
        match self.count_budget.get() {
            0 => Err(MeasurementError::Tokenizer("device lost".to_string())),
            left => {
                self.count_budget.set(left - 1);
                Ok(text.len().min(max_tokens))
            }
        }
    }

    fn whole_text_loss(&self, text: &str, _: usize) -> Result<Measurement, MeasurementError> {
        Measurement::from_loss(text.len() as f64 / 100.)
    }

    fn masked_loss(&self, text: &str, span: &str, _: usize) -> Result<Measurement, MeasurementError> {
        if !text.contains(span) {
            return Err(MeasurementError::SpanNotFound);
        }
        Measurement::from_loss(span.len() as f64 / 200.)
    }
}

const DATASET: &str = r#"[
    {"instruction": "Name the capital of France.", "output": "Paris.", "source": "geo"},
    {"instruction": "Translate to German.", "input": "Good morning", "output": "Guten Morgen"},
    {"instruction": "Say nothing at all.", "output": ""},
    {"instruction": "Summarise the text.", "input": "Rust is a systems language.", "output": "Rust: systems."},
    {"instruction": "Écris un haïku.", "output": "Feuilles d'automne"}
]"#;

#[fixture]
fn workspace() -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("data.json"), DATASET).unwrap();
    dir
}

#[rstest]
fn test_interrupted_run_resumes_and_merges(workspace: TempDir) -> Result<()> {
    let data_path = workspace.path().join("data.json");
    let save_path = workspace.path().join("analysis.jsonl");
    let merged_path = workspace.path().join("merged.json");
    let dataset = load_instruction_data(&data_path)?;

    // two token counts per scored record; the third record needs none
    let crashing = LengthProvider::new(4);
    let scorer = Scorer::new(&crashing, PromptStyle::Alpaca, 64);
    let mut sink = AnalysisSink::open(&save_path)?;
    let err = scorer.score(&dataset, 0, None, &mut sink).unwrap_err();
    assert!(matches!(err, IfdError::Measurement(_)));
    drop(sink);

    let interrupted = fs::read_to_string(&save_path)?;
    assert_eq!(interrupted.lines().count(), 3);

    let healthy = LengthProvider::new(usize::MAX);
    let scorer = Scorer::new(&healthy, PromptStyle::Alpaca, 64);
    let mut sink = AnalysisSink::open(&save_path)?;
    let summary = scorer.score(&dataset, 0, None, &mut sink)?;
    assert_eq!(summary.already_done, 3);
    assert_eq!(summary.scored, 2);

    let resumed = fs::read_to_string(&save_path)?;
    assert_eq!(resumed.lines().count(), dataset.len());
    assert!(resumed.starts_with(&interrupted));

    let analysis = read_analysis_stream(&save_path)?;
    assert_eq!(analysis[2], AnalysisResult::Skipped);

    merge_files(&save_path, &data_path, &merged_path)?;
    let merged: Vec<Value> = serde_json::from_str(&fs::read_to_string(&merged_path)?)?;
    assert_eq!(merged.len(), dataset.len());
    assert_eq!(merged[0]["source"], "geo");
    assert_eq!(merged[4]["instruction"], "Écris un haïku.");
    assert_eq!(merged[2]["ppl_Q_direct"], Value::Null);
    assert_eq!(merged[2]["ifd_ppl"], 0.0);
    for record in [&merged[0], &merged[1], &merged[3], &merged[4]] {
        assert!(record["ifd_loss"].as_f64().is_some_and(|v| v.is_finite() && v > 0.));
        assert!(record["rifd_ppl"].as_f64().is_some_and(|v| v.is_finite() && v > 0.));
    }
    Ok(())
}

#[rstest]
fn test_merge_refuses_incomplete_stream(workspace: TempDir) -> Result<()> {
    let data_path = workspace.path().join("data.json");
    let save_path = workspace.path().join("analysis.jsonl");
    let dataset = load_instruction_data(&data_path)?;

    let provider = LengthProvider::new(usize::MAX);
    let scorer = Scorer::new(&provider, PromptStyle::Vicuna, 64);
    let mut sink = AnalysisSink::open(&save_path)?;
    scorer.score(&dataset, 0, Some(2), &mut sink)?;

    let err = merge_files(&save_path, &data_path, workspace.path().join("merged.json"))
        .unwrap_err();
    assert!(matches!(
        err,
        IfdError::LengthMismatch {
            records: 5,
            analysis: 2
        }
    ));
    Ok(())
}
