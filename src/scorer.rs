//! The scoring pass
//!
//! Records are scored one at a time, strictly in order. Each result is
//! appended and synced to the analysis stream before the next record starts,
//! so a rerun with the same arguments picks up exactly where a crashed run
//! stopped.

use crate::{
    analysis::{AnalysisResult, AnalysisSink, RawScores},
    data::InstructionExample,
    error::{IfdError, Result},
    measure::{Measurement, MeasurementProvider},
    prompts::PromptFormatter,
    variants::{ConditioningVariant, ConditioningVariants},
};
use tqdm::tqdm;
use tracing::{debug, info, warn};

/// Half-open slice `[start_idx, end_idx)` of the dataset, clamped to its
/// length. `end_idx = None` runs to the end.
pub fn slice_bounds(len: usize, start_idx: usize, end_idx: Option<usize>) -> (usize, usize) {
    let end = end_idx.map_or(len, |end| end.min(len));
    let start = start_idx.min(end);
    (start, end)
}

/// Maps the command line convention (`-1` meaning "to the end") onto an
/// optional end index
pub fn end_index_from_cli(end_idx: i64) -> Result<Option<usize>> {
    match end_idx {
        -1 => Ok(None),
        end if end >= 0 => Ok(Some(end as usize)),
        end => Err(IfdError::InvalidConfig {
            reason: format!("end_idx must be -1 or non-negative, got {end}"),
        }),
    }
}

/// Counts reported at the end of a scoring pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScoreSummary {
    pub in_slice: usize,
    pub already_done: usize,
    pub scored: usize,
    pub skipped_empty_output: usize,
    pub failed_measurements: usize,
}

pub struct Scorer<'a, P: MeasurementProvider + ?Sized, F: PromptFormatter> {
    provider: &'a P,
    prompt_formatter: F,
    max_length: usize,
}

impl<'a, P: MeasurementProvider + ?Sized, F: PromptFormatter> Scorer<'a, P, F> {
    pub fn new(provider: &'a P, prompt_formatter: F, max_length: usize) -> Self {
        Self {
            provider,
            prompt_formatter,
            max_length,
        }
    }

    /// Runs one measurement. Provider failures become the `(0, 0)` sentinel.
    fn measure(&self, variant: &ConditioningVariant, failures: &mut usize) -> Measurement {
        let measured = match &variant.target_span {
            None => self.provider.whole_text_loss(&variant.text, variant.max_tokens),
            Some(span) => self
                .provider
                .masked_loss(&variant.text, span, variant.max_tokens),
        };
        measured.unwrap_or_else(|e| {
            warn!(regime = ?variant.regime(), error = %e, "Measurement failed, recording (0, 0)");
            *failures += 1;
            Measurement::FAILED
        })
    }

    /// Computes the analysis result of one record
    pub fn analyse<T: InstructionExample>(
        &self,
        entry: &T,
        failures: &mut usize,
    ) -> Result<AnalysisResult> {
        if entry.output().is_empty() {
            return Ok(AnalysisResult::Skipped);
        }
        let variants = ConditioningVariants::build(
            entry,
            &self.prompt_formatter,
            self.provider,
            self.max_length,
        )?;
        let measurements = variants.in_order().map(|variant| self.measure(variant, failures));
        Ok(AnalysisResult::Scored(RawScores::from_measurements(
            measurements,
        )))
    }

    /// Scores `dataset[start_idx..end_idx]` into `sink`, skipping the records
    /// `sink` already holds
    pub fn score<T: InstructionExample>(
        &self,
        dataset: &[T],
        start_idx: usize,
        end_idx: Option<usize>,
        sink: &mut AnalysisSink,
    ) -> Result<ScoreSummary> {
        let (start, end) = slice_bounds(dataset.len(), start_idx, end_idx);
        let sampled_data = &dataset[start..end];
        let existing_num = sink.resume_offset().min(sampled_data.len());

        let mut summary = ScoreSummary {
            in_slice: sampled_data.len(),
            already_done: existing_num,
            ..Default::default()
        };
        info!(
            start,
            end,
            already_done = existing_num,
            remaining = sampled_data.len() - existing_num,
            save_path = %sink.path().display(),
            "Scoring dataset slice"
        );

        for (offset, entry) in tqdm(sampled_data[existing_num..].iter().enumerate()) {
            let index = start + existing_num + offset;
            let result = self.analyse(entry, &mut summary.failed_measurements)?;
            match result {
                AnalysisResult::Skipped => {
                    debug!(index, "Empty output, writing empty result");
                    summary.skipped_empty_output += 1;
                }
                AnalysisResult::Scored(scores) => {
                    debug!(index, ppl = ?scores.ppl, loss = ?scores.loss, "Scored record");
                    summary.scored += 1;
                }
            }
            sink.append(&result)?;
        }

        info!(?summary, "Scoring pass finished");
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analysis::read_analysis_stream, data::InstructionResponseExample,
        error::MeasurementError, prompts::PromptStyle,
    };
    use anyhow::Result;
    use rstest::*;
    use std::cell::Cell;
    use tempfile::TempDir;

    /// Returns `(1, 0)` for every measurement and counts forward passes
    #[derive(Default)]
    struct UnitProvider {
        passes: Cell<usize>,
    }

    impl MeasurementProvider for UnitProvider {
        fn count_tokens(&self, text: &str, max_tokens: usize) -> Result<usize, MeasurementError> {
            Ok(text.split_whitespace().count().min(max_tokens))
        }

        fn whole_text_loss(&self, _: &str, _: usize) -> Result<Measurement, MeasurementError> {
            self.passes.set(self.passes.get() + 1);
            Measurement::from_loss(0.)
        }

        fn masked_loss(&self, _: &str, _: &str, _: usize) -> Result<Measurement, MeasurementError> {
            self.passes.set(self.passes.get() + 1);
            Measurement::from_loss(0.)
        }
    }

    /// Direct passes succeed with loss 1, conditional passes fail
    struct HalfBrokenProvider;

    impl MeasurementProvider for HalfBrokenProvider {
        fn count_tokens(&self, _: &str, _: usize) -> Result<usize, MeasurementError> {
            Ok(1)
        }

        fn whole_text_loss(&self, _: &str, _: usize) -> Result<Measurement, MeasurementError> {
            Measurement::from_loss(1.)
        }

        fn masked_loss(&self, _: &str, _: &str, _: usize) -> Result<Measurement, MeasurementError> {
            Err(MeasurementError::SpanNotFound)
        }
    }

    #[fixture]
    fn dataset() -> Vec<InstructionResponseExample> {
        vec![
            InstructionResponseExample::new("Name the capital of France.", None, "Paris."),
            InstructionResponseExample::new("Say nothing.", None, ""),
            InstructionResponseExample::new("Add the numbers.", Some("1 and 2"), "3"),
        ]
    }

    #[rstest]
    #[case(10, 0, None, (0, 10))]
    #[case(10, 3, Some(7), (3, 7))]
    #[case(10, 3, Some(70), (3, 10))]
    #[case(10, 8, Some(5), (5, 5))]
    #[case(10, 12, None, (10, 10))]
    fn test_slice_bounds(
        #[case] len: usize,
        #[case] start: usize,
        #[case] end: Option<usize>,
        #[case] expected: (usize, usize),
    ) {
        assert_eq!(slice_bounds(len, start, end), expected);
    }

    #[rstest]
    fn test_end_index_from_cli() {
        assert_eq!(end_index_from_cli(-1).ok(), Some(None));
        assert_eq!(end_index_from_cli(4).ok(), Some(Some(4)));
        assert!(end_index_from_cli(-2).is_err());
    }

    #[rstest]
    fn test_empty_output_is_skipped_without_inference(
        dataset: Vec<InstructionResponseExample>,
    ) -> Result<()> {
        let provider = UnitProvider::default();
        let scorer = Scorer::new(&provider, PromptStyle::Alpaca, 64);
        let mut failures = 0;

        assert_eq!(scorer.analyse(&dataset[1], &mut failures)?, AnalysisResult::Skipped);
        assert_eq!(provider.passes.get(), 0);
        Ok(())
    }

    #[rstest]
    fn test_unit_provider_scores(dataset: Vec<InstructionResponseExample>) -> Result<()> {
        let provider = UnitProvider::default();
        let scorer = Scorer::new(&provider, PromptStyle::Alpaca, 64);
        let mut failures = 0;

        let result = scorer.analyse(&dataset[0], &mut failures)?;
        assert_eq!(
            result,
            AnalysisResult::Scored(RawScores {
                ppl: [1.; 4],
                loss: [0.; 4]
            })
        );
        assert_eq!(provider.passes.get(), 4);
        assert_eq!(failures, 0);
        Ok(())
    }

    #[rstest]
    fn test_failed_measurements_become_zero(dataset: Vec<InstructionResponseExample>) -> Result<()> {
        let scorer = Scorer::new(&HalfBrokenProvider, PromptStyle::Vicuna, 64);
        let mut failures = 0;

        let result = scorer.analyse(&dataset[2], &mut failures)?;
        let expected_ppl = 1_f64.exp();
        assert_eq!(
            result,
            AnalysisResult::Scored(RawScores {
                ppl: [expected_ppl, expected_ppl, 0., 0.],
                loss: [1., 1., 0., 0.]
            })
        );
        assert_eq!(failures, 2);
        Ok(())
    }

    #[rstest]
    fn test_score_writes_one_line_per_record(
        dataset: Vec<InstructionResponseExample>,
    ) -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("analysis.jsonl");
        let provider = UnitProvider::default();
        let scorer = Scorer::new(&provider, PromptStyle::Wiz, 64);

        let mut sink = AnalysisSink::open(&path)?;
        let summary = scorer.score(&dataset, 0, None, &mut sink)?;

        assert_eq!(summary.in_slice, 3);
        assert_eq!(summary.scored, 2);
        assert_eq!(summary.skipped_empty_output, 1);
        let written = read_analysis_stream(&path)?;
        assert_eq!(written.len(), 3);
        assert_eq!(written[1], AnalysisResult::Skipped);
        Ok(())
    }

    #[rstest]
    fn test_score_resumes_from_existing_lines(
        dataset: Vec<InstructionResponseExample>,
    ) -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("analysis.jsonl");
        let provider = UnitProvider::default();
        let scorer = Scorer::new(&provider, PromptStyle::Wiz, 64);

        let mut sink = AnalysisSink::open(&path)?;
        scorer.score(&dataset, 0, Some(2), &mut sink)?;
        drop(sink);
        let passes_before = provider.passes.get();

        let mut sink = AnalysisSink::open(&path)?;
        let summary = scorer.score(&dataset, 0, Some(2), &mut sink)?;
        assert_eq!(summary.already_done, 2);
        assert_eq!(summary.scored + summary.skipped_empty_output, 0);
        assert_eq!(provider.passes.get(), passes_before);
        assert_eq!(read_analysis_stream(&path)?.len(), 2);
        Ok(())
    }

    #[rstest]
    fn test_slice_offset_applies_to_resume(dataset: Vec<InstructionResponseExample>) -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("analysis.jsonl");
        std::fs::write(&path, "{}\n")?;
        let provider = UnitProvider::default();
        let scorer = Scorer::new(&provider, PromptStyle::Wiz, 64);

        let mut sink = AnalysisSink::open(&path)?;
        let summary = scorer.score(&dataset, 1, None, &mut sink)?;

        // record 1 counts as done, only record 2 is measured
        assert_eq!(summary.already_done, 1);
        assert_eq!(summary.scored, 1);
        assert_eq!(provider.passes.get(), 4);
        Ok(())
    }
}
