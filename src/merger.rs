//! Joins dataset records with their analysis results and derives the
//! difficulty ratios

use crate::{
    analysis::{read_analysis_stream, AnalysisResult},
    data::{load_json_array, write_json_array, RawRecord},
    error::{IfdError, Result},
};
use serde::Serialize;
use std::path::Path;
use tracing::info;

/// Per-record scores added by the merger.
///
/// `Q` is the instruction, `A` the response. Raw fields of unmeasured
/// records are NaN and serialize as `null`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[allow(non_snake_case)]
pub struct DerivedScores {
    pub ppl_Q_direct: f64,
    pub ppl_A_direct: f64,
    pub ppl_Q_condition: f64,
    pub ppl_A_condition: f64,
    pub ifd_ppl: f64,
    pub rifd_ppl: f64,
    pub loss_Q_direct: f64,
    pub loss_A_direct: f64,
    pub loss_Q_condition: f64,
    pub loss_A_condition: f64,
    pub ifd_loss: f64,
    pub rifd_loss: f64,
}

/// Field names added to every merged record, in output order
pub const DERIVED_FIELDS: [&str; 12] = [
    "ppl_Q_direct",
    "ppl_A_direct",
    "ppl_Q_condition",
    "ppl_A_condition",
    "ifd_ppl",
    "rifd_ppl",
    "loss_Q_direct",
    "loss_A_direct",
    "loss_Q_condition",
    "loss_A_condition",
    "ifd_loss",
    "rifd_loss",
];

/// `(ifd, rifd)` of one measurement family laid out as
/// `[Q_direct, A_direct, Q_condition, A_condition]`.
///
/// A zero denominator zeroes both ratios of the family.
pub fn ratios(values: [f64; 4]) -> (f64, f64) {
    let [q_direct, a_direct, q_condition, a_condition] = values;
    if q_direct == 0. || a_direct == 0. {
        return (0., 0.);
    }
    (a_condition / a_direct, q_condition / q_direct)
}

impl From<&AnalysisResult> for DerivedScores {
    fn from(result: &AnalysisResult) -> Self {
        let (ppl, loss, (ifd_ppl, rifd_ppl), (ifd_loss, rifd_loss)) = match result {
            AnalysisResult::Skipped => ([f64::NAN; 4], [f64::NAN; 4], (0., 0.), (0., 0.)),
            AnalysisResult::Scored(scores) => (
                scores.ppl,
                scores.loss,
                ratios(scores.ppl),
                ratios(scores.loss),
            ),
        };
        Self {
            ppl_Q_direct: ppl[0],
            ppl_A_direct: ppl[1],
            ppl_Q_condition: ppl[2],
            ppl_A_condition: ppl[3],
            ifd_ppl,
            rifd_ppl,
            loss_Q_direct: loss[0],
            loss_A_direct: loss[1],
            loss_Q_condition: loss[2],
            loss_A_condition: loss[3],
            ifd_loss,
            rifd_loss,
        }
    }
}

/// A dataset record with its derived scores appended
#[derive(Debug, Clone, Serialize)]
pub struct MergedRecord {
    #[serde(flatten)]
    fields: RawRecord,
    #[serde(flatten)]
    scores: DerivedScores,
}

impl MergedRecord {
    /// Existing fields sharing a derived name are replaced
    pub fn new(mut fields: RawRecord, scores: DerivedScores) -> Self {
        for name in DERIVED_FIELDS {
            fields.shift_remove(name);
        }
        Self { fields, scores }
    }

    pub fn fields(&self) -> &RawRecord {
        &self.fields
    }

    pub fn scores(&self) -> &DerivedScores {
        &self.scores
    }
}

/// Pairs `records[i]` with `analysis[i]`
pub fn merge(records: Vec<RawRecord>, analysis: &[AnalysisResult]) -> Result<Vec<MergedRecord>> {
    if records.len() != analysis.len() {
        return Err(IfdError::LengthMismatch {
            records: records.len(),
            analysis: analysis.len(),
        });
    }
    Ok(records
        .into_iter()
        .zip(analysis)
        .map(|(record, result)| MergedRecord::new(record, DerivedScores::from(result)))
        .collect())
}

/// Reads the analysis stream and the dataset, merges them, and writes the
/// result as one JSON array
pub fn merge_files<P1, P2, P3>(pt_data_path: P1, json_data_path: P2, json_save_path: P3) -> Result<usize>
where
    P1: AsRef<Path>,
    P2: AsRef<Path>,
    P3: AsRef<Path>,
{
    let analysis = read_analysis_stream(&pt_data_path)?;
    let records: Vec<RawRecord> = load_json_array(&json_data_path)?;
    info!(
        records = records.len(),
        analysis = analysis.len(),
        "Loaded dataset and analysis stream"
    );

    let merged = merge(records, &analysis)?;
    write_json_array(&merged, &json_save_path)?;
    info!(
        merged = merged.len(),
        save_path = %json_save_path.as_ref().display(),
        "Wrote merged dataset"
    );
    Ok(merged.len())
}
