//! The analysis stream
//!
//! One JSON object per line, one line per dataset record, in dataset order.
//! The number of complete lines on disk is the resume checkpoint of the
//! scorer; there is no other progress record.

use crate::{
    error::{IfdError, Result},
    measure::Measurement,
};
use serde::{Deserialize, Serialize};
use std::{
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

/// Raw measurements in the order instruction alone, output alone,
/// instruction given reverse context, output given instruction
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawScores {
    pub ppl: [f64; 4],
    pub loss: [f64; 4],
}

impl RawScores {
    pub fn from_measurements(measurements: [Measurement; 4]) -> Self {
        Self {
            ppl: measurements.map(|m| m.perplexity),
            loss: measurements.map(|m| m.loss),
        }
    }
}

/// One line of the analysis stream
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "AnalysisRepr", into = "AnalysisRepr")]
pub enum AnalysisResult {
    /// Written as `{}` for records that were not measured
    Skipped,
    Scored(RawScores),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct AnalysisRepr {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ppl: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    loss: Option<Vec<f64>>,
}

impl TryFrom<AnalysisRepr> for AnalysisResult {
    type Error = String;

    fn try_from(repr: AnalysisRepr) -> std::result::Result<Self, Self::Error> {
        fn four(name: &str, values: Vec<f64>) -> std::result::Result<[f64; 4], String> {
            let len = values.len();
            values
                .try_into()
                .map_err(|_| format!("`{name}` must hold 4 values, found {len}"))
        }

        match (repr.ppl, repr.loss) {
            (None, None) => Ok(AnalysisResult::Skipped),
            (Some(ppl), Some(loss)) => Ok(AnalysisResult::Scored(RawScores {
                ppl: four("ppl", ppl)?,
                loss: four("loss", loss)?,
            })),
            _ => Err("`ppl` and `loss` must be present together".to_string()),
        }
    }
}

impl From<AnalysisResult> for AnalysisRepr {
    fn from(result: AnalysisResult) -> Self {
        match result {
            AnalysisResult::Skipped => AnalysisRepr::default(),
            AnalysisResult::Scored(scores) => AnalysisRepr {
                ppl: Some(scores.ppl.to_vec()),
                loss: Some(scores.loss.to_vec()),
            },
        }
    }
}

/// Append-only writer for the analysis stream
#[derive(Debug)]
pub struct AnalysisSink {
    path: PathBuf,
    file: File,
    completed: usize,
}

impl AnalysisSink {
    /// Opens `path` for appending, creating it when missing.
    ///
    /// A trailing line without a newline can only come from an interrupted
    /// write; it is cut off and not counted.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|e| IfdError::io(&path, e))?;

        let (mut completed, mut complete_bytes, mut total_bytes) = (0_usize, 0_u64, 0_u64);
        {
            let mut reader = BufReader::new(&file);
            let mut line = Vec::new();
            loop {
                line.clear();
                let read = reader
                    .read_until(b'\n', &mut line)
                    .map_err(|e| IfdError::io(&path, e))?;
                if read == 0 {
                    break;
                }
                total_bytes += read as u64;
                if line.last() == Some(&b'\n') {
                    completed += 1;
                    complete_bytes = total_bytes;
                }
            }
        }

        if total_bytes > complete_bytes {
            warn!(
                path = %path.display(),
                torn_bytes = total_bytes - complete_bytes,
                "Dropping incomplete trailing line from analysis stream"
            );
            file.set_len(complete_bytes)
                .map_err(|e| IfdError::io(&path, e))?;
        }
        debug!(path = %path.display(), completed, "Opened analysis stream");

        Ok(Self {
            path,
            file,
            completed,
        })
    }

    /// Number of records already present in the stream
    pub fn resume_offset(&self) -> usize {
        self.completed
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one line and makes it durable before returning
    pub fn append(&mut self, result: &AnalysisResult) -> Result<()> {
        let mut line = serde_json::to_string(result).map_err(IfdError::Serialize)?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .and_then(|_| self.file.flush())
            .and_then(|_| self.file.sync_data())
            .map_err(|e| IfdError::io(&self.path, e))?;
        self.completed += 1;
        Ok(())
    }
}

/// Reads an analysis stream.
///
/// `.jsonl` files are read one object per line; anything else is read as a
/// single JSON array.
pub fn read_analysis_stream<P: AsRef<Path>>(path: P) -> Result<Vec<AnalysisResult>> {
    let path = path.as_ref();
    let is_jsonl = path.extension().is_some_and(|ext| ext == "jsonl");
    if !is_jsonl {
        return crate::data::load_json_array(path);
    }

    let file = File::open(path).map_err(|e| IfdError::io(path, e))?;
    BufReader::new(file)
        .lines()
        .enumerate()
        .map(|(index, line)| {
            let line = line.map_err(|e| IfdError::io(path, e))?;
            serde_json::from_str(line.trim()).map_err(|e| IfdError::MalformedAnalysis {
                path: path.to_path_buf(),
                index,
                reason: e.to_string(),
            })
        })
        .collect()
}
