//! Instruction dataset records and JSON I/O

use crate::error::{IfdError, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::ser::PrettyFormatter;
use serde_with::{serde_as, NoneAsEmptyString};
use std::{
    fs::{read_to_string, File},
    io::{BufWriter, Write},
    path::Path,
};

/// Read-only view of an instruction-response record
pub trait InstructionExample {
    fn instruction(&self) -> &String;

    fn input(&self) -> &Option<String>;

    fn output(&self) -> &String;

    /// The `input` field, with a missing input read as `""`
    fn input_or_empty(&self) -> &str {
        self.input().as_deref().unwrap_or("")
    }
}

/// A type for containing an instruction-response pair
#[serde_as]
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq)]
pub struct InstructionResponseExample {
    instruction: String,
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    input: Option<String>,
    output: String,
}

impl InstructionResponseExample {
    pub fn new(instruction: &str, input: Option<&str>, output: &str) -> Self {
        Self {
            instruction: instruction.to_string(),
            input: input.map(|inp| inp.to_string()),
            output: output.to_string(),
        }
    }
}

impl InstructionExample for InstructionResponseExample {
    fn instruction(&self) -> &String {
        &self.instruction
    }

    fn input(&self) -> &Option<String> {
        &self.input
    }

    fn output(&self) -> &String {
        &self.output
    }
}

/// A dataset entry kept as a raw JSON object so that unknown fields survive
/// the merge untouched and in their original order
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

/// Loads a JSON array of records from `file_path`
pub fn load_json_array<T: DeserializeOwned, P: AsRef<Path>>(file_path: P) -> Result<Vec<T>> {
    let path = file_path.as_ref();
    let json_str = read_to_string(path).map_err(|e| IfdError::io(path, e))?;
    serde_json::from_str(&json_str[..]).map_err(|e| IfdError::json(path, e))
}

/// Loads the instruction dataset used by the scorer
pub fn load_instruction_data<P: AsRef<Path>>(
    file_path: P,
) -> Result<Vec<InstructionResponseExample>> {
    load_json_array(file_path)
}

/// Writes `data` as one 4-space indented JSON array, keeping non-ASCII text as is
pub fn write_json_array<T: Serialize, P: AsRef<Path>>(data: &[T], save_path: P) -> Result<()> {
    let path = save_path.as_ref();
    let file = File::create(path).map_err(|e| IfdError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    let formatter = PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut writer, formatter);
    data.serialize(&mut ser).map_err(IfdError::Serialize)?;
    writer.flush().map_err(|e| IfdError::io(path, e))?;
    Ok(())
}
