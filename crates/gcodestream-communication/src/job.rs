//! Job sources
//!
//! A job source supplies the instructions of one job in file order. Sources
//! are restartable: every call to [`JobSource::instructions`] starts from the
//! first line again.

use crate::protocol::codec::strip_comment;
use gcodestream_core::{Error, Instruction, Result};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// An ordered, restartable sequence of instructions
pub trait JobSource {
    /// Iterate the instructions from the beginning
    fn instructions(&self) -> Result<Box<dyn Iterator<Item = Result<Instruction>> + '_>>;

    /// Human readable name for logs
    fn name(&self) -> String;

    /// Collect every instruction, stopping at the first read error
    fn load(&self) -> Result<Vec<Instruction>> {
        self.instructions()?.collect()
    }

    /// Number of transmittable instructions
    fn lines_total(&self) -> Result<usize> {
        let mut total = 0;
        for instruction in self.instructions()? {
            instruction?;
            total += 1;
        }
        Ok(total)
    }
}

/// Instructions read lazily from a G-code file
///
/// Comments are removed and blank lines skipped.
#[derive(Debug, Clone)]
pub struct GcodeFile {
    path: PathBuf,
}

impl GcodeFile {
    /// Open a G-code file; fails if the path is not a readable file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.is_file() {
            return Err(Error::other(format!(
                "G-code file not found: {}",
                path.display()
            )));
        }
        Ok(Self { path })
    }

    /// Path of the file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl JobSource for GcodeFile {
    fn instructions(&self) -> Result<Box<dyn Iterator<Item = Result<Instruction>> + '_>> {
        let reader = BufReader::new(File::open(&self.path)?);
        Ok(Box::new(reader.lines().filter_map(|line| match line {
            Ok(text) => {
                let text = strip_comment(&text);
                (!text.is_empty()).then(|| Ok(Instruction::new(text)))
            }
            Err(e) => Some(Err(Error::from(e))),
        })))
    }

    fn name(&self) -> String {
        self.path.display().to_string()
    }
}

/// Instructions held in memory
#[derive(Debug, Clone, Default)]
pub struct InstructionList {
    instructions: Vec<Instruction>,
}

impl InstructionList {
    /// Build from raw lines; comments and blank lines are dropped
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            instructions: lines
                .into_iter()
                .map(|line| strip_comment(line.as_ref()))
                .filter(|line| !line.is_empty())
                .map(Instruction::new)
                .collect(),
        }
    }

    /// Number of instructions
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}

impl From<Vec<Instruction>> for InstructionList {
    fn from(instructions: Vec<Instruction>) -> Self {
        Self { instructions }
    }
}

impl JobSource for InstructionList {
    fn instructions(&self) -> Result<Box<dyn Iterator<Item = Result<Instruction>> + '_>> {
        Ok(Box::new(self.instructions.iter().cloned().map(Ok)))
    }

    fn name(&self) -> String {
        format!("{} instructions", self.instructions.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_gcode_file_strips_comments_and_blanks() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "; generated").unwrap();
        writeln!(file, "G28 ; home").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "(start) G1 X10").unwrap();
        writeln!(file, "G1 X20").unwrap();

        let source = GcodeFile::open(file.path()).unwrap();
        let texts: Vec<String> = source
            .load()
            .unwrap()
            .iter()
            .map(|i| i.text().to_string())
            .collect();
        assert_eq!(texts, vec!["G28", "G1 X10", "G1 X20"]);
        assert_eq!(source.lines_total().unwrap(), 3);
        // restartable
        assert_eq!(source.load().unwrap().len(), 3);
    }

    #[test]
    fn test_missing_file() {
        assert!(GcodeFile::open("/definitely/not/here.gcode").is_err());
    }

    #[test]
    fn test_instruction_list() {
        let list = InstructionList::from_lines(["G28", "", "; only a comment", "M105"]);
        assert_eq!(list.len(), 2);
        assert_eq!(list.lines_total().unwrap(), 2);
        assert_eq!(list.load().unwrap()[1].text(), "M105");
    }
}
