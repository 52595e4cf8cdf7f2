//! External `typst` tool invocations.
//!
//! The compiler and the metadata query tool are black boxes behind the
//! [`TypstTools`] capability trait, so the pipeline driver can run against
//! an in-process fake in tests. [`TypstCli`] is the production
//! implementation shelling out to the `typst` binary.

use std::path::{Path, PathBuf};
use std::process::Command;

use serde_json::Value;

use crate::error::AttachError;

/// Successful compile result: diagnostic lines the compiler printed on
/// stderr despite exiting zero (Typst reports warnings this way).
#[derive(Debug, Default)]
pub struct CompileOutput {
    pub diagnostics: Vec<String>,
}

/// Capability interface over the external compiler and query tool.
pub trait TypstTools {
    /// Compile `source` into the PDF at `output`.
    fn compile(&self, source: &Path, output: &Path) -> Result<CompileOutput, AttachError>;

    /// Query structured metadata records from `source`.
    fn query(&self, source: &Path, selector: &str) -> Result<Vec<Value>, AttachError>;
}

/// Runs the `typst` command-line tool.
#[derive(Debug, Clone)]
pub struct TypstCli {
    program: PathBuf,
}

impl Default for TypstCli {
    fn default() -> Self {
        Self::new()
    }
}

impl TypstCli {
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("typst"),
        }
    }

    /// Use a specific binary instead of `typst` from `PATH`.
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl TypstTools for TypstCli {
    fn compile(&self, source: &Path, output: &Path) -> Result<CompileOutput, AttachError> {
        let result = Command::new(&self.program)
            .arg("compile")
            .arg(source)
            .arg(output)
            .output()
            .map_err(|e| {
                AttachError::CompileFailed(format!("failed to run {}: {e}", self.program.display()))
            })?;

        let stderr = String::from_utf8_lossy(&result.stderr);
        if !result.status.success() {
            return Err(AttachError::CompileFailed(stderr.into_owned()));
        }

        Ok(CompileOutput {
            diagnostics: stderr.lines().map(str::to_string).collect(),
        })
    }

    fn query(&self, source: &Path, selector: &str) -> Result<Vec<Value>, AttachError> {
        let result = Command::new(&self.program)
            .arg("query")
            .arg(source)
            .arg(selector)
            .args(["--format", "json"])
            .output()
            .map_err(|e| {
                AttachError::QueryFailed(format!("failed to run {}: {e}", self.program.display()))
            })?;

        if !result.status.success() {
            return Err(AttachError::QueryFailed(
                String::from_utf8_lossy(&result.stderr).into_owned(),
            ));
        }

        serde_json::from_slice(&result.stdout)
            .map_err(|e| AttachError::QueryFailed(format!("unparseable query output: {e}")))
    }
}
