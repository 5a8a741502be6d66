//! Packaging tool command lines

use crate::isolation::DestructiveMode;

/// Builds the argv for one packaging run
pub trait PackagingTool: Send + Sync {
    /// Program name; also what runs inside instances
    fn program(&self) -> &str;

    /// Host build in the working copy; the tool provisions its own base
    fn native_argv(&self, bases_index: Option<usize>) -> Vec<String>;

    /// Build directly in the current environment, trusting it completely
    fn destructive_argv(&self, mode: DestructiveMode) -> Vec<String>;
}

#[derive(Debug, Clone)]
pub struct Charmcraft {
    program: String,
}

impl Default for Charmcraft {
    fn default() -> Self {
        Self {
            program: "charmcraft".to_string(),
        }
    }
}

impl Charmcraft {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different executable (e.g. an absolute path)
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl PackagingTool for Charmcraft {
    fn program(&self) -> &str {
        &self.program
    }

    fn native_argv(&self, bases_index: Option<usize>) -> Vec<String> {
        let mut argv = vec![self.program.clone(), "-v".to_string(), "pack".to_string()];
        if let Some(index) = bases_index {
            argv.push("--bases-index".to_string());
            argv.push(index.to_string());
        }
        argv
    }

    fn destructive_argv(&self, _mode: DestructiveMode) -> Vec<String> {
        vec![
            self.program.clone(),
            "-v".to_string(),
            "pack".to_string(),
            "--destructive-mode".to_string(),
        ]
    }
}
