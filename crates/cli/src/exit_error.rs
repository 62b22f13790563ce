// SPDX-License-Identifier: MIT

//! An error that carries the process exit code it should produce, so
//! `main` can centralize process termination instead of each subcommand
//! calling `std::process::exit` itself.

use std::fmt;

#[derive(Debug)]
pub struct ExitError {
    pub code: i32,
    pub message: String,
}

impl ExitError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    /// Spec.md §6's exit code 1: "fatal (including unclean shutdown
    /// requiring `--recover`)".
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(1, message)
    }
}

impl fmt::Display for ExitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ExitError {}
