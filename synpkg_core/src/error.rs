/*============================================================
  Synavera Project: Syn-Pkg
  Module: synpkg_core::error
  Etiquette: Synavera Script Etiquette — Rust Profile v1.1.1
  ------------------------------------------------------------
  Purpose:
    Centralise Syn-Pkg-Core error types to provide consistent
    diagnostics and exit semantics.

  Security / Safety Notes:
    Error contexts never embed bundle tokens; only package ids,
    URLs without credentials, and high-level paths are exposed.

  Dependencies:
    thiserror for ergonomic error definitions.

  Operational Scope:
    Used across modules to propagate recoverable failures and
    consolidate exit codes for the binary entry point.

  Revision History:
    2026-10-17 COD  Established shared error definitions.
  ------------------------------------------------------------
  SSE Principles Observed:
    - Explicit error taxonomy with actionable context
    - No silent failure paths
    - Stable exit codes for operational tooling
============================================================*/

use std::io;
use std::process::ExitCode;

use thiserror::Error;

use crate::package_info::PackageError;

/// Result alias for Syn-Pkg-Core operations.
pub type Result<T> = std::result::Result<T, PackagerError>;

/// Enumerates high-level error domains surfaced by Syn-Pkg-Core.
#[derive(Debug, Error)]
pub enum PackagerError {
    #[error("Configuration: {0}")]
    Config(String),
    #[error("Network: {0}")]
    Network(String),
    #[error("Serialization: {0}")]
    Serialization(String),
    #[error("Filesystem: {0}")]
    Filesystem(String),
    #[error("Runtime: {0}")]
    Runtime(String),
    #[error("Package record: {0}")]
    Package(#[from] PackageError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl PackagerError {
    /// Numeric status reported to the shell for this category.
    pub fn code(&self) -> u8 {
        match self {
            PackagerError::Config(_) => 20,
            PackagerError::Network(_) => 30,
            PackagerError::Serialization(_) => 31,
            PackagerError::Package(_) => 32,
            PackagerError::Filesystem(_) => 40,
            PackagerError::Io(_) => 41,
            PackagerError::Runtime(_) => 50,
        }
    }

    /// Map error category to a deterministic exit code.
    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn package_errors_convert_and_keep_their_message() {
        let err: PackagerError = PackageError::NotAnObject.into();
        assert!(matches!(err, PackagerError::Package(_)));
        assert!(err.to_string().starts_with("Package record:"));
    }

    #[test]
    fn exit_codes_are_distinct_per_category() {
        let codes = [
            PackagerError::Config(String::new()).code(),
            PackagerError::Network(String::new()).code(),
            PackagerError::Serialization(String::new()).code(),
            PackagerError::Filesystem(String::new()).code(),
            PackagerError::Runtime(String::new()).code(),
        ];
        for (idx, code) in codes.iter().enumerate() {
            for other in codes.iter().skip(idx + 1) {
                assert_ne!(code, other);
            }
        }
    }
}
