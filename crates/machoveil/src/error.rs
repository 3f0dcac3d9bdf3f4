//! Error types for obfuscation operations.

use thiserror::Error;

/// Error type for obfuscation operations.
///
/// All public functions in this crate return [`crate::Result<T>`], which uses
/// this error type. Every failure is fatal to the run; there are no retries
/// and no rollback of already-written bytes.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Input (or intermediate output) is not a well-formed Mach-O binary.
    #[error("Invalid Mach-O: {0}")]
    Parse(String),

    /// The mutated binary could not be serialized.
    #[error("Write failed: {0}")]
    Write(String),

    /// The string-table scrambling pass could not open or mutate the
    /// written output file. The output may be left partially scrambled.
    #[error("Scrambling failed: {0}")]
    Scramble(String),

    /// Invalid configuration, such as an out-of-range alignment exponent.
    #[error("Configuration error: {0}")]
    Config(String),
}
