//! Mach-O executable sanitizer.
//!
//! Lightly obfuscates Mach-O executables (thin and universal) to hinder
//! reverse-engineering tools: strips symbol-table entries, scrambles section
//! names, clears the function-starts table, injects a decoy export that
//! trips a known disassembler heuristic, and finally overwrites the written
//! file's symbol string tables with random bytes.
//!
//! The high-level entry point is [`Obfuscator`]:
//!
//! ```ignore
//! use machoveil::Obfuscator;
//!
//! Obfuscator::new()
//!     .strip_external(true)
//!     .run("input", "output")?;
//! ```

pub mod builder;
pub mod error;
pub mod macho;
pub mod obfuscate;

pub use builder::Obfuscator;
pub use error::Error;
pub use obfuscate::symbols::DECOY_EXPORT;

pub type Result<T> = std::result::Result<T, Error>;
