//! Obfuscator builder API.
//!
//! Drives the whole pipeline: parse, per-slice mutation, write, then the
//! in-place string-table scramble of the written file.

use crate::macho::UniversalBinary;
use crate::obfuscate::scramble::scramble_string_tables;
use crate::obfuscate::sections::rewrite_sections;
use crate::obfuscate::symbols::{inject_decoy, prune_symbols};
use crate::{Error, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::Path;
use tracing::info;

/// Largest section alignment exponent ld64 emits (2^15 bytes).
pub const MAX_SECTION_ALIGN_EXPONENT: u32 = 15;

/// Mach-O obfuscation pipeline with a builder-pattern API.
///
/// # Example
///
/// ```ignore
/// use machoveil::Obfuscator;
///
/// Obfuscator::new()
///     .strip_external(true)
///     .strip_indirect(true)
///     .run("target/app", "target/app.veiled")?;
/// ```
#[derive(Clone, Debug, Default)]
pub struct Obfuscator {
    strip_external: bool,
    strip_indirect: bool,
    section_alignment: Option<u32>,
}

impl Obfuscator {
    /// Create a new obfuscator with default policy: strip local symbols
    /// only, no alignment override.
    pub fn new() -> Self {
        Self::default()
    }

    /// Also strip external symbols.
    pub fn strip_external(mut self, enabled: bool) -> Self {
        self.strip_external = enabled;
        self
    }

    /// Also strip indirect symbols.
    pub fn strip_indirect(mut self, enabled: bool) -> Self {
        self.strip_indirect = enabled;
        self
    }

    /// Apply an alignment exponent to every section visited by the renamer.
    /// Advisory only; never changes a section's size or file offset.
    pub fn section_alignment(mut self, exponent: u32) -> Self {
        self.section_alignment = Some(exponent);
        self
    }

    /// Validate the builder configuration.
    pub fn validate(&self) -> Result<()> {
        if let Some(exponent) = self.section_alignment {
            if exponent > MAX_SECTION_ALIGN_EXPONENT {
                return Err(Error::Config(format!(
                    "alignment exponent {exponent} out of range 0..={MAX_SECTION_ALIGN_EXPONENT}"
                )));
            }
        }
        Ok(())
    }

    /// Run the pipeline: parse `input`, mutate every slice in memory, write
    /// to `output`, then re-parse the written file and scramble its string
    /// tables. Strictly sequential; the first failure aborts the run.
    pub fn run(&self, input: impl AsRef<Path>, output: impl AsRef<Path>) -> Result<()> {
        self.validate()?;
        let output = output.as_ref();

        let mut binary = UniversalBinary::open(input.as_ref())?;
        info!(
            slices = binary.slices().len(),
            fat = binary.is_fat(),
            "parsed input"
        );

        for slice in binary.slices_mut() {
            prune_symbols(slice, self.strip_external, self.strip_indirect);
            rewrite_sections(slice, self.section_alignment);
            slice.clear_function_starts();
            inject_decoy(slice);
        }

        binary.write(output)?;
        info!(output = %output.display(), "wrote mutated binary");

        // Fresh generator per run; tests drive the scrambler directly with
        // a seeded one.
        let mut rng = StdRng::from_entropy();
        scramble_string_tables(output, &mut rng)?;
        info!("scrambled string tables");

        Ok(())
    }
}
