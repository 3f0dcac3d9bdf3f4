//! Post-write string-table scrambling.
//!
//! The writer is trusted for structure but not for layout: padding and the
//! stale tail of a shrunk string table are its business. So this pass
//! re-parses the file it actually wrote, computes the absolute byte range of
//! every slice's string table, and overwrites each byte in place with a
//! non-zero random value. After it runs, no pre-mutation symbol name
//! survives anywhere in a descriptor's range.

use crate::macho::UniversalBinary;
use crate::{Error, Result};
use rand::Rng;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

/// Overwrite every string-table byte of every slice in the written file
/// with a uniform random byte in `[1, 255]`.
///
/// Zero is never written so the result is indistinguishable from padding
/// rather than a run of empty-string terminators. Opening the file is fatal
/// on failure; bytes already scrambled are not rolled back.
pub fn scramble_string_tables<R: Rng>(path: impl AsRef<Path>, rng: &mut R) -> Result<()> {
    let path = path.as_ref();
    let data = fs::read(path)?;
    let ranges = string_table_ranges(&data)?;

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| {
            Error::Scramble(format!(
                "failed to open {} for in-place obfuscation: {e}",
                path.display()
            ))
        })?;

    for (&offset, &length) in &ranges {
        tracing::debug!(offset, length, "scrambling string table range");
        let mut bytes = vec![0u8; length as usize];
        for byte in bytes.iter_mut() {
            *byte = rng.gen_range(1..=u8::MAX);
        }
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&bytes)?;
    }

    Ok(())
}

/// Absolute file ranges of each slice's string table, keyed by offset.
/// The map both orders the ranges and collapses aliased descriptors so no
/// range is scrambled twice.
fn string_table_ranges(data: &[u8]) -> Result<BTreeMap<u64, u64>> {
    let binary = UniversalBinary::parse(data.to_vec())?;

    let mut ranges = BTreeMap::new();
    for slice in binary.slices() {
        if let Some(descriptor) = slice.symbol_table_descriptor() {
            if descriptor.strings_size == 0 {
                continue;
            }
            let absolute = slice.fat_offset() + u64::from(descriptor.strings_offset);
            ranges.insert(absolute, u64::from(descriptor.strings_size));
        }
    }
    Ok(ranges)
}
