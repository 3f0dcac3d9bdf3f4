//! Section renaming and the optional alignment override.

use crate::macho::parser::SECTION_NAME_LEN;
use crate::macho::ArchSlice;
use tracing::debug;

/// The 16-byte pattern written over renamed section names. A malformed name
/// defeats section-type detection in several disassemblers while the binary
/// still loads.
pub const SECTION_SENTINEL: [u8; SECTION_NAME_LEN] = [0x11; SECTION_NAME_LEN];

/// Segments whose sections are candidates for renaming. This is a
/// segment-name allowlist; any other segment is left untouched.
const RENAMED_SEGMENTS: [&str; 3] = ["__TEXT", "__DATA", "__DATA_CONST"];

/// Name fragments whose sections must keep their names: renaming them breaks
/// exception unwinding, Swift/Objective-C metadata discovery, or
/// pointer-authentication/GOT processing needed for the binary to run.
const PROTECTED_NAMES: [&str; 7] = [
    "__objc", "__swift", "__unwind", "__eh", "__gcc", "__auth", "__got",
];

/// Case-sensitive substring check against the protected name list.
pub fn is_protected(name: &str) -> bool {
    PROTECTED_NAMES.iter().any(|fragment| name.contains(fragment))
}

/// Rename every unprotected section inside the allowlisted segments to the
/// sentinel pattern and, when set, apply the alignment exponent to every
/// visited section regardless of the rename outcome.
pub fn rewrite_sections(slice: &mut ArchSlice, alignment: Option<u32>) {
    let sentinel = String::from_utf8_lossy(&SECTION_SENTINEL).into_owned();
    for segment in slice.segments_mut() {
        if !RENAMED_SEGMENTS.contains(&segment.name()) {
            continue;
        }
        let segment_name = segment.name().to_string();
        for section in segment.sections_mut() {
            if !is_protected(section.name()) {
                debug!(segment = %segment_name, section = %section.name(), "renaming section");
                section.set_name(&sentinel);
            }
            if let Some(exponent) = alignment {
                section.set_alignment(exponent);
            }
        }
    }
}
