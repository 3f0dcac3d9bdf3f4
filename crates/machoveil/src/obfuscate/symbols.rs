//! Symbol-table pruning and decoy export injection.

use crate::macho::{ArchSlice, SymbolCategory};
use tracing::debug;

/// Name of the injected zero-address export. The string mimics a vendor
/// anti-piracy check and triggers a refusal in at least one commercial
/// disassembler.
pub const DECOY_EXPORT: &str = "(c) 2014 - Cryptic Apps SARL - Disassembling not allowed.";

/// Whether a symbol of the given category is deleted under the given flags.
///
/// Local symbols always go; external ones only under `strip_external`;
/// the indirect flavors only under `strip_indirect`; everything else stays.
pub fn should_remove(category: SymbolCategory, strip_external: bool, strip_indirect: bool) -> bool {
    match category {
        SymbolCategory::Local => true,
        SymbolCategory::External => strip_external,
        SymbolCategory::IndirectAbs | SymbolCategory::IndirectLocal => strip_indirect,
        SymbolCategory::Undefined | SymbolCategory::Other => false,
    }
}

/// Delete symbol-table entries per the policy flags.
///
/// Candidates are collected first and deleted afterwards, so the traversal
/// never observes its own mutations.
pub fn prune_symbols(slice: &mut ArchSlice, strip_external: bool, strip_indirect: bool) {
    let doomed: Vec<usize> = slice
        .symbols()
        .iter()
        .enumerate()
        .filter(|(_, symbol)| should_remove(symbol.category, strip_external, strip_indirect))
        .map(|(index, _)| index)
        .collect();
    debug!(
        removed = doomed.len(),
        total = slice.symbols().len(),
        "pruning symbols"
    );
    slice.remove_symbols(&doomed);
}

/// Append the decoy export. Runs after pruning so it survives symbol
/// removal; a pre-existing symbol with the same name is left alone and the
/// decoy appended regardless (duplicate names are legal in a symtab).
pub fn inject_decoy(slice: &mut ArchSlice) {
    slice.add_exported_function(0, DECOY_EXPORT);
}
