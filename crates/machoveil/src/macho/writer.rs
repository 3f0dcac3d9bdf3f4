//! Serialization of the mutated Mach-O model.
//!
//! The writer patches each slice's original bytes in place: section headers
//! are rewritten at their recorded offsets, the function-starts blob is
//! blanked, and the symbol/string tables are rebuilt from the surviving
//! symbol list. A shrunk string table keeps its original on-disk size so the
//! persisted descriptor still spans every leftover byte; the scrambling pass
//! relies on that. Fat containers are rebuilt with recomputed, aligned
//! slice offsets.

use crate::macho::parser::{read_u32_le, ArchSlice, SymbolCategory, UniversalBinary};
use crate::{Error, Result};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

const FAT_MAGIC: u32 = 0xcafe_babe;
const FAT_HEADER_SIZE: usize = 8;
const FAT_ARCH_SIZE: usize = 20;

const INDIRECT_SYMBOL_LOCAL: u32 = 0x8000_0000;
const INDIRECT_SYMBOL_ABS: u32 = 0x4000_0000;

pub(crate) fn write_universal(binary: &UniversalBinary, path: &Path) -> Result<()> {
    let mut blobs = Vec::with_capacity(binary.slices.len());
    for slice in &binary.slices {
        blobs.push(write_slice(slice)?);
    }

    let bytes = if binary.is_fat {
        build_fat(&binary.slices, &blobs)?
    } else {
        blobs
            .into_iter()
            .next()
            .ok_or_else(|| Error::Write("no slices to write".into()))?
    };

    fs::write(path, bytes)?;
    Ok(())
}

/// Serialize one slice: section headers, function starts, symbol table.
fn write_slice(slice: &ArchSlice) -> Result<Vec<u8>> {
    let mut out = slice.data.clone();

    patch_sections(slice, &mut out)?;
    patch_function_starts(slice, &mut out)?;
    rebuild_symtab(slice, &mut out)?;

    Ok(out)
}

fn patch_sections(slice: &ArchSlice, out: &mut [u8]) -> Result<()> {
    let align_off = if slice.is_64 { 52 } else { 44 };
    for segment in &slice.segments {
        for section in segment.sections() {
            write_name16(out, section.header_offset, section.name())?;
            write_u32_le(out, section.header_offset + align_off, section.alignment())?;
        }
    }
    Ok(())
}

fn patch_function_starts(slice: &ArchSlice, out: &mut [u8]) -> Result<()> {
    let Some(fs) = &slice.function_starts else {
        return Ok(());
    };
    if !fs.addresses.is_empty() || fs.datasize == 0 {
        return Ok(());
    }
    // Cleared table: blank the old uleb stream and shrink the command.
    zero_range(out, fs.dataoff as usize, fs.datasize as usize)?;
    write_u32_le(out, fs.cmd_offset + 12, 0)?;
    Ok(())
}

/// Rebuild the nlist array and string table from the surviving symbols,
/// regrouped local / externally-defined / undefined, and recompute the
/// symtab and dysymtab descriptors to match.
fn rebuild_symtab(slice: &ArchSlice, out: &mut Vec<u8>) -> Result<()> {
    let Some(st) = &slice.symtab else {
        return Ok(());
    };
    let entry_size = if slice.is_64 { 16 } else { 12 };

    let mut locals = Vec::new();
    let mut extdefs = Vec::new();
    let mut undefs = Vec::new();
    for symbol in &slice.symbols {
        match symbol.category {
            SymbolCategory::Local | SymbolCategory::IndirectLocal | SymbolCategory::Other => {
                locals.push(symbol)
            }
            SymbolCategory::External | SymbolCategory::IndirectAbs => extdefs.push(symbol),
            SymbolCategory::Undefined => undefs.push(symbol),
        }
    }
    let group_sizes = (locals.len() as u32, extdefs.len() as u32, undefs.len() as u32);

    // String table index 0 is reserved for the empty name.
    let mut strtab = vec![0u8];
    let mut nlist = Vec::with_capacity(slice.symbols.len() * entry_size);
    let mut new_index_of_old: HashMap<usize, u32> = HashMap::new();

    for (new_index, symbol) in locals
        .into_iter()
        .chain(extdefs)
        .chain(undefs)
        .enumerate()
    {
        let n_strx = if symbol.name.is_empty() {
            0u32
        } else {
            let offset = strtab.len() as u32;
            strtab.extend_from_slice(symbol.name.as_bytes());
            strtab.push(0);
            offset
        };

        nlist.extend_from_slice(&n_strx.to_le_bytes());
        nlist.push(symbol.n_type);
        nlist.push(symbol.n_sect);
        nlist.extend_from_slice(&symbol.n_desc.to_le_bytes());
        if slice.is_64 {
            nlist.extend_from_slice(&symbol.n_value.to_le_bytes());
        } else {
            nlist.extend_from_slice(&(symbol.n_value as u32).to_le_bytes());
        }

        if let Some(old) = symbol.original_index {
            new_index_of_old.insert(old, new_index as u32);
        }
    }

    let old_nlist_capacity = st.nsyms as usize * entry_size;
    let fits = nlist.len() <= old_nlist_capacity && strtab.len() <= st.strings_size as usize;

    let (symoff, stroff, strsize) = if fits {
        // Write over the old regions. The nlist remainder is blanked; the
        // string table keeps its original size so the descriptor still
        // covers the stale tail bytes a shrunk table leaves behind.
        splice(out, st.symoff as usize, &nlist)?;
        zero_range(
            out,
            st.symoff as usize + nlist.len(),
            old_nlist_capacity - nlist.len(),
        )?;
        splice(out, st.strings_offset as usize, &strtab)?;
        (st.symoff, st.strings_offset, st.strings_size)
    } else {
        // Grown tables (nothing pruned, decoy added): relocate to the end
        // of the slice and extend __LINKEDIT over the new tail.
        let symoff = align_to(out.len(), 8);
        out.resize(symoff, 0);
        out.extend_from_slice(&nlist);
        let stroff = out.len();
        out.extend_from_slice(&strtab);

        zero_range(out, st.symoff as usize, old_nlist_capacity)?;
        zero_range(out, st.strings_offset as usize, st.strings_size as usize)?;

        if let Some(le) = &slice.linkedit {
            let new_filesize = out.len() as u64 - le.fileoff;
            let new_vmsize = align_to(new_filesize as usize, 0x4000) as u64;
            if slice.is_64 {
                write_u64_le(out, le.cmd_offset + 48, new_filesize)?;
                write_u64_le(out, le.cmd_offset + 32, new_vmsize)?;
            } else {
                write_u32_le(out, le.cmd_offset + 36, new_filesize as u32)?;
                write_u32_le(out, le.cmd_offset + 28, new_vmsize as u32)?;
            }
        }
        (symoff as u32, stroff as u32, strtab.len() as u32)
    };

    let new_nsyms = (nlist.len() / entry_size) as u32;
    write_u32_le(out, st.cmd_offset + 8, symoff)?;
    write_u32_le(out, st.cmd_offset + 12, new_nsyms)?;
    write_u32_le(out, st.cmd_offset + 16, stroff)?;
    write_u32_le(out, st.cmd_offset + 20, strsize)?;

    update_dysymtab(slice, out, group_sizes, &new_index_of_old)?;

    Ok(())
}

fn update_dysymtab(
    slice: &ArchSlice,
    out: &mut [u8],
    (nlocal, nextdef, nundef): (u32, u32, u32),
    new_index_of_old: &HashMap<usize, u32>,
) -> Result<()> {
    let Some(dy) = &slice.dysymtab else {
        return Ok(());
    };

    write_u32_le(out, dy.cmd_offset + 8, 0)?;
    write_u32_le(out, dy.cmd_offset + 12, nlocal)?;
    write_u32_le(out, dy.cmd_offset + 16, nlocal)?;
    write_u32_le(out, dy.cmd_offset + 20, nextdef)?;
    write_u32_le(out, dy.cmd_offset + 24, nlocal + nextdef)?;
    write_u32_le(out, dy.cmd_offset + 28, nundef)?;

    // Remap indirect symbol table entries to the post-prune indices. An
    // entry whose target was removed takes the strip convention marker.
    for i in 0..dy.nindirectsyms as usize {
        let entry_offset = dy.indirectsymoff as usize + i * 4;
        let value = read_u32_le(out, entry_offset)
            .map_err(|_| Error::Write("indirect symbol table out of bounds".into()))?;
        if value & (INDIRECT_SYMBOL_LOCAL | INDIRECT_SYMBOL_ABS) != 0 {
            continue;
        }
        let new_value = new_index_of_old
            .get(&(value as usize))
            .copied()
            .unwrap_or(INDIRECT_SYMBOL_LOCAL | INDIRECT_SYMBOL_ABS);
        write_u32_le(out, entry_offset, new_value)?;
    }

    Ok(())
}

/// Rebuild the fat container around the serialized slices, recomputing
/// offsets against each architecture's alignment.
fn build_fat(slices: &[ArchSlice], blobs: &[Vec<u8>]) -> Result<Vec<u8>> {
    if slices.is_empty() {
        return Err(Error::Write("empty fat binary".into()));
    }

    let header_size = FAT_HEADER_SIZE + slices.len() * FAT_ARCH_SIZE;
    let mut current = align_to(header_size, 0x4000);
    let mut placements = Vec::with_capacity(slices.len());

    for (slice, blob) in slices.iter().zip(blobs) {
        let alignment = 1usize << slice.fat_align;
        current = align_to(current, alignment);
        placements.push((current, blob.len()));
        current += blob.len();
    }

    let mut out = vec![0u8; current];
    out[0..4].copy_from_slice(&FAT_MAGIC.to_be_bytes());
    out[4..8].copy_from_slice(&(slices.len() as u32).to_be_bytes());

    for (i, (slice, blob)) in slices.iter().zip(blobs).enumerate() {
        let entry = FAT_HEADER_SIZE + i * FAT_ARCH_SIZE;
        let (offset, size) = placements[i];
        out[entry..entry + 4].copy_from_slice(&slice.cputype.to_be_bytes());
        out[entry + 4..entry + 8].copy_from_slice(&slice.cpusubtype.to_be_bytes());
        out[entry + 8..entry + 12].copy_from_slice(&(offset as u32).to_be_bytes());
        out[entry + 12..entry + 16].copy_from_slice(&(size as u32).to_be_bytes());
        out[entry + 16..entry + 20].copy_from_slice(&slice.fat_align.to_be_bytes());
        out[offset..offset + blob.len()].copy_from_slice(blob);
    }

    Ok(out)
}

fn align_to(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

fn splice(out: &mut [u8], offset: usize, bytes: &[u8]) -> Result<()> {
    let end = offset
        .checked_add(bytes.len())
        .filter(|&end| end <= out.len())
        .ok_or_else(|| Error::Write(format!("patch at offset {offset} out of bounds")))?;
    out[offset..end].copy_from_slice(bytes);
    Ok(())
}

fn zero_range(out: &mut [u8], offset: usize, len: usize) -> Result<()> {
    let end = offset
        .checked_add(len)
        .filter(|&end| end <= out.len())
        .ok_or_else(|| Error::Write(format!("blank at offset {offset} out of bounds")))?;
    out[offset..end].fill(0);
    Ok(())
}

/// Writes a fixed 16-byte name field, truncated and zero-padded.
fn write_name16(out: &mut [u8], offset: usize, name: &str) -> Result<()> {
    let mut field = [0u8; 16];
    let bytes = name.as_bytes();
    let len = bytes.len().min(16);
    field[..len].copy_from_slice(&bytes[..len]);
    splice(out, offset, &field)
}

fn write_u32_le(out: &mut [u8], offset: usize, value: u32) -> Result<()> {
    splice(out, offset, &value.to_le_bytes())
}

fn write_u64_le(out: &mut [u8], offset: usize, value: u64) -> Result<()> {
    splice(out, offset, &value.to_le_bytes())
}
