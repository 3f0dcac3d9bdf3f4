//! Mach-O parsing into an owned, mutable model.
//!
//! Container and load-command discovery is delegated to goblin; the tables
//! the pipeline mutates (section headers, nlist records, the string table,
//! function starts) are read raw so the model keeps the exact file offsets
//! it later patches.

use crate::{Error, Result};
use goblin::mach::header::{MH_CIGAM, MH_CIGAM_64, MH_MAGIC_64};
use goblin::mach::load_command::CommandVariant;
use goblin::mach::{Mach, MachO};
use std::fs;
use std::path::Path;

/// On-disk size of a section name field.
pub const SECTION_NAME_LEN: usize = 16;

// nlist n_type bits.
pub(crate) const N_STAB: u8 = 0xe0;
pub(crate) const N_TYPE_MASK: u8 = 0x0e;
pub(crate) const N_EXT: u8 = 0x01;
pub(crate) const N_UNDF: u8 = 0x0;
pub(crate) const N_ABS: u8 = 0x2;
pub(crate) const N_PBUD: u8 = 0xc;
pub(crate) const N_INDR: u8 = 0xa;

/// Classification of a symbol-table entry, mirroring the groups a linker
/// records in LC_DYSYMTAB plus the two indirect flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolCategory {
    Local,
    External,
    Undefined,
    IndirectAbs,
    IndirectLocal,
    /// Outside every dysymtab group; never touched by the pruner.
    Other,
}

/// One symbol-table entry. Category is fixed at parse time; symbols are
/// removed by identity (their index in the owning slice), never by value
/// equality, since two entries may share a name.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub category: SymbolCategory,
    pub n_type: u8,
    pub n_sect: u8,
    pub n_desc: u16,
    pub n_value: u64,
    /// Index in the symbol table as parsed, used to remap the indirect
    /// symbol table after pruning. `None` for injected symbols.
    pub(crate) original_index: Option<usize>,
}

impl Symbol {
    /// An exported absolute symbol, as produced by the decoy injector.
    pub(crate) fn exported(address: u64, name: impl Into<String>) -> Self {
        Symbol {
            name: name.into(),
            category: SymbolCategory::External,
            n_type: N_ABS | N_EXT,
            n_sect: 0,
            n_desc: 0,
            n_value: address,
            original_index: None,
        }
    }
}

/// One section header. Renaming or re-aligning a section only changes the
/// stored name bytes / alignment exponent, never its size or file offset.
#[derive(Debug, Clone)]
pub struct Section {
    name: String,
    align: u32,
    pub size: u64,
    /// File offset of this section header within the slice.
    pub(crate) header_offset: usize,
}

impl Section {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace the stored name. Serialized truncated/zero-padded to the
    /// 16-byte on-disk field.
    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    pub fn alignment(&self) -> u32 {
        self.align
    }

    pub fn set_alignment(&mut self, exponent: u32) {
        self.align = exponent;
    }
}

#[derive(Debug, Clone)]
pub struct Segment {
    name: String,
    pub(crate) sections: Vec<Section>,
}

impl Segment {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn sections_mut(&mut self) -> &mut [Section] {
        &mut self.sections
    }
}

/// Location of the symbol and string tables, relative to the slice header.
#[derive(Debug, Clone, Copy)]
pub struct SymtabDescriptor {
    pub(crate) cmd_offset: usize,
    pub symoff: u32,
    pub nsyms: u32,
    pub strings_offset: u32,
    pub strings_size: u32,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct DysymtabInfo {
    pub cmd_offset: usize,
    pub ilocalsym: u32,
    pub nlocalsym: u32,
    pub iextdefsym: u32,
    pub nextdefsym: u32,
    pub iundefsym: u32,
    pub nundefsym: u32,
    pub indirectsymoff: u32,
    pub nindirectsyms: u32,
}

/// LC_FUNCTION_STARTS with its uleb128 stream decoded to addresses.
#[derive(Debug, Clone)]
pub(crate) struct FunctionStarts {
    pub cmd_offset: usize,
    pub dataoff: u32,
    pub datasize: u32,
    pub addresses: Vec<u64>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct LinkeditInfo {
    pub cmd_offset: usize,
    pub fileoff: u64,
}

/// One architecture-specific Mach-O image.
#[derive(Debug)]
pub struct ArchSlice {
    pub(crate) data: Vec<u8>,
    pub(crate) is_64: bool,
    fat_offset: u64,
    pub(crate) cputype: u32,
    pub(crate) cpusubtype: u32,
    pub(crate) fat_align: u32,
    pub(crate) segments: Vec<Segment>,
    pub(crate) symbols: Vec<Symbol>,
    pub(crate) symtab: Option<SymtabDescriptor>,
    pub(crate) dysymtab: Option<DysymtabInfo>,
    pub(crate) function_starts: Option<FunctionStarts>,
    pub(crate) linkedit: Option<LinkeditInfo>,
}

impl ArchSlice {
    /// Byte offset of this slice's Mach-O header within the file; 0 for
    /// thin binaries.
    pub fn fat_offset(&self) -> u64 {
        self.fat_offset
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn segments_mut(&mut self) -> &mut [Segment] {
        &mut self.segments
    }

    pub fn symbol_table_descriptor(&self) -> Option<&SymtabDescriptor> {
        self.symtab.as_ref()
    }

    /// Remove symbols by identity. Indices refer to the current symbol list;
    /// out-of-range or duplicate indices are ignored, so removal is
    /// idempotent on already-absent identities.
    pub fn remove_symbols(&mut self, indices: &[usize]) {
        if indices.is_empty() {
            return;
        }
        let doomed: std::collections::BTreeSet<usize> = indices.iter().copied().collect();
        let mut idx = 0usize;
        self.symbols.retain(|_| {
            let keep = !doomed.contains(&idx);
            idx += 1;
            keep
        });
    }

    /// Append an exported symbol with the given address and name. Duplicate
    /// names are permitted; the entry is always appended.
    pub fn add_exported_function(&mut self, address: u64, name: &str) {
        self.symbols.push(Symbol::exported(address, name));
    }

    /// Replace the function-start address list with an empty list.
    pub fn clear_function_starts(&mut self) {
        if let Some(fs) = self.function_starts.as_mut() {
            fs.addresses.clear();
        }
    }

    /// Decoded function-start addresses (empty once cleared).
    pub fn function_start_addresses(&self) -> &[u64] {
        self.function_starts
            .as_ref()
            .map(|fs| fs.addresses.as_slice())
            .unwrap_or(&[])
    }
}

/// An ordered set of architecture slices parsed from one file. Thin files
/// hold a single slice at `fat_offset` 0.
#[derive(Debug)]
pub struct UniversalBinary {
    pub(crate) slices: Vec<ArchSlice>,
    pub(crate) is_fat: bool,
}

struct FatEntry {
    offset: usize,
    size: usize,
    cputype: u32,
    cpusubtype: u32,
    align: u32,
}

/// Largest fat alignment exponent accepted from a container header.
const MAX_FAT_ALIGN_EXPONENT: u32 = 30;

impl UniversalBinary {
    /// Parse a file into per-architecture slices.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let data = fs::read(path.as_ref())?;
        Self::parse(data)
    }

    /// Parse Mach-O bytes into per-architecture slices.
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        let entries = {
            let mach = Mach::parse(&data)
                .map_err(|e| Error::Parse(format!("failed to parse: {e}")))?;
            match mach {
                Mach::Binary(_) => None,
                Mach::Fat(fat) => {
                    let mut entries = Vec::new();
                    for (i, arch) in fat.iter_arches().enumerate() {
                        let arch = arch
                            .map_err(|e| Error::Parse(format!("fat arch {i}: {e}")))?;
                        if arch.align > MAX_FAT_ALIGN_EXPONENT {
                            return Err(Error::Parse(format!(
                                "fat arch {i} alignment exponent {} exceeds {}",
                                arch.align, MAX_FAT_ALIGN_EXPONENT
                            )));
                        }
                        entries.push(FatEntry {
                            offset: arch.offset as usize,
                            size: arch.size as usize,
                            cputype: arch.cputype as u32,
                            cpusubtype: arch.cpusubtype as u32,
                            align: arch.align,
                        });
                    }
                    Some(entries)
                }
            }
        };

        match entries {
            None => {
                let slice = parse_slice(data, 0, None)?;
                Ok(UniversalBinary {
                    slices: vec![slice],
                    is_fat: false,
                })
            }
            Some(entries) => {
                let mut slices = Vec::with_capacity(entries.len());
                for (i, entry) in entries.iter().enumerate() {
                    let end = entry
                        .offset
                        .checked_add(entry.size)
                        .filter(|&end| end <= data.len())
                        .ok_or_else(|| {
                            Error::Parse(format!("fat arch {i} extends past end of file"))
                        })?;
                    let slice_data = data[entry.offset..end].to_vec();
                    slices.push(parse_slice(
                        slice_data,
                        entry.offset as u64,
                        Some((entry.cputype, entry.cpusubtype, entry.align)),
                    )?);
                }
                Ok(UniversalBinary {
                    slices,
                    is_fat: true,
                })
            }
        }
    }

    pub fn slices(&self) -> &[ArchSlice] {
        &self.slices
    }

    pub fn slices_mut(&mut self) -> &mut [ArchSlice] {
        &mut self.slices
    }

    pub fn is_fat(&self) -> bool {
        self.is_fat
    }

    /// Serialize the (possibly mutated) binary to `path`.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        super::writer::write_universal(self, path.as_ref())
    }
}

fn parse_slice(
    data: Vec<u8>,
    fat_offset: u64,
    fat_meta: Option<(u32, u32, u32)>,
) -> Result<ArchSlice> {
    let magic = read_u32_le(&data, 0)?;
    if magic == MH_CIGAM || magic == MH_CIGAM_64 {
        return Err(Error::Parse(
            "byte-swapped (big-endian) Mach-O slices are not supported".into(),
        ));
    }
    let is_64 = magic == MH_MAGIC_64;

    let macho = MachO::parse(&data, 0)
        .map_err(|e| Error::Parse(format!("failed to parse slice: {e}")))?;

    let mut segments = Vec::new();
    let mut symtab = None;
    let mut dysymtab = None;
    let mut function_starts = None;
    let mut linkedit = None;

    for lc in &macho.load_commands {
        match &lc.command {
            CommandVariant::Segment64(seg) => {
                let name = fixed_string(&seg.segname);
                if name == "__LINKEDIT" {
                    linkedit = Some(LinkeditInfo {
                        cmd_offset: lc.offset,
                        fileoff: seg.fileoff,
                    });
                }
                segments.push(parse_segment(&data, lc.offset, name, seg.nsects, true)?);
            }
            CommandVariant::Segment32(seg) => {
                let name = fixed_string(&seg.segname);
                if name == "__LINKEDIT" {
                    linkedit = Some(LinkeditInfo {
                        cmd_offset: lc.offset,
                        fileoff: seg.fileoff as u64,
                    });
                }
                segments.push(parse_segment(&data, lc.offset, name, seg.nsects, false)?);
            }
            CommandVariant::Symtab(st) => {
                symtab = Some(SymtabDescriptor {
                    cmd_offset: lc.offset,
                    symoff: st.symoff,
                    nsyms: st.nsyms,
                    strings_offset: st.stroff,
                    strings_size: st.strsize,
                });
            }
            CommandVariant::Dysymtab(dy) => {
                dysymtab = Some(DysymtabInfo {
                    cmd_offset: lc.offset,
                    ilocalsym: dy.ilocalsym,
                    nlocalsym: dy.nlocalsym,
                    iextdefsym: dy.iextdefsym,
                    nextdefsym: dy.nextdefsym,
                    iundefsym: dy.iundefsym,
                    nundefsym: dy.nundefsym,
                    indirectsymoff: dy.indirectsymoff,
                    nindirectsyms: dy.nindirectsyms,
                });
            }
            CommandVariant::FunctionStarts(fs) => {
                let addresses = decode_function_starts(&data, fs.dataoff, fs.datasize)?;
                function_starts = Some(FunctionStarts {
                    cmd_offset: lc.offset,
                    dataoff: fs.dataoff,
                    datasize: fs.datasize,
                    addresses,
                });
            }
            _ => {}
        }
    }

    let symbols = match symtab {
        Some(st) => parse_symbols(&data, &st, dysymtab.as_ref(), is_64)?,
        None => Vec::new(),
    };

    let (cputype, cpusubtype, fat_align) = match fat_meta {
        Some(meta) => meta,
        // Thin slice; cputype/cpusubtype straight from the header, the fat
        // alignment is never used.
        None => (read_u32_le(&data, 4)?, read_u32_le(&data, 8)?, 14),
    };

    Ok(ArchSlice {
        data,
        is_64,
        fat_offset,
        cputype,
        cpusubtype,
        fat_align,
        segments,
        symbols,
        symtab,
        dysymtab,
        function_starts,
        linkedit,
    })
}

fn parse_segment(
    data: &[u8],
    cmd_offset: usize,
    name: String,
    nsects: u32,
    is_64: bool,
) -> Result<Segment> {
    let (base, entry_size, align_off) = if is_64 {
        (cmd_offset + 72, 80, 52)
    } else {
        (cmd_offset + 56, 68, 44)
    };

    let mut sections = Vec::with_capacity(nsects as usize);
    for i in 0..nsects as usize {
        let header_offset = base + i * entry_size;
        let sect_name = read_name16(data, header_offset)?;
        let size = if is_64 {
            read_u64_le(data, header_offset + 40)?
        } else {
            read_u32_le(data, header_offset + 36)? as u64
        };
        let align = read_u32_le(data, header_offset + align_off)?;
        sections.push(Section {
            name: sect_name,
            align,
            size,
            header_offset,
        });
    }

    Ok(Segment { name, sections })
}

fn parse_symbols(
    data: &[u8],
    st: &SymtabDescriptor,
    dysymtab: Option<&DysymtabInfo>,
    is_64: bool,
) -> Result<Vec<Symbol>> {
    let entry_size = if is_64 { 16 } else { 12 };
    let symoff = st.symoff as usize;
    let stroff = st.strings_offset as usize;
    let strsize = st.strings_size as usize;

    let mut symbols = Vec::with_capacity(st.nsyms as usize);
    for index in 0..st.nsyms as usize {
        let off = symoff + index * entry_size;
        let record = data
            .get(off..off + entry_size)
            .ok_or_else(|| Error::Parse(format!("nlist entry {index} out of bounds")))?;
        let n_strx = u32::from_le_bytes(record[0..4].try_into().expect("4-byte slice")) as usize;
        let n_type = record[4];
        let n_sect = record[5];
        let n_desc = u16::from_le_bytes([record[6], record[7]]);
        let n_value = if is_64 {
            u64::from_le_bytes(record[8..16].try_into().expect("8-byte slice"))
        } else {
            u32::from_le_bytes(record[8..12].try_into().expect("4-byte slice")) as u64
        };

        let name = read_strtab_name(data, stroff, strsize, n_strx);
        let category = classify(n_type, index, dysymtab);

        symbols.push(Symbol {
            name,
            category,
            n_type,
            n_sect,
            n_desc,
            n_value,
            original_index: Some(index),
        });
    }
    Ok(symbols)
}

fn classify(n_type: u8, index: usize, dysymtab: Option<&DysymtabInfo>) -> SymbolCategory {
    if n_type & N_STAB != 0 {
        return SymbolCategory::Local;
    }
    if n_type & N_TYPE_MASK == N_INDR {
        return if n_type & N_EXT != 0 {
            SymbolCategory::IndirectAbs
        } else {
            SymbolCategory::IndirectLocal
        };
    }
    if let Some(dy) = dysymtab {
        let i = index as u32;
        if i >= dy.ilocalsym && i < dy.ilocalsym.saturating_add(dy.nlocalsym) {
            return SymbolCategory::Local;
        }
        if i >= dy.iextdefsym && i < dy.iextdefsym.saturating_add(dy.nextdefsym) {
            return SymbolCategory::External;
        }
        if i >= dy.iundefsym && i < dy.iundefsym.saturating_add(dy.nundefsym) {
            return SymbolCategory::Undefined;
        }
        return SymbolCategory::Other;
    }
    match n_type & N_TYPE_MASK {
        t if (t == N_UNDF || t == N_PBUD) && n_type & N_EXT != 0 => SymbolCategory::Undefined,
        _ if n_type & N_EXT != 0 => SymbolCategory::External,
        _ => SymbolCategory::Local,
    }
}

/// Bounded, lossy string-table lookup. Returns an empty name for index 0,
/// out-of-range indices, and unterminated entries past the table end; a
/// scrambled table must still produce a parseable model.
fn read_strtab_name(data: &[u8], stroff: usize, strsize: usize, n_strx: usize) -> String {
    if n_strx == 0 || n_strx >= strsize {
        return String::new();
    }
    let start = match stroff.checked_add(n_strx) {
        Some(s) if s < data.len() => s,
        _ => return String::new(),
    };
    let table_end = stroff.saturating_add(strsize).min(data.len());
    let bytes = &data[start..table_end];
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Decode an LC_FUNCTION_STARTS uleb128 delta stream into addresses.
/// A zero delta terminates the stream (trailing padding).
fn decode_function_starts(data: &[u8], dataoff: u32, datasize: u32) -> Result<Vec<u64>> {
    let start = dataoff as usize;
    let end = start
        .checked_add(datasize as usize)
        .filter(|&end| end <= data.len())
        .ok_or_else(|| Error::Parse("function starts data out of bounds".into()))?;
    let stream = &data[start..end];

    let mut addresses = Vec::new();
    let mut address = 0u64;
    let mut pos = 0usize;
    while pos < stream.len() {
        let (value, len) = decode_uleb128(&stream[pos..])
            .ok_or_else(|| Error::Parse("truncated uleb128 in function starts".into()))?;
        pos += len;
        if value == 0 {
            break;
        }
        address = address.wrapping_add(value);
        addresses.push(address);
    }
    Ok(addresses)
}

fn decode_uleb128(bytes: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (i, &b) in bytes.iter().enumerate() {
        if shift >= 64 {
            return None;
        }
        value |= u64::from(b & 0x7f) << shift;
        if b & 0x80 == 0 {
            return Some((value, i + 1));
        }
        shift += 7;
    }
    None
}

/// Reads a NUL-padded fixed 16-byte name field.
fn read_name16(data: &[u8], offset: usize) -> Result<String> {
    let bytes = data
        .get(offset..offset + SECTION_NAME_LEN)
        .ok_or_else(|| Error::Parse("section header out of bounds".into()))?;
    Ok(fixed_string_bytes(bytes))
}

fn fixed_string(bytes: &[u8; 16]) -> String {
    fixed_string_bytes(bytes)
}

fn fixed_string_bytes(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

pub(crate) fn read_u32_le(data: &[u8], offset: usize) -> Result<u32> {
    let bytes = data
        .get(offset..offset + 4)
        .ok_or_else(|| Error::Parse(format!("read past end of file at offset {offset}")))?;
    Ok(u32::from_le_bytes(bytes.try_into().expect("4-byte slice")))
}

pub(crate) fn read_u64_le(data: &[u8], offset: usize) -> Result<u64> {
    let bytes = data
        .get(offset..offset + 8)
        .ok_or_else(|| Error::Parse(format!("read past end of file at offset {offset}")))?;
    Ok(u64::from_le_bytes(bytes.try_into().expect("8-byte slice")))
}
