//! Hand-assembled Mach-O images for integration tests.
//!
//! Builds a minimal but structurally valid 64-bit little-endian executable:
//! `__TEXT` (with `__text` and `__unwind_info`), `__DATA_CONST` (with
//! `__got`), `__LINKEDIT` holding function starts, an indirect symbol
//! table, and a symtab/strtab populated from a caller-supplied symbol list.
//! `fat_macho` wraps prebuilt thin images into a universal container.

#![allow(dead_code)]

pub const MH_MAGIC_64: u32 = 0xfeed_facf;
pub const FAT_MAGIC: u32 = 0xcafe_babe;
const CPU_TYPE_ARM64: u32 = 0x0100_000c;
const MH_EXECUTE: u32 = 0x2;
const LC_SEGMENT_64: u32 = 0x19;
const LC_SYMTAB: u32 = 0x2;
const LC_DYSYMTAB: u32 = 0xb;
const LC_FUNCTION_STARTS: u32 = 0x26;

const HEADER_SIZE: usize = 32;
const SEG64_SIZE: usize = 72;
const SECT64_SIZE: usize = 80;
const NLIST64_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymKind {
    Local,
    External,
    Undefined,
    IndirectAbs,
    IndirectLocal,
}

/// The standard scenario symbol set: 10 local, 5 external, 3 indirect.
pub fn scenario_symbols() -> Vec<(String, SymKind)> {
    let mut symbols = Vec::new();
    for i in 0..10 {
        symbols.push((format!("_local_{i}"), SymKind::Local));
    }
    for i in 0..5 {
        symbols.push((format!("_ext_{i}"), SymKind::External));
    }
    for i in 0..3 {
        symbols.push((format!("_indirect_{i}"), SymKind::IndirectAbs));
    }
    symbols
}

struct Buf(Vec<u8>);

impl Buf {
    fn u32(&mut self, v: u32) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn u64(&mut self, v: u64) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn u16(&mut self, v: u16) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn bytes(&mut self, b: &[u8]) {
        self.0.extend_from_slice(b);
    }
    fn name16(&mut self, name: &str) {
        let mut field = [0u8; 16];
        let len = name.len().min(16);
        field[..len].copy_from_slice(&name.as_bytes()[..len]);
        self.0.extend_from_slice(&field);
    }
}

/// Build a thin 64-bit Mach-O executable holding the given symbols.
///
/// Symbols are laid out grouped (locals, externally defined, undefined) with
/// matching LC_DYSYMTAB ranges, the way a linker emits them. Indirect kinds
/// use `N_INDR`-typed entries placed in the externally-defined group.
pub fn thin_macho(symbols: &[(String, SymKind)]) -> Vec<u8> {
    // Group like a linker would; indirect-local entries sort with locals.
    let locals: Vec<_> = symbols
        .iter()
        .filter(|(_, k)| matches!(k, SymKind::Local | SymKind::IndirectLocal))
        .collect();
    let extdefs: Vec<_> = symbols
        .iter()
        .filter(|(_, k)| matches!(k, SymKind::External | SymKind::IndirectAbs))
        .collect();
    let undefs: Vec<_> = symbols
        .iter()
        .filter(|(_, k)| matches!(k, SymKind::Undefined))
        .collect();
    let ordered: Vec<_> = locals
        .iter()
        .chain(extdefs.iter())
        .chain(undefs.iter())
        .copied()
        .collect();
    let nsyms = ordered.len();

    // Fixed layout: header + 6 load commands end at 0x260.
    let sizeofcmds = (SEG64_SIZE + 2 * SECT64_SIZE) // __TEXT
        + (SEG64_SIZE + SECT64_SIZE) // __DATA_CONST
        + SEG64_SIZE // __LINKEDIT
        + 16 // LC_FUNCTION_STARTS
        + 24 // LC_SYMTAB
        + 80; // LC_DYSYMTAB
    let text_sect_off = HEADER_SIZE + sizeofcmds; // 0x260
    let unwind_sect_off = text_sect_off + 16;
    let text_filesize = unwind_sect_off + 8;
    let got_off = text_filesize;
    let linkedit_off = got_off + 8;
    let funcstarts_off = linkedit_off;
    let funcstarts_size = 8usize;
    let indirect_off = funcstarts_off + funcstarts_size;
    let nindirect = 2usize;
    let symoff = indirect_off + nindirect * 4;
    let stroff = symoff + nsyms * NLIST64_SIZE;

    let mut strtab = vec![0u8];
    let mut strx = Vec::with_capacity(nsyms);
    for (name, _) in &ordered {
        strx.push(strtab.len() as u32);
        strtab.extend_from_slice(name.as_bytes());
        strtab.push(0);
    }
    let strsize = strtab.len();
    let file_end = stroff + strsize;

    let mut b = Buf(Vec::with_capacity(file_end));

    // mach_header_64
    b.u32(MH_MAGIC_64);
    b.u32(CPU_TYPE_ARM64);
    b.u32(0); // cpusubtype
    b.u32(MH_EXECUTE);
    b.u32(6); // ncmds
    b.u32(sizeofcmds as u32);
    b.u32(0); // flags
    b.u32(0); // reserved

    // __TEXT
    segment64(&mut b, "__TEXT", 0x1_0000_0000, 0x4000, 0, text_filesize as u64, 2, 5);
    section64(&mut b, "__text", "__TEXT", 0x1_0000_0000 + text_sect_off as u64, 16, text_sect_off, 4);
    section64(&mut b, "__unwind_info", "__TEXT", 0x1_0000_0000 + unwind_sect_off as u64, 8, unwind_sect_off, 2);

    // __DATA_CONST
    segment64(&mut b, "__DATA_CONST", 0x1_0000_4000, 0x4000, got_off as u64, 8, 1, 3);
    section64(&mut b, "__got", "__DATA_CONST", 0x1_0000_4000, 8, got_off, 3);

    // __LINKEDIT
    segment64(
        &mut b,
        "__LINKEDIT",
        0x1_0000_8000,
        0x4000,
        linkedit_off as u64,
        (file_end - linkedit_off) as u64,
        0,
        1,
    );

    // LC_FUNCTION_STARTS
    b.u32(LC_FUNCTION_STARTS);
    b.u32(16);
    b.u32(funcstarts_off as u32);
    b.u32(funcstarts_size as u32);

    // LC_SYMTAB
    b.u32(LC_SYMTAB);
    b.u32(24);
    b.u32(symoff as u32);
    b.u32(nsyms as u32);
    b.u32(stroff as u32);
    b.u32(strsize as u32);

    // LC_DYSYMTAB
    b.u32(LC_DYSYMTAB);
    b.u32(80);
    b.u32(0);
    b.u32(locals.len() as u32);
    b.u32(locals.len() as u32);
    b.u32(extdefs.len() as u32);
    b.u32((locals.len() + extdefs.len()) as u32);
    b.u32(undefs.len() as u32);
    for _ in 0..6 {
        b.u32(0); // toc, modtab, extrefsyms
    }
    b.u32(indirect_off as u32);
    b.u32(nindirect as u32);
    for _ in 0..4 {
        b.u32(0); // extrel, locrel
    }
    assert_eq!(b.0.len(), text_sect_off, "load command layout mismatch");

    // __text and __unwind_info contents
    b.bytes(&[0xaa; 16]);
    b.bytes(&[0xbb; 8]);
    // __got slot
    b.bytes(&[0xcc; 8]);

    // Function starts: two uleb deltas then terminator padding.
    b.bytes(&[0x60, 0x10, 0, 0, 0, 0, 0, 0]);

    // Indirect symbol table: one real reference (first extdef if present)
    // and one LOCAL-flagged placeholder.
    let referenced = if !extdefs.is_empty() {
        locals.len() as u32
    } else {
        0x4000_0000
    };
    b.u32(referenced);
    b.u32(0x8000_0000);

    // nlist_64 records
    assert_eq!(b.0.len(), symoff);
    for (i, (_, kind)) in ordered.iter().enumerate() {
        let (n_type, n_sect, n_value) = match kind {
            SymKind::Local => (0x0eu8, 1u8, 0x1_0000_0000 + (text_sect_off + i * 4) as u64),
            SymKind::External => (0x0f, 1, 0x1_0000_0000 + (text_sect_off + i * 4) as u64),
            SymKind::Undefined => (0x01, 0, 0),
            SymKind::IndirectAbs => (0x0b, 0, 0),
            SymKind::IndirectLocal => (0x0a, 0, 0),
        };
        b.u32(strx[i]);
        b.0.push(n_type);
        b.0.push(n_sect);
        b.u16(0);
        b.u64(n_value);
    }

    assert_eq!(b.0.len(), stroff);
    b.bytes(&strtab);
    assert_eq!(b.0.len(), file_end);
    b.0
}

fn segment64(
    b: &mut Buf,
    name: &str,
    vmaddr: u64,
    vmsize: u64,
    fileoff: u64,
    filesize: u64,
    nsects: u32,
    prot: u32,
) {
    b.u32(LC_SEGMENT_64);
    b.u32((SEG64_SIZE + nsects as usize * SECT64_SIZE) as u32);
    b.name16(name);
    b.u64(vmaddr);
    b.u64(vmsize);
    b.u64(fileoff);
    b.u64(filesize);
    b.u32(prot); // maxprot
    b.u32(prot); // initprot
    b.u32(nsects);
    b.u32(0); // flags
}

fn section64(b: &mut Buf, name: &str, segname: &str, addr: u64, size: u64, offset: usize, align: u32) {
    b.name16(name);
    b.name16(segname);
    b.u64(addr);
    b.u64(size);
    b.u32(offset as u32);
    b.u32(align);
    b.u32(0); // reloff
    b.u32(0); // nreloc
    b.u32(0); // flags
    b.u32(0); // reserved1
    b.u32(0); // reserved2
    b.u32(0); // reserved3
}

/// Wrap prebuilt thin images into a universal (fat) container, slices
/// page-aligned (alignment exponent 12).
pub fn fat_macho(slices: &[Vec<u8>]) -> Vec<u8> {
    const ALIGN_EXP: u32 = 12;
    let alignment = 1usize << ALIGN_EXP;

    let header_size = 8 + slices.len() * 20;
    let mut placements = Vec::with_capacity(slices.len());
    let mut current = header_size;
    for slice in slices {
        current = (current + alignment - 1) & !(alignment - 1);
        placements.push(current);
        current += slice.len();
    }

    let mut out = vec![0u8; current];
    out[0..4].copy_from_slice(&FAT_MAGIC.to_be_bytes());
    out[4..8].copy_from_slice(&(slices.len() as u32).to_be_bytes());
    for (i, slice) in slices.iter().enumerate() {
        let cputype = u32::from_le_bytes(slice[4..8].try_into().unwrap());
        let cpusubtype = u32::from_le_bytes(slice[8..12].try_into().unwrap());
        let entry = 8 + i * 20;
        out[entry..entry + 4].copy_from_slice(&cputype.to_be_bytes());
        out[entry + 4..entry + 8].copy_from_slice(&cpusubtype.to_be_bytes());
        out[entry + 8..entry + 12].copy_from_slice(&(placements[i] as u32).to_be_bytes());
        out[entry + 12..entry + 16].copy_from_slice(&(slices[i].len() as u32).to_be_bytes());
        out[entry + 16..entry + 20].copy_from_slice(&ALIGN_EXP.to_be_bytes());
        out[placements[i]..placements[i] + slice.len()].copy_from_slice(slice);
    }
    out
}
