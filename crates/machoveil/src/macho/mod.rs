//! Mach-O parsing, mutable model, and serialization.

pub mod parser;
pub mod writer;

pub use parser::{
    ArchSlice, Section, Segment, Symbol, SymbolCategory, SymtabDescriptor, UniversalBinary,
};
