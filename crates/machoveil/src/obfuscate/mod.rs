//! The mutation passes: symbol pruning and decoy injection, section
//! renaming and alignment override, and post-write string-table scrambling.

pub mod scramble;
pub mod sections;
pub mod symbols;
