//! Error types.
//!
//! Faults come in two tiers. A `Diagnostic` describes a single bad row
//! (a duplicate line entry, an unknown directory number, ...); it is logged,
//! collected, and ingestion carries on. A `ParseError` means the event
//! stream itself is malformed; the builder abandons the compilation unit it
//! was working on and hands the error back to the producer.

use thiserror::Error;

/// A structural fault in the event stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("mismatched begin/end CFI entries")]
    MismatchedCfiEntry,
    #[error("compilation unit ended with {depth} open scope(s), innermost at {innermost:#x}")]
    UnterminatedScope { depth: usize, innermost: u64 },
    #[error("compilation unit started before the previous one ended")]
    UnitNotClosed,
    #[error("{event} received outside a compilation unit")]
    OutsideUnit { event: &'static str },
    #[error("duplicate debug info entry at offset {0:#x}")]
    DuplicateEntry(u64),
    #[error("no debug info entry at offset {0:#x}")]
    UnknownEntry(u64),
}

/// A recoverable fault affecting a single row.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    #[error("line entry at {address:#x} duplicates an existing one")]
    DuplicateLocation { address: u64 },
    #[error("file {file_num} refers to unknown directory {dir_num}")]
    MissingDirectory { file_num: u32, dir_num: u32 },
    #[error("file key {key:#x} defined twice")]
    DuplicateFile { key: u64 },
    #[error("attribute {attr} of entry {entry:#x} has an unexpected value")]
    UnexpectedAttributeValue { entry: u64, attr: gimli::DwAt },
    #[error("entry {entry:#x} has a second {attr} attribute")]
    DuplicateAttribute { entry: u64, attr: gimli::DwAt },
    #[error("location list entry at {offset:#x} does not belong to any list")]
    OrphanLocListEntry { offset: u64 },
    #[error("location list at {offset:#x} started twice")]
    DuplicateLocList { offset: u64 },
    #[error("call frame at {address:#x} defined twice")]
    DuplicateCallFrame { address: u64 },
    #[error("call frame at {address:#x} was never ended")]
    AbandonedCallFrame { address: u64 },
    #[error("compilation unit {unit} abandoned: {reason}")]
    AbandonedUnit { unit: u32, reason: String },
}

/// Failure to load debug information from an object file.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("object file: {0}")]
    Object(#[from] object::Error),
    #[error("DWARF: {0}")]
    Gimli(#[from] gimli::Error),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Failure to reach the debuggee through the process control layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    #[error("could not read registers of thread {0}")]
    Registers(u32),
    #[error("could not read {count} bytes at {address:#x}")]
    Memory { address: u64, count: usize },
    #[error("no DWARF register {0}")]
    NoSuchRegister(u16),
}
