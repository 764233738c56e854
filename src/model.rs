//! Data model types.
//!
//! These are the rows of the symbol database's tables. Rows refer to each
//! other by key (a DWARF section offset or a code address), never by
//! pointer; the `SymbolDb` owns all of them.

use gimli::{DwAt, DwForm, DwTag};
use indexmap::IndexMap;

/// Sentinel meaning "no such key".
pub const INVALID_KEY: u64 = u64::MAX;

/// Pseudo register number under which the canonical frame address rule of a
/// call frame is reported. The CFA rule is always a `ValOffset` or
/// `ValExpression`.
pub const CFA_REGISTER: i32 = -1;

/// A decoded attribute payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttrValue {
    /// Addresses, constants, flags and section offsets.
    Unsigned(u64),
    Signed(i64),
    /// Offset of another DIE in `.debug_info`.
    Reference(u64),
    /// Blocks and location expressions.
    Buffer(Vec<u8>),
    String(String),
}

impl AttrValue {
    /// Returns the value as an unsigned integer, if it is one.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Unsigned(x) | Self::Reference(x) => Some(*x),
            Self::Signed(x) => u64::try_from(*x).ok(),
            Self::Buffer(_) | Self::String(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Buffer(b) => Some(b),
            _ => None,
        }
    }
}

/// One node of the DWARF debug info tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DebugInfoEntry {
    /// Offset of the entry in `.debug_info`. Unique across the database.
    pub key: u64,
    pub tag: DwTag,
    /// Key of the syntactic parent.
    pub parent_key: u64,
    /// Key of the nearest enclosing entry that defines a lexical scope, if
    /// any. This is navigational only; resolve it through the database.
    pub outer_scope: Option<u64>,
    /// Attributes in the order the producer reported them.
    pub attributes: IndexMap<DwAt, AttrValue>,
}

impl DebugInfoEntry {
    pub fn new(key: u64, parent_key: u64, tag: DwTag, outer_scope: Option<u64>) -> Self {
        Self {
            key,
            tag,
            parent_key,
            outer_scope,
            attributes: IndexMap::new(),
        }
    }

    pub fn attr(&self, attr: DwAt) -> Option<&AttrValue> {
        self.attributes.get(&attr)
    }

    pub fn has_attribute(&self, attr: DwAt) -> bool {
        self.attributes.contains_key(&attr)
    }

    /// Gets the `DW_AT_name` attribute, if it is a string.
    pub fn name(&self) -> Option<&str> {
        self.attr(gimli::DW_AT_name)?.as_str()
    }

    /// Gets the low PC of the entry, or 0 if it doesn't have one.
    pub fn low_pc(&self) -> u64 {
        self.attr(gimli::DW_AT_low_pc)
            .and_then(AttrValue::as_u64)
            .unwrap_or(0)
    }

    /// Gets the high PC of the entry, if it has one.
    pub fn high_pc(&self) -> Option<u64> {
        self.attr(gimli::DW_AT_high_pc)?.as_u64()
    }

    /// Gets the frame base of the entry, or 0 if it doesn't have one or it
    /// is not an integer (a location list offset).
    pub fn frame_base(&self) -> u64 {
        self.attr(gimli::DW_AT_frame_base)
            .and_then(AttrValue::as_u64)
            .unwrap_or(0)
    }

    /// Gets the offset of the entry's range list, or `INVALID_KEY` if it
    /// doesn't have one.
    pub fn ranges_offset(&self) -> u64 {
        self.attr(gimli::DW_AT_ranges)
            .and_then(AttrValue::as_u64)
            .unwrap_or(INVALID_KEY)
    }
}

/// A single attribute occurrence, keyed independently of its entry so
/// attributes can be queried by kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DebugInfoAttribute {
    /// Monotonically assigned, unique across the database.
    pub key: u64,
    /// Key of the entry this attribute describes.
    pub parent_key: u64,
    pub tag: DwAt,
    pub form: DwForm,
    pub value: AttrValue,
}

/// A file from a compilation unit's line program header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceFile {
    /// Unit index in the high 32 bits, file number in the low 32 bits.
    pub key: u64,
    pub filename: String,
    /// Directory the file was declared in. Empty if the directory number
    /// did not resolve.
    pub relative_path: String,
    pub current_absolute_path: String,
}

/// Makes a globally unique source file key.
///
/// File numbers are only unique within their compilation unit.
pub fn make_file_key(unit_index: u32, file_num: u32) -> u64 {
    (u64::from(unit_index) << 32) | u64::from(file_num)
}

/// A row of the line table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceLocation {
    /// First code address of the row; the key.
    pub start_address: u64,
    /// Number of code bytes belonging to the row. Never zero.
    pub length: u64,
    pub source_file_key: u64,
    pub line: u32,
    pub column: u32,
}

/// The point at which the active lexical scope changes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScopeTransition {
    pub address: u64,
    /// Key of the scope active from `address` on, or `None` when the code
    /// after `address` is outside every scope.
    pub entry: Option<u64>,
}

/// One entry of a location list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocListEntry {
    pub start_address: u64,
    pub end_address: u64,
    /// A DWARF location expression.
    pub data: Vec<u8>,
}

impl LocListEntry {
    /// Checks whether `address` lies in the entry's range, end inclusive.
    pub fn contains(&self, address: u64) -> bool {
        self.start_address <= address && address <= self.end_address
    }
}

/// One entry of a range list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeListEntry {
    /// Offset of the list in `.debug_ranges`.
    pub offset: u64,
    pub base_address: u64,
    pub low_pc: u64,
    pub high_pc: u64,
}

impl RangeListEntry {
    /// Checks whether `address` lies in `[base + low, base + high)`.
    pub fn contains(&self, address: u64) -> bool {
        let start = self.base_address.wrapping_add(self.low_pc);
        let end = self.base_address.wrapping_add(self.high_pc);
        start <= address && address < end
    }
}

/// How to recover a register's value in the caller's frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CfiRuleKind {
    Undefined,
    SameValue,
    /// Saved at `base_register + offset`.
    Offset { base_register: i32, offset: i64 },
    /// The value is `base_register + offset`.
    ValOffset { base_register: i32, offset: i64 },
    /// Saved in another register.
    Register { base_register: i32 },
    /// Saved at the address computed by a DWARF expression.
    Expression(Vec<u8>),
    /// The value is computed by a DWARF expression.
    ValExpression(Vec<u8>),
}

/// A call frame rule that applies from `address` on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CfiRule {
    pub address: u64,
    /// DWARF register number, or `CFA_REGISTER`.
    pub register: i32,
    pub kind: CfiRuleKind,
}

/// The call frame information for one frame description entry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallFrame {
    /// Low PC of the frame description; the key.
    pub address: u64,
    /// Rules in the order they were reported, which is ascending address.
    pub rules: Vec<CfiRule>,
}

impl CallFrame {
    /// Computes the effective rule for each register at `address`: the last
    /// rule reported for that register whose address is at or below
    /// `address`.
    pub fn rules_at(&self, address: u64) -> Vec<&CfiRule> {
        let mut effective: IndexMap<i32, &CfiRule> = IndexMap::new();
        for rule in self.rules.iter().filter(|r| r.address <= address) {
            effective.insert(rule.register, rule);
        }
        effective.into_iter().map(|(_, r)| r).collect()
    }
}
