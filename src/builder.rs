//! Turning a stream of decoded DWARF events into a `SymbolDb`.
//!
//! The producer (see `dwarf_parser`) walks the debug info and calls the
//! `DwarfEvents` methods in traversal order. The builder keeps a stack of
//! open lexical scopes and records a scope transition whenever a scope is
//! entered or left, so address-to-scope lookups never need to walk the tree.

use std::collections::{BTreeMap, HashSet};

use gimli::{DwAt, DwForm, DwTag};
use tracing::{debug, trace, warn};

use crate::error::{Diagnostic, ParseError};
use crate::model::*;
use crate::SymbolDb;

/// Sink for decoded DWARF events.
///
/// Unit-scoped events (entries, attributes, directories, files and lines)
/// must arrive between `start_compilation_unit` and
/// `end_compilation_unit`. Location lists, range lists and call frame
/// information may arrive at any time.
pub trait DwarfEvents {
    fn start_compilation_unit(&mut self) -> Result<(), ParseError>;
    fn end_compilation_unit(&mut self) -> Result<(), ParseError>;
    /// Gives up on the open compilation unit, if any, discarding what it
    /// reported.
    fn abandon_compilation_unit(&mut self, reason: String);

    fn start_die(&mut self, parent: u64, offset: u64, tag: DwTag) -> Result<(), ParseError>;
    fn end_die(&mut self, offset: u64) -> Result<(), ParseError>;

    /// Reports an attribute of the entry at `offset`. `parent` is the entry
    /// that owns the attribute record, and the scope entered if this is a
    /// `DW_AT_low_pc`.
    fn process_attribute(
        &mut self,
        offset: u64,
        parent: u64,
        attr: DwAt,
        form: DwForm,
        value: AttrValue,
    ) -> Result<(), ParseError>;

    fn define_dir(&mut self, name: &str, dir_num: u32) -> Result<(), ParseError>;
    fn define_file(&mut self, name: &str, file_num: u32, dir_num: u32) -> Result<(), ParseError>;
    fn add_line(
        &mut self,
        address: u64,
        length: u64,
        file_num: u32,
        line: u32,
        column: u32,
    ) -> Result<(), ParseError>;

    fn add_loc_list_entry(
        &mut self,
        offset: u64,
        is_first_entry: bool,
        low_pc: u64,
        high_pc: u64,
        data: &[u8],
    ) -> Result<(), ParseError>;
    fn add_range_list_entry(
        &mut self,
        offset: u64,
        base_address: u64,
        low_pc: u64,
        high_pc: u64,
    ) -> Result<(), ParseError>;

    fn begin_cfi_entry(&mut self, address: u64) -> Result<(), ParseError>;
    fn add_cfi_rule(
        &mut self,
        address: u64,
        register: i32,
        kind: CfiRuleKind,
    ) -> Result<(), ParseError>;
    fn end_cfi_entry(&mut self) -> Result<(), ParseError>;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    Idle,
    InUnit,
}

/// Record of one table change made during the open compilation unit, so
/// the unit can be backed out if it turns out to be malformed.
#[derive(Debug)]
enum Undo {
    Entry(u64),
    Attribute(u64),
    /// An attribute added to an entry that predates the unit.
    EntryAttribute { entry: u64, attr: DwAt },
    File(u64),
    Location(u64),
    Transition {
        address: u64,
        previous: Option<ScopeTransition>,
    },
}

/// Builds a `SymbolDb` from `DwarfEvents`.
#[derive(Debug)]
pub struct SymbolDbBuilder {
    db: SymbolDb,
    state: State,
    /// Keys of the currently open lexical scopes, innermost last.
    scope_stack: Vec<u64>,
    next_attribute: u64,
    unit_index: u32,
    /// Directory table of the open unit.
    dirs: BTreeMap<u32, String>,
    /// Offset of the location list receiving entries.
    current_loc_list: Option<u64>,
    current_frame: Option<CallFrame>,
    journal: Vec<Undo>,
    /// Entries created by the open unit.
    unit_entries: HashSet<u64>,
}

impl Default for SymbolDbBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolDbBuilder {
    pub fn new() -> Self {
        Self {
            db: SymbolDb::default(),
            state: State::Idle,
            scope_stack: vec![],
            next_attribute: 0,
            unit_index: 0,
            dirs: BTreeMap::new(),
            current_loc_list: None,
            current_frame: None,
            journal: vec![],
            unit_entries: HashSet::new(),
        }
    }

    /// Finishes ingestion and indexes the result.
    ///
    /// A compilation unit that is still open is abandoned, as is a call
    /// frame that was never ended.
    pub fn build(self) -> SymbolDb {
        let mut db = self.into_tables();
        db.build_indices();
        db
    }

    /// Finishes ingestion without building indices.
    pub fn into_tables(mut self) -> SymbolDb {
        if self.state == State::InUnit {
            let unit = self.unit_index;
            self.abandon_unit(format!("unit {unit} was never ended"));
        }
        if let Some(frame) = self.current_frame.take() {
            self.diagnose(Diagnostic::AbandonedCallFrame {
                address: frame.address,
            });
        }
        debug!(
            "ingested {} entries, {} attributes, {} line rows, {} diagnostics",
            self.db.entries.len(),
            self.db.attributes.len(),
            self.db.locations.len(),
            self.db.diagnostics.len(),
        );
        self.db
    }

    /// Index of the most recently started compilation unit. Units are
    /// numbered from 1.
    pub fn unit_index(&self) -> u32 {
        self.unit_index
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.db.diagnostics
    }

    fn diagnose(&mut self, d: Diagnostic) {
        warn!("{d}");
        self.db.diagnostics.push(d);
    }

    fn require_unit(&self, event: &'static str) -> Result<(), ParseError> {
        if self.state == State::InUnit {
            Ok(())
        } else {
            Err(ParseError::OutsideUnit { event })
        }
    }

    /// Reports a structural fault. If a unit is open, everything it added
    /// is backed out first.
    fn fail(&mut self, error: ParseError) -> Result<(), ParseError> {
        if self.state == State::InUnit {
            self.abandon_unit(error.to_string());
        }
        Err(error)
    }

    fn abandon_unit(&mut self, reason: String) {
        while let Some(undo) = self.journal.pop() {
            match undo {
                Undo::Entry(key) => {
                    self.db.entries.remove(&key);
                }
                Undo::Attribute(key) => {
                    self.db.attributes.remove(&key);
                }
                Undo::EntryAttribute { entry, attr } => {
                    if let Some(e) = self.db.entries.get_mut(&entry) {
                        e.attributes.shift_remove(&attr);
                    }
                }
                Undo::File(key) => {
                    self.db.files.remove(&key);
                }
                Undo::Location(address) => {
                    self.db.locations.remove(&address);
                }
                Undo::Transition { address, previous } => match previous {
                    Some(t) => {
                        self.db.scope_transitions.insert(address, t);
                    }
                    None => {
                        self.db.scope_transitions.remove(&address);
                    }
                },
            }
        }
        self.scope_stack.clear();
        self.dirs.clear();
        self.unit_entries.clear();
        self.state = State::Idle;
        self.diagnose(Diagnostic::AbandonedUnit {
            unit: self.unit_index,
            reason,
        });
    }

    /// Records that the scope `entry` is active from `address` on. An
    /// existing transition at the same address is replaced.
    fn set_transition(&mut self, address: u64, entry: Option<u64>) {
        let previous = self
            .db
            .scope_transitions
            .insert(address, ScopeTransition { address, entry });
        if let Some(p) = &previous {
            trace!(
                "transition at {address:#x} now {entry:x?} (was {:x?})",
                p.entry
            );
        }
        self.journal.push(Undo::Transition { address, previous });
    }

    fn file_key(&self, file_num: u32) -> u64 {
        make_file_key(self.unit_index, file_num)
    }
}

impl DwarfEvents for SymbolDbBuilder {
    fn start_compilation_unit(&mut self) -> Result<(), ParseError> {
        if self.state == State::InUnit {
            return self.fail(ParseError::UnitNotClosed);
        }
        // File and directory numbers are only unique within a unit.
        self.dirs.clear();
        self.journal.clear();
        self.unit_entries.clear();
        self.unit_index += 1;
        self.state = State::InUnit;
        trace!("start unit {}", self.unit_index);
        Ok(())
    }

    fn end_compilation_unit(&mut self) -> Result<(), ParseError> {
        self.require_unit("end_compilation_unit")?;
        if let Some(&innermost) = self.scope_stack.last() {
            let depth = self.scope_stack.len();
            return self.fail(ParseError::UnterminatedScope { depth, innermost });
        }
        self.journal.clear();
        self.unit_entries.clear();
        self.state = State::Idle;
        trace!("end unit {}", self.unit_index);
        Ok(())
    }

    fn abandon_compilation_unit(&mut self, reason: String) {
        if self.state == State::InUnit {
            self.abandon_unit(reason);
        }
    }

    fn start_die(&mut self, parent: u64, offset: u64, tag: DwTag) -> Result<(), ParseError> {
        self.require_unit("start_die")?;
        if self.db.entries.contains_key(&offset) {
            return self.fail(ParseError::DuplicateEntry(offset));
        }
        let outer_scope = self.scope_stack.last().copied();
        self.db
            .entries
            .insert(offset, DebugInfoEntry::new(offset, parent, tag, outer_scope));
        self.journal.push(Undo::Entry(offset));
        self.unit_entries.insert(offset);
        Ok(())
    }

    fn end_die(&mut self, offset: u64) -> Result<(), ParseError> {
        self.require_unit("end_die")?;
        let Some(entry) = self.db.entries.get(&offset) else {
            return self.fail(ParseError::UnknownEntry(offset));
        };
        let outer_scope = entry.outer_scope;
        let high_pc = entry.attr(gimli::DW_AT_high_pc).cloned();

        // Only entries that opened a scope are on the stack.
        if self.scope_stack.last() != Some(&offset) {
            return Ok(());
        }
        self.scope_stack.pop();

        // Labels have no high PC and don't get an exit transition. A parent
        // closing at the same address as its child overwrites the child's
        // transition.
        match high_pc {
            None => (),
            Some(AttrValue::Unsigned(high_pc)) => self.set_transition(high_pc, outer_scope),
            Some(_) => self.diagnose(Diagnostic::UnexpectedAttributeValue {
                entry: offset,
                attr: gimli::DW_AT_high_pc,
            }),
        }
        Ok(())
    }

    fn process_attribute(
        &mut self,
        offset: u64,
        parent: u64,
        attr: DwAt,
        form: DwForm,
        value: AttrValue,
    ) -> Result<(), ParseError> {
        self.require_unit("process_attribute")?;
        if !self.db.entries.contains_key(&offset) {
            return self.fail(ParseError::UnknownEntry(offset));
        }
        if !self.db.entries.contains_key(&parent) {
            return self.fail(ParseError::UnknownEntry(parent));
        }

        let key = self.next_attribute;
        self.next_attribute += 1;
        self.db.attributes.insert(
            key,
            DebugInfoAttribute {
                key,
                parent_key: parent,
                tag: attr,
                form,
                value: value.clone(),
            },
        );
        self.journal.push(Undo::Attribute(key));

        let created_in_unit = self.unit_entries.contains(&offset);
        let low_pc = match (attr, &value) {
            (gimli::DW_AT_low_pc, AttrValue::Unsigned(addr)) => Some(*addr),
            _ => None,
        };

        // The attribute table keeps every occurrence; the entry keeps the
        // first of each kind.
        let duplicate = self
            .db
            .entries
            .get(&offset)
            .map_or(false, |e| e.has_attribute(attr));
        if duplicate {
            self.diagnose(Diagnostic::DuplicateAttribute { entry: offset, attr });
            return Ok(());
        }
        if let Some(entry) = self.db.entries.get_mut(&offset) {
            entry.attributes.insert(attr, value);
            if !created_in_unit {
                self.journal.push(Undo::EntryAttribute {
                    entry: offset,
                    attr,
                });
            }
        }

        match attr {
            gimli::DW_AT_low_pc => match low_pc {
                Some(addr) => {
                    self.set_transition(addr, Some(offset));
                    self.enter_scope(parent);
                }
                None => self.diagnose(Diagnostic::UnexpectedAttributeValue { entry: offset, attr }),
            },
            // Scopes made of discontiguous ranges have no single entry
            // point, but still enclose their children.
            gimli::DW_AT_ranges => self.enter_scope(parent),
            _ => (),
        }
        Ok(())
    }

    fn define_dir(&mut self, name: &str, dir_num: u32) -> Result<(), ParseError> {
        self.require_unit("define_dir")?;
        self.dirs.insert(dir_num, name.to_string());
        Ok(())
    }

    fn define_file(&mut self, name: &str, file_num: u32, dir_num: u32) -> Result<(), ParseError> {
        self.require_unit("define_file")?;
        let key = self.file_key(file_num);
        if self.db.files.contains_key(&key) {
            self.diagnose(Diagnostic::DuplicateFile { key });
            return Ok(());
        }

        let relative_path = match self.dirs.get(&dir_num) {
            Some(dir) => dir.clone(),
            None => {
                self.diagnose(Diagnostic::MissingDirectory { file_num, dir_num });
                String::new()
            }
        };
        let current_absolute_path = if relative_path.is_empty() || name.starts_with('/') {
            name.to_string()
        } else {
            format!("{}/{}", relative_path.trim_end_matches('/'), name)
        };

        self.db.files.insert(
            key,
            SourceFile {
                key,
                filename: name.to_string(),
                relative_path,
                current_absolute_path,
            },
        );
        self.journal.push(Undo::File(key));
        Ok(())
    }

    fn add_line(
        &mut self,
        address: u64,
        length: u64,
        file_num: u32,
        line: u32,
        column: u32,
    ) -> Result<(), ParseError> {
        self.require_unit("add_line")?;
        // Zero-length rows come from elided code and would collide with the
        // real row at the same address.
        if length == 0 {
            trace!("dropping empty line row at {address:#x}");
            return Ok(());
        }
        if self.db.locations.contains_key(&address) {
            self.diagnose(Diagnostic::DuplicateLocation { address });
            return Ok(());
        }

        let source_file_key = self.file_key(file_num);
        self.db.locations.insert(
            address,
            SourceLocation {
                start_address: address,
                length,
                source_file_key,
                line,
                column,
            },
        );
        self.journal.push(Undo::Location(address));
        Ok(())
    }

    fn add_loc_list_entry(
        &mut self,
        offset: u64,
        is_first_entry: bool,
        low_pc: u64,
        high_pc: u64,
        data: &[u8],
    ) -> Result<(), ParseError> {
        if is_first_entry {
            if self.db.loc_lists.insert(offset, vec![]).is_some() {
                self.diagnose(Diagnostic::DuplicateLocList { offset });
            }
            self.current_loc_list = Some(offset);
        }
        let list = self
            .current_loc_list
            .and_then(|current| self.db.loc_lists.get_mut(&current));
        match list {
            Some(list) => list.push(LocListEntry {
                start_address: low_pc,
                end_address: high_pc,
                data: data.to_vec(),
            }),
            None => self.diagnose(Diagnostic::OrphanLocListEntry { offset }),
        }
        Ok(())
    }

    fn add_range_list_entry(
        &mut self,
        offset: u64,
        base_address: u64,
        low_pc: u64,
        high_pc: u64,
    ) -> Result<(), ParseError> {
        self.db
            .range_lists
            .entry(offset)
            .or_default()
            .push(RangeListEntry {
                offset,
                base_address,
                low_pc,
                high_pc,
            });
        Ok(())
    }

    fn begin_cfi_entry(&mut self, address: u64) -> Result<(), ParseError> {
        let previous = self.current_frame.replace(CallFrame {
            address,
            rules: vec![],
        });
        if let Some(frame) = previous {
            self.diagnose(Diagnostic::AbandonedCallFrame {
                address: frame.address,
            });
        }
        Ok(())
    }

    fn add_cfi_rule(
        &mut self,
        address: u64,
        register: i32,
        kind: CfiRuleKind,
    ) -> Result<(), ParseError> {
        // Call frames aren't part of any unit, so an open unit is left alone.
        let Some(frame) = self.current_frame.as_mut() else {
            return Err(ParseError::MismatchedCfiEntry);
        };
        frame.rules.push(CfiRule {
            address,
            register,
            kind,
        });
        Ok(())
    }

    fn end_cfi_entry(&mut self) -> Result<(), ParseError> {
        let Some(frame) = self.current_frame.take() else {
            return Err(ParseError::MismatchedCfiEntry);
        };
        if self.db.call_frames.contains_key(&frame.address) {
            self.diagnose(Diagnostic::DuplicateCallFrame {
                address: frame.address,
            });
        } else {
            self.db.call_frames.insert(frame.address, frame);
        }
        Ok(())
    }
}

impl SymbolDbBuilder {
    /// Pushes `key` onto the scope stack, unless it is already the
    /// innermost scope (an entry with both a low PC and ranges).
    fn enter_scope(&mut self, key: u64) {
        if self.scope_stack.last() != Some(&key) {
            self.scope_stack.push(key);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn unsigned(b: &mut SymbolDbBuilder, die: u64, attr: DwAt, value: u64) {
        b.process_attribute(die, die, attr, gimli::DW_FORM_addr, AttrValue::Unsigned(value))
            .unwrap();
    }

    /// Opens a scope entry with the given PC range.
    fn scope(b: &mut SymbolDbBuilder, parent: u64, key: u64, tag: DwTag, low: u64, high: u64) {
        b.start_die(parent, key, tag).unwrap();
        unsigned(b, key, gimli::DW_AT_low_pc, low);
        unsigned(b, key, gimli::DW_AT_high_pc, high);
    }

    #[test]
    fn zero_length_rows_are_dropped() {
        let mut b = SymbolDbBuilder::new();
        b.start_compilation_unit().unwrap();
        b.add_line(0x2000, 0, 1, 5, 0).unwrap();
        b.add_line(0x3000, 0, 1, 6, 0).unwrap();
        b.add_line(0x3000, 4, 1, 7, 0).unwrap();
        b.end_compilation_unit().unwrap();
        let db = b.build();

        assert!(db.locations.get(&0x2000).is_none());
        assert_eq!(db.locations[&0x3000].line, 7);
        assert!(db.diagnostics().is_empty());
    }

    #[test]
    fn duplicate_line_keeps_first() {
        let mut b = SymbolDbBuilder::new();
        b.start_compilation_unit().unwrap();
        b.add_line(0x2000, 4, 1, 5, 0).unwrap();
        b.add_line(0x2000, 8, 1, 9, 0).unwrap();
        b.add_line(0x2004, 4, 1, 6, 0).unwrap();
        b.end_compilation_unit().unwrap();
        let db = b.build();

        assert_eq!(db.locations[&0x2000].line, 5);
        assert_eq!(db.locations[&0x2004].line, 6);
        assert_eq!(
            db.diagnostics(),
            [Diagnostic::DuplicateLocation { address: 0x2000 }]
        );
    }

    #[test]
    fn shared_exit_goes_to_parent_outer_scope() {
        let mut b = SymbolDbBuilder::new();
        b.start_compilation_unit().unwrap();
        b.start_die(0, 0xb, gimli::DW_TAG_compile_unit).unwrap();
        scope(&mut b, 0xb, 0x20, gimli::DW_TAG_subprogram, 0x1000, 0x1040);
        scope(&mut b, 0x20, 0x30, gimli::DW_TAG_lexical_block, 0x1010, 0x1020);
        b.end_die(0x30).unwrap();
        scope(&mut b, 0x20, 0x40, gimli::DW_TAG_lexical_block, 0x1020, 0x1040);
        b.end_die(0x40).unwrap();
        b.end_die(0x20).unwrap();
        b.end_die(0xb).unwrap();
        b.end_compilation_unit().unwrap();
        let db = b.build();

        // The second block starts where the first ends.
        assert_eq!(db.scope_for_address(0x1020).unwrap().key, 0x40);
        // Block and function end together; the function closes last.
        assert_eq!(db.scope_transitions[&0x1040].entry, None);
        assert!(db.scope_for_address(0x1040).is_none());
    }

    #[test]
    fn shared_entry_goes_to_child() {
        let mut b = SymbolDbBuilder::new();
        b.start_compilation_unit().unwrap();
        scope(&mut b, 0, 0x20, gimli::DW_TAG_subprogram, 0x1000, 0x1040);
        scope(&mut b, 0x20, 0x30, gimli::DW_TAG_lexical_block, 0x1000, 0x1010);
        b.end_die(0x30).unwrap();
        b.end_die(0x20).unwrap();
        b.end_compilation_unit().unwrap();
        let db = b.build();

        assert_eq!(db.scope_for_address(0x1000).unwrap().key, 0x30);
        assert_eq!(db.scope_for_address(0x1010).unwrap().key, 0x20);
    }

    #[test]
    fn low_pc_opens_the_parent_scope() {
        let mut b = SymbolDbBuilder::new();
        b.start_compilation_unit().unwrap();
        b.start_die(0, 0x20, gimli::DW_TAG_subprogram).unwrap();
        unsigned(&mut b, 0x20, gimli::DW_AT_high_pc, 0x1040);
        b.start_die(0x20, 0x28, gimli::DW_TAG_label).unwrap();
        // The label's entry point opens its parent's scope.
        b.process_attribute(
            0x28,
            0x20,
            gimli::DW_AT_low_pc,
            gimli::DW_FORM_addr,
            AttrValue::Unsigned(0x1000),
        )
        .unwrap();
        // Ending the label leaves the parent open.
        b.end_die(0x28).unwrap();
        b.start_die(0x20, 0x30, gimli::DW_TAG_variable).unwrap();
        b.end_die(0x30).unwrap();
        b.end_die(0x20).unwrap();
        b.end_compilation_unit().unwrap();
        let db = b.build();

        assert_eq!(db.entry(0x30).unwrap().outer_scope, Some(0x20));
        assert_eq!(db.scope_transitions[&0x1000].entry, Some(0x28));
        assert_eq!(db.scope_transitions[&0x1040].entry, None);
        assert_eq!(db.scope_for_address(0x1020).unwrap().key, 0x28);
        assert!(db.scope_for_address(0x1040).is_none());
    }

    #[test]
    fn parent_scope_must_be_closed_by_parent() {
        let mut b = SymbolDbBuilder::new();
        b.start_compilation_unit().unwrap();
        b.start_die(0, 0x20, gimli::DW_TAG_subprogram).unwrap();
        b.start_die(0x20, 0x28, gimli::DW_TAG_label).unwrap();
        b.process_attribute(
            0x28,
            0x20,
            gimli::DW_AT_low_pc,
            gimli::DW_FORM_addr,
            AttrValue::Unsigned(0x1000),
        )
        .unwrap();
        b.end_die(0x28).unwrap();
        assert_eq!(
            b.end_compilation_unit(),
            Err(ParseError::UnterminatedScope { depth: 1, innermost: 0x20 })
        );
    }

    #[test]
    fn duplicate_attribute_keeps_first() {
        let mut b = SymbolDbBuilder::new();
        b.start_compilation_unit().unwrap();
        b.start_die(0, 0x10, gimli::DW_TAG_variable).unwrap();
        for name in ["a", "b"] {
            b.process_attribute(
                0x10,
                0x10,
                gimli::DW_AT_name,
                gimli::DW_FORM_string,
                AttrValue::String(name.into()),
            )
            .unwrap();
        }
        b.end_die(0x10).unwrap();
        b.end_compilation_unit().unwrap();
        let db = b.build();

        assert_eq!(db.entry(0x10).unwrap().name(), Some("a"));
        assert_eq!(db.attributes_of(0x10).count(), 2);
        assert_eq!(
            db.diagnostics(),
            [Diagnostic::DuplicateAttribute { entry: 0x10, attr: gimli::DW_AT_name }]
        );
    }

    #[test]
    fn ranges_open_a_scope() {
        let mut b = SymbolDbBuilder::new();
        b.start_compilation_unit().unwrap();
        b.start_die(0, 0x20, gimli::DW_TAG_lexical_block).unwrap();
        b.process_attribute(
            0x20,
            0x20,
            gimli::DW_AT_ranges,
            gimli::DW_FORM_sec_offset,
            AttrValue::Unsigned(0x80),
        )
        .unwrap();
        b.start_die(0x20, 0x28, gimli::DW_TAG_variable).unwrap();
        b.end_die(0x28).unwrap();
        b.end_die(0x20).unwrap();
        b.end_compilation_unit().unwrap();
        b.add_range_list_entry(0x80, 0x1000, 0x10, 0x20).unwrap();
        b.add_range_list_entry(0x80, 0x1000, 0x40, 0x48).unwrap();
        let db = b.build();

        assert_eq!(db.entry(0x28).unwrap().outer_scope, Some(0x20));
        assert_eq!(db.ranges_for_entry(0x20).len(), 2);
        assert!(db.ranges_for_entry(0x28).is_empty());
        assert!(db.scope_transitions.is_empty());
    }

    #[test]
    fn file_keys_are_unit_qualified() {
        let mut b = SymbolDbBuilder::new();
        for dir in ["/a", "/b"] {
            b.start_compilation_unit().unwrap();
            b.define_dir(dir, 0).unwrap();
            b.define_file("x.c", 3, 0).unwrap();
            b.end_compilation_unit().unwrap();
        }
        let db = b.build();

        let paths = db
            .files_by_name("x.c")
            .map(|f| f.current_absolute_path.as_str())
            .collect::<Vec<_>>();
        assert_eq!(paths, ["/a/x.c", "/b/x.c"]);
        assert!(db.file(make_file_key(1, 3)).is_some());
        assert!(db.file(make_file_key(2, 3)).is_some());
    }

    #[test]
    fn missing_directory_is_not_fatal() {
        let mut b = SymbolDbBuilder::new();
        b.start_compilation_unit().unwrap();
        b.define_file("lost.c", 1, 7).unwrap();
        b.define_file("lost.c", 1, 7).unwrap();
        b.end_compilation_unit().unwrap();
        let db = b.build();

        let file = db.file(make_file_key(1, 1)).unwrap();
        assert_eq!(file.relative_path, "");
        assert_eq!(file.current_absolute_path, "lost.c");
        assert_eq!(
            db.diagnostics(),
            [
                Diagnostic::MissingDirectory { file_num: 1, dir_num: 7 },
                Diagnostic::DuplicateFile { key: make_file_key(1, 1) },
            ]
        );
    }

    #[test]
    fn unterminated_scope_rolls_back_unit() {
        let mut b = SymbolDbBuilder::new();
        b.start_compilation_unit().unwrap();
        scope(&mut b, 0, 0x20, gimli::DW_TAG_subprogram, 0x1000, 0x1010);
        b.end_die(0x20).unwrap();
        b.add_line(0x1000, 4, 1, 3, 0).unwrap();
        b.end_compilation_unit().unwrap();

        b.start_compilation_unit().unwrap();
        b.define_dir("/src", 0).unwrap();
        b.define_file("bad.c", 1, 0).unwrap();
        // Overwrites the first unit's exit transition.
        scope(&mut b, 0, 0x60, gimli::DW_TAG_subprogram, 0x1010, 0x1020);
        b.add_line(0x1010, 4, 1, 8, 0).unwrap();
        let err = b.end_compilation_unit().unwrap_err();
        assert_eq!(
            err,
            ParseError::UnterminatedScope { depth: 1, innermost: 0x60 }
        );

        // The builder is usable again.
        b.start_compilation_unit().unwrap();
        b.end_compilation_unit().unwrap();
        let db = b.build();

        assert!(db.entry(0x20).is_some());
        assert!(db.entry(0x60).is_none());
        assert!(db.file(make_file_key(2, 1)).is_none());
        assert!(db.locations.get(&0x1010).is_none());
        assert_eq!(db.attribute_count(), 2);
        assert_eq!(db.scope_transitions[&0x1010].entry, None);
        assert!(matches!(
            db.diagnostics(),
            [Diagnostic::AbandonedUnit { unit: 2, .. }]
        ));
    }

    #[test]
    fn structural_faults() {
        let mut b = SymbolDbBuilder::new();
        assert_eq!(
            b.start_die(0, 0x10, gimli::DW_TAG_subprogram),
            Err(ParseError::OutsideUnit { event: "start_die" })
        );
        b.start_compilation_unit().unwrap();
        assert_eq!(b.start_compilation_unit(), Err(ParseError::UnitNotClosed));

        b.start_compilation_unit().unwrap();
        b.start_die(0, 0x10, gimli::DW_TAG_subprogram).unwrap();
        assert_eq!(
            b.start_die(0, 0x10, gimli::DW_TAG_subprogram),
            Err(ParseError::DuplicateEntry(0x10))
        );

        b.start_compilation_unit().unwrap();
        assert_eq!(b.end_die(0x99), Err(ParseError::UnknownEntry(0x99)));
        assert_eq!(b.diagnostics().len(), 3);
    }

    #[test]
    fn producer_can_abandon_unit() {
        let mut b = SymbolDbBuilder::new();
        b.abandon_compilation_unit("nothing open".into());
        b.start_compilation_unit().unwrap();
        b.start_die(0, 0x10, gimli::DW_TAG_compile_unit).unwrap();
        b.abandon_compilation_unit("truncated".into());
        let db = b.build();

        assert_eq!(db.entry_count(), 0);
        assert_eq!(
            db.diagnostics(),
            [Diagnostic::AbandonedUnit { unit: 1, reason: "truncated".into() }]
        );
    }

    #[test]
    fn mismatched_cfi() {
        let mut b = SymbolDbBuilder::new();
        assert_eq!(b.end_cfi_entry(), Err(ParseError::MismatchedCfiEntry));
        assert_eq!(
            b.add_cfi_rule(0x1000, 7, CfiRuleKind::SameValue),
            Err(ParseError::MismatchedCfiEntry)
        );

        b.begin_cfi_entry(0x1000).unwrap();
        b.add_cfi_rule(
            0x1000,
            CFA_REGISTER,
            CfiRuleKind::ValOffset { base_register: 7, offset: 8 },
        )
        .unwrap();
        b.end_cfi_entry().unwrap();
        assert_eq!(b.end_cfi_entry(), Err(ParseError::MismatchedCfiEntry));

        b.begin_cfi_entry(0x2000).unwrap();
        b.begin_cfi_entry(0x3000).unwrap();
        b.end_cfi_entry().unwrap();
        let db = b.build();

        assert_eq!(db.call_frame_for_address(0x1fff).unwrap().address, 0x1000);
        assert_eq!(db.call_frame_for_address(0x3004).unwrap().rules.len(), 0);
        assert!(db.call_frames.get(&0x2000).is_none());
        assert_eq!(
            db.diagnostics(),
            [Diagnostic::AbandonedCallFrame { address: 0x2000 }]
        );
    }

    #[test]
    fn cfi_fault_leaves_open_unit_alone() {
        let mut b = SymbolDbBuilder::new();
        b.start_compilation_unit().unwrap();
        b.start_die(0, 0x10, gimli::DW_TAG_subprogram).unwrap();
        assert_eq!(b.end_cfi_entry(), Err(ParseError::MismatchedCfiEntry));
        assert_eq!(
            b.add_cfi_rule(0x1000, 6, CfiRuleKind::SameValue),
            Err(ParseError::MismatchedCfiEntry)
        );
        b.end_die(0x10).unwrap();
        b.end_compilation_unit().unwrap();
        let db = b.build();

        assert!(db.entry(0x10).is_some());
        assert!(db.diagnostics().is_empty());
    }

    #[test]
    fn loc_lists_group_by_first_entry() {
        let mut b = SymbolDbBuilder::new();
        b.add_loc_list_entry(0x40, false, 0, 1, &[]).unwrap();
        b.add_loc_list_entry(0x50, true, 0x1000, 0x1004, &[0x50]).unwrap();
        b.add_loc_list_entry(0x62, false, 0x1004, 0x1010, &[0x56]).unwrap();
        b.add_loc_list_entry(0x80, true, 0x2000, 0x2008, &[0x51]).unwrap();
        let db = b.build();

        assert_eq!(db.loc_list_count(), 2);
        let list = db.loc_list(0x50).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].data, [0x56]);
        assert_eq!(
            db.diagnostics(),
            [Diagnostic::OrphanLocListEntry { offset: 0x40 }]
        );
    }

    #[test]
    fn non_integer_low_pc_is_diagnosed() {
        let mut b = SymbolDbBuilder::new();
        b.start_compilation_unit().unwrap();
        b.start_die(0, 0x10, gimli::DW_TAG_label).unwrap();
        b.process_attribute(
            0x10,
            0x10,
            gimli::DW_AT_low_pc,
            gimli::DW_FORM_string,
            AttrValue::String("nope".into()),
        )
        .unwrap();
        b.end_die(0x10).unwrap();
        b.end_compilation_unit().unwrap();
        let db = b.build();

        assert!(db.scope_transitions.is_empty());
        assert_eq!(
            db.diagnostics(),
            [Diagnostic::UnexpectedAttributeValue {
                entry: 0x10,
                attr: gimli::DW_AT_low_pc
            }]
        );
    }
}
