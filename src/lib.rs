pub mod builder;
pub mod dwarf_parser;
pub mod error;
pub mod model;
pub mod vm;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use gimli::{DwAt, DwTag};

pub use crate::builder::{DwarfEvents, SymbolDbBuilder};
pub use crate::dwarf_parser::parse_file;
pub use crate::error::{Diagnostic, LoadError, ParseError, VmError};
pub use crate::model::*;

// Internal type abbreviations
type BTreeIndex<I, K> = BTreeMap<K, BTreeSet<I>>;

/// A database of symbol information extracted from the debug info of a
/// program.
///
/// The tables are filled by a `SymbolDbBuilder`. Lookups go through indices
/// that `build_indices` derives from the tables; until it has run, every
/// address lookup comes back empty. Once built, the database is never
/// mutated, so it can be shared between threads.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SymbolDb {
    /// Source files, by unit-qualified file key.
    pub(crate) files: BTreeMap<u64, SourceFile>,
    /// All debug info entries, by offset.
    ///
    /// This is the authoritative set of entries, other entry-related fields
    /// index into this.
    pub(crate) entries: BTreeMap<u64, DebugInfoEntry>,
    /// Every attribute occurrence, by attribute key.
    pub(crate) attributes: BTreeMap<u64, DebugInfoAttribute>,
    /// Line table rows, by start address.
    pub(crate) locations: BTreeMap<u64, SourceLocation>,
    /// Scope changes, by address.
    pub(crate) scope_transitions: BTreeMap<u64, ScopeTransition>,
    /// Location lists, by offset of their first entry.
    pub(crate) loc_lists: BTreeMap<u64, Vec<LocListEntry>>,
    /// Range lists, by offset.
    pub(crate) range_lists: BTreeMap<u64, Vec<RangeListEntry>>,
    /// Call frame information, by low PC of the frame description.
    pub(crate) call_frames: BTreeMap<u64, CallFrame>,

    /// Index: parent key to child entry keys.
    entries_by_parent: BTreeIndex<u64, u64>,
    /// Index: file name to file keys. Several units can name the same file.
    files_by_filename: BTreeIndex<u64, String>,
    /// Index: attribute kind to attribute keys.
    attributes_by_kind: BTreeIndex<u64, DwAt>,
    /// Index: entry key to keys of the attributes describing it.
    attributes_by_entry: BTreeIndex<u64, u64>,
    /// Index: file key to start addresses of its line rows.
    locations_by_file: BTreeIndex<u64, u64>,
    /// Index: entry key to the offset of its range list, for entries with a
    /// `DW_AT_ranges` attribute naming a known list.
    range_lists_by_entry: BTreeMap<u64, u64>,

    /// Sorted address arrays for nearest-address searches.
    ///
    /// Invariant: each holds exactly the keys of the corresponding table as
    /// of the last `build_indices`, in ascending order.
    location_addresses: Vec<u64>,
    scope_transition_addresses: Vec<u64>,
    call_frame_addresses: Vec<u64>,

    /// Index: scope low PC to start addresses of the line rows inside that
    /// scope, ordered by line number.
    scope_to_locations_by_line: BTreeMap<u64, Vec<u64>>,

    /// Recoverable faults seen while the tables were filled.
    pub(crate) diagnostics: Vec<Diagnostic>,
}

impl SymbolDb {
    /// Computes all derived lookup structures from the tables.
    ///
    /// Every index is cleared and rebuilt from scratch, so calling this twice
    /// without changing the tables produces identical indices.
    pub fn build_indices(&mut self) {
        self.entries_by_parent = index_by_key(&self.entries, |_, e| Some(e.parent_key));
        self.files_by_filename = index_by_key(&self.files, |_, f| Some(f.filename.clone()));
        self.attributes_by_kind = index_by_key(&self.attributes, |_, a| Some(a.tag));
        self.attributes_by_entry = index_by_key(&self.attributes, |_, a| Some(a.parent_key));
        self.locations_by_file = index_by_key(&self.locations, |_, l| Some(l.source_file_key));

        self.range_lists_by_entry = self
            .entries
            .iter()
            .filter_map(|(&key, e)| {
                let offset = e.ranges_offset();
                if offset != INVALID_KEY && self.range_lists.contains_key(&offset) {
                    Some((key, offset))
                } else {
                    None
                }
            })
            .collect();

        // BTreeMap keys come out in ascending order.
        self.location_addresses = self.locations.keys().copied().collect();
        self.scope_transition_addresses = self.scope_transitions.keys().copied().collect();
        self.call_frame_addresses = self.call_frames.keys().copied().collect();

        // Needs the scope transition index above.
        let mut scope_to_locations: BTreeMap<u64, Vec<u64>> = BTreeMap::new();
        for location in self.locations.values() {
            if let Some(scope) = self.scope_for_address(location.start_address) {
                if scope.has_attribute(gimli::DW_AT_low_pc) {
                    scope_to_locations
                        .entry(scope.low_pc())
                        .or_default()
                        .push(location.start_address);
                }
            }
        }
        for bucket in scope_to_locations.values_mut() {
            bucket.sort_by_key(|address| self.locations[address].line);
        }
        self.scope_to_locations_by_line = scope_to_locations;
    }

    /// Finds the line table row governing `address`: the row with the
    /// greatest start address at or below it.
    pub fn location_for_address(&self, address: u64) -> Option<&SourceLocation> {
        row_for_address(address, &self.locations, &self.location_addresses)
    }

    /// Finds the innermost lexical scope active at `address`.
    ///
    /// Returns `None` if `address` precedes every recorded transition, or if
    /// the code at `address` is outside every scope.
    pub fn scope_for_address(&self, address: u64) -> Option<&DebugInfoEntry> {
        let transition =
            row_for_address(address, &self.scope_transitions, &self.scope_transition_addresses)?;
        self.entries.get(&transition.entry?)
    }

    /// Finds the call frame description governing `address`.
    pub fn call_frame_for_address(&self, address: u64) -> Option<&CallFrame> {
        row_for_address(address, &self.call_frames, &self.call_frame_addresses)
    }

    /// Walks outward from `entry` through enclosing scopes and returns the
    /// first entry with the given tag. `entry` itself counts.
    pub fn nearest_ancestor_with_tag<'a>(
        &'a self,
        entry: &'a DebugInfoEntry,
        tag: DwTag,
    ) -> Option<&'a DebugInfoEntry> {
        let mut target = entry;
        loop {
            if target.tag == tag {
                return Some(target);
            }
            target = self.entries.get(&target.outer_scope?)?;
        }
    }

    /// Checks whether the scope identified by `ancestor` encloses `entry`.
    pub fn has_as_ancestor(&self, entry: &DebugInfoEntry, ancestor: u64) -> bool {
        let mut next = entry.outer_scope;
        while let Some(key) = next {
            if key == ancestor {
                return true;
            }
            next = self.entries.get(&key).and_then(|e| e.outer_scope);
        }
        false
    }

    /// Produces an iterator over the entries whose parent is `key`, in
    /// offset order. Empty if `key` has no children.
    pub fn children_of(&self, key: u64) -> impl Iterator<Item = &DebugInfoEntry> + '_ {
        consult_index(&self.entries_by_parent, &key, &self.entries)
    }

    /// Gets the line rows inside `scope`, in source line order.
    ///
    /// Returns `None` if no line row falls in the scope, or if the scope has
    /// no low PC (its rows are not indexed).
    pub fn locations_by_line(
        &self,
        scope: &DebugInfoEntry,
    ) -> Option<impl Iterator<Item = &SourceLocation> + '_> {
        if !scope.has_attribute(gimli::DW_AT_low_pc) {
            return None;
        }
        let bucket = self.scope_to_locations_by_line.get(&scope.low_pc())?;
        Some(bucket.iter().map(move |address| &self.locations[address]))
    }

    /// Finds the code addresses generated for `line` of the source file
    /// named by `path`, in ascending order.
    ///
    /// Only the file name part of `path` is matched, since the directories
    /// recorded at compile time rarely match the debugging host's. Files of
    /// that name from every unit are searched.
    pub fn addresses_for_line(&self, path: &str, line: u32) -> Vec<u64> {
        let name = Path::new(path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(path);
        let mut addresses = self
            .files_by_name(name)
            .flat_map(|file| self.locations_in_file(file.key))
            .filter(|l| l.line == line)
            .map(|l| l.start_address)
            .collect::<Vec<_>>();
        addresses.sort_unstable();
        addresses.dedup();
        addresses
    }

    /// Finds the source file and line row governing `address`.
    pub fn position_for_address(&self, address: u64) -> Option<(&SourceFile, &SourceLocation)> {
        let location = self.location_for_address(address)?;
        let file = self.files.get(&location.source_file_key)?;
        Some((file, location))
    }

    /// Finds where execution moves to the next line row after `address`:
    /// the end of the row covering it, or if `address` lies past the end of
    /// its row, the start of the following one.
    pub fn next_location(&self, address: u64) -> Option<u64> {
        let row = self.location_for_address(address)?;
        let end = row.start_address.saturating_add(row.length);
        if end > address {
            return Some(end);
        }
        let pos = self.location_addresses.partition_point(|&key| key <= address);
        self.location_addresses.get(pos).copied()
    }

    /// Finds the function containing `address`.
    pub fn function_for_address(&self, address: u64) -> Option<&DebugInfoEntry> {
        let scope = self.scope_for_address(address)?;
        self.nearest_ancestor_with_tag(scope, gimli::DW_TAG_subprogram)
    }

    /// Lists the start addresses of the line rows making up the function
    /// active at `pc`, stepping row by row from its low PC to its high PC.
    ///
    /// Outside a function, the outermost scope enclosing `pc` is used.
    pub fn addresses_in_scope(&self, pc: u64) -> Vec<u64> {
        let Some(mut function) = self.scope_for_address(pc) else {
            return vec![];
        };
        while function.tag != gimli::DW_TAG_subprogram {
            match function.outer_scope.and_then(|k| self.entries.get(&k)) {
                Some(outer) => function = outer,
                None => break,
            }
        }

        let end = function.high_pc().unwrap_or(0);
        let mut address = function.low_pc();
        let mut result = vec![];
        while address < end {
            result.push(address);
            match self.next_location(address) {
                Some(next) if next > address => address = next,
                _ => break,
            }
        }
        result
    }

    pub fn entry(&self, key: u64) -> Option<&DebugInfoEntry> {
        self.entries.get(&key)
    }

    pub fn entries(&self) -> impl Iterator<Item = &DebugInfoEntry> + '_ {
        self.entries.values()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn file(&self, key: u64) -> Option<&SourceFile> {
        self.files.get(&key)
    }

    pub fn files(&self) -> impl Iterator<Item = &SourceFile> + '_ {
        self.files.values()
    }

    /// Consults the file name index. Names are matched in their entirety.
    pub fn files_by_name(&self, name: &str) -> impl Iterator<Item = &SourceFile> + '_ {
        consult_index(&self.files_by_filename, name, &self.files)
    }

    pub fn attribute(&self, key: u64) -> Option<&DebugInfoAttribute> {
        self.attributes.get(&key)
    }

    pub fn attribute_count(&self) -> usize {
        self.attributes.len()
    }

    /// Consults the attribute kind index, e.g. to find every `DW_AT_name`.
    pub fn attributes_by_kind(
        &self,
        kind: DwAt,
    ) -> impl Iterator<Item = &DebugInfoAttribute> + '_ {
        consult_index(&self.attributes_by_kind, &kind, &self.attributes)
    }

    /// Produces the attribute records describing the entry `key`, in the
    /// order they were reported.
    pub fn attributes_of(&self, key: u64) -> impl Iterator<Item = &DebugInfoAttribute> + '_ {
        consult_index(&self.attributes_by_entry, &key, &self.attributes)
    }

    pub fn locations(&self) -> impl Iterator<Item = &SourceLocation> + '_ {
        self.locations.values()
    }

    /// Produces the line rows belonging to the file `key`, by address.
    pub fn locations_in_file(&self, key: u64) -> impl Iterator<Item = &SourceLocation> + '_ {
        consult_index(&self.locations_by_file, &key, &self.locations)
    }

    pub fn scope_transitions(&self) -> impl Iterator<Item = &ScopeTransition> + '_ {
        self.scope_transitions.values()
    }

    pub fn loc_list(&self, offset: u64) -> Option<&[LocListEntry]> {
        self.loc_lists.get(&offset).map(Vec::as_slice)
    }

    pub fn loc_list_count(&self) -> usize {
        self.loc_lists.len()
    }

    pub fn range_list(&self, offset: u64) -> Option<&[RangeListEntry]> {
        self.range_lists.get(&offset).map(Vec::as_slice)
    }

    pub fn range_list_count(&self) -> usize {
        self.range_lists.len()
    }

    /// Gets the range list of the entry `key`, or an empty slice if it
    /// doesn't have one.
    pub fn ranges_for_entry(&self, key: u64) -> &[RangeListEntry] {
        self.range_lists_by_entry
            .get(&key)
            .and_then(|offset| self.range_list(*offset))
            .unwrap_or(&[])
    }

    pub fn call_frames(&self) -> impl Iterator<Item = &CallFrame> + '_ {
        self.call_frames.values()
    }

    /// Recoverable faults reported while the database was built.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }
}

/// Finds the row whose key is the greatest one at or below `address`.
///
/// `index` must hold the keys of `table` in ascending order.
fn row_for_address<'t, T>(
    address: u64,
    table: &'t BTreeMap<u64, T>,
    index: &[u64],
) -> Option<&'t T> {
    // Number of keys at or below `address`.
    let pos = index.partition_point(|&key| key <= address);
    let closest = index.get(pos.checked_sub(1)?)?;
    table.get(closest)
}

/// Looks up `key` in `index`, and then transforms the result by attaching
/// the associated row from `table` to each item.
fn consult_index<'d, I, K, Q, V>(
    index: &'d BTreeIndex<I, K>,
    key: &Q,
    table: &'d BTreeMap<I, V>,
) -> impl Iterator<Item = &'d V> + 'd
where
    I: Ord,
    K: std::borrow::Borrow<Q> + Ord,
    Q: Ord + ?Sized,
{
    index
        .get(key)
        .into_iter()
        .flat_map(move |set| set.iter().filter_map(move |id| table.get(id)))
}

/// Utility for indexing entries in a key-value table by some projection.
///
/// `table` is a sequence of keys and values in arbitrary order.
///
/// `project` takes a key-value pair and produces some datum to be indexed.
///
/// The result is a mapping from the data produced by `project` to keys in
/// `table`.
fn index_by_key<'t, K: 't, V: 't, T>(
    table: impl IntoIterator<Item = (&'t K, &'t V)>,
    mut project: impl FnMut(&K, &V) -> Option<T>,
) -> BTreeMap<T, BTreeSet<K>>
where
    T: Ord,
    K: Ord + Clone,
{
    let mut index: BTreeMap<T, BTreeSet<K>> = BTreeMap::new();

    for (k, v) in table {
        if let Some(i) = project(k, v) {
            index.entry(i).or_default().insert(k.clone());
        }
    }

    index
}
