//! Recursive descent walk over DWARF info, reported as `DwarfEvents`.
//!
//! Gimli does the bit-level decoding; this module turns its view of each
//! compilation unit (the entry tree, the line program, and the lists the
//! entries point at) plus `.debug_frame` into the event stream the builder
//! consumes.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashSet};

use fallible_iterator::FallibleIterator;
use gimli::constants as gim_con;
use object::{Object, ObjectSection};
use tracing::{debug, trace, warn};

use crate::builder::{DwarfEvents, SymbolDbBuilder};
use crate::error::LoadError;
use crate::model::{AttrValue, CfiRuleKind, CFA_REGISTER};
use crate::SymbolDb;

// Internal type abbreviations
type RtSlice<'a> = gimli::EndianSlice<'a, gimli::RunTimeEndian>;

/// Parses the debug information of an `object::File` into a database.
pub fn parse_file(object: &object::File<'_>) -> Result<SymbolDb, LoadError> {
    let mut builder = SymbolDbBuilder::new();
    parse_events(object, &mut builder)?;
    Ok(builder.build())
}

/// Walks the debug information of `object`, reporting it to `events`.
///
/// A compilation unit that can't be decoded, or that the sink rejects, is
/// abandoned and the walk carries on with the next one.
pub fn parse_events<'a, E: DwarfEvents>(
    object: &'a object::File,
    events: &mut E,
) -> Result<(), LoadError> {
    let endian = if object.is_little_endian() {
        gimli::RunTimeEndian::Little
    } else {
        gimli::RunTimeEndian::Big
    };

    let load_section = |id: gimli::SectionId| -> Result<Cow<'a, [u8]>, gimli::Error> {
        match object.section_by_name(id.name()) {
            Some(section) => Ok(section.uncompressed_data().unwrap_or_default()),
            None => Ok(Default::default()),
        }
    };

    let dwarf_cow = gimli::Dwarf::load(&load_section)?;
    let dwarf = dwarf_cow.borrow(|section| gimli::EndianSlice::new(section, endian));

    let mut seen = SeenLists::default();
    let mut iter = dwarf.units();
    let mut unit_number = 0;
    while let Some(header) = iter.next()? {
        unit_number += 1;
        let unit = match dwarf.unit(header) {
            Ok(unit) => unit,
            Err(e) => {
                warn!("can't decode unit #{unit_number}: {e}");
                continue;
            }
        };
        if let Err(e) = parse_unit(&dwarf, &unit, events, &mut seen) {
            warn!("abandoning unit #{unit_number}: {e}");
            events.abandon_compilation_unit(e.to_string());
        }
    }

    if let Some(section) = object.section_by_name(".debug_frame") {
        let data = section.uncompressed_data()?;
        let address_size = if object.is_64() { 8 } else { 4 };
        if let Err(e) = parse_call_frames(&data, endian, address_size, events) {
            warn!("call frame information is incomplete: {e}");
        }
    }

    Ok(())
}

/// Offsets of location and range lists already reported. Entries in
/// different units can share a list.
#[derive(Default)]
struct SeenLists {
    locations: HashSet<u64>,
    ranges: HashSet<u64>,
}

fn parse_unit<E: DwarfEvents>(
    dwarf: &gimli::Dwarf<RtSlice<'_>>,
    unit: &gimli::Unit<RtSlice<'_>>,
    events: &mut E,
    seen: &mut SeenLists,
) -> Result<(), LoadError> {
    events.start_compilation_unit()?;

    let mut entries = unit.entries();
    while let Some(()) = entries.next_entry()? {
        if entries.current().is_none() {
            break;
        }
        parse_entry(dwarf, unit, &mut entries, 0, events, seen)?;
    }

    parse_line_program(dwarf, unit, events)?;

    events.end_compilation_unit()?;
    Ok(())
}

fn parse_entry<E: DwarfEvents>(
    dwarf: &gimli::Dwarf<RtSlice<'_>>,
    unit: &gimli::Unit<RtSlice<'_>>,
    cursor: &mut gimli::EntriesCursor<'_, '_, RtSlice<'_>>,
    parent: u64,
    events: &mut E,
    seen: &mut SeenLists,
) -> Result<(), LoadError> {
    let Some(entry) = cursor.current() else {
        return Ok(());
    };
    let offset = section_offset(entry.offset().to_unit_section_offset(unit));
    let has_children = entry.has_children();
    events.start_die(parent, offset, entry.tag())?;

    // Attribute forms only live in the abbreviation.
    let forms = unit
        .abbreviations
        .get(entry.code())
        .map(|a| a.attributes().iter().map(|s| s.form()).collect::<Vec<_>>())
        .unwrap_or_default();

    let mut attrs = vec![];
    let mut high_pc_is_offset = false;
    let mut list_refs = vec![];
    let mut raw_attrs = entry.attrs();
    let mut index = 0;
    while let Some(attr) = raw_attrs.next()? {
        let form = forms.get(index).copied().unwrap_or(gim_con::DW_FORM_null);
        index += 1;

        if attr.name() == gim_con::DW_AT_high_pc {
            high_pc_is_offset = !matches!(
                attr.value(),
                gimli::AttributeValue::Addr(_) | gimli::AttributeValue::DebugAddrIndex(_)
            );
        }
        if let Some(o) = dwarf.attr_locations_offset(unit, attr.value())? {
            list_refs.push(ListRef::Locations(o));
        }
        if let Some(o) = dwarf.attr_ranges_offset(unit, attr.value())? {
            list_refs.push(ListRef::Ranges(o));
        }

        match convert_value(dwarf, unit, &attr)? {
            Some(value) => attrs.push((attr.name(), form, value)),
            None => trace!(
                "skipping attribute {} of entry {offset:#x}: {:?}",
                attr.name(),
                attr.value()
            ),
        }
    }

    // A constant-class high PC is the length of the range.
    let low_pc = attrs.iter().find_map(|(name, _, value)| match value {
        AttrValue::Unsigned(a) if *name == gim_con::DW_AT_low_pc => Some(*a),
        _ => None,
    });
    if let (Some(low), true) = (low_pc, high_pc_is_offset) {
        for (name, _, value) in &mut attrs {
            if *name == gim_con::DW_AT_high_pc {
                if let AttrValue::Unsigned(length) = value {
                    *value = AttrValue::Unsigned(low.wrapping_add(*length));
                }
            }
        }
    }

    for (name, form, value) in attrs {
        events.process_attribute(offset, offset, name, form, value)?;
    }

    for list in list_refs {
        match list {
            ListRef::Locations(o) => {
                if seen.locations.insert(o.0 as u64) {
                    report_location_list(dwarf, unit, o, events)?;
                }
            }
            ListRef::Ranges(o) => {
                if seen.ranges.insert(o.0 as u64) {
                    report_range_list(dwarf, unit, o, events)?;
                }
            }
        }
    }

    if has_children {
        while let Some(()) = cursor.next_entry()? {
            if cursor.current().is_some() {
                parse_entry(dwarf, unit, cursor, offset, events, seen)?;
            } else {
                break;
            }
        }
    }

    events.end_die(offset)?;
    Ok(())
}

enum ListRef {
    Locations(gimli::LocationListsOffset),
    Ranges(gimli::RangeListsOffset),
}

/// Flattens a unit-relative offset into the key space used by the database.
/// Entries from `.debug_types` share it with `.debug_info`.
fn section_offset(offset: gimli::UnitSectionOffset) -> u64 {
    match offset {
        gimli::UnitSectionOffset::DebugInfoOffset(o) => o.0 as u64,
        gimli::UnitSectionOffset::DebugTypesOffset(o) => o.0 as u64,
    }
}

fn convert_value(
    dwarf: &gimli::Dwarf<RtSlice<'_>>,
    unit: &gimli::Unit<RtSlice<'_>>,
    attr: &gimli::Attribute<RtSlice<'_>>,
) -> Result<Option<AttrValue>, gimli::Error> {
    use gimli::AttributeValue as V;

    let value = match attr.value() {
        V::Addr(a) => AttrValue::Unsigned(a),
        V::DebugAddrIndex(i) => AttrValue::Unsigned(dwarf.address(unit, i)?),
        V::Sdata(x) => AttrValue::Signed(x),
        V::Flag(f) => AttrValue::Unsigned(u64::from(f)),
        V::UnitRef(o) => AttrValue::Reference(section_offset(o.to_unit_section_offset(unit))),
        V::DebugInfoRef(o) => AttrValue::Reference(o.0 as u64),
        V::Block(b) => AttrValue::Buffer(b.to_vec()),
        V::Exprloc(e) => AttrValue::Buffer(e.0.to_vec()),
        v @ (V::LocationListsRef(_) | V::DebugLocListsIndex(_)) => {
            match dwarf.attr_locations_offset(unit, v)? {
                Some(o) => AttrValue::Unsigned(o.0 as u64),
                None => return Ok(None),
            }
        }
        v @ (V::RangeListsRef(_) | V::DebugRngListsIndex(_)) => {
            match dwarf.attr_ranges_offset(unit, v)? {
                Some(o) => AttrValue::Unsigned(o.0 as u64),
                None => return Ok(None),
            }
        }
        V::SecOffset(o) => AttrValue::Unsigned(o as u64),
        V::DebugLineRef(o) => AttrValue::Unsigned(o.0 as u64),
        V::FileIndex(i) => AttrValue::Unsigned(i),
        V::Language(x) => AttrValue::Unsigned(u64::from(x.0)),
        V::Encoding(x) => AttrValue::Unsigned(u64::from(x.0)),
        V::Inline(x) => AttrValue::Unsigned(u64::from(x.0)),
        V::Accessibility(x) => AttrValue::Unsigned(u64::from(x.0)),
        V::Visibility(x) => AttrValue::Unsigned(u64::from(x.0)),
        V::Virtuality(x) => AttrValue::Unsigned(u64::from(x.0)),
        V::CallingConvention(x) => AttrValue::Unsigned(u64::from(x.0)),
        v => {
            if let Some(x) = v.udata_value() {
                AttrValue::Unsigned(x)
            } else if let Ok(s) = dwarf.attr_string(unit, v) {
                AttrValue::String(s.to_string_lossy().into_owned())
            } else {
                return Ok(None);
            }
        }
    };
    Ok(Some(value))
}

fn report_location_list<E: DwarfEvents>(
    dwarf: &gimli::Dwarf<RtSlice<'_>>,
    unit: &gimli::Unit<RtSlice<'_>>,
    offset: gimli::LocationListsOffset,
    events: &mut E,
) -> Result<(), LoadError> {
    let mut locations = dwarf.locations(unit, offset)?;
    let mut first = true;
    while let Some(entry) = locations.next()? {
        events.add_loc_list_entry(
            offset.0 as u64,
            first,
            entry.range.begin,
            entry.range.end,
            &entry.data.0,
        )?;
        first = false;
    }
    Ok(())
}

fn report_range_list<E: DwarfEvents>(
    dwarf: &gimli::Dwarf<RtSlice<'_>>,
    unit: &gimli::Unit<RtSlice<'_>>,
    offset: gimli::RangeListsOffset,
    events: &mut E,
) -> Result<(), LoadError> {
    // Gimli applies base address selection entries for us, so every range
    // comes out absolute.
    let ranges: Vec<gimli::Range> = dwarf.ranges(unit, offset)?.collect()?;
    for range in ranges {
        events.add_range_list_entry(offset.0 as u64, 0, range.begin, range.end)?;
    }
    Ok(())
}

fn parse_line_program<E: DwarfEvents>(
    dwarf: &gimli::Dwarf<RtSlice<'_>>,
    unit: &gimli::Unit<RtSlice<'_>>,
    events: &mut E,
) -> Result<(), LoadError> {
    let Some(lp) = &unit.line_program else {
        return Ok(());
    };
    let header = lp.header();

    // Before DWARF 5, directory and file 0 are implicit and the tables
    // count from 1.
    let first_index = if header.version() >= 5 { 0 } else { 1 };
    if first_index == 1 {
        if let Some(comp_dir) = &unit.comp_dir {
            events.define_dir(&comp_dir.to_string_lossy(), 0)?;
        }
    }
    for (i, dir) in header.include_directories().iter().enumerate() {
        let name = dwarf.attr_string(unit, dir.clone())?;
        events.define_dir(&name.to_string_lossy(), first_index + i as u32)?;
    }
    for (i, file) in header.file_names().iter().enumerate() {
        let name = dwarf.attr_string(unit, file.path_name())?;
        events.define_file(
            &name.to_string_lossy(),
            first_index + i as u32,
            file.directory_index() as u32,
        )?;
    }

    // A row's length is the distance to the next row of its sequence.
    let mut rows = lp.clone().rows();
    let mut pending: Option<(u64, u32, u32, u32)> = None;
    while let Some((_, row)) = rows.next_row()? {
        if let Some((address, file, line, column)) = pending.take() {
            let length = row.address().saturating_sub(address);
            events.add_line(address, length, file, line, column)?;
        }
        if !row.end_sequence() {
            let line = row.line().map(|l| l.get() as u32).unwrap_or(0);
            let column = match row.column() {
                gimli::ColumnType::Column(c) => c.get() as u32,
                gimli::ColumnType::LeftEdge => 0,
            };
            pending = Some((row.address(), row.file_index() as u32, line, column));
        }
    }
    if pending.is_some() {
        warn!("line number program not terminated by end sequence");
    }
    Ok(())
}

fn parse_call_frames<E: DwarfEvents>(
    data: &[u8],
    endian: gimli::RunTimeEndian,
    address_size: u8,
    events: &mut E,
) -> Result<(), LoadError> {
    use gimli::UnwindSection;

    let mut debug_frame = gimli::DebugFrame::new(data, endian);
    debug_frame.set_address_size(address_size);
    let bases = gimli::BaseAddresses::default();
    let mut ctx = gimli::UnwindContext::new();

    let mut count = 0;
    let mut entries = debug_frame.entries(&bases);
    while let Some(entry) = entries.next()? {
        let partial = match entry {
            gimli::CieOrFde::Cie(_) => continue,
            gimli::CieOrFde::Fde(partial) => partial,
        };
        let fde = partial.parse(gimli::DebugFrame::cie_from_offset)?;
        events.begin_cfi_entry(fde.initial_address())?;

        // Rows restate every rule; only report the ones that changed.
        let mut current: BTreeMap<i32, CfiRuleKind> = BTreeMap::new();
        let mut table = fde.rows(&debug_frame, &bases, &mut ctx)?;
        while let Some(row) = table.next_row()? {
            let address = row.start_address();
            let cfa = match row.cfa() {
                gimli::CfaRule::RegisterAndOffset { register, offset } => {
                    CfiRuleKind::ValOffset {
                        base_register: i32::from(register.0),
                        offset: *offset,
                    }
                }
                gimli::CfaRule::Expression(e) => CfiRuleKind::ValExpression(e.0.to_vec()),
            };
            let mut rules = vec![(CFA_REGISTER, cfa)];
            for (register, rule) in row.registers() {
                if let Some(kind) = convert_rule(rule) {
                    rules.push((i32::from(register.0), kind));
                }
            }

            for (register, kind) in rules {
                if current.get(&register) != Some(&kind) {
                    current.insert(register, kind.clone());
                    events.add_cfi_rule(address, register, kind)?;
                }
            }
        }
        events.end_cfi_entry()?;
        count += 1;
    }
    debug!("read {count} frame descriptions");
    Ok(())
}

/// Register rules are relative to the CFA.
fn convert_rule(rule: &gimli::RegisterRule<RtSlice<'_>>) -> Option<CfiRuleKind> {
    let kind = match rule {
        gimli::RegisterRule::Undefined => CfiRuleKind::Undefined,
        gimli::RegisterRule::SameValue => CfiRuleKind::SameValue,
        gimli::RegisterRule::Offset(n) => CfiRuleKind::Offset {
            base_register: CFA_REGISTER,
            offset: *n,
        },
        gimli::RegisterRule::ValOffset(n) => CfiRuleKind::ValOffset {
            base_register: CFA_REGISTER,
            offset: *n,
        },
        gimli::RegisterRule::Register(r) => CfiRuleKind::Register {
            base_register: i32::from(r.0),
        },
        gimli::RegisterRule::Expression(e) => CfiRuleKind::Expression(e.0.to_vec()),
        gimli::RegisterRule::ValExpression(e) => CfiRuleKind::ValExpression(e.0.to_vec()),
        gimli::RegisterRule::Architectural => return None,
    };
    Some(kind)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_own_executable() {
        let path = std::env::current_exe().unwrap();
        let data = std::fs::read(path).unwrap();
        let object = object::File::parse(&*data).unwrap();
        let db = parse_file(&object).unwrap();

        assert!(db.entry_count() > 0);
        assert!(db.files().any(|f| f.filename.ends_with("dwarf_parser.rs")));
        assert!(db
            .attributes_by_kind(gimli::DW_AT_name)
            .any(|a| a.value.as_str() == Some("parse_own_executable")));
        assert!(db.locations().all(|l| l.length > 0));
    }

    #[test]
    fn unit_offsets_flatten_to_keys() {
        let info = gimli::UnitSectionOffset::DebugInfoOffset(gimli::DebugInfoOffset(0x2d));
        let types = gimli::UnitSectionOffset::DebugTypesOffset(gimli::DebugTypesOffset(0x4a));
        assert_eq!(section_offset(info), 0x2d);
        assert_eq!(section_offset(types), 0x4a);
    }
}
