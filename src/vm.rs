//! Feeding a live debuggee's state to the DWARF expression evaluator.
//!
//! Location expressions ask for register values, memory words and the
//! frame base of the enclosing function. `VirtualMachineInputs` answers
//! those from a `SimpleDebugger`, caching the register snapshot of the
//! thread it was created for.

use gimli::{EndianSlice, LittleEndian};
use scroll::Pread;
use tracing::{debug, trace};

use crate::error::VmError;
use crate::model::{AttrValue, CfiRuleKind, DebugInfoEntry, LocListEntry, CFA_REGISTER};
use crate::SymbolDb;

/// General purpose registers of a stopped x86-64 thread.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RegisterSet {
    pub rax: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
}

impl RegisterSet {
    /// Looks up a register by its number in the x86-64 DWARF register
    /// mapping. Numbers past the general purpose registers (the return
    /// address column 16 aside) aren't tracked.
    pub fn by_dwarf_number(&self, number: u16) -> Option<u64> {
        let value = match number {
            0 => self.rax,
            1 => self.rdx,
            2 => self.rcx,
            3 => self.rbx,
            4 => self.rsi,
            5 => self.rdi,
            6 => self.rbp,
            7 => self.rsp,
            8 => self.r8,
            9 => self.r9,
            10 => self.r10,
            11 => self.r11,
            12 => self.r12,
            13 => self.r13,
            14 => self.r14,
            15 => self.r15,
            16 => self.rip,
            _ => return None,
        };
        Some(value)
    }

    /// Mutable counterpart of `by_dwarf_number`.
    pub fn by_dwarf_number_mut(&mut self, number: u16) -> Option<&mut u64> {
        let slot = match number {
            0 => &mut self.rax,
            1 => &mut self.rdx,
            2 => &mut self.rcx,
            3 => &mut self.rbx,
            4 => &mut self.rsi,
            5 => &mut self.rdi,
            6 => &mut self.rbp,
            7 => &mut self.rsp,
            8 => &mut self.r8,
            9 => &mut self.r9,
            10 => &mut self.r10,
            11 => &mut self.r11,
            12 => &mut self.r12,
            13 => &mut self.r13,
            14 => &mut self.r14,
            15 => &mut self.r15,
            16 => &mut self.rip,
            _ => return None,
        };
        Some(slot)
    }
}

/// The process control layer, as far as the DWARF machinery needs it.
pub trait SimpleDebugger {
    fn registers(&self, thread: u32) -> Result<RegisterSet, VmError>;
    /// Fills `buf` from the debuggee's memory at `address`.
    fn read_memory(&self, address: u64, buf: &mut [u8]) -> Result<(), VmError>;
}

/// Inputs to the DWARF location expression machine.
pub trait DwarfVm {
    fn bit_width(&self) -> u32;
    /// Whether the target is little-endian.
    fn is_lsb(&self) -> bool;
    /// Records a failure encountered while evaluating an expression.
    fn error_string(&mut self, message: &str);
    fn read_register(&mut self, register: u16) -> Option<u64>;
    /// Reads a `count`-byte word, zero-extended.
    fn read_memory(&mut self, address: u64, count: usize) -> Option<u64>;
    fn read_frame_base(&mut self) -> u64;

    /// Value of the canonical frame address, for `DW_OP_call_frame_cfa`.
    fn read_call_frame_cfa(&mut self) -> Option<u64> {
        self.error_string("call frame CFA is not available");
        None
    }
}

/// `DwarfVm` backed by a `SimpleDebugger`.
pub struct VirtualMachineInputs<'d, D: SimpleDebugger + ?Sized> {
    debugger: &'d D,
    thread: u32,
    /// Register snapshot, fetched on first use. A failed fetch is kept too,
    /// so the debugger is asked at most once between invalidations.
    registers: Option<Result<RegisterSet, VmError>>,
    frame_base: u64,
    call_frame_cfa: Option<u64>,
    last_error: Option<String>,
}

impl<'d, D: SimpleDebugger + ?Sized> VirtualMachineInputs<'d, D> {
    pub fn new(debugger: &'d D, thread: u32) -> Self {
        Self {
            debugger,
            thread,
            registers: None,
            frame_base: 0,
            call_frame_cfa: None,
            last_error: None,
        }
    }

    pub fn thread(&self) -> u32 {
        self.thread
    }

    /// Switches to another thread. Its registers are fetched on next use.
    pub fn set_thread(&mut self, thread: u32) {
        self.thread = thread;
        self.invalidate();
    }

    /// Drops the cached register snapshot. Must be called whenever the
    /// debuggee has run.
    pub fn invalidate(&mut self) {
        self.registers = None;
        self.call_frame_cfa = None;
    }

    pub fn set_frame_base(&mut self, frame_base: u64) {
        self.frame_base = frame_base;
    }

    pub fn set_call_frame_cfa(&mut self, cfa: Option<u64>) {
        self.call_frame_cfa = cfa;
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn registers(&mut self) -> Option<RegisterSet> {
        let fetched = match &self.registers {
            Some(r) => r.clone(),
            None => {
                let r = self.debugger.registers(self.thread);
                self.registers = Some(r.clone());
                r
            }
        };
        match fetched {
            Ok(r) => Some(r),
            Err(e) => {
                self.error_string(&e.to_string());
                None
            }
        }
    }
}

impl<D: SimpleDebugger + ?Sized> DwarfVm for VirtualMachineInputs<'_, D> {
    fn bit_width(&self) -> u32 {
        64
    }

    fn is_lsb(&self) -> bool {
        true
    }

    fn error_string(&mut self, message: &str) {
        debug!("dwarf vm: {message}");
        self.last_error = Some(message.to_string());
    }

    fn read_register(&mut self, register: u16) -> Option<u64> {
        let value = self.registers()?.by_dwarf_number(register);
        if value.is_none() {
            self.error_string(&VmError::NoSuchRegister(register).to_string());
        }
        value
    }

    fn read_memory(&mut self, address: u64, count: usize) -> Option<u64> {
        let mut buf = [0u8; 8];
        let Some(word) = buf.get_mut(..count) else {
            self.error_string(&VmError::Memory { address, count }.to_string());
            return None;
        };
        if let Err(e) = self.debugger.read_memory(address, word) {
            self.error_string(&e.to_string());
            return None;
        }
        match buf[..].pread_with::<u64>(0, scroll::LE) {
            Ok(value) => Some(value),
            Err(e) => {
                self.error_string(&e.to_string());
                None
            }
        }
    }

    fn read_frame_base(&mut self) -> u64 {
        self.frame_base
    }

    fn read_call_frame_cfa(&mut self) -> Option<u64> {
        if self.call_frame_cfa.is_none() {
            self.error_string("call frame CFA is not available");
        }
        self.call_frame_cfa
    }
}

/// Where an evaluated location expression says an object lives.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DwarfLocation {
    Address(u64),
    /// The object lives in a register (by DWARF number).
    Register(u16),
    /// The object has no location, but this value.
    Value(u64),
}

fn encoding() -> gimli::Encoding {
    gimli::Encoding {
        format: gimli::Format::Dwarf32,
        version: 4,
        address_size: 8,
    }
}

/// Runs a DWARF location expression against `vm`.
///
/// Only the first piece of a composite location is reported. On failure
/// the reason is passed to `DwarfVm::error_string` and `None` comes back.
pub fn evaluate_location<V: DwarfVm + ?Sized>(vm: &mut V, expr: &[u8]) -> Option<DwarfLocation> {
    evaluate_with_initial(vm, expr, None)
}

/// Like `evaluate_location`, with `initial` pushed on the stack first, as
/// call frame rule expressions expect of the CFA.
fn evaluate_with_initial<V: DwarfVm + ?Sized>(
    vm: &mut V,
    expr: &[u8],
    initial: Option<u64>,
) -> Option<DwarfLocation> {
    match run_expression(vm, expr, initial) {
        Ok(location) => location,
        Err(e) => {
            vm.error_string(&format!("bad location expression: {e}"));
            None
        }
    }
}

/// Inner evaluation loop. `Ok(None)` means the VM couldn't supply an input
/// and has already recorded why.
fn run_expression<V: DwarfVm + ?Sized>(
    vm: &mut V,
    expr: &[u8],
    initial: Option<u64>,
) -> gimli::Result<Option<DwarfLocation>> {
    let expression = gimli::Expression(EndianSlice::new(expr, LittleEndian));
    let mut evaluation = expression.evaluation(encoding());
    if let Some(value) = initial {
        evaluation.set_initial_value(value);
    }
    let mut result = evaluation.evaluate()?;
    loop {
        result = match result {
            gimli::EvaluationResult::Complete => break,
            gimli::EvaluationResult::RequiresMemory {
                address,
                size,
                base_type,
                ..
            } => {
                let Some(word) = vm.read_memory(address, usize::from(size)) else {
                    return Ok(None);
                };
                let value = if base_type == gimli::UnitOffset(0) {
                    gimli::Value::Generic(word)
                } else {
                    // Truncation to the requested size is intended.
                    match size {
                        1 => gimli::Value::U8(word as u8),
                        2 => gimli::Value::U16(word as u16),
                        4 => gimli::Value::U32(word as u32),
                        _ => gimli::Value::U64(word),
                    }
                };
                evaluation.resume_with_memory(value)?
            }
            gimli::EvaluationResult::RequiresRegister { register, .. } => {
                let Some(value) = vm.read_register(register.0) else {
                    return Ok(None);
                };
                evaluation.resume_with_register(gimli::Value::Generic(value))?
            }
            gimli::EvaluationResult::RequiresFrameBase => {
                let frame_base = vm.read_frame_base();
                evaluation.resume_with_frame_base(frame_base)?
            }
            gimli::EvaluationResult::RequiresCallFrameCfa => {
                let Some(cfa) = vm.read_call_frame_cfa() else {
                    return Ok(None);
                };
                evaluation.resume_with_call_frame_cfa(cfa)?
            }
            // Addresses in the database are already final.
            gimli::EvaluationResult::RequiresRelocatedAddress(address) => {
                evaluation.resume_with_relocated_address(address)?
            }
            gimli::EvaluationResult::RequiresIndexedAddress { index, .. } => {
                vm.error_string(&format!(
                    "expression refers to .debug_addr entry {}, which is not loaded",
                    index.0
                ));
                return Ok(None);
            }
            gimli::EvaluationResult::RequiresBaseType(offset) => {
                vm.error_string(&format!(
                    "typed expression needs the base type at {:#x}",
                    offset.0
                ));
                return Ok(None);
            }
            other => {
                vm.error_string(&format!("unsupported expression input: {other:?}"));
                return Ok(None);
            }
        };
    }

    let pieces = evaluation.result();
    let Some(piece) = pieces.first() else {
        vm.error_string("expression produced no location");
        return Ok(None);
    };
    trace!("location for the expression: {:?}", piece.location);
    let location = match &piece.location {
        gimli::Location::Address { address } => DwarfLocation::Address(*address),
        gimli::Location::Register { register } => DwarfLocation::Register(register.0),
        gimli::Location::Value { value } => DwarfLocation::Value(value.to_u64(!0)?),
        other => {
            vm.error_string(&format!("unsupported location: {other:?}"));
            return Ok(None);
        }
    };
    Ok(Some(location))
}

/// Reduces a location to the value a frame base needs: the address, or the
/// contents of the register.
fn location_value<V: DwarfVm + ?Sized>(vm: &mut V, location: DwarfLocation) -> Option<u64> {
    match location {
        DwarfLocation::Address(a) | DwarfLocation::Value(a) => Some(a),
        DwarfLocation::Register(r) => vm.read_register(r),
    }
}

/// Computes the canonical frame address at `code_address` from the call
/// frame information in `db`.
pub fn call_frame_cfa<V: DwarfVm + ?Sized>(
    db: &SymbolDb,
    code_address: u64,
    vm: &mut V,
) -> Option<u64> {
    let frame = db.call_frame_for_address(code_address)?;
    let rule = frame
        .rules_at(code_address)
        .into_iter()
        .find(|r| r.register == CFA_REGISTER)?;
    match &rule.kind {
        CfiRuleKind::ValOffset {
            base_register,
            offset,
        } => {
            let base = vm.read_register(u16::try_from(*base_register).ok()?)?;
            Some(base.wrapping_add_signed(*offset))
        }
        CfiRuleKind::ValExpression(expr) => {
            let location = evaluate_location(vm, expr)?;
            location_value(vm, location)
        }
        _ => None,
    }
}

/// Works out the frame base of `function` while it executes `code_address`,
/// and primes `vm` with it.
///
/// `DW_AT_frame_base` is either an inline expression or the offset of a
/// location list. In a list, an entry starting at `u64::MAX` gives the frame
/// base directly as its end address; otherwise the first entry covering
/// `code_address` is evaluated.
pub fn resolve_frame_base<D: SimpleDebugger + ?Sized>(
    db: &SymbolDb,
    function: &DebugInfoEntry,
    code_address: u64,
    vm: &mut VirtualMachineInputs<'_, D>,
) -> Option<u64> {
    let cfa = call_frame_cfa(db, code_address, vm);
    vm.set_call_frame_cfa(cfa);

    let frame_base = match function.attr(gimli::DW_AT_frame_base)? {
        AttrValue::Buffer(expr) => {
            let location = evaluate_location(vm, expr)?;
            location_value(vm, location)?
        }
        AttrValue::Unsigned(offset) => {
            let Some(list) = db.loc_list(*offset) else {
                vm.error_string(&format!("no location list at {offset:#x}"));
                return None;
            };
            let frame_base = match list_entry_at(list, code_address) {
                Some(entry) if entry.start_address == u64::MAX => Some(entry.end_address),
                Some(entry) => {
                    let location = evaluate_location(vm, &entry.data)?;
                    location_value(vm, location)
                }
                None => None,
            };
            let Some(frame_base) = frame_base else {
                vm.error_string(&format!("frame base undefined at {code_address:#x}"));
                return None;
            };
            frame_base
        }
        _ => {
            vm.error_string("frame base attribute has an unexpected form");
            return None;
        }
    };

    vm.set_frame_base(frame_base);
    Some(frame_base)
}

/// Picks the entry of a location list that applies at `code_address`. An
/// entry starting at `u64::MAX` applies everywhere.
fn list_entry_at(list: &[LocListEntry], code_address: u64) -> Option<&LocListEntry> {
    list.iter()
        .find(|e| e.start_address == u64::MAX || e.contains(code_address))
}

/// Serves register requests from a frame's register set, and everything
/// else from the underlying machine. Used to evaluate expressions in frames
/// other than the innermost one.
struct FrameInputs<'a, V: ?Sized> {
    registers: &'a RegisterSet,
    cfa: u64,
    inner: &'a mut V,
}

impl<V: DwarfVm + ?Sized> DwarfVm for FrameInputs<'_, V> {
    fn bit_width(&self) -> u32 {
        self.inner.bit_width()
    }

    fn is_lsb(&self) -> bool {
        self.inner.is_lsb()
    }

    fn error_string(&mut self, message: &str) {
        self.inner.error_string(message)
    }

    fn read_register(&mut self, register: u16) -> Option<u64> {
        let value = self.registers.by_dwarf_number(register);
        if value.is_none() {
            self.error_string(&VmError::NoSuchRegister(register).to_string());
        }
        value
    }

    fn read_memory(&mut self, address: u64, count: usize) -> Option<u64> {
        self.inner.read_memory(address, count)
    }

    fn read_frame_base(&mut self) -> u64 {
        self.inner.read_frame_base()
    }

    fn read_call_frame_cfa(&mut self) -> Option<u64> {
        Some(self.cfa)
    }
}

/// Recovers the registers of the caller of the frame described by
/// `current`, by applying the call frame rules in effect at `current.rip`.
///
/// Memory is read through `vm`. The caller's stack pointer is the CFA
/// unless a rule says otherwise. Registers with an undefined rule, or no
/// rule at all, keep their current value.
pub fn unwind_caller_registers<V: DwarfVm + ?Sized>(
    db: &SymbolDb,
    current: &RegisterSet,
    vm: &mut V,
) -> Option<RegisterSet> {
    let pc = current.rip;
    let Some(frame) = db.call_frame_for_address(pc) else {
        vm.error_string(&format!("no call frame information for {pc:#x}"));
        return None;
    };
    let rules = frame.rules_at(pc);

    let Some(cfa_rule) = rules.iter().find(|r| r.register == CFA_REGISTER) else {
        vm.error_string(&format!("no CFA rule at {pc:#x}"));
        return None;
    };
    let mut frame_vm = FrameInputs {
        registers: current,
        cfa: 0,
        inner: vm,
    };
    let cfa = match &cfa_rule.kind {
        CfiRuleKind::ValOffset { base_register, offset } => {
            let base = frame_vm.read_register(u16::try_from(*base_register).ok()?)?;
            base.wrapping_add_signed(*offset)
        }
        CfiRuleKind::ValExpression(expr) => {
            let location = evaluate_location(&mut frame_vm, expr)?;
            location_value(&mut frame_vm, location)?
        }
        other => {
            frame_vm.error_string(&format!("unusable CFA rule {other:?}"));
            return None;
        }
    };
    frame_vm.cfa = cfa;
    trace!("cfa at {pc:#x} is {cfa:#x}");

    let mut caller = *current;
    caller.rsp = cfa;
    for rule in rules {
        if rule.register == CFA_REGISTER {
            continue;
        }
        let Ok(register) = u16::try_from(rule.register) else {
            continue;
        };
        let value = match &rule.kind {
            // The caller starts out as a copy of the current frame.
            CfiRuleKind::Undefined | CfiRuleKind::SameValue => continue,
            CfiRuleKind::Offset { base_register, offset } => {
                let base = rule_base(&mut frame_vm, *base_register)?;
                frame_vm.read_memory(base.wrapping_add_signed(*offset), 8)?
            }
            CfiRuleKind::ValOffset { base_register, offset } => {
                rule_base(&mut frame_vm, *base_register)?.wrapping_add_signed(*offset)
            }
            CfiRuleKind::Register { base_register } => {
                frame_vm.read_register(u16::try_from(*base_register).ok()?)?
            }
            CfiRuleKind::Expression(expr) => {
                match evaluate_with_initial(&mut frame_vm, expr, Some(cfa))? {
                    DwarfLocation::Address(a) => frame_vm.read_memory(a, 8)?,
                    other => location_value(&mut frame_vm, other)?,
                }
            }
            CfiRuleKind::ValExpression(expr) => {
                let location = evaluate_with_initial(&mut frame_vm, expr, Some(cfa))?;
                location_value(&mut frame_vm, location)?
            }
        };
        match caller.by_dwarf_number_mut(register) {
            Some(slot) => *slot = value,
            None => trace!("ignoring rule for untracked register {register}"),
        }
    }
    Some(caller)
}

/// Value of the base register of a rule; `CFA_REGISTER` is the CFA.
fn rule_base<V: DwarfVm + ?Sized>(vm: &mut FrameInputs<'_, V>, base_register: i32) -> Option<u64> {
    if base_register == CFA_REGISTER {
        Some(vm.cfa)
    } else {
        vm.read_register(u16::try_from(base_register).ok()?)
    }
}

/// A named object visible from some code address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Symbol {
    /// Key of the entry declaring the object.
    pub key: u64,
    pub name: String,
    /// Where the object lives, if its location could be worked out.
    pub location: Option<DwarfLocation>,
}

/// Collects the named objects with a location that are visible at
/// `address`, innermost scope first.
///
/// The frame base of the enclosing function is resolved into `vm` before
/// the locations are evaluated. Objects whose location can't be evaluated
/// are still listed, without one.
pub fn symbols_in_scope<D: SimpleDebugger + ?Sized>(
    db: &SymbolDb,
    address: u64,
    vm: &mut VirtualMachineInputs<'_, D>,
) -> Vec<Symbol> {
    let Some(scope) = db.scope_for_address(address) else {
        return vec![];
    };
    if let Some(function) = db.nearest_ancestor_with_tag(scope, gimli::DW_TAG_subprogram) {
        if resolve_frame_base(db, function, address, vm).is_none() {
            debug!("no frame base for {:#x} at {address:#x}", function.key);
        }
    }

    let mut symbols = vec![];
    let mut next = Some(scope);
    while let Some(scope) = next {
        for entry in db.children_of(scope.key) {
            let (Some(name), Some(location)) = (entry.name(), entry.attr(gimli::DW_AT_location))
            else {
                continue;
            };
            let location = match location {
                AttrValue::Buffer(expr) => evaluate_location(vm, expr),
                AttrValue::Unsigned(offset) => db
                    .loc_list(*offset)
                    .and_then(|list| list_entry_at(list, address))
                    .and_then(|e| evaluate_location(vm, &e.data)),
                _ => None,
            };
            symbols.push(Symbol {
                key: entry.key,
                name: name.to_string(),
                location,
            });
        }
        next = scope.outer_scope.and_then(|k| db.entry(k));
    }
    symbols
}

#[cfg(test)]
mod test {
    use std::cell::Cell;
    use std::collections::BTreeMap;

    use super::*;
    use crate::builder::{DwarfEvents, SymbolDbBuilder};

    struct FakeDebugger {
        regs: RegisterSet,
        memory: BTreeMap<u64, u8>,
        register_fetches: Cell<usize>,
    }

    impl FakeDebugger {
        fn new() -> Self {
            let mut memory = BTreeMap::new();
            for (i, b) in [0x78, 0x56, 0x34, 0x12, 0xef, 0xbe, 0xad, 0xde].into_iter().enumerate() {
                memory.insert(0x8000 + i as u64, b);
            }
            Self {
                regs: RegisterSet {
                    rbp: 0x7000,
                    rsp: 0x6ff0,
                    rip: 0x1004,
                    ..RegisterSet::default()
                },
                memory,
                register_fetches: Cell::new(0),
            }
        }

        fn poke(&mut self, address: u64, value: u64) {
            for (i, b) in value.to_le_bytes().into_iter().enumerate() {
                self.memory.insert(address + i as u64, b);
            }
        }
    }

    impl SimpleDebugger for FakeDebugger {
        fn registers(&self, thread: u32) -> Result<RegisterSet, VmError> {
            self.register_fetches.set(self.register_fetches.get() + 1);
            if thread == 99 {
                return Err(VmError::Registers(thread));
            }
            Ok(self.regs)
        }

        fn read_memory(&self, address: u64, buf: &mut [u8]) -> Result<(), VmError> {
            let count = buf.len();
            for (i, b) in buf.iter_mut().enumerate() {
                *b = *self
                    .memory
                    .get(&(address + i as u64))
                    .ok_or(VmError::Memory { address, count })?;
            }
            Ok(())
        }
    }

    #[test]
    fn registers_are_cached_until_invalidated() {
        let dbg = FakeDebugger::new();
        let mut vm = VirtualMachineInputs::new(&dbg, 1);
        assert_eq!(vm.read_register(6), Some(0x7000));
        assert_eq!(vm.read_register(7), Some(0x6ff0));
        assert_eq!(dbg.register_fetches.get(), 1);

        vm.invalidate();
        assert_eq!(vm.read_register(16), Some(0x1004));
        assert_eq!(dbg.register_fetches.get(), 2);

        vm.set_thread(99);
        assert_eq!(vm.read_register(6), None);
        assert_eq!(vm.last_error(), Some("could not read registers of thread 99"));
    }

    #[test]
    fn failed_register_fetch_is_cached() {
        let dbg = FakeDebugger::new();
        let mut vm = VirtualMachineInputs::new(&dbg, 99);
        assert_eq!(vm.read_register(6), None);
        assert_eq!(vm.read_register(7), None);
        assert_eq!(dbg.register_fetches.get(), 1);
        assert_eq!(vm.last_error(), Some("could not read registers of thread 99"));

        vm.invalidate();
        assert_eq!(vm.read_register(6), None);
        assert_eq!(dbg.register_fetches.get(), 2);

        vm.set_thread(1);
        assert_eq!(vm.read_register(6), Some(0x7000));
        assert_eq!(dbg.register_fetches.get(), 3);
    }

    #[test]
    fn memory_is_little_endian() {
        let dbg = FakeDebugger::new();
        let mut vm = VirtualMachineInputs::new(&dbg, 1);
        assert_eq!(vm.bit_width(), 64);
        assert!(vm.is_lsb());
        assert_eq!(vm.read_memory(0x8000, 4), Some(0x1234_5678));
        assert_eq!(vm.read_memory(0x8000, 8), Some(0xdead_beef_1234_5678));
        assert_eq!(vm.read_memory(0x8006, 4), None);
        assert!(vm.last_error().is_some());
        assert_eq!(vm.read_memory(0x8000, 9), None);
    }

    #[test]
    fn frame_relative_expressions() {
        let dbg = FakeDebugger::new();
        let mut vm = VirtualMachineInputs::new(&dbg, 1);
        vm.set_frame_base(0x7ff0);

        // DW_OP_fbreg -16
        assert_eq!(
            evaluate_location(&mut vm, &[0x91, 0x70]),
            Some(DwarfLocation::Address(0x7fe0))
        );
        // DW_OP_breg6 8
        assert_eq!(
            evaluate_location(&mut vm, &[0x76, 0x08]),
            Some(DwarfLocation::Address(0x7008))
        );
        // DW_OP_reg0
        assert_eq!(
            evaluate_location(&mut vm, &[0x50]),
            Some(DwarfLocation::Register(0))
        );
    }

    #[test]
    fn dereferencing_expression() {
        let dbg = FakeDebugger::new();
        let mut vm = VirtualMachineInputs::new(&dbg, 1);

        // DW_OP_addr 0x8000; DW_OP_deref
        let mut expr = vec![0x03];
        expr.extend_from_slice(&0x8000u64.to_le_bytes());
        expr.push(0x06);
        assert_eq!(
            evaluate_location(&mut vm, &expr),
            Some(DwarfLocation::Address(0xdead_beef_1234_5678))
        );

        // DW_OP_addr 0x9000; DW_OP_deref, unmapped
        let mut expr = vec![0x03];
        expr.extend_from_slice(&0x9000u64.to_le_bytes());
        expr.push(0x06);
        assert_eq!(evaluate_location(&mut vm, &expr), None);
        assert!(vm.last_error().is_some());
    }

    #[test]
    fn static_address_expression() {
        let dbg = FakeDebugger::new();
        let mut vm = VirtualMachineInputs::new(&dbg, 1);

        // DW_OP_addr 0x601040
        let mut expr = vec![0x03];
        expr.extend_from_slice(&0x60_1040u64.to_le_bytes());
        assert_eq!(
            evaluate_location(&mut vm, &expr),
            Some(DwarfLocation::Address(0x60_1040))
        );
        assert_eq!(vm.last_error(), None);
        // Constant addresses need no registers.
        assert_eq!(dbg.register_fetches.get(), 0);
    }

    #[test]
    fn malformed_expression_is_reported() {
        let dbg = FakeDebugger::new();
        let mut vm = VirtualMachineInputs::new(&dbg, 1);
        // DW_OP_addr with a truncated operand.
        assert_eq!(evaluate_location(&mut vm, &[0x03, 0x00]), None);
        assert!(vm
            .last_error()
            .unwrap()
            .starts_with("bad location expression"));
    }

    fn function_db(frame_base: AttrValue) -> SymbolDb {
        let mut b = SymbolDbBuilder::new();
        b.start_compilation_unit().unwrap();
        b.start_die(0, 0x20, gimli::DW_TAG_subprogram).unwrap();
        b.process_attribute(
            0x20,
            0x20,
            gimli::DW_AT_frame_base,
            gimli::DW_FORM_exprloc,
            frame_base,
        )
        .unwrap();
        b.end_die(0x20).unwrap();
        b.end_compilation_unit().unwrap();
        b.add_loc_list_entry(0x40, true, 0x1000, 0x1001, &[0x77, 0x08]).unwrap();
        b.add_loc_list_entry(0x40, false, 0x1001, 0x1040, &[0x76, 0x10]).unwrap();
        b.add_loc_list_entry(0x60, true, u64::MAX, 0x5000, &[]).unwrap();
        b.begin_cfi_entry(0x1000).unwrap();
        b.add_cfi_rule(
            0x1000,
            CFA_REGISTER,
            CfiRuleKind::ValOffset { base_register: 7, offset: 8 },
        )
        .unwrap();
        b.end_cfi_entry().unwrap();
        b.build()
    }

    #[test]
    fn frame_base_from_location_list() {
        let dbg = FakeDebugger::new();
        let db = function_db(AttrValue::Unsigned(0x40));
        let function = db.entry(0x20).unwrap();
        let mut vm = VirtualMachineInputs::new(&dbg, 1);

        // DW_OP_breg7 8 in the prologue, DW_OP_breg6 16 after it.
        assert_eq!(resolve_frame_base(&db, function, 0x1000, &mut vm), Some(0x6ff8));
        assert_eq!(resolve_frame_base(&db, function, 0x1004, &mut vm), Some(0x7010));
        assert_eq!(vm.read_frame_base(), 0x7010);
        assert_eq!(resolve_frame_base(&db, function, 0x2000, &mut vm), None);
    }

    #[test]
    fn frame_base_given_directly() {
        let dbg = FakeDebugger::new();
        let db = function_db(AttrValue::Unsigned(0x60));
        let function = db.entry(0x20).unwrap();
        let mut vm = VirtualMachineInputs::new(&dbg, 1);
        assert_eq!(resolve_frame_base(&db, function, 0x1004, &mut vm), Some(0x5000));
    }

    #[test]
    fn frame_base_from_call_frame_cfa() {
        let dbg = FakeDebugger::new();
        // DW_OP_call_frame_cfa
        let db = function_db(AttrValue::Buffer(vec![0x9c]));
        let function = db.entry(0x20).unwrap();
        let mut vm = VirtualMachineInputs::new(&dbg, 1);
        assert_eq!(resolve_frame_base(&db, function, 0x1004, &mut vm), Some(0x6ff8));

        // No call frame covers this address.
        assert_eq!(resolve_frame_base(&db, function, 0x10, &mut vm), None);
        assert_eq!(vm.last_error(), Some("call frame CFA is not available"));
    }

    /// Prologue of a frame-pointer function: `push rbp` at 0x1000, then
    /// `mov rbp, rsp` at 0x1001, body from 0x1004.
    fn unwind_db() -> SymbolDb {
        let mut b = SymbolDbBuilder::new();
        b.begin_cfi_entry(0x1000).unwrap();
        let rules = [
            (0x1000, CFA_REGISTER, CfiRuleKind::ValOffset { base_register: 7, offset: 8 }),
            (0x1000, 16, CfiRuleKind::Offset { base_register: CFA_REGISTER, offset: -8 }),
            (0x1001, CFA_REGISTER, CfiRuleKind::ValOffset { base_register: 7, offset: 16 }),
            (0x1001, 6, CfiRuleKind::Offset { base_register: CFA_REGISTER, offset: -16 }),
            (0x1004, CFA_REGISTER, CfiRuleKind::ValOffset { base_register: 6, offset: 16 }),
            // DW_OP_const1u 0x18; DW_OP_minus
            (0x1004, 3, CfiRuleKind::Expression(vec![0x08, 0x18, 0x1c])),
            (0x1004, 12, CfiRuleKind::SameValue),
        ];
        for (address, register, kind) in rules {
            b.add_cfi_rule(address, register, kind).unwrap();
        }
        b.end_cfi_entry().unwrap();
        b.build()
    }

    #[test]
    fn unwinding_in_function_body() {
        let mut dbg = FakeDebugger::new();
        dbg.poke(0x7008, 0x4000_1234);
        dbg.poke(0x7000, 0x7100);
        dbg.poke(0x6ff8, 0xb0b);
        let db = unwind_db();
        let current = RegisterSet {
            rax: 1,
            r12: 2,
            ..dbg.regs
        };
        let mut vm = VirtualMachineInputs::new(&dbg, 1);

        let caller = unwind_caller_registers(&db, &current, &mut vm).unwrap();
        assert_eq!(caller.rip, 0x4000_1234);
        assert_eq!(caller.rbp, 0x7100);
        assert_eq!(caller.rsp, 0x7010);
        assert_eq!(caller.rbx, 0xb0b);
        assert_eq!(caller.rax, 1);
        assert_eq!(caller.r12, 2);
        // Registers come from `current`, not the live thread.
        assert_eq!(dbg.register_fetches.get(), 0);
    }

    #[test]
    fn unwinding_at_function_entry() {
        let mut dbg = FakeDebugger::new();
        dbg.poke(0x6ff0, 0x4000_5678);
        let db = unwind_db();
        let current = RegisterSet {
            rip: 0x1000,
            ..dbg.regs
        };
        let mut vm = VirtualMachineInputs::new(&dbg, 1);

        let caller = unwind_caller_registers(&db, &current, &mut vm).unwrap();
        assert_eq!(caller.rip, 0x4000_5678);
        assert_eq!(caller.rsp, 0x6ff8);
        assert_eq!(caller.rbp, 0x7000);
    }

    #[test]
    fn unwinding_needs_call_frame_information() {
        let dbg = FakeDebugger::new();
        let db = unwind_db();
        let current = RegisterSet {
            rip: 0x10,
            ..dbg.regs
        };
        let mut vm = VirtualMachineInputs::new(&dbg, 1);
        assert_eq!(unwind_caller_registers(&db, &current, &mut vm), None);
        assert!(vm.last_error().unwrap().starts_with("no call frame information"));

        // The return address slot is unmapped.
        let current = RegisterSet {
            rip: 0x1000,
            rsp: 0x9000,
            ..dbg.regs
        };
        assert_eq!(unwind_caller_registers(&db, &current, &mut vm), None);
    }

    fn var(b: &mut SymbolDbBuilder, parent: u64, key: u64, name: Option<&str>, location: AttrValue) {
        b.start_die(parent, key, gimli::DW_TAG_variable).unwrap();
        if let Some(name) = name {
            b.process_attribute(
                key,
                key,
                gimli::DW_AT_name,
                gimli::DW_FORM_string,
                AttrValue::String(name.into()),
            )
            .unwrap();
        }
        b.process_attribute(key, key, gimli::DW_AT_location, gimli::DW_FORM_exprloc, location)
            .unwrap();
        b.end_die(key).unwrap();
    }

    fn pc_range(b: &mut SymbolDbBuilder, key: u64, low: u64, high: u64) {
        for (attr, value) in [(gimli::DW_AT_low_pc, low), (gimli::DW_AT_high_pc, high)] {
            b.process_attribute(key, key, attr, gimli::DW_FORM_addr, AttrValue::Unsigned(value))
                .unwrap();
        }
    }

    fn locals_db() -> SymbolDb {
        let mut b = SymbolDbBuilder::new();
        b.start_compilation_unit().unwrap();
        b.start_die(0, 0x20, gimli::DW_TAG_subprogram).unwrap();
        pc_range(&mut b, 0x20, 0x1000, 0x1040);
        // DW_OP_reg6
        b.process_attribute(
            0x20,
            0x20,
            gimli::DW_AT_frame_base,
            gimli::DW_FORM_exprloc,
            AttrValue::Buffer(vec![0x56]),
        )
        .unwrap();
        // DW_OP_fbreg -16
        var(&mut b, 0x20, 0x30, Some("x"), AttrValue::Buffer(vec![0x91, 0x70]));
        var(&mut b, 0x20, 0x38, None, AttrValue::Buffer(vec![0x91, 0x78]));
        b.start_die(0x20, 0x40, gimli::DW_TAG_lexical_block).unwrap();
        pc_range(&mut b, 0x40, 0x1008, 0x1010);
        // DW_OP_fbreg -24
        var(&mut b, 0x40, 0x48, Some("y"), AttrValue::Buffer(vec![0x91, 0x68]));
        b.end_die(0x40).unwrap();
        var(&mut b, 0x20, 0x50, Some("z"), AttrValue::Unsigned(0x90));
        // Truncated DW_OP_addr.
        var(&mut b, 0x20, 0x58, Some("broken"), AttrValue::Buffer(vec![0x03, 0x00]));
        b.end_die(0x20).unwrap();
        b.end_compilation_unit().unwrap();
        // DW_OP_reg0 while in the first half of the function.
        b.add_loc_list_entry(0x90, true, 0x1000, 0x1010, &[0x50]).unwrap();
        b.build()
    }

    #[test]
    fn symbols_visible_in_nested_scope() {
        let dbg = FakeDebugger::new();
        let db = locals_db();
        let mut vm = VirtualMachineInputs::new(&dbg, 1);

        let symbols = symbols_in_scope(&db, 0x100a, &mut vm);
        let found = symbols
            .iter()
            .map(|s| (s.key, s.name.as_str(), s.location))
            .collect::<Vec<_>>();
        assert_eq!(
            found,
            [
                (0x48, "y", Some(DwarfLocation::Address(0x6fe8))),
                (0x30, "x", Some(DwarfLocation::Address(0x6ff0))),
                (0x50, "z", Some(DwarfLocation::Register(0))),
                (0x58, "broken", None),
            ]
        );
        assert_eq!(vm.read_frame_base(), 0x7000);
    }

    #[test]
    fn symbols_outside_inner_scope() {
        let dbg = FakeDebugger::new();
        let db = locals_db();
        let mut vm = VirtualMachineInputs::new(&dbg, 1);

        let names = symbols_in_scope(&db, 0x1020, &mut vm)
            .into_iter()
            .map(|s| (s.name, s.location.is_some()))
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            [
                ("x".to_string(), true),
                ("z".to_string(), false),
                ("broken".to_string(), false),
            ]
        );
        assert!(symbols_in_scope(&db, 0x5000, &mut vm).is_empty());
    }
}
