use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use log::{error, trace, warn};
use unicorn_engine::{RegisterRISCV, uc_error};

use crate::device::{QuitDetail, StopReason, UnicornContext, request_stop};

pub type CsrNumber = u16;

const OPCODE_SYSTEM: u32 = 0x73;

#[macro_export]
macro_rules! log_unimplemented_csr {
    ($role:expr, $csrno:expr) => {
        warn!("{} (csrno = {:04x})", $role, $csrno)
    };
    ($role:expr, $csrno:expr, $value:expr) => {
        warn!("{} (csrno = {:04x}): {:08x}", $role, $csrno, $value)
    };
}

/// Exception a CSR operation may raise instead of completing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CsrException {
    IllegalInstruction,
}

pub type CsrResult<T = ()> = Result<T, CsrException>;

/// Hart state visible to CSR operations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HartContext {
    /// Address of the CSR instruction being executed.
    pub pc: u64,
}

/// Behavior bound to one or more CSR numbers.
///
/// The engine calls `predicate` first; `read` and `write` only run if it succeeds. An `Err` from any of them
/// turns the access into an illegal instruction exception.
pub trait CsrOps {
    fn name(&self) -> &str;

    fn predicate(&self, hart: &HartContext, csrno: CsrNumber) -> CsrResult;

    /// Read the CSR. `current` is the value held in the core's result slot before the read.
    fn read(&self, hart: &HartContext, csrno: CsrNumber, current: u32) -> CsrResult<u32>;

    fn write(&self, hart: &HartContext, csrno: CsrNumber, new_value: u32) -> CsrResult;
}

impl fmt::Debug for dyn CsrOps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CsrOps").field(&self.name()).finish()
    }
}

/// Stub for CSRs without a model: accesses are logged and otherwise ignored.
#[derive(Debug)]
pub struct UnimplementedCsr {
    name: &'static str,
}

impl UnimplementedCsr {
    pub const fn new(name: &'static str) -> Self {
        Self { name }
    }
}

impl CsrOps for UnimplementedCsr {
    fn name(&self) -> &str {
        self.name
    }

    fn predicate(&self, _hart: &HartContext, csrno: CsrNumber) -> CsrResult {
        log_unimplemented_csr!("csr_unimp_predicate", csrno);
        // TODO: Reject accesses below machine mode once the current privilege level is passed in HartContext.
        Ok(())
    }

    fn read(&self, _hart: &HartContext, csrno: CsrNumber, current: u32) -> CsrResult<u32> {
        let value = current;
        log_unimplemented_csr!("csr_unimp_read", csrno, value);
        Ok(value)
    }

    fn write(&self, _hart: &HartContext, csrno: CsrNumber, new_value: u32) -> CsrResult {
        log_unimplemented_csr!("csr_unimp_write", csrno, new_value);
        Ok(())
    }
}

/// CSR number to operations map, owned by one core.
#[derive(Clone, Default, Debug)]
pub struct CsrTable {
    ops: BTreeMap<CsrNumber, Rc<dyn CsrOps>>,
}

impl CsrTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `ops` to `csrno`, returning the previous binding.
    pub fn set_csr_ops(&mut self, csrno: CsrNumber, ops: Rc<dyn CsrOps>) -> Option<Rc<dyn CsrOps>> {
        self.ops.insert(csrno, ops)
    }

    pub fn get(&self, csrno: CsrNumber) -> Option<&Rc<dyn CsrOps>> {
        self.ops.get(&csrno)
    }

    pub fn contains(&self, csrno: CsrNumber) -> bool {
        self.ops.contains_key(&csrno)
    }

    pub fn numbers(&self) -> impl Iterator<Item = CsrNumber> + '_ {
        self.ops.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CsrAccess {
    /// Machine mode read/write (MRW).
    ReadWrite,
    /// Machine mode read-only (MRO).
    ReadOnly,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CsrInfo {
    pub number: CsrNumber,
    pub name: &'static str,
    pub access: CsrAccess,
    pub description: &'static str,
}

const fn mrw(number: CsrNumber, name: &'static str, description: &'static str) -> CsrInfo {
    CsrInfo { number, name, access: CsrAccess::ReadWrite, description }
}

/// Nuclei Bumblebee custom CSRs, per the Bumblebee Core Architecture Manual.
pub const BUMBLEBEE_CUSTOM_CSRS: [CsrInfo; 17] = [
    mrw(0x320, "mcountinhibit", "Counter inhibit control"),
    CsrInfo { number: 0x7c3, name: "mnvec", access: CsrAccess::ReadOnly, description: "NMI entry address" },
    mrw(0x7c4, "msubm", "Trap type of the current and previous context"),
    mrw(0x7d0, "mmisc_ctl", "Miscellaneous control, including the NMI handler entry selection"),
    mrw(0x7d6, "msavestatus", "Saved mstatus"),
    mrw(0x7d7, "msaveepc1", "Saved mepc of the first-level preempted NMI or exception"),
    mrw(0x7d8, "msavecause1", "Saved mcause of the first-level preempted NMI or exception"),
    mrw(0x7d9, "msaveepc2", "Saved mepc of the second-level preempted NMI or exception"),
    mrw(0x7da, "msavecause2", "Saved mcause of the second-level preempted NMI or exception"),
    mrw(0x7eb, "pushmsubm", "Push msubm to the stack"),
    mrw(0x7ec, "mtvt2", "ECLIC non-vectored interrupt handler address"),
    mrw(0x7ed, "jalmnxti", "Jump to the next interrupt handler and enable interrupts"),
    mrw(0x7ee, "pushmcause", "Push mcause to the stack"),
    mrw(0x7ef, "pushmepc", "Push mepc to the stack"),
    mrw(0x810, "wfe", "Wait for event control"),
    mrw(0x811, "sleepvalue", "WFI sleep mode"),
    mrw(0x812, "txevt", "Send event"),
];

pub fn bumblebee_csr_info(csrno: CsrNumber) -> Option<&'static CsrInfo> {
    BUMBLEBEE_CUSTOM_CSRS.iter().find(|info| info.number == csrno)
}

/// CSRs with bits [11:10] set are read-only by encoding; writing them is always illegal.
#[inline]
pub fn is_read_only(csrno: CsrNumber) -> bool {
    (csrno >> 10) & 0x3 == 0x3
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CsrOp {
    /// CSRRW / CSRRWI
    ReadWrite,
    /// CSRRS / CSRRSI
    ReadSet,
    /// CSRRC / CSRRCI
    ReadClear,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CsrSource {
    Register(u8),
    Immediate(u8),
}

/// A decoded Zicsr instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CsrInstruction {
    pub csrno: CsrNumber,
    pub op: CsrOp,
    pub rd: u8,
    pub source: CsrSource,
}

impl CsrInstruction {
    pub fn decode(insn: u32) -> Option<Self> {
        if insn & 0x7f != OPCODE_SYSTEM {
            return None;
        }
        let rd = ((insn >> 7) & 0x1f) as u8;
        let field = ((insn >> 15) & 0x1f) as u8;
        let csrno = (insn >> 20) as CsrNumber;
        let (op, source) = match (insn >> 12) & 0x7 {
            0b001 => (CsrOp::ReadWrite, CsrSource::Register(field)),
            0b010 => (CsrOp::ReadSet, CsrSource::Register(field)),
            0b011 => (CsrOp::ReadClear, CsrSource::Register(field)),
            0b101 => (CsrOp::ReadWrite, CsrSource::Immediate(field)),
            0b110 => (CsrOp::ReadSet, CsrSource::Immediate(field)),
            0b111 => (CsrOp::ReadClear, CsrSource::Immediate(field)),
            _ => return None,
        };
        Some(Self { csrno, op, rd, source })
    }

    /// CSRRW(I) with `rd = x0` must not read the CSR.
    pub fn reads(&self) -> bool {
        !(self.op == CsrOp::ReadWrite && self.rd == 0)
    }

    /// CSRRS(I)/CSRRC(I) with `rs1 = x0` (or a zero immediate) must not write the CSR.
    pub fn writes(&self) -> bool {
        match (self.op, self.source) {
            (CsrOp::ReadWrite, _) => true,
            (_, CsrSource::Register(index)) | (_, CsrSource::Immediate(index)) => index != 0,
        }
    }
}

/// Run `insn` against `ops`.
///
/// `operand` is the value of rs1 (or the zero-extended immediate). Returns the value to place in rd, if any.
pub fn execute(
    ops: &dyn CsrOps,
    hart: &HartContext,
    insn: &CsrInstruction,
    operand: u32,
) -> CsrResult<Option<u32>> {
    let writes = insn.writes();
    if writes && is_read_only(insn.csrno) {
        return Err(CsrException::IllegalInstruction);
    }
    ops.predicate(hart, insn.csrno)?;

    // The result slot starts at the reset value; handlers without storage hand it back unchanged.
    let old_value = if insn.reads() { ops.read(hart, insn.csrno, 0)? } else { 0 };

    if writes {
        let new_value = match insn.op {
            CsrOp::ReadWrite => operand,
            CsrOp::ReadSet => old_value | operand,
            CsrOp::ReadClear => old_value & !operand,
        };
        ops.write(hart, insn.csrno, new_value)?;
    }

    Ok((insn.rd != 0).then_some(old_value))
}

#[inline]
fn gpr(index: u8) -> i32 {
    RegisterRISCV::X0 as i32 + i32::from(index)
}

fn try_intercept(uc: &mut UnicornContext, pc: u64) -> Result<bool, uc_error> {
    let mut raw = [0u8; 4];
    uc.mem_read(pc, &mut raw)?;

    let Some(insn) = CsrInstruction::decode(u32::from_le_bytes(raw)) else {
        return Ok(false);
    };
    let Some(ops) = uc.get_data().csrs.get(insn.csrno).cloned() else {
        return Ok(false);
    };

    let operand = match insn.source {
        CsrSource::Register(0) => 0,
        CsrSource::Register(rs1) => uc.reg_read(gpr(rs1))? as u32,
        CsrSource::Immediate(uimm) => u32::from(uimm),
    };

    let hart = HartContext { pc };
    match execute(ops.as_ref(), &hart, &insn, operand) {
        Ok(rd_value) => {
            if let Some(value) = rd_value {
                uc.reg_write(gpr(insn.rd), u64::from(value))?;
            }
            trace!("csr: {} handled {:04x} @ 0x{pc:08x}", ops.name(), insn.csrno);
            Ok(true)
        }
        Err(CsrException::IllegalInstruction) => Ok(false),
    }
}

/// Illegal instruction exception handler.
///
/// The engine reports the exception with pc already past the faulting instruction, so a completed CSR access simply
/// resumes there. Anything else stays illegal: pc is moved back onto the instruction and emulation stops.
pub fn intercept_illegal_instruction(uc: &mut UnicornContext) {
    let pc = uc.pc_read().unwrap_or_default().wrapping_sub(4);
    match try_intercept(uc, pc) {
        Ok(true) => return,
        Ok(false) => error!("exception: illegal instruction @ 0x{pc:08x}."),
        Err(err) => error!("exception: cannot emulate CSR access @ 0x{pc:08x}: {err:?}"),
    }
    if let Err(err) = uc.set_pc(pc) {
        error!("cannot rewind pc to 0x{pc:08x}: {err:?}");
    }
    request_stop(uc, StopReason::Quit(QuitDetail::IllegalInstruction { pc }));
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use log::Level;

    use super::*;
    use crate::testing::{capture_logs, take_logs};

    fn encode_csr(funct3: u32, rd: u32, field: u32, csrno: u32) -> u32 {
        (csrno << 20) | (field << 15) | (funct3 << 12) | (rd << 7) | OPCODE_SYSTEM
    }

    /// Records calls and keeps a real value, to observe what `execute` does.
    struct Recording {
        value: RefCell<u32>,
        calls: RefCell<Vec<&'static str>>,
        deny: bool,
    }

    impl Recording {
        fn new(value: u32) -> Self {
            Self { value: RefCell::new(value), calls: RefCell::new(Vec::new()), deny: false }
        }
    }

    impl CsrOps for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        fn predicate(&self, _hart: &HartContext, _csrno: CsrNumber) -> CsrResult {
            self.calls.borrow_mut().push("predicate");
            if self.deny { Err(CsrException::IllegalInstruction) } else { Ok(()) }
        }

        fn read(&self, _hart: &HartContext, _csrno: CsrNumber, _current: u32) -> CsrResult<u32> {
            self.calls.borrow_mut().push("read");
            Ok(*self.value.borrow())
        }

        fn write(&self, _hart: &HartContext, _csrno: CsrNumber, new_value: u32) -> CsrResult {
            self.calls.borrow_mut().push("write");
            *self.value.borrow_mut() = new_value;
            Ok(())
        }
    }

    #[test]
    fn bumblebee_csr_list() {
        let numbers: Vec<CsrNumber> = BUMBLEBEE_CUSTOM_CSRS.iter().map(|info| info.number).collect();
        assert_eq!(
            numbers,
            [
                0x320, 0x7c3, 0x7c4, 0x7d0, 0x7d6, 0x7d7, 0x7d8, 0x7d9, 0x7da, 0x7eb, 0x7ec, 0x7ed, 0x7ee, 0x7ef,
                0x810, 0x811, 0x812
            ]
        );
        assert_eq!(bumblebee_csr_info(0x7c3).map(|info| info.access), Some(CsrAccess::ReadOnly));
        assert_eq!(bumblebee_csr_info(0x811).map(|info| info.name), Some("sleepvalue"));
        assert!(bumblebee_csr_info(0x300).is_none());
        assert!(BUMBLEBEE_CUSTOM_CSRS.iter().all(|info| !is_read_only(info.number)));
    }

    #[test]
    fn decode_register_and_immediate_forms() {
        let csrrw = CsrInstruction::decode(encode_csr(0b001, 5, 6, 0x7c3)).unwrap();
        assert_eq!(
            csrrw,
            CsrInstruction { csrno: 0x7c3, op: CsrOp::ReadWrite, rd: 5, source: CsrSource::Register(6) }
        );

        let csrrci = CsrInstruction::decode(encode_csr(0b111, 0, 3, 0x810)).unwrap();
        assert_eq!(csrrci.op, CsrOp::ReadClear);
        assert_eq!(csrrci.source, CsrSource::Immediate(3));

        // ecall, ebreak and non-SYSTEM opcodes are not CSR accesses
        assert_eq!(CsrInstruction::decode(0x0000_0073), None);
        assert_eq!(CsrInstruction::decode(0x0010_0073), None);
        assert_eq!(CsrInstruction::decode(0x0000_0013), None);
        assert_eq!(CsrInstruction::decode(encode_csr(0b100, 1, 1, 0x320)), None);
    }

    #[test]
    fn read_and_write_suppression() {
        let csrw = CsrInstruction::decode(encode_csr(0b001, 0, 1, 0x7c4)).unwrap();
        assert!(!csrw.reads());
        assert!(csrw.writes());

        let csrr = CsrInstruction::decode(encode_csr(0b010, 7, 0, 0x7c4)).unwrap();
        assert!(csrr.reads());
        assert!(!csrr.writes());

        let csrsi = CsrInstruction::decode(encode_csr(0b110, 0, 4, 0x7c4)).unwrap();
        assert!(csrsi.reads());
        assert!(csrsi.writes());
    }

    #[test]
    fn execute_order_and_set_clear() {
        let hart = HartContext::default();
        let ops = Recording::new(0b1010);

        let set = CsrInstruction::decode(encode_csr(0b010, 1, 2, 0x7d0)).unwrap();
        assert_eq!(execute(&ops, &hart, &set, 0b0101), Ok(Some(0b1010)));
        assert_eq!(*ops.value.borrow(), 0b1111);
        assert_eq!(*ops.calls.borrow(), ["predicate", "read", "write"]);

        let clear = CsrInstruction::decode(encode_csr(0b111, 0, 0b0011, 0x7d0)).unwrap();
        assert_eq!(execute(&ops, &hart, &clear, 0b0011), Ok(None));
        assert_eq!(*ops.value.borrow(), 0b1100);
    }

    #[test]
    fn execute_rejects_denied_and_read_only_writes() {
        let hart = HartContext::default();
        let mut ops = Recording::new(0);
        ops.deny = true;
        let insn = CsrInstruction::decode(encode_csr(0b001, 1, 2, 0x7d0)).unwrap();
        assert_eq!(execute(&ops, &hart, &insn, 1), Err(CsrException::IllegalInstruction));
        assert_eq!(*ops.calls.borrow(), ["predicate"]);

        let ops = Recording::new(0);
        let write_ro = CsrInstruction::decode(encode_csr(0b001, 1, 2, 0xc00)).unwrap();
        assert_eq!(execute(&ops, &hart, &write_ro, 1), Err(CsrException::IllegalInstruction));
        assert!(ops.calls.borrow().is_empty());
    }

    #[test]
    fn unimplemented_csr_never_traps_and_logs_once_per_call() {
        let hart = HartContext { pc: 0x100 };
        let ops = UnimplementedCsr::new("test stub");
        capture_logs();

        for info in &BUMBLEBEE_CUSTOM_CSRS {
            assert_eq!(ops.predicate(&hart, info.number), Ok(()));
            let logs = take_logs();
            assert_eq!(logs.len(), 1);
            assert_eq!(logs[0].0, Level::Warn);
            assert_eq!(logs[0].1, format!("csr_unimp_predicate (csrno = {:04x})", info.number));

            assert_eq!(ops.read(&hart, info.number, 0), Ok(0));
            let logs = take_logs();
            assert_eq!(logs.len(), 1);
            assert_eq!(logs[0].1, format!("csr_unimp_read (csrno = {:04x}): 00000000", info.number));

            assert_eq!(ops.write(&hart, info.number, 0xdead_beef), Ok(()));
            let logs = take_logs();
            assert_eq!(logs.len(), 1);
            assert_eq!(logs[0].1, format!("csr_unimp_write (csrno = {:04x}): deadbeef", info.number));
        }
    }

    #[test]
    fn unimplemented_read_returns_slot_and_discards_writes() {
        let hart = HartContext::default();
        let ops = UnimplementedCsr::new("test stub");
        assert_eq!(ops.read(&hart, 0x7ec, 0x1234), Ok(0x1234));
        assert_eq!(ops.write(&hart, 0x7ec, 0xffff_ffff), Ok(()));
        assert_eq!(ops.read(&hart, 0x7ec, 0), Ok(0));
    }

    #[test]
    fn table_shares_one_handler() {
        let stub: Rc<dyn CsrOps> = Rc::new(UnimplementedCsr::new("shared"));
        let mut table = CsrTable::new();
        for info in &BUMBLEBEE_CUSTOM_CSRS {
            assert!(table.set_csr_ops(info.number, Rc::clone(&stub)).is_none());
        }
        assert_eq!(table.len(), 17);
        assert!(table.contains(0x812));
        assert!(!table.contains(0x300));
        assert!(table.numbers().all(|csrno| Rc::ptr_eq(table.get(csrno).unwrap(), &stub)));
        // One reference held here plus one per entry
        assert_eq!(Rc::strong_count(&stub), 18);
    }
}
