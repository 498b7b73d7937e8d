//! Per-vCPU fault object: a lazy snapshot of guest state around one exit.
//!
//! A fault is created from the kernel's fault IPC and lives until it is
//! replied to. Register state is fetched from the TCB only when first
//! read and written back only when modified; the `stage` field drives
//! multi-word accesses (aarch32 LDRD/STRD), which execute as two logical
//! word accesses sharing one reply capability.
//!
//! State machine: `stage` is 0 when no fault is outstanding, 1 for a
//! plain access, 2 for the first half of a doubleword access.
//! Transitions happen only in [`Fault::advance`].

use crate::arch::Cached;
use crate::kernel::{arm_mr, Cap, KernelOps, Mrs, TcbRegs};
use crate::memory::MemoryManager;
use crate::vm::{Result, VmError};

use super::decode;
use super::reg;

/// HSR exception-class field.
pub const HSR_EC_SHIFT: u32 = 26;
pub const HSR_EC_WFX: u32 = 0x01;
pub const HSR_EC_SMC64: u32 = 0x17;
pub const HSR_EC_SYSREG64: u32 = 0x18;
pub const HSR_EC_SWBRK64: u32 = 0x3c;

const HSR_INST32: u64 = 1 << 25;
const HSR_SYNDROME_VALID: u64 = 1 << 24;
const HSR_WNR: u64 = 1 << 6;

/// CPSR/SPSR bits.
const SPSR_THUMB: u64 = 1 << 5;
/// M[4]: set when the faulting EL was AArch32.
const SPSR_AARCH32: u64 = 1 << 4;
const SPSR_MODE_MASK: u64 = 0x1f;

pub fn hsr_exception_class(hsr: u64) -> u32 {
    (hsr >> HSR_EC_SHIFT) as u32 & 0x3f
}

/// Access width of a data abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultWidth {
    Byte,
    HalfWord,
    Word,
    DoubleWord,
}

impl FaultWidth {
    pub fn size(&self) -> usize {
        match self {
            FaultWidth::Byte => 1,
            FaultWidth::HalfWord => 2,
            FaultWidth::Word => 4,
            FaultWidth::DoubleWord => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// No fault outstanding.
    None,
    Data,
    Prefetch,
    /// Trapped privileged operation (HSR in `fsr`).
    Vcpu,
}

/// Everything a fault operation may need from the surrounding VM.
pub(crate) struct FaultEnv<'a> {
    pub kernel: &'a dyn KernelOps,
    pub mem: &'a MemoryManager,
    pub tcb: Cap,
    pub vcpu: Cap,
}

pub struct Fault {
    kind: FaultKind,
    /// Reply capability saved from the fault IPC.
    reply: Option<Cap>,
    ip: u64,
    base_addr: u64,
    addr: u64,
    fsr: u64,
    stage: u8,
    regs: Cached<TcbRegs>,
    data: Option<u64>,
    width: Option<FaultWidth>,
    instruction: Option<u32>,
    /// Destination/source register recovered by the fallback decoder.
    decoded_rt: Option<u8>,
    /// Platform errata mode: override the syndrome register index for
    /// thumb-mode stores.
    errata766422: bool,
}

impl Fault {
    pub fn new() -> Fault {
        Fault {
            kind: FaultKind::None,
            reply: None,
            ip: 0,
            base_addr: 0,
            addr: 0,
            fsr: 0,
            stage: 0,
            regs: Cached::Unknown,
            data: None,
            width: None,
            instruction: None,
            decoded_rt: None,
            errata766422: false,
        }
    }

    /// Enable the store-syndrome errata override (Exynos-class cores).
    pub fn set_errata766422(&mut self, enabled: bool) {
        self.errata766422 = enabled;
    }

    /// Populate from a stage-2 abort message and save the reply cap.
    pub fn load_memory_fault(&mut self, kernel: &dyn KernelOps, mrs: &Mrs) -> Result<()> {
        debug_assert!(self.is_handled(), "previous fault was never resolved");
        let is_prefetch = mrs.get(arm_mr::VMF_PREFETCH) != 0;
        self.kind = if is_prefetch {
            FaultKind::Prefetch
        } else {
            FaultKind::Data
        };
        self.ip = mrs.get(arm_mr::VMF_IP);
        self.base_addr = mrs.get(arm_mr::VMF_ADDR);
        self.addr = self.base_addr;
        self.fsr = mrs.get(arm_mr::VMF_FSR);
        self.stage = 1;
        self.regs = Cached::Unknown;
        self.data = None;
        self.width = None;
        self.instruction = None;
        self.decoded_rt = None;
        self.reply = Some(kernel.save_reply()?);
        Ok(())
    }

    /// Populate from a trapped privileged operation (HSR in MR0).
    pub fn load_vcpu_fault(&mut self, kernel: &dyn KernelOps, hsr: u64) -> Result<()> {
        debug_assert!(self.is_handled(), "previous fault was never resolved");
        self.kind = FaultKind::Vcpu;
        self.fsr = hsr;
        self.ip = 0;
        self.base_addr = 0;
        self.addr = 0;
        self.stage = 1;
        self.regs = Cached::Unknown;
        self.data = None;
        self.width = None;
        self.instruction = None;
        self.decoded_rt = None;
        self.reply = Some(kernel.save_reply()?);
        Ok(())
    }

    pub fn is_handled(&self) -> bool {
        self.stage == 0
    }

    pub fn kind(&self) -> FaultKind {
        self.kind
    }

    pub fn is_data(&self) -> bool {
        self.kind == FaultKind::Data
    }

    pub fn is_prefetch(&self) -> bool {
        self.kind == FaultKind::Prefetch
    }

    pub fn is_vcpu(&self) -> bool {
        self.kind == FaultKind::Vcpu
    }

    pub fn is_wfi(&self) -> bool {
        hsr_exception_class(self.fsr) == HSR_EC_WFX
    }

    pub fn is_write(&self) -> bool {
        self.fsr & HSR_WNR != 0
    }

    pub fn is_read(&self) -> bool {
        !self.is_write()
    }

    /// Faulting guest-physical address of the current stage.
    pub fn address(&self) -> u64 {
        self.addr
    }

    pub fn ip(&self) -> u64 {
        self.ip
    }

    pub fn fsr(&self) -> u64 {
        self.fsr
    }

    pub fn stage(&self) -> u8 {
        self.stage
    }

    pub(crate) fn is_thumb(&mut self, env: &FaultEnv) -> Result<bool> {
        Ok(self.ensure_ctx(env)?.spsr & SPSR_THUMB != 0)
    }

    fn is_aarch32(&mut self, env: &FaultEnv) -> Result<bool> {
        Ok(self.ensure_ctx(env)?.spsr & SPSR_AARCH32 != 0)
    }

    /// Fetch the register context from the kernel if not yet cached.
    pub(crate) fn ensure_ctx(&mut self, env: &FaultEnv) -> Result<TcbRegs> {
        match self.regs.get() {
            Some(regs) => Ok(regs),
            None => {
                let regs = env.kernel.tcb_read_regs(env.tcb)?;
                self.regs.read(regs);
                Ok(regs)
            }
        }
    }

    /// Replace the cached context; flushed to the kernel on resume.
    pub fn set_ctx(&mut self, regs: TcbRegs) {
        self.regs.modify(regs);
    }

    /// Write one numbered register in the cached context.
    pub(crate) fn set_ctx_reg(&mut self, env: &FaultEnv, rt: u8, value: u64) -> Result<()> {
        let mut regs = self.ensure_ctx(env)?;
        if (rt as usize) < regs.gpr.len() {
            regs.gpr[rt as usize] = value;
        }
        self.regs.modify(regs);
        Ok(())
    }

    /// Flush a modified register context back to the kernel.
    fn sync(&mut self, env: &FaultEnv) -> Result<()> {
        if let Cached::Modified(regs) = self.regs {
            env.kernel.tcb_write_regs(env.tcb, &regs)?;
            self.regs.flushed();
        }
        Ok(())
    }

    fn fetch_instruction(&mut self, env: &FaultEnv) -> Result<u32> {
        if let Some(inst) = self.instruction {
            return Ok(inst);
        }
        let mut bytes = [0u8; 4];
        env.mem
            .ram_read(env.kernel, self.ip, &mut bytes)
            .map_err(|_| VmError::InstructionDecode { pc: self.ip })?;
        let mut inst = u32::from_le_bytes(bytes);
        if self.is_thumb(env)? {
            if decode::thumb_is_32bit(inst) {
                self.fsr |= HSR_INST32;
            }
            if self.fsr & HSR_INST32 != 0 {
                // Swap half words for a 32 bit thumb instruction.
                inst = (inst & 0xffff) << 16 | (inst >> 16) & 0xffff;
            } else {
                inst &= 0xffff;
            }
        } else {
            // All A32/A64 instructions are 32 bit.
            self.fsr |= HSR_INST32;
        }
        self.instruction = Some(inst);
        Ok(inst)
    }

    /// Run the fallback decoder, filling width, register and stage.
    fn decode_instruction(&mut self, env: &FaultEnv) -> Result<()> {
        self.ensure_ctx(env)?;
        let thumb = self.is_thumb(env)?;
        let inst = self.fetch_instruction(env)?;
        let inst32 = self.fsr & HSR_INST32 != 0;
        let access = decode::decode_load_store(inst, thumb, inst32)
            .ok_or(VmError::InstructionDecode { pc: self.ip })?;
        self.width = Some(access.width);
        self.decoded_rt = Some(access.rt);
        if access.width == FaultWidth::DoubleWord && self.is_aarch32(env)? && self.stage == 1 {
            // LDRD/STRD: two word-sized stages share this fault.
            self.stage = 2;
            self.addr = self.base_addr;
        }
        Ok(())
    }

    /// Access width, from the syndrome when valid, otherwise decoded.
    pub(crate) fn width(&mut self, env: &FaultEnv) -> Result<FaultWidth> {
        if let Some(width) = self.width {
            return Ok(width);
        }
        if self.fsr & HSR_SYNDROME_VALID != 0 {
            let width = match (self.fsr >> 22) & 0x3 {
                0 => FaultWidth::Byte,
                1 => FaultWidth::HalfWord,
                2 => FaultWidth::Word,
                _ => FaultWidth::DoubleWord,
            };
            self.width = Some(width);
            if width == FaultWidth::DoubleWord && self.is_aarch32(env)? && self.stage == 1 {
                self.stage = 2;
            }
            Ok(width)
        } else {
            self.decode_instruction(env)?;
            self.width.ok_or(VmError::InstructionDecode { pc: self.ip })
        }
    }

    /// Byte length of the access as seen by the memory manager.
    pub(crate) fn access_size(&mut self, env: &FaultEnv) -> Result<usize> {
        Ok(self.width(env)?.size())
    }

    /// The register operand of the current stage.
    fn rt(&mut self, env: &FaultEnv) -> Result<u8> {
        let rt = if self.fsr & HSR_SYNDROME_VALID != 0 {
            if self.errata766422 && self.is_write() && self.is_thumb(env)? {
                let inst = self.fetch_instruction(env)?;
                decode::errata766422_rt(inst, self.fsr & HSR_INST32 != 0)
                    .ok_or(VmError::InstructionDecode { pc: self.ip })?
            } else {
                ((self.fsr >> 16) & 0x1f) as u8
            }
        } else {
            if self.decoded_rt.is_none() {
                self.decode_instruction(env)?;
            }
            self.decoded_rt
                .ok_or(VmError::InstructionDecode { pc: self.ip })?
        };
        // For a two-stage access the second stage targets the next
        // register in the pair.
        if self.width == Some(FaultWidth::DoubleWord) && self.stage > 0 && self.is_aarch32(env)? {
            Ok(rt + (2 - self.stage))
        } else {
            Ok(rt)
        }
    }

    /// Mask selecting the accessed bytes within the aligned word.
    pub(crate) fn data_mask(&mut self, env: &FaultEnv) -> Result<u64> {
        let mask: u64 = match self.width(env)? {
            FaultWidth::Byte => 0xff,
            FaultWidth::HalfWord => 0xffff,
            FaultWidth::Word => 0xffff_ffff,
            FaultWidth::DoubleWord => {
                if self.is_aarch32(env)? {
                    // Each stage moves one word.
                    0xffff_ffff
                } else {
                    return Ok(u64::MAX);
                }
            }
        };
        Ok(mask << ((self.addr & 0x3) * 8))
    }

    /// Data the guest is writing, or the data queued for a read reply.
    pub(crate) fn data(&mut self, env: &FaultEnv) -> Result<u64> {
        if let Some(data) = self.data {
            return Ok(data);
        }
        let rt = self.rt(env)?;
        let data = match banked_reg(self.ctx_mode(env)?, rt) {
            Some(field) => env.kernel.vcpu_read_reg(env.vcpu, field)?,
            None => self.read_gpr(env, rt)?,
        };
        self.data = Some(data);
        Ok(data)
    }

    /// Queue the data to hand back for a read fault.
    pub fn set_data(&mut self, data: u64) {
        self.data = Some(data);
    }

    fn ctx_mode(&mut self, env: &FaultEnv) -> Result<u8> {
        let regs = self.ensure_ctx(env)?;
        if regs.spsr & SPSR_AARCH32 != 0 {
            Ok((regs.spsr & SPSR_MODE_MASK) as u8)
        } else {
            // AArch64 has no banked general registers.
            Ok(0)
        }
    }

    fn read_gpr(&mut self, env: &FaultEnv, rt: u8) -> Result<u64> {
        let regs = self.ensure_ctx(env)?;
        // Register 31 reads as zero.
        Ok(regs.gpr.get(rt as usize).copied().unwrap_or(0))
    }

    /// Fold `value` and the fault data together the way the trapped
    /// instruction would: reads shift the device data down to the lsb of
    /// the destination register, writes shift the register data up to
    /// the accessed byte lane.
    pub(crate) fn emulate(&mut self, env: &FaultEnv, value: u64) -> Result<u64> {
        let shift = (self.addr & 0x3) * 8;
        let mask = self.data_mask(env)?;
        let data = self.data(env)?;
        if self.is_read() {
            Ok((value & !(mask >> shift)) | ((data & mask) >> shift))
        } else {
            Ok((value & !mask) | ((data << shift) & mask))
        }
    }

    /// Complete one stage of the fault. Read faults write the device
    /// data into the destination register. The guest resumes when the
    /// last stage completes.
    pub(crate) fn advance(&mut self, env: &FaultEnv) -> Result<()> {
        if self.is_data() && self.is_read() {
            let rt = self.rt(env)?;
            match banked_reg(self.ctx_mode(env)?, rt) {
                Some(field) => {
                    let old = env.kernel.vcpu_read_reg(env.vcpu, field)?;
                    let new = self.emulate(env, old)?;
                    env.kernel.vcpu_write_reg(env.vcpu, field, new)?;
                }
                None => {
                    let old = self.read_gpr(env, rt)?;
                    let new = self.emulate(env, old)?;
                    self.set_ctx_reg(env, rt, new)?;
                }
            }
        }
        debug_assert!(self.stage > 0);
        self.stage -= 1;
        if self.stage > 0 {
            // Second word of a doubleword access: new data, next address.
            self.data = None;
            self.addr = self.base_addr + 4;
            Ok(())
        } else {
            self.ignore_resume(env)
        }
    }

    /// Resume without touching guest registers (after a deferred map).
    pub(crate) fn restart(&mut self, env: &FaultEnv) -> Result<()> {
        self.sync(env)?;
        self.stage = 0;
        self.reply_and_clear(env)
    }

    /// Advance the PC past the faulting instruction and resume.
    pub(crate) fn ignore(&mut self, env: &FaultEnv) -> Result<()> {
        self.stage = 0;
        self.ignore_resume(env)
    }

    fn ignore_resume(&mut self, env: &FaultEnv) -> Result<()> {
        let step = if self.is_32bit_instruction(env)? { 4 } else { 2 };
        let mut regs = self.ensure_ctx(env)?;
        regs.pc += step;
        self.regs.modify(regs);
        self.sync(env)?;
        self.reply_and_clear(env)
    }

    /// Drop the fault without replying; the vCPU stays suspended.
    pub(crate) fn abandon(&mut self, env: &FaultEnv) {
        debug_assert!(
            !self.regs.is_modified(),
            "abandoning a fault with unflushed registers"
        );
        if let Some(reply) = self.reply.take() {
            let _ = env.kernel.delete_cap(reply);
        }
        self.invalidate();
    }

    fn reply_and_clear(&mut self, env: &FaultEnv) -> Result<()> {
        debug_assert!(!self.regs.is_modified(), "resume with unflushed registers");
        if let Some(reply) = self.reply.take() {
            env.kernel.send_reply(reply, &[])?;
        }
        self.stage = 0;
        self.invalidate();
        Ok(())
    }

    fn invalidate(&mut self) {
        self.kind = FaultKind::None;
        self.regs.invalidate();
        self.data = None;
        self.width = None;
        self.instruction = None;
        self.decoded_rt = None;
    }

    pub(crate) fn is_32bit_instruction(&mut self, env: &FaultEnv) -> Result<bool> {
        if self.is_vcpu() {
            return Ok(!self.is_thumb(env)?);
        }
        if self.fsr & HSR_SYNDROME_VALID == 0 {
            // Trigger a decode to settle the instruction-length bit.
            self.width(env)?;
        }
        Ok(self.fsr & HSR_INST32 != 0)
    }
}

impl Default for Fault {
    fn default() -> Self {
        Self::new()
    }
}

/// AArch32 banked register lookup: some registers are not in the TCB
/// context for privileged modes and must be accessed through the vCPU
/// object instead. Returns the vCPU register field, or `None` when the
/// plain context register applies.
fn banked_reg(mode: u8, rt: u8) -> Option<u32> {
    match (mode, rt) {
        (0x11, 8) => Some(reg::R8_FIQ),
        (0x11, 9) => Some(reg::R9_FIQ),
        (0x11, 10) => Some(reg::R10_FIQ),
        (0x11, 11) => Some(reg::R11_FIQ),
        (0x11, 12) => Some(reg::R12_FIQ),
        (0x11, 13) => Some(reg::SP_FIQ),
        (0x11, 14) => Some(reg::LR_FIQ),
        (0x12, 13) => Some(reg::SP_IRQ),
        (0x12, 14) => Some(reg::LR_IRQ),
        (0x13, 13) => Some(reg::SP_SVC),
        (0x13, 14) => Some(reg::LR_SVC),
        (0x17, 13) => Some(reg::SP_ABT),
        (0x17, 14) => Some(reg::LR_ABT),
        (0x1b, 13) => Some(reg::SP_UND),
        (0x1b, 14) => Some(reg::LR_UND),
        _ => None,
    }
}
