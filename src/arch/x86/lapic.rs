//! Virtual local APIC, one per vCPU.
//!
//! The register page lives behind a memory reservation at the APIC base
//! so every guest access traps. Interrupt acceptance runs through the
//! IRR/ISR bitmaps with the processor-priority rule: a vector delivers
//! only when its priority class exceeds PPR, and EOI retires the highest
//! in-service vector before re-checking the request register.
//!
//! The boot vCPU comes up in virtual-wire mode: LVT0 is programmed for
//! ExtINT so a PIC-style source can deliver through the LAPIC. INIT puts
//! a vCPU back into wait-for-SIPI; STARTUP runs the real-mode trampoline
//! emulator and starts the target.

use crate::memory::{FaultResult, PAGE_SIZE};
use crate::vm::{Result, Vm, VmError, BOOT_VCPU};

use super::interrupt;
use super::X86Vcpu;

/// Architectural APIC base.
pub const APIC_DEFAULT_PHYS_BASE: u64 = 0xfee0_0000;

pub const MSR_APICBASE_BSP: u64 = 1 << 8;
pub const MSR_APICBASE_ENABLE: u64 = 1 << 11;

/// Register offsets within the 4 KiB page.
pub mod regs {
    pub const ID: u32 = 0x20;
    pub const LVR: u32 = 0x30;
    pub const TASKPRI: u32 = 0x80;
    pub const ARBPRI: u32 = 0x90;
    pub const PROCPRI: u32 = 0xa0;
    pub const EOI: u32 = 0xb0;
    pub const LDR: u32 = 0xd0;
    pub const DFR: u32 = 0xe0;
    pub const SPIV: u32 = 0xf0;
    pub const ISR: u32 = 0x100;
    pub const TMR: u32 = 0x180;
    pub const IRR: u32 = 0x200;
    pub const ESR: u32 = 0x280;
    pub const ICR: u32 = 0x300;
    pub const ICR2: u32 = 0x310;
    pub const LVTT: u32 = 0x320;
    pub const LVTTHMR: u32 = 0x330;
    pub const LVTPC: u32 = 0x340;
    pub const LVT0: u32 = 0x350;
    pub const LVT1: u32 = 0x360;
    pub const LVTERR: u32 = 0x370;
    pub const TMICT: u32 = 0x380;
    pub const TMCCT: u32 = 0x390;
    pub const TDCR: u32 = 0x3e0;
}

/// Delivery modes (ICR bits 8-10).
pub mod dm {
    pub const FIXED: u32 = 0x000;
    pub const LOWEST: u32 = 0x100;
    pub const SMI: u32 = 0x200;
    pub const REMRD: u32 = 0x300;
    pub const NMI: u32 = 0x400;
    pub const INIT: u32 = 0x500;
    pub const STARTUP: u32 = 0x600;
    pub const EXTINT: u32 = 0x700;
}

const APIC_VECTOR_MASK: u32 = 0xff;
const APIC_MODE_MASK: u32 = 0x700;
const APIC_DEST_LOGICAL: u32 = 1 << 11;
const APIC_INT_ASSERT: u32 = 1 << 14;
const APIC_INT_LEVELTRIG: u32 = 1 << 15;
const APIC_SHORT_MASK: u32 = 0xc0000;
const APIC_SPIV_ENABLED: u32 = 1 << 8;
const APIC_LVT_MASKED: u32 = 1 << 16;
const APIC_LDR_MASK: u32 = 0xff << 24;
const APIC_DFR_FLAT: u32 = 0xf000_0000;
const APIC_DFR_CLUSTER: u32 = 0x0000_0000;

const APIC_LVT_NUM: usize = 6;
/// Version register: 0x14 with the LVT count in bits 16-23.
const APIC_VERSION: u32 = 0x14 | ((APIC_LVT_NUM as u32 - 1) << 16);

/// Shorthand field values.
const DEST_NOSHORT: u32 = 0x00000;
const DEST_SELF: u32 = 0x40000;
const DEST_ALLINC: u32 = 0x80000;
const DEST_ALLBUT: u32 = 0xc0000;

/// Per-LVT writable-bit masks, indexed from LVTT.
const LVT_MASK: u32 = APIC_LVT_MASKED | APIC_MODE_MASK | APIC_VECTOR_MASK;
const LINT_MASK: u32 =
    LVT_MASK | APIC_INT_LEVELTRIG | (1 << 13) | (1 << 12) | APIC_INT_ASSERT;
const APIC_LVT_MASKS: [u32; APIC_LVT_NUM] = [
    LVT_MASK | (1 << 17) | (1 << 18), // LVTT with timer mode
    LVT_MASK | (1 << 12),             // LVTTHMR
    LVT_MASK | (1 << 12),             // LVTPC
    LINT_MASK,                        // LVT0
    LINT_MASK,                        // LVT1
    LVT_MASK | (1 << 12),             // LVTERR
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LapicMpState {
    New,
    WaitSipi,
    Run,
}

/// What the LAPIC will deliver next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingInterrupt {
    /// Virtual-wire ExtINT from the PIC source.
    ExtInt,
    Vector(u8),
}

/// A decoded inter-processor interrupt.
#[derive(Debug, Clone, Copy)]
struct IcrMessage {
    vector: u8,
    delivery_mode: u32,
    logical_dest: bool,
    level: bool,
    trig_mode: bool,
    shorthand: u32,
    dest_id: u8,
}

pub struct Lapic {
    /// The 4 KiB register page, word-indexed.
    regs: Vec<u32>,
    pub apic_base: u64,
    irr_pending: bool,
    isr_count: u16,
    highest_isr_cache: Option<u8>,
    pub sipi_vector: u8,
    pub state: LapicMpState,
    arb_prio: u32,
}

impl Lapic {
    pub fn new() -> Lapic {
        Lapic {
            regs: vec![0; (PAGE_SIZE / 4) as usize],
            apic_base: APIC_DEFAULT_PHYS_BASE | MSR_APICBASE_ENABLE,
            irr_pending: false,
            isr_count: 0,
            highest_isr_cache: None,
            sipi_vector: 0,
            state: LapicMpState::New,
            arb_prio: 0,
        }
    }

    pub fn get_reg(&self, offset: u32) -> u32 {
        self.regs[(offset / 4) as usize]
    }

    pub fn set_reg(&mut self, offset: u32, value: u32) {
        self.regs[(offset / 4) as usize] = value;
    }

    pub fn id(&self) -> u8 {
        (self.get_reg(regs::ID) >> 24) as u8
    }

    fn set_id(&mut self, id: u8) {
        self.set_reg(regs::ID, (id as u32) << 24);
    }

    pub fn hw_enabled(&self) -> bool {
        self.apic_base & MSR_APICBASE_ENABLE != 0
    }

    pub fn sw_enabled(&self) -> bool {
        self.get_reg(regs::SPIV) & APIC_SPIV_ENABLED != 0
    }

    pub fn enabled(&self) -> bool {
        self.hw_enabled() && self.sw_enabled()
    }

    fn vector_bit(&self, bank: u32, vector: u8) -> bool {
        let reg = bank + (vector as u32 / 32) * 0x10;
        self.get_reg(reg) & (1 << (vector % 32)) != 0
    }

    fn set_vector_bit(&mut self, bank: u32, vector: u8, value: bool) {
        let reg = bank + (vector as u32 / 32) * 0x10;
        let word = self.get_reg(reg);
        if value {
            self.set_reg(reg, word | 1 << (vector % 32));
        } else {
            self.set_reg(reg, word & !(1 << (vector % 32)));
        }
    }

    fn find_highest_vector(&self, bank: u32) -> Option<u8> {
        for word_idx in (0..8).rev() {
            let word = self.get_reg(bank + word_idx * 0x10);
            if word != 0 {
                return Some((word_idx * 32 + (31 - word.leading_zeros())) as u8);
            }
        }
        None
    }

    pub fn find_highest_irr(&self) -> Option<u8> {
        if !self.irr_pending {
            return None;
        }
        self.find_highest_vector(regs::IRR)
    }

    pub fn set_irr(&mut self, vector: u8) {
        self.irr_pending = true;
        self.set_vector_bit(regs::IRR, vector, true);
    }

    fn clear_irr(&mut self, vector: u8) {
        self.set_vector_bit(regs::IRR, vector, false);
        self.irr_pending = self.find_highest_vector(regs::IRR).is_some();
    }

    fn set_isr(&mut self, vector: u8) {
        if self.vector_bit(regs::ISR, vector) {
            return;
        }
        self.set_vector_bit(regs::ISR, vector, true);
        self.isr_count += 1;
        // The latest vector set is also the highest in service.
        self.highest_isr_cache = Some(vector);
    }

    fn clear_isr(&mut self, vector: u8) {
        if !self.vector_bit(regs::ISR, vector) {
            return;
        }
        self.set_vector_bit(regs::ISR, vector, false);
        self.isr_count -= 1;
        self.highest_isr_cache = None;
    }

    fn find_highest_isr(&self) -> Option<u8> {
        if self.isr_count == 0 {
            return None;
        }
        if let Some(cached) = self.highest_isr_cache {
            return Some(cached);
        }
        self.find_highest_vector(regs::ISR)
    }

    /// Recompute PPR from TPR and the in-service vector. Returns true
    /// when the priority dropped, which may unmask pending interrupts.
    fn update_ppr(&mut self) -> bool {
        let old_ppr = self.get_reg(regs::PROCPRI);
        let tpr = self.get_reg(regs::TASKPRI);
        let isrv = self.find_highest_isr().unwrap_or(0) as u32;
        let ppr = if (tpr & 0xf0) >= (isrv & 0xf0) {
            tpr & 0xff
        } else {
            isrv & 0xf0
        };
        self.set_reg(regs::PROCPRI, ppr);
        ppr < old_ppr
    }

    /// Virtual-wire acceptance: LVT0 unmasked, ExtINT mode, software
    /// enabled.
    pub fn accepts_extint(&self) -> bool {
        let lvt0 = self.get_reg(regs::LVT0);
        lvt0 & APIC_LVT_MASKED == 0
            && lvt0 & APIC_MODE_MASK == dm::EXTINT
            && self.sw_enabled()
    }

    fn match_physical(&self, dest: u8) -> bool {
        dest == 0xff || self.id() == dest
    }

    fn match_logical(&self, mda: u8) -> bool {
        let logical_id = self.get_reg(regs::LDR) >> 24;
        match self.get_reg(regs::DFR) {
            APIC_DFR_FLAT => logical_id & mda as u32 != 0,
            APIC_DFR_CLUSTER => {
                (logical_id >> 4) == (mda as u32 >> 4) && logical_id & mda as u32 & 0xf != 0
            }
            dfr => {
                log::warn!("bad APIC DFR {dfr:#010x}");
                false
            }
        }
    }

    /// Reset to the architectural power-on state.
    pub fn reset(&mut self, vcpu_id: usize) {
        self.regs.iter_mut().for_each(|word| *word = 0);
        self.set_id(vcpu_id as u8);
        self.set_reg(regs::LVR, APIC_VERSION);
        for i in 0..APIC_LVT_NUM as u32 {
            self.set_reg(regs::LVTT + 0x10 * i, APIC_LVT_MASKED);
        }
        self.set_reg(regs::DFR, 0xffff_ffff);
        self.set_reg(regs::SPIV, 0xff);
        self.irr_pending = false;
        self.isr_count = 0;
        self.highest_isr_cache = None;
        self.update_ppr();
        self.arb_prio = 0;

        if vcpu_id == BOOT_VCPU {
            // Virtual wire mode: route the PIC line through LVT0.
            self.set_reg(regs::LVT0, dm::EXTINT);
            self.set_reg(regs::SPIV, APIC_SPIV_ENABLED);
        } else {
            self.set_reg(regs::SPIV, 0);
        }
    }

    fn reg_read(&self, offset: u32) -> u32 {
        match offset {
            regs::ARBPRI => {
                log::debug!("read of P6-only ARBPRI register");
                0
            }
            // Timer current count is unimplemented.
            regs::TMCCT => 0,
            _ => self.get_reg(offset),
        }
    }
}

impl Default for Lapic {
    fn default() -> Self {
        Self::new()
    }
}

fn lapic_of(vm: &Vm, vcpu: usize) -> Result<&Lapic> {
    let vc = vm.vcpu(vcpu)?;
    let x86 = vc.arch.as_x86().ok_or(VmError::WrongArch)?;
    Ok(&x86.lapic)
}

fn lapic_mut_of(vm: &mut Vm, vcpu: usize) -> Result<&mut Lapic> {
    let vc = vm.vcpu_mut(vcpu)?;
    let x86 = vc.arch.as_x86_mut().ok_or(VmError::WrongArch)?;
    Ok(&mut x86.lapic)
}

pub(crate) fn x86_vcpu_mut(vm: &mut Vm, vcpu: usize) -> Result<&mut X86Vcpu> {
    let vc = vm.vcpu_mut(vcpu)?;
    vc.arch.as_x86_mut().ok_or(VmError::WrongArch)
}

/// Reset a vCPU's LAPIC and record whether it starts hardware-enabled.
pub fn create_lapic(vm: &mut Vm, vcpu: usize, enabled: bool) -> Result<()> {
    let id = vcpu;
    let lapic = lapic_mut_of(vm, vcpu)?;
    lapic.apic_base = if enabled {
        APIC_DEFAULT_PHYS_BASE | MSR_APICBASE_ENABLE
    } else {
        APIC_DEFAULT_PHYS_BASE
    };
    lapic.reset(id);
    Ok(())
}

/// Trap the APIC register page; each faulting vCPU sees its own LAPIC.
pub fn install_apic_mmio(vm: &mut Vm) -> Result<()> {
    vm.reserve_memory_at(
        APIC_DEFAULT_PHYS_BASE,
        PAGE_SIZE,
        Box::new(|vm, vcpu, addr, len| match apic_page_fault(vm, vcpu, addr, len) {
            Ok(result) => result,
            Err(err) => {
                log::error!("apic register access failed: {err}");
                FaultResult::Error
            }
        }),
    )?;
    Ok(())
}

fn apic_page_fault(vm: &mut Vm, vcpu: usize, addr: u64, len: usize) -> Result<FaultResult> {
    let offset = (addr - APIC_DEFAULT_PHYS_BASE) as u32;
    if super::is_read_fault(vm, vcpu)? {
        let alignment = offset & 0xf;
        let value = if alignment as usize + len > 4 {
            log::debug!("apic read alignment error at {offset:#x} len {len}");
            0
        } else {
            lapic_of(vm, vcpu)?.reg_read(offset & !0xf) >> (alignment * 8)
        };
        super::set_fault_data(vm, vcpu, value as u64)?;
    } else {
        // Registers must be written as aligned words.
        if len == 4 && offset & 0xf == 0 {
            let data = super::get_fault_data(vm, vcpu)? as u32;
            apic_reg_write(vm, vcpu, offset & 0xff0, data)?;
        } else {
            log::debug!("apic write: bad size {len} at {offset:#x}");
        }
    }
    super::advance_fault(vm, vcpu)?;
    Ok(FaultResult::Handled)
}

fn apic_reg_write(vm: &mut Vm, vcpu: usize, reg: u32, val: u32) -> Result<()> {
    match reg {
        regs::ID => {
            let lapic = lapic_mut_of(vm, vcpu)?;
            lapic.set_id((val >> 24) as u8);
        }
        regs::TASKPRI => {
            let lapic = lapic_mut_of(vm, vcpu)?;
            lapic.set_reg(regs::TASKPRI, val & 0xff);
            if lapic.update_ppr() {
                interrupt::vcpu_accept_interrupt(vm, vcpu)?;
            }
        }
        regs::EOI => {
            set_eoi(vm, vcpu)?;
        }
        regs::LDR => {
            lapic_mut_of(vm, vcpu)?.set_reg(regs::LDR, val & APIC_LDR_MASK);
        }
        regs::DFR => {
            lapic_mut_of(vm, vcpu)?.set_reg(regs::DFR, val | 0x0fff_ffff);
        }
        regs::SPIV => {
            let lapic = lapic_mut_of(vm, vcpu)?;
            lapic.set_reg(regs::SPIV, val & 0x3ff);
            if val & APIC_SPIV_ENABLED == 0 {
                // Software disable masks every local vector.
                for i in 0..APIC_LVT_NUM as u32 {
                    let lvt = lapic.get_reg(regs::LVTT + 0x10 * i);
                    lapic.set_reg(regs::LVTT + 0x10 * i, lvt | APIC_LVT_MASKED);
                }
            }
        }
        regs::ICR => {
            // Delivery is immediate, so the pending bit never reads set.
            lapic_mut_of(vm, vcpu)?.set_reg(regs::ICR, val & !(1 << 12));
            send_ipi(vm, vcpu)?;
        }
        regs::ICR2 => {
            lapic_mut_of(vm, vcpu)?.set_reg(regs::ICR2, val & 0xff00_0000);
        }
        regs::LVTT | regs::LVTTHMR | regs::LVTPC | regs::LVT0 | regs::LVT1 | regs::LVTERR => {
            let lapic = lapic_mut_of(vm, vcpu)?;
            let mut val = val;
            if !lapic.sw_enabled() {
                val |= APIC_LVT_MASKED;
            }
            val &= APIC_LVT_MASKS[((reg - regs::LVTT) >> 4) as usize];
            lapic.set_reg(reg, val);
        }
        regs::TMICT | regs::TDCR => {
            lapic_mut_of(vm, vcpu)?.set_reg(reg, val);
        }
        regs::ESR => {
            lapic_mut_of(vm, vcpu)?.set_reg(regs::ESR, 0);
        }
        _ => {
            log::debug!("write to read-only or reserved APIC register {reg:#x}");
        }
    }
    Ok(())
}

/// EOI: retire the highest in-service vector and deliver whatever is now
/// unmasked.
pub fn set_eoi(vm: &mut Vm, vcpu: usize) -> Result<Option<u8>> {
    let vector = {
        let lapic = lapic_mut_of(vm, vcpu)?;
        // Not every EOI has a matching ISR entry (e.g. the timer check
        // during IOAPIC setup).
        let Some(vector) = lapic.find_highest_isr() else {
            return Ok(None);
        };
        lapic.clear_isr(vector);
        lapic.update_ppr();
        Some(vector)
    };
    interrupt::vcpu_accept_interrupt(vm, vcpu)?;
    Ok(vector)
}

/// Accept a fixed interrupt on a vCPU (the embedder-facing injection
/// path). Idempotent until serviced: the IRR bit coalesces repeats.
pub fn accept_irq(vm: &mut Vm, vcpu: usize, vector: u8) -> Result<()> {
    deliver(vm, vcpu, dm::FIXED, vector, true, false)
}

/// Core acceptance switch; returns whether the interrupt was taken.
fn deliver(
    vm: &mut Vm,
    vcpu: usize,
    delivery_mode: u32,
    vector: u8,
    level: bool,
    trig_mode: bool,
) -> Result<()> {
    match delivery_mode {
        dm::LOWEST | dm::FIXED => {
            let lapic = lapic_mut_of(vm, vcpu)?;
            if delivery_mode == dm::LOWEST {
                lapic.arb_prio += 1;
            }
            if !lapic.enabled() {
                return Ok(());
            }
            lapic.set_irr(vector);
            interrupt::vcpu_accept_interrupt(vm, vcpu)?;
        }
        dm::NMI | dm::REMRD => {
            interrupt::vcpu_accept_interrupt(vm, vcpu)?;
        }
        dm::SMI => {
            log::debug!("ignoring guest SMI");
        }
        dm::INIT => {
            if !trig_mode || level {
                let id = vcpu;
                let lapic = lapic_mut_of(vm, vcpu)?;
                if lapic.state == LapicMpState::Run {
                    // Running processors ignore INIT.
                    return Ok(());
                }
                lapic.reset(id);
                lapic.arb_prio = lapic.id() as u32;
                lapic.state = LapicMpState::WaitSipi;
            } else {
                log::debug!("ignoring de-assert INIT to vcpu {vcpu}");
            }
        }
        dm::STARTUP => {
            let lapic = lapic_mut_of(vm, vcpu)?;
            if lapic.state != LapicMpState::WaitSipi {
                log::debug!("SIPI outside wait-for-SIPI on vcpu {vcpu}");
            } else {
                lapic.sipi_vector = vector;
                lapic.state = LapicMpState::Run;
                interrupt::start_ap_vcpu(vm, vcpu, vector)?;
            }
        }
        dm::EXTINT => {
            return Err(VmError::GuestInvalidOperation(
                "ExtINT travels the virtual wire, not the ICR path",
            ));
        }
        other => {
            log::error!("unsupported lapic delivery mode {other:#x}");
        }
    }
    Ok(())
}

/// ICR write: decode and fan out to every matching vCPU.
fn send_ipi(vm: &mut Vm, src: usize) -> Result<()> {
    let (icr_low, icr_high) = {
        let lapic = lapic_of(vm, src)?;
        (lapic.get_reg(regs::ICR), lapic.get_reg(regs::ICR2))
    };
    let msg = IcrMessage {
        vector: (icr_low & APIC_VECTOR_MASK) as u8,
        delivery_mode: icr_low & APIC_MODE_MASK,
        logical_dest: icr_low & APIC_DEST_LOGICAL != 0,
        level: icr_low & APIC_INT_ASSERT != 0,
        trig_mode: icr_low & APIC_INT_LEVELTRIG != 0,
        shorthand: icr_low & APIC_SHORT_MASK,
        dest_id: (icr_high >> 24) as u8,
    };

    let mut lowest: Option<(usize, u32)> = None;
    let targets: Vec<usize> = (0..vm.num_vcpus())
        .filter(|&target| {
            let Ok(lapic) = lapic_of(vm, target) else {
                return false;
            };
            if !lapic.hw_enabled() {
                return false;
            }
            let matched = match msg.shorthand {
                DEST_SELF => target == src,
                DEST_ALLINC => true,
                DEST_ALLBUT => target != src,
                DEST_NOSHORT => {
                    if msg.logical_dest {
                        lapic.match_logical(msg.dest_id)
                    } else {
                        lapic.match_physical(msg.dest_id)
                    }
                }
                _ => false,
            };
            if matched && msg.delivery_mode == dm::LOWEST {
                let prio = lapic.arb_prio;
                if lowest.map(|(_, best)| prio < best).unwrap_or(true) {
                    lowest = Some((target, prio));
                }
                return false;
            }
            matched
        })
        .collect();

    if msg.delivery_mode == dm::LOWEST {
        if let Some((target, _)) = lowest {
            deliver(vm, target, msg.delivery_mode, msg.vector, msg.level, msg.trig_mode)?;
        }
        return Ok(());
    }
    for target in targets {
        deliver(vm, target, msg.delivery_mode, msg.vector, msg.level, msg.trig_mode)?;
    }
    Ok(())
}

/// Which interrupt the LAPIC would hand over next, honoring PPR and the
/// ExtINT virtual wire.
pub fn has_interrupt(vm: &mut Vm, vcpu: usize) -> Result<Option<PendingInterrupt>> {
    let accepts_extint = lapic_of(vm, vcpu)?.accepts_extint();
    if accepts_extint {
        let x86 = vm.arch.as_x86_mut().ok_or(VmError::WrongArch)?;
        if let Some(pic) = x86.pic.as_mut() {
            if pic.has_interrupt().is_some() {
                return Ok(Some(PendingInterrupt::ExtInt));
            }
        }
    }
    let lapic = lapic_of(vm, vcpu)?;
    match lapic.find_highest_irr() {
        Some(vector) if (vector & 0xf0) as u32 > lapic.get_reg(regs::PROCPRI) => {
            Ok(Some(PendingInterrupt::Vector(vector)))
        }
        _ => Ok(None),
    }
}

/// Service the next interrupt: move it from IRR to ISR (or consume the
/// PIC's ExtINT) and return the vector to inject.
pub fn get_interrupt(vm: &mut Vm, vcpu: usize) -> Result<Option<u8>> {
    match has_interrupt(vm, vcpu)? {
        None => Ok(None),
        Some(PendingInterrupt::ExtInt) => {
            let x86 = vm.arch.as_x86_mut().ok_or(VmError::WrongArch)?;
            match x86.pic.as_mut() {
                Some(pic) => Ok(pic.get_interrupt()),
                None => Ok(None),
            }
        }
        Some(PendingInterrupt::Vector(vector)) => {
            let lapic = lapic_mut_of(vm, vcpu)?;
            lapic.set_isr(vector);
            lapic.update_ppr();
            lapic.clear_irr(vector);
            Ok(Some(vector))
        }
    }
}

/// IA32_APICBASE reads: the stored base with the BSP flag reflecting the
/// vCPU's role.
pub fn get_base_msr(vm: &Vm, vcpu: usize) -> Result<u64> {
    let base = lapic_of(vm, vcpu)?.apic_base;
    Ok(if vcpu == BOOT_VCPU {
        base | MSR_APICBASE_BSP
    } else {
        base & !MSR_APICBASE_BSP
    })
}

pub fn set_base_msr(vm: &mut Vm, vcpu: usize, value: u64) -> Result<()> {
    if value & MSR_APICBASE_ENABLE == 0 {
        log::warn!("guest disabled the local apic on vcpu {vcpu} via IA32_APICBASE");
    }
    lapic_mut_of(vm, vcpu)?.apic_base = value;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        let mut lapic = Lapic::new();
        lapic.reset(0);
        lapic.set_irr(0x31);
        lapic.set_irr(0x55);
        // Highest vector first.
        assert_eq!(lapic.find_highest_irr(), Some(0x55));
        lapic.set_isr(0x55);
        lapic.update_ppr();
        lapic.clear_irr(0x55);
        // With 0x55 in service, PPR masks the 0x3x class.
        assert_eq!(lapic.get_reg(regs::PROCPRI), 0x50);
        assert_eq!(lapic.find_highest_irr(), Some(0x31));
        // EOI drops PPR, the lower vector is deliverable again.
        lapic.clear_isr(0x55);
        assert!(lapic.update_ppr() || lapic.get_reg(regs::PROCPRI) == 0);
    }

    #[test]
    fn test_irr_is_idempotent() {
        let mut lapic = Lapic::new();
        lapic.reset(0);
        lapic.set_irr(0x40);
        lapic.set_irr(0x40);
        assert_eq!(lapic.find_highest_irr(), Some(0x40));
        lapic.clear_irr(0x40);
        assert_eq!(lapic.find_highest_irr(), None);
    }

    #[test]
    fn test_bsp_resets_to_virtual_wire() {
        let mut lapic = Lapic::new();
        lapic.reset(0);
        assert!(lapic.accepts_extint());
        let mut ap = Lapic::new();
        ap.reset(1);
        assert!(!ap.accepts_extint());
        assert!(!ap.sw_enabled());
    }

    #[test]
    fn test_sw_disable_masks_lvts() {
        let mut lapic = Lapic::new();
        lapic.reset(0);
        assert_eq!(lapic.get_reg(regs::LVT0) & APIC_LVT_MASKED, 0);
    }
}
