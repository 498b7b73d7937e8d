//! Virtual GICv2 distributor.
//!
//! The distributor register file is fully virtual: a 4 KiB reservation
//! at the platform distributor address traps every access into offset-
//! ranged read/write handlers. The vCPU interface page, by contrast, is
//! mapped 1:1 from the platform's GIC virtual-cpu-interface frame with
//! full rights, so EOI writes never trap.
//!
//! Interrupt flow: [`inject_irq`] sets the distributor pending bit
//! (idempotently) and loads a free kernel list register, falling back to
//! a bounded per-vCPU overflow FIFO. A maintenance exit acknowledges the
//! serviced list register, clears pending, invokes the registered ack
//! and drains the overflow into the freed slot.

use std::collections::VecDeque;

use crate::kernel::{KernelOps, MapRights};
use crate::memory::{FaultResult, GuestFrame, PAGE_BITS, PAGE_SIZE};
use crate::vm::{Result, Vm, VmError, MAX_VCPUS};

use super::{advance_fault, emulate_fault, get_fault_data, get_fault_data_mask, with_fault};

/// Kernel list-register window per vCPU.
pub const NUM_LIST_REGS: usize = 4;

/// Bound on queued injections that did not fit the list registers.
pub const MAX_IRQ_QUEUE_LEN: usize = 64;

const NUM_SGI_PPI: u32 = 32;
const NUM_SPI_WORDS: usize = 31;

/// Distributor register offsets.
mod offsets {
    pub const GICD_CTLR: u64 = 0x000;
    pub const GICD_TYPER: u64 = 0x004;
    pub const GICD_IIDR: u64 = 0x008;
    pub const GICD_IGROUPR: u64 = 0x080;
    pub const GICD_ISENABLER: u64 = 0x100;
    pub const GICD_ICENABLER: u64 = 0x180;
    pub const GICD_ISPENDR: u64 = 0x200;
    pub const GICD_ICPENDR: u64 = 0x280;
    pub const GICD_ISACTIVER: u64 = 0x300;
    pub const GICD_ICACTIVER: u64 = 0x380;
    pub const GICD_IPRIORITYR: u64 = 0x400;
    pub const GICD_ITARGETSR: u64 = 0x800;
    pub const GICD_ICFGR: u64 = 0xc00;
    pub const GICD_SGIR: u64 = 0xf00;
    pub const GICD_CPENDSGIR: u64 = 0xf10;
    pub const GICD_SPENDSGIR: u64 = 0xf20;
    pub const GICD_IDREGS: u64 = 0xfc0;
}

/// SGIR fields.
const SGIR_TARGET_LIST_FILTER_SHIFT: u32 = 24;
const SGIR_TARGET_LIST_SHIFT: u32 = 16;
const SGIR_INTID_MASK: u32 = 0xf;

/// Platform addresses for the distributor and cpu-interface pages.
#[derive(Debug, Clone, Copy)]
pub struct VgicConfig {
    /// Guest-physical address of the (virtual) distributor.
    pub dist_paddr: u64,
    /// Guest-physical address the guest expects the cpu interface at.
    pub cpu_paddr: u64,
    /// Host-physical address of the hardware virtual-cpu-interface
    /// frame mapped through to the guest.
    pub vcpu_paddr: u64,
}

impl Default for VgicConfig {
    fn default() -> Self {
        // qemu-arm-virt layout.
        VgicConfig {
            dist_paddr: 0x0800_0000,
            cpu_paddr: 0x0801_0000,
            vcpu_paddr: 0x0804_0000,
        }
    }
}

/// One registered virtual interrupt: the ack runs when the guest EOIs.
pub(crate) struct VirqHandle {
    virq: u32,
    ack: IrqAckFn,
}

/// Ack callback: `(vcpu id, virq)`.
pub type IrqAckFn = Box<dyn FnMut(usize, u32) + Send>;

/// Fully virtual distributor register state.
struct DistRegs {
    enabled: bool,
    /// Per-vCPU banked state for SGIs and PPIs.
    group0: [u32; MAX_VCPUS],
    enabled0: [u32; MAX_VCPUS],
    pending0: [u32; MAX_VCPUS],
    active0: [u32; MAX_VCPUS],
    priority0: [[u32; 8]; MAX_VCPUS],
    targets0: [[u32; 8]; MAX_VCPUS],
    sgi_pending: [[u32; 4]; MAX_VCPUS],
    /// Shared SPI state.
    group: [u32; NUM_SPI_WORDS],
    enabled_spi: [u32; NUM_SPI_WORDS],
    pending_spi: [u32; NUM_SPI_WORDS],
    active_spi: [u32; NUM_SPI_WORDS],
    priority_spi: Vec<u32>,
    targets_spi: Vec<u32>,
    config: [u32; 64],
}

impl DistRegs {
    fn new() -> DistRegs {
        let mut dist = DistRegs {
            enabled: false,
            group0: [0; MAX_VCPUS],
            enabled0: [0xffff; MAX_VCPUS],
            pending0: [0; MAX_VCPUS],
            active0: [0; MAX_VCPUS],
            priority0: [[0; 8]; MAX_VCPUS],
            targets0: [[0; 8]; MAX_VCPUS],
            sgi_pending: [[0; 4]; MAX_VCPUS],
            group: [0; NUM_SPI_WORDS],
            enabled_spi: [0; NUM_SPI_WORDS],
            pending_spi: [0; NUM_SPI_WORDS],
            active_spi: [0; NUM_SPI_WORDS],
            priority_spi: vec![0; 247],
            targets_spi: vec![0x0101_0101; 247],
            config: [0x5555_5555; 64],
        };
        // SGIs are edge-triggered by definition.
        dist.config[0] = 0xaaaa_aaaa;
        dist.config[1] = 0x5554_0000;
        // SGI/PPI target the owning cpu interface.
        for (cpu, targets) in dist.targets0.iter_mut().enumerate() {
            for word in targets.iter_mut() {
                let byte = 1u32 << cpu;
                *word = byte | byte << 8 | byte << 16 | byte << 24;
            }
        }
        dist
    }

    fn irq_word(&self, bank: Bank, vcpu: usize, word: usize) -> u32 {
        match bank {
            Bank::Enable => {
                if word == 0 {
                    self.enabled0[vcpu]
                } else {
                    self.enabled_spi[word - 1]
                }
            }
            Bank::Pending => {
                if word == 0 {
                    self.pending0[vcpu]
                } else {
                    self.pending_spi[word - 1]
                }
            }
            Bank::Active => {
                if word == 0 {
                    self.active0[vcpu]
                } else {
                    self.active_spi[word - 1]
                }
            }
        }
    }

    fn set_bit(&mut self, bank: Bank, vcpu: usize, irq: u32, value: bool) {
        let word = (irq / 32) as usize;
        let bit = 1u32 << (irq % 32);
        let slot = match bank {
            Bank::Enable => {
                if word == 0 {
                    &mut self.enabled0[vcpu]
                } else {
                    &mut self.enabled_spi[word - 1]
                }
            }
            Bank::Pending => {
                if word == 0 {
                    &mut self.pending0[vcpu]
                } else {
                    &mut self.pending_spi[word - 1]
                }
            }
            Bank::Active => {
                if word == 0 {
                    &mut self.active0[vcpu]
                } else {
                    &mut self.active_spi[word - 1]
                }
            }
        };
        if value {
            *slot |= bit;
        } else {
            *slot &= !bit;
        }
    }

    fn is_set(&self, bank: Bank, vcpu: usize, irq: u32) -> bool {
        self.irq_word(bank, vcpu, (irq / 32) as usize) & (1 << (irq % 32)) != 0
    }
}

#[derive(Clone, Copy)]
enum Bank {
    Enable,
    Pending,
    Active,
}

/// Per-vCPU injection state: the list-register shadow plus the overflow
/// FIFO, and the private SGI/PPI registry.
struct VcpuIrqState {
    lr: [Option<u32>; NUM_LIST_REGS],
    overflow: VecDeque<u32>,
    sgi_ppi: Vec<Option<VirqHandle>>,
}

impl VcpuIrqState {
    fn new() -> VcpuIrqState {
        VcpuIrqState {
            lr: [None; NUM_LIST_REGS],
            overflow: VecDeque::new(),
            sgi_ppi: (0..NUM_SGI_PPI).map(|_| None).collect(),
        }
    }

    fn free_lr(&self) -> Option<usize> {
        self.lr.iter().position(Option::is_none)
    }
}

/// The VM-owned virtual GIC.
pub struct Vgic {
    config: VgicConfig,
    dist: DistRegs,
    vcpus: Vec<VcpuIrqState>,
    /// Shared peripheral interrupt registry.
    spis: Vec<VirqHandle>,
}

impl Vgic {
    fn new(config: VgicConfig) -> Vgic {
        Vgic {
            config,
            dist: DistRegs::new(),
            vcpus: (0..MAX_VCPUS).map(|_| VcpuIrqState::new()).collect(),
            spis: Vec::new(),
        }
    }

    fn handle_exists(&self, vcpu: usize, virq: u32) -> bool {
        if virq < NUM_SGI_PPI {
            self.vcpus[vcpu].sgi_ppi[virq as usize].is_some()
        } else {
            self.spis.iter().any(|h| h.virq == virq)
        }
    }

    fn ack(&mut self, vcpu: usize, virq: u32) {
        let handle = if virq < NUM_SGI_PPI {
            self.vcpus[vcpu].sgi_ppi[virq as usize].as_mut()
        } else {
            self.spis.iter_mut().find(|h| h.virq == virq)
        };
        if let Some(handle) = handle {
            (handle.ack)(vcpu, virq);
        }
    }

    /// Anything queued for the vCPU, loaded or waiting.
    pub(crate) fn has_irqs_in_flight(&self, vcpu: usize) -> bool {
        let state = &self.vcpus[vcpu];
        state.lr.iter().any(Option::is_some) || !state.overflow.is_empty()
    }

    /// Load `virq` into a free list register, or queue it.
    fn inject_or_queue(
        &mut self,
        kernel: &dyn KernelOps,
        vcpu: usize,
        vcpu_cap: crate::kernel::Cap,
        virq: u32,
    ) -> Result<()> {
        let state = &mut self.vcpus[vcpu];
        if let Some(slot) = state.free_lr() {
            match kernel.vcpu_inject_irq(vcpu_cap, virq, 0, 0, slot as u8) {
                Ok(()) => {
                    state.lr[slot] = Some(virq);
                    return Ok(());
                }
                Err(err) => {
                    log::debug!("list-register inject of virq {virq} refused: {err}");
                }
            }
        }
        if state.overflow.len() >= MAX_IRQ_QUEUE_LEN {
            return Err(VmError::ResourceExhausted("irq overflow queue"));
        }
        state.overflow.push_back(virq);
        Ok(())
    }

    /// Move queued interrupts into freed list registers.
    fn drain_overflow(
        &mut self,
        kernel: &dyn KernelOps,
        vcpu: usize,
        vcpu_cap: crate::kernel::Cap,
    ) {
        loop {
            let state = &mut self.vcpus[vcpu];
            let Some(slot) = state.free_lr() else { break };
            let Some(virq) = state.overflow.pop_front() else {
                break;
            };
            match kernel.vcpu_inject_irq(vcpu_cap, virq, 0, 0, slot as u8) {
                Ok(()) => state.lr[slot] = Some(virq),
                Err(err) => {
                    log::debug!("overflow drain of virq {virq} refused: {err}");
                    state.overflow.push_front(virq);
                    break;
                }
            }
        }
    }
}

fn vgic_ref(vm: &Vm) -> Result<&Vgic> {
    vm.arch
        .as_arm()
        .ok_or(VmError::WrongArch)?
        .vgic
        .as_ref()
        .ok_or(VmError::GuestInvalidOperation("vgic not installed"))
}

fn vgic_mut(vm: &mut Vm) -> Result<&mut Vgic> {
    vm.arch
        .as_arm_mut()
        .ok_or(VmError::WrongArch)?
        .vgic
        .as_mut()
        .ok_or(VmError::GuestInvalidOperation("vgic not installed"))
}

/// Install the virtual GIC: the trapped distributor page and the 1:1
/// cpu-interface mapping.
pub fn install_vgic(vm: &mut Vm, config: VgicConfig) -> Result<()> {
    let arm = vm.arch.as_arm_mut().ok_or(VmError::WrongArch)?;
    arm.vgic = Some(Vgic::new(config));

    vm.reserve_memory_at(
        config.dist_paddr,
        PAGE_SIZE,
        Box::new(|vm, vcpu, addr, len| match handle_dist_fault(vm, vcpu, addr, len) {
            Ok(result) => result,
            Err(err) => {
                log::error!("vgic distributor fault failed: {err}");
                FaultResult::Error
            }
        }),
    )?;

    // The cpu interface never traps; a fault here means the mapping is
    // broken.
    let res = vm.reserve_memory_at(
        config.cpu_paddr,
        PAGE_SIZE,
        Box::new(|_, _, addr, _| {
            log::error!("unexpected fault on vgic cpu interface at {addr:#x}");
            FaultResult::Error
        }),
    )?;
    let kernel = vm.kernel.clone();
    let cpu_paddr = config.cpu_paddr;
    let vcpu_paddr = config.vcpu_paddr;
    vm.map_reservation(
        res,
        Box::new(move |addr| {
            let frame = kernel.alloc_frame_at(vcpu_paddr, PAGE_BITS).ok()?;
            let offset = addr - cpu_paddr;
            Some(GuestFrame {
                frame,
                rights: MapRights::READ_WRITE,
                gpa: cpu_paddr + offset,
            })
        }),
    )?;
    Ok(())
}

/// Register an ack callback for a virtual interrupt. Ids below 32 are
/// per-vCPU (SGI/PPI); the rest live in the VM-global SPI table.
pub fn register_irq(vm: &mut Vm, vcpu: usize, virq: u32, ack: IrqAckFn) -> Result<()> {
    if vcpu >= MAX_VCPUS {
        return Err(VmError::InvalidVcpu(vcpu));
    }
    let vgic = vgic_mut(vm)?;
    let handle = VirqHandle { virq, ack };
    if virq < NUM_SGI_PPI {
        let slot = &mut vgic.vcpus[vcpu].sgi_ppi[virq as usize];
        if slot.is_some() {
            return Err(VmError::GuestInvalidOperation("virq already registered"));
        }
        *slot = Some(handle);
    } else {
        if vgic.spis.iter().any(|h| h.virq == virq) {
            return Err(VmError::GuestInvalidOperation("virq already registered"));
        }
        vgic.spis.push(handle);
    }
    Ok(())
}

/// Inject a virtual interrupt into a vCPU.
///
/// Set-pending is idempotent: repeat injections before the guest
/// acknowledges collapse into one pending bit. A vCPU halted in WFx is
/// woken.
pub fn inject_irq(vm: &mut Vm, vcpu: usize, virq: u32) -> Result<()> {
    let vcpu_cap = vm.vcpu(vcpu)?.kobj;
    {
        let kernel = vm.kernel.clone();
        let vgic = vgic_mut(vm)?;

        if !vgic.handle_exists(vcpu, virq) {
            return Err(VmError::GuestInvalidOperation("virq not registered"));
        }

        if !vgic.dist.is_set(Bank::Pending, vcpu, virq) {
            vgic.dist.set_bit(Bank::Pending, vcpu, virq, true);
            if vgic.dist.enabled && vgic.dist.is_set(Bank::Enable, vcpu, virq) {
                vgic.inject_or_queue(kernel.as_ref(), vcpu, vcpu_cap, virq)?;
            } else {
                // Delivered once the guest enables the line.
                let state = &mut vgic.vcpus[vcpu];
                if state.overflow.len() >= MAX_IRQ_QUEUE_LEN {
                    return Err(VmError::ResourceExhausted("irq overflow queue"));
                }
                state.overflow.push_back(virq);
            }
        }
    }

    // Wake a vCPU sleeping in WFI.
    let halted = {
        let vc = vm.vcpu(vcpu)?;
        let arm_vcpu = vc.arch.as_arm().ok_or(VmError::WrongArch)?;
        !arm_vcpu.fault.is_handled() && arm_vcpu.fault.is_wfi()
    };
    if halted {
        with_fault(vm, vcpu, |fault, env| fault.ignore(env))?;
    }
    Ok(())
}

/// Service a maintenance exit for list register `idx`: clear pending,
/// run the registered ack, then refill from the overflow queue.
pub fn handle_maintenance(vm: &mut Vm, vcpu: usize, idx: usize) -> Result<()> {
    let vcpu_cap = vm.vcpu(vcpu)?.kobj;
    let kernel = vm.kernel.clone();
    let vgic = vgic_mut(vm)?;

    if idx >= NUM_LIST_REGS {
        return Err(VmError::GuestInvalidOperation("bad maintenance index"));
    }
    let Some(virq) = vgic.vcpus[vcpu].lr[idx].take() else {
        return Err(VmError::GuestInvalidOperation("spurious maintenance"));
    };
    vgic.dist.set_bit(Bank::Pending, vcpu, virq, false);
    vgic.ack(vcpu, virq);
    vgic.drain_overflow(kernel.as_ref(), vcpu, vcpu_cap);
    Ok(())
}

/// Distributor fault entry point: decode the offset and direction, then
/// emulate the register access against the virtual state.
pub(crate) fn handle_dist_fault(
    vm: &mut Vm,
    vcpu: usize,
    addr: u64,
    _len: usize,
) -> Result<FaultResult> {
    let dist_paddr = {
        let vgic = vgic_ref(vm)?;
        vgic.config.dist_paddr
    };
    let offset = addr - dist_paddr;
    if super::is_read_fault(vm, vcpu)? {
        handle_dist_read(vm, vcpu, offset)
    } else {
        handle_dist_write(vm, vcpu, offset)
    }
}

fn dist_read_word(vgic: &Vgic, vcpu: usize, offset: u64) -> u32 {
    use offsets::*;
    let dist = &vgic.dist;
    let word = |base: u64| ((offset - base) / 4) as usize;
    match offset {
        GICD_CTLR => dist.enabled as u32,
        GICD_TYPER => 0x0000_fce7,
        GICD_IIDR => 0x0200_043b,
        o if (GICD_IGROUPR..GICD_ISENABLER).contains(&o) => {
            let w = word(GICD_IGROUPR);
            if w == 0 {
                dist.group0[vcpu]
            } else {
                dist.group.get(w - 1).copied().unwrap_or(0)
            }
        }
        o if (GICD_ISENABLER..GICD_ICENABLER).contains(&o) => {
            dist.irq_word(Bank::Enable, vcpu, word(GICD_ISENABLER))
        }
        o if (GICD_ICENABLER..GICD_ISPENDR).contains(&o) => {
            dist.irq_word(Bank::Enable, vcpu, word(GICD_ICENABLER))
        }
        o if (GICD_ISPENDR..GICD_ICPENDR).contains(&o) => {
            dist.irq_word(Bank::Pending, vcpu, word(GICD_ISPENDR))
        }
        o if (GICD_ICPENDR..GICD_ISACTIVER).contains(&o) => {
            dist.irq_word(Bank::Pending, vcpu, word(GICD_ICPENDR))
        }
        o if (GICD_ISACTIVER..GICD_ICACTIVER).contains(&o) => {
            dist.irq_word(Bank::Active, vcpu, word(GICD_ISACTIVER))
        }
        o if (GICD_ICACTIVER..GICD_IPRIORITYR).contains(&o) => {
            dist.irq_word(Bank::Active, vcpu, word(GICD_ICACTIVER))
        }
        o if (GICD_IPRIORITYR..GICD_IPRIORITYR + 0x400).contains(&o) => {
            let w = word(GICD_IPRIORITYR);
            if w < 8 {
                dist.priority0[vcpu][w]
            } else {
                dist.priority_spi.get(w - 8).copied().unwrap_or(0)
            }
        }
        o if (GICD_ITARGETSR..GICD_ITARGETSR + 0x400).contains(&o) => {
            let w = word(GICD_ITARGETSR);
            if w < 8 {
                dist.targets0[vcpu][w]
            } else {
                dist.targets_spi.get(w - 8).copied().unwrap_or(0)
            }
        }
        o if (GICD_ICFGR..GICD_ICFGR + 0x100).contains(&o) => {
            dist.config[word(GICD_ICFGR)]
        }
        GICD_SGIR => 0,
        o if (GICD_CPENDSGIR..GICD_SPENDSGIR).contains(&o) => {
            dist.sgi_pending[vcpu][word(GICD_CPENDSGIR)]
        }
        o if (GICD_SPENDSGIR..GICD_SPENDSGIR + 0x10).contains(&o) => {
            dist.sgi_pending[vcpu][word(GICD_SPENDSGIR)]
        }
        o if (GICD_IDREGS..0x1000).contains(&o) => {
            // Peripheral/component identification.
            const ID: [u32; 16] = [
                0, 0, 0, 0, 0x04, 0, 0, 0, 0x90, 0xb4, 0x2b, 0, 0x0d, 0xf0, 0x05, 0xb1,
            ];
            ID[word(GICD_IDREGS)]
        }
        _ => {
            // Reserved and implementation-defined ranges read as zero.
            0
        }
    }
}

fn handle_dist_read(vm: &mut Vm, vcpu: usize, offset: u64) -> Result<FaultResult> {
    let reg = {
        let vgic = vgic_ref(vm)?;
        dist_read_word(vgic, vcpu, offset & !0x3)
    };
    let mask = get_fault_data_mask(vm, vcpu)?;
    super::set_fault_data(vm, vcpu, (reg as u64) & mask)?;
    advance_fault(vm, vcpu)?;
    Ok(FaultResult::Handled)
}

fn handle_dist_write(vm: &mut Vm, vcpu: usize, offset: u64) -> Result<FaultResult> {
    use offsets::*;
    let offset_word = offset & !0x3;
    let mask = get_fault_data_mask(vm, vcpu)?;
    let data = (get_fault_data(vm, vcpu)? & mask) as u32;

    match offset_word {
        GICD_CTLR => {
            let enable = data & 1 != 0;
            set_dist_enabled(vm, vcpu, enable)?;
        }
        o if (GICD_ISENABLER..GICD_ICENABLER).contains(&o) => {
            for_each_set_bit(vm, vcpu, o - GICD_ISENABLER, data, enable_irq)?;
        }
        o if (GICD_ICENABLER..GICD_ISPENDR).contains(&o) => {
            for_each_set_bit(vm, vcpu, o - GICD_ICENABLER, data, disable_irq)?;
        }
        o if (GICD_ISPENDR..GICD_ICPENDR).contains(&o) => {
            for_each_set_bit(vm, vcpu, o - GICD_ISPENDR, data, set_pending_from_guest)?;
        }
        o if (GICD_ICPENDR..GICD_ISACTIVER).contains(&o) => {
            for_each_set_bit(vm, vcpu, o - GICD_ICPENDR, data, clear_pending)?;
        }
        o if (GICD_IGROUPR..GICD_ISENABLER).contains(&o) => {
            let value = {
                let vgic = vgic_ref(vm)?;
                let w = ((o - GICD_IGROUPR) / 4) as usize;
                if w == 0 {
                    vgic.dist.group0[vcpu]
                } else {
                    vgic.dist.group.get(w - 1).copied().unwrap_or(0)
                }
            };
            let new = emulate_fault(vm, vcpu, value as u64)? as u32;
            let vgic = vgic_mut(vm)?;
            let w = ((o - GICD_IGROUPR) / 4) as usize;
            if w == 0 {
                vgic.dist.group0[vcpu] = new;
            } else if let Some(slot) = vgic.dist.group.get_mut(w - 1) {
                *slot = new;
            }
        }
        o if (GICD_ISACTIVER..GICD_IPRIORITYR).contains(&o) => {
            // Active bits are software-visible state only.
            let w = ((o & 0x7f) / 4) as usize;
            let new = {
                let vgic = vgic_ref(vm)?;
                vgic.dist.irq_word(Bank::Active, vcpu, w)
            };
            let new = emulate_fault(vm, vcpu, new as u64)? as u32;
            let vgic = vgic_mut(vm)?;
            if w == 0 {
                vgic.dist.active0[vcpu] = new;
            } else if let Some(slot) = vgic.dist.active_spi.get_mut(w - 1) {
                *slot = new;
            }
        }
        o if (GICD_IPRIORITYR..GICD_IPRIORITYR + 0x400).contains(&o) => {
            let w = ((o - GICD_IPRIORITYR) / 4) as usize;
            let vgic = vgic_mut(vm)?;
            if w < 8 {
                vgic.dist.priority0[vcpu][w] = data;
            } else if let Some(slot) = vgic.dist.priority_spi.get_mut(w - 8) {
                *slot = data;
            }
        }
        o if (GICD_ITARGETSR..GICD_ICFGR).contains(&o) => {
            let w = ((o - GICD_ITARGETSR) / 4) as usize;
            let vgic = vgic_mut(vm)?;
            if w >= 8 {
                if let Some(slot) = vgic.dist.targets_spi.get_mut(w - 8) {
                    *slot = data;
                }
            }
            // SGI/PPI targets are read-only.
        }
        o if (GICD_ICFGR..GICD_ICFGR + 0x100).contains(&o) => {
            // Trigger configuration is fixed.
        }
        GICD_SGIR => {
            handle_sgir(vm, vcpu, data)?;
        }
        o if (GICD_CPENDSGIR..GICD_SPENDSGIR + 0x10).contains(&o) => {
            log::warn!("GICD SGI pending registers not implemented (offset {o:#x})");
        }
        GICD_TYPER | GICD_IIDR => {}
        _ => {
            log::debug!("write to reserved GICD offset {offset_word:#x} ignored");
        }
    }
    with_fault(vm, vcpu, |fault, env| fault.ignore(env))?;
    Ok(FaultResult::Handled)
}

/// Apply `f` to every interrupt number whose bit is set in `data`, where
/// `byte_offset` locates the register within its bank.
fn for_each_set_bit(
    vm: &mut Vm,
    vcpu: usize,
    byte_offset: u64,
    data: u32,
    f: fn(&mut Vm, usize, u32) -> Result<()>,
) -> Result<()> {
    let mut bits = data;
    while bits != 0 {
        let bit = bits.trailing_zeros();
        bits &= !(1 << bit);
        let irq = bit + byte_offset as u32 * 8;
        f(vm, vcpu, irq)?;
    }
    Ok(())
}

fn set_dist_enabled(vm: &mut Vm, vcpu: usize, enable: bool) -> Result<()> {
    let vcpu_cap = vm.vcpu(vcpu)?.kobj;
    let kernel = vm.kernel.clone();
    let vgic = vgic_mut(vm)?;
    vgic.dist.enabled = enable;
    if enable {
        vgic.drain_overflow(kernel.as_ref(), vcpu, vcpu_cap);
    }
    Ok(())
}

fn enable_irq(vm: &mut Vm, vcpu: usize, irq: u32) -> Result<()> {
    let vcpu_cap = vm.vcpu(vcpu)?.kobj;
    let kernel = vm.kernel.clone();
    let vgic = vgic_mut(vm)?;
    vgic.dist.set_bit(Bank::Enable, vcpu, irq, true);
    if vgic.handle_exists(vcpu, irq) && !vgic.dist.is_set(Bank::Pending, vcpu, irq) {
        // Nothing outstanding: acknowledge so the source can fire again.
        vgic.ack(vcpu, irq);
    }
    vgic.drain_overflow(kernel.as_ref(), vcpu, vcpu_cap);
    Ok(())
}

fn disable_irq(vm: &mut Vm, vcpu: usize, irq: u32) -> Result<()> {
    let vgic = vgic_mut(vm)?;
    // SGIs cannot be disabled.
    if irq >= 16 {
        vgic.dist.set_bit(Bank::Enable, vcpu, irq, false);
    }
    Ok(())
}

fn set_pending_from_guest(vm: &mut Vm, vcpu: usize, irq: u32) -> Result<()> {
    if let Err(err) = inject_irq(vm, vcpu, irq) {
        log::debug!("guest ISPENDR write for irq {irq} not deliverable: {err}");
    }
    Ok(())
}

fn clear_pending(vm: &mut Vm, vcpu: usize, irq: u32) -> Result<()> {
    let vgic = vgic_mut(vm)?;
    vgic.dist.set_bit(Bank::Pending, vcpu, irq, false);
    Ok(())
}

/// SGIR write: decode the target-list filter and fan the software
/// interrupt out to the online target vCPUs.
fn handle_sgir(vm: &mut Vm, vcpu: usize, data: u32) -> Result<()> {
    let virq = data & SGIR_INTID_MASK;
    let filter = (data >> SGIR_TARGET_LIST_FILTER_SHIFT) & 0x3;
    let num_vcpus = vm.num_vcpus();
    let target_list: u16 = match filter {
        0 => ((data >> SGIR_TARGET_LIST_SHIFT) & 0xff) as u16,
        1 => {
            let all = (1u16 << num_vcpus) - 1;
            all & !(1 << vcpu)
        }
        2 => 1 << vcpu,
        _ => {
            log::error!("unknown SGIR target-list filter mode");
            return Ok(());
        }
    };
    for target in 0..num_vcpus {
        if target_list & (1 << target) == 0 || !vm.vcpu(target)?.is_online() {
            continue;
        }
        if let Err(err) = inject_irq(vm, target, virq) {
            log::debug!("SGI {virq} to vcpu {target} dropped: {err}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::mock::MockKernel;
    use crate::kernel::{arm_mr, ExitEvent, ExitLabel, KernelOps, Mrs, TcbRegs};
    use crate::vm::MIN_VCPU_BADGE;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn gic_vm() -> (Arc<MockKernel>, Vm, VgicConfig) {
        let mock = Arc::new(MockKernel::new());
        let kernel: Arc<dyn KernelOps> = mock.clone();
        let ep = kernel.create_endpoint().unwrap();
        let mut vm = Vm::new(kernel, 1, "gic-vm", ep, crate::arch::VmArch::new_arm()).unwrap();
        vm.create_vcpu(100).unwrap();
        vm.vcpu_start(0).unwrap();
        let config = VgicConfig::default();
        install_vgic(&mut vm, config).unwrap();
        (mock, vm, config)
    }

    fn register_counting_irq(vm: &mut Vm, virq: u32) -> Arc<AtomicUsize> {
        let acks = Arc::new(AtomicUsize::new(0));
        let acks_cb = acks.clone();
        register_irq(
            vm,
            0,
            virq,
            Box::new(move |_, _| {
                acks_cb.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
        acks
    }

    /// Run one 32-bit guest store to a distributor register through the
    /// full dispatch path.
    fn dist_write(mock: &MockKernel, vm: &mut Vm, offset: u64, value: u32) {
        let tcb = vm.vcpu(0).unwrap().tcb_handle();
        let mut regs = mock.tcb_regs_of(tcb);
        regs.gpr[2] = value as u64;
        mock.set_tcb_regs(tcb, regs);
        // Valid syndrome: 32-bit instruction, word store through x2.
        let fsr = (1u64 << 25) | (1 << 24) | (2 << 22) | (2 << 16) | (1 << 6);
        let mut mrs = [0u64; 4];
        mrs[arm_mr::VMF_IP] = 0x8_0000;
        mrs[arm_mr::VMF_ADDR] = VgicConfig::default().dist_paddr + offset;
        mrs[arm_mr::VMF_FSR] = fsr;
        mock.push_exit(ExitEvent {
            badge: MIN_VCPU_BADGE,
            label: ExitLabel::VmFault,
            mrs: Mrs::new(&mrs),
        });
        // The queue drains after the one store.
        assert!(vm.run().is_err());
    }

    #[test]
    fn test_isenabler_write_enables_and_injects() {
        let (mock, mut vm, _) = gic_vm();
        let acks = register_counting_irq(&mut vm, 0);

        // Guest enables the distributor, then SGI 0.
        dist_write(&mock, &mut vm, offsets::GICD_CTLR, 1);
        dist_write(&mock, &mut vm, offsets::GICD_ISENABLER, 1);

        // Enabling a non-pending line acknowledges the source.
        assert_eq!(acks.load(Ordering::SeqCst), 1);
        // Both stores replied to.
        assert_eq!(mock.replies().len(), 2);

        // Injection now goes straight to a list register.
        vm.inject_irq(0, 0).unwrap();
        let injections = mock.injections();
        assert_eq!(injections.len(), 1);
        assert_eq!(injections[0].virq, 0);
        assert_eq!(injections[0].index, 0);
    }

    #[test]
    fn test_inject_is_idempotent_until_acked() {
        let (mock, mut vm, _) = gic_vm();
        let acks = register_counting_irq(&mut vm, 0);
        dist_write(&mock, &mut vm, offsets::GICD_CTLR, 1);
        dist_write(&mock, &mut vm, offsets::GICD_ISENABLER, 1);

        vm.inject_irq(0, 0).unwrap();
        vm.inject_irq(0, 0).unwrap();
        // Coalesced: one pending bit, one list-register load.
        assert_eq!(mock.injections().len(), 1);
        {
            let vgic = vm.arch.as_arm().unwrap().vgic.as_ref().unwrap();
            assert!(vgic.dist.is_set(Bank::Pending, 0, 0));
        }

        // The guest EOIs: maintenance clears pending and acks.
        handle_maintenance(&mut vm, 0, 0).unwrap();
        assert_eq!(acks.load(Ordering::SeqCst), 2);
        {
            let vgic = vm.arch.as_arm().unwrap().vgic.as_ref().unwrap();
            assert!(!vgic.dist.is_set(Bank::Pending, 0, 0));
        }

        // A later inject re-pends and reloads a list register.
        vm.inject_irq(0, 0).unwrap();
        assert_eq!(mock.injections().len(), 2);
    }

    #[test]
    fn test_overflow_queue_when_lrs_full(){
        let (mock, mut vm, _) = gic_vm();
        for virq in 0..8 {
            register_counting_irq(&mut vm, virq);
        }
        dist_write(&mock, &mut vm, offsets::GICD_CTLR, 1);
        dist_write(&mock, &mut vm, offsets::GICD_ISENABLER, 0xff);

        for virq in 0..8 {
            vm.inject_irq(0, virq).unwrap();
        }
        // Only the list-register window went to the kernel.
        assert_eq!(mock.injections().len(), NUM_LIST_REGS);
        {
            let vgic = vm.arch.as_arm().unwrap().vgic.as_ref().unwrap();
            assert_eq!(vgic.vcpus[0].overflow.len(), 8 - NUM_LIST_REGS);
        }

        // Servicing one frees a slot and drains the queue head.
        handle_maintenance(&mut vm, 0, 0).unwrap();
        assert_eq!(mock.injections().len(), NUM_LIST_REGS + 1);
    }

    #[test]
    fn test_sgir_fans_out_to_targets() {
        let (mock, mut vm, _) = gic_vm();
        // A second online vCPU to receive the software interrupt.
        vm.create_vcpu(100).unwrap();
        vm.assign_vcpu_target(1, 1).unwrap();
        vm.vcpu_start(1).unwrap();
        let vcpu1_cap = vm.vcpu(1).unwrap().kernel_handle();
        register_counting_irq(&mut vm, 2);
        register_irq(&mut vm, 1, 2, Box::new(|_, _| {})).unwrap();

        dist_write(&mock, &mut vm, offsets::GICD_CTLR, 1);
        // Enable SGI 2 on both vCPUs (banked registers, same write).
        dist_write(&mock, &mut vm, offsets::GICD_ISENABLER, 1 << 2);
        // The second vCPU enables its bank too.
        enable_irq(&mut vm, 1, 2).unwrap();

        // SGIR: target-list filter 0, target vCPU 1, intid 2.
        dist_write(&mock, &mut vm, offsets::GICD_SGIR, (1 << 17) | 2);

        let injected: Vec<_> = mock
            .injections()
            .into_iter()
            .filter(|i| i.vcpu == vcpu1_cap)
            .collect();
        assert_eq!(injected.len(), 1);
        assert_eq!(injected[0].virq, 2);
    }

    #[test]
    fn test_unregistered_virq_is_rejected() {
        let (_, mut vm, _) = gic_vm();
        assert!(vm.inject_irq(0, 77).is_err());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let (_, mut vm, _) = gic_vm();
        register_counting_irq(&mut vm, 45);
        assert!(register_irq(&mut vm, 0, 45, Box::new(|_, _| {})).is_err());
    }
}
