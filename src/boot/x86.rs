//! x86 guest-boot surfaces: boot_params, e820, VESA and ACPI.
//!
//! The zero page is assembled in a host-side buffer at the offsets the
//! Linux boot protocol defines and written through the guest-RAM touch
//! path. The e820 map is derived from the coalesced RAM vector: one RAM
//! entry per region, RESERVED padding for the gaps, and a final entry
//! closing the map at 4 GiB.
//!
//! The ACPI tables (RSDP + XSDT + MADT with one local APIC entry per
//! vCPU) land in the BIOS shadow at 0xE0000-0xFFFFF, backed by frames
//! supplied through a backing-frame iterator.

use vm_memory::ByteValued;

use crate::arch::x86::state::{ctx, vmcs};
use crate::kernel::{Frame, KernelOps, MapRights};
use crate::memory::{page_align, round_up, FaultResult, GuestFrame, PAGE_BITS, PAGE_SIZE};
use crate::vm::{Vm, VmError};

use super::{BootError, GuestImage, GuestKernelImage, Result};

/// BIOS shadow region holding the ACPI tables.
pub const LOWER_BIOS_START: u64 = 0xe0000;
pub const LOWER_BIOS_SIZE: u64 = 0x20000;
/// RSDP lives at the start of the shadow, the tables one page in.
const RSDP_START: u64 = LOWER_BIOS_START;
const XSDT_START: u64 = LOWER_BIOS_START + 0x1000;

const BOOT_PARAMS_SIZE: usize = 4096;
const E820_MAX: usize = 128;

const E820_RAM: u32 = 1;
const E820_RESERVED: u32 = 2;

/// Byte offsets within the zero page, per the boot protocol.
mod offsets {
    pub const SCREEN_INFO: usize = 0x000;
    pub const ALT_MEM_K: usize = 0x1e0;
    pub const E820_ENTRIES: usize = 0x1e8;
    pub const ROOT_DEV: usize = 0x1fc;
    pub const BOOT_FLAG: usize = 0x1fe;
    pub const HDR_VERSION: usize = 0x206;
    pub const HDR_MAGIC: usize = 0x202;
    pub const TYPE_OF_LOADER: usize = 0x210;
    pub const CODE32_START: usize = 0x214;
    pub const RAMDISK_IMAGE: usize = 0x218;
    pub const RAMDISK_SIZE: usize = 0x21c;
    pub const CMD_LINE_PTR: usize = 0x228;
    pub const KERNEL_ALIGNMENT: usize = 0x230;
    pub const RELOCATABLE_KERNEL: usize = 0x234;
    pub const CMDLINE_SIZE: usize = 0x238;
    pub const E820_MAP: usize = 0x2d0;
}

/// Offsets of the fields we fill within screen_info.
mod screen {
    pub const ORIG_VIDEO_ISVGA: usize = 0x0f;
    pub const LFB_WIDTH: usize = 0x12;
    pub const LFB_HEIGHT: usize = 0x14;
    pub const LFB_DEPTH: usize = 0x16;
    pub const LFB_BASE: usize = 0x18;
    pub const LFB_SIZE: usize = 0x1c;
    pub const LFB_LINELENGTH: usize = 0x24;
    pub const RED_SIZE: usize = 0x26;
    pub const RED_POS: usize = 0x27;
    pub const GREEN_SIZE: usize = 0x28;
    pub const GREEN_POS: usize = 0x29;
    pub const BLUE_SIZE: usize = 0x2a;
    pub const BLUE_POS: usize = 0x2b;
    pub const RSVD_SIZE: usize = 0x2c;
    pub const RSVD_POS: usize = 0x2d;
    pub const VESAPM_SEG: usize = 0x2e;
    pub const VESAPM_OFF: usize = 0x30;
    pub const PAGES: usize = 0x32;
}

/// One e820 map record.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct E820Entry {
    pub addr: u64,
    pub size: u64,
    pub kind: u32,
}

unsafe impl ByteValued for E820Entry {}

/// Host boot-info about the VESA mode, when a framebuffer is passed
/// through.
#[derive(Debug, Clone, Copy)]
pub struct VesaInfo {
    pub x_res: u16,
    pub y_res: u16,
    pub bits_per_pixel: u8,
    pub bytes_per_scanline: u16,
    pub phys_base: u64,
    pub red: (u8, u8),
    pub green: (u8, u8),
    pub blue: (u8, u8),
    pub rsvd: (u8, u8),
    pub vesapm_seg: u16,
    pub vesapm_off: u16,
    pub planes: u8,
}

/// Everything make_boot_params needs beyond the VM itself.
pub struct BootParamsConfig<'a> {
    pub cmdline: &'a str,
    pub kernel: GuestKernelImage,
    pub ramdisk: Option<GuestImage>,
    pub vesa: Option<VesaInfo>,
}

/// Build the e820 map from the coalesced RAM vector: entry 0 reserved,
/// one RAM entry per (merged) region with RESERVED gap fill, and a
/// final RESERVED entry closing 0..4 GiB.
pub fn make_e820_map(vm: &Vm) -> Result<Vec<E820Entry>> {
    let regions = vm.mem.ram.regions();
    if regions.is_empty() {
        return Err(BootError::NoGuestRam);
    }
    let mut map: Vec<E820Entry> = Vec::new();
    // The entry being grown; starts as the reserved hole at zero.
    let mut current = E820Entry {
        addr: 0,
        size: 0,
        kind: E820_RESERVED,
    };

    for region in regions {
        if current.addr + current.size != region.start {
            // Discontinuity: close the current entry and pad up to the
            // region with a reserved hole.
            if current.size != 0 {
                let hole_start = current.addr + current.size;
                map.push(current);
                current = E820Entry {
                    addr: hole_start,
                    size: 0,
                    kind: E820_RESERVED,
                };
            }
            current.size = region.start - current.addr;
            map.push(current);
            current = E820Entry {
                addr: region.start,
                size: region.size,
                kind: E820_RAM,
            };
        } else if current.kind == E820_RAM {
            // Contiguous (regions split only by allocation flags): all
            // of it is guest-visible RAM.
            current.size += region.size;
        } else {
            if current.size != 0 {
                map.push(current);
            }
            current = E820Entry {
                addr: region.start,
                size: region.size,
                kind: E820_RAM,
            };
        }
        if map.len() >= E820_MAX {
            return Err(BootError::InvalidKernel("e820 map overflow"));
        }
    }
    map.push(current);

    let last_end = current.addr + current.size;
    map.push(E820Entry {
        addr: last_end,
        size: 0x1_0000_0000 - last_end,
        kind: E820_RESERVED,
    });
    for entry in &map {
        let addr = entry.addr;
        let size = entry.size;
        let kind = entry.kind;
        log::debug!("e820: {:#x} - {:#x} type {}", addr, addr + size, kind);
    }
    Ok(map)
}

/// Allocate the command line out of guest RAM and write it.
fn make_guest_cmdline(vm: &mut Vm, cmdline: &str) -> Result<(u64, usize)> {
    let len = cmdline.len();
    if len >= 2048 {
        return Err(BootError::CmdlineTooLong { len });
    }
    let addr = vm
        .mem
        .ram
        .alloc(len as u64 + 1, 1)
        .ok_or(BootError::NoGuestRam)?;
    log::info!("guest cmdline at {addr:#x}: {cmdline}");
    let mut bytes = cmdline.as_bytes().to_vec();
    bytes.push(0);
    vm.ram_write(addr, &bytes)?;
    Ok((addr, len))
}

/// Map the framebuffer through a device-backed reservation and fill
/// screen_info.
fn make_screen_info(vm: &mut Vm, vesa: Option<VesaInfo>, params: &mut [u8]) -> Result<()> {
    let Some(vesa) = vesa else {
        return Ok(());
    };
    let fb_size = round_up(
        vesa.bytes_per_scanline as u64 * vesa.y_res as u64,
        0x10000,
    );
    let (res, base) = vm.reserve_anon_memory(
        fb_size,
        PAGE_SIZE,
        Box::new(|_, _, addr, _| {
            log::error!("unexpected fault on mapped framebuffer at {addr:#x}");
            FaultResult::Error
        }),
    )?;
    let kernel = vm.kernel.clone();
    let phys_base = vesa.phys_base;
    vm.map_reservation(
        res,
        Box::new(move |addr| {
            let offset = page_align(addr) - page_align(base);
            let frame = kernel
                .alloc_frame_at(phys_base + offset, PAGE_BITS)
                .ok()?;
            Some(GuestFrame {
                frame,
                rights: MapRights::READ_WRITE,
                gpa: page_align(addr),
            })
        }),
    )?;

    let put_u16 = |params: &mut [u8], at: usize, value: u16| {
        params[at..at + 2].copy_from_slice(&value.to_le_bytes());
    };
    let put_u32 = |params: &mut [u8], at: usize, value: u32| {
        params[at..at + 4].copy_from_slice(&value.to_le_bytes());
    };
    let si = offsets::SCREEN_INFO;
    // 0x23 tells the kernel this is a VESA linear framebuffer.
    params[si + screen::ORIG_VIDEO_ISVGA] = 0x23;
    put_u16(params, si + screen::LFB_WIDTH, vesa.x_res);
    put_u16(params, si + screen::LFB_HEIGHT, vesa.y_res);
    put_u16(params, si + screen::LFB_DEPTH, vesa.bits_per_pixel as u16);
    put_u32(params, si + screen::LFB_BASE, base as u32);
    put_u32(params, si + screen::LFB_SIZE, (fb_size >> 16) as u32);
    put_u16(params, si + screen::LFB_LINELENGTH, vesa.bytes_per_scanline);
    params[si + screen::RED_SIZE] = vesa.red.0;
    params[si + screen::RED_POS] = vesa.red.1;
    params[si + screen::GREEN_SIZE] = vesa.green.0;
    params[si + screen::GREEN_POS] = vesa.green.1;
    params[si + screen::BLUE_SIZE] = vesa.blue.0;
    params[si + screen::BLUE_POS] = vesa.blue.1;
    params[si + screen::RSVD_SIZE] = vesa.rsvd.0;
    params[si + screen::RSVD_POS] = vesa.rsvd.1;
    put_u16(params, si + screen::VESAPM_SEG, vesa.vesapm_seg);
    put_u16(params, si + screen::VESAPM_OFF, vesa.vesapm_off);
    put_u16(params, si + screen::PAGES, vesa.planes as u16);
    Ok(())
}

/// Assemble the zero page in guest RAM. Returns its address.
pub fn make_boot_params(vm: &mut Vm, config: &BootParamsConfig) -> Result<u64> {
    let (cmd_addr, cmd_len) = make_guest_cmdline(vm, config.cmdline)?;

    let addr = vm
        .mem
        .ram
        .alloc(BOOT_PARAMS_SIZE as u64, 1)
        .ok_or(BootError::NoGuestRam)?;
    log::info!("guest boot_params at {addr:#x}");

    let mut params = vec![0u8; BOOT_PARAMS_SIZE];
    let put_u16 = |params: &mut [u8], at: usize, value: u16| {
        params[at..at + 2].copy_from_slice(&value.to_le_bytes());
    };
    let put_u32 = |params: &mut [u8], at: usize, value: u32| {
        params[at..at + 4].copy_from_slice(&value.to_le_bytes());
    };

    // Setup header per Documentation/x86/boot.txt.
    put_u32(&mut params, offsets::HDR_MAGIC, 0x5372_6448); // "HdrS"
    put_u16(&mut params, offsets::BOOT_FLAG, 0xaa55);
    params[offsets::TYPE_OF_LOADER] = 0xff;
    put_u32(
        &mut params,
        offsets::CODE32_START,
        config.kernel.image.load_paddr as u32,
    );
    put_u32(
        &mut params,
        offsets::KERNEL_ALIGNMENT,
        config.kernel.image.alignment as u32,
    );
    params[offsets::RELOCATABLE_KERNEL] = 1;

    make_screen_info(vm, config.vesa, &mut params)?;

    let e820 = make_e820_map(vm)?;
    params[offsets::E820_ENTRIES] = e820.len() as u8;
    let mut at = offsets::E820_MAP;
    for entry in &e820 {
        params[at..at + std::mem::size_of::<E820Entry>()].copy_from_slice(entry.as_slice());
        at += std::mem::size_of::<E820Entry>();
    }

    put_u32(&mut params, offsets::CMD_LINE_PTR, cmd_addr as u32);
    put_u32(&mut params, offsets::CMDLINE_SIZE, cmd_len as u32);
    // Only used by the decompressor's sanity checks.
    put_u32(&mut params, offsets::ALT_MEM_K, 0);

    match &config.ramdisk {
        Some(ramdisk) => {
            put_u32(&mut params, offsets::RAMDISK_IMAGE, ramdisk.load_paddr as u32);
            put_u32(&mut params, offsets::RAMDISK_SIZE, ramdisk.size as u32);
            put_u16(&mut params, offsets::ROOT_DEV, 0x0100);
            // 2.04 is the first protocol that reports ramdisk_image.
            put_u16(&mut params, offsets::HDR_VERSION, 0x0204);
        }
        None => {
            put_u16(&mut params, offsets::HDR_VERSION, 0x0202);
        }
    }

    vm.ram_write(addr, &params)?;
    Ok(addr)
}

// ACPI construction.

const ACPI_HEADER_LEN: usize = 36;
const OEM_ID: &[u8; 6] = b"ARGON ";

fn acpi_checksum(table: &[u8]) -> u8 {
    let sum: u32 = table.iter().map(|&b| b as u32).sum();
    (0x100 - (sum & 0xff)) as u8
}

fn acpi_table_header(signature: &[u8; 4], length: u32, revision: u8) -> Vec<u8> {
    let mut head = vec![0u8; ACPI_HEADER_LEN];
    head[0..4].copy_from_slice(signature);
    head[4..8].copy_from_slice(&length.to_le_bytes());
    head[8] = revision;
    head[10..16].copy_from_slice(OEM_ID);
    head[16..20].copy_from_slice(signature);
    head[20..24].copy_from_slice(b"    ");
    head[24..28].copy_from_slice(&(revision as u32).to_le_bytes());
    head[28..32].copy_from_slice(&OEM_ID[..4]);
    head[32..36].copy_from_slice(&1u32.to_le_bytes());
    head
}

/// MADT: the local APIC base plus one enabled LAPIC record per vCPU.
fn make_madt(vm: &Vm) -> Vec<u8> {
    let num_vcpus = vm.num_vcpus().max(1);
    let length = (44 + num_vcpus * 8) as u32;
    let mut madt = acpi_table_header(b"APIC", length, 3);
    madt.extend_from_slice(
        &(crate::arch::x86::lapic::APIC_DEFAULT_PHYS_BASE as u32).to_le_bytes(),
    );
    // PCAT_COMPAT: a dual-8259 setup is present.
    madt.extend_from_slice(&1u32.to_le_bytes());
    for vcpu in 0..num_vcpus {
        madt.push(0); // local APIC record
        madt.push(8);
        madt.push(vcpu as u8); // ACPI processor id
        madt.push(vcpu as u8); // APIC id
        madt.extend_from_slice(&1u32.to_le_bytes()); // enabled
    }
    let checksum = acpi_checksum(&madt);
    madt[9] = checksum;
    madt
}

fn make_rsdp(xsdt_addr: u64) -> Vec<u8> {
    let mut rsdp = vec![0u8; 36];
    rsdp[0..8].copy_from_slice(b"RSD PTR ");
    rsdp[9..15].copy_from_slice(OEM_ID);
    rsdp[15] = 2; // ACPI v3: the XSDT pointer is authoritative
    rsdp[16..20].copy_from_slice(&(xsdt_addr as u32).to_le_bytes());
    rsdp[20..24].copy_from_slice(&36u32.to_le_bytes());
    rsdp[24..32].copy_from_slice(&xsdt_addr.to_le_bytes());
    rsdp[8] = acpi_checksum(&rsdp[..20]);
    rsdp[32] = acpi_checksum(&rsdp);
    rsdp
}

/// Lay the ACPI tables into the BIOS shadow region. The shadow is
/// backed by freshly allocated frames mapped through an iterator, so
/// the tables exist before the guest's first access.
pub fn make_guest_acpi_tables(vm: &mut Vm) -> Result<()> {
    let num_pages = (LOWER_BIOS_SIZE / PAGE_SIZE) as usize;
    let mut frames: Vec<Frame> = Vec::with_capacity(num_pages);
    for _ in 0..num_pages {
        frames.push(vm.kernel.alloc_frame(PAGE_BITS)?);
    }

    // MADT first, then the XSDT that points at it.
    let madt = make_madt(vm);
    let xsdt_len = ACPI_HEADER_LEN + 8;
    let madt_addr = XSDT_START + xsdt_len as u64;
    let mut xsdt = acpi_table_header(b"XSDT", xsdt_len as u32, 1);
    xsdt.extend_from_slice(&madt_addr.to_le_bytes());
    let checksum = acpi_checksum(&xsdt);
    xsdt[9] = checksum;

    let rsdp = make_rsdp(XSDT_START);

    let write_into = |frames: &Vec<Frame>, kernel: &dyn KernelOps, addr: u64, data: &[u8]| {
        let mut offset = (addr - LOWER_BIOS_START) as usize;
        let mut written = 0usize;
        while written < data.len() {
            let page = offset / PAGE_SIZE as usize;
            let in_page = offset % PAGE_SIZE as usize;
            let chunk = (PAGE_SIZE as usize - in_page).min(data.len() - written);
            kernel
                .frame_data(&frames[page], &mut |bytes| {
                    bytes[in_page..in_page + chunk]
                        .copy_from_slice(&data[written..written + chunk]);
                })
                .map_err(VmError::from)?;
            offset += chunk;
            written += chunk;
        }
        Ok::<(), VmError>(())
    };
    let kernel = vm.kernel.clone();
    write_into(&frames, kernel.as_ref(), RSDP_START, &rsdp)?;
    write_into(&frames, kernel.as_ref(), XSDT_START, &xsdt)?;
    write_into(&frames, kernel.as_ref(), madt_addr, &madt)?;

    let res = vm.reserve_memory_at(
        LOWER_BIOS_START,
        LOWER_BIOS_SIZE,
        Box::new(|_, _, addr, _| {
            log::error!("unexpected fault on mapped BIOS shadow at {addr:#x}");
            FaultResult::Error
        }),
    )?;
    vm.map_reservation(
        res,
        Box::new(move |addr| {
            let page = ((page_align(addr) - LOWER_BIOS_START) / PAGE_SIZE) as usize;
            frames.get(page).map(|frame| GuestFrame {
                frame: *frame,
                rights: MapRights::READ_WRITE,
                gpa: page_align(addr),
            })
        }),
    )?;
    Ok(())
}

/// Program the entry vCPU: zeroed GPRs, ESI pointing at boot_params and
/// RIP at the kernel entry.
pub fn init_guest_thread_state(
    vm: &mut Vm,
    vcpu: usize,
    entry: u64,
    boot_info_addr: u64,
) -> Result<()> {
    let kobj = vm.vcpu(vcpu)?.kobj;
    let x86 = vm
        .vcpu_mut(vcpu)?
        .arch
        .as_x86_mut()
        .ok_or(VmError::WrongArch)?;
    x86.state.set_context_reg(ctx::EAX, 0)?;
    x86.state.set_context_reg(ctx::EBX, 0)?;
    x86.state.set_context_reg(ctx::ECX, 0)?;
    x86.state.set_context_reg(ctx::EDX, 0)?;
    x86.state.set_context_reg(ctx::ESI, boot_info_addr)?;
    x86.state.eip = entry;
    log::info!("guest will start at {entry:#x} with boot info {boot_info_addr:#x}");
    // Push the entry point through to the VMCS as well, so the first
    // VM entry publishes it.
    vm.kernel.vcpu_write_reg(kobj, vmcs::GUEST_RIP, entry)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::VmArch;
    use crate::kernel::mock::MockKernel;
    use crate::kernel::{Cap, KernelOps};
    use std::sync::Arc;

    fn test_vm() -> Vm {
        let kernel: Arc<dyn KernelOps> = Arc::new(MockKernel::new());
        Vm::new(kernel, 0, "e820-test", Cap(1), VmArch::new_x86()).unwrap()
    }

    #[test]
    fn test_e820_covers_exactly_4g() {
        let mut vm = test_vm();
        vm.ram_register_at(0x10_0000, 0x40_0000, false).unwrap();
        vm.ram_register_at(0x100_0000, 0x100_0000, false).unwrap();
        let map = make_e820_map(&vm).unwrap();

        let total: u64 = map.iter().map(|e| e.size).sum();
        assert_eq!(total, 0x1_0000_0000);

        let ram_total: u64 = map
            .iter()
            .filter(|e| e.kind == E820_RAM)
            .map(|e| e.size)
            .sum();
        let region_total: u64 = vm.mem.ram.regions().iter().map(|r| r.size).sum();
        assert_eq!(ram_total, region_total);

        // Contiguous, ordered, gap-free.
        let mut cursor = 0u64;
        for entry in &map {
            let addr = entry.addr;
            let size = entry.size;
            assert_eq!(addr, cursor);
            cursor += size;
        }
        assert_eq!(cursor, 0x1_0000_0000);
    }

    #[test]
    fn test_e820_first_entry_reserved() {
        let mut vm = test_vm();
        vm.ram_register_at(0x10_0000, 0x10_0000, false).unwrap();
        let map = make_e820_map(&vm).unwrap();
        let e0_kind = map[0].kind;
        let e0_addr = map[0].addr;
        let e0_size = map[0].size;
        let e1_kind = map[1].kind;
        assert_eq!(e0_kind, E820_RESERVED);
        assert_eq!(e0_addr, 0);
        // The hole below 1 MiB is the first entry.
        assert_eq!(e0_size, 0x10_0000);
        assert_eq!(e1_kind, E820_RAM);
    }

    #[test]
    fn test_boot_params_layout() {
        let mut vm = test_vm();
        vm.ram_register_at(0x10_0000, 0x40_0000, false).unwrap();
        let kernel = GuestKernelImage {
            image: GuestImage {
                load_paddr: 0x20_0000,
                size: 0x10_0000,
                alignment: 0x1000,
            },
            ..GuestKernelImage::default()
        };
        let addr = make_boot_params(
            &mut vm,
            &BootParamsConfig {
                cmdline: "console=ttyS0",
                kernel,
                ramdisk: Some(GuestImage {
                    load_paddr: 0x30_0000,
                    size: 0x800,
                    alignment: 0,
                }),
                vesa: None,
            },
        )
        .unwrap();

        let mut magic = [0u8; 4];
        vm.ram_read(addr + offsets::HDR_MAGIC as u64, &mut magic).unwrap();
        assert_eq!(u32::from_le_bytes(magic), 0x5372_6448);

        let mut ramdisk = [0u8; 4];
        vm.ram_read(addr + offsets::RAMDISK_IMAGE as u64, &mut ramdisk).unwrap();
        assert_eq!(u32::from_le_bytes(ramdisk), 0x30_0000);

        // The cmdline pointer leads to the NUL-terminated string.
        let mut ptr = [0u8; 4];
        vm.ram_read(addr + offsets::CMD_LINE_PTR as u64, &mut ptr).unwrap();
        let mut cmdline = vec![0u8; 14];
        vm.ram_read(u32::from_le_bytes(ptr) as u64, &mut cmdline).unwrap();
        assert_eq!(&cmdline, b"console=ttyS0\0");
    }

    #[test]
    fn test_acpi_checksums() {
        let mut vm = test_vm();
        vm.create_vcpu(100).unwrap();
        vm.create_vcpu(100).unwrap();
        let madt = make_madt(&vm);
        assert_eq!(&madt[0..4], b"APIC");
        // Two LAPIC records.
        assert_eq!(madt.len(), 44 + 2 * 8);
        // A valid table sums to zero mod 256.
        let sum: u32 = madt.iter().map(|&b| b as u32).sum();
        assert_eq!(sum & 0xff, 0);

        let rsdp = make_rsdp(XSDT_START);
        let sum: u32 = rsdp[..20].iter().map(|&b| b as u32).sum();
        assert_eq!(sum & 0xff, 0);
        let sum: u32 = rsdp.iter().map(|&b| b as u32).sum();
        assert_eq!(sum & 0xff, 0);
    }
}
