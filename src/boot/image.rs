//! Guest image loading.
//!
//! The kernel arrives as an ELF32 image in a byte buffer (the embedder
//! owns file access). Program headers are walked in place: each PT_LOAD
//! segment is copied into guest RAM through the touch path at its
//! physical address plus the relocation offset, the BSS tail is zeroed,
//! and the covered interval is claimed from the placement allocator.
//!
//! Relocatable images are patched afterwards from a Linux-boot-protocol
//! relocs blob: a zero-terminated run of 64-bit entries (ignored),
//! then a zero-terminated run of 32-bit little-endian virtual
//! addresses, read back to front; each referenced word is adjusted by
//! the load-link delta.

use crate::memory::round_up;
use crate::vm::Vm;

use super::{BootError, GuestImage, GuestKernelImage, Result};

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS32: u8 = 1;
const PT_LOAD: u32 = 1;

/// One parsed program header.
#[derive(Debug, Clone, Copy)]
struct ProgramHeader {
    p_type: u32,
    offset: u32,
    vaddr: u32,
    paddr: u32,
    filesz: u32,
    memsz: u32,
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn parse_program_headers(elf: &[u8]) -> Result<(u32, Vec<ProgramHeader>)> {
    if elf.len() < 52 || elf[..4] != ELF_MAGIC {
        return Err(BootError::InvalidKernel("not an ELF image"));
    }
    if elf[4] != ELFCLASS32 {
        return Err(BootError::InvalidKernel("only ELF32 kernels are supported"));
    }
    let entry = read_u32(elf, 0x18);
    let phoff = read_u32(elf, 0x1c) as usize;
    let phentsize = read_u16(elf, 0x2a) as usize;
    let phnum = read_u16(elf, 0x2c) as usize;
    if phentsize < 32 || phoff + phnum * phentsize > elf.len() {
        return Err(BootError::InvalidKernel("program headers out of bounds"));
    }

    let mut headers = Vec::with_capacity(phnum);
    for i in 0..phnum {
        let at = phoff + i * phentsize;
        headers.push(ProgramHeader {
            p_type: read_u32(elf, at),
            offset: read_u32(elf, at + 0x04),
            vaddr: read_u32(elf, at + 0x08),
            paddr: read_u32(elf, at + 0x0c),
            filesz: read_u32(elf, at + 0x10),
            memsz: read_u32(elf, at + 0x14),
        });
    }
    Ok((entry, headers))
}

/// Load an ELF32 kernel into guest RAM at (or above) `load_address`.
pub fn load_guest_kernel(
    vm: &mut Vm,
    elf: &[u8],
    load_address: u64,
    alignment: u64,
) -> Result<GuestKernelImage> {
    let (entry, headers) = parse_program_headers(elf)?;
    let load_addr = round_up(load_address, alignment.max(1));

    // Link addresses are the lowest PT_LOAD addresses; the relocation
    // offset moves every segment as one block.
    let mut link_paddr = u64::MAX;
    let mut link_vaddr = u64::MAX;
    for ph in headers.iter().filter(|ph| ph.p_type == PT_LOAD) {
        link_paddr = link_paddr.min(ph.paddr as u64);
        link_vaddr = link_vaddr.min(ph.vaddr as u64);
    }
    if link_paddr == u64::MAX {
        return Err(BootError::InvalidKernel("no loadable segments"));
    }
    let relocation_offset = load_addr as i64 - link_paddr as i64;
    log::info!(
        "guest kernel linked for paddr {link_paddr:#x} vaddr {link_vaddr:#x}, \
         loading at {load_addr:#x} (offset {relocation_offset})"
    );

    let mut total_size = 0u64;
    for ph in headers.iter().filter(|ph| ph.p_type == PT_LOAD) {
        if ph.memsz == 0 {
            continue;
        }
        let dest = (ph.paddr as i64 + relocation_offset) as u64;
        let file_end = (ph.offset + ph.filesz) as usize;
        if file_end > elf.len() || ph.filesz > ph.memsz {
            return Err(BootError::InvalidKernel("segment out of bounds"));
        }
        vm.ram_write(dest, &elf[ph.offset as usize..file_end])
            .map_err(|_| BootError::ImageDoesNotFit { addr: dest })?;
        // Zero the BSS tail.
        let tail = ph.memsz - ph.filesz;
        if tail > 0 {
            vm.ram_touch(dest + ph.filesz as u64, tail as u64, |_, _, bytes| {
                bytes.fill(0);
                Ok(())
            })
            .map_err(|_| BootError::ImageDoesNotFit { addr: dest })?;
        }
        vm.mem.ram.mark_allocated(dest, ph.memsz as u64);
        total_size = total_size.max(dest + ph.memsz as u64 - load_addr);
    }

    Ok(GuestKernelImage {
        image: GuestImage {
            load_paddr: load_addr,
            size: total_size,
            alignment,
        },
        link_paddr,
        link_vaddr,
        entry: (entry as i64 + relocation_offset) as u64,
        relocation_offset,
    })
}

/// Patch a relocatable kernel from its relocs blob.
pub fn relocate_guest_kernel(
    vm: &mut Vm,
    relocs: &[u8],
    kernel: &GuestKernelImage,
) -> Result<()> {
    let delta = kernel.relocation_offset;
    if delta == 0 {
        return Ok(());
    }
    if relocs.len() < 4 || relocs.len() % 4 != 0 {
        return Err(BootError::EmptyRelocs);
    }

    // Walk 32-bit entries back from the end of the blob; the zero entry
    // terminates the 32-bit section.
    let mut patched = 0u32;
    let mut at = relocs.len();
    loop {
        if at < 4 {
            break;
        }
        at -= 4;
        let vaddr = read_u32(relocs, at);
        if vaddr == 0 {
            break;
        }
        if (vaddr as u64) < kernel.link_vaddr {
            return Err(BootError::InvalidKernel("relocation below the image"));
        }
        let guest_paddr = (vaddr as u64 - kernel.link_vaddr)
            .wrapping_add((kernel.link_paddr as i64 + delta) as u64);

        let mut word = [0u8; 4];
        vm.ram_read(guest_paddr, &mut word)?;
        let value = (u32::from_le_bytes(word) as i64 + delta) as u32;
        vm.ram_write(guest_paddr, &value.to_le_bytes())?;

        patched += 1;
        if patched % 50_000 == 0 {
            log::debug!("{patched} relocations done");
        }
    }
    if patched == 0 {
        // A relocatable boot with nothing to patch means the image was
        // not built relocatable.
        return Err(BootError::EmptyRelocs);
    }
    log::info!("{patched} kernel relocations completed");
    Ok(())
}

/// Place a module (initrd) at `load_address` and claim the space.
pub fn load_guest_module(vm: &mut Vm, module: &[u8], load_address: u64) -> Result<GuestImage> {
    if module.is_empty() {
        return Err(BootError::InvalidKernel("module has zero size"));
    }
    log::info!(
        "loading module at {load_address:#x} ({} bytes)",
        module.len()
    );
    vm.mem.ram.mark_allocated(load_address, module.len() as u64);
    vm.ram_write(load_address, module)
        .map_err(|_| BootError::ImageDoesNotFit { addr: load_address })?;
    Ok(GuestImage {
        load_paddr: load_address,
        size: module.len() as u64,
        alignment: 0,
    })
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
        let mut vm = Vm::new(kernel, 0, "boot-test", Cap(1), VmArch::new_x86()).unwrap();
        vm.ram_register_at(0x10_0000, 0x10_0000, false).unwrap();
        vm
    }

    /// A minimal ELF32 with one loadable segment at paddr 0x20_0000.
    fn tiny_elf(payload: &[u8]) -> Vec<u8> {
        let mut elf = vec![0u8; 0x60 + payload.len()];
        elf[..4].copy_from_slice(&ELF_MAGIC);
        elf[4] = ELFCLASS32;
        elf[0x18..0x1c].copy_from_slice(&0x20_0040u32.to_le_bytes()); // entry
        elf[0x1c..0x20].copy_from_slice(&0x34u32.to_le_bytes()); // phoff
        elf[0x2a..0x2c].copy_from_slice(&32u16.to_le_bytes()); // phentsize
        elf[0x2c..0x2e].copy_from_slice(&1u16.to_le_bytes()); // phnum
        let ph = 0x34;
        elf[ph..ph + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
        elf[ph + 4..ph + 8].copy_from_slice(&0x60u32.to_le_bytes()); // offset
        elf[ph + 8..ph + 12].copy_from_slice(&0xc020_0000u32.to_le_bytes()); // vaddr
        elf[ph + 12..ph + 16].copy_from_slice(&0x20_0000u32.to_le_bytes()); // paddr
        elf[ph + 16..ph + 20].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        elf[ph + 20..ph + 24].copy_from_slice(&(payload.len() as u32 + 0x10).to_le_bytes());
        elf[0x60..].copy_from_slice(payload);
        elf
    }

    #[test]
    fn test_load_relocates_to_ram() {
        let mut vm = test_vm();
        let payload = b"guest kernel text";
        let elf = tiny_elf(payload);
        // RAM starts at 1 MiB but the image links at 2 MiB, so loading
        // at RAM base relocates down.
        let kernel = load_guest_kernel(&mut vm, &elf, 0x10_0000, 0x1000).unwrap();
        assert_eq!(kernel.image.load_paddr, 0x10_0000);
        assert_eq!(kernel.link_paddr, 0x20_0000);
        assert_eq!(kernel.relocation_offset, -0x10_0000);
        assert_eq!(kernel.entry, 0x10_0040);

        let mut back = vec![0u8; payload.len()];
        vm.ram_read(0x10_0000, &mut back).unwrap();
        assert_eq!(&back, payload);
        // BSS tail is zeroed.
        let mut bss = [0xffu8; 0x10];
        vm.ram_read(0x10_0000 + payload.len() as u64, &mut bss).unwrap();
        assert_eq!(bss, [0u8; 0x10]);
    }

    #[test]
    fn test_reject_non_elf() {
        let mut vm = test_vm();
        assert!(matches!(
            load_guest_kernel(&mut vm, b"not an elf image at all, sorry", 0x10_0000, 1),
            Err(BootError::InvalidKernel(_))
        ));
    }

    #[test]
    fn test_relocation_patches_words() {
        let mut vm = test_vm();
        let payload = [0u8; 64];
        let elf = tiny_elf(&payload);
        let kernel = load_guest_kernel(&mut vm, &elf, 0x10_0000, 0x1000).unwrap();

        // One word at vaddr 0xc020_0010 holding a linked address.
        vm.ram_write(0x10_0010, &0xc020_0040u32.to_le_bytes()).unwrap();
        // Relocs blob: 64-bit terminator, one 32-bit entry, terminator
        // comes first in file order.
        let mut relocs = Vec::new();
        relocs.extend_from_slice(&0u32.to_le_bytes()); // 64-bit section end
        relocs.extend_from_slice(&0u32.to_le_bytes()); // 32-bit section end
        relocs.extend_from_slice(&0xc020_0010u32.to_le_bytes());
        relocate_guest_kernel(&mut vm, &relocs, &kernel).unwrap();

        let mut word = [0u8; 4];
        vm.ram_read(0x10_0010, &mut word).unwrap();
        assert_eq!(u32::from_le_bytes(word), 0xc010_0040);
    }

    #[test]
    fn test_module_loading_claims_ram() {
        let mut vm = test_vm();
        let module = vec![0xabu8; 0x2000];
        let image = load_guest_module(&mut vm, &module, 0x18_0000).unwrap();
        assert_eq!(image.load_paddr, 0x18_0000);
        assert_eq!(image.size, 0x2000);
        // The placement allocator no longer hands that interval out.
        let next = vm.mem.ram.alloc(0x1000, 0x1000).unwrap();
        assert!(!(0x18_0000..0x18_2000).contains(&next));
    }
}
