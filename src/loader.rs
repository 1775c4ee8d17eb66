//! ELF loading and the initial process image.
//!
//! Validates the binary (class per the configured address width,
//! RISC-V machine type), materialises every PT_LOAD into guest memory,
//! carves an execute segment per executable load, applies RELRO
//! downgrades and dynamic relocations, and builds the argv/envp/auxv
//! stack image the RISC-V user ABI expects.

use crate::arch::{
    page_round_up, Address, ADDRESS_WIDTH, DYLINK_BASE, PAGE_SIZE,
};
use crate::machine::MachineOptions;
use crate::memory::Memory;
use crate::page::PageAttributes;
use crate::segment::ExecuteSegment;
use anyhow::{anyhow, bail, Context};
use elf::abi::{
    EM_RISCV, ET_DYN, ET_EXEC, PF_R, PF_W, PF_X, PT_DYNAMIC, PT_GNU_RELRO, PT_GNU_STACK, PT_LOAD,
};
use elf::endian::AnyEndian;
use elf::file::Class;
use elf::ElfBytes;
use std::collections::BTreeMap;

const R_RISCV_RELATIVE: u32 = 3;

// auxiliary vector keys
const AT_NULL: Address = 0;
const AT_PAGESZ: Address = 6;
const AT_UID: Address = 11;
const AT_EUID: Address = 12;
const AT_GID: Address = 13;
const AT_EGID: Address = 14;
const AT_HWCAP: Address = 16;
const AT_CLKTCK: Address = 17;
const AT_SECURE: Address = 23;
const AT_RANDOM: Address = 25;

/// Fixed AT_RANDOM bytes: identical runs must produce identical guest
/// state.
const RANDOM_SEED: [u8; 16] = [
    0x1d, 0xdf, 0x28, 0x5f, 0x2a, 0x00, 0xd1, 0x2c, 0x82, 0xf6, 0xf9, 0x5f, 0x38, 0xd5, 0xd8, 0xd4,
];

pub(crate) struct LoadInfo {
    pub entry: Address,
    pub stack_pointer: Address,
    pub argc: Address,
    pub argv_ptr: Address,
    pub envp_ptr: Address,
}

pub(crate) fn load(
    elf_bytes: &[u8],
    options: &MachineOptions,
    memory: &mut Memory,
) -> anyhow::Result<LoadInfo> {
    let elf = ElfBytes::<AnyEndian>::minimal_parse(elf_bytes)
        .map_err(|e| anyhow!("elf parse error: {e}"))?;

    let expected_class = if ADDRESS_WIDTH == 4 { Class::ELF32 } else { Class::ELF64 };
    if elf.ehdr.class != expected_class {
        bail!("wrong ELF class for a {}-byte address width", ADDRESS_WIDTH);
    }
    if elf.ehdr.e_machine != EM_RISCV {
        bail!("not a RISC-V executable (e_machine {})", elf.ehdr.e_machine);
    }
    if elf.ehdr.e_type != ET_EXEC && elf.ehdr.e_type != ET_DYN {
        bail!("not an executable ELF type ({})", elf.ehdr.e_type);
    }

    let base: Address = if elf.ehdr.e_type == ET_DYN { DYLINK_BASE } else { 0 };
    let entry = base.wrapping_add(elf.ehdr.e_entry as Address);
    let entry_align = if options.compressed_isa { 1 } else { 3 };
    if entry == 0 || entry & entry_align != 0 {
        bail!("invalid entry point {entry:#x}");
    }

    let segments = elf.segments().ok_or_else(|| anyhow!("missing program headers"))?;

    let mut hiaddr: Address = 0;
    let mut ro_end: Address = 0;
    let mut writable_start: Address = Address::MAX;
    let mut relro_ranges: Vec<(Address, Address)> = Vec::new();
    let mut exec_loads: Vec<(Address, Vec<u8>)> = Vec::new();

    for phdr in segments {
        match phdr.p_type {
            PT_GNU_RELRO => {
                relro_ranges.push((
                    base.wrapping_add(phdr.p_vaddr as Address),
                    phdr.p_memsz as Address,
                ));
                continue;
            }
            PT_GNU_STACK => {
                if phdr.p_flags & PF_X != 0 {
                    log::warn!("executable stack requested; keeping the stack non-executable");
                }
                continue;
            }
            PT_DYNAMIC => continue,
            PT_LOAD if phdr.p_memsz > 0 => {}
            _ => continue,
        }

        if phdr.p_filesz > phdr.p_memsz {
            bail!(
                "invalid PT_LOAD segment, file size ({}) > mem size ({})",
                phdr.p_filesz,
                phdr.p_memsz
            );
        }
        if ADDRESS_WIDTH == 4 && phdr.p_vaddr + phdr.p_memsz >= 1 << 32 {
            bail!(
                "program segment out of 32-bit range: {:#x} + {:#x}",
                phdr.p_vaddr,
                phdr.p_memsz
            );
        }

        let vaddr = base.wrapping_add(phdr.p_vaddr as Address);
        let memsz = phdr.p_memsz as usize;
        let file_bytes = elf
            .segment_data(&phdr)
            .map_err(|e| anyhow!("bad segment data: {e}"))?;
        let take = (phdr.p_filesz as usize).min(file_bytes.len());
        let mut image = Vec::from(&file_bytes[..take]);
        image.resize(memsz, 0);

        log::debug!(
            "load segment {:#x}..{:#x} flags {}{}{}",
            vaddr,
            vaddr + memsz as Address,
            if phdr.p_flags & PF_R != 0 { "r" } else { "-" },
            if phdr.p_flags & PF_W != 0 { "w" } else { "-" },
            if phdr.p_flags & PF_X != 0 { "x" } else { "-" },
        );

        let writable = phdr.p_flags & PF_W != 0;
        let executable = phdr.p_flags & PF_X != 0;
        if writable && executable && !options.allow_write_exec_segment {
            bail!("refusing writable executable segment at {vaddr:#x}");
        }

        memory
            .initialize_range(vaddr, &image)
            .map_err(|e| anyhow!("segment did not fit in guest memory: {e}"))?;

        let end = vaddr + memsz as Address;
        hiaddr = hiaddr.max(end);

        let in_arena = memory
            .arena()
            .map_or(false, |a| a.contains(vaddr, memsz));
        if in_arena {
            if writable {
                writable_start = writable_start.min(vaddr);
            } else {
                ro_end = ro_end.max(end);
            }
        } else {
            let attr = PageAttributes::new(phdr.p_flags & PF_R != 0, writable, executable);
            memory
                .set_page_attributes(vaddr, memsz, attr)
                .map_err(|e| anyhow!("applying segment attributes failed: {e}"))?;
        }

        if executable {
            exec_loads.push((vaddr, image));
        }
    }

    if exec_loads.is_empty() {
        bail!("no executable segment in image");
    }

    // overlapping loads: the last attribute writer won above; RELRO now
    // downgrades its ranges to read-only
    for (addr, len) in relro_ranges {
        let in_arena = memory
            .arena()
            .map_or(false, |a| a.contains(addr, len as usize));
        if in_arena {
            ro_end = ro_end.max(addr + len);
        } else {
            memory
                .set_page_attributes(addr, len as usize, PageAttributes::read_only())
                .map_err(|e| anyhow!("applying RELRO failed: {e}"))?;
        }
    }

    if let Some(arena) = memory.arena_mut() {
        if writable_start < ro_end {
            log::warn!(
                "writable segment at {:#x} below read-only data end {:#x}",
                writable_start,
                ro_end
            );
        }
        arena.set_initial_rodata_end(ro_end.min(writable_start));
    }

    if elf.ehdr.e_type == ET_DYN {
        apply_relative_relocations(&elf, base, memory)?;
    }

    for (vaddr, code) in &exec_loads {
        let initial = entry >= *vaddr && entry < *vaddr + code.len() as Address;
        let segment = ExecuteSegment::generate(*vaddr, code, options.compressed_isa, initial);
        memory.install_execute_segment(segment);
    }

    memory.set_symbols(read_symbols(&elf, base));

    memory.start_address = entry;
    memory.heap_address = page_round_up(hiaddr) + PAGE_SIZE as Address;

    let (stack_pointer, argc, argv_ptr, envp_ptr) =
        setup_stack(memory, options).context("building the initial stack")?;

    Ok(LoadInfo {
        entry,
        stack_pointer,
        argc,
        argv_ptr,
        envp_ptr,
    })
}

fn apply_relative_relocations(
    elf: &ElfBytes<AnyEndian>,
    base: Address,
    memory: &mut Memory,
) -> anyhow::Result<()> {
    let shdr = match elf
        .section_header_by_name(".rela.dyn")
        .map_err(|e| anyhow!("bad section headers: {e}"))?
    {
        Some(shdr) => shdr,
        None => return Ok(()),
    };
    let relas = elf
        .section_data_as_relas(&shdr)
        .map_err(|e| anyhow!("bad relocation section: {e}"))?;
    let mut applied = 0usize;
    for rela in relas {
        if rela.r_type != R_RISCV_RELATIVE {
            continue;
        }
        let target = base.wrapping_add(rela.r_offset as Address);
        let value = base.wrapping_add(rela.r_addend as Address);
        let mut bytes = [0u8; ADDRESS_WIDTH];
        bytes.copy_from_slice(&value.to_le_bytes()[..ADDRESS_WIDTH]);
        memory
            .initialize_range(target, &bytes)
            .map_err(|e| anyhow!("relocation target unmapped: {e}"))?;
        applied += 1;
    }
    log::debug!("applied {} relative relocations", applied);
    Ok(())
}

fn read_symbols(elf: &ElfBytes<AnyEndian>, base: Address) -> BTreeMap<String, Address> {
    let mut map = BTreeMap::new();
    let symbols = match elf.symbol_table() {
        Ok(Some(table)) => table,
        _ => return map,
    };
    for symbol in symbols.0 {
        match symbols.1.get(symbol.st_name as usize) {
            Ok(name) if !name.is_empty() => {
                map.insert(name.to_string(), base.wrapping_add(symbol.st_value as Address));
            }
            Ok(_) => {}
            Err(e) => {
                log::warn!("parse symbol failed, {}", e);
                continue;
            }
        }
    }
    map
}

/// Build the initial stack: argument and environment strings high, the
/// AT_RANDOM bytes, then the argc/argv/envp/auxv vector, 16-byte
/// aligned, with the stack pointer left on argc.
fn setup_stack(
    memory: &mut Memory,
    options: &MachineOptions,
) -> anyhow::Result<(Address, Address, Address, Address)> {
    let word = ADDRESS_WIDTH as Address;
    let mut sp = memory.stack_address();

    let mut push_string = |sp: &mut Address, s: &str| -> anyhow::Result<Address> {
        let bytes = s.as_bytes();
        *sp -= bytes.len() as Address + 1;
        memory.memcpy(*sp, bytes).map_err(|e| anyhow!("stack write failed: {e}"))?;
        memory
            .write::<u8>(*sp + bytes.len() as Address, 0)
            .map_err(|e| anyhow!("stack write failed: {e}"))?;
        Ok(*sp)
    };

    let mut argv_addrs = Vec::with_capacity(options.argv.len());
    for arg in &options.argv {
        argv_addrs.push(push_string(&mut sp, arg)?);
    }
    let mut envp_addrs = Vec::with_capacity(options.envp.len());
    for env in &options.envp {
        envp_addrs.push(push_string(&mut sp, env)?);
    }

    sp -= RANDOM_SEED.len() as Address;
    let random_addr = sp;
    memory
        .memcpy(random_addr, &RANDOM_SEED)
        .map_err(|e| anyhow!("stack write failed: {e}"))?;

    let auxv: [(Address, Address); 10] = [
        (AT_PAGESZ, PAGE_SIZE as Address),
        (AT_CLKTCK, 100),
        (AT_HWCAP, 0),
        (AT_UID, 1000),
        (AT_EUID, 1000),
        (AT_GID, 1000),
        (AT_EGID, 1000),
        (AT_SECURE, 0),
        (AT_RANDOM, random_addr),
        (AT_NULL, 0),
    ];

    let vector_words =
        1 + (argv_addrs.len() + 1) + (envp_addrs.len() + 1) + auxv.len() * 2;
    sp &= !0xf;
    sp -= vector_words as Address * word;
    sp &= !0xf;

    let mut cursor = sp;
    let mut push_word = |cursor: &mut Address, value: Address| -> anyhow::Result<()> {
        memory
            .write::<Address>(*cursor, value)
            .map_err(|e| anyhow!("stack write failed: {e}"))?;
        *cursor += word;
        Ok(())
    };

    push_word(&mut cursor, argv_addrs.len() as Address)?;
    let argv_ptr = cursor;
    for addr in &argv_addrs {
        push_word(&mut cursor, *addr)?;
    }
    push_word(&mut cursor, 0)?;
    let envp_ptr = cursor;
    for addr in &envp_addrs {
        push_word(&mut cursor, *addr)?;
    }
    push_word(&mut cursor, 0)?;
    for (key, value) in auxv {
        push_word(&mut cursor, key)?;
        push_word(&mut cursor, value)?;
    }

    Ok((sp, argv_addrs.len() as Address, argv_ptr, envp_ptr))
}
