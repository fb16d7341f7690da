// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Best-effort symbolization with the dynamic symbol table of a module, as
//! found in the memory of the target. Reads here never add to the dump.

use crate::elf::Elf64_Dyn;
use crate::elf::Elf64_Sym;
use crate::elf::DT_GNU_HASH;
use crate::elf::DT_HASH;
use crate::elf::DT_NULL;
use crate::elf::DT_STRSZ;
use crate::elf::DT_STRTAB;
use crate::elf::DT_SYMTAB;
use crate::error::DumpError;
use crate::memory::ProcessMemory;
use crate::modules::ModuleInfo;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

const STT_FUNC: u8 = 2;
const MAX_SYMBOLS: u64 = 1 << 20;
const MAX_DYNAMIC_ENTRIES: usize = 0x1000;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Symbol {
    start: u64,
    size: u64,
    name: String,
}

/// Function symbols of one module, sorted by address.
#[derive(Debug, Default)]
pub struct DynamicSymbols {
    symbols: Vec<Symbol>,
}

fn read_raw_struct<T: FromBytes + IntoBytes>(memory: &mut ProcessMemory, address: u64) -> Result<T, DumpError> {
    let mut value = T::new_zeroed();
    let buf = value.as_mut_bytes();
    let read = memory.read_raw(address, buf)?;
    if read != buf.len() {
        return Err(DumpError::ShortRead {
            address,
            requested: buf.len(),
            read,
        });
    }
    Ok(value)
}

fn read_u32(memory: &mut ProcessMemory, address: u64) -> Result<u32, DumpError> {
    read_raw_struct::<u32>(memory, address)
}

/// Number of symbols in a table indexed by a GNU hash section: the highest
/// bucket start, then follow its chain to the end marker.
fn gnu_hash_symbol_count(memory: &mut ProcessMemory, address: u64) -> Result<u64, DumpError> {
    let nbuckets = u64::from(read_u32(memory, address)?);
    let symoffset = u64::from(read_u32(memory, address + 4)?);
    let bloom_size = u64::from(read_u32(memory, address + 8)?);

    let buckets = address + 16 + bloom_size * 8;
    let chains = buckets + nbuckets * 4;

    let mut last = 0_u64;
    for index in 0..nbuckets.min(MAX_SYMBOLS) {
        last = last.max(u64::from(read_u32(memory, buckets + index * 4)?));
    }
    if last < symoffset {
        return Ok(symoffset);
    }

    while last < MAX_SYMBOLS {
        let chain = read_u32(memory, chains + (last - symoffset) * 4)?;
        last += 1;
        if chain & 1 != 0 {
            break;
        }
    }
    Ok(last)
}

impl DynamicSymbols {
    /// Loads the function symbols of `module`. Native modules without a
    /// dynamic section or hash table yield `None`.
    pub fn load(memory: &mut ProcessMemory, module: &ModuleInfo) -> Option<Self> {
        let dynamic_address = module.dynamic_address?;
        match Self::read(memory, module.load_bias, dynamic_address) {
            Ok(symbols) => Some(symbols),
            Err(e) => {
                tracing::debug!("No dynamic symbols for {}, {}", module.name, e);
                None
            }
        }
    }

    fn read(memory: &mut ProcessMemory, load_bias: u64, dynamic_address: u64) -> Result<Self, DumpError> {
        let mut symtab = 0;
        let mut strtab = 0;
        let mut strsz = 0;
        let mut hash = 0;
        let mut gnu_hash = 0;

        let entry_size = std::mem::size_of::<Elf64_Dyn>() as u64;
        for index in 0..MAX_DYNAMIC_ENTRIES as u64 {
            let entry: Elf64_Dyn = read_raw_struct(memory, dynamic_address + index * entry_size)?;
            // The dynamic linker relocates most addresses in place, the
            // vDSO and some loaders leave them relative.
            let address = if entry.d_val < load_bias {
                load_bias.wrapping_add(entry.d_val)
            } else {
                entry.d_val
            };
            match entry.d_tag {
                DT_NULL => break,
                DT_SYMTAB => symtab = address,
                DT_STRTAB => strtab = address,
                DT_STRSZ => strsz = entry.d_val,
                DT_HASH => hash = address,
                DT_GNU_HASH => gnu_hash = address,
                _ => {}
            }
        }

        if symtab == 0 || strtab == 0 {
            return Err(DumpError::UnsupportedHeader);
        }

        let count = if hash != 0 {
            u64::from(read_u32(memory, hash + 4)?)
        } else if gnu_hash != 0 {
            gnu_hash_symbol_count(memory, gnu_hash)?
        } else {
            return Err(DumpError::UnsupportedHeader);
        };

        let mut strings = vec![0_u8; strsz.min(16 << 20) as usize];
        let read = memory.read_raw(strtab, &mut strings)?;
        strings.truncate(read);

        let sym_size = std::mem::size_of::<Elf64_Sym>() as u64;
        let mut symbols = Vec::new();
        for index in 0..count.min(MAX_SYMBOLS) {
            let sym: Elf64_Sym = read_raw_struct(memory, symtab + index * sym_size)?;
            if sym.st_info & 0xf != STT_FUNC || sym.st_value == 0 {
                continue;
            }
            let Some(name) = strings
                .get(sym.st_name as usize..)
                .and_then(|rest| rest.split(|&b| b == 0).next())
                .filter(|name| !name.is_empty())
            else {
                continue;
            };
            symbols.push(Symbol {
                start: load_bias.wrapping_add(sym.st_value),
                size: sym.st_size,
                name: String::from_utf8_lossy(name).into_owned(),
            });
        }

        symbols.sort_by_key(|symbol| symbol.start);
        tracing::trace!("Loaded {} dynamic symbols", symbols.len());
        Ok(Self { symbols })
    }

    /// Symbol name and offset into it for an address.
    pub fn lookup(&self, address: u64) -> Option<(&str, u64)> {
        let index = self.symbols.partition_point(|symbol| symbol.start <= address);
        let symbol = self.symbols.get(index.checked_sub(1)?)?;
        let offset = address - symbol.start;
        // Symbols without a size are assumed to extend to the next one.
        if symbol.size != 0 && offset >= symbol.size {
            return None;
        }
        Some((symbol.name.as_str(), offset))
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::fake::FakeProcess;
    use uguid::Guid;
    use zerocopy::FromZeros;

    fn module(load_bias: u64, dynamic_address: u64) -> ModuleInfo {
        ModuleInfo {
            base_address: load_bias,
            is_managed: false,
            time_stamp: 0,
            image_size: 0,
            version_id: Guid::ZERO,
            name: "libtest.so".to_owned(),
            load_bias,
            dynamic_address: Some(dynamic_address),
        }
    }

    fn sym(name: u32, value: u64, size: u64) -> Elf64_Sym {
        Elf64_Sym {
            st_name: name,
            st_info: STT_FUNC | (1 << 4),
            st_other: 0,
            st_shndx: 1,
            st_value: value,
            st_size: size,
        }
    }

    fn write_dynamic(process: &mut FakeProcess, address: u64, entries: &[(i64, u64)]) {
        for (index, (tag, value)) in entries.iter().enumerate() {
            let entry = Elf64_Dyn { d_tag: *tag, d_val: *value };
            process.write(address + index as u64 * 16, entry.as_bytes());
        }
    }

    #[test]
    fn resolves_with_sysv_hash() {
        let base = 0x10_0000;
        let mut process = FakeProcess::default();
        write_dynamic(
            &mut process,
            base + 0x3000,
            &[
                (DT_HASH, 0x100),
                (DT_SYMTAB, base + 0x200),
                (DT_STRTAB, base + 0x400),
                (DT_STRSZ, 32),
                (DT_NULL, 0),
            ],
        );
        // nbucket, nchain
        process.write(base + 0x100, &[1, 0, 0, 0, 3, 0, 0, 0]);
        process.write(base + 0x200, Elf64_Sym::new_zeroed().as_bytes());
        process.write(base + 0x218, sym(1, 0x1000, 0x40).as_bytes());
        process.write(base + 0x230, sym(12, 0x1100, 0).as_bytes());
        process.write(base + 0x400, b"\0crash_here\0do_abort\0");
        let mut memory = ProcessMemory::new(Box::new(process));

        let symbols = DynamicSymbols::load(&mut memory, &module(base, base + 0x3000)).unwrap();
        assert_eq!(symbols.len(), 2);
        assert_eq!(symbols.lookup(base + 0x1010), Some(("crash_here", 0x10)));
        assert_eq!(symbols.lookup(base + 0x1050), None);
        assert_eq!(symbols.lookup(base + 0x1180), Some(("do_abort", 0x80)));
        assert_eq!(symbols.lookup(base + 0x10), None);
        assert!(memory.regions().is_empty());
    }

    #[test]
    fn counts_symbols_with_gnu_hash() {
        let table = 0x2000;
        let mut process = FakeProcess::default();
        // nbuckets 2, symoffset 1, bloom_size 1, bloom_shift 6
        for (i, value) in [2_u32, 1, 1, 6].iter().enumerate() {
            process.write(table + i as u64 * 4, &value.to_le_bytes());
        }
        let buckets = table + 16 + 8;
        process.write(buckets, &1_u32.to_le_bytes());
        process.write(buckets + 4, &3_u32.to_le_bytes());
        let chains = buckets + 8;
        // symbols 1..=4, chain of bucket 1 ends at symbol 4
        for (i, value) in [0_u32, 1, 2, 5].iter().enumerate() {
            process.write(chains + i as u64 * 4, &value.to_le_bytes());
        }
        let mut memory = ProcessMemory::new(Box::new(process));
        assert_eq!(gnu_hash_symbol_count(&mut memory, table).unwrap(), 5);
    }
}
