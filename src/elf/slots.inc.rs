// GOT slot 定位，通过 include! 嵌入 elf.rs

// 统一后的单条重定位条目
#[derive(Clone, Copy, Debug)]
struct RelocEntry {
    r_offset: usize,
    r_info: ElfXword,
}

impl Elf {
    // 收集引用 symbol 的全部 GOT slot 地址
    // 未导入该符号返回空列表，元数据损坏返回 Format
    pub fn find_got_slots(&self, symbol: &str) -> Result<Vec<usize>, Errno> {
        if symbol.is_empty() {
            return Err(Errno::InvalidArg);
        }
        let Some(symidx) = self.find_symidx_by_name(symbol) else {
            return Ok(Vec::new());
        };

        let mut slots = Vec::new();
        for table in [RelocTable::Plt, RelocTable::Dyn, RelocTable::Android] {
            self.for_each_reloc(table, |entry| {
                if elf_r_sym(entry.r_info) != symidx {
                    return Ok(());
                }
                let r_type = elf_r_type(entry.r_info);
                if r_type != R_GENERIC_JUMP_SLOT && r_type != R_GENERIC_GLOB_DAT {
                    return Ok(());
                }
                let addr = self.bias_addr.wrapping_add(entry.r_offset);
                // slot 必须落在映像自己的 PT_LOAD 段内
                if !self.is_addr_in_load_segments(addr) {
                    return Err(Errno::Format);
                }
                log::debug(format_args!(
                    "{}: {} slot {:p} in {}",
                    self.pathname,
                    symbol,
                    addr as *const (),
                    table.name(self.is_use_rela)
                ));
                if !slots.contains(&addr) {
                    slots.push(addr);
                }
                Ok(())
            })?;
        }
        Ok(slots)
    }

    fn for_each_reloc<F>(&self, table: RelocTable, mut f: F) -> Result<(), Errno>
    where
        F: FnMut(RelocEntry) -> Result<(), Errno>,
    {
        let (addr, size) = match table {
            RelocTable::Plt => (self.relplt, self.relplt_sz),
            RelocTable::Dyn => (self.reldyn, self.reldyn_sz),
            RelocTable::Android => (self.relandroid, self.relandroid_sz),
        };
        if addr == 0 || size == 0 {
            return Ok(());
        }

        if table == RelocTable::Android {
            let data = unsafe { slice::from_raw_parts(addr as *const u8, size) };
            let mut packed = PackedRelocIterator::new(data, self.is_use_rela)?;
            while let Some(reloc) = packed.next()? {
                f(RelocEntry {
                    r_offset: reloc.r_offset,
                    r_info: reloc.r_info,
                })?;
            }
            return Ok(());
        }

        if self.is_use_rela {
            let count = size / mem::size_of::<ElfRela>();
            for rela in unsafe { slice::from_raw_parts(addr as *const ElfRela, count) } {
                f(RelocEntry {
                    r_offset: rela.r_offset as usize,
                    r_info: rela.r_info,
                })?;
            }
        } else {
            let count = size / mem::size_of::<ElfRel>();
            for rel in unsafe { slice::from_raw_parts(addr as *const ElfRel, count) } {
                f(RelocEntry {
                    r_offset: rel.r_offset as usize,
                    r_info: rel.r_info,
                })?;
            }
        }
        Ok(())
    }
}
