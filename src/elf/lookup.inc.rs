// 符号名 -> 符号索引，通过 include! 嵌入 elf.rs

impl Elf {
    // GNU hash 只索引已定义符号，未定义（导入）符号需要额外线性扫描
    fn find_symidx_by_name(&self, symbol: &str) -> Option<u32> {
        let found = if self.is_use_gnu_hash {
            self.gnu_hash_lookup_def(symbol)
                .or_else(|| self.gnu_hash_lookup_undef(symbol))
        } else {
            self.elf_hash_lookup(symbol)
        };
        if let Some(symidx) = found {
            log::debug(format_args!("{}: {} at symidx {}", self.pathname, symbol, symidx));
        }
        found
    }

    // DT_HASH：bucket 定位后沿 chain 链表比较
    fn elf_hash_lookup(&self, symbol: &str) -> Option<u32> {
        if self.bucket_cnt == 0 {
            return None;
        }
        let hash = elf_hash(symbol.as_bytes());
        let mut i = unsafe { *self.bucket.add((hash % self.bucket_cnt) as usize) };
        while i != 0 {
            if unsafe { self.sym_name(i) } == Some(symbol) {
                return Some(i);
            }
            i = unsafe { *self.chain.add(i as usize) };
        }
        None
    }

    // bloom filter 快速排除 -> bucket 定位 -> chain 遍历，chain 最低位为 1 表示链尾
    fn gnu_hash_lookup_def(&self, symbol: &str) -> Option<u32> {
        if self.bucket_cnt == 0 {
            return None;
        }
        let hash = elf_gnu_hash(symbol.as_bytes());
        let word_bits = mem::size_of::<ElfAddr>() * 8;
        let word = unsafe { *self.bloom.add((hash as usize / word_bits) % self.bloom_sz as usize) };
        let mask = (1usize << (hash as usize % word_bits))
            | (1usize << ((hash >> self.bloom_shift) as usize % word_bits));
        if word & mask != mask {
            return None;
        }

        let mut i = unsafe { *self.bucket.add((hash % self.bucket_cnt) as usize) };
        if i < self.symoffset {
            return None;
        }
        loop {
            let symhash = unsafe { *self.chain.add((i - self.symoffset) as usize) };
            if (hash | 1) == (symhash | 1) && unsafe { self.sym_name(i) } == Some(symbol) {
                return Some(i);
            }
            if symhash & 1 != 0 {
                return None;
            }
            i += 1;
        }
    }

    fn gnu_hash_lookup_undef(&self, symbol: &str) -> Option<u32> {
        (0..self.symoffset).find(|&i| unsafe { self.sym_name(i) } == Some(symbol))
    }

    unsafe fn sym_name(&self, idx: u32) -> Option<&str> {
        let sym = &*self.symtab.add(idx as usize);
        CStr::from_ptr(self.strtab.add(sym.st_name as usize)).to_str().ok()
    }
}
