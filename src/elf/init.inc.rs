// ELF header 校验与 Elf 初始化，通过 include! 嵌入 elf.rs

// 校验内存中的 ELF header：magic、class、字节序、架构
// base_addr 不保证对齐，header 先按字节拷出
pub unsafe fn check_elf_header(base_addr: usize) -> Result<(), Errno> {
    let ehdr = ptr::read_unaligned(base_addr as *const ElfEhdr);
    if ehdr.e_ident[..SELFMAG] != ELFMAG
        || ehdr.e_ident[EI_CLASS] != ELFCLASS64
        || ehdr.e_ident[EI_DATA] != ELFDATA2LSB
        || ehdr.e_ident[EI_VERSION] != EV_CURRENT
    {
        return Err(Errno::Format);
    }
    if ehdr.e_type != ET_EXEC && ehdr.e_type != ET_DYN {
        return Err(Errno::Format);
    }
    if ehdr.e_machine != EXPECTED_MACHINE || ehdr.e_version as u8 != EV_CURRENT {
        return Err(Errno::Format);
    }
    Ok(())
}

impl Elf {
    // 从已加载映像解析 dynamic section；base_addr 必须指向含 ELF header 的首个 PT_LOAD 段
    pub unsafe fn init(base_addr: usize, pathname: &str) -> Result<Self, Errno> {
        if base_addr == 0 {
            return Err(Errno::InvalidArg);
        }
        check_elf_header(base_addr)?;

        let ehdr = base_addr as *const ElfEhdr;
        let phdr = (base_addr + (*ehdr).e_phoff as usize) as *const ElfPhdr;
        let phdrs = slice::from_raw_parts(phdr, (*ehdr).e_phnum as usize);

        let phdr0 = phdrs
            .iter()
            .find(|ph| ph.p_type == PT_LOAD && ph.p_offset == 0)
            .ok_or(Errno::Format)?;
        if base_addr < phdr0.p_vaddr as usize {
            return Err(Errno::Format);
        }
        let bias_addr = base_addr - phdr0.p_vaddr as usize;

        let dhdr = phdrs
            .iter()
            .find(|ph| ph.p_type == PT_DYNAMIC)
            .ok_or(Errno::Format)?;
        let dyn_section = (bias_addr + dhdr.p_vaddr as usize) as *const ElfDyn;
        let dyn_cnt = dhdr.p_memsz as usize / mem::size_of::<ElfDyn>();

        let mut elf = Elf {
            pathname: pathname.to_string(),
            base_addr,
            bias_addr,
            ehdr,
            phdr,
            strtab: ptr::null(),
            symtab: ptr::null(),
            relplt: 0,
            relplt_sz: 0,
            reldyn: 0,
            reldyn_sz: 0,
            relandroid: 0,
            relandroid_sz: 0,
            bucket: ptr::null(),
            bucket_cnt: 0,
            chain: ptr::null(),
            bloom: ptr::null(),
            bloom_sz: 0,
            bloom_shift: 0,
            symoffset: 0,
            is_use_gnu_hash: false,
            is_use_rela: false,
        };

        let mut sysv_hash = 0usize;
        let mut gnu_hash = 0usize;
        for dyn_entry in slice::from_raw_parts(dyn_section, dyn_cnt) {
            let value = dyn_entry.d_un as usize;
            match dyn_entry.d_tag {
                DT_NULL => break,
                DT_STRTAB => elf.strtab = elf.dyn_ptr(value)? as *const c_char,
                DT_SYMTAB => elf.symtab = elf.dyn_ptr(value)? as *const ElfSym,
                DT_PLTREL => elf.is_use_rela = value as i64 == DT_RELA,
                DT_JMPREL => elf.relplt = elf.dyn_ptr(value)?,
                DT_PLTRELSZ => elf.relplt_sz = value,
                DT_REL => elf.reldyn = elf.dyn_ptr(value)?,
                DT_RELA => {
                    elf.reldyn = elf.dyn_ptr(value)?;
                    elf.is_use_rela = true;
                }
                DT_RELSZ | DT_RELASZ => elf.reldyn_sz = value,
                DT_ANDROID_REL => elf.relandroid = elf.dyn_ptr(value)?,
                DT_ANDROID_RELA => {
                    elf.relandroid = elf.dyn_ptr(value)?;
                    elf.is_use_rela = true;
                }
                DT_ANDROID_RELSZ | DT_ANDROID_RELASZ => elf.relandroid_sz = value,
                DT_HASH => sysv_hash = elf.dyn_ptr(value)?,
                DT_GNU_HASH => gnu_hash = elf.dyn_ptr(value)?,
                _ => {}
            }
        }

        // GNU hash 布局：nbuckets | symoffset | bloom_sz | bloom_shift | bloom[] | buckets[] | chains[]
        if gnu_hash != 0 {
            let raw = gnu_hash as *const u32;
            elf.bucket_cnt = *raw;
            elf.symoffset = *raw.add(1);
            elf.bloom_sz = *raw.add(2);
            elf.bloom_shift = *raw.add(3);
            elf.bloom = raw.add(4) as *const usize;
            elf.bucket = elf.bloom.add(elf.bloom_sz as usize) as *const u32;
            elf.chain = elf.bucket.add(elf.bucket_cnt as usize);
            elf.is_use_gnu_hash = true;
        } else if sysv_hash != 0 {
            let raw = sysv_hash as *const u32;
            elf.bucket_cnt = *raw;
            elf.bucket = raw.add(2);
            elf.chain = elf.bucket.add(elf.bucket_cnt as usize);
        }

        // Android packed relocation 以 "APS2" 魔数开头
        if elf.relandroid != 0 {
            if elf.relandroid_sz < 4 {
                return Err(Errno::Format);
            }
            let header = slice::from_raw_parts(elf.relandroid as *const u8, 4);
            if header != b"APS2" {
                log::error(format_args!("{}: bad packed relocation magic", elf.pathname));
                return Err(Errno::Format);
            }
            elf.relandroid += 4;
            elf.relandroid_sz -= 4;
        }

        elf.check()?;

        log::debug(format_args!(
            "elf init: {} base=0x{:x} bias=0x{:x} ({} {} PLT:{} DYN:{} ANDROID:{})",
            elf.pathname,
            elf.base_addr,
            elf.bias_addr,
            if elf.is_use_rela { "RELA" } else { "REL" },
            if elf.is_use_gnu_hash { "GNU_HASH" } else { "ELF_HASH" },
            elf.relplt_sz,
            elf.reldyn_sz,
            elf.relandroid_sz
        ));
        Ok(elf)
    }

    // glibc 会把 dynamic section 中的指针重定位成绝对地址，bionic 保留虚拟地址
    fn dyn_ptr(&self, value: usize) -> Result<usize, Errno> {
        let addr = if value < self.base_addr {
            self.bias_addr + value
        } else {
            value
        };
        if addr < self.base_addr {
            return Err(Errno::Format);
        }
        Ok(addr)
    }

    fn check(&self) -> Result<(), Errno> {
        if self.strtab.is_null() || self.symtab.is_null() || self.bucket.is_null() || self.chain.is_null() {
            return Err(Errno::Format);
        }
        if self.is_use_gnu_hash && (self.bloom.is_null() || self.bloom_sz == 0) {
            return Err(Errno::Format);
        }
        Ok(())
    }

    // 判断地址是否落在某个 PT_LOAD 段内
    pub fn is_addr_in_load_segments(&self, addr: usize) -> bool {
        let phdrs = unsafe { slice::from_raw_parts(self.phdr, (*self.ehdr).e_phnum as usize) };
        phdrs.iter().filter(|phdr| phdr.p_type == PT_LOAD).any(|phdr| {
            let start = self.bias_addr + phdr.p_vaddr as usize;
            let end = start.saturating_add(phdr.p_memsz as usize);
            addr >= start && addr < end
        })
    }
}
