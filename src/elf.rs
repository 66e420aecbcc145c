// 内存中 ELF 映像的解析：dynamic section、符号查找与 GOT slot 定位

use crate::errno::Errno;
use crate::log;
use std::ffi::{CStr, c_char};
use std::mem;
use std::ptr;
use std::slice;

// ELF 符号哈希算法
mod hash;
// Android packed relocation (SLEB128) 解码
mod packed;
// 重定位条目的 r_sym / r_type 提取
mod reloc;

use hash::{elf_gnu_hash, elf_hash};
use packed::PackedRelocIterator;
use reloc::{elf_r_sym, elf_r_type};

// ELF header e_ident 相关常量
const EI_NIDENT: usize = 16;
const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const EI_VERSION: usize = 6;

const ELFMAG: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const SELFMAG: usize = 4;

const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u8 = 1;

const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;
const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;

// dynamic section 标签常量
const DT_NULL: i64 = 0;
const DT_PLTRELSZ: i64 = 2;
const DT_HASH: i64 = 4;
const DT_STRTAB: i64 = 5;
const DT_SYMTAB: i64 = 6;
const DT_RELA: i64 = 7;
const DT_RELASZ: i64 = 8;
const DT_REL: i64 = 17;
const DT_RELSZ: i64 = 18;
const DT_PLTREL: i64 = 20;
const DT_JMPREL: i64 = 23;
const DT_GNU_HASH: i64 = 0x6ffffef5;

// Android 私有 packed relocation 标签
const DT_ANDROID_REL: i64 = 0x6000_000f;
const DT_ANDROID_RELA: i64 = 0x6000_0010;
const DT_ANDROID_RELSZ: i64 = 0x6000_0011;
const DT_ANDROID_RELASZ: i64 = 0x6000_0012;

// 机器号与 GOT slot 对应的重定位类型
#[cfg(target_arch = "aarch64")]
const EXPECTED_MACHINE: u16 = 183; // EM_AARCH64
#[cfg(target_arch = "aarch64")]
const R_GENERIC_JUMP_SLOT: u32 = 1026;
#[cfg(target_arch = "aarch64")]
const R_GENERIC_GLOB_DAT: u32 = 1025;

#[cfg(target_arch = "x86_64")]
const EXPECTED_MACHINE: u16 = 62; // EM_X86_64
#[cfg(target_arch = "x86_64")]
const R_GENERIC_JUMP_SLOT: u32 = 7;
#[cfg(target_arch = "x86_64")]
const R_GENERIC_GLOB_DAT: u32 = 6;

// ELF64 基本类型别名
type ElfAddr = u64;
type ElfOff = u64;
type ElfWord = u32;
type ElfXword = u64;
type ElfSxword = i64;
type ElfHalf = u16;

// ELF64 文件头，与 C 结构体 Elf64_Ehdr 内存布局一致
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct ElfEhdr {
    e_ident: [u8; EI_NIDENT],
    e_type: ElfHalf,
    e_machine: ElfHalf,
    e_version: ElfWord,
    e_entry: ElfAddr,
    e_phoff: ElfOff,
    e_shoff: ElfOff,
    e_flags: ElfWord,
    e_ehsize: ElfHalf,
    e_phentsize: ElfHalf,
    e_phnum: ElfHalf,
    e_shentsize: ElfHalf,
    e_shnum: ElfHalf,
    e_shstrndx: ElfHalf,
}

// ELF64 程序头，描述段的加载信息
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct ElfPhdr {
    p_type: ElfWord,
    p_flags: ElfWord,
    p_offset: ElfOff,
    p_vaddr: ElfAddr,
    p_paddr: ElfAddr,
    p_filesz: ElfXword,
    p_memsz: ElfXword,
    p_align: ElfXword,
}

// ELF64 动态段条目
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct ElfDyn {
    d_tag: ElfSxword,
    d_un: ElfXword,
}

// ELF64 符号表条目
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct ElfSym {
    st_name: ElfWord,
    st_info: u8,
    st_other: u8,
    st_shndx: ElfHalf,
    st_value: ElfAddr,
    st_size: ElfXword,
}

// ELF64 REL 重定位条目（无 addend）
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct ElfRel {
    r_offset: ElfAddr,
    r_info: ElfXword,
}

// ELF64 RELA 重定位条目（含 addend）
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct ElfRela {
    r_offset: ElfAddr,
    r_info: ElfXword,
    r_addend: ElfSxword,
}

// 已解析的 ELF 映像，只保存指向已映射内存的指针
pub struct Elf {
    pathname: String,
    // 首个 PT_LOAD 段（含 ELF header）的内存地址
    base_addr: usize,
    // 内存地址与 ELF 虚拟地址之间的偏移量，非 PIE 可执行文件为 0
    bias_addr: usize,
    ehdr: *const ElfEhdr,
    phdr: *const ElfPhdr,
    strtab: *const c_char,
    symtab: *const ElfSym,
    // .rel(a).plt 段地址与大小
    relplt: usize,
    relplt_sz: usize,
    // .rel(a).dyn 段地址与大小
    reldyn: usize,
    reldyn_sz: usize,
    // Android packed relocation 段地址与大小（已跳过 APS2 头）
    relandroid: usize,
    relandroid_sz: usize,
    // hash 表的 bucket 数组与计数
    bucket: *const u32,
    bucket_cnt: u32,
    // hash 表的 chain 数组
    chain: *const u32,
    // GNU hash 的 bloom filter 数组与参数
    bloom: *const usize,
    bloom_sz: u32,
    bloom_shift: u32,
    // GNU hash 中已排序符号的起始索引
    symoffset: u32,
    is_use_gnu_hash: bool,
    is_use_rela: bool,
}

// 指针只指向所属库的只读元数据，库卸载前由 registry 丢弃
unsafe impl Send for Elf {}

// 三类重定位表
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum RelocTable {
    Plt,
    Dyn,
    Android,
}

impl RelocTable {
    fn name(self, is_use_rela: bool) -> &'static str {
        match (self, is_use_rela) {
            (Self::Plt, true) => ".rela.plt",
            (Self::Plt, false) => ".rel.plt",
            (Self::Dyn, true) => ".rela.dyn",
            (Self::Dyn, false) => ".rel.dyn",
            (Self::Android, true) => ".rela.android",
            (Self::Android, false) => ".rel.android",
        }
    }
}

include!("elf/init.inc.rs");
include!("elf/lookup.inc.rs");
include!("elf/slots.inc.rs");

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::{CStr, c_void};

    unsafe extern "C" {
        fn clock() -> libc::clock_t;
    }

    #[inline(never)]
    fn touch_clock() -> libc::clock_t {
        unsafe { clock() }
    }

    // 通过映像内任一地址取得 (路径, 基址)
    fn image_of(addr: *const c_void) -> (String, usize) {
        let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
        assert_ne!(unsafe { libc::dladdr(addr, &mut info) }, 0);
        let path = unsafe { CStr::from_ptr(info.dli_fname) }.to_string_lossy().into_owned();
        (path, info.dli_fbase as usize)
    }

    fn open_image(addr: *const c_void) -> Elf {
        let (path, base) = image_of(addr);
        unsafe { Elf::init(base, &path) }.expect("parse loaded image")
    }

    #[test]
    fn own_clock_import_has_a_got_slot() {
        assert!(touch_clock() >= 0);
        let elf = open_image(touch_clock as *const c_void);
        let slots = elf.find_got_slots("clock").unwrap();
        assert!(!slots.is_empty());
        for slot in slots {
            assert!(slot >= elf.base_addr);
            assert!(elf.is_addr_in_load_segments(slot));
        }
        assert_eq!(elf.find_got_slots("plt_chain_symbol_nobody_imports"), Ok(Vec::new()));
        assert_eq!(elf.find_got_slots(""), Err(Errno::InvalidArg));
    }

    #[test]
    fn load_segments_cover_only_the_image() {
        let libc_clock = unsafe { libc::dlsym(libc::RTLD_DEFAULT, c"clock".as_ptr()) };
        assert!(!libc_clock.is_null());
        let elf = open_image(libc_clock);
        assert!(!elf.pathname.is_empty());
        assert!(elf.is_addr_in_load_segments(libc_clock as usize));
        assert!(!elf.is_addr_in_load_segments(touch_clock as usize));
    }

    #[test]
    fn rejects_non_elf_memory() {
        static NOT_ELF: [u8; 64] = [0u8; 64];
        let result = unsafe { Elf::init(NOT_ELF.as_ptr() as usize, "not-elf") };
        assert_eq!(result.err(), Some(Errno::Format));
    }

    #[test]
    fn header_check_tolerates_unaligned_base() {
        let buf = [0u8; 128];
        for offset in 1..8 {
            let base = buf.as_ptr() as usize + offset;
            assert_eq!(unsafe { check_elf_header(base) }, Err(Errno::Format));
        }
        // 合法 header 拷到奇数地址上同样能通过校验
        let (_, own_base) = image_of(touch_clock as *const c_void);
        let mut copy = [0u8; 128];
        let header_len = std::mem::size_of::<ElfEhdr>();
        let own_header = unsafe { std::slice::from_raw_parts(own_base as *const u8, header_len) };
        copy[3..3 + header_len].copy_from_slice(own_header);
        assert_eq!(unsafe { check_elf_header(copy.as_ptr() as usize + 3) }, Ok(()));
    }
}
