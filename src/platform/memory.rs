// 内存页面保护属性的读取与修改，通过解析 /proc/self/maps 获取权限

use crate::errno::Errno;
use crate::log;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::atomic::{Ordering, fence};

pub const PROT_READ_FLAG: u32 = 0x1;
pub const PROT_WRITE_FLAG: u32 = 0x2;
pub const PROT_EXEC_FLAG: u32 = 0x4;

// 一行 maps 记录中与权限查询相关的字段
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct MapsRange {
    start: usize,
    end: usize,
    prot: u32,
}

// 查询 [addr, addr+len) 的保护属性
// pathname 仅用于加速过滤；匿名映射（如 .bss 尾部）没有路径时回退纯地址查找
pub fn get_mem_protect(addr: usize, len: usize, pathname: Option<&str>) -> Result<u32, Errno> {
    if let Some(path) = pathname
        && let Ok(prot) = scan_maps_for_protect(addr, len, Some(path))
    {
        return Ok(prot);
    }
    scan_maps_for_protect(addr, len, None)
}

pub fn get_addr_protect(addr: usize, pathname: Option<&str>) -> Result<u32, Errno> {
    get_mem_protect(addr, std::mem::size_of::<usize>(), pathname)
}

fn scan_maps_for_protect(addr: usize, len: usize, pathname: Option<&str>) -> Result<u32, Errno> {
    let file = File::open("/proc/self/maps").map_err(|_| Errno::BadMaps)?;
    let reader = BufReader::new(file);
    let mut ranges = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(|_| Errno::BadMaps)?;
        if let Some(path) = pathname
            && !line.contains(path)
        {
            continue;
        }
        if let Some(range) = parse_maps_line(&line) {
            ranges.push(range);
        }
    }
    protect_of(&ranges, addr, len).ok_or(Errno::GetProt)
}

// 解析 "start-end perms ..."，只接受私有映射
fn parse_maps_line(line: &str) -> Option<MapsRange> {
    let mut parts = line.split_whitespace();
    let range = parts.next()?;
    let perm = parts.next()?.as_bytes();
    if perm.len() < 4 || perm[3] != b'p' {
        return None;
    }
    let (start, end) = range.split_once('-')?;
    let start = usize::from_str_radix(start, 16).ok()?;
    let end = usize::from_str_radix(end, 16).ok()?;

    let mut prot = 0;
    if perm[0] == b'r' {
        prot |= PROT_READ_FLAG;
    }
    if perm[1] == b'w' {
        prot |= PROT_WRITE_FLAG;
    }
    if perm[2] == b'x' {
        prot |= PROT_EXEC_FLAG;
    }
    Some(MapsRange { start, end, prot })
}

// 跨多个连续映射时取权限交集，中间出现空洞视为失败
fn protect_of(ranges: &[MapsRange], addr: usize, len: usize) -> Option<u32> {
    let end_addr = addr.saturating_add(len);
    let mut cursor = addr;
    let mut prot: Option<u32> = None;
    while cursor < end_addr {
        let range = ranges
            .iter()
            .find(|range| cursor >= range.start && cursor < range.end)?;
        prot = Some(prot.map_or(range.prot, |acc| acc & range.prot));
        cursor = range.end;
    }
    prot
}

// 修改地址所在页面的保护属性
pub fn set_addr_protect(addr: usize, prot: u32) -> Result<(), Errno> {
    let (start, len) = page_bounds(addr, std::mem::size_of::<usize>());
    let result = unsafe { libc::mprotect(start as *mut libc::c_void, len, prot as i32) };
    if result != 0 {
        let err = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        log::error(format_args!("mprotect 0x{start:x}+0x{len:x} prot={prot} failed: {err}"));
        return Err(Errno::SetProt);
    }
    Ok(())
}

// 数据写入后的屏障；GOT 是数据而非指令，不需要刷新 icache
pub fn flush_data_barrier() {
    fence(Ordering::SeqCst);
}

// 刷新新写入代码的指令缓存
pub fn flush_instruction_cache_range(start: usize, end: usize) {
    if start >= end {
        return;
    }

    #[cfg(target_arch = "aarch64")]
    {
        let (dcache_line, icache_line) = cache_line_size();
        let mut addr = align_down(start, dcache_line);
        while addr < end {
            unsafe {
                core::arch::asm!("dc cvau, {}", in(reg) addr, options(nostack, preserves_flags));
            }
            addr = addr.saturating_add(dcache_line);
        }
        unsafe {
            core::arch::asm!("dsb ish", options(nostack, preserves_flags));
        }

        let mut addr = align_down(start, icache_line);
        while addr < end {
            unsafe {
                core::arch::asm!("ic ivau, {}", in(reg) addr, options(nostack, preserves_flags));
            }
            addr = addr.saturating_add(icache_line);
        }
        unsafe {
            core::arch::asm!("dsb ish", options(nostack, preserves_flags));
            core::arch::asm!("isb", options(nostack, preserves_flags));
        }
    }

    #[cfg(target_arch = "x86_64")]
    {
        fence(Ordering::SeqCst);
    }
}

pub fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 { 4096 } else { size as usize }
}

// 覆盖 [addr, addr+len) 的页对齐区间
fn page_bounds(addr: usize, len: usize) -> (usize, usize) {
    let page_size = page_size();
    let page_mask = !(page_size - 1);
    let start = addr & page_mask;
    let end = (addr + len.max(1) - 1) & page_mask;
    (start, end + page_size - start)
}

// CTR_EL0 -> (dcache_line_size, icache_line_size)
#[cfg(target_arch = "aarch64")]
fn cache_line_size() -> (usize, usize) {
    let ctr_el0: usize;
    unsafe {
        core::arch::asm!("mrs {}, ctr_el0", out(reg) ctr_el0, options(nomem, nostack, preserves_flags));
    }
    let dcache_line = 4usize << ((ctr_el0 >> 16) & 0x0f);
    let icache_line = 4usize << (ctr_el0 & 0x0f);
    (dcache_line.max(4), icache_line.max(4))
}

#[cfg(target_arch = "aarch64")]
fn align_down(addr: usize, align: usize) -> usize {
    addr & !(align.saturating_sub(1))
}
