// 已加载库的枚举，以及 slot 目标地址的归属判定
use crate::log;
use std::ffi::{CStr, CString, c_void};
use std::ptr;

// dl_iterate_phdr 报告的一个已加载映像
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct LibraryInfo {
    pub(crate) pathname: String,
    pub(crate) bias: usize,
    // 含 ELF header 的 PT_LOAD 段地址
    pub(crate) base_addr: usize,
    pub(crate) is_main: bool,
    // PT_LOAD 段的 [start, end)
    pub(crate) segments: Vec<(usize, usize)>,
}

impl LibraryInfo {
    // 不带目录的库名，如 libc.so.6；交给库过滤器的就是它
    pub(crate) fn name(&self) -> &str {
        self.pathname.rsplit('/').next().unwrap_or(&self.pathname)
    }

    pub(crate) fn contains(&self, addr: usize) -> bool {
        self.segments
            .iter()
            .any(|&(start, end)| addr >= start && addr < end)
    }
}

// vDSO 等没有文件的映像
fn is_pseudo_library(pathname: &str) -> bool {
    pathname.starts_with('[') || pathname.contains("linux-vdso") || pathname.contains("linux-gate")
}

fn main_executable_path() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|path| path.to_str().map(str::to_string))
        .unwrap_or_default()
}

struct IterateState {
    index: usize,
    libraries: Vec<LibraryInfo>,
}

// 按加载顺序枚举，第一个映像是主程序
pub(crate) fn enumerate_libraries() -> Vec<LibraryInfo> {
    unsafe extern "C" fn iterate_cb(
        info: *mut libc::dl_phdr_info,
        _size: usize,
        data: *mut c_void,
    ) -> libc::c_int {
        let state = unsafe { &mut *(data as *mut IterateState) };
        if info.is_null() {
            return 0;
        }
        let info = unsafe { &*info };
        let is_main = state.index == 0;
        state.index += 1;

        let raw_name = if info.dlpi_name.is_null() {
            ""
        } else {
            unsafe { CStr::from_ptr(info.dlpi_name) }.to_str().unwrap_or("")
        };
        let pathname = if raw_name.is_empty() && is_main {
            main_executable_path()
        } else {
            raw_name.to_string()
        };
        if pathname.is_empty() || is_pseudo_library(&pathname) {
            return 0;
        }

        let bias = info.dlpi_addr as usize;
        let phdrs: &[libc::Elf64_Phdr] = if info.dlpi_phdr.is_null() {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize) }
        };
        let mut base_addr = 0;
        let mut segments = Vec::new();
        for phdr in phdrs.iter().filter(|phdr| phdr.p_type == libc::PT_LOAD) {
            let start = bias.wrapping_add(phdr.p_vaddr as usize);
            if phdr.p_offset == 0 {
                base_addr = start;
            }
            segments.push((start, start.saturating_add(phdr.p_memsz as usize)));
        }
        if base_addr == 0 {
            return 0;
        }

        state.libraries.push(LibraryInfo {
            pathname,
            bias,
            base_addr,
            is_main,
            segments,
        });
        0
    }

    let mut state = IterateState {
        index: 0,
        libraries: Vec::new(),
    };
    unsafe {
        libc::dl_iterate_phdr(Some(iterate_cb), &mut state as *mut _ as *mut c_void);
    }
    state.libraries
}

// 惰性绑定的 slot 仍指向调用方自己的 PLT 桩，借助 RTLD_NOLOAD + dlsym 求出最终绑定地址
pub(crate) fn resolve_bound_symbol(library: &LibraryInfo, symbol: &str) -> Option<usize> {
    let symbol = CString::new(symbol).ok()?;
    let handle = if library.is_main {
        unsafe { libc::dlopen(ptr::null(), libc::RTLD_NOLOAD | libc::RTLD_LAZY) }
    } else {
        let pathname = CString::new(library.pathname.as_str()).ok()?;
        unsafe { libc::dlopen(pathname.as_ptr(), libc::RTLD_NOLOAD | libc::RTLD_LAZY) }
    };
    if handle.is_null() {
        log::debug(format_args!("noload open failed: {}", library.pathname));
        return None;
    }
    let addr = unsafe { libc::dlsym(handle, symbol.as_ptr()) } as usize;
    unsafe {
        libc::dlclose(handle);
    }
    if addr == 0 { None } else { Some(addr) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[inline(never)]
    fn local_marker() -> usize {
        7
    }

    #[test]
    fn main_executable_comes_first() {
        let libraries = enumerate_libraries();
        let main = libraries.first().expect("main executable listed");
        assert!(main.is_main);
        assert_eq!(main.pathname, main_executable_path());
        assert!(main.contains(local_marker as *const () as usize));
        assert!(main.contains(main.base_addr));
        assert_eq!(local_marker(), 7);
    }

    #[test]
    fn name_drops_the_directory() {
        let mut lib = LibraryInfo {
            pathname: "/system/lib64/libc.so".to_string(),
            bias: 0,
            base_addr: 0,
            is_main: false,
            segments: Vec::new(),
        };
        assert_eq!(lib.name(), "libc.so");
        lib.pathname = "libbare.so.1".to_string();
        assert_eq!(lib.name(), "libbare.so.1");
    }

    #[test]
    fn pseudo_libraries_are_skipped() {
        assert!(is_pseudo_library("linux-vdso.so.1"));
        assert!(is_pseudo_library("[vdso]"));
        assert!(!is_pseudo_library("/lib/libc.so.6"));
        let libraries = enumerate_libraries();
        assert!(libraries.iter().all(|lib| !is_pseudo_library(&lib.pathname)));
        assert_eq!(libraries.iter().filter(|lib| lib.is_main).count(), 1);
    }

    #[test]
    fn resolves_libc_symbol_through_noload() {
        let libraries = enumerate_libraries();
        let libc_lib = libraries
            .iter()
            .find(|lib| crate::runtime::rules::library_match(&lib.pathname, lib.base_addr, "libc.so"))
            .expect("libc loaded");
        let addr = resolve_bound_symbol(libc_lib, "getpid").expect("getpid resolvable");
        assert!(libc_lib.contains(addr));
        assert_eq!(resolve_bound_symbol(libc_lib, "plt_chain_no_such_symbol"), None);
    }
}
