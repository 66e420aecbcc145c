// Trampoline 页池：每个 trampoline 独占一页，释放的页短暂缓存以便复用
use crate::errno::Errno;
use crate::log;
use crate::platform::memory;
use crate::runtime::state::MutexPoisonRecover;
use once_cell::sync::Lazy;
use std::ptr;
use std::sync::Mutex;

// 超出部分直接 munmap
const MAX_CACHED_PAGES: usize = 8;

struct TrampoPool {
    page_size: usize,
    free_pages: Vec<usize>,
}

impl TrampoPool {
    fn new() -> Self {
        Self {
            page_size: memory::page_size(),
            free_pages: Vec::new(),
        }
    }

    // 返回可写的空白页
    fn alloc(&mut self) -> Result<usize, Errno> {
        while let Some(page) = self.free_pages.pop() {
            let ret = unsafe {
                libc::mprotect(
                    page as *mut libc::c_void,
                    self.page_size,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            };
            if ret != 0 {
                self.unmap(page);
                continue;
            }
            unsafe { ptr::write_bytes(page as *mut u8, 0, self.page_size) };
            return Ok(page);
        }

        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                self.page_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            log::error(format_args!("mmap trampoline page failed"));
            return Err(Errno::NewTrampo);
        }
        Ok(raw as usize)
    }

    fn free(&mut self, page: usize) {
        if page == 0 || page % self.page_size != 0 {
            return;
        }
        if self.free_pages.len() < MAX_CACHED_PAGES {
            self.free_pages.push(page);
        } else {
            self.unmap(page);
        }
    }

    fn unmap(&self, page: usize) {
        unsafe {
            libc::munmap(page as *mut libc::c_void, self.page_size);
        }
    }
}

static TRAMPO_POOL: Lazy<Mutex<TrampoPool>> = Lazy::new(|| Mutex::new(TrampoPool::new()));

pub(super) fn alloc_page() -> Result<usize, Errno> {
    TRAMPO_POOL.lock_or_poison().alloc()
}

pub(super) fn free_page(page: usize) {
    TRAMPO_POOL.lock_or_poison().free(page);
}
