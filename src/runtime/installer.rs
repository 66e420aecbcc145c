// slot 写入能力：registry 只通过这个 trait 触碰物理 slot
use crate::errno::Errno;
use crate::log;
use crate::platform::memory;
use once_cell::sync::Lazy;
use std::ptr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::state::MutexPoisonRecover;

/// 读写一个指针宽度的函数指针单元。
///
/// `slot` 必须是已映射、按指针对齐的地址，调用方保证其在调用期间有效。
pub trait SlotInstaller: Send + Sync {
    fn read_slot(&self, slot: usize) -> Result<usize, Errno>;

    /// 写入后应能读回同一个值，否则返回 `GotVerify`。
    fn write_slot(&self, slot: usize, value: usize) -> Result<(), Errno>;
}

// 同一页上的保护切换必须串行，否则两次恢复会互相覆盖
static PATCH_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// 默认实现：临时放开页保护后原子写入 GOT。
#[derive(Clone, Copy, Debug, Default)]
pub struct GotInstaller;

impl SlotInstaller for GotInstaller {
    fn read_slot(&self, slot: usize) -> Result<usize, Errno> {
        if slot == 0 || slot % std::mem::size_of::<usize>() != 0 {
            return Err(Errno::InvalidArg);
        }
        Ok(unsafe { ptr::read_volatile(slot as *const usize) })
    }

    // 修改内存保护 -> 原子写入 -> 验证 -> 恢复保护
    fn write_slot(&self, slot: usize, value: usize) -> Result<(), Errno> {
        if slot == 0 || slot % std::mem::size_of::<usize>() != 0 {
            return Err(Errno::InvalidArg);
        }
        let _guard = PATCH_LOCK.lock_or_poison();

        let old_prot = memory::get_addr_protect(slot, None)?;
        let writable_prot = memory::PROT_READ_FLAG | memory::PROT_WRITE_FLAG;
        let changed_protect = old_prot & memory::PROT_WRITE_FLAG == 0;
        if changed_protect {
            memory::set_addr_protect(slot, writable_prot)?;
        }

        let written = unsafe {
            let atomic_slot = &*(slot as *const AtomicUsize);
            atomic_slot.store(value, Ordering::SeqCst);
            atomic_slot.load(Ordering::SeqCst)
        };

        if changed_protect && let Err(err) = memory::set_addr_protect(slot, old_prot) {
            log::warn(format_args!("restore protection of slot 0x{slot:x} failed: {err}"));
        }
        if written != value {
            return Err(Errno::GotVerify);
        }
        memory::flush_data_barrier();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_writable_cell() {
        let cell = Box::new(AtomicUsize::new(0x1111));
        let slot = &*cell as *const AtomicUsize as usize;
        let installer = GotInstaller;
        assert_eq!(installer.read_slot(slot), Ok(0x1111));
        installer.write_slot(slot, 0x2222).unwrap();
        assert_eq!(cell.load(Ordering::SeqCst), 0x2222);
    }

    #[test]
    fn rejects_misaligned_slot() {
        let installer = GotInstaller;
        assert_eq!(installer.read_slot(0), Err(Errno::InvalidArg));
        assert_eq!(installer.write_slot(0x1003, 1), Err(Errno::InvalidArg));
    }
}
