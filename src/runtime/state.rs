// registry 的核心状态定义：已触达的库、slot 及其 hook 链
use crate::elf::Elf;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use super::chain::HookChain;
use super::libraries::LibraryInfo;

// Mutex poison 恢复扩展，避免持锁线程 panic 后引发连锁 panic
pub(crate) trait MutexPoisonRecover<T> {
    fn lock_or_poison(&self) -> MutexGuard<'_, T>;
}

impl<T> MutexPoisonRecover<T> for Mutex<T> {
    fn lock_or_poison(&self) -> MutexGuard<'_, T> {
        self.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// hook_slot 直接登记的 slot 归属于这个虚拟库
pub(super) const SYNTHETIC_LIBRARY: &str = "[slots]";

// 库的唯一标识：同一路径被卸载后重新加载到别处视为新库
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(super) struct LibraryKey {
    pub(super) pathname: String,
    pub(super) base_addr: usize,
}

impl LibraryKey {
    pub(super) fn of(info: &LibraryInfo) -> Self {
        Self {
            pathname: info.pathname.clone(),
            base_addr: info.base_addr,
        }
    }

    pub(super) fn synthetic() -> Self {
        Self {
            pathname: SYNTHETIC_LIBRARY.to_string(),
            base_addr: 0,
        }
    }
}

impl LibraryRecord {
    pub(super) fn synthetic() -> Self {
        Self {
            info: LibraryInfo {
                pathname: SYNTHETIC_LIBRARY.to_string(),
                bias: 0,
                base_addr: 0,
                is_main: false,
                segments: Vec::new(),
            },
            elf: None,
            synthetic: true,
            slots: BTreeMap::new(),
        }
    }
}

// 单个 GOT slot 的运行时状态
pub(super) struct SlotState {
    pub(super) symbol: String,
    // 首次 hook 前 slot 里的值
    pub(super) orig_func: usize,
    pub(super) chain: HookChain,
    // 懒创建，slot 存活期间复用
    pub(super) hub: usize,
    // 最近一次写入 slot 的值
    pub(super) installed: usize,
}

impl SlotState {
    // 惰性绑定的 slot 中 installed 是 PLT 桩，orig_func 是解析后的最终地址
    pub(super) fn new(symbol: &str, orig_func: usize, installed: usize) -> Self {
        Self {
            symbol: symbol.to_string(),
            orig_func,
            chain: HookChain::default(),
            hub: 0,
            installed,
        }
    }
}

// 被 hook 操作触达过的库
pub(super) struct LibraryRecord {
    pub(super) info: LibraryInfo,
    // 解析失败或虚拟库时为 None
    pub(super) elf: Option<Elf>,
    pub(super) synthetic: bool,
    // slot 地址 -> 状态
    pub(super) slots: BTreeMap<usize, SlotState>,
}

// 由 HookRegistry::state 互斥锁保护
#[derive(Default)]
pub(super) struct RegistryState {
    pub(super) libraries: BTreeMap<LibraryKey, LibraryRecord>,
}

impl RegistryState {
    pub(super) fn find_slot(&self, slot_addr: usize) -> Option<&SlotState> {
        self.libraries
            .values()
            .find_map(|record| record.slots.get(&slot_addr))
    }
}
