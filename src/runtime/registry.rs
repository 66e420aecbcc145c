// hook 注册中心：记录每个库、每个 slot 上的 hook 链，并把链的变化提交到物理 slot
//
// 提交顺序保证任何时刻 slot 里的值都与某个完整的链状态一致：
// 切到 trampoline 时先发布链快照再写 slot；离开 trampoline 时先写 slot 再清空快照。
// 提交失败时恢复变更前的链并重新提交，slot 保持原状。
use crate::api::PltHookSpec;
use crate::elf::Elf;
use crate::errno::Errno;
use crate::log;
use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::ffi::c_void;
use std::sync::{Mutex, MutexGuard};

use super::callback_ctx::{in_filter_callback, run_filter};
use super::chain::{PushOutcome, RemoveOutcome, SlotTarget};
use super::config::RegistryConfig;
use super::hub;
use super::installer::{GotInstaller, SlotInstaller};
use super::libraries::{self, LibraryInfo};
use super::rules::library_match;
use super::state::{LibraryKey, LibraryRecord, MutexPoisonRecover, RegistryState, SlotState};

#[cfg(test)]
mod tests;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Op {
    Hook,
    Unhook,
}

/// 进程内的 PLT hook 注册中心。
///
/// 所有变更在同一把锁下串行执行；经过 trampoline 的调用不需要这把锁。
/// 析构时把仍然加载着的库中被改写的 slot 恢复为原值。
pub struct HookRegistry {
    state: Mutex<RegistryState>,
    installer: Box<dyn SlotInstaller>,
    config: RegistryConfig,
}

static GLOBAL: Lazy<HookRegistry> = Lazy::new(|| {
    let config = RegistryConfig::from_env();
    if config.debug {
        log::set_debug_enabled(true);
    }
    HookRegistry::new(config)
});

fn open_record(lib: &LibraryInfo) -> LibraryRecord {
    let elf = match unsafe { Elf::init(lib.base_addr, &lib.pathname) } {
        Ok(elf) => Some(elf),
        Err(err) => {
            log::warn(format_args!("parse {} failed: {}", lib.pathname, err));
            None
        }
    };
    log::debug(format_args!(
        "track {} base=0x{:x} bias=0x{:x}",
        lib.pathname, lib.base_addr, lib.bias
    ));
    LibraryRecord {
        info: lib.clone(),
        elf,
        synthetic: false,
        slots: BTreeMap::new(),
    }
}

// 指向调用方自身的值是尚未绑定的 PLT 桩
fn bound_target(lib: Option<&LibraryInfo>, symbol: &str, live: usize) -> usize {
    match lib {
        Some(lib) if lib.contains(live) => libraries::resolve_bound_symbol(lib, symbol).unwrap_or(live),
        _ => live,
    }
}

fn targets_callee(libs: &[LibraryInfo], callee: &str, target: usize) -> bool {
    libs.iter()
        .any(|lib| library_match(&lib.pathname, lib.base_addr, callee) && lib.contains(target))
}

fn validate_spec(spec: &PltHookSpec) -> Result<(), Errno> {
    if spec.symbol.is_empty() || spec.hook_fn.is_null() {
        return Err(Errno::InvalidArg);
    }
    Ok(())
}

impl HookRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self::with_installer(config, Box::new(GotInstaller))
    }

    pub fn with_installer(config: RegistryConfig, installer: Box<dyn SlotInstaller>) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            installer,
            config,
        }
    }

    /// 首次使用时按环境变量构建的进程级实例。
    pub fn global() -> &'static HookRegistry {
        &GLOBAL
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn hook_single_lib(&self, library: &str, specs: &mut [PltHookSpec]) -> usize {
        self.single_lib(library, specs, Op::Hook)
    }

    pub fn unhook_single_lib(&self, library: &str, specs: &mut [PltHookSpec]) -> usize {
        self.single_lib(library, specs, Op::Unhook)
    }

    /// `filter(library_name, symbol)` 返回 true 时才处理该组合；库名不含目录，如 `libc.so.6`。
    pub fn hook_all_libs<F>(&self, specs: &mut [PltHookSpec], mut filter: F) -> usize
    where
        F: FnMut(&str, &str) -> bool,
    {
        self.all_libs(specs, &mut filter, Op::Hook)
    }

    pub fn unhook_all_libs<F>(&self, specs: &mut [PltHookSpec], mut filter: F) -> usize
    where
        F: FnMut(&str, &str) -> bool,
    {
        self.all_libs(specs, &mut filter, Op::Unhook)
    }

    /// 直接 hook 一个函数指针单元。已被某个库记录的 GOT slot 沿用该记录。
    ///
    /// # Safety
    /// `slot` 必须是有效、对齐的函数指针单元，且在 hook 存续期间保持有效。
    pub unsafe fn hook_slot(
        &self,
        slot: usize,
        symbol: &str,
        hook_fn: *mut c_void,
        no_chaining: bool,
    ) -> Result<(), Errno> {
        if slot == 0 || hook_fn.is_null() {
            return Err(Errno::InvalidArg);
        }
        let mut state = self.lock_state()?;
        let libraries = &mut state.libraries;

        let key = libraries
            .iter()
            .find(|(_, record)| record.slots.contains_key(&slot))
            .map(|(key, _)| key.clone())
            .unwrap_or_else(LibraryKey::synthetic);
        let record = libraries.entry(key).or_insert_with(LibraryRecord::synthetic);
        let lib = (!record.synthetic).then_some(&record.info);

        let slot_state = match record.slots.entry(slot) {
            Entry::Occupied(entry) => {
                let slot_state = entry.into_mut();
                self.resync(lib, slot, slot_state)?;
                slot_state
            }
            Entry::Vacant(entry) => {
                let live = self.installer.read_slot(slot)?;
                entry.insert(SlotState::new(symbol, bound_target(lib, symbol, live), live))
            }
        };
        self.push_hook(slot, slot_state, hook_fn as usize, no_chaining)
    }

    /// 返回 Ok(false) 表示该函数不在此 slot 的链上。
    ///
    /// # Safety
    /// 同 [`HookRegistry::hook_slot`]。
    pub unsafe fn unhook_slot(&self, slot: usize, hook_fn: *mut c_void) -> Result<bool, Errno> {
        if slot == 0 || hook_fn.is_null() {
            return Err(Errno::InvalidArg);
        }
        let mut state = self.lock_state()?;
        let Some(record) = state
            .libraries
            .values_mut()
            .find(|record| record.slots.contains_key(&slot))
        else {
            return Ok(false);
        };
        let lib = (!record.synthetic).then_some(&record.info);
        let Some(slot_state) = record.slots.get_mut(&slot) else {
            return Ok(false);
        };
        self.resync(lib, slot, slot_state)?;
        self.pop_hook(slot, slot_state, hook_fn as usize)
    }

    pub fn slot_target(&self, slot: usize) -> Option<SlotTarget> {
        let state = self.lock_state().ok()?;
        state.find_slot(slot).map(|slot_state| slot_state.chain.target())
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, RegistryState>, Errno> {
        if in_filter_callback() {
            log::error(format_args!("registry re-entered from a library filter"));
            return Err(Errno::Reentrant);
        }
        Ok(self.state.lock_or_poison())
    }

    fn single_lib(&self, library: &str, specs: &mut [PltHookSpec], op: Op) -> usize {
        let Ok(mut state) = self.lock_state() else {
            return specs.len();
        };
        let libs = libraries::enumerate_libraries();
        self.prune_unloaded(&mut state, &libs);

        let Some(lib) = libs
            .iter()
            .find(|lib| library_match(&lib.pathname, lib.base_addr, library))
        else {
            log::warn(format_args!("library {library} is not loaded"));
            return match op {
                Op::Hook => specs.len(),
                Op::Unhook => 0,
            };
        };
        specs
            .iter_mut()
            .map(|spec| self.apply(&mut state, lib, &libs, spec, op))
            .sum()
    }

    fn all_libs(
        &self,
        specs: &mut [PltHookSpec],
        filter: &mut dyn FnMut(&str, &str) -> bool,
        op: Op,
    ) -> usize {
        let Ok(mut state) = self.lock_state() else {
            return specs.len();
        };
        let libs = libraries::enumerate_libraries();
        self.prune_unloaded(&mut state, &libs);

        let mut failures = 0;
        for lib in &libs {
            for spec in specs.iter_mut() {
                if !run_filter(|| filter(lib.name(), &spec.symbol)) {
                    continue;
                }
                failures += self.apply(&mut state, lib, &libs, spec, op);
            }
        }
        failures
    }

    // 返回失败数
    fn apply(
        &self,
        state: &mut RegistryState,
        lib: &LibraryInfo,
        libs: &[LibraryInfo],
        spec: &mut PltHookSpec,
        op: Op,
    ) -> usize {
        if let Err(err) = validate_spec(spec) {
            log::warn(format_args!("reject spec {:?}: {}", spec.symbol, err));
            return 1;
        }
        match op {
            Op::Hook => self.hook_in_library(state, lib, libs, spec),
            Op::Unhook => self.unhook_in_library(state, lib, spec),
        }
    }

    fn hook_in_library(
        &self,
        state: &mut RegistryState,
        lib: &LibraryInfo,
        libs: &[LibraryInfo],
        spec: &mut PltHookSpec,
    ) -> usize {
        let record = state
            .libraries
            .entry(LibraryKey::of(lib))
            .or_insert_with(|| open_record(lib));
        let LibraryRecord {
            info, elf, slots, ..
        } = record;
        let info = &*info;
        let Some(elf) = elf.as_ref() else {
            return 1;
        };

        let slot_addrs = match elf.find_got_slots(&spec.symbol) {
            Ok(slot_addrs) => slot_addrs,
            Err(err) => {
                log::error(format_args!("{}: find {} failed: {}", info.pathname, spec.symbol, err));
                return 1;
            }
        };
        if slot_addrs.is_empty() {
            log::debug(format_args!("{}: {} not imported", info.pathname, spec.symbol));
            return 0;
        }

        let mut failures = 0;
        for slot_addr in slot_addrs {
            let slot = match slots.entry(slot_addr) {
                Entry::Occupied(entry) => {
                    let slot = entry.into_mut();
                    if let Err(err) = self.resync(Some(info), slot_addr, slot) {
                        log::error(format_args!("read slot 0x{slot_addr:x} failed: {err}"));
                        failures += 1;
                        continue;
                    }
                    slot
                }
                Entry::Vacant(entry) => match self.installer.read_slot(slot_addr) {
                    Ok(live) => entry.insert(SlotState::new(
                        &spec.symbol,
                        bound_target(Some(info), &spec.symbol, live),
                        live,
                    )),
                    Err(err) => {
                        log::error(format_args!("read slot 0x{slot_addr:x} failed: {err}"));
                        failures += 1;
                        continue;
                    }
                },
            };

            if let Some(callee) = spec.callee.as_deref()
                && !targets_callee(libs, callee, slot.orig_func)
            {
                log::debug(format_args!(
                    "{}: {} slot 0x{:x} bound outside {}",
                    info.pathname, spec.symbol, slot_addr, callee
                ));
                continue;
            }

            match self.push_hook(slot_addr, slot, spec.hook_fn as usize, spec.no_chaining) {
                Ok(()) => spec.hook_result += 1,
                Err(err) => {
                    log::warn(format_args!(
                        "{}: hook {} at 0x{:x} failed: {}",
                        info.pathname, spec.symbol, slot_addr, err
                    ));
                    failures += 1;
                }
            }
        }
        failures
    }

    // 只处理已记录的 slot，不重新解析 ELF
    fn unhook_in_library(&self, state: &mut RegistryState, lib: &LibraryInfo, spec: &mut PltHookSpec) -> usize {
        let Some(record) = state.libraries.get_mut(&LibraryKey::of(lib)) else {
            return 0;
        };
        let LibraryRecord { info, slots, .. } = record;
        let info = &*info;

        let mut failures = 0;
        for (&slot_addr, slot) in slots.iter_mut().filter(|(_, slot)| slot.symbol == spec.symbol) {
            let result = self
                .resync(Some(info), slot_addr, slot)
                .and_then(|()| self.pop_hook(slot_addr, slot, spec.hook_fn as usize));
            match result {
                Ok(true) => spec.hook_result += 1,
                Ok(false) => {}
                Err(err) => {
                    log::warn(format_args!(
                        "{}: unhook {} at 0x{:x} failed: {}",
                        info.pathname, spec.symbol, slot_addr, err
                    ));
                    failures += 1;
                }
            }
        }
        failures
    }

    // slot 被外部改写过时：链为空则采纳新值为原函数，否则下一次提交会写回
    fn resync(&self, lib: Option<&LibraryInfo>, slot_addr: usize, slot: &mut SlotState) -> Result<(), Errno> {
        let live = self.installer.read_slot(slot_addr)?;
        if live == slot.installed {
            return Ok(());
        }
        if slot.chain.is_empty() {
            slot.orig_func = bound_target(lib, &slot.symbol, live);
            log::info(format_args!(
                "slot 0x{:x} ({}) rebound to 0x{:x}",
                slot_addr, slot.symbol, slot.orig_func
            ));
        } else {
            log::warn(format_args!(
                "slot 0x{:x} ({}) overwritten externally with 0x{:x}",
                slot_addr, slot.symbol, live
            ));
        }
        slot.installed = live;
        Ok(())
    }

    fn push_hook(
        &self,
        slot_addr: usize,
        slot: &mut SlotState,
        hook: usize,
        no_chaining: bool,
    ) -> Result<(), Errno> {
        let saved = slot.chain.clone();
        match slot.chain.try_push(hook, no_chaining) {
            PushOutcome::Conflict => return Err(Errno::Conflict),
            PushOutcome::Shared => {
                log::debug(format_args!("{}: 0x{hook:x} already chained", slot.symbol));
                return Ok(());
            }
            PushOutcome::Installed => {}
        }
        if let Err(err) = self.commit(slot_addr, slot) {
            slot.chain = saved;
            if let Err(restore_err) = self.commit(slot_addr, slot) {
                log::error(format_args!("restore slot 0x{slot_addr:x} failed: {restore_err}"));
            }
            return Err(err);
        }
        if no_chaining {
            hub::note_no_chaining(hook, true);
        }
        log::debug(format_args!(
            "{}: slot 0x{:x} += 0x{:x} depth={}",
            slot.symbol,
            slot_addr,
            hook,
            slot.chain.len()
        ));
        Ok(())
    }

    fn pop_hook(&self, slot_addr: usize, slot: &mut SlotState, hook: usize) -> Result<bool, Errno> {
        let saved = slot.chain.clone();
        let no_chaining = match slot.chain.remove(hook) {
            RemoveOutcome::NotFound => return Ok(false),
            RemoveOutcome::Removed { unlinked: false, .. } => return Ok(true),
            RemoveOutcome::Removed {
                unlinked: true,
                no_chaining,
            } => no_chaining,
        };
        if let Err(err) = self.commit(slot_addr, slot) {
            slot.chain = saved;
            if let Err(restore_err) = self.commit(slot_addr, slot) {
                log::error(format_args!("restore slot 0x{slot_addr:x} failed: {restore_err}"));
            }
            return Err(err);
        }
        if no_chaining {
            hub::note_no_chaining(hook, false);
        }
        log::debug(format_args!(
            "{}: slot 0x{:x} -= 0x{:x} depth={}",
            slot.symbol,
            slot_addr,
            hook,
            slot.chain.len()
        ));
        Ok(true)
    }

    fn commit(&self, slot_addr: usize, slot: &mut SlotState) -> Result<(), Errno> {
        let delay = self.config.reclaim_delay;
        let orig = slot.orig_func;
        match slot.chain.target() {
            SlotTarget::Trampoline => {
                if slot.hub == 0 {
                    slot.hub = hub::create_hub(orig)?;
                }
                hub::publish_chain(slot.hub, &slot.chain.dispatch_order(), orig, delay);
                self.install(slot_addr, slot, hub::hub_trampo(slot.hub))
            }
            SlotTarget::Direct(func) => {
                self.install(slot_addr, slot, func)?;
                hub::publish_chain(slot.hub, &[], orig, delay);
                Ok(())
            }
            SlotTarget::Original => {
                self.install(slot_addr, slot, orig)?;
                hub::publish_chain(slot.hub, &[], orig, delay);
                Ok(())
            }
        }
    }

    fn install(&self, slot_addr: usize, slot: &mut SlotState, value: usize) -> Result<(), Errno> {
        if slot.installed == value {
            return Ok(());
        }
        self.installer.write_slot(slot_addr, value)?;
        slot.installed = value;
        Ok(())
    }

    // 记录中的库已不在原基址上：丢弃记录，hub 延迟回收
    fn prune_unloaded(&self, state: &mut RegistryState, libs: &[LibraryInfo]) {
        let dead: Vec<LibraryKey> = state
            .libraries
            .iter()
            .filter(|(key, record)| !record.synthetic && !libs.iter().any(|lib| LibraryKey::of(lib) == **key))
            .map(|(key, _)| key.clone())
            .collect();
        for key in dead {
            if let Some(record) = state.libraries.remove(&key) {
                log::info(format_args!("{}@0x{:x} unloaded", key.pathname, key.base_addr));
                self.release_record(record, true);
            }
        }
    }

    fn release_record(&self, record: LibraryRecord, retire_hubs: bool) {
        for slot in record.slots.into_values() {
            for entry in slot.chain.entries().iter().filter(|entry| entry.no_chaining) {
                hub::note_no_chaining(entry.func, false);
            }
            if retire_hubs {
                hub::retire_hub(slot.hub, self.config.reclaim_delay);
            }
        }
    }
}

impl Drop for HookRegistry {
    fn drop(&mut self) {
        let libs = libraries::enumerate_libraries();
        let state = std::mem::take(&mut *self.state.lock_or_poison());
        for (key, mut record) in state.libraries {
            let loaded = record.synthetic || libs.iter().any(|lib| LibraryKey::of(lib) == key);
            let mut restored = true;
            if loaded {
                for (&slot_addr, slot) in record.slots.iter_mut() {
                    let orig = slot.orig_func;
                    // 外部改写过的 slot 不再归我们管
                    let still_ours = self.installer.read_slot(slot_addr) == Ok(slot.installed);
                    if still_ours && let Err(err) = self.install(slot_addr, slot, orig) {
                        log::error(format_args!("restore slot 0x{slot_addr:x} failed: {err}"));
                        restored = false;
                    }
                }
            }
            // 恢复失败的 slot 可能仍指向 trampoline，hub 只能泄漏
            self.release_record(record, restored);
        }
    }
}
