
// 链上的一项；同一函数重复注册只增加 refs
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct HookEntry {
    pub(crate) func: usize,
    pub(crate) no_chaining: bool,
    pub(crate) refs: usize,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum PushOutcome {
    Installed,
    Shared,
    Conflict,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum RemoveOutcome {
    // unlinked=false 表示只减少了引用计数，链结构未变
    Removed { unlinked: bool, no_chaining: bool },
    NotFound,
}

/// slot 当前应当持有的物理目标。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SlotTarget {
    /// 链为空，slot 指向原函数。
    Original,
    /// 唯一的 no-chaining hook，slot 直接指向它。
    Direct(usize),
    /// 至少一个可链式调用的 hook，slot 指向 trampoline。
    Trampoline,
}

// entries 按安装顺序保存，最旧在前
#[derive(Clone, Debug, Default)]
pub(crate) struct HookChain {
    entries: Vec<HookEntry>,
}

impl HookChain {
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn entries(&self) -> &[HookEntry] {
        &self.entries
    }

    // no-chaining 只能进入空链，且独占 slot
    pub(crate) fn try_push(&mut self, func: usize, no_chaining: bool) -> PushOutcome {
        if self.entries.iter().any(|entry| entry.no_chaining) {
            return PushOutcome::Conflict;
        }
        if no_chaining && !self.entries.is_empty() {
            return PushOutcome::Conflict;
        }
        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.func == func) {
            entry.refs += 1;
            return PushOutcome::Shared;
        }
        self.entries.push(HookEntry {
            func,
            no_chaining,
            refs: 1,
        });
        PushOutcome::Installed
    }

    pub(crate) fn remove(&mut self, func: usize) -> RemoveOutcome {
        let Some(idx) = self.entries.iter().position(|entry| entry.func == func) else {
            return RemoveOutcome::NotFound;
        };
        let entry = &mut self.entries[idx];
        let no_chaining = entry.no_chaining;
        if entry.refs > 1 {
            entry.refs -= 1;
            return RemoveOutcome::Removed {
                unlinked: false,
                no_chaining,
            };
        }
        self.entries.remove(idx);
        RemoveOutcome::Removed {
            unlinked: true,
            no_chaining,
        }
    }

    pub(crate) fn target(&self) -> SlotTarget {
        match self.entries.as_slice() {
            [] => SlotTarget::Original,
            [entry] if entry.no_chaining => SlotTarget::Direct(entry.func),
            _ => SlotTarget::Trampoline,
        }
    }

    // trampoline 的调度顺序：最新安装的最先执行
    pub(crate) fn dispatch_order(&self) -> Vec<usize> {
        self.entries.iter().rev().map(|entry| entry.func).collect()
    }
}
