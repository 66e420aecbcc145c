// 调度中心（Hub）
// 每个走 trampoline 的 slot 对应一个 Hub，持有不可变的链快照和 trampoline 入口
use crate::errno::Errno;
use crate::log;
use crate::runtime::state::MutexPoisonRecover;
use once_cell::sync::Lazy;
use std::sync::Mutex;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

mod dispatch;
mod trampoline;

pub(crate) use dispatch::{get_prev_func, note_no_chaining, release_frame};

// 发布后只读；hooks 按调度顺序排列，最新安装的在前
pub(crate) struct ChainSnapshot {
    pub(crate) hooks: Box<[usize]>,
    pub(crate) orig: usize,
}

pub(crate) struct Hub {
    pub(crate) trampo: usize,
    // 始终非空；替换时整体换指针，读者看到的要么是旧链要么是新链
    chain: AtomicPtr<ChainSnapshot>,
    // 本 hub 上尚未返回的调用数，只挡住本 hub 的回收
    in_flight: AtomicUsize,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum RetiredKind {
    Snapshot { snapshot: usize, hub: usize },
    Hub(usize),
}

impl RetiredKind {
    fn hub(self) -> usize {
        match self {
            Self::Snapshot { hub, .. } | Self::Hub(hub) => hub,
        }
    }
}

struct RetiredItem {
    kind: RetiredKind,
    retired_at: Instant,
    delay: Duration,
}

static RETIRED: Lazy<Mutex<Vec<RetiredItem>>> = Lazy::new(|| Mutex::new(Vec::new()));

fn new_snapshot(hooks: &[usize], orig: usize) -> *mut ChainSnapshot {
    Box::into_raw(Box::new(ChainSnapshot {
        hooks: hooks.into(),
        orig,
    }))
}

unsafe fn destroy_now(kind: RetiredKind) {
    match kind {
        RetiredKind::Snapshot { snapshot, .. } => drop(Box::from_raw(snapshot as *mut ChainSnapshot)),
        RetiredKind::Hub(hub) => {
            let hub = Box::from_raw(hub as *mut Hub);
            drop(Box::from_raw(hub.chain.load(Ordering::SeqCst)));
            if hub.trampo != 0 {
                trampoline::free_trampo(hub.trampo);
            }
        }
    }
}

fn retire(kind: RetiredKind, delay: Duration) {
    RETIRED.lock_or_poison().push(RetiredItem {
        kind,
        retired_at: Instant::now(),
        delay,
    });
}

fn hub_idle(hub: usize) -> bool {
    unsafe { (*(hub as *const Hub)).in_flight.load(Ordering::SeqCst) == 0 }
}

// 超过延迟且所属 hub 上没有在途调用的条目才释放；hub 本身要等它的旧快照都释放后才释放
pub(crate) fn collect_retired() {
    let mut ready = Vec::new();
    {
        let mut retired = RETIRED.lock_or_poison();
        if retired.is_empty() {
            return;
        }
        let (done, pending): (Vec<RetiredItem>, Vec<RetiredItem>) = retired
            .drain(..)
            .partition(|item| item.retired_at.elapsed() >= item.delay && hub_idle(item.kind.hub()));
        *retired = pending;
        for item in done {
            let blocked = matches!(item.kind, RetiredKind::Hub(hub)
                if retired.iter().any(|other| other.kind.hub() == hub));
            if blocked {
                retired.push(item);
            } else {
                ready.push(item.kind);
            }
        }
    }
    if !ready.is_empty() {
        log::debug(format_args!("reclaim {} retired hub items", ready.len()));
    }
    // 快照在前，hub 在后
    ready.sort_by_key(|kind| matches!(kind, RetiredKind::Hub(_)));
    for kind in ready {
        unsafe { destroy_now(kind) };
    }
}

#[cfg(test)]
pub(crate) fn retired_len() -> usize {
    RETIRED.lock_or_poison().len()
}

// 创建 Hub：分配 trampoline 并写入 hub 指针与调度入口
pub(crate) fn create_hub(orig: usize) -> Result<usize, Errno> {
    collect_retired();

    let hub_ptr = Box::into_raw(Box::new(Hub {
        trampo: 0,
        chain: AtomicPtr::new(new_snapshot(&[], orig)),
        in_flight: AtomicUsize::new(0),
    }));

    let trampo = match trampoline::alloc_trampo() {
        Ok(value) => value,
        Err(err) => {
            unsafe { destroy_now(RetiredKind::Hub(hub_ptr as usize)) };
            return Err(err);
        }
    };
    let init_result = unsafe {
        trampoline::init_trampo(
            trampo,
            hub_ptr as usize,
            dispatch::hub_enter as *const () as usize,
            dispatch::hub_exit as *const () as usize,
        )
    };
    if let Err(err) = init_result {
        trampoline::free_trampo(trampo);
        unsafe { destroy_now(RetiredKind::Hub(hub_ptr as usize)) };
        return Err(err);
    }

    unsafe {
        (*hub_ptr).trampo = trampo;
    }
    log::debug(format_args!("hub {:p} trampo 0x{:x}", hub_ptr, trampo));
    Ok(hub_ptr as usize)
}

pub(crate) fn hub_trampo(hub: usize) -> usize {
    if hub == 0 {
        return 0;
    }
    unsafe { (*(hub as *const Hub)).trampo }
}

// 整体替换链快照，旧快照延迟回收
pub(crate) fn publish_chain(hub: usize, hooks: &[usize], orig: usize, delay: Duration) {
    if hub == 0 {
        return;
    }
    let hub_ref = unsafe { &*(hub as *const Hub) };
    let old = hub_ref.chain.swap(new_snapshot(hooks, orig), Ordering::SeqCst);
    retire(
        RetiredKind::Snapshot {
            snapshot: old as usize,
            hub,
        },
        delay,
    );
    collect_retired();
}

// slot 已不再指向该 hub 的 trampoline 后才能调用
pub(crate) fn retire_hub(hub: usize, delay: Duration) {
    if hub == 0 {
        return;
    }
    retire(RetiredKind::Hub(hub), delay);
    collect_retired();
}
