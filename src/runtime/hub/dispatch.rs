// trampoline 的调度入口与出口，以及 call-previous 的解析
//
// 每次经过 trampoline 的调用在线程私有栈上压入一帧，帧里记下进入时的链快照。
// hook 调用 get_prev_func 时按“自身在该快照中的位置”求下一项，与链顶无关，
// 所以同一次调用里多次求值结果不变，并发修改链也不会影响已进入的调用。
use crate::log;
use crate::runtime::state::MutexPoisonRecover;
use crate::runtime::thread_state::{
    DispatchFrame, report_dispatch_stack_overflow, report_frames_unavailable, with_frames,
};
use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::Ordering;

use super::{ChainSnapshot, Hub};

#[cfg(test)]
mod tests;

// 以 no-chaining 方式安装的函数 -> 安装次数，仅用于给误用报出准确的错误
static NO_CHAINING_HOOKS: Lazy<Mutex<BTreeMap<usize, usize>>> =
    Lazy::new(|| Mutex::new(BTreeMap::new()));

// 按值返回两个机器字：x86_64 为 rax:rdx，aarch64 为 x0:x1
#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) struct EnterResult {
    pub(super) target: usize,
    // 0 表示未压帧，trampoline 直接尾跳到 target
    pub(super) tracked: usize,
}

// 帧离开线程栈时归还所属 hub 的在途计数；hub 在计数归零前不会被回收
pub(crate) fn release_frame(frame: &DispatchFrame) {
    let hub = unsafe { &*(frame.hub_id as *const Hub) };
    hub.in_flight.fetch_sub(1, Ordering::SeqCst);
}

pub(crate) fn note_no_chaining(func: usize, installed: bool) {
    let mut hooks = NO_CHAINING_HOOKS.lock_or_poison();
    if installed {
        *hooks.entry(func).or_insert(0) += 1;
    } else if let Some(count) = hooks.get_mut(&func) {
        *count -= 1;
        if *count == 0 {
            hooks.remove(&func);
        }
    }
}

fn is_no_chaining_hook(func: usize) -> bool {
    NO_CHAINING_HOOKS.lock_or_poison().contains_key(&func)
}

// 由 trampoline 调用；caller_sp 是原调用返回后的栈指针
pub(super) unsafe extern "C" fn hub_enter(
    hub: *const Hub,
    return_addr: usize,
    caller_sp: usize,
) -> EnterResult {
    let hub_ref = &*hub;
    // 先计数再读快照，回收方据此判断该 hub 的旧快照是否可能仍被引用
    hub_ref.in_flight.fetch_add(1, Ordering::SeqCst);
    let chain_ptr = hub_ref.chain.load(Ordering::SeqCst);
    let snapshot: &ChainSnapshot = &*chain_ptr;
    let orig = snapshot.orig;
    let bypass = EnterResult {
        target: orig,
        tracked: 0,
    };

    let Some(&first) = snapshot.hooks.first() else {
        hub_ref.in_flight.fetch_sub(1, Ordering::SeqCst);
        return bypass;
    };

    let frame = DispatchFrame {
        hub_id: hub as usize,
        chain_ptr: chain_ptr as usize,
        return_addr,
        caller_sp,
    };
    match with_frames(|stack| stack.enter(frame, release_frame)) {
        Some(true) => EnterResult {
            target: first,
            tracked: 1,
        },
        Some(false) => {
            report_dispatch_stack_overflow();
            hub_ref.in_flight.fetch_sub(1, Ordering::SeqCst);
            bypass
        }
        None => {
            report_frames_unavailable("hub_enter");
            hub_ref.in_flight.fetch_sub(1, Ordering::SeqCst);
            bypass
        }
    }
}

// 弹出匹配的帧（以及其上遗留的帧），返回原始返回地址
pub(super) unsafe extern "C" fn hub_exit(hub: *const Hub, caller_sp: usize) -> usize {
    let left = with_frames(|stack| stack.leave(hub as usize, caller_sp, release_frame));
    match left {
        Some(Some(frame)) => frame.return_addr,
        _ => log::fatal(format_args!(
            "dispatch frame lost: hub={:p} caller_sp=0x{:x}",
            hub, caller_sp
        )),
    }
}

// 在当前线程的调度帧中找到 func 所在的快照，返回其下一项；func 为最后一项时返回原函数
pub(crate) fn get_prev_func(func: usize) -> usize {
    let prev = with_frames(|stack| {
        stack.live().iter().rev().find_map(|frame| {
            let snapshot = unsafe { &*(frame.chain_ptr as *const ChainSnapshot) };
            let idx = snapshot.hooks.iter().position(|&hook| hook == func)?;
            Some(snapshot.hooks.get(idx + 1).copied().unwrap_or(snapshot.orig))
        })
    });
    match prev {
        Some(Some(prev)) => prev,
        Some(None) if is_no_chaining_hook(func) => log::fatal(format_args!(
            "call previous from no-chaining hook 0x{func:x}"
        )),
        Some(None) => log::fatal(format_args!(
            "call previous from 0x{func:x} outside of any dispatch"
        )),
        None => log::fatal(format_args!(
            "call previous from 0x{func:x}: thread state unavailable"
        )),
    }
}
