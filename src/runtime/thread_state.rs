// 线程私有的调度帧栈，挂在单个 pthread key 上
use once_cell::sync::OnceCell;
use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

pub(crate) const DISPATCH_STACK_CAP: usize = 128;

// 一次经过 trampoline 的调用
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct DispatchFrame {
    pub(crate) hub_id: usize,
    // 进入时看到的链快照，帧存活期间不会被回收
    pub(crate) chain_ptr: usize,
    pub(crate) return_addr: usize,
    // 原始调用点返回后的栈指针
    pub(crate) caller_sp: usize,
}

const VACANT: DispatchFrame = DispatchFrame {
    hub_id: 0,
    chain_ptr: 0,
    return_addr: 0,
    caller_sp: 0,
};

/// 当前线程上尚未返回的调度帧，外层在下，容量固定。
///
/// 被丢弃的帧都会交给调用方的 `on_drop`，由它归还所属 hub 的在途计数。
pub(crate) struct FrameStack {
    depth: usize,
    frames: [DispatchFrame; DISPATCH_STACK_CAP],
}

impl FrameStack {
    pub(crate) const fn new() -> Self {
        Self {
            depth: 0,
            frames: [VACANT; DISPATCH_STACK_CAP],
        }
    }

    // 自顶向下遍历用 .iter().rev()
    pub(crate) fn live(&self) -> &[DispatchFrame] {
        &self.frames[..self.depth]
    }

    fn unwind_to<F: FnMut(&DispatchFrame)>(&mut self, depth: usize, mut on_drop: F) {
        while self.depth > depth {
            self.depth -= 1;
            on_drop(&self.frames[self.depth]);
        }
    }

    // 压入新帧；caller_sp 更低的旧帧早该返回（hook 经 longjmp 之类离开），先清掉
    pub(crate) fn enter<F: FnMut(&DispatchFrame)>(&mut self, frame: DispatchFrame, on_drop: F) -> bool {
        let keep = self
            .live()
            .iter()
            .rposition(|live| live.caller_sp >= frame.caller_sp)
            .map_or(0, |idx| idx + 1);
        self.unwind_to(keep, on_drop);
        if self.depth == DISPATCH_STACK_CAP {
            return false;
        }
        self.frames[self.depth] = frame;
        self.depth += 1;
        true
    }

    // 弹出 (hub, caller_sp) 对应的帧及其上方的遗留帧，返回该帧
    pub(crate) fn leave<F: FnMut(&DispatchFrame)>(
        &mut self,
        hub_id: usize,
        caller_sp: usize,
        on_drop: F,
    ) -> Option<DispatchFrame> {
        let idx = self
            .live()
            .iter()
            .rposition(|live| live.hub_id == hub_id && live.caller_sp == caller_sp)?;
        let frame = self.frames[idx];
        self.unwind_to(idx, on_drop);
        Some(frame)
    }

    pub(crate) fn clear<F: FnMut(&DispatchFrame)>(&mut self, on_drop: F) {
        self.unwind_to(0, on_drop);
    }
}

// 析构中的线程把 key 置为该值，之后的 hook 调用不再创建帧栈
const DESTROYING: *mut c_void = ptr::dangling_mut::<c_void>();

static FRAME_KEY: OnceCell<libc::pthread_key_t> = OnceCell::new();

// 热路径上的失败只按 1, 256, 512... 次采样输出
struct SampledWarn {
    hits: AtomicU64,
    what: &'static str,
}

impl SampledWarn {
    const fn new(what: &'static str) -> Self {
        Self {
            hits: AtomicU64::new(0),
            what,
        }
    }

    fn hit(&self, detail: std::fmt::Arguments<'_>) {
        let count = self.hits.fetch_add(1, Ordering::Relaxed) + 1;
        if count == 1 || count.is_multiple_of(256) {
            crate::log::warn(format_args!("{}: {detail} 次数={count}", self.what));
        }
    }
}

static KEY_CREATE_FAIL: SampledWarn = SampledWarn::new("调度帧 key 创建失败");
static BIND_FAIL: SampledWarn = SampledWarn::new("调度帧栈绑定失败");
static UNAVAILABLE: SampledWarn = SampledWarn::new("调度帧栈不可用");
static OVERFLOW: SampledWarn = SampledWarn::new("调度帧栈溢出，本次调用绕过 hook 链");

// 线程退出：归还残留帧的在途计数。pthread 在调用前已清空 key，重新置为 DESTROYING
unsafe extern "C" fn release_frame_stack(raw: *mut c_void) {
    if let Some(&key) = FRAME_KEY.get() {
        let _ = libc::pthread_setspecific(key, DESTROYING);
    }
    if raw.is_null() || raw == DESTROYING {
        return;
    }
    let mut stack = Box::from_raw(raw as *mut FrameStack);
    stack.clear(super::hub::release_frame);
}

fn frame_key() -> Option<libc::pthread_key_t> {
    FRAME_KEY
        .get_or_try_init(|| {
            let mut key: libc::pthread_key_t = 0;
            let ret = unsafe { libc::pthread_key_create(&mut key, Some(release_frame_stack)) };
            if ret != 0 {
                KEY_CREATE_FAIL.hit(format_args!("ret={ret}"));
                return Err(());
            }
            Ok(key)
        })
        .ok()
        .copied()
}

fn current_stack(key: libc::pthread_key_t) -> Option<*mut FrameStack> {
    let existing = unsafe { libc::pthread_getspecific(key) };
    if existing == DESTROYING {
        return None;
    }
    if !existing.is_null() {
        return Some(existing as *mut FrameStack);
    }

    let raw = Box::into_raw(Box::new(FrameStack::new()));
    let ret = unsafe { libc::pthread_setspecific(key, raw as *const c_void) };
    if ret != 0 {
        drop(unsafe { Box::from_raw(raw) });
        BIND_FAIL.hit(format_args!("ret={ret}"));
        return None;
    }
    Some(raw)
}

/// 访问当前线程的调度帧栈；线程正在退出或 key 不可用时返回 None。
pub(crate) fn with_frames<R, F>(f: F) -> Option<R>
where
    F: FnOnce(&mut FrameStack) -> R,
{
    let key = frame_key()?;
    let stack = current_stack(key)?;
    Some(f(unsafe { &mut *stack }))
}

pub(crate) fn report_frames_unavailable(site: &str) {
    UNAVAILABLE.hit(format_args!("site={site}"));
}

pub(crate) fn report_dispatch_stack_overflow() {
    OVERFLOW.hit(format_args!("cap={DISPATCH_STACK_CAP}"));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(hub_id: usize, caller_sp: usize) -> DispatchFrame {
        DispatchFrame {
            hub_id,
            chain_ptr: 0,
            return_addr: hub_id + caller_sp,
            caller_sp,
        }
    }

    fn ignore(_: &DispatchFrame) {}

    #[test]
    fn stack_respects_capacity() {
        let mut stack = FrameStack::new();
        for depth in 0..DISPATCH_STACK_CAP {
            assert!(stack.enter(frame(1, 0x10000 - depth * 0x10), ignore));
        }
        assert!(!stack.enter(frame(1, 0x100), ignore));
        assert_eq!(stack.live().len(), DISPATCH_STACK_CAP);
    }

    #[test]
    fn entering_shallower_call_drops_stale_frames() {
        let mut stack = FrameStack::new();
        stack.enter(frame(1, 0x7000), ignore);
        stack.enter(frame(2, 0x6000), ignore);
        stack.enter(frame(3, 0x5000), ignore);

        let mut dropped = Vec::new();
        assert!(stack.enter(frame(4, 0x6800), |f: &DispatchFrame| dropped.push(f.hub_id)));
        assert_eq!(dropped, [3, 2]);
        let hubs: Vec<usize> = stack.live().iter().map(|f| f.hub_id).collect();
        assert_eq!(hubs, [1, 4]);
    }

    #[test]
    fn leave_pops_matching_frame_and_everything_above() {
        let mut stack = FrameStack::new();
        stack.enter(frame(1, 0x7000), ignore);
        stack.enter(frame(2, 0x6000), ignore);
        stack.enter(frame(3, 0x5000), ignore);

        assert_eq!(stack.leave(9, 0x6000, ignore), None);
        let mut dropped = Vec::new();
        let left = stack.leave(2, 0x6000, |f: &DispatchFrame| dropped.push(f.hub_id));
        assert_eq!(left, Some(frame(2, 0x6000)));
        assert_eq!(dropped, [3, 2]);
        assert_eq!(stack.live().len(), 1);
    }

    #[test]
    fn frames_are_per_thread() {
        with_frames(|stack| {
            stack.clear(ignore);
            stack.enter(frame(1, 0x7000), ignore);
        })
        .unwrap();
        let other = std::thread::spawn(|| with_frames(|stack| stack.live().len()).unwrap())
            .join()
            .unwrap();
        assert_eq!(other, 0);
        let mut mine = 0;
        with_frames(|stack| stack.clear(|_| mine += 1)).unwrap();
        assert_eq!(mine, 1);
    }
}
