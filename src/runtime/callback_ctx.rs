// 过滤回调上下文：线程局部深度计数，用于拒绝回调内部重入 registry
use std::cell::Cell;

thread_local! {
    static FILTER_DEPTH: Cell<u32> = const { Cell::new(0) };
}

pub(super) fn in_filter_callback() -> bool {
    FILTER_DEPTH.with(|depth| depth.get() > 0)
}

// guard 负责回退深度，回调 panic 时同样生效
pub(super) fn run_filter<R, F>(f: F) -> R
where
    F: FnOnce() -> R,
{
    struct FilterGuard;

    impl Drop for FilterGuard {
        fn drop(&mut self) {
            FILTER_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
        }
    }

    FILTER_DEPTH.with(|depth| depth.set(depth.get().saturating_add(1)));
    let _guard = FilterGuard;
    f()
}
