// 被 hook 的目标库：每个导出函数都通过本库的 GOT 调用外部符号
use std::ffi::{c_char, c_long};
use std::sync::atomic::{AtomicUsize, Ordering};

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Large {
    pub a: f64,
    pub b: i32,
    pub c: f64,
    pub d: *const c_char,
    pub e: i64,
    pub f: i64,
    pub g: u8,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LDiv {
    pub quot: c_long,
    pub rem: c_long,
}

pub type LargeFn =
    unsafe extern "C" fn(Large, i32, f64, i64, i64, i64, i64, i64, i64, i64) -> Large;

unsafe extern "C" {
    fn clock() -> libc::clock_t;
    fn ldiv(numer: c_long, denom: c_long) -> LDiv;
}

unsafe extern "C" fn large_impl(
    mut value: Large,
    i: i32,
    x: f64,
    s1: i64,
    s2: i64,
    s3: i64,
    s4: i64,
    s5: i64,
    s6: i64,
    s7: i64,
) -> Large {
    value.a *= x;
    value.b -= i;
    value.e = s1 + s2 + s3 + s4 + s5 + s6 + s7;
    value
}

// 手工维护的函数指针单元，供 slot 级 API 使用
static LARGE_SLOT: AtomicUsize = AtomicUsize::new(0);

#[unsafe(no_mangle)]
pub extern "C" fn call_clock() -> libc::clock_t {
    unsafe { clock() }
}

#[unsafe(no_mangle)]
pub extern "C" fn call_ldiv(numer: c_long, denom: c_long) -> LDiv {
    unsafe { ldiv(numer, denom) }
}

#[unsafe(no_mangle)]
pub extern "C" fn large_slot() -> *mut usize {
    let _ = LARGE_SLOT.compare_exchange(0, large_impl as usize, Ordering::SeqCst, Ordering::SeqCst);
    LARGE_SLOT.as_ptr()
}

#[unsafe(no_mangle)]
#[allow(clippy::too_many_arguments)]
pub extern "C" fn call_large(
    value: Large,
    i: i32,
    x: f64,
    s1: i64,
    s2: i64,
    s3: i64,
    s4: i64,
    s5: i64,
    s6: i64,
    s7: i64,
) -> Large {
    large_slot();
    let func: LargeFn = unsafe { std::mem::transmute(LARGE_SLOT.load(Ordering::Acquire)) };
    unsafe { func(value, i, x, s1, s2, s3, s4, s5, s6, s7) }
}
