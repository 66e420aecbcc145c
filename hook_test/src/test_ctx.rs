use std::ffi::{CString, c_char, c_long, c_void};
use std::sync::atomic::{AtomicUsize, Ordering};

use plt_chain::call_prev;

pub const HOOK_TEST_LIB: &str = "libhook_test.so";
pub const PEER_CLIENT_LIB: &str = "libpeer_client.so";
pub const PEER_LIB: &str = "libpeer.so";

pub static PASS_COUNT: AtomicUsize = AtomicUsize::new(0);

pub type ClockFn = unsafe extern "C" fn() -> libc::clock_t;
pub type LDivFn = unsafe extern "C" fn(c_long, c_long) -> LDiv;
pub type LargeFn =
    unsafe extern "C" fn(Large, i32, f64, i64, i64, i64, i64, i64, i64, i64) -> Large;
pub type Nice1Fn = unsafe extern "C" fn(i32) -> f64;
pub type Nice2Fn = unsafe extern "C" fn(i32, f64) -> i32;
pub type LargeScaleFn = unsafe extern "C" fn(i32, i32, i32, Large, f64) -> Large;

// 与 libhook_test.so 中的定义保持一致
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

pub const LARGE_TAG: &std::ffi::CStr = c"hook-test-large";
pub const LARGE_STACK_ARGS: [i64; 7] = [10, 20, 30, 40, 50, 60, 70];
pub const LARGE_SCALE_INTS: [i32; 3] = [1, 2, 3];
pub const LARGE_REPLACED_TAG: &std::ffi::CStr = c"world";

pub fn sample_large() -> Large {
    Large {
        a: 3.5,
        b: 42,
        c: -0.75,
        d: LARGE_TAG.as_ptr(),
        e: -1,
        f: 0x0102_0304_0506_0708,
        g: 0x7f,
    }
}

// dlopen 得到的句柄，drop 时 dlclose
struct DlLib {
    handle: *mut c_void,
}

impl DlLib {
    unsafe fn open(path: &str, flags: i32) -> Self {
        let c_path = CString::new(path).expect("cstring failed");
        let handle = libc::dlopen(c_path.as_ptr(), flags);
        assert!(!handle.is_null(), "dlopen {path} failed");
        Self { handle }
    }

    unsafe fn sym(&self, name: &str) -> *mut c_void {
        let sym_name = CString::new(name).expect("cstring failed");
        let sym = libc::dlsym(self.handle, sym_name.as_ptr());
        assert!(!sym.is_null(), "dlsym {name} failed");
        sym
    }
}

impl Drop for DlLib {
    fn drop(&mut self) {
        unsafe { libc::dlclose(self.handle) };
    }
}

pub struct HookTestLib {
    lib: DlLib,
}

impl HookTestLib {
    pub unsafe fn call_clock(&self) -> libc::clock_t {
        let func: ClockFn = std::mem::transmute(self.lib.sym("call_clock"));
        func()
    }

    pub unsafe fn call_ldiv(&self, numer: c_long, denom: c_long) -> LDiv {
        let func: LDivFn = std::mem::transmute(self.lib.sym("call_ldiv"));
        func(numer, denom)
    }

    pub unsafe fn call_large(&self, value: Large, i: i32, x: f64) -> Large {
        let func: LargeFn = std::mem::transmute(self.lib.sym("call_large"));
        let [s1, s2, s3, s4, s5, s6, s7] = LARGE_STACK_ARGS;
        func(value, i, x, s1, s2, s3, s4, s5, s6, s7)
    }

    pub unsafe fn large_slot(&self) -> usize {
        let func: unsafe extern "C" fn() -> *mut usize = std::mem::transmute(self.lib.sym("large_slot"));
        func() as usize
    }
}

// 与测试程序同目录
pub unsafe fn load_hook_test() -> HookTestLib {
    let path = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(HOOK_TEST_LIB)))
        .and_then(|path| path.to_str().map(str::to_string))
        .unwrap_or_else(|| HOOK_TEST_LIB.to_string());
    HookTestLib {
        lib: DlLib::open(&path, libc::RTLD_NOW),
    }
}

pub struct PeerClient {
    lib: DlLib,
}

impl PeerClient {
    pub unsafe fn call_clock(&self) -> libc::clock_t {
        let func: ClockFn = std::mem::transmute(self.lib.sym("call_clock"));
        func()
    }

    pub unsafe fn call_nice1(&self, one: i32) -> f64 {
        let func: Nice1Fn = std::mem::transmute(self.lib.sym("call_nice1"));
        func(one)
    }

    pub unsafe fn call_nice2(&self, one: i32, two: f64) -> i32 {
        let func: Nice2Fn = std::mem::transmute(self.lib.sym("call_nice2"));
        func(one, two)
    }

    pub unsafe fn call_large_scale(&self, value: Large, factor: f64) -> Large {
        let func: LargeScaleFn = std::mem::transmute(self.lib.sym("call_large_scale"));
        let [one, two, three] = LARGE_SCALE_INTS;
        func(one, two, three, value, factor)
    }
}

// glibc 上用 RTLD_DEEPBIND 让 libpeer_client.so 的 clock 绑定到 libpeer.so 而不是 libc
#[cfg(all(target_os = "linux", target_env = "gnu"))]
const PEER_OPEN_FLAGS: i32 = libc::RTLD_NOW | libc::RTLD_DEEPBIND;
#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
const PEER_OPEN_FLAGS: i32 = libc::RTLD_NOW;

// build.rs 编出的 fixture 库
pub unsafe fn load_peer_client() -> PeerClient {
    let path = format!("{}/{PEER_CLIENT_LIB}", env!("HOOK_TEST_FIXTURES"));
    PeerClient {
        lib: DlLib::open(&path, PEER_OPEN_FLAGS),
    }
}

pub fn ensure_no_failures(failures: usize, op: &str) {
    assert_eq!(failures, 0, "{op}: {failures} failures");
}

pub fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

pub fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .ok()
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(false)
}

pub unsafe extern "C" fn clock_a() -> libc::clock_t {
    11
}

pub unsafe extern "C" fn clock_b() -> libc::clock_t {
    call_prev!(clock_b, ClockFn) * 13
}

pub unsafe extern "C" fn clock_c() -> libc::clock_t {
    call_prev!(clock_c, ClockFn) * 17
}

pub unsafe extern "C" fn clock_exclusive() -> libc::clock_t {
    0xbeef
}

pub unsafe extern "C" fn clock_one() -> libc::clock_t {
    1
}

pub unsafe extern "C" fn clock_double() -> libc::clock_t {
    call_prev!(clock_double, ClockFn) * 2
}

pub unsafe extern "C" fn clock_triple() -> libc::clock_t {
    call_prev!(clock_triple, ClockFn) * 3
}

// 商加一，余数不变
pub unsafe extern "C" fn ldiv_bump(numer: c_long, denom: c_long) -> LDiv {
    let mut result = call_prev!(ldiv_bump, LDivFn, numer, denom);
    result.quot += 1;
    result
}

pub unsafe extern "C" fn ldiv_pass(numer: c_long, denom: c_long) -> LDiv {
    PASS_COUNT.fetch_add(1, Ordering::Relaxed);
    call_prev!(ldiv_pass, LDivFn, numer, denom)
}

fn check_large_args(value: &Large, i: i32, x: f64, stack: [i64; 7]) {
    assert_eq!(*value, sample_large(), "large struct argument changed");
    assert_eq!(i, 5);
    assert_eq!(x.to_bits(), 2.0f64.to_bits());
    assert_eq!(stack, LARGE_STACK_ARGS);
}

#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn large_modify(
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
    check_large_args(&value, i, x, [s1, s2, s3, s4, s5, s6, s7]);
    let mut result = call_prev!(large_modify, LargeFn, value, i, x, s1, s2, s3, s4, s5, s6, s7);
    result.c = 9.0;
    result.g = 0;
    result
}

#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn large_pass(
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
    PASS_COUNT.fetch_add(1, Ordering::Relaxed);
    check_large_args(&value, i, x, [s1, s2, s3, s4, s5, s6, s7]);
    call_prev!(large_pass, LargeFn, value, i, x, s1, s2, s3, s4, s5, s6, s7)
}

// 实参乘 6 后交给下一项
pub unsafe extern "C" fn hook_nice1(one: i32) -> f64 {
    call_prev!(hook_nice1, Nice1Fn, one * 6)
}

pub unsafe extern "C" fn hook_nice2(one: i32, two: f64) -> i32 {
    call_prev!(hook_nice2, Nice2Fn, one * 6, two)
}

// 以 no-chaining 安装时调用 call_prev 属于误用，进程应当 abort
pub unsafe extern "C" fn nice1_exclusive_misuse(one: i32) -> f64 {
    call_prev!(nice1_exclusive_misuse, Nice1Fn, one)
}

// 先安装：改写结构体和 factor 后交给原函数
pub unsafe extern "C" fn large_scale_munge(one: i32, two: i32, three: i32, mut value: Large, factor: f64) -> Large {
    value.a *= 3.0;
    value.b *= 3;
    value.d = LARGE_REPLACED_TAG.as_ptr();
    value.e += 1;
    call_prev!(large_scale_munge, LargeScaleFn, one, two, three, value, factor * 2.0)
}

// 后安装：只核对实参后透传
pub unsafe extern "C" fn large_scale_pass(one: i32, two: i32, three: i32, value: Large, factor: f64) -> Large {
    PASS_COUNT.fetch_add(1, Ordering::Relaxed);
    assert_eq!([one, two, three], LARGE_SCALE_INTS);
    assert_eq!(value, sample_large(), "large struct argument changed");
    assert_eq!(factor.to_bits(), 0.5f64.to_bits());
    call_prev!(large_scale_pass, LargeScaleFn, one, two, three, value, factor)
}
