use std::ffi::{CStr, c_char, c_void};

use plt_chain::{PltHookSpec, hook_all_libs, hook_single_lib, unhook_all_libs};

use crate::test_ctx::{ClockFn, HOOK_TEST_LIB, clock_a, clock_b, ensure_no_failures, load_hook_test};

unsafe extern "C" {
    fn clock() -> libc::clock_t;
}

#[inline(never)]
fn own_clock() -> libc::clock_t {
    unsafe { clock() }
}

unsafe extern "C" fn only_hook_test(library: *const c_char, _symbol: *const c_char, data: *mut c_void) -> bool {
    let library = CStr::from_ptr(library).to_string_lossy();
    *(data as *mut usize) += 1;
    library == HOOK_TEST_LIB
}

fn spec(hook: ClockFn) -> PltHookSpec {
    PltHookSpec::new("clock", hook as *mut c_void)
}

pub unsafe fn scenario_filter_selects_library() {
    let lib = load_hook_test();
    let mut seen = 0usize;
    let data = &mut seen as *mut usize as *mut c_void;
    let mut specs = [spec(clock_a)];

    ensure_no_failures(hook_all_libs(&mut specs, Some(only_hook_test), data), "hook_all_libs");
    assert!(seen > 1, "filter should see every loaded library");
    assert_eq!(specs[0].hook_result, 1, "only libhook_test.so may be patched");
    assert_eq!(lib.call_clock(), 11);
    assert_ne!(own_clock(), 11, "executable import must stay untouched");

    ensure_no_failures(unhook_all_libs(&mut specs, Some(only_hook_test), data), "unhook_all_libs");
    assert_ne!(lib.call_clock(), 11);
}

pub unsafe fn scenario_callee_qualified_spec() {
    let lib = load_hook_test();
    let mut wrong = spec(clock_a).with_callee("libnot_loaded_here.so");
    ensure_no_failures(
        hook_single_lib(HOOK_TEST_LIB, std::slice::from_mut(&mut wrong)),
        "hook with foreign callee",
    );
    assert_eq!(wrong.hook_result, 0);
    assert_ne!(lib.call_clock(), 11);

    let mut libc_spec = spec(clock_a).with_callee("libc.so");
    let mut specs = [libc_spec.clone()];
    ensure_no_failures(hook_single_lib(HOOK_TEST_LIB, &mut specs), "hook with libc callee");
    assert_eq!(specs[0].hook_result, 1);
    assert_eq!(lib.call_clock(), 11);

    libc_spec.hook_result = 0;
    let mut specs = [libc_spec];
    ensure_no_failures(unhook_all_libs(&mut specs, None, std::ptr::null_mut()), "unhook callee spec");
    assert_eq!(specs[0].hook_result, 1);
    assert_ne!(lib.call_clock(), 11);
}

pub unsafe fn scenario_unhook_all_libs() {
    let lib = load_hook_test();
    let mut seen = 0usize;
    let data = &mut seen as *mut usize as *mut c_void;
    let mut specs = [spec(clock_a), spec(clock_b)];

    ensure_no_failures(hook_all_libs(&mut specs, Some(only_hook_test), data), "hook pair");
    assert_eq!(lib.call_clock(), 11 * 13);

    // 不带过滤器的卸载只会命中已安装过的 slot
    for spec in &mut specs {
        spec.hook_result = 0;
    }
    ensure_no_failures(unhook_all_libs(&mut specs, None, std::ptr::null_mut()), "unhook pair");
    assert!(specs.iter().all(|spec| spec.hook_result == 1));
    assert_ne!(lib.call_clock(), 11);
}
