use std::ffi::c_void;

use plt_chain::{
    PltHookSpec, hook_plt_method, hook_single_lib, unhook_plt_method, unhook_single_lib,
};

use crate::test_ctx::{
    ClockFn, HOOK_TEST_LIB, clock_a, clock_b, clock_c, clock_exclusive, ensure_no_failures,
    load_hook_test,
};

fn spec(hook: ClockFn) -> PltHookSpec {
    PltHookSpec::new("clock", hook as *mut c_void)
}

fn hook(spec: &mut PltHookSpec) -> usize {
    hook_single_lib(HOOK_TEST_LIB, std::slice::from_mut(spec))
}

fn unhook(spec: &mut PltHookSpec) -> usize {
    unhook_single_lib(HOOK_TEST_LIB, std::slice::from_mut(spec))
}

pub unsafe fn scenario_chain_compose_unhook() {
    let lib = load_hook_test();
    let mut a = spec(clock_a);
    let mut b = spec(clock_b);
    let mut c = spec(clock_c);

    ensure_no_failures(hook(&mut a), "hook A");
    assert_eq!(a.hook_result, 1, "A should patch exactly one slot");
    ensure_no_failures(hook(&mut b), "hook B");
    ensure_no_failures(hook(&mut c), "hook C");
    assert_eq!(lib.call_clock(), 11 * 13 * 17);

    ensure_no_failures(unhook(&mut b), "unhook B");
    assert_eq!(lib.call_clock(), 11 * 17, "C should reach A once B is gone");
    ensure_no_failures(unhook(&mut c), "unhook C");
    assert_eq!(lib.call_clock(), 11);
    ensure_no_failures(unhook(&mut a), "unhook A");
    assert_ne!(lib.call_clock(), 11, "slot not restored");
}

pub unsafe fn scenario_reinstall_after_remove() {
    let lib = load_hook_test();
    let mut a = spec(clock_a);
    let mut b = spec(clock_b);
    let mut c = spec(clock_c);

    ensure_no_failures(hook(&mut a), "hook A");
    ensure_no_failures(hook(&mut b), "hook B");
    ensure_no_failures(unhook(&mut b), "unhook B");
    assert_eq!(lib.call_clock(), 11);
    ensure_no_failures(hook(&mut c), "hook C");
    assert_eq!(lib.call_clock(), 11 * 17);
    ensure_no_failures(hook(&mut b), "rehook B");
    assert_eq!(lib.call_clock(), 11 * 17 * 13);

    let mut all = [a, b, c];
    for spec in &mut all {
        spec.hook_result = 0;
    }
    ensure_no_failures(unhook_single_lib(HOOK_TEST_LIB, &mut all), "unhook all three");
    assert!(all.iter().all(|spec| spec.hook_result == 1));
    assert_ne!(lib.call_clock(), 11);
}

pub unsafe fn scenario_no_chaining_exclusive() {
    let lib = load_hook_test();
    let mut exclusive = spec(clock_exclusive).no_chaining();
    let mut a = spec(clock_a);

    ensure_no_failures(hook(&mut exclusive), "hook exclusive");
    assert_eq!(exclusive.hook_result, 1);
    assert_eq!(lib.call_clock(), 0xbeef);

    assert_eq!(hook(&mut a), 1, "chaining hook must conflict");
    assert_eq!(a.hook_result, 0);
    assert_eq!(lib.call_clock(), 0xbeef);

    ensure_no_failures(unhook(&mut exclusive), "unhook exclusive");
    ensure_no_failures(hook(&mut a), "hook A after exclusive");
    assert_eq!(a.hook_result, 1);
    assert_eq!(lib.call_clock(), 11);

    let mut late = spec(clock_exclusive).no_chaining();
    assert_eq!(hook(&mut late), 1, "exclusive hook needs an empty slot");
    ensure_no_failures(unhook(&mut a), "unhook A");
}

pub unsafe fn scenario_redundant_unhook() {
    let lib = load_hook_test();
    let before = lib.call_clock();
    let mut never = spec(clock_b);
    ensure_no_failures(unhook(&mut never), "redundant unhook");
    assert_eq!(never.hook_result, 0);
    assert!(lib.call_clock() >= before);
}

pub unsafe fn scenario_plt_method_wrappers() {
    let lib = load_hook_test();
    let hook_fn = clock_a as ClockFn as *mut c_void;
    ensure_no_failures(hook_plt_method(HOOK_TEST_LIB, "clock", hook_fn), "hook_plt_method");
    assert_eq!(lib.call_clock(), 11);
    ensure_no_failures(unhook_plt_method(HOOK_TEST_LIB, "clock", hook_fn), "unhook_plt_method");
    assert_ne!(lib.call_clock(), 11);
    assert_eq!(hook_plt_method("libnot_loaded_here.so", "clock", hook_fn), 1);
}
