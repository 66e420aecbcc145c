use std::ffi::{CStr, c_void};
use std::sync::atomic::Ordering;

use plt_chain::{PltHookSpec, hook_single_lib, unhook_single_lib};

use crate::test_ctx::{
    ClockFn, LARGE_REPLACED_TAG, LARGE_TAG, LargeScaleFn, Nice1Fn, Nice2Fn, PASS_COUNT,
    PEER_CLIENT_LIB, PEER_LIB, clock_a, ensure_no_failures, hook_nice1, hook_nice2,
    large_scale_munge, large_scale_pass, load_peer_client, nice1_exclusive_misuse, sample_large,
};

fn hook(specs: &mut [PltHookSpec]) -> usize {
    hook_single_lib(PEER_CLIENT_LIB, specs)
}

fn unhook(specs: &mut [PltHookSpec]) -> usize {
    unhook_single_lib(PEER_CLIENT_LIB, specs)
}

// libpeer_client.so 的 clock 绑定在 libpeer.so 上，libc 限定的 spec 必须跳过它
pub unsafe fn scenario_foreign_clock_binding() {
    let client = load_peer_client();
    if client.call_clock() != 1 {
        println!("  skipped: clock of {PEER_CLIENT_LIB} is not bound to {PEER_LIB} here");
        return;
    }
    let clock_hook = clock_a as ClockFn as *mut c_void;

    let mut libc_only = [PltHookSpec::new("clock", clock_hook).with_callee("libc.so")];
    ensure_no_failures(hook(&mut libc_only), "hook libc-qualified clock");
    assert_eq!(libc_only[0].hook_result, 0, "slot bound to {PEER_LIB} must be skipped");
    assert_eq!(client.call_clock(), 1);

    let mut peer_only = [PltHookSpec::new("clock", clock_hook).with_callee(PEER_LIB)];
    ensure_no_failures(hook(&mut peer_only), "hook peer-qualified clock");
    assert_eq!(peer_only[0].hook_result, 1);
    assert_eq!(client.call_clock(), 11);

    peer_only[0].hook_result = 0;
    ensure_no_failures(unhook(&mut peer_only), "unhook peer-qualified clock");
    assert_eq!(peer_only[0].hook_result, 1);
    assert_eq!(client.call_clock(), 1);

    // 不带限定时按符号名照常 hook
    let mut any = [PltHookSpec::new("clock", clock_hook)];
    ensure_no_failures(hook(&mut any), "hook unqualified clock");
    assert_eq!(any[0].hook_result, 1);
    assert_eq!(client.call_clock(), 11);
    ensure_no_failures(unhook(&mut any), "unhook unqualified clock");
    assert_eq!(client.call_clock(), 1);
}

// 整型实参被 hook 改写，浮点实参与返回值原样穿过 trampoline
pub unsafe fn scenario_float_arguments() {
    let client = load_peer_client();
    assert_eq!(client.call_nice1(7), -49.0);
    assert_eq!(client.call_nice2(70, 4.2), 294);

    let mut specs = [
        PltHookSpec::new("nice1", hook_nice1 as Nice1Fn as *mut c_void),
        PltHookSpec::new("nice2", hook_nice2 as Nice2Fn as *mut c_void),
    ];
    ensure_no_failures(hook(&mut specs), "hook nice1/nice2");
    assert!(specs.iter().all(|spec| spec.hook_result == 1));
    assert_eq!(client.call_nice1(7), -1764.0);
    assert_eq!(client.call_nice2(70, 4.2), 1764);

    ensure_no_failures(unhook(&mut specs), "unhook nice1/nice2");
    assert_eq!(client.call_nice1(7), -49.0);
}

// 大结构体经真实 GOT slot 按值传入、经隐藏指针返回
pub unsafe fn scenario_large_through_got() {
    let client = load_peer_client();
    let plain = client.call_large_scale(sample_large(), 0.5);
    assert_eq!(plain.a, 1.75);
    assert_eq!(plain.b, 43);
    assert_eq!(plain.c, -1.25);
    assert_eq!(plain.d, LARGE_TAG.as_ptr());
    assert_eq!(plain.e, 1);
    assert_eq!(plain.g, 0x80);

    let mut specs = [
        PltHookSpec::new("large_scale", large_scale_munge as LargeScaleFn as *mut c_void),
        PltHookSpec::new("large_scale", large_scale_pass as LargeScaleFn as *mut c_void),
    ];
    ensure_no_failures(hook(&mut specs), "hook large_scale");
    PASS_COUNT.store(0, Ordering::Relaxed);
    let hooked = client.call_large_scale(sample_large(), 0.5);
    assert_eq!(PASS_COUNT.load(Ordering::Relaxed), 1);
    assert_eq!(hooked.a, 10.5);
    assert_eq!(hooked.b, 127);
    assert_eq!(hooked.c, -1.75);
    assert_eq!(CStr::from_ptr(hooked.d), LARGE_REPLACED_TAG);
    assert_eq!(hooked.e, 2);
    assert_eq!(hooked.f, plain.f);
    assert_eq!(hooked.g, 0x80);

    ensure_no_failures(unhook(&mut specs), "unhook large_scale");
    assert_eq!(client.call_large_scale(sample_large(), 0.5), plain);
}

// 在子进程里触发误用，父进程确认子进程被 SIGABRT 终止
pub unsafe fn scenario_call_prev_from_no_chaining_aborts() {
    let client = load_peer_client();
    match libc::fork() {
        -1 => panic!("fork failed"),
        0 => {
            let mut specs = [PltHookSpec::new(
                "nice1",
                nice1_exclusive_misuse as Nice1Fn as *mut c_void,
            )
            .no_chaining()];
            if hook(&mut specs) != 0 || specs[0].hook_result != 1 {
                libc::_exit(2);
            }
            client.call_nice1(7);
            libc::_exit(0);
        }
        child => {
            let mut status = 0;
            assert_eq!(libc::waitpid(child, &mut status, 0), child);
            assert!(
                libc::WIFSIGNALED(status) && libc::WTERMSIG(status) == libc::SIGABRT,
                "child should abort, status=0x{status:x}"
            );
        }
    }
}
