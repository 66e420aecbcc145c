use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

use plt_chain::{PltHookSpec, hook_single_lib, unhook_single_lib};

use crate::test_ctx::{
    ClockFn, HOOK_TEST_LIB, HookTestLib, clock_double, clock_one, clock_triple,
    ensure_no_failures, env_usize, load_hook_test,
};

fn spec(hook: ClockFn) -> PltHookSpec {
    PltHookSpec::new("clock", hook as *mut c_void)
}

// 调用线程只能看到完整的链：1、1*2、1*3 或 1*2*3
unsafe fn toggle_under_load(lib: &HookTestLib, workers: usize, rounds: usize) {
    let mut base = [spec(clock_one)];
    ensure_no_failures(hook_single_lib(HOOK_TEST_LIB, &mut base), "hook base");

    let stop = Arc::new(AtomicBool::new(false));
    let barrier = Arc::new(Barrier::new(workers + 1));
    let lib_addr = lib as *const HookTestLib as usize;
    let handles: Vec<_> = (0..workers)
        .map(|_| {
            let stop = Arc::clone(&stop);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                let lib = unsafe { &*(lib_addr as *const HookTestLib) };
                barrier.wait();
                let mut calls = 0usize;
                while !stop.load(Ordering::Relaxed) {
                    let value = unsafe { lib.call_clock() };
                    assert!(matches!(value, 1 | 2 | 3 | 6), "torn chain result {value}");
                    calls += 1;
                }
                calls
            })
        })
        .collect();

    barrier.wait();
    let mut layers = [spec(clock_double), spec(clock_triple)];
    for round in 0..rounds {
        let failures = if round % 2 == 0 {
            hook_single_lib(HOOK_TEST_LIB, &mut layers)
        } else {
            unhook_single_lib(HOOK_TEST_LIB, &mut layers)
        };
        ensure_no_failures(failures, "toggle layers");
    }
    if rounds % 2 == 1 {
        ensure_no_failures(unhook_single_lib(HOOK_TEST_LIB, &mut layers), "final unhook");
    }

    stop.store(true, Ordering::Relaxed);
    for handle in handles {
        assert!(handle.join().expect("stress worker panic") > 0);
    }
    assert_eq!(lib.call_clock(), 1);
    ensure_no_failures(unhook_single_lib(HOOK_TEST_LIB, &mut base), "unhook base");
}

pub unsafe fn scenario_toggle_under_load() {
    let lib = load_hook_test();
    let workers = env_usize("HOOK_TEST_STRESS_WORKERS", 8);
    let rounds = env_usize("HOOK_TEST_STRESS_ROUNDS", 400);
    toggle_under_load(&lib, workers, rounds);
}

pub unsafe fn scenario_toggle_marathon() {
    let lib = load_hook_test();
    let deadline = Instant::now() + Duration::from_secs(env_usize("HOOK_TEST_MARATHON_SECS", 60) as u64);
    while Instant::now() < deadline {
        toggle_under_load(&lib, 16, 2000);
    }
}
