use std::ffi::c_void;
use std::sync::atomic::Ordering;

use plt_chain::{HookRegistry, PltHookSpec, SlotTarget, hook_single_lib, unhook_single_lib};

use crate::test_ctx::{
    HOOK_TEST_LIB, LDivFn, LargeFn, PASS_COUNT, ensure_no_failures, large_modify, large_pass,
    ldiv_bump, ldiv_pass, load_hook_test, sample_large,
};

// 两个机器字的结构体经寄存器返回
pub unsafe fn scenario_register_pair_return() {
    let lib = load_hook_test();
    let plain = lib.call_ldiv(47, 5);
    assert_eq!((plain.quot, plain.rem), (9, 2));

    let mut specs = [
        PltHookSpec::new("ldiv", ldiv_bump as LDivFn as *mut c_void),
        PltHookSpec::new("ldiv", ldiv_pass as LDivFn as *mut c_void),
    ];
    ensure_no_failures(hook_single_lib(HOOK_TEST_LIB, &mut specs), "hook ldiv");
    PASS_COUNT.store(0, Ordering::Relaxed);
    let hooked = lib.call_ldiv(47, 5);
    assert_eq!((hooked.quot, hooked.rem), (10, 2));
    assert_eq!(PASS_COUNT.load(Ordering::Relaxed), 1);

    ensure_no_failures(unhook_single_lib(HOOK_TEST_LIB, &mut specs), "unhook ldiv");
    assert_eq!(lib.call_ldiv(47, 5), plain);
}

// 按内存传递、经隐藏指针返回的大结构体
pub unsafe fn scenario_large_by_value() {
    let lib = load_hook_test();
    let registry = HookRegistry::global();
    let slot = lib.large_slot();
    let plain = lib.call_large(sample_large(), 5, 2.0);
    assert_eq!(plain.e, 280);

    let modify = large_modify as LargeFn as *mut c_void;
    let pass = large_pass as LargeFn as *mut c_void;
    registry.hook_slot(slot, "large", modify, false).expect("hook_slot modify");
    registry.hook_slot(slot, "large", pass, false).expect("hook_slot pass");
    assert_eq!(registry.slot_target(slot), Some(SlotTarget::Trampoline));

    PASS_COUNT.store(0, Ordering::Relaxed);
    let hooked = lib.call_large(sample_large(), 5, 2.0);
    assert_eq!(PASS_COUNT.load(Ordering::Relaxed), 1);
    assert_eq!(hooked.a.to_bits(), plain.a.to_bits());
    assert_eq!(hooked.b, plain.b);
    assert_eq!(hooked.d, plain.d);
    assert_eq!(hooked.e, plain.e);
    assert_eq!(hooked.f, plain.f);
    assert_eq!(hooked.c, 9.0);
    assert_eq!(hooked.g, 0);

    assert_eq!(registry.unhook_slot(slot, pass), Ok(true));
    assert_eq!(registry.unhook_slot(slot, modify), Ok(true));
    assert_eq!(registry.slot_target(slot), Some(SlotTarget::Original));
    assert_eq!(lib.call_large(sample_large(), 5, 2.0), plain);
}
