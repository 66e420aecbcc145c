use super::*;
use crate::runtime::libraries::enumerate_libraries;
use std::cell::Cell;
use std::ffi::c_char;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

// 改写测试程序自身 clock GOT 或观察全局回收列表的测试必须串行
static SERIAL: Mutex<()> = Mutex::new(());

type ClockFn = unsafe extern "C" fn() -> libc::clock_t;

unsafe extern "C" {
    fn clock() -> libc::clock_t;
}

#[inline(never)]
fn call_clock() -> libc::clock_t {
    unsafe { clock() }
}

fn fresh_registry() -> HookRegistry {
    HookRegistry::new(RegistryConfig {
        debug: false,
        reclaim_delay: Duration::ZERO,
    })
}

fn exe_path() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|path| path.to_str().map(str::to_string))
        .unwrap_or_default()
}

fn exe_clock_slots() -> Vec<usize> {
    let libs = enumerate_libraries();
    let main = libs.iter().find(|lib| lib.is_main).expect("main executable");
    let elf = unsafe { Elf::init(main.base_addr, &main.pathname) }.expect("parse main executable");
    elf.find_got_slots("clock").expect("relocation tables")
}

fn clock_spec(hook: ClockFn) -> PltHookSpec {
    PltHookSpec::new("clock", hook as *mut c_void)
}

fn hook_exe(registry: &HookRegistry, spec: &mut PltHookSpec) -> usize {
    registry.hook_single_lib(&exe_path(), std::slice::from_mut(spec))
}

fn unhook_exe(registry: &HookRegistry, spec: &mut PltHookSpec) -> usize {
    registry.unhook_single_lib(&exe_path(), std::slice::from_mut(spec))
}

unsafe extern "C" fn clock_a() -> libc::clock_t {
    11
}

unsafe extern "C" fn clock_b() -> libc::clock_t {
    crate::call_prev!(clock_b, ClockFn) * 13
}

unsafe extern "C" fn clock_c() -> libc::clock_t {
    crate::call_prev!(clock_c, ClockFn) * 17
}

// 同一次调用里多次 call-previous 必须落到同一个目标
unsafe extern "C" fn clock_sum5() -> libc::clock_t {
    let mut total = 0;
    for _ in 0..5 {
        total += crate::call_prev!(clock_sum5, ClockFn);
    }
    total
}

unsafe extern "C" fn clock_beef() -> libc::clock_t {
    0xbeef
}

#[test]
fn chain_composes_newest_first_and_relinks_on_removal() {
    let _serial = SERIAL.lock_or_poison();
    let registry = fresh_registry();
    let mut a = clock_spec(clock_a);
    let mut b = clock_spec(clock_b);
    let mut c = clock_spec(clock_c);

    assert_eq!(hook_exe(&registry, &mut a), 0);
    assert!(a.hook_result >= 1);
    assert_eq!(hook_exe(&registry, &mut b), 0);
    assert_eq!(hook_exe(&registry, &mut c), 0);
    assert_eq!(call_clock(), 2431);

    assert_eq!(unhook_exe(&registry, &mut b), 0);
    assert_eq!(call_clock(), 187);
    assert_eq!(unhook_exe(&registry, &mut c), 0);
    assert_eq!(call_clock(), 11);
    assert_eq!(unhook_exe(&registry, &mut a), 0);
    assert_ne!(call_clock(), 11);

    for slot in exe_clock_slots() {
        assert_eq!(registry.slot_target(slot), Some(SlotTarget::Original));
    }
}

#[test]
fn reinstalled_hook_takes_the_top_position() {
    let _serial = SERIAL.lock_or_poison();
    let registry = fresh_registry();
    let mut a = clock_spec(clock_a);
    let mut b = clock_spec(clock_b);
    let mut c = clock_spec(clock_c);

    assert_eq!(hook_exe(&registry, &mut a), 0);
    assert_eq!(hook_exe(&registry, &mut b), 0);
    assert_eq!(call_clock(), 143);
    assert_eq!(unhook_exe(&registry, &mut b), 0);
    assert_eq!(call_clock(), 11);
    assert_eq!(hook_exe(&registry, &mut c), 0);
    assert_eq!(call_clock(), 187);
    assert_eq!(hook_exe(&registry, &mut b), 0);
    assert_eq!(call_clock(), 2431);
}

#[test]
fn call_prev_is_idempotent_within_one_invocation() {
    let _serial = SERIAL.lock_or_poison();
    let registry = fresh_registry();
    let mut a = clock_spec(clock_a);
    let mut sum = clock_spec(clock_sum5);
    let mut c = clock_spec(clock_c);

    assert_eq!(hook_exe(&registry, &mut a), 0);
    assert_eq!(hook_exe(&registry, &mut sum), 0);
    assert_eq!(call_clock(), 55);
    assert_eq!(hook_exe(&registry, &mut c), 0);
    assert_eq!(call_clock(), 935);
}

#[test]
fn no_chaining_hook_owns_the_slot() {
    let _serial = SERIAL.lock_or_poison();
    let registry = fresh_registry();
    let mut exclusive = clock_spec(clock_beef).no_chaining();
    let mut a = clock_spec(clock_a);

    assert_eq!(hook_exe(&registry, &mut exclusive), 0);
    assert!(exclusive.hook_result >= 1);
    assert_eq!(call_clock(), 0xbeef);
    for slot in exe_clock_slots() {
        assert_eq!(
            registry.slot_target(slot),
            Some(SlotTarget::Direct(clock_beef as usize))
        );
    }

    assert!(hook_exe(&registry, &mut a) >= 1);
    assert_eq!(a.hook_result, 0);
    assert_eq!(call_clock(), 0xbeef);

    // 第二个 no-chaining 同样被拒绝
    let mut again = clock_spec(clock_beef).no_chaining();
    assert!(hook_exe(&registry, &mut again) >= 1);
    assert_eq!(again.hook_result, 0);

    assert_eq!(unhook_exe(&registry, &mut exclusive), 0);
    assert_ne!(call_clock(), 0xbeef);
    assert_eq!(hook_exe(&registry, &mut a), 0);
    assert!(a.hook_result >= 1);
    assert_eq!(call_clock(), 11);
}

#[test]
fn redundant_unhook_is_not_a_failure() {
    let _serial = SERIAL.lock_or_poison();
    let registry = fresh_registry();
    let mut a = clock_spec(clock_a);
    let mut b = clock_spec(clock_b);

    assert_eq!(unhook_exe(&registry, &mut b), 0);
    assert_eq!(b.hook_result, 0);

    assert_eq!(hook_exe(&registry, &mut a), 0);
    assert_eq!(unhook_exe(&registry, &mut b), 0);
    assert_eq!(b.hook_result, 0);
    assert_eq!(call_clock(), 11);
}

#[test]
fn filter_limits_hooking_to_selected_libraries() {
    let _serial = SERIAL.lock_or_poison();
    let registry = fresh_registry();
    let exe = exe_path();
    let exe_name = exe.rsplit('/').next().unwrap_or_default().to_string();
    let mut specs = [clock_spec(clock_a)];
    let mut seen = Vec::new();

    // 过滤器拿到的是不带目录的库名
    let failures = registry.hook_all_libs(&mut specs, |library, symbol| {
        seen.push(library.to_string());
        assert_eq!(symbol, "clock");
        library == exe_name
    });
    assert_eq!(failures, 0);
    assert_eq!(specs[0].hook_result, exe_clock_slots().len());
    assert!(seen.len() > 1);
    assert!(seen.iter().all(|name| !name.contains('/')), "{seen:?}");
    assert!(seen.iter().any(|name| name.starts_with("libc.so")));
    assert_eq!(call_clock(), 11);

    let failures = registry.unhook_all_libs(&mut specs, |library, _| library == exe_name);
    assert_eq!(failures, 0);
    assert_ne!(call_clock(), 11);
}

#[test]
fn filter_on_bare_soname_reaches_the_library() {
    let _serial = SERIAL.lock_or_poison();
    let registry = fresh_registry();
    let libc_name = enumerate_libraries()
        .iter()
        .map(|lib| lib.name().to_string())
        .find(|name| name.starts_with("libc.so"))
        .expect("libc loaded");
    let mut specs = [PltHookSpec::new("plt_chain_symbol_nobody_imports", clock_a as *mut c_void)];
    let mut matched = 0;

    let failures = registry.hook_all_libs(&mut specs, |library, _| {
        let hit = library == libc_name;
        matched += usize::from(hit);
        hit
    });
    assert_eq!(failures, 0);
    assert_eq!(matched, 1);
    assert_eq!(specs[0].hook_result, 0);
}

#[test]
fn callee_rule_selects_slots_by_bound_target() {
    let _serial = SERIAL.lock_or_poison();
    let registry = fresh_registry();

    let mut elsewhere = clock_spec(clock_a).with_callee("libnot_loaded_anywhere.so");
    assert_eq!(hook_exe(&registry, &mut elsewhere), 0);
    assert_eq!(elsewhere.hook_result, 0);
    assert_ne!(call_clock(), 11);

    let mut libc_spec = clock_spec(clock_a).with_callee("libc.so");
    assert_eq!(hook_exe(&registry, &mut libc_spec), 0);
    assert!(libc_spec.hook_result >= 1);
    assert_eq!(call_clock(), 11);
}

#[test]
fn missing_library_counts_every_spec_on_hook_only() {
    let registry = fresh_registry();
    let mut specs = [clock_spec(clock_a), clock_spec(clock_b)];
    assert_eq!(registry.hook_single_lib("libno_such_library.so", &mut specs), 2);
    assert_eq!(registry.unhook_single_lib("libno_such_library.so", &mut specs), 0);
    assert!(specs.iter().all(|spec| spec.hook_result == 0));
}

#[test]
fn invalid_spec_is_a_failure() {
    let _serial = SERIAL.lock_or_poison();
    let registry = fresh_registry();
    let mut specs = [
        PltHookSpec::new("clock", std::ptr::null_mut()),
        PltHookSpec::new("", clock_a as *mut c_void),
    ];
    assert_eq!(registry.hook_single_lib(&exe_path(), &mut specs), 2);
}

#[test]
fn filter_callback_cannot_reenter() {
    let cell = AtomicUsize::new(synthetic_base as usize);
    let registry = fresh_registry();
    let inner_failures = Cell::new(None);
    let inner_slot_error = Cell::new(None);
    let mut specs = [clock_spec(clock_a)];

    let failures = registry.hook_all_libs(&mut specs, |_, _| {
        if inner_failures.get().is_none() {
            let mut inner = [clock_spec(clock_b), clock_spec(clock_c)];
            inner_failures.set(Some(registry.hook_single_lib("libc.so", &mut inner)));
            let slot = cell.as_ptr() as usize;
            let result = unsafe { registry.hook_slot(slot, "clock", clock_b as *mut c_void, false) };
            inner_slot_error.set(result.err());
        }
        false
    });
    assert_eq!(failures, 0);
    assert_eq!(inner_failures.get(), Some(2));
    assert_eq!(inner_slot_error.get(), Some(Errno::Reentrant));
}

// 以下测试使用内存中的合成 slot
type IntFn = unsafe extern "C" fn() -> i64;

unsafe extern "C" fn synthetic_base() -> i64 {
    -1
}

unsafe extern "C" fn synthetic_one() -> i64 {
    1
}

unsafe extern "C" fn synthetic_double() -> i64 {
    crate::call_prev!(synthetic_double, IntFn) * 2
}

unsafe extern "C" fn synthetic_triple() -> i64 {
    crate::call_prev!(synthetic_triple, IntFn) * 3
}

fn call_through(cell: &AtomicUsize) -> i64 {
    let func: IntFn = unsafe { std::mem::transmute(cell.load(Ordering::SeqCst)) };
    unsafe { func() }
}

#[test]
fn duplicate_registration_is_reference_counted() {
    let cell = AtomicUsize::new(synthetic_base as usize);
    let registry = fresh_registry();
    let slot = cell.as_ptr() as usize;
    let hook = synthetic_one as *mut c_void;

    unsafe {
        registry.hook_slot(slot, "synthetic", hook, false).unwrap();
        registry.hook_slot(slot, "synthetic", hook, false).unwrap();
    }
    assert_eq!(call_through(&cell), 1);
    assert_eq!(registry.slot_target(slot), Some(SlotTarget::Trampoline));

    assert_eq!(unsafe { registry.unhook_slot(slot, hook) }, Ok(true));
    assert_eq!(registry.slot_target(slot), Some(SlotTarget::Trampoline));
    assert_eq!(call_through(&cell), 1);

    assert_eq!(unsafe { registry.unhook_slot(slot, hook) }, Ok(true));
    assert_eq!(registry.slot_target(slot), Some(SlotTarget::Original));
    assert_eq!(cell.load(Ordering::SeqCst), synthetic_base as usize);
    assert_eq!(unsafe { registry.unhook_slot(slot, hook) }, Ok(false));
}

#[test]
fn dropping_the_registry_restores_slots() {
    let cell = AtomicUsize::new(synthetic_base as usize);
    let slot = cell.as_ptr() as usize;
    {
        let registry = fresh_registry();
        unsafe {
            registry
                .hook_slot(slot, "synthetic", synthetic_one as *mut c_void, false)
                .unwrap();
        }
        assert_eq!(call_through(&cell), 1);
    }
    assert_eq!(cell.load(Ordering::SeqCst), synthetic_base as usize);
    assert_eq!(call_through(&cell), -1);
}

#[test]
fn external_rewrite_of_an_empty_slot_becomes_the_new_original() {
    let cell = AtomicUsize::new(synthetic_base as usize);
    let registry = fresh_registry();
    let slot = cell.as_ptr() as usize;
    let hook = synthetic_double as *mut c_void;

    unsafe {
        registry.hook_slot(slot, "synthetic", hook, false).unwrap();
        assert_eq!(registry.unhook_slot(slot, hook), Ok(true));
    }
    cell.store(synthetic_one as usize, Ordering::SeqCst);

    unsafe { registry.hook_slot(slot, "synthetic", hook, false).unwrap() };
    assert_eq!(call_through(&cell), 2);
    unsafe { registry.unhook_slot(slot, hook).unwrap() };
    assert_eq!(cell.load(Ordering::SeqCst), synthetic_one as usize);
}

static PARKED: AtomicBool = AtomicBool::new(false);
static RELEASE: AtomicBool = AtomicBool::new(false);

// 停在 hook 里直到测试放行，模拟阻塞在被 hook 的 read/epoll_wait 上的线程
unsafe extern "C" fn synthetic_parked() -> i64 {
    PARKED.store(true, Ordering::SeqCst);
    while !RELEASE.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(1));
    }
    crate::call_prev!(synthetic_parked, IntFn)
}

#[test]
fn parked_call_only_holds_back_its_own_hub() {
    let _serial = SERIAL.lock_or_poison();
    let parked_cell = Arc::new(AtomicUsize::new(synthetic_base as usize));
    let busy_cell = AtomicUsize::new(synthetic_base as usize);
    let registry = fresh_registry();
    let parked_slot = parked_cell.as_ptr() as usize;
    let busy_slot = busy_cell.as_ptr() as usize;

    unsafe {
        registry
            .hook_slot(parked_slot, "parked", synthetic_parked as *mut c_void, false)
            .unwrap();
    }
    let caller = {
        let cell = Arc::clone(&parked_cell);
        std::thread::spawn(move || call_through(&cell))
    };
    while !PARKED.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(1));
    }

    let hook = synthetic_one as *mut c_void;
    for _ in 0..1000 {
        unsafe {
            registry.hook_slot(busy_slot, "busy", hook, false).unwrap();
            assert_eq!(registry.unhook_slot(busy_slot, hook), Ok(true));
        }
    }
    let retired = crate::runtime::hub::retired_len();
    assert!(retired < 64, "retired list grew to {retired}");

    RELEASE.store(true, Ordering::SeqCst);
    assert_eq!(caller.join().expect("parked caller"), -1);
}

struct FailingInstaller;

impl SlotInstaller for FailingInstaller {
    fn read_slot(&self, slot: usize) -> Result<usize, Errno> {
        Ok(unsafe { (*(slot as *const AtomicUsize)).load(Ordering::SeqCst) })
    }

    fn write_slot(&self, _slot: usize, _value: usize) -> Result<(), Errno> {
        Err(Errno::GotVerify)
    }
}

#[test]
fn failed_write_leaves_slot_and_chain_untouched() {
    let cell = AtomicUsize::new(synthetic_base as usize);
    let registry = HookRegistry::with_installer(RegistryConfig::default(), Box::new(FailingInstaller));
    let slot = cell.as_ptr() as usize;

    let result = unsafe { registry.hook_slot(slot, "synthetic", synthetic_one as *mut c_void, false) };
    assert_eq!(result, Err(Errno::GotVerify));
    assert_eq!(registry.slot_target(slot), Some(SlotTarget::Original));
    assert_eq!(cell.load(Ordering::SeqCst), synthetic_base as usize);
    assert_eq!(
        unsafe { registry.unhook_slot(slot, synthetic_one as *mut c_void) },
        Ok(false)
    );
}

#[test]
fn concurrent_callers_see_whole_chains() {
    let _serial = SERIAL.lock_or_poison();
    let cell = Arc::new(AtomicUsize::new(synthetic_base as usize));
    let registry = fresh_registry();
    let slot = cell.as_ptr() as usize;
    let stop = Arc::new(AtomicBool::new(false));

    unsafe {
        registry
            .hook_slot(slot, "synthetic", synthetic_one as *mut c_void, false)
            .unwrap();
    }

    let callers: Vec<_> = (0..4)
        .map(|_| {
            let cell = Arc::clone(&cell);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                let mut calls = 0usize;
                while !stop.load(Ordering::Relaxed) {
                    let value = call_through(&cell);
                    assert!(matches!(value, 1 | 2 | 3 | 6), "torn chain result {value}");
                    calls += 1;
                }
                calls
            })
        })
        .collect();

    let double = synthetic_double as *mut c_void;
    let triple = synthetic_triple as *mut c_void;
    for round in 0..500 {
        unsafe {
            if round % 2 == 0 {
                registry.hook_slot(slot, "synthetic", double, false).unwrap();
                registry.hook_slot(slot, "synthetic", triple, false).unwrap();
            } else {
                assert_eq!(registry.unhook_slot(slot, double), Ok(true));
                assert_eq!(registry.unhook_slot(slot, triple), Ok(true));
            }
        }
    }
    stop.store(true, Ordering::Relaxed);
    for caller in callers {
        assert!(caller.join().expect("caller thread") > 0);
    }
    assert_eq!(call_through(&cell), 1);
}

// 大结构体按值传递与返回，经过两层 trampoline
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq)]
struct Large {
    a: f64,
    b: i32,
    c: f64,
    d: *const c_char,
    e: i64,
    f: i64,
    g: u8,
}

type LargeFn =
    unsafe extern "C" fn(Large, i32, f64, i64, i64, i64, i64, i64, i64, i64) -> Large;

const LARGE_TAG: &std::ffi::CStr = c"large";

fn sample_large() -> Large {
    Large {
        a: 1.5,
        b: -7,
        c: 2.25,
        d: LARGE_TAG.as_ptr(),
        e: 0x1122_3344_5566_7788,
        f: -99,
        g: 0xa5,
    }
}

unsafe extern "C" fn large_orig(
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
    value.a += x;
    value.b += i;
    value.e = s1 + s2 + s3 + s4 + s5 + s6 + s7;
    value
}

fn check_large_args(value: &Large, i: i32, x: f64, stack: [i64; 7]) {
    assert_eq!(*value, sample_large());
    assert_eq!(i, 3);
    assert_eq!(x.to_bits(), 0.125f64.to_bits());
    assert_eq!(stack, [1, 2, 3, 4, 5, 6, 7]);
}

// 先安装：改写返回值
unsafe extern "C" fn large_modify(
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
    let mut result = crate::call_prev!(large_modify, LargeFn, value, i, x, s1, s2, s3, s4, s5, s6, s7);
    result.g = 0x5a;
    result.f = 4242;
    result
}

// 后安装：原样透传
unsafe extern "C" fn large_pass(
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
    crate::call_prev!(large_pass, LargeFn, value, i, x, s1, s2, s3, s4, s5, s6, s7)
}

#[test]
fn aggregates_survive_the_trampoline() {
    let cell = AtomicUsize::new(large_orig as usize);
    let registry = fresh_registry();
    let slot = cell.as_ptr() as usize;
    let call = || {
        let func: LargeFn = unsafe { std::mem::transmute(cell.load(Ordering::SeqCst)) };
        unsafe { func(sample_large(), 3, 0.125, 1, 2, 3, 4, 5, 6, 7) }
    };
    let unhooked = call();

    unsafe {
        registry
            .hook_slot(slot, "large", large_modify as *mut c_void, false)
            .unwrap();
        registry
            .hook_slot(slot, "large", large_pass as *mut c_void, false)
            .unwrap();
    }
    let hooked = call();
    assert_eq!(hooked.a, unhooked.a);
    assert_eq!(hooked.b, unhooked.b);
    assert_eq!(hooked.c, unhooked.c);
    assert_eq!(hooked.d, unhooked.d);
    assert_eq!(hooked.e, 28);
    assert_eq!(hooked.f, 4242);
    assert_eq!(hooked.g, 0x5a);
}
