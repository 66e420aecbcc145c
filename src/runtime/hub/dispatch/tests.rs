use super::*;
use std::sync::atomic::{AtomicPtr, AtomicUsize};

const ORIG: usize = 0x0f00;
const A: usize = 0xa000;
const B: usize = 0xb000;
const C: usize = 0xc000;

fn fake_hub(hooks: &[usize]) -> Box<Hub> {
    Box::new(Hub {
        trampo: 0,
        chain: AtomicPtr::new(super::super::new_snapshot(hooks, ORIG)),
        in_flight: AtomicUsize::new(0),
    })
}

fn drop_hub(hub: Box<Hub>) {
    assert_eq!(hub.in_flight.load(Ordering::SeqCst), 0);
    unsafe { drop(Box::from_raw(hub.chain.load(Ordering::SeqCst))) };
}

fn frame_count() -> usize {
    with_frames(|stack| stack.live().len()).unwrap()
}

#[test]
fn empty_chain_bypasses_to_original() {
    let hub = fake_hub(&[]);
    let result = unsafe { hub_enter(&*hub, 0x1234, 0x7000) };
    assert_eq!(
        result,
        EnterResult {
            target: ORIG,
            tracked: 0
        }
    );
    assert_eq!(frame_count(), 0);
    drop_hub(hub);
}

#[test]
fn previous_is_relative_to_calling_hook() {
    let hub = fake_hub(&[C, B, A]);
    let result = unsafe { hub_enter(&*hub, 0x1234, 0x7000) };
    assert_eq!(result, EnterResult { target: C, tracked: 1 });

    // 同一次调用中重复求值不会沿链下移
    assert_eq!(get_prev_func(C), B);
    assert_eq!(get_prev_func(C), B);
    assert_eq!(get_prev_func(B), A);
    assert_eq!(get_prev_func(A), ORIG);

    assert_eq!(unsafe { hub_exit(&*hub, 0x7000) }, 0x1234);
    assert_eq!(frame_count(), 0);
    drop_hub(hub);
}

#[test]
fn entered_call_keeps_its_snapshot() {
    let hub = fake_hub(&[C, B, A]);
    unsafe { hub_enter(&*hub, 0x1234, 0x7000) };

    // 调用进行中摘除 B，已进入的调用仍按旧链解析
    let old = hub.chain.swap(super::super::new_snapshot(&[C, A], ORIG), Ordering::SeqCst);
    assert_eq!(get_prev_func(C), B);

    unsafe { hub_enter(&*hub, 0x5678, 0x6000) };
    assert_eq!(get_prev_func(C), A);
    assert_eq!(unsafe { hub_exit(&*hub, 0x6000) }, 0x5678);
    assert_eq!(get_prev_func(C), B);
    assert_eq!(unsafe { hub_exit(&*hub, 0x7000) }, 0x1234);

    unsafe { drop(Box::from_raw(old)) };
    drop_hub(hub);
}

#[test]
fn nested_hubs_resolve_independently() {
    let outer = fake_hub(&[A]);
    let inner = fake_hub(&[C, B]);
    unsafe { hub_enter(&*outer, 0x1111, 0x7000) };
    unsafe { hub_enter(&*inner, 0x2222, 0x6f00) };

    assert_eq!(get_prev_func(C), B);
    assert_eq!(get_prev_func(B), ORIG);
    assert_eq!(get_prev_func(A), ORIG);

    assert_eq!(unsafe { hub_exit(&*inner, 0x6f00) }, 0x2222);
    assert_eq!(unsafe { hub_exit(&*outer, 0x7000) }, 0x1111);
    drop_hub(inner);
    drop_hub(outer);
}

#[test]
fn abandoned_frames_are_pruned_on_entry() {
    let hub = fake_hub(&[A]);
    // 较深的帧未经 hub_exit 就离开了
    unsafe { hub_enter(&*hub, 0x1111, 0x6000) };
    unsafe { hub_enter(&*hub, 0x2222, 0x7000) };
    assert_eq!(frame_count(), 1);
    assert_eq!(unsafe { hub_exit(&*hub, 0x7000) }, 0x2222);
    assert_eq!(frame_count(), 0);
    drop_hub(hub);
}

#[test]
fn exit_of_outer_frame_discards_frames_above_it() {
    let outer = fake_hub(&[A]);
    let inner = fake_hub(&[B]);
    unsafe { hub_enter(&*outer, 0x1111, 0x7000) };
    unsafe { hub_enter(&*inner, 0x2222, 0x6000) };
    assert_eq!(unsafe { hub_exit(&*outer, 0x7000) }, 0x1111);
    assert_eq!(frame_count(), 0);
    drop_hub(inner);
    drop_hub(outer);
}

#[test]
fn tail_dispatch_at_same_depth_is_kept() {
    let first = fake_hub(&[A]);
    let second = fake_hub(&[B]);
    unsafe { hub_enter(&*first, 0x1111, 0x7000) };
    // A 尾跳进另一个被 hook 的 slot，两帧的 caller_sp 相同
    unsafe { hub_enter(&*second, 0x2222, 0x7000) };
    assert_eq!(frame_count(), 2);
    assert_eq!(unsafe { hub_exit(&*second, 0x7000) }, 0x2222);
    assert_eq!(unsafe { hub_exit(&*first, 0x7000) }, 0x1111);
    drop_hub(second);
    drop_hub(first);
}

#[test]
fn in_flight_is_counted_per_hub() {
    let busy = fake_hub(&[A]);
    let idle = fake_hub(&[B]);
    let empty = fake_hub(&[]);
    unsafe { hub_enter(&*busy, 0x1111, 0x7000) };
    unsafe { hub_enter(&*empty, 0x2222, 0x6000) };
    assert_eq!(busy.in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(idle.in_flight.load(Ordering::SeqCst), 0);
    assert_eq!(empty.in_flight.load(Ordering::SeqCst), 0);

    // 被剪掉的遗留帧同样归还各自 hub 的计数
    unsafe { hub_enter(&*idle, 0x3333, 0x6800) };
    unsafe { hub_enter(&*busy, 0x4444, 0x7800) };
    assert_eq!(idle.in_flight.load(Ordering::SeqCst), 0);
    assert_eq!(busy.in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(unsafe { hub_exit(&*busy, 0x7800) }, 0x4444);
    assert_eq!(frame_count(), 0);

    drop_hub(empty);
    drop_hub(idle);
    drop_hub(busy);
}

#[test]
fn no_chaining_registry_is_refcounted() {
    note_no_chaining(0xdead0, true);
    note_no_chaining(0xdead0, true);
    note_no_chaining(0xdead0, false);
    assert!(is_no_chaining_hook(0xdead0));
    note_no_chaining(0xdead0, false);
    assert!(!is_no_chaining_hook(0xdead0));
}
