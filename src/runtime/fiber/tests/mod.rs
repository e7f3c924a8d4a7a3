//! Fiber 单元测试

use crate::runtime::fiber::{
    mask_of, FiberHandle, FiberStatus, Signal, Step, MASK_ALL, MASK_ERROR, MASK_NONE,
};
use crate::runtime::scheduler::OpCtx;
use crate::runtime::value::Value;

fn noop_body(_cx: &mut OpCtx<'_>, _input: Value) -> Step {
    Step::Done(Value::Nil)
}

#[test]
fn test_signal_indices_are_distinct() {
    let signals = [
        Signal::Ok,
        Signal::Error,
        Signal::Debug,
        Signal::Yield,
        Signal::User(0),
        Signal::User(7),
        Signal::INTERRUPT,
        Signal::EVENT,
    ];
    for (i, a) in signals.iter().enumerate() {
        for b in &signals[i + 1..] {
            assert_ne!(a.index(), b.index(), "{a:?} and {b:?} collide");
        }
    }
}

#[test]
fn test_reserved_signals() {
    assert_eq!(Signal::EVENT, Signal::User(9));
    assert_eq!(Signal::INTERRUPT, Signal::User(8));
    assert_eq!(Signal::EVENT.name(), "event");
    assert_eq!(Signal::INTERRUPT.name(), "interrupt");
}

#[test]
fn test_mask_of() {
    let mask = mask_of(&[Signal::Error, Signal::Yield]);
    assert_ne!(mask & Signal::Error.bit(), 0);
    assert_ne!(mask & Signal::Yield.bit(), 0);
    assert_eq!(mask & Signal::Debug.bit(), 0);
    assert_eq!(MASK_ERROR, Signal::Error.bit());
    assert_eq!(MASK_NONE, 0);
    assert_eq!(MASK_ALL & Signal::User(5).bit(), Signal::User(5).bit());
}

#[test]
fn test_status_predicates() {
    assert!(FiberStatus::Dead.is_finished());
    assert!(FiberStatus::Error.is_finished());
    assert!(!FiberStatus::New.is_finished());
    assert!(!FiberStatus::Pending.is_finished());

    assert!(FiberStatus::New.is_resumable());
    assert!(FiberStatus::Pending.is_resumable());
    assert!(FiberStatus::User(9).is_resumable());
    assert!(!FiberStatus::Alive.is_resumable());
    assert!(!FiberStatus::Dead.is_resumable());
    assert!(!FiberStatus::Error.is_resumable());
}

#[test]
fn test_status_for_signal() {
    assert_eq!(FiberStatus::for_signal(Signal::Ok), FiberStatus::Dead);
    assert_eq!(FiberStatus::for_signal(Signal::Error), FiberStatus::Error);
    assert_eq!(FiberStatus::for_signal(Signal::Yield), FiberStatus::Pending);
    assert_eq!(
        FiberStatus::for_signal(Signal::EVENT),
        FiberStatus::User(9)
    );
}

#[test]
fn test_new_fiber_state() {
    let f = FiberHandle::new(noop_body, MASK_NONE);
    assert_eq!(f.status(), FiberStatus::New);
    assert_eq!(f.generation(), 0);
    assert!(!f.is_finished());
    assert!(f.supervisor().is_none());
}

#[test]
fn test_fiber_ids_unique() {
    let a = FiberHandle::new(noop_body, MASK_NONE);
    let b = FiberHandle::new(noop_body, MASK_NONE);
    assert_ne!(a.id(), b.id());
    assert!(a.ptr_eq(&a));
    assert!(!a.ptr_eq(&b));
}

#[test]
fn test_catches_follows_mask() {
    let f = FiberHandle::new(noop_body, mask_of(&[Signal::Error, Signal::User(2)]));
    assert!(f.catches(Signal::Error));
    assert!(f.catches(Signal::User(2)));
    assert!(!f.catches(Signal::Yield));
    assert!(!f.catches(Signal::User(3)));
}
