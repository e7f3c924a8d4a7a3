//! Scheduler 单元测试
//!
//! 测试事件循环的调度、超时、通道与子纤程行为


use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::runtime::channel::Channel;
use crate::runtime::errors::RuntimeError;
use crate::runtime::fiber::{mask_of, FiberStatus, Signal, Step};
use crate::runtime::scheduler::{EventLoop, EventLoopConfig, OpCtx, SelectClause};
use crate::runtime::stream::pipe;
use crate::runtime::value::Value;

#[test]
fn test_run_fiber_completes() {
    let mut ev = EventLoop::new().unwrap();
    let f = ev.spawn(|_cx: &mut OpCtx<'_>, input: Value| Step::Done(input));
    let out = ev.run_fiber(&f, Value::Int(7)).unwrap();
    assert_eq!(out, Value::Int(7));
    assert_eq!(f.status(), FiberStatus::Dead);
}

#[test]
fn test_schedule_at_most_once() {
    let mut ev = EventLoop::new().unwrap();
    let count = Rc::new(RefCell::new(0));
    let count2 = count.clone();
    let f = ev.spawn(move |_cx: &mut OpCtx<'_>, _input: Value| {
        *count2.borrow_mut() += 1;
        Step::Done(Value::Nil)
    });
    ev.schedule(&f, Value::Nil);
    ev.schedule(&f, Value::Nil);
    ev.run().unwrap();
    assert_eq!(*count.borrow(), 1);

    // Scheduling a finished fiber is ignored too.
    ev.schedule(&f, Value::Nil);
    ev.run().unwrap();
    assert_eq!(*count.borrow(), 1);
}

#[test]
fn test_sleep_resumes_after_delay() {
    let mut ev = EventLoop::new().unwrap();
    let mut stage = 0;
    let f = ev.spawn(move |cx: &mut OpCtx<'_>, _input: Value| {
        if stage == 0 {
            stage = 1;
            cx.sleep(Duration::from_millis(20))
        } else {
            Step::Done(Value::str("woke"))
        }
    });
    let start = Instant::now();
    let out = ev.run_fiber(&f, Value::Nil).unwrap();
    assert_eq!(out, Value::str("woke"));
    assert!(start.elapsed() >= Duration::from_millis(20));
}

#[test]
fn test_await_resume_waits_for_schedule() {
    let mut ev = EventLoop::new().unwrap();
    let mut stage = 0;
    let target = ev.spawn(move |cx: &mut OpCtx<'_>, input: Value| {
        if stage == 0 {
            stage = 1;
            cx.await_resume()
        } else {
            Step::Done(input)
        }
    });
    let target2 = target.clone();
    let waker = ev.spawn(move |cx: &mut OpCtx<'_>, _input: Value| {
        cx.ev.schedule(&target2, Value::Int(9));
        Step::Done(Value::Nil)
    });
    ev.schedule(&target, Value::Nil);
    ev.schedule(&waker, Value::Nil);
    ev.run().unwrap();
    assert_eq!(target.last_value(), Value::Int(9));
    assert_eq!(target.status(), FiberStatus::Dead);
}

#[test]
fn test_cancel_sleeping_fiber() {
    let mut ev = EventLoop::new().unwrap();
    let mut stage = 0;
    let target = ev.spawn(move |cx: &mut OpCtx<'_>, _input: Value| {
        if stage == 0 {
            stage = 1;
            cx.sleep(Duration::from_millis(150))
        } else {
            Step::Done(Value::str("should not get here"))
        }
    });
    let target2 = target.clone();
    let mut cstage = 0;
    let canceller = ev.spawn(move |cx: &mut OpCtx<'_>, _input: Value| {
        if cstage == 0 {
            cstage = 1;
            cx.sleep(Duration::from_millis(10))
        } else {
            cx.ev.cancel(&target2, Value::str("stop"));
            Step::Done(Value::Nil)
        }
    });
    ev.schedule(&target, Value::Nil);
    ev.schedule(&canceller, Value::Nil);
    ev.run().unwrap();
    assert_eq!(target.status(), FiberStatus::Error);
    assert_eq!(target.last_value(), Value::str("stop"));
}

#[test]
fn test_deadline_cancels_unfinished_fiber() {
    let mut ev = EventLoop::new().unwrap();
    let mut stage = 0;
    let f = ev.spawn(move |cx: &mut OpCtx<'_>, _input: Value| {
        if stage == 0 {
            stage = 1;
            cx.sleep(Duration::from_millis(100))
        } else {
            Step::Done(Value::Nil)
        }
    });
    ev.schedule(&f, Value::Nil);
    ev.add_deadline(&f, &f, Duration::from_millis(10));
    ev.run().unwrap();
    assert_eq!(f.status(), FiberStatus::Error);
    assert_eq!(f.last_value(), Value::str("deadline expired"));
}

#[test]
fn test_deadline_is_noop_when_fiber_finishes_first() {
    let mut ev = EventLoop::new().unwrap();
    let f = ev.spawn(|_cx: &mut OpCtx<'_>, _input: Value| Step::Done(Value::Int(1)));
    ev.schedule(&f, Value::Nil);
    ev.add_deadline(&f, &f, Duration::from_millis(10));
    ev.run().unwrap();
    assert_eq!(f.status(), FiberStatus::Dead);
    assert_eq!(f.last_value(), Value::Int(1));
}

#[test]
fn test_rendezvous_give_take() {
    let mut ev = EventLoop::new().unwrap();
    let chan = Channel::local(0);
    let log: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));

    let chan_p = chan.clone();
    let log_p = log.clone();
    let mut pstage = 0;
    let producer = ev.spawn(move |cx: &mut OpCtx<'_>, _input: Value| {
        if pstage == 0 {
            pstage = 1;
            cx.give(&chan_p, Value::Int(1))
        } else {
            log_p.borrow_mut().push("give done".into());
            Step::Done(Value::Nil)
        }
    });
    let chan_c = chan.clone();
    let log_c = log.clone();
    let mut cstage = 0;
    let consumer = ev.spawn(move |cx: &mut OpCtx<'_>, input: Value| {
        if cstage == 0 {
            cstage = 1;
            cx.take(&chan_c)
        } else {
            log_c.borrow_mut().push(format!("took {input}"));
            Step::Done(input)
        }
    });
    ev.schedule(&producer, Value::Nil);
    ev.schedule(&consumer, Value::Nil);
    ev.run().unwrap();

    assert_eq!(*log.borrow(), vec!["give done".to_string(), "took 1".to_string()]);
    assert_eq!(chan.count(), 0);
    assert_eq!(consumer.last_value(), Value::Int(1));
}

#[test]
fn test_backpressure_parks_giver_until_take() {
    let mut ev = EventLoop::new().unwrap();
    let chan = Channel::local(1);

    let chan_p = chan.clone();
    let mut pstage = 0;
    let producer = ev.spawn(move |cx: &mut OpCtx<'_>, _input: Value| {
        match pstage {
            0 => {
                pstage = 1;
                cx.give(&chan_p, Value::Int(1))
            }
            1 => {
                pstage = 2;
                cx.give(&chan_p, Value::Int(2))
            }
            _ => Step::Done(Value::Nil),
        }
    });
    ev.schedule(&producer, Value::Nil);
    ev.run().unwrap();

    // Second give overran capacity; the producer is parked, not done.
    assert!(!producer.is_finished());
    assert_eq!(chan.count(), 2);

    let chan_c = chan.clone();
    let mut cstage = 0;
    let consumer = ev.spawn(move |cx: &mut OpCtx<'_>, input: Value| {
        if cstage == 0 {
            cstage = 1;
            cx.take(&chan_c)
        } else {
            Step::Done(input)
        }
    });
    ev.schedule(&consumer, Value::Nil);
    ev.run().unwrap();

    assert_eq!(consumer.last_value(), Value::Int(1));
    assert_eq!(producer.status(), FiberStatus::Dead);
    assert_eq!(chan.count(), 1);
}

#[test]
fn test_close_wakes_blocked_taker_with_nil() {
    let mut ev = EventLoop::new().unwrap();
    let chan = Channel::local(0);
    let chan2 = chan.clone();
    let mut stage = 0;
    let taker = ev.spawn(move |cx: &mut OpCtx<'_>, input: Value| {
        if stage == 0 {
            stage = 1;
            cx.take(&chan2)
        } else {
            Step::Done(input)
        }
    });
    ev.schedule(&taker, Value::Nil);
    ev.run().unwrap();
    assert!(!taker.is_finished());

    chan.close(&mut ev);
    ev.run().unwrap();
    assert_eq!(taker.status(), FiberStatus::Dead);
    assert_eq!(taker.last_value(), Value::Nil);
}

#[test]
fn test_close_is_idempotent_and_items_survive() {
    let mut ev = EventLoop::new().unwrap();
    let chan = Channel::local(4);
    chan.give_noblock(&mut ev, Value::Int(5)).unwrap();
    chan.close(&mut ev);
    chan.close(&mut ev);
    assert!(chan.is_closed());
    assert_eq!(chan.count(), 1);

    // A taker still drains the buffered item, then sees nil.
    let chan2 = chan.clone();
    let mut stage = 0;
    let taker = ev.spawn(move |cx: &mut OpCtx<'_>, input: Value| match stage {
        0 => {
            stage = 1;
            cx.take(&chan2)
        }
        1 => {
            stage = 2;
            assert_eq!(input, Value::Int(5));
            cx.take(&chan2)
        }
        _ => Step::Done(input),
    });
    ev.schedule(&taker, Value::Nil);
    ev.run().unwrap();
    assert_eq!(taker.status(), FiberStatus::Dead);
    assert_eq!(taker.last_value(), Value::Nil);
}

#[test]
fn test_give_to_closed_channel_raises() {
    let mut ev = EventLoop::new().unwrap();
    let chan = Channel::local(1);
    chan.close(&mut ev);

    let chan2 = chan.clone();
    let giver = ev.spawn(move |cx: &mut OpCtx<'_>, _input: Value| {
        cx.give(&chan2, Value::Int(1))
    });
    ev.schedule(&giver, Value::Nil);
    ev.run().unwrap();
    assert_eq!(giver.status(), FiberStatus::Error);
    assert_eq!(
        giver.last_value(),
        Value::str(RuntimeError::ChannelClosed.to_string())
    );
}

#[test]
fn test_select_completes_first_ready_clause() {
    let mut ev = EventLoop::new().unwrap();
    let a = Channel::local(1);
    let b = Channel::local(1);
    a.give_noblock(&mut ev, Value::Int(42)).unwrap();

    let (a2, b2) = (a.clone(), b.clone());
    let mut stage = 0;
    let selector = ev.spawn(move |cx: &mut OpCtx<'_>, input: Value| {
        if stage == 0 {
            stage = 1;
            cx.select(vec![SelectClause::Take(a2.clone()), SelectClause::Take(b2.clone())])
        } else {
            Step::Done(input)
        }
    });
    ev.schedule(&selector, Value::Nil);
    ev.run().unwrap();

    match selector.last_value() {
        Value::Tuple(items) => {
            assert_eq!(items[0], Value::str("take"));
            assert!(matches!(&items[1], Value::Channel(c) if c.ptr_eq(&a)));
            assert_eq!(items[2], Value::Int(42));
        }
        other => panic!("expected tagged tuple, got {other}"),
    }
}

#[test]
fn test_select_give_clause_with_room_wins() {
    let mut ev = EventLoop::new().unwrap();
    let c = Channel::local(1);
    let c2 = c.clone();
    let mut stage = 0;
    let selector = ev.spawn(move |cx: &mut OpCtx<'_>, input: Value| {
        if stage == 0 {
            stage = 1;
            cx.select(vec![SelectClause::Give(c2.clone(), Value::Int(7))])
        } else {
            Step::Done(input)
        }
    });
    ev.schedule(&selector, Value::Nil);
    ev.run().unwrap();

    assert_eq!(c.count(), 1);
    match selector.last_value() {
        Value::Tuple(items) => {
            assert_eq!(items[0], Value::str("give"));
            assert!(matches!(&items[1], Value::Channel(chan) if chan.ptr_eq(&c)));
        }
        other => panic!("expected tagged tuple, got {other}"),
    }
}

#[test]
fn test_select_parks_and_first_move_wins() {
    let mut ev = EventLoop::new().unwrap();
    let a = Channel::local(0);
    let b = Channel::local(0);

    let (a2, b2) = (a.clone(), b.clone());
    let mut stage = 0;
    let selector = ev.spawn(move |cx: &mut OpCtx<'_>, input: Value| {
        if stage == 0 {
            stage = 1;
            cx.select(vec![SelectClause::Take(a2.clone()), SelectClause::Take(b2.clone())])
        } else {
            Step::Done(input)
        }
    });
    ev.schedule(&selector, Value::Nil);
    ev.run().unwrap();
    assert!(!selector.is_finished());

    let b3 = b.clone();
    let mut gstage = 0;
    let giver = ev.spawn(move |cx: &mut OpCtx<'_>, _input: Value| {
        if gstage == 0 {
            gstage = 1;
            cx.give(&b3, Value::Int(9))
        } else {
            Step::Done(Value::Nil)
        }
    });
    ev.schedule(&giver, Value::Nil);
    ev.run().unwrap();

    assert_eq!(selector.status(), FiberStatus::Dead);
    match selector.last_value() {
        Value::Tuple(items) => {
            assert_eq!(items[0], Value::str("take"));
            assert!(matches!(&items[1], Value::Channel(c) if c.ptr_eq(&b)));
            assert_eq!(items[2], Value::Int(9));
        }
        other => panic!("expected tagged tuple, got {other}"),
    }

    // The losing clause's parked entry is stale: a later give to `a` is
    // buffered, not lost and not delivered to the finished selector.
    a.give_noblock(&mut ev, Value::Int(1)).unwrap();
    assert_eq!(a.count(), 1);
}

#[test]
fn test_child_fiber_result_flows_to_parent() {
    let mut ev = EventLoop::new().unwrap();
    let child = ev.spawn(|_cx: &mut OpCtx<'_>, input: Value| match input {
        Value::Int(i) => Step::Done(Value::Int(i * 2)),
        _ => Step::Fail(Value::str("expected int")),
    });
    let child2 = child.clone();
    let mut stage = 0;
    let parent = ev.spawn(move |cx: &mut OpCtx<'_>, input: Value| {
        if stage == 0 {
            stage = 1;
            cx.resume_fiber(&child2, Value::Int(5))
        } else {
            Step::Done(input)
        }
    });
    ev.schedule(&parent, Value::Nil);
    ev.run().unwrap();

    assert_eq!(parent.last_value(), Value::Int(10));
    assert_eq!(child.status(), FiberStatus::Dead);
}

#[test]
fn test_child_error_caught_by_mask() {
    let mut ev = EventLoop::new().unwrap();
    let child = ev.spawn_masked(
        |_cx: &mut OpCtx<'_>, _input: Value| Step::Fail(Value::str("boom")),
        mask_of(&[Signal::Error]),
    );
    let child2 = child.clone();
    let mut stage = 0;
    let parent = ev.spawn(move |cx: &mut OpCtx<'_>, input: Value| {
        if stage == 0 {
            stage = 1;
            cx.resume_fiber(&child2, Value::Nil)
        } else {
            Step::Done(input)
        }
    });
    ev.schedule(&parent, Value::Nil);
    ev.run().unwrap();

    assert_eq!(parent.status(), FiberStatus::Dead);
    assert_eq!(
        parent.last_value(),
        Value::tuple(vec![Value::str("error"), Value::str("boom")])
    );
}

#[test]
fn test_child_error_uncaught_propagates() {
    let mut ev = EventLoop::new().unwrap();
    let child = ev.spawn(|_cx: &mut OpCtx<'_>, _input: Value| Step::Fail(Value::str("boom")));
    let child2 = child.clone();
    let mut stage = 0;
    let parent = ev.spawn(move |cx: &mut OpCtx<'_>, input: Value| {
        if stage == 0 {
            stage = 1;
            cx.resume_fiber(&child2, Value::Nil)
        } else {
            Step::Done(input)
        }
    });
    ev.schedule(&parent, Value::Nil);
    ev.run().unwrap();

    assert_eq!(parent.status(), FiberStatus::Error);
    assert_eq!(child.status(), FiberStatus::Error);
}

#[test]
fn test_supervisor_receives_error_notification() {
    let mut ev = EventLoop::new().unwrap();
    let sup = Channel::local(8);
    let f = ev.spawn(|_cx: &mut OpCtx<'_>, _input: Value| Step::Fail(Value::str("oops")));
    f.set_supervisor(sup.clone());
    ev.schedule(&f, Value::Nil);
    ev.run().unwrap();

    assert_eq!(sup.count(), 1);
    let got = match sup.take_now(&mut ev).unwrap() {
        crate::runtime::channel::Immediate::Ready(v) => v,
        other => panic!("expected buffered notification, got {other:?}"),
    };
    match got {
        Value::Tuple(items) => {
            assert_eq!(items[0], Value::str("error"));
            assert!(matches!(&items[1], Value::Fiber(h) if h.ptr_eq(&f)));
        }
        other => panic!("expected tuple, got {other}"),
    }
}

#[test]
fn test_continue_rejects_root_fiber() {
    let mut ev = EventLoop::new().unwrap();
    let f = ev.spawn(|_cx: &mut OpCtx<'_>, _input: Value| Step::Done(Value::Nil));
    ev.run_fiber(&f, Value::Nil).unwrap();
    assert!(matches!(
        ev.continue_fiber(&f, Value::Nil),
        Err(RuntimeError::CannotResumeRoot)
    ));
}

#[test]
fn test_step_lands_in_debug_state() {
    let mut ev = EventLoop::new().unwrap();
    let f = ev.spawn(|_cx: &mut OpCtx<'_>, _input: Value| {
        Step::Suspend(Signal::Yield, Value::Int(1))
    });
    let (sig, value) = ev.step(&f, Value::Nil).unwrap();
    assert_eq!(sig, Signal::Debug);
    assert_eq!(value, Value::Int(1));
    assert_eq!(f.status(), FiberStatus::Debug);
}

#[test]
fn test_continue_yielding_fiber_by_hand() {
    let mut ev = EventLoop::new().unwrap();
    let mut n = 0;
    let f = ev.spawn(move |_cx: &mut OpCtx<'_>, _input: Value| {
        n += 1;
        if n < 3 {
            Step::Suspend(Signal::Yield, Value::Int(n))
        } else {
            Step::Done(Value::Int(n))
        }
    });
    assert_eq!(ev.continue_fiber(&f, Value::Nil).unwrap(), (Signal::Yield, Value::Int(1)));
    assert_eq!(f.status(), FiberStatus::Pending);
    assert_eq!(ev.continue_fiber(&f, Value::Nil).unwrap(), (Signal::Yield, Value::Int(2)));
    assert_eq!(ev.continue_fiber(&f, Value::Nil).unwrap(), (Signal::Ok, Value::Int(3)));
    assert!(matches!(
        ev.continue_fiber(&f, Value::Nil),
        Err(RuntimeError::NotResumable(FiberStatus::Dead))
    ));
}

#[test]
fn test_schedule_tears_down_stale_read_listener() {
    let mut ev = EventLoop::new().unwrap();
    let (r, w) = pipe().unwrap();
    let chan = Channel::local(0);

    // Parks on a read, gets woken by hand, then parks on a take. Pipe
    // data arriving after the wake must not reach the channel wait.
    let chan_t = chan.clone();
    let mut stage = 0;
    let target = ev.spawn(move |cx: &mut OpCtx<'_>, input: Value| match stage {
        0 => {
            stage = 1;
            cx.read(&r, 64)
        }
        1 => {
            assert_eq!(input, Value::str("poke"));
            stage = 2;
            cx.take(&chan_t)
        }
        _ => Step::Done(input),
    });

    let target2 = target.clone();
    let mut pstage = 0;
    let poker = ev.spawn(move |cx: &mut OpCtx<'_>, _input: Value| {
        if pstage == 0 {
            pstage = 1;
            cx.sleep(Duration::from_millis(10))
        } else {
            cx.ev.schedule(&target2, Value::str("poke"));
            Step::Done(Value::Nil)
        }
    });

    let mut wstage = 0;
    let writer = ev.spawn(move |cx: &mut OpCtx<'_>, _input: Value| match wstage {
        0 => {
            wstage = 1;
            cx.sleep(Duration::from_millis(30))
        }
        1 => {
            wstage = 2;
            cx.write(&w, Value::bytes(b"io-bytes"))
        }
        _ => Step::Done(Value::Nil),
    });

    let chan_g = chan.clone();
    let mut gstage = 0;
    let giver = ev.spawn(move |cx: &mut OpCtx<'_>, _input: Value| match gstage {
        0 => {
            gstage = 1;
            cx.sleep(Duration::from_millis(50))
        }
        1 => {
            gstage = 2;
            cx.give(&chan_g, Value::Int(5))
        }
        _ => Step::Done(Value::Nil),
    });

    ev.schedule(&target, Value::Nil);
    ev.schedule(&poker, Value::Nil);
    ev.schedule(&writer, Value::Nil);
    ev.schedule(&giver, Value::Nil);
    ev.run().unwrap();

    assert_eq!(target.status(), FiberStatus::Dead);
    assert_eq!(target.last_value(), Value::Int(5));
}

#[test]
fn test_cancel_fiber_waiting_on_read() {
    let mut ev = EventLoop::new().unwrap();
    let (r, _w) = pipe().unwrap();

    let mut stage = 0;
    let target = ev.spawn(move |cx: &mut OpCtx<'_>, _input: Value| {
        if stage == 0 {
            stage = 1;
            cx.read(&r, 16)
        } else {
            Step::Done(Value::str("should not get here"))
        }
    });
    let target2 = target.clone();
    let mut cstage = 0;
    let canceller = ev.spawn(move |cx: &mut OpCtx<'_>, _input: Value| {
        if cstage == 0 {
            cstage = 1;
            cx.sleep(Duration::from_millis(10))
        } else {
            cx.ev.cancel(&target2, Value::str("read cancelled"));
            Step::Done(Value::Nil)
        }
    });
    ev.schedule(&target, Value::Nil);
    ev.schedule(&canceller, Value::Nil);
    // The listener is torn down with its fiber, so the loop goes idle.
    ev.run().unwrap();

    assert_eq!(target.status(), FiberStatus::Error);
    assert_eq!(target.last_value(), Value::str("read cancelled"));
}

#[test]
fn test_same_loop_threaded_give_skips_wake_pipe() {
    let mut ev = EventLoop::new().unwrap();
    let chan = Channel::threaded(0);

    let chan_t = chan.clone();
    let mut tstage = 0;
    let taker = ev.spawn(move |cx: &mut OpCtx<'_>, input: Value| {
        if tstage == 0 {
            tstage = 1;
            cx.take(&chan_t)
        } else {
            Step::Done(input)
        }
    });
    let chan_g = chan.clone();
    let mut gstage = 0;
    let giver = ev.spawn(move |cx: &mut OpCtx<'_>, _input: Value| {
        if gstage == 0 {
            gstage = 1;
            cx.give(&chan_g, Value::Int(11))
        } else {
            Step::Done(Value::Nil)
        }
    });
    ev.schedule(&taker, Value::Nil);
    ev.schedule(&giver, Value::Nil);
    ev.run().unwrap();

    assert_eq!(taker.last_value(), Value::Int(11));
    assert_eq!(ev.stats().posts_run, 0);
}

#[test]
fn test_poll_batch_cap_still_delivers_everything() {
    let mut ev = EventLoop::with_config(EventLoopConfig {
        poll_batch: 1,
        ..EventLoopConfig::default()
    })
    .unwrap();
    let (r1, w1) = pipe().unwrap();
    let (r2, w2) = pipe().unwrap();

    let mut s1 = 0;
    let reader1 = ev.spawn(move |cx: &mut OpCtx<'_>, input: Value| {
        if s1 == 0 {
            s1 = 1;
            cx.read(&r1, 8)
        } else {
            Step::Done(input)
        }
    });
    let mut s2 = 0;
    let reader2 = ev.spawn(move |cx: &mut OpCtx<'_>, input: Value| {
        if s2 == 0 {
            s2 = 1;
            cx.read(&r2, 8)
        } else {
            Step::Done(input)
        }
    });
    let mut ws = 0;
    let writer = ev.spawn(move |cx: &mut OpCtx<'_>, _input: Value| match ws {
        0 => {
            ws = 1;
            cx.sleep(Duration::from_millis(10))
        }
        1 => {
            ws = 2;
            cx.write(&w1, Value::bytes(b"one"))
        }
        2 => {
            ws = 3;
            cx.write(&w2, Value::bytes(b"two"))
        }
        _ => Step::Done(Value::Nil),
    });

    ev.schedule(&reader1, Value::Nil);
    ev.schedule(&reader2, Value::Nil);
    ev.schedule(&writer, Value::Nil);
    ev.run().unwrap();

    assert_eq!(reader1.last_value(), Value::bytes(b"one"));
    assert_eq!(reader2.last_value(), Value::bytes(b"two"));
}
