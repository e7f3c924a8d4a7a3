use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use xianwei::{EventLoop, FiberStatus, OpCtx, Step, Value};

#[test]
fn test_timers_fire_in_deadline_order() {
    let mut ev = EventLoop::new().unwrap();
    let log: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

    let mut sleeper = |delay: u64, label: &'static str| {
        let log = log.clone();
        let mut stage = 0;
        let f = ev.spawn(move |cx: &mut OpCtx<'_>, _input: Value| {
            if stage == 0 {
                stage = 1;
                cx.sleep(Duration::from_millis(delay))
            } else {
                log.borrow_mut().push(label);
                Step::Done(Value::Nil)
            }
        });
        ev.schedule(&f, Value::Nil);
    };
    sleeper(30, "slow");
    sleeper(10, "fast");
    sleeper(20, "middle");

    ev.run().unwrap();
    assert_eq!(*log.borrow(), vec!["fast", "middle", "slow"]);
}

#[test]
fn test_with_deadline_cancels_a_slow_fiber() {
    let mut ev = EventLoop::new().unwrap();
    let mut stage = 0;
    let f = ev.spawn(move |cx: &mut OpCtx<'_>, _input: Value| {
        if stage == 0 {
            stage = 1;
            let me = cx.fiber().clone();
            cx.with_deadline(&me, Duration::from_millis(10));
            cx.sleep(Duration::from_millis(100))
        } else {
            Step::Done(Value::str("finished"))
        }
    });
    let start = Instant::now();
    ev.schedule(&f, Value::Nil);
    ev.run().unwrap();

    assert_eq!(f.status(), FiberStatus::Error);
    assert_eq!(f.last_value(), Value::str("deadline expired"));
    // The fiber itself was cut short well before its sleep.
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[test]
fn test_sleeps_on_one_fiber_accumulate() {
    let mut ev = EventLoop::new().unwrap();
    let mut stage = 0;
    let f = ev.spawn(move |cx: &mut OpCtx<'_>, _input: Value| match stage {
        0 | 1 => {
            stage += 1;
            cx.sleep(Duration::from_millis(10))
        }
        _ => Step::Done(Value::Nil),
    });
    let start = Instant::now();
    let out = ev.run_fiber(&f, Value::Nil).unwrap();
    assert_eq!(out, Value::Nil);
    assert!(start.elapsed() >= Duration::from_millis(20));
}
