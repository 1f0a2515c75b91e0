use rust_evloop::{self as evloop, Error, Loop, LoopConfig};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

mod common;
use common::{quiet_loop, setup_tracing};

#[test]
fn timers_fire_in_deadline_order() {
    let l = quiet_loop();
    let order = Rc::new(RefCell::new(Vec::new()));
    for (label, ms) in [("c", 30), ("a", 10), ("b", 20), ("a2", 10)] {
        let order = order.clone();
        l.timer(Duration::from_millis(ms), false, move || {
            order.borrow_mut().push(label);
            Ok(())
        });
    }
    assert!(!l.run().unwrap());
    assert_eq!(*order.borrow(), vec!["a", "a2", "b", "c"]);
}

#[test]
fn zero_interval_periodic_fires_once_per_tick() {
    let l = quiet_loop();
    let fired = Rc::new(Cell::new(0));
    let f = fired.clone();
    let timer = l.periodic(Duration::ZERO, move || {
        f.set(f.get() + 1);
        Ok(())
    });
    for expected in 1..=3 {
        l.tick(false).unwrap();
        assert_eq!(fired.get(), expected);
    }
    timer.stop();
    assert!(l.is_empty());
}

#[test]
fn immediates_run_one_per_tick_in_order() {
    let l = quiet_loop();
    let seen = Rc::new(RefCell::new(Vec::new()));
    for n in 0..3 {
        let seen = seen.clone();
        l.immediate(move || {
            seen.borrow_mut().push(n);
            Ok(())
        });
    }
    l.tick(false).unwrap();
    assert_eq!(*seen.borrow(), vec![0]);
    l.tick(false).unwrap();
    l.tick(false).unwrap();
    assert_eq!(*seen.borrow(), vec![0, 1, 2]);
    assert!(l.is_empty());
}

#[test]
fn cancelled_immediate_never_runs() {
    let l = quiet_loop();
    let ran = Rc::new(Cell::new(false));
    let r = ran.clone();
    let immediate = l.immediate(move || {
        r.set(true);
        Ok(())
    });
    immediate.cancel();
    assert!(!immediate.is_pending());
    assert!(!l.run().unwrap());
    assert!(!ran.get());
}

#[test]
fn schedule_depth_throttles_draining() {
    let l = quiet_loop();
    assert_eq!(l.max_schedule_depth(Some(10)), evloop::config::DEFAULT_MAX_SCHEDULE_DEPTH);
    let count = Rc::new(Cell::new(0));
    for _ in 0..40 {
        let count = count.clone();
        l.schedule(move || {
            count.set(count.get() + 1);
            Ok(())
        });
    }
    l.tick(false).unwrap();
    l.tick(false).unwrap();
    assert_eq!(count.get(), 20);
    assert_eq!(l.max_schedule_depth(None), 10);
}

#[test]
fn callback_error_propagates_from_run() {
    let l = quiet_loop();
    l.timer(Duration::from_millis(1), false, || Err(Error::msg("timer failed")));
    let later = l.timer(Duration::from_secs(60), false, || Ok(()));

    let start = Instant::now();
    let err = l.run().unwrap_err();
    assert!(matches!(err, Error::Message(m) if m == "timer failed"));
    assert!(start.elapsed() < Duration::from_secs(5));
    assert!(!l.is_running());
    assert!(later.is_pending());
}

#[test]
fn stop_from_callback_ends_run() {
    let l = quiet_loop();
    let keepalive = l.periodic(Duration::from_millis(5), || Ok(()));
    let handle = l.clone();
    l.timer(Duration::from_millis(15), false, move || {
        handle.stop();
        Ok(())
    });
    assert!(l.run().unwrap());
    assert!(keepalive.is_pending());

    // The loop can be run again after it was stopped.
    keepalive.stop();
    assert!(!l.run().unwrap());
}

#[test]
fn unreferenced_timer_does_not_keep_loop_alive() {
    let l = quiet_loop();
    let timer = l.timer(Duration::from_secs(60), false, || Ok(()));
    timer.unreference();
    assert!(!timer.is_referenced());
    assert!(l.is_empty());
    let start = Instant::now();
    assert!(!l.run().unwrap());
    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(timer.is_pending());
}

#[test]
fn nested_run_is_rejected() {
    let l = quiet_loop();
    let nested = Rc::new(RefCell::new(None));
    let n = nested.clone();
    let handle = l.clone();
    l.schedule(move || {
        *n.borrow_mut() = Some(handle.run());
        Ok(())
    });
    l.run().unwrap();
    assert!(matches!(*nested.borrow(), Some(Err(Error::AlreadyRunning))));
}

#[test]
fn default_loop_free_functions() {
    setup_tracing();
    evloop::runtime_context::init(Loop::with_config(LoopConfig::new().signals(false)).unwrap()).unwrap();
    let log = Rc::new(RefCell::new(Vec::new()));

    let l1 = log.clone();
    evloop::timer(Duration::from_millis(5), false, move || {
        l1.borrow_mut().push("timer");
        Ok(())
    });
    let l2 = log.clone();
    evloop::immediate(move || {
        l2.borrow_mut().push("immediate");
        Ok(())
    });
    let l3 = log.clone();
    evloop::schedule(move || {
        l3.borrow_mut().push("scheduled");
        Ok(())
    });

    assert!(!evloop::is_empty());
    assert!(!evloop::run().unwrap());
    assert_eq!(*log.borrow(), vec!["immediate", "scheduled", "timer"]);

    evloop::periodic(Duration::from_secs(60), || Ok(()));
    evloop::clear();
    assert!(evloop::is_empty());
}
