use rust_evloop::{BackendKind, Error, Loop, LoopConfig};
use std::cell::RefCell;
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tempfile::tempfile;

mod common;
use common::setup_tracing;

fn backend_loop(kind: BackendKind) -> Loop {
    setup_tracing();
    Loop::with_config(LoopConfig::new().backend(kind).signals(false)).expect("create loop")
}

const BACKENDS: [BackendKind; 2] = [BackendKind::Poll, BackendKind::Event];

#[test]
fn readable_socket_fires_once_per_listen() {
    for kind in BACKENDS {
        let l = backend_loop(kind);
        let (mut writer, reader) = UnixStream::pair().unwrap();
        let reader = Rc::new(RefCell::new(reader));
        let received = Rc::new(RefCell::new(Vec::new()));

        let r = reader.clone();
        let out = received.clone();
        let watch = l
            .poll(reader.borrow().as_raw_fd(), move |_, expired| {
                assert!(!expired);
                let mut buf = [0u8; 16];
                let n = r.borrow_mut().read(&mut buf)?;
                out.borrow_mut().extend_from_slice(&buf[..n]);
                Ok(())
            })
            .unwrap();
        assert!(!watch.is_pending());
        assert!(l.is_empty());

        writer.write_all(b"ping").unwrap();
        watch.listen(None).unwrap();
        assert!(!l.run().unwrap(), "{} backend", l.backend_name());
        assert_eq!(&*received.borrow(), b"ping");
        assert!(!watch.is_pending());

        // Listening again picks up the next write.
        writer.write_all(b"pong").unwrap();
        watch.listen(None).unwrap();
        l.run().unwrap();
        assert_eq!(&*received.borrow(), b"pingpong");
        watch.free();
    }
}

#[test]
fn writable_socket_fires_immediately() {
    for kind in BACKENDS {
        let l = backend_loop(kind);
        let (a, _b) = UnixStream::pair().unwrap();
        let fired = Rc::new(RefCell::new(0));
        let f = fired.clone();
        let watch = l
            .await_writable(a.as_raw_fd(), move |fd, expired| {
                assert_eq!(fd, a.as_raw_fd());
                assert!(!expired);
                *f.borrow_mut() += 1;
                Ok(())
            })
            .unwrap();
        watch.listen(Some(Duration::from_secs(5))).unwrap();
        l.tick(true).unwrap();
        assert_eq!(*fired.borrow(), 1);
    }
}

#[test]
fn listen_timeout_fires_expired() {
    for kind in BACKENDS {
        let l = backend_loop(kind);
        let (_quiet_peer, reader) = UnixStream::pair().unwrap();
        let expired_calls = Rc::new(RefCell::new(Vec::new()));
        let e = expired_calls.clone();
        let watch = l
            .poll(reader.as_raw_fd(), move |_, expired| {
                e.borrow_mut().push(expired);
                Ok(())
            })
            .unwrap();

        let start = Instant::now();
        watch.listen(Some(Duration::from_millis(20))).unwrap();
        assert!(!l.run().unwrap());
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(*expired_calls.borrow(), vec![true]);
    }
}

#[test]
fn one_watch_per_descriptor_and_interest() {
    for kind in BACKENDS {
        let l = backend_loop(kind);
        let (a, _b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        let first = l.poll(fd, |_, _| Ok(())).unwrap();
        assert!(matches!(l.poll(fd, |_, _| Ok(())), Err(Error::ResourceBusy { fd: f, .. }) if f == fd));
        let writer = l.await_writable(fd, |_, _| Ok(())).unwrap();

        first.free();
        assert!(matches!(first.listen(None), Err(Error::Freed)));
        let replacement = l.poll(fd, |_, _| Ok(())).unwrap();
        assert!(!replacement.is_freed());
        writer.free();
        replacement.free();
    }
}

#[test]
fn cancelled_watch_does_not_fire() {
    for kind in BACKENDS {
        let l = backend_loop(kind);
        let (mut writer, reader) = UnixStream::pair().unwrap();
        writer.write_all(b"data").unwrap();
        let fired = Rc::new(RefCell::new(false));
        let f = fired.clone();
        let watch = l
            .poll(reader.as_raw_fd(), move |_, _| {
                *f.borrow_mut() = true;
                Ok(())
            })
            .unwrap();
        watch.listen(None).unwrap();
        watch.cancel();
        assert!(l.is_empty());
        l.tick(false).unwrap();
        assert!(!*fired.borrow());
    }
}

#[test]
fn regular_files_depend_on_backend() {
    setup_tracing();
    let mut file = tempfile().expect("temp file");
    file.write_all(b"hello evloop").unwrap();

    // poll(2) reports regular files as always ready.
    let l = backend_loop(BackendKind::Poll);
    let fired = Rc::new(RefCell::new(false));
    let f = fired.clone();
    let watch = l
        .poll(file.as_raw_fd(), move |_, expired| {
            *f.borrow_mut() = !expired;
            Ok(())
        })
        .unwrap();
    watch.listen(None).unwrap();
    l.run().unwrap();
    assert!(*fired.borrow());

    // epoll refuses them outright.
    if cfg!(target_os = "linux") {
        let l = backend_loop(BackendKind::Event);
        let watch = l.poll(file.as_raw_fd(), |_, _| Ok(())).unwrap();
        assert!(matches!(watch.listen(None), Err(Error::Io(_))));
        assert!(!watch.is_pending());
    }
}

#[test]
fn reinit_keeps_listening_watches() {
    for kind in BACKENDS {
        let l = backend_loop(kind);
        let (mut writer, reader) = UnixStream::pair().unwrap();
        let fired = Rc::new(RefCell::new(false));
        let f = fired.clone();
        let watch = l
            .poll(reader.as_raw_fd(), move |_, _| {
                *f.borrow_mut() = true;
                Ok(())
            })
            .unwrap();
        watch.listen(None).unwrap();
        l.reinit().unwrap();
        assert!(watch.is_pending());

        writer.write_all(b"!").unwrap();
        l.run().unwrap();
        assert!(*fired.borrow());
    }
}

#[test]
fn unreferenced_timer_wakes_a_loop_blocked_on_io() {
    for kind in BACKENDS {
        let l = backend_loop(kind);
        let (_quiet_peer, reader) = UnixStream::pair().unwrap();
        let fired_at = Rc::new(RefCell::new(None));
        let watch_fired = Rc::new(RefCell::new(false));

        let start = Instant::now();
        let f = fired_at.clone();
        let timer = l.timer(Duration::from_millis(20), false, move || {
            *f.borrow_mut() = Some(Instant::now());
            Ok(())
        });
        timer.unreference();

        let w = watch_fired.clone();
        let watch = l
            .poll(reader.as_raw_fd(), move |_, expired| {
                assert!(expired);
                *w.borrow_mut() = true;
                Ok(())
            })
            .unwrap();
        watch.listen(Some(Duration::from_millis(500))).unwrap();

        while fired_at.borrow().is_none() {
            l.tick(true).unwrap();
        }
        let fired = fired_at.borrow().unwrap();
        assert!(fired - start >= Duration::from_millis(20));
        assert!(fired - start < Duration::from_millis(500), "{} backend", l.backend_name());
        assert!(!*watch_fired.borrow());
        assert!(watch.is_pending());
        watch.free();
    }
}
