//! End-to-end scenarios exercising the public API as a whole: spawning and
//! joining, priority aging, fiber-safe I/O, mutex recursion, barriers,
//! cancellation, a real accept/connect round trip, and composing a custom
//! event set with [`pth::wait`].

use std::cell::RefCell;
use std::net::TcpListener;
use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use std::time::Duration;

use pth::event::{Event, EventSet, FdGoal};
use pth::sync::{Barrier, BarrierArrival, Mutex};
use pth::{io, Error, RuntimeConfig};

/// Every scenario needs its own freshly initialized runtime; `pth::init` is a
/// no-op if one is already live, so tear the previous one down first.
fn setup() {
    if pth::is_initialized() {
        pth::kill();
    }
    pth::init(RuntimeConfig::default());
}

#[test]
fn spawn_and_join_returns_the_value() {
    setup();
    let handle = pth::spawn(|| 42);
    assert_eq!(handle.join().unwrap(), 42);
    pth::kill();
}

#[test]
fn priority_aging_keeps_low_priority_fibers_from_starving() {
    setup();

    let mut handles = Vec::new();
    for n in 0..3 {
        handles.push(
            pth::Builder::new()
                .name(format!("worker-{n}"))
                .priority(pth::priority_queue::PRIO_MIN)
                .spawn(|| {
                    for _ in 0..1000 {
                        pth::yield_now();
                    }
                }),
        );
    }

    loop {
        let all_dead = handles
            .iter()
            .all(|h| pth::info(h.id()).map(|info| info.state == pth::tcb::FiberState::Dead).unwrap_or(true));
        if all_dead {
            break;
        }
        pth::yield_now();
    }

    let worker_dispatches: Vec<u64> = handles
        .iter()
        .map(|h| pth::info(h.id()).unwrap().dispatches)
        .collect();
    let main_dispatches = pth::info(pth::MAIN_FIBER).unwrap().dispatches;

    for h in handles {
        h.join().unwrap();
    }

    assert!(main_dispatches > 0, "main fiber never got a turn");
    for d in worker_dispatches {
        let ratio = d as f64 / main_dispatches as f64;
        assert!(
            (0.3..=0.9).contains(&ratio),
            "a PRIO_MIN worker accumulated {d} dispatches against main's {main_dispatches} \
             (ratio {ratio}), suggesting it starved or dominated the scheduler"
        );
    }
    pth::kill();
}

#[test]
fn main_fiber_waits_on_a_pipe_another_fiber_writes_to() {
    setup();

    let mut fds = [0 as std::os::unix::io::RawFd; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    let (read_fd, write_fd) = (fds[0], fds[1]);

    let handle = pth::spawn(move || {
        pth::sleep(Duration::from_millis(20)).unwrap();
        io::write(write_fd, b"ABC\n").unwrap();
        unsafe { libc::close(write_fd) };
    });

    let ready = io::select_ev(
        &[io::PollRequest {
            fd: read_fd,
            goal: FdGoal::Readable,
        }],
        Some(Duration::from_secs(10)),
        None,
    )
    .unwrap();
    assert_eq!(ready, vec![(read_fd, FdGoal::Readable)]);

    let mut buf = [0u8; 4];
    assert_eq!(io::read(read_fd, &mut buf).unwrap(), 4);
    assert_eq!(&buf, b"ABC\n");

    unsafe { libc::close(read_fd) };
    handle.join().unwrap();
    pth::kill();
}

#[test]
fn a_recursive_mutex_does_not_suspend_its_own_owner() {
    setup();

    let mutex = Mutex::new(0i32);
    let first = mutex.lock().unwrap();
    // Acquiring again from the same fiber must not deadlock or suspend —
    // it's a recursion-count bump, not a second wait.
    let second = mutex.lock().unwrap();
    assert_eq!(*first, 0);
    assert_eq!(*second, 0);
    drop(second);
    drop(first);

    let third = mutex.lock().unwrap();
    assert_eq!(*third, 0);
    drop(third);
    pth::kill();
}

#[test]
fn a_barrier_of_five_releases_with_exactly_one_headlight_and_taillight() {
    setup();

    let barrier = Rc::new(Barrier::new(5));
    let results = Rc::new(RefCell::new(Vec::new()));
    let mut handles = Vec::new();

    for n in 0..4 {
        let b = barrier.clone();
        let r = results.clone();
        handles.push(pth::spawn(move || {
            let arrival = b.reach().unwrap();
            r.borrow_mut().push(arrival);
        }));
    }

    let last = barrier.reach().unwrap();
    results.borrow_mut().push(last);

    for h in handles {
        h.join().unwrap();
    }

    let results = results.borrow();
    assert_eq!(results.len(), 5);
    assert_eq!(
        results.iter().filter(|a| **a == BarrierArrival::Headlight).count(),
        1
    );
    assert_eq!(
        results.iter().filter(|a| **a == BarrierArrival::Taillight).count(),
        1
    );
    assert_eq!(
        results.iter().filter(|a| **a == BarrierArrival::Nop).count(),
        3
    );
    pth::kill();
}

#[test]
fn cancelling_a_looping_fiber_is_observed_within_bounded_yields() {
    setup();

    let handle = pth::Builder::new().joinable(true).spawn(|| {
        loop {
            pth::yield_now();
            pth::cancel_point();
        }
    });
    let id = handle.id();

    for _ in 0..4 {
        pth::yield_now();
    }
    pth::cancel(id);
    for _ in 0..16 {
        pth::yield_now();
    }

    assert!(matches!(handle.join(), Err(Error::Canceled)));
    pth::kill();
}

#[test]
fn a_client_fiber_connects_to_a_server_fiber_over_tcp() {
    setup();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let listen_fd = listener.as_raw_fd();

    let server = pth::spawn(move || {
        let conn = io::accept(listen_fd).unwrap();

        let mut request = [0u8; 18];
        let mut got = 0;
        while got < request.len() {
            let n = io::read(conn, &mut request[got..]).unwrap();
            assert_ne!(n, 0, "peer closed before sending the whole message");
            got += n;
        }

        let mut sent = 0;
        while sent < request.len() {
            sent += io::write(conn, &request[sent..]).unwrap();
        }
        unsafe { libc::close(conn) };
        request
    });

    let stream = io::connect(("127.0.0.1", port)).unwrap();
    let fd = stream.as_raw_fd();
    let message = *b"hello fiber pth!!!";
    assert_eq!(message.len(), 18);

    let mut sent = 0;
    while sent < message.len() {
        sent += io::write(fd, &message[sent..]).unwrap();
    }

    let mut reply = [0u8; 18];
    let mut got = 0;
    while got < reply.len() {
        let n = io::read(fd, &mut reply[got..]).unwrap();
        assert_ne!(n, 0, "server closed before replying in full");
        got += n;
    }

    assert_eq!(reply, message);
    assert_eq!(server.join().unwrap(), message);
    drop(listener);
    pth::kill();
}

#[test]
fn waiting_on_a_composed_event_set_reports_the_timeout_as_the_trigger() {
    setup();

    let mut fds = [0 as std::os::unix::io::RawFd; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    let (read_fd, write_fd) = (fds[0], fds[1]);

    let mut set = EventSet::new();
    set.push(Event::fd(read_fd, FdGoal::Readable));
    set.push(Event::time(pth::time::Deadline::now() + Duration::from_millis(100)));

    let triggering = pth::wait(set).unwrap();
    assert!(matches!(triggering.kind, pth::event::Kind::Time { .. }));

    unsafe {
        libc::close(read_fd);
        libc::close(write_fd);
    }
    pth::kill();
}
