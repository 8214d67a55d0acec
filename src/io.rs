//! Fiber-safe blocking I/O wrappers (spec §4.6).
//!
//! Every wrapper here follows one template, the same non-block/attempt/wait
//! loop the teacher's `coio::read`/`coio::write` run for a single socket
//! pair, generalized to the rest of the blocking syscalls spec §4.6 names:
//! put the fd in non-blocking mode, attempt the syscall, and on
//! `EAGAIN`/`EWOULDBLOCK` (or `EINPROGRESS` for `connect`) wait on an `Fd`
//! event for the right direction before retrying.
//!
//! Every wrapper has a `_ev` sibling that accepts a timeout and/or a
//! caller-supplied event to race against I/O readiness (spec: "Variants with
//! `_ev` suffix accept a caller-provided composed event for
//! cancellation/timeout; without `_ev` they block forever on I/O alone.").

use std::cell::{Cell, RefCell};
use std::ffi::CString;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, TcpStream, ToSocketAddrs};
use std::os::unix::io::{FromRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::event::{Event, EventSet, FdGoal, Kind};
use crate::scheduler;
use crate::time::Deadline;

/// Gets (and optionally sets) `O_NONBLOCK` on `fd`, returning the previous
/// state (spec §4.6 `fdmode`).
pub fn fdmode(fd: RawFd, set_nonblocking: Option<bool>) -> Result<bool> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    let was_nonblocking = flags & libc::O_NONBLOCK != 0;
    if let Some(want) = set_nonblocking {
        if want != was_nonblocking {
            let new_flags = if want {
                flags | libc::O_NONBLOCK
            } else {
                flags & !libc::O_NONBLOCK
            };
            if unsafe { libc::fcntl(fd, libc::F_SETFL, new_flags) } < 0 {
                return Err(Error::Io(io::Error::last_os_error()));
            }
        }
    }
    Ok(was_nonblocking)
}

fn is_retryable(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(e) if e == libc::EAGAIN || e == libc::EWOULDBLOCK || e == libc::EINPROGRESS
    )
}

/// The shared retry loop (spec §4.6 steps 3-4): attempt the syscall; on a
/// retryable error, wait on fd-readiness (OR'd with an optional deadline and
/// an optional caller event), then try again.
fn retry_until_ready(
    fd: RawFd,
    goal: FdGoal,
    deadline: Option<Deadline>,
    extra: Option<&Rc<Event>>,
    mut attempt: impl FnMut() -> libc::ssize_t,
) -> Result<libc::ssize_t> {
    loop {
        let r = attempt();
        if r >= 0 {
            return Ok(r);
        }
        let err = io::Error::last_os_error();
        if !is_retryable(&err) {
            return Err(Error::Io(err));
        }

        let mut set = EventSet::single(Event::fd(fd, goal));
        if let Some(d) = deadline {
            set.push(Event::time(d));
        }
        if let Some(ev) = extra {
            set.push_rc(ev.clone());
        }
        let triggering = scheduler::wait(set)?;
        if !matches!(triggering.kind, Kind::Fd { .. }) {
            // Woke for the deadline or the caller's own event, not because
            // the fd became ready.
            return Err(Error::Interrupted);
        }
    }
}

struct NonBlockingGuard {
    fd: RawFd,
    was_nonblocking: bool,
}

impl NonBlockingGuard {
    fn acquire(fd: RawFd) -> Result<Self> {
        let was_nonblocking = fdmode(fd, Some(true))?;
        Ok(NonBlockingGuard { fd, was_nonblocking })
    }
}

impl Drop for NonBlockingGuard {
    fn drop(&mut self) {
        if !self.was_nonblocking {
            let _ = fdmode(self.fd, Some(false));
        }
    }
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    read_ev(fd, buf, None, None)
}

pub fn read_ev(
    fd: RawFd,
    buf: &mut [u8],
    timeout: Option<Duration>,
    extra: Option<Rc<Event>>,
) -> Result<usize> {
    let _guard = NonBlockingGuard::acquire(fd)?;
    let deadline = timeout.map(|d| Deadline::now() + d);
    let n = retry_until_ready(fd, FdGoal::Readable, deadline, extra.as_ref(), || unsafe {
        libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
    })?;
    Ok(n as usize)
}

pub fn write(fd: RawFd, buf: &[u8]) -> Result<usize> {
    write_ev(fd, buf, None, None)
}

pub fn write_ev(
    fd: RawFd,
    buf: &[u8],
    timeout: Option<Duration>,
    extra: Option<Rc<Event>>,
) -> Result<usize> {
    let _guard = NonBlockingGuard::acquire(fd)?;
    let deadline = timeout.map(|d| Deadline::now() + d);
    let n = retry_until_ready(fd, FdGoal::Writable, deadline, extra.as_ref(), || unsafe {
        libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len())
    })?;
    Ok(n as usize)
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: libc::c_int) -> Result<usize> {
    recv_ev(fd, buf, flags, None, None)
}

pub fn recv_ev(
    fd: RawFd,
    buf: &mut [u8],
    flags: libc::c_int,
    timeout: Option<Duration>,
    extra: Option<Rc<Event>>,
) -> Result<usize> {
    let _guard = NonBlockingGuard::acquire(fd)?;
    let deadline = timeout.map(|d| Deadline::now() + d);
    let n = retry_until_ready(fd, FdGoal::Readable, deadline, extra.as_ref(), || unsafe {
        libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), flags)
    })?;
    Ok(n as usize)
}

pub fn send(fd: RawFd, buf: &[u8], flags: libc::c_int) -> Result<usize> {
    send_ev(fd, buf, flags, None, None)
}

pub fn send_ev(
    fd: RawFd,
    buf: &[u8],
    flags: libc::c_int,
    timeout: Option<Duration>,
    extra: Option<Rc<Event>>,
) -> Result<usize> {
    let _guard = NonBlockingGuard::acquire(fd)?;
    let deadline = timeout.map(|d| Deadline::now() + d);
    let n = retry_until_ready(fd, FdGoal::Writable, deadline, extra.as_ref(), || unsafe {
        libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), flags)
    })?;
    Ok(n as usize)
}

pub fn pread(fd: RawFd, buf: &mut [u8], offset: i64) -> Result<usize> {
    pread_ev(fd, buf, offset, None, None)
}

pub fn pread_ev(
    fd: RawFd,
    buf: &mut [u8],
    offset: i64,
    timeout: Option<Duration>,
    extra: Option<Rc<Event>>,
) -> Result<usize> {
    let _guard = NonBlockingGuard::acquire(fd)?;
    let deadline = timeout.map(|d| Deadline::now() + d);
    let n = retry_until_ready(fd, FdGoal::Readable, deadline, extra.as_ref(), || unsafe {
        libc::pread(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            offset as libc::off_t,
        )
    })?;
    Ok(n as usize)
}

pub fn pwrite(fd: RawFd, buf: &[u8], offset: i64) -> Result<usize> {
    pwrite_ev(fd, buf, offset, None, None)
}

pub fn pwrite_ev(
    fd: RawFd,
    buf: &[u8],
    offset: i64,
    timeout: Option<Duration>,
    extra: Option<Rc<Event>>,
) -> Result<usize> {
    let _guard = NonBlockingGuard::acquire(fd)?;
    let deadline = timeout.map(|d| Deadline::now() + d);
    let n = retry_until_ready(fd, FdGoal::Writable, deadline, extra.as_ref(), || unsafe {
        libc::pwrite(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            offset as libc::off_t,
        )
    })?;
    Ok(n as usize)
}

/// Advances a working copy of `iovecs` by `sent` bytes, dropping fully
/// consumed segments (spec §4.6: readv/writev "advances a working iovec
/// copy by the bytes written and loops").
fn advance_iovecs(iovecs: &mut Vec<libc::iovec>, mut sent: usize) {
    while sent > 0 {
        let Some(first) = iovecs.first_mut() else { break };
        if sent < first.iov_len {
            first.iov_base = unsafe { (first.iov_base as *mut u8).add(sent) as *mut libc::c_void };
            first.iov_len -= sent;
            sent = 0;
        } else {
            sent -= first.iov_len;
            iovecs.remove(0);
        }
    }
}

pub fn writev(fd: RawFd, bufs: &[&[u8]]) -> Result<usize> {
    writev_ev(fd, bufs, None, None)
}

pub fn writev_ev(
    fd: RawFd,
    bufs: &[&[u8]],
    timeout: Option<Duration>,
    extra: Option<Rc<Event>>,
) -> Result<usize> {
    let _guard = NonBlockingGuard::acquire(fd)?;
    let deadline = timeout.map(|d| Deadline::now() + d);
    let mut iovecs: Vec<libc::iovec> = bufs
        .iter()
        .map(|b| libc::iovec {
            iov_base: b.as_ptr() as *mut libc::c_void,
            iov_len: b.len(),
        })
        .collect();
    let mut total = 0usize;
    while !iovecs.is_empty() {
        let n = retry_until_ready(fd, FdGoal::Writable, deadline, extra.as_ref(), || unsafe {
            libc::writev(fd, iovecs.as_ptr(), iovecs.len() as libc::c_int)
        })?;
        total += n as usize;
        advance_iovecs(&mut iovecs, n as usize);
    }
    Ok(total)
}

pub fn readv(fd: RawFd, bufs: &mut [&mut [u8]]) -> Result<usize> {
    readv_ev(fd, bufs, None, None)
}

pub fn readv_ev(
    fd: RawFd,
    bufs: &mut [&mut [u8]],
    timeout: Option<Duration>,
    extra: Option<Rc<Event>>,
) -> Result<usize> {
    let _guard = NonBlockingGuard::acquire(fd)?;
    let deadline = timeout.map(|d| Deadline::now() + d);
    let mut iovecs: Vec<libc::iovec> = bufs
        .iter_mut()
        .map(|b| libc::iovec {
            iov_base: b.as_mut_ptr() as *mut libc::c_void,
            iov_len: b.len(),
        })
        .collect();
    let total_len: usize = iovecs.iter().map(|v| v.iov_len).sum();
    let mut total = 0usize;
    while !iovecs.is_empty() && total < total_len {
        let n = retry_until_ready(fd, FdGoal::Readable, deadline, extra.as_ref(), || unsafe {
            libc::readv(fd, iovecs.as_ptr(), iovecs.len() as libc::c_int)
        })?;
        if n == 0 {
            break; // EOF
        }
        total += n as usize;
        advance_iovecs(&mut iovecs, n as usize);
    }
    Ok(total)
}

/// Accepts a connection; the new fd is handed back in ordinary
/// blocking-style mode, matching what a caller of plain `accept(2)` would
/// expect, even though the listening socket itself runs non-blocking for the
/// duration of this call (spec §4.6).
pub fn accept(fd: RawFd) -> Result<RawFd> {
    accept_ev(fd, None, None)
}

pub fn accept_ev(
    fd: RawFd,
    timeout: Option<Duration>,
    extra: Option<Rc<Event>>,
) -> Result<RawFd> {
    let _guard = NonBlockingGuard::acquire(fd)?;
    let deadline = timeout.map(|d| Deadline::now() + d);
    let new_fd = retry_until_ready(fd, FdGoal::Readable, deadline, extra.as_ref(), || unsafe {
        libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) as libc::ssize_t
    })? as RawFd;
    fdmode(new_fd, Some(false))?;
    Ok(new_fd)
}

fn sockaddr_of(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe { std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin) };
            std::mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe { std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6) };
            std::mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

/// Reverses [`sockaddr_of`]: reads back a `SocketAddr` from a kernel-filled
/// `sockaddr_storage` (spec §4.6 `recvfrom`/`accept`-style address results).
fn socketaddr_from_storage(storage: &libc::sockaddr_storage) -> Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            let port = u16::from_be(sin.sin_port);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            let port = u16::from_be(sin6.sin6_port);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                port,
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        family => Err(Error::InvalidArgument(format!(
            "unsupported address family {family}"
        ))),
    }
}

pub fn recvfrom(fd: RawFd, buf: &mut [u8], flags: libc::c_int) -> Result<(usize, SocketAddr)> {
    recvfrom_ev(fd, buf, flags, None, None)
}

pub fn recvfrom_ev(
    fd: RawFd,
    buf: &mut [u8],
    flags: libc::c_int,
    timeout: Option<Duration>,
    extra: Option<Rc<Event>>,
) -> Result<(usize, SocketAddr)> {
    let _guard = NonBlockingGuard::acquire(fd)?;
    let deadline = timeout.map(|d| Deadline::now() + d);
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut addr_len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let n = retry_until_ready(fd, FdGoal::Readable, deadline, extra.as_ref(), || unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            flags,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut addr_len,
        )
    })?;
    let from = socketaddr_from_storage(&storage)?;
    Ok((n as usize, from))
}

pub fn sendto(fd: RawFd, buf: &[u8], flags: libc::c_int, to: SocketAddr) -> Result<usize> {
    sendto_ev(fd, buf, flags, to, None, None)
}

pub fn sendto_ev(
    fd: RawFd,
    buf: &[u8],
    flags: libc::c_int,
    to: SocketAddr,
    timeout: Option<Duration>,
    extra: Option<Rc<Event>>,
) -> Result<usize> {
    let _guard = NonBlockingGuard::acquire(fd)?;
    let deadline = timeout.map(|d| Deadline::now() + d);
    let (storage, len) = sockaddr_of(&to);
    let n = retry_until_ready(fd, FdGoal::Writable, deadline, extra.as_ref(), || unsafe {
        libc::sendto(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            flags,
            &storage as *const _ as *const libc::sockaddr,
            len,
        )
    })?;
    Ok(n as usize)
}

/// Connects a fresh non-blocking socket to `addr`, waiting on writability
/// (and checking `SO_ERROR` on wake) instead of blocking in `connect(2)`
/// itself.
pub fn connect(addr: impl ToSocketAddrs) -> Result<TcpStream> {
    connect_ev(addr, None, None)
}

pub fn connect_ev(
    addr: impl ToSocketAddrs,
    timeout: Option<Duration>,
    extra: Option<Rc<Event>>,
) -> Result<TcpStream> {
    let target = addr
        .to_socket_addrs()
        .map_err(Error::Io)?
        .next()
        .ok_or_else(|| Error::InvalidArgument("address did not resolve to anything".into()))?;

    let domain = if target.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };
    let sock = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
    if sock < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    fdmode(sock, Some(true))?;

    let (storage, len) = sockaddr_of(&target);
    let rc = unsafe { libc::connect(sock, &storage as *const _ as *const libc::sockaddr, len) };
    if rc == 0 {
        return Ok(unsafe { TcpStream::from_raw_fd(sock) });
    }
    let err = io::Error::last_os_error();
    if !is_retryable(&err) {
        unsafe { libc::close(sock) };
        return Err(Error::Io(err));
    }

    let deadline = timeout.map(|d| Deadline::now() + d);
    let mut set = EventSet::single(Event::fd(sock, FdGoal::Writable));
    if let Some(d) = deadline {
        set.push(Event::time(d));
    }
    if let Some(ev) = extra {
        set.push_rc(ev);
    }
    let triggering = match scheduler::wait(set) {
        Ok(t) => t,
        Err(e) => {
            unsafe { libc::close(sock) };
            return Err(e);
        }
    };
    if !matches!(triggering.kind, Kind::Fd { .. }) {
        unsafe { libc::close(sock) };
        return Err(Error::Interrupted);
    }

    let mut sockerr: libc::c_int = 0;
    let mut sockerr_len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    unsafe {
        libc::getsockopt(
            sock,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut sockerr as *mut _ as *mut libc::c_void,
            &mut sockerr_len,
        );
    }
    if sockerr != 0 {
        unsafe { libc::close(sock) };
        return Err(Error::Io(io::Error::from_raw_os_error(sockerr)));
    }
    Ok(unsafe { TcpStream::from_raw_fd(sock) })
}

/// One fd/goal pair in a [`select_ev`]/[`poll_ev`] request set.
#[derive(Debug, Clone, Copy)]
pub struct PollRequest {
    pub fd: RawFd,
    pub goal: FdGoal,
}

/// Waits until any of `requests` is ready (or `timeout`/`extra` fires
/// first), returning every fd/goal pair that was ready. Implemented
/// directly as a `Select` event, the way spec §4.6 describes `select_ev`.
pub fn select_ev(
    requests: &[PollRequest],
    timeout: Option<Duration>,
    extra: Option<Rc<Event>>,
) -> Result<Vec<(RawFd, FdGoal)>> {
    let fds: Vec<(RawFd, FdGoal)> = requests.iter().map(|r| (r.fd, r.goal)).collect();
    let mut set = EventSet::single(Event::new(Kind::Select {
        fds,
        ready: RefCell::new(Vec::new()),
    }));
    if let Some(d) = timeout {
        set.push(Event::time(Deadline::now() + d));
    }
    if let Some(ev) = extra {
        set.push_rc(ev);
    }
    let triggering = scheduler::wait(set)?;
    match &triggering.kind {
        Kind::Select { ready, .. } => Ok(ready.borrow().clone()),
        _ => Ok(Vec::new()),
    }
}

/// `poll_ev` is `select_ev` under another name (spec §4.6 lists both); kept
/// separate since callers reach for either name depending on which syscall
/// they're replacing.
pub fn poll_ev(
    requests: &[PollRequest],
    timeout: Option<Duration>,
    extra: Option<Rc<Event>>,
) -> Result<Vec<(RawFd, FdGoal)>> {
    select_ev(requests, timeout, extra)
}

/// Waits for child `pid` to change state, polling `waitpid(2)` with
/// `WNOHANG` on the same cadence [`Kind::Func`] already gives predicate-based
/// events (spec §4.6 `waitpid`; grounded in `tests/test_fork.c`'s
/// fork-then-`pth_waitpid` pattern).
pub fn waitpid(pid: libc::pid_t, options: libc::c_int) -> Result<(libc::pid_t, libc::c_int)> {
    waitpid_ev(pid, options, None, None)
}

pub fn waitpid_ev(
    pid: libc::pid_t,
    options: libc::c_int,
    timeout: Option<Duration>,
    extra: Option<Rc<Event>>,
) -> Result<(libc::pid_t, libc::c_int)> {
    let result: Rc<Cell<Option<(libc::pid_t, libc::c_int)>>> = Rc::new(Cell::new(None));
    let result_for_predicate = result.clone();
    let predicate = move || {
        let mut status: libc::c_int = 0;
        let reaped = unsafe { libc::waitpid(pid, &mut status, options | libc::WNOHANG) };
        if reaped > 0 {
            result_for_predicate.set(Some((reaped, status)));
            true
        } else {
            false
        }
    };
    let mut set = EventSet::single(Event::func(predicate, Duration::from_millis(20)));
    if let Some(d) = timeout {
        set.push(Event::time(Deadline::now() + d));
    }
    if let Some(ev) = extra {
        set.push_rc(ev);
    }
    let triggering = scheduler::wait(set)?;
    match &triggering.kind {
        Kind::Func { .. } => Ok(result
            .get()
            .expect("a Func event occurred without the waitpid predicate recording a status")),
        _ => Err(Error::Interrupted),
    }
}

/// Runs `command` via `/bin/sh -c` and waits for it to exit (spec §4.6
/// `system`). Unlike [`crate::fork::fork`], the child here never returns to
/// fiber code — it execs immediately — so this forks directly with `libc`
/// instead of tearing down and reinitializing the scheduler for it.
pub fn system(command: &str) -> Result<libc::c_int> {
    let shell = CString::new("/bin/sh").expect("no interior NUL");
    let flag = CString::new("-c").expect("no interior NUL");
    let cmd = CString::new(command)
        .map_err(|_| Error::InvalidArgument("command contains an interior NUL byte".into()))?;

    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    if pid == 0 {
        unsafe {
            libc::execl(
                shell.as_ptr(),
                shell.as_ptr(),
                flag.as_ptr(),
                cmd.as_ptr(),
                std::ptr::null::<libc::c_char>(),
            );
            libc::_exit(127);
        }
    }
    let (_, status) = waitpid(pid, 0)?;
    Ok(status)
}

/// Reads up to a trailing `\n`, reusing [`read_ev`] one byte at a time so a
/// caller can race it against a timeout/event like any other wrapper here.
/// Mirrors the original's `pth_readline`: the return count includes the
/// newline, and `0` means EOF with nothing read (grounded in
/// `test_httpd.c`'s header-reading loop).
pub fn readline(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    readline_ev(fd, buf, None, None)
}

pub fn readline_ev(
    fd: RawFd,
    buf: &mut [u8],
    timeout: Option<Duration>,
    extra: Option<Rc<Event>>,
) -> Result<usize> {
    let deadline = timeout.map(|d| Deadline::now() + d);
    let mut n = 0usize;
    while n < buf.len() {
        let mut byte = [0u8; 1];
        let remaining = deadline.map(|d| d.remaining());
        let read_n = read_ev(fd, &mut byte, remaining, extra.clone())?;
        if read_n == 0 {
            break;
        }
        buf[n] = byte[0];
        n += 1;
        if byte[0] == b'\n' {
            break;
        }
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;

    fn reset() {
        scheduler::kill();
        scheduler::init(RuntimeConfig::default());
    }

    #[test]
    fn read_and_write_round_trip_through_a_pipe() {
        reset();
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (read_fd, write_fd) = (fds[0], fds[1]);

        let n = write(write_fd, b"hello").unwrap();
        assert_eq!(n, 5);

        let mut buf = [0u8; 5];
        let n = read(read_fd, &mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
        scheduler::kill();
    }

    #[test]
    fn read_waits_for_data_written_by_another_fiber() {
        reset();
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (read_fd, write_fd) = (fds[0], fds[1]);

        scheduler::spawn_fiber(
            "writer".into(),
            crate::priority_queue::PRIO_MIN,
            64 * 1024,
            Box::new(move || {
                write(write_fd, b"hi").unwrap();
                unsafe { libc::close(write_fd) };
            }),
            false,
        );

        let mut buf = [0u8; 2];
        let n = read(read_fd, &mut buf).unwrap();
        assert_eq!(n, 2);
        assert_eq!(&buf, b"hi");

        unsafe { libc::close(read_fd) };
        scheduler::kill();
    }

    #[test]
    fn recv_and_send_round_trip_through_a_socketpair() {
        reset();
        let mut fds = [0 as RawFd; 2];
        assert_eq!(
            unsafe {
                libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
            },
            0
        );
        let (a, b) = (fds[0], fds[1]);

        let n = send(a, b"hi", 0).unwrap();
        assert_eq!(n, 2);

        let mut buf = [0u8; 2];
        let n = recv(b, &mut buf, 0).unwrap();
        assert_eq!(n, 2);
        assert_eq!(&buf, b"hi");

        unsafe {
            libc::close(a);
            libc::close(b);
        }
        scheduler::kill();
    }

    #[test]
    fn readline_stops_at_the_newline_and_includes_it_in_the_count() {
        reset();
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (read_fd, write_fd) = (fds[0], fds[1]);

        write(write_fd, b"GET / HTTP/1.0\nmore").unwrap();

        let mut buf = [0u8; 64];
        let n = readline(read_fd, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"GET / HTTP/1.0\n");

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
        scheduler::kill();
    }

    #[test]
    fn waitpid_reaps_a_child_that_exits_immediately() {
        reset();
        let pid = unsafe { libc::fork() };
        if pid == 0 {
            unsafe { libc::_exit(0) };
        }
        let (reaped, status) = waitpid(pid, 0).unwrap();
        assert_eq!(reaped, pid);
        assert!(libc::WIFEXITED(status));
        assert_eq!(libc::WEXITSTATUS(status), 0);
        scheduler::kill();
    }

    #[test]
    fn system_runs_a_shell_command_and_reports_its_exit_status() {
        reset();
        let status = system("exit 7").unwrap();
        assert!(libc::WIFEXITED(status));
        assert_eq!(libc::WEXITSTATUS(status), 7);
        scheduler::kill();
    }
}
