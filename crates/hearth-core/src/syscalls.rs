// src/syscalls.rs
//
// Thin libc wrappers: sockets, epoll, pipes, SIGALRM, stat and mmap.
// Linux-only; the one-shot readiness protocol and the alarm self-pipe
// are epoll territory.

use std::ffi::CString;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicI32, Ordering};

use libc::{c_int, c_uint, c_void, socklen_t};

pub use libc::epoll_event;

// ---- Socket operations ----

/// Create a non-blocking TCP listener bound to `host:port`.
///
/// TCP_NODELAY is set on the listener so accepted sockets inherit it.
pub fn create_listen_socket(host: &str, port: u16) -> io::Result<RawFd> {
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    unsafe {
        let fd = libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let one: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );

        if let Err(err) = bind_addr(fd, &addr) {
            libc::close(fd);
            return Err(err);
        }

        if libc::listen(fd, libc::SOMAXCONN) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        Ok(fd)
    }
}

fn bind_addr(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    unsafe {
        match addr {
            SocketAddr::V4(a) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: a.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(a.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                if libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                ) < 0
                {
                    return Err(io::Error::last_os_error());
                }
            }
            SocketAddr::V6(a) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: a.port().to_be(),
                    sin6_flowinfo: a.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: a.ip().octets(),
                    },
                    sin6_scope_id: a.scope_id(),
                };
                if libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                ) < 0
                {
                    return Err(io::Error::last_os_error());
                }
            }
        }
        Ok(())
    }
}

fn storage_to_addr(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            Ok(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes()),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected address family {}", other),
        )),
    }
}

/// The bound address of a listening socket (resolves port 0).
pub fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        if libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return Err(io::Error::last_os_error());
        }
        storage_to_addr(&storage)
    }
}

/// Accept one pending connection; `None` when the backlog is drained.
pub fn accept_connection(listen_fd: RawFd) -> io::Result<Option<(RawFd, SocketAddr)>> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        let fd = libc::accept4(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK,
        );
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err);
        }
        let peer = storage_to_addr(&storage)?;
        Ok(Some((fd, peer)))
    }
}

/// One non-blocking read. `Ok(0)` is EOF; would-block comes back as an
/// error the caller matches on `ErrorKind::WouldBlock`.
pub fn read_nonblocking(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    unsafe {
        let res = libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len());
        if res < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(res as usize)
        }
    }
}

/// Vectored write of up to two segments in one syscall.
pub fn writev_nonblocking(fd: RawFd, bufs: &[&[u8]]) -> io::Result<usize> {
    debug_assert!(bufs.len() <= 2);
    if bufs.is_empty() {
        return Ok(0);
    }

    let mut iovecs: [libc::iovec; 2] = unsafe { mem::zeroed() };
    let iov_count = bufs.len().min(2);
    for (iov, buf) in iovecs.iter_mut().zip(bufs) {
        iov.iov_base = buf.as_ptr() as *mut c_void;
        iov.iov_len = buf.len();
    }

    unsafe {
        let res = libc::writev(fd, iovecs.as_ptr(), iov_count as c_int);
        if res < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(res as usize)
        }
    }
}

pub fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

// ---- Epoll ----

/// Readiness interest mask for a client socket. One-shot registrations
/// are disabled after the first notification until explicitly re-armed,
/// which is what guarantees a single actor per connection step.
pub fn interest(readable: bool, writable: bool, edge: bool, oneshot: bool) -> u32 {
    let mut events = libc::EPOLLRDHUP as u32;
    if readable {
        events |= libc::EPOLLIN as u32;
    }
    if writable {
        events |= libc::EPOLLOUT as u32;
    }
    if edge {
        events |= libc::EPOLLET as u32;
    }
    if oneshot {
        events |= libc::EPOLLONESHOT as u32;
    }
    events
}

pub fn is_readable(events: u32) -> bool {
    events & libc::EPOLLIN as u32 != 0
}

pub fn is_writable(events: u32) -> bool {
    events & libc::EPOLLOUT as u32 != 0
}

/// Peer hang-up or socket error; the connection is beyond saving.
pub fn is_hangup(events: u32) -> bool {
    events & (libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0
}

pub struct Epoll {
    pub fd: RawFd,
}

impl Epoll {
    pub fn new() -> io::Result<Self> {
        unsafe {
            let fd = libc::epoll_create1(0);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Self { fd })
        }
    }

    pub fn add(&self, fd: RawFd, token: u64, events: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, events)
    }

    /// Re-arm a one-shot registration (or change interest).
    pub fn modify(&self, fd: RawFd, token: u64, events: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, events)
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn ctl(&self, op: c_int, fd: RawFd, token: u64, events: u32) -> io::Result<()> {
        let mut event = epoll_event { events, u64: token };
        unsafe {
            if libc::epoll_ctl(self.fd, op, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    /// Bounded wait. An EINTR wakeup (the interval alarm lands here)
    /// reports zero events rather than an error.
    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> io::Result<usize> {
        unsafe {
            let res = libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            );
            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err);
            }
            Ok(res as usize)
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

// ---- Self-pipes ----

/// Non-blocking pipe; returns (read end, write end).
pub fn create_pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        if libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok((fds[0], fds[1]))
}

/// One wakeup byte. A full pipe already carries a pending wakeup, so
/// would-block is ignored.
pub fn notify_pipe(write_fd: RawFd) {
    let byte = [1u8];
    unsafe {
        let _ = libc::write(write_fd, byte.as_ptr() as *const c_void, 1);
    }
}

/// Swallow all pending wakeup bytes.
pub fn drain_pipe(read_fd: RawFd) {
    let mut buf = [0u8; 64];
    loop {
        match read_nonblocking(read_fd, &mut buf) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(_) => break,
        }
    }
}

// ---- Interval alarm ----

static ALARM_PIPE: AtomicI32 = AtomicI32::new(-1);

extern "C" fn alarm_handler(_sig: c_int) {
    unsafe {
        let saved = *libc::__errno_location();
        let fd = ALARM_PIPE.load(Ordering::Relaxed);
        if fd >= 0 {
            let byte = [1u8];
            let _ = libc::write(fd, byte.as_ptr() as *const c_void, 1);
        }
        *libc::__errno_location() = saved;
    }
}

/// Route SIGALRM into a self-pipe and start the interval clock. The
/// dispatcher re-arms the alarm after each tick.
pub fn install_alarm(pipe_write_fd: RawFd, period_secs: u64) -> io::Result<()> {
    ALARM_PIPE.store(pipe_write_fd, Ordering::SeqCst);
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        sa.sa_sigaction = alarm_handler as usize;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigfillset(&mut sa.sa_mask);
        if libc::sigaction(libc::SIGALRM, &sa, ptr::null_mut()) < 0 {
            return Err(io::Error::last_os_error());
        }
        libc::alarm(period_secs as c_uint);
    }
    Ok(())
}

pub fn rearm_alarm(period_secs: u64) {
    unsafe {
        libc::alarm(period_secs as c_uint);
    }
}

/// Cancel the interval clock and detach the handler's pipe before its
/// descriptor is closed.
pub fn disarm_alarm() {
    ALARM_PIPE.store(-1, Ordering::SeqCst);
    unsafe {
        libc::alarm(0);
    }
}

// ---- File metadata and mapping ----

fn path_cstring(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))
}

pub struct FileStat {
    pub size: u64,
    mode: u32,
}

impl FileStat {
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    pub fn world_readable(&self) -> bool {
        self.mode & libc::S_IROTH != 0
    }
}

pub fn stat_path(path: &Path) -> io::Result<FileStat> {
    let c_path = path_cstring(path)?;
    unsafe {
        let mut st: libc::stat = mem::zeroed();
        if libc::stat(c_path.as_ptr(), &mut st) < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(FileStat {
            size: st.st_size as u64,
            mode: st.st_mode,
        })
    }
}

/// Read-only private mapping of a regular file, for zero-copy sends.
pub struct MappedFile {
    addr: *mut c_void,
    len: usize,
}

// The mapping is private and read-only; moving it between the
// dispatcher and a worker is safe.
unsafe impl Send for MappedFile {}

impl MappedFile {
    /// Map `len` bytes of `path`. `len` must be nonzero (mmap rejects
    /// empty mappings); callers special-case empty files.
    pub fn open(path: &Path, len: usize) -> io::Result<Self> {
        debug_assert!(len > 0);
        let c_path = path_cstring(path)?;
        unsafe {
            let fd = libc::open(c_path.as_ptr(), libc::O_RDONLY);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            let addr = libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                fd,
                0,
            );
            libc::close(fd);
            if addr == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }
            Ok(Self { addr, len })
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.addr as *const u8, self.len) }
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.addr, self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn stat_reports_size_and_kind() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f.html");
        fs::write(&file, b"hello").unwrap();

        let st = stat_path(&file).unwrap();
        assert_eq!(st.size, 5);
        assert!(!st.is_dir());

        let st = stat_path(dir.path()).unwrap();
        assert!(st.is_dir());

        assert!(stat_path(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn mapped_file_exposes_contents() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f.bin");
        fs::write(&file, b"mapped bytes").unwrap();

        let map = MappedFile::open(&file, 12).unwrap();
        assert_eq!(map.as_slice(), b"mapped bytes");
    }

    #[test]
    fn pipe_notify_and_drain() {
        let (rd, wr) = create_pipe().unwrap();
        notify_pipe(wr);
        notify_pipe(wr);
        drain_pipe(rd);
        // Drained: a further read would block.
        let mut buf = [0u8; 8];
        let err = read_nonblocking(rd, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        close_fd(rd);
        close_fd(wr);
    }
}
