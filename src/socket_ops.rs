//! Raw, non-blocking TCP socket setup. Grounded on annety's `SocketsOps`
//! free-function wrappers around `socket(2)`/`bind(2)`/`listen(2)`/
//! `accept4(2)`/`connect(2)`, reshaped as thin wrappers over the
//! `syscall!` macro the way `mio`'s own `sys/unix/net.rs` does it.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use crate::endpoint::Endpoint;
use crate::fd::{FdKind, SelectableFd};
use crate::sys::syscall;

/// Creates a non-blocking, close-on-exec TCP socket for `addr`'s family.
pub fn new_nonblocking_socket(addr: &SocketAddr) -> io::Result<SelectableFd> {
    let domain = if addr.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };
    let fd = syscall!(socket(
        domain,
        libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        0,
    ))?;
    Ok(unsafe { SelectableFd::from_raw(fd, FdKind::Socket) })
}

pub fn set_reuse_addr(fd: RawFd, on: bool) -> io::Result<()> {
    set_sockopt_bool(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, on)
}

pub fn set_reuse_port(fd: RawFd, on: bool) -> io::Result<()> {
    set_sockopt_bool(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, on)
}

pub fn set_tcp_nodelay(fd: RawFd, on: bool) -> io::Result<()> {
    set_sockopt_bool(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, on)
}

pub fn set_keep_alive(fd: RawFd, on: bool) -> io::Result<()> {
    set_sockopt_bool(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, on)
}

fn set_sockopt_bool(fd: RawFd, level: i32, name: i32, on: bool) -> io::Result<()> {
    let val: libc::c_int = if on { 1 } else { 0 };
    syscall!(setsockopt(
        fd,
        level,
        name,
        &val as *const _ as *const libc::c_void,
        mem::size_of::<libc::c_int>() as libc::socklen_t,
    ))?;
    Ok(())
}

pub fn bind(fd: RawFd, addr: &Endpoint) -> io::Result<()> {
    let (storage, len) = addr.as_sockaddr_storage();
    syscall!(bind(fd, &storage as *const _ as *const libc::sockaddr, len))?;
    Ok(())
}

pub fn listen(fd: RawFd, backlog: i32) -> io::Result<()> {
    syscall!(listen(fd, backlog))?;
    Ok(())
}

/// Accepts a connection, returning the accepted non-blocking socket and
/// the peer address. Returns `Err(WouldBlock)` if nothing is pending.
pub fn accept(listen_fd: RawFd) -> io::Result<(SelectableFd, SocketAddr)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let fd = syscall!(accept4(
        listen_fd,
        &mut storage as *mut _ as *mut libc::sockaddr,
        &mut len,
        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
    ))?;
    let addr = sockaddr_storage_to_socket_addr(&storage)?;
    Ok((unsafe { SelectableFd::from_raw(fd, FdKind::Socket) }, addr))
}

/// Starts a non-blocking connect. `Ok(true)` means connected immediately
/// or close enough to treat as such (loopback, or the syscall reporting
/// `EINTR`/`EISCONN`, both of which mean the connection is already
/// progressing); `Ok(false)` means in progress and the caller should
/// wait for writability. `Err` carries the raw errno so the caller can
/// dispatch retry-vs-drop per its own table.
pub fn connect(fd: RawFd, addr: &Endpoint) -> io::Result<bool> {
    let (storage, len) = addr.as_sockaddr_storage();
    let rc = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EINPROGRESS) => Ok(false),
        Some(libc::EINTR) | Some(libc::EISCONN) => Ok(true),
        _ => Err(err),
    }
}

/// Reads `SO_ERROR` and clears it, the standard way to learn whether a
/// non-blocking connect that became writable actually succeeded.
pub fn socket_error(fd: RawFd) -> io::Result<i32> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    syscall!(getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut err as *mut _ as *mut libc::c_void,
        &mut len,
    ))?;
    Ok(err)
}

pub fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len))?;
    sockaddr_storage_to_socket_addr(&storage)
}

pub fn peer_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getpeername(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len))?;
    sockaddr_storage_to_socket_addr(&storage)
}

/// Half-closes the write side (FIN), leaving reads open.
pub fn shutdown_write(fd: RawFd) -> io::Result<()> {
    match syscall!(shutdown(fd, libc::SHUT_WR)) {
        Ok(_) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::ENOTCONN) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Raw, unbuffered write to a fd, mapping `EAGAIN`/`EWOULDBLOCK` to
/// `io::ErrorKind::WouldBlock` the way a non-blocking socket should.
pub fn raw_write(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    let n = syscall!(write(fd, data.as_ptr() as *const libc::c_void, data.len()))?;
    Ok(n as usize)
}

/// Thin `Read` adapter over a raw fd so `ByteBuffer::read_fd` can
/// scatter-read directly off a socket we otherwise manage by hand (no
/// `std::net::TcpStream` in the picture: the fd is owned by a
/// `SelectableFd` elsewhere).
pub struct RawFdReader(pub RawFd);

impl io::Read for RawFdReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = syscall!(read(self.0, buf.as_mut_ptr() as *mut libc::c_void, buf.len()))?;
        Ok(n as usize)
    }
}

fn sockaddr_storage_to_socket_addr(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as i32 {
        libc::AF_INET => {
            let addr_in: libc::sockaddr_in =
                unsafe { *(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(addr_in.sin_addr.s_addr));
            let port = u16::from_be(addr_in.sin_port);
            Ok(SocketAddr::new(ip.into(), port))
        }
        libc::AF_INET6 => {
            let addr_in6: libc::sockaddr_in6 =
                unsafe { *(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(addr_in6.sin6_addr.s6_addr);
            let port = u16::from_be(addr_in6.sin6_port);
            Ok(SocketAddr::new(ip.into(), port))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported address family {family}"),
        )),
    }
}
