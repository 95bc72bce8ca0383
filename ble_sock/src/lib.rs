//! Raw `AF_BLUETOOTH` socket primitives: an owned file descriptor, thin
//! syscall wrappers parameterized over a [`SysSockAddr`], and an
//! `AsyncFd`-backed async read/write loop (`sock_priv!`) shared by every
//! socket wrapper built on top. [`hci`] is the one such wrapper this crate
//! ships — a raw `BTPROTO_HCI` channel, the transport every other layer of
//! the host stack (management, HCI commands/events, and the ACL frames
//! `ble_l2cap` demultiplexes) is built on.

pub mod hci;
pub mod sys;

use libc::{c_int, sockaddr, socklen_t, Ioctl, F_GETFL, F_SETFL, SOCK_CLOEXEC};
use std::{
    io::{Error, ErrorKind, Result},
    mem::{size_of, MaybeUninit},
    os::unix::io::{AsRawFd, IntoRawFd, RawFd},
};
use tokio::io::ReadBuf;

/// File descriptor that is closed on drop.
#[derive(Debug)]
pub struct OwnedFd {
    fd: RawFd,
    close_on_drop: bool,
}

impl OwnedFd {
    /// Takes ownership of an already-open file descriptor.
    ///
    /// # Safety
    /// `fd` must be a valid, open file descriptor not owned elsewhere.
    pub unsafe fn new(fd: RawFd) -> Self {
        Self {
            fd,
            close_on_drop: true,
        }
    }
}

impl AsRawFd for OwnedFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl IntoRawFd for OwnedFd {
    fn into_raw_fd(mut self) -> RawFd {
        self.close_on_drop = false;
        self.fd
    }
}

impl Drop for OwnedFd {
    fn drop(&mut self) {
        if self.close_on_drop {
            unsafe { libc::close(self.fd) };
        }
    }
}

/// Address convertible to and from a system socket address.
pub trait SysSockAddr: Sized {
    type SysSockAddr: Sized + 'static;

    fn into_sys_sock_addr(self) -> Self::SysSockAddr;
    fn try_from_sys_sock_addr(addr: Self::SysSockAddr) -> Result<Self>;
}

/// Creates a socket of the given type. The caller decides whether to put it
/// into non-blocking mode afterwards (some controllers misbehave with a
/// client accepted while still non-blocking).
pub fn socket(sa: c_int, ty: c_int, proto: c_int) -> Result<OwnedFd> {
    match unsafe { libc::socket(sa, ty | SOCK_CLOEXEC, proto) } {
        -1 => Err(Error::last_os_error()),
        fd => Ok(unsafe { OwnedFd::new(fd) }),
    }
}

pub fn bind<SA: SysSockAddr>(socket: &OwnedFd, sa: SA) -> Result<()> {
    let addr = sa.into_sys_sock_addr();
    if unsafe {
        libc::bind(
            socket.as_raw_fd(),
            &addr as *const _ as *const sockaddr,
            size_of::<SA::SysSockAddr>() as socklen_t,
        )
    } == 0
    {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

pub fn getsockname<SA: SysSockAddr>(socket: &OwnedFd) -> Result<SA> {
    let mut saddr: MaybeUninit<SA::SysSockAddr> = MaybeUninit::uninit();
    let mut length = size_of::<SA::SysSockAddr>() as socklen_t;
    if unsafe { libc::getsockname(socket.as_raw_fd(), saddr.as_mut_ptr() as *mut _, &mut length) }
        == -1
    {
        return Err(Error::last_os_error());
    }
    if length != size_of::<SA::SysSockAddr>() as socklen_t {
        return Err(Error::new(ErrorKind::InvalidInput, "invalid sockaddr length from getsockname"));
    }
    SA::try_from_sys_sock_addr(unsafe { saddr.assume_init() })
}

pub fn getpeername<SA: SysSockAddr>(socket: &OwnedFd) -> Result<SA> {
    let mut saddr: MaybeUninit<SA::SysSockAddr> = MaybeUninit::uninit();
    let mut length = size_of::<SA::SysSockAddr>() as socklen_t;
    if unsafe { libc::getpeername(socket.as_raw_fd(), saddr.as_mut_ptr() as *mut _, &mut length) }
        == -1
    {
        return Err(Error::last_os_error());
    }
    if length != size_of::<SA::SysSockAddr>() as socklen_t {
        return Err(Error::new(ErrorKind::InvalidInput, "invalid sockaddr length from getpeername"));
    }
    SA::try_from_sys_sock_addr(unsafe { saddr.assume_init() })
}

pub fn connect<SA: SysSockAddr>(socket: &OwnedFd, sa: SA) -> Result<()> {
    let addr = sa.into_sys_sock_addr();
    if unsafe {
        libc::connect(
            socket.as_raw_fd(),
            &addr as *const _ as *const sockaddr,
            size_of::<SA::SysSockAddr>() as socklen_t,
        )
    } == 0
    {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

pub fn send(socket: &OwnedFd, buf: &[u8], flags: c_int) -> Result<usize> {
    match unsafe { libc::send(socket.as_raw_fd(), buf.as_ptr() as *const _, buf.len(), flags) } {
        -1 => Err(Error::last_os_error()),
        n => Ok(n as usize),
    }
}

pub fn sendto<SA: SysSockAddr>(socket: &OwnedFd, buf: &[u8], flags: c_int, sa: SA) -> Result<usize> {
    let addr = sa.into_sys_sock_addr();
    match unsafe {
        libc::sendto(
            socket.as_raw_fd(),
            buf.as_ptr() as *const _,
            buf.len(),
            flags,
            &addr as *const _ as *const sockaddr,
            size_of::<SA::SysSockAddr>() as socklen_t,
        )
    } {
        -1 => Err(Error::last_os_error()),
        n => Ok(n as usize),
    }
}

pub fn recv(socket: &OwnedFd, buf: &mut ReadBuf, flags: c_int) -> Result<usize> {
    let unfilled = unsafe { buf.unfilled_mut() };
    match unsafe {
        libc::recv(socket.as_raw_fd(), unfilled.as_mut_ptr() as *mut _, unfilled.len(), flags)
    } {
        -1 => Err(Error::last_os_error()),
        n => {
            let n = n as usize;
            unsafe { buf.assume_init(n) };
            buf.advance(n);
            Ok(n)
        }
    }
}

pub fn recvfrom<SA: SysSockAddr>(socket: &OwnedFd, buf: &mut ReadBuf, flags: c_int) -> Result<(usize, SA)> {
    let unfilled = unsafe { buf.unfilled_mut() };
    let mut saddr: MaybeUninit<SA::SysSockAddr> = MaybeUninit::uninit();
    let mut length = size_of::<SA::SysSockAddr>() as socklen_t;
    match unsafe {
        libc::recvfrom(
            socket.as_raw_fd(),
            unfilled.as_mut_ptr() as *mut _,
            unfilled.len(),
            flags,
            saddr.as_mut_ptr() as *mut _,
            &mut length,
        )
    } {
        -1 => Err(Error::last_os_error()),
        n => {
            let n = n as usize;
            unsafe { buf.assume_init(n) };
            buf.advance(n);
            if length != size_of::<SA::SysSockAddr>() as socklen_t {
                return Err(Error::new(ErrorKind::InvalidInput, "invalid sockaddr length"));
            }
            let sa = SA::try_from_sys_sock_addr(unsafe { saddr.assume_init() })?;
            Ok((n, sa))
        }
    }
}

pub fn shutdown(socket: &OwnedFd, how: c_int) -> Result<()> {
    if unsafe { libc::shutdown(socket.as_raw_fd(), how) } == 0 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

pub fn getsockopt<T>(socket: &OwnedFd, level: c_int, optname: c_int) -> Result<T> {
    let mut optval: MaybeUninit<T> = MaybeUninit::uninit();
    let mut optlen: socklen_t = size_of::<T>() as _;
    if unsafe {
        libc::getsockopt(socket.as_raw_fd(), level, optname, optval.as_mut_ptr() as *mut _, &mut optlen)
    } == -1
    {
        return Err(Error::last_os_error());
    }
    if optlen != size_of::<T>() as _ {
        return Err(Error::new(ErrorKind::InvalidInput, "invalid size"));
    }
    Ok(unsafe { optval.assume_init() })
}

pub fn setsockopt<T>(socket: &OwnedFd, level: c_int, optname: i32, optval: &T) -> Result<()> {
    let optlen: socklen_t = size_of::<T>() as _;
    if unsafe {
        libc::setsockopt(socket.as_raw_fd(), level, optname, optval as *const _ as *const _, optlen)
    } == -1
    {
        return Err(Error::last_os_error());
    }
    Ok(())
}

pub fn ioctl_read<T>(socket: &OwnedFd, request: Ioctl) -> Result<T> {
    let mut value: MaybeUninit<T> = MaybeUninit::uninit();
    let ret = unsafe { libc::ioctl(socket.as_raw_fd(), request, value.as_mut_ptr()) };
    if ret == -1 {
        return Err(Error::last_os_error());
    }
    Ok(unsafe { value.assume_init() })
}

#[allow(dead_code)]
pub fn ioctl_write<T>(socket: &OwnedFd, request: Ioctl, value: &T) -> Result<c_int> {
    let ret = unsafe { libc::ioctl(socket.as_raw_fd(), request, value as *const _) };
    if ret == -1 {
        return Err(Error::last_os_error());
    }
    Ok(ret)
}

pub fn fcntl_read(socket: &OwnedFd) -> Result<c_int> {
    let ret = unsafe { libc::fcntl(socket.as_raw_fd(), F_GETFL, 0) };
    if ret == -1 {
        return Err(Error::last_os_error());
    }
    Ok(ret)
}

pub fn fcntl_write(socket: &OwnedFd, flags: c_int) -> Result<c_int> {
    let ret = unsafe { libc::fcntl(socket.as_raw_fd(), F_SETFL, flags) };
    if ret == -1 {
        return Err(Error::last_os_error());
    }
    Ok(ret)
}

/// Generates the async accept/connect/send/recv/peek/shutdown methods shared
/// by every `AsyncFd`-backed socket wrapper in this crate (currently just
/// [`hci::Socket`], but kept as a macro so a future raw-channel type doesn't
/// have to re-derive the readiness-retry loop by hand).
macro_rules! sock_priv {
    () => {
        #[allow(dead_code)]
        async fn connect_priv(&self, sa: SocketAddr) -> Result<()> {
            use libc::{EAGAIN, EINPROGRESS, SOL_SOCKET, SO_ERROR};
            match crate::connect(self.fd.get_ref(), sa) {
                Ok(()) => Ok(()),
                Err(err)
                    if err.raw_os_error() == Some(EINPROGRESS)
                        || err.raw_os_error() == Some(EAGAIN) =>
                {
                    loop {
                        let mut guard = self.fd.writable().await?;
                        match guard.try_io(|inner| {
                            let err: c_int = crate::getsockopt(inner.get_ref(), SOL_SOCKET, SO_ERROR)?;
                            match err {
                                0 => Ok(()),
                                EINPROGRESS | EAGAIN => Err(ErrorKind::WouldBlock.into()),
                                _ => Err(Error::from_raw_os_error(err)),
                            }
                        }) {
                            Ok(result) => break result,
                            Err(_would_block) => continue,
                        }
                    }?;
                    Ok(())
                }
                Err(err) => Err(err),
            }
        }

        async fn send_priv(&self, buf: &[u8]) -> Result<usize> {
            loop {
                let mut guard = self.fd.writable().await?;
                match guard.try_io(|inner| crate::send(inner.get_ref(), buf, 0)) {
                    Ok(result) => return result,
                    Err(_would_block) => continue,
                }
            }
        }

        fn poll_send_priv(&self, cx: &mut Context, buf: &[u8]) -> Poll<Result<usize>> {
            loop {
                let mut guard = std::task::ready!(self.fd.poll_write_ready(cx))?;
                match guard.try_io(|inner| crate::send(inner.get_ref(), buf, 0)) {
                    Ok(result) => return Poll::Ready(result),
                    Err(_would_block) => continue,
                }
            }
        }

        #[allow(dead_code)]
        async fn send_to_priv(&self, buf: &[u8], target: SocketAddr) -> Result<usize> {
            loop {
                let mut guard = self.fd.writable().await?;
                match guard.try_io(|inner| crate::sendto(inner.get_ref(), buf, 0, target)) {
                    Ok(result) => return result,
                    Err(_would_block) => continue,
                }
            }
        }

        async fn recv_priv(&self, buf: &mut [u8]) -> Result<usize> {
            let mut buf = ReadBuf::new(buf);
            loop {
                let mut guard = self.fd.readable().await?;
                match guard.try_io(|inner| crate::recv(inner.get_ref(), &mut buf, 0)) {
                    Ok(result) => return result,
                    Err(_would_block) => continue,
                }
            }
        }

        fn poll_recv_priv(&self, cx: &mut Context, buf: &mut ReadBuf) -> Poll<Result<()>> {
            loop {
                let mut guard = std::task::ready!(self.fd.poll_read_ready(cx))?;
                match guard.try_io(|inner| crate::recv(inner.get_ref(), buf, 0)) {
                    Ok(result) => return Poll::Ready(result.map(|_| ())),
                    Err(_would_block) => continue,
                }
            }
        }

        #[allow(dead_code)]
        async fn recv_from_priv(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
            let mut buf = ReadBuf::new(buf);
            loop {
                let mut guard = self.fd.readable().await?;
                match guard.try_io(|inner| crate::recvfrom(inner.get_ref(), &mut buf, 0)) {
                    Ok(result) => return result,
                    Err(_would_block) => continue,
                }
            }
        }

        fn shutdown_priv(&self, how: std::net::Shutdown) -> Result<()> {
            use libc::{SHUT_RD, SHUT_RDWR, SHUT_WR};
            let how = match how {
                std::net::Shutdown::Read => SHUT_RD,
                std::net::Shutdown::Write => SHUT_WR,
                std::net::Shutdown::Both => SHUT_RDWR,
            };
            crate::shutdown(self.fd.get_ref(), how)?;
            Ok(())
        }
    };
}

pub(crate) use sock_priv;
