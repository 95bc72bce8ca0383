//! Raw `BTPROTO_HCI` channel: the one socket this whole stack opens against
//! the kernel. Every Command, ACL-Data and Event frame crosses this type;
//! `ble_hci` owns framing and correlation, this module owns only the
//! readiness-based async I/O and the kernel event filter.

use crate::{
    sock_priv,
    sys::{hci_filter, sockaddr_hci, BTPROTO_HCI, HCI_FILTER, SOL_HCI},
    OwnedFd, SysSockAddr,
};
use libc::{AF_BLUETOOTH, SOCK_RAW, SOL_SOCKET, SO_RCVBUF, TIOCINQ, TIOCOUTQ};
use std::{
    fmt,
    io::{Error, ErrorKind, Result},
    os::{
        raw::c_int,
        unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd},
    },
    task::{Context, Poll},
};
use tokio::io::{unix::AsyncFd, ReadBuf};

/// No specific adapter; used to bind the management control channel, which
/// is not tied to one HCI device index.
pub const DEV_NONE: u16 = 0xFFFF;
/// Raw HCI channel: Commands/ACL-Data/Events for one adapter (the default).
pub const CHANNEL_RAW: u16 = 0;
/// Management control channel: adapter add/remove/power/name/keys, bound
/// with `dev_id = DEV_NONE`.
pub const CHANNEL_CONTROL: u16 = 3;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SocketAddr {
    pub dev_id: u16,
    pub channel: u16,
}

impl SocketAddr {
    pub const fn new(dev_id: u16) -> Self {
        Self {
            dev_id,
            channel: CHANNEL_RAW,
        }
    }

    pub const fn with_channel(dev_id: u16, channel: u16) -> Self {
        Self { dev_id, channel }
    }

    pub const fn any_raw() -> Self {
        Self {
            dev_id: 0,
            channel: CHANNEL_RAW,
        }
    }
}

impl SysSockAddr for SocketAddr {
    type SysSockAddr = sockaddr_hci;

    fn into_sys_sock_addr(self) -> Self::SysSockAddr {
        sockaddr_hci {
            hci_family: AF_BLUETOOTH as _,
            hci_dev: self.dev_id,
            hci_channel: self.channel,
        }
    }

    fn try_from_sys_sock_addr(saddr: Self::SysSockAddr) -> Result<Self> {
        if saddr.hci_family != AF_BLUETOOTH as _ {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "sockaddr_hci::hci_family is not AF_BLUETOOTH",
            ));
        }
        Ok(Self {
            dev_id: saddr.hci_dev,
            channel: saddr.hci_channel,
        })
    }
}

/// HCI socket filter (`setsockopt(SOL_HCI, HCI_FILTER, ...)`). `type_mask`
/// selects packet types (Command/ACL/SCO/Event), `event_mask` is a 64-bit
/// bitmap of accepted event codes, `opcode` optionally restricts Command
/// Complete/Status events to one opcode.
#[derive(Debug, Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Filter {
    pub type_mask: u32,
    pub event_mask: [u32; 2],
    pub opcode: u16,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_packet_type(&mut self, pkt_type: u8) -> &mut Self {
        self.type_mask |= 1 << pkt_type;
        self
    }

    pub fn set_event(&mut self, event_code: u8) -> &mut Self {
        let idx = (event_code / 32) as usize;
        self.event_mask[idx.min(1)] |= 1 << (event_code % 32);
        self
    }
}

impl Default for Filter {
    fn default() -> Self {
        Self {
            type_mask: 0,
            event_mask: [0, 0],
            opcode: 0,
        }
    }
}

impl From<Filter> for hci_filter {
    fn from(f: Filter) -> Self {
        hci_filter {
            type_mask: f.type_mask,
            event_mask: f.event_mask,
            opcode: f.opcode,
        }
    }
}

pub struct Socket {
    fd: AsyncFd<OwnedFd>,
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Socket").field("fd", &self.fd.as_raw_fd()).finish()
    }
}

impl Socket {
    pub fn new() -> Result<Socket> {
        Ok(Self {
            fd: AsyncFd::new(crate::socket(AF_BLUETOOTH, SOCK_RAW, BTPROTO_HCI)?)?,
        })
    }

    pub fn bind(&self, sa: SocketAddr) -> Result<()> {
        crate::bind(self.fd.get_ref(), sa)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        crate::getsockname(self.fd.get_ref())
    }

    pub fn set_filter(&self, filter: Filter) -> Result<()> {
        let f: hci_filter = filter.into();
        crate::setsockopt(self.fd.get_ref(), SOL_HCI, HCI_FILTER, &f)
    }

    pub fn recv_buffer(&self) -> Result<i32> {
        crate::getsockopt(self.fd.get_ref(), SOL_SOCKET, SO_RCVBUF)
    }

    pub fn set_recv_buffer(&self, recv_buffer: i32) -> Result<()> {
        crate::setsockopt(self.fd.get_ref(), SOL_SOCKET, SO_RCVBUF, &recv_buffer)
    }

    pub fn input_buffer(&self) -> Result<u32> {
        let value: c_int = crate::ioctl_read(self.fd.get_ref(), TIOCINQ)?;
        Ok(value as u32)
    }

    pub fn output_buffer(&self) -> Result<u32> {
        let value: c_int = crate::ioctl_read(self.fd.get_ref(), TIOCOUTQ)?;
        Ok(value as u32)
    }

    /// # Safety
    /// `fd` must be a valid, open `AF_BLUETOOTH`/`BTPROTO_HCI` socket not
    /// owned elsewhere.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Result<Self> {
        Ok(Self {
            fd: AsyncFd::new(OwnedFd::new(fd))?,
        })
    }

    pub async fn send(&self, buf: &[u8]) -> Result<usize> {
        self.send_priv(buf).await
    }

    pub fn poll_send(&self, cx: &mut Context, buf: &[u8]) -> Poll<Result<usize>> {
        self.poll_send_priv(cx, buf)
    }

    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        self.recv_priv(buf).await
    }

    pub fn poll_recv(&self, cx: &mut Context, buf: &mut ReadBuf) -> Poll<Result<()>> {
        self.poll_recv_priv(cx, buf)
    }

    sock_priv!();
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl IntoRawFd for Socket {
    fn into_raw_fd(self) -> RawFd {
        self.fd.into_inner().into_raw_fd()
    }
}

impl FromRawFd for Socket {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self::from_raw_fd(fd).expect("from_raw_fd failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_sets_expected_bits() {
        let mut f = Filter::new();
        f.set_packet_type(0x04).set_event(0x0E);
        assert_eq!(f.type_mask, 1 << 0x04);
        assert_eq!(f.event_mask, [1 << 0x0E, 0]);
    }

    #[test]
    fn filter_high_event_codes_land_in_second_word() {
        let mut f = Filter::new();
        f.set_event(40);
        assert_eq!(f.event_mask, [0, 1 << 8]);
    }
}
