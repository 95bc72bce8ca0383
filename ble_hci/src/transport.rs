//! Opens one raw HCI socket per adapter, installs a kernel-side filter that
//! whitelists the event codes the engine subscribes to, and exposes a
//! framed read/write interface over [`crate::frame::Frame`]. This layer
//! does not fragment ACL payloads — `ble_l2cap` enforces the max payload
//! above it — and reads are framed by the kernel raw-socket boundary rather
//! than length-prefixed by us.

use ble_sock::hci::{Filter, Socket, SocketAddr};

use crate::error::HciError;
use crate::frame::Frame;

const READ_BUF_SIZE: usize = 1024;

/// Event codes the engine must receive per spec: CommandComplete (0x0E),
/// CommandStatus (0x0F), Number Of Completed Packets (0x13), Connection
/// Complete (0x03), Disconnection Complete (0x05), Max Slots Change (0x1B),
/// and the LE Meta Event umbrella (0x3E) carrying advertising reports,
/// connection (update) complete, read remote used features, LTK request
/// and PHY update complete as sub-events.
const SUBSCRIBED_EVENTS: &[u8] = &[0x03, 0x05, 0x0E, 0x0F, 0x13, 0x1B, 0x3E];

pub struct HciTransport {
    socket: Socket,
}

impl HciTransport {
    /// Opens and binds a raw HCI socket to `dev_id`, installing the filter
    /// that admits Command, Event and ACL-Data packets for the event codes
    /// the engine needs.
    pub fn open(dev_id: u16) -> Result<Self, HciError> {
        let socket = Socket::new()?;
        socket.bind(SocketAddr::new(dev_id))?;
        let mut filter = Filter::new();
        filter.set_packet_type(crate::frame::PACKET_EVENT);
        filter.set_packet_type(crate::frame::PACKET_ACL_DATA);
        for &code in SUBSCRIBED_EVENTS {
            filter.set_event(code);
        }
        socket.set_filter(filter)?;
        Ok(Self { socket })
    }

    /// Reads one inbound frame. Framing is whatever the kernel socket
    /// delivers per `recv()`; this never blocks past the first whole
    /// packet since raw HCI sockets are packet-oriented.
    pub async fn read_frame(&self) -> Result<Frame, HciError> {
        let mut buf = vec![0u8; READ_BUF_SIZE];
        let n = self.socket.recv(&mut buf).await?;
        if n == 0 {
            return Err(HciError::TransportClosed);
        }
        buf.truncate(n);
        Ok(Frame::parse(&buf)?)
    }

    pub async fn write_frame(&self, frame: &Frame) -> Result<(), HciError> {
        let bytes = frame.to_bytes();
        self.socket.send(&bytes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribed_events_cover_spec_minimum() {
        for code in [0x03u8, 0x05, 0x0E, 0x0F, 0x13, 0x1B, 0x3E] {
            assert!(SUBSCRIBED_EVENTS.contains(&code));
        }
    }
}
