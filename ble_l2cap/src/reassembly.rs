//! Per-connection-handle L2CAP reassembly. The Bluetooth Core spec forbids
//! interleaving fragments of different L2CAP PDUs on one logical link, so
//! one buffer per handle is sufficient — a `FirstAutoFlushable`/
//! `FirstNonAutoFlushable` boundary always starts a fresh frame.

use crate::error::L2capInternalError;
use crate::frame::L2capFrame;

#[derive(Default)]
pub struct Reassembler {
    buf: Vec<u8>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one ACL-Data fragment. `is_first` comes from the packet's
    /// boundary flag. Returns every L2CAP frame the buffer can now yield
    /// complete (usually zero or one).
    pub fn feed(&mut self, is_first: bool, data: &[u8]) -> Result<Vec<L2capFrame>, L2capInternalError> {
        if is_first {
            self.buf.clear();
        }
        self.buf.extend_from_slice(data);

        let mut out = Vec::new();
        loop {
            if self.buf.len() < 4 {
                break;
            }
            let (_, len) = L2capFrame::parse_header(&self.buf)?;
            let total = 4 + len as usize;
            if self.buf.len() < total {
                break;
            }
            let frame = L2capFrame::parse_complete(&self.buf[..total])?;
            self.buf.drain(..total);
            out.push(frame);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembles_a_frame_split_across_two_fragments() {
        let full = L2capFrame::new(0x0004, vec![0xAA; 10]).to_bytes();
        let mut r = Reassembler::new();
        assert!(r.feed(true, &full[..6]).unwrap().is_empty());
        let frames = r.feed(false, &full[6..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, vec![0xAA; 10]);
    }

    #[test]
    fn a_new_first_fragment_discards_a_stale_partial_frame() {
        let mut r = Reassembler::new();
        let partial = L2capFrame::new(0x0004, vec![0xFF; 10]).to_bytes();
        assert!(r.feed(true, &partial[..4]).unwrap().is_empty());

        let full = L2capFrame::new(0x0006, vec![0x11; 2]).to_bytes();
        let frames = r.feed(true, &full).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].cid, 0x0006);
    }

    #[test]
    fn yields_two_frames_delivered_back_to_back() {
        let mut bytes = L2capFrame::new(0x0004, vec![0x01]).to_bytes();
        bytes.extend(L2capFrame::new(0x0004, vec![0x02]).to_bytes());
        let mut r = Reassembler::new();
        let frames = r.feed(true, &bytes).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].payload, vec![0x01]);
        assert_eq!(frames[1].payload, vec![0x02]);
    }
}
