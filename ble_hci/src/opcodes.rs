//! A minimal set of HCI command opcodes this stack issues directly (adapter
//! reset/init and the LE controller commands `ble_host` drives for
//! discovery, advertising and connection setup). Opcode = OGF | OCF per
//! Bluetooth Core Vol 2 Part E §5.4.1.

use crate::frame::Opcode;

const OGF_LINK_CONTROL: u8 = 0x01;
const OGF_HOST_CONTROL: u8 = 0x03;
const OGF_LE_CONTROLLER: u8 = 0x08;

pub const DISCONNECT: Opcode = Opcode::new(OGF_LINK_CONTROL, 0x0006);
pub const RESET: Opcode = Opcode::new(OGF_HOST_CONTROL, 0x0003);
pub const SET_EVENT_MASK: Opcode = Opcode::new(OGF_HOST_CONTROL, 0x0001);

pub const LE_SET_EVENT_MASK: Opcode = Opcode::new(OGF_LE_CONTROLLER, 0x0001);
pub const LE_SET_ADVERTISING_PARAMETERS: Opcode = Opcode::new(OGF_LE_CONTROLLER, 0x0006);
pub const LE_SET_ADVERTISING_DATA: Opcode = Opcode::new(OGF_LE_CONTROLLER, 0x0008);
pub const LE_SET_SCAN_RESPONSE_DATA: Opcode = Opcode::new(OGF_LE_CONTROLLER, 0x0009);
pub const LE_SET_ADVERTISE_ENABLE: Opcode = Opcode::new(OGF_LE_CONTROLLER, 0x000A);
pub const LE_SET_SCAN_PARAMETERS: Opcode = Opcode::new(OGF_LE_CONTROLLER, 0x000B);
pub const LE_SET_SCAN_ENABLE: Opcode = Opcode::new(OGF_LE_CONTROLLER, 0x000C);
pub const LE_CREATE_CONNECTION: Opcode = Opcode::new(OGF_LE_CONTROLLER, 0x000D);
pub const LE_CREATE_CONNECTION_CANCEL: Opcode = Opcode::new(OGF_LE_CONTROLLER, 0x000E);
pub const LE_CONNECTION_UPDATE: Opcode = Opcode::new(OGF_LE_CONTROLLER, 0x0013);
pub const LE_LONG_TERM_KEY_REQUEST_REPLY: Opcode = Opcode::new(OGF_LE_CONTROLLER, 0x001A);
pub const LE_LONG_TERM_KEY_REQUEST_NEGATIVE_REPLY: Opcode = Opcode::new(OGF_LE_CONTROLLER, 0x001B);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcodes_decode_to_expected_ogf() {
        assert_eq!(LE_CREATE_CONNECTION.ogf(), OGF_LE_CONTROLLER);
        assert_eq!(RESET.ogf(), OGF_HOST_CONTROL);
        assert_eq!(DISCONNECT.ogf(), OGF_LINK_CONTROL);
    }
}
