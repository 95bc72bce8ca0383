//! Raw native types for `AF_BLUETOOTH`/`BTPROTO_HCI` sockets. Excerpted from
//! the subset of the `bluer` project's `sys.rs` that concerns the HCI raw
//! channel; the BR/EDR and kernel-L2CAP-socket constants that module also
//! carries are not needed here since L2CAP is framed in software, not via
//! a kernel socket (see `ble_l2cap`).
#![allow(dead_code)]

use libc::sa_family_t;

pub const BTPROTO_HCI: i32 = 1;
pub const SOL_HCI: i32 = 0;
pub const HCI_FILTER: i32 = 2;

#[repr(C)]
#[derive(Clone)]
pub struct sockaddr_hci {
    pub hci_family: sa_family_t,
    pub hci_dev: u16,
    pub hci_channel: u16,
}

#[repr(C)]
#[derive(Clone)]
pub struct hci_filter {
    pub type_mask: u32,
    pub event_mask: [u32; 2],
    pub opcode: u16,
}
