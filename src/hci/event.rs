//! HCI Event Construction
//!
//! Typed parameter blocks for the events the emulated controller produces,
//! plus the reserved-event mask that decides which events the Set Event Mask
//! command may suppress.

use crate::{BluetoothAddress, constants::MAX_DEVICE_NAME_LENGTH, hci::Status};

/// Event codes emitted by the controller
pub mod code {
    /// Inquiry Complete
    pub const INQUIRY_COMPLETE: u8 = 0x01;
    /// Inquiry Result
    pub const INQUIRY_RESULT: u8 = 0x02;
    /// Connection Complete
    pub const CONNECTION_COMPLETE: u8 = 0x03;
    /// Connection Request
    pub const CONNECTION_REQUEST: u8 = 0x04;
    /// Disconnection Complete
    pub const DISCONNECTION_COMPLETE: u8 = 0x05;
    /// Authentication Complete
    pub const AUTH_COMPLETE: u8 = 0x06;
    /// Remote Name Request Complete
    pub const REMOTE_NAME_REQUEST_COMPLETE: u8 = 0x07;
    /// Encryption Change
    pub const ENCRYPTION_CHANGE: u8 = 0x08;
    /// Read Remote Supported Features Complete
    pub const READ_REMOTE_FEATURES_COMPLETE: u8 = 0x0B;
    /// Read Remote Version Information Complete
    pub const READ_REMOTE_VERSION_COMPLETE: u8 = 0x0C;
    /// Command Complete
    pub const COMMAND_COMPLETE: u8 = 0x0E;
    /// Command Status
    pub const COMMAND_STATUS: u8 = 0x0F;
    /// Flush Occurred
    pub const FLUSH_OCCURRED: u8 = 0x11;
    /// Number Of Completed Packets
    pub const NUM_COMPLETED_PACKETS: u8 = 0x13;
    /// Mode Change
    pub const MODE_CHANGE: u8 = 0x14;
    /// Read Clock Offset Complete
    pub const READ_CLOCK_OFFSET_COMPLETE: u8 = 0x1C;
    /// Inquiry Result With RSSI
    pub const INQUIRY_RESULT_WITH_RSSI: u8 = 0x22;
    /// Read Remote Extended Features Complete
    pub const READ_REMOTE_EXT_FEATURES_COMPLETE: u8 = 0x23;
}

/// ACL link type value in connection events
pub const LINK_TYPE_ACL: u8 = 0x01;

/// Bits of the event space the host is allowed to mask out
///
/// A clear bit here marks an event the controller always delivers
/// (Command Complete/Status and their kin).
pub const RESERVED_EVENT_MASK: [u8; 8] = [0xFF, 0x9F, 0xFB, 0xFF, 0x07, 0x18, 0x00, 0x00];

fn put_u16(out: &mut [u8], at: usize, value: u16) {
    out[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

/// Command Status event parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandStatus {
    /// Outcome of command reception
    pub status: Status,
    /// Number of commands the host may send (always 1 here)
    pub num_cmd: u8,
    /// Opcode the status refers to
    pub opcode: u16,
}

impl CommandStatus {
    /// Encode the event parameters
    #[must_use]
    pub fn to_bytes(self) -> [u8; 4] {
        let mut out = [0u8; 4];
        out[0] = self.status.to_u8();
        out[1] = self.num_cmd;
        put_u16(&mut out, 2, self.opcode);
        out
    }
}

/// Inquiry Result event parameters (one response)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InquiryResult {
    /// Responding device address
    pub bd_addr: BluetoothAddress,
    /// Responding device class
    pub dev_class: [u8; 3],
    /// Responder's clock offset
    pub clock_offset: u16,
}

impl InquiryResult {
    /// Encode the event parameters (standard format)
    #[must_use]
    pub fn to_bytes(self) -> [u8; 15] {
        let mut out = [0u8; 15];
        out[0] = 1; // one response per event
        out[1..7].copy_from_slice(self.bd_addr.as_bytes());
        // pscan_rep_mode, pscan_period_mode, pscan_mode: R0 / P0 / standard
        out[10..13].copy_from_slice(&self.dev_class);
        put_u16(&mut out, 13, self.clock_offset);
        out
    }

    /// Encode the event parameters (with-RSSI format)
    #[must_use]
    pub fn to_bytes_with_rssi(self, rssi: i8) -> [u8; 15] {
        let mut out = [0u8; 15];
        out[0] = 1;
        out[1..7].copy_from_slice(self.bd_addr.as_bytes());
        // pscan_rep_mode, pscan_period_mode: R0 / P0; no pscan_mode field
        out[9..12].copy_from_slice(&self.dev_class);
        put_u16(&mut out, 12, self.clock_offset);
        out[14] = rssi as u8;
        out
    }
}

/// Connection Request event parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionRequest {
    /// Requesting device address
    pub bd_addr: BluetoothAddress,
    /// Requesting device class
    pub dev_class: [u8; 3],
}

impl ConnectionRequest {
    /// Encode the event parameters
    #[must_use]
    pub fn to_bytes(self) -> [u8; 10] {
        let mut out = [0u8; 10];
        out[0..6].copy_from_slice(self.bd_addr.as_bytes());
        out[6..9].copy_from_slice(&self.dev_class);
        out[9] = LINK_TYPE_ACL;
        out
    }
}

/// Connection Complete event parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionComplete {
    /// Outcome of the connection attempt
    pub status: Status,
    /// Allocated handle, 0 on failure
    pub handle: u16,
    /// Peer device address
    pub bd_addr: BluetoothAddress,
}

impl ConnectionComplete {
    /// Encode the event parameters
    #[must_use]
    pub fn to_bytes(self) -> [u8; 11] {
        let mut out = [0u8; 11];
        out[0] = self.status.to_u8();
        put_u16(&mut out, 1, self.handle);
        out[3..9].copy_from_slice(self.bd_addr.as_bytes());
        out[9] = LINK_TYPE_ACL;
        out[10] = 0x00; // encryption not required
        out
    }
}

/// Disconnection Complete event parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectionComplete {
    /// Outcome of the disconnection
    pub status: Status,
    /// Handle that was torn down
    pub handle: u16,
    /// Reason the link went away
    pub reason: u8,
}

impl DisconnectionComplete {
    /// Encode the event parameters
    #[must_use]
    pub fn to_bytes(self) -> [u8; 4] {
        let mut out = [0u8; 4];
        out[0] = self.status.to_u8();
        put_u16(&mut out, 1, self.handle);
        out[3] = self.reason;
        out
    }
}

/// Authentication Complete event parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthComplete {
    /// Handle the authentication ran on
    pub handle: u16,
}

impl AuthComplete {
    /// Encode the event parameters
    #[must_use]
    pub fn to_bytes(self) -> [u8; 3] {
        let mut out = [0u8; 3];
        out[0] = Status::Success.to_u8();
        put_u16(&mut out, 1, self.handle);
        out
    }
}

/// Encryption Change event parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptionChange {
    /// Affected handle
    pub handle: u16,
    /// New encryption mode
    pub encrypt: u8,
}

impl EncryptionChange {
    /// Encode the event parameters
    #[must_use]
    pub fn to_bytes(self) -> [u8; 4] {
        let mut out = [0u8; 4];
        out[0] = Status::Success.to_u8();
        put_u16(&mut out, 1, self.handle);
        out[3] = self.encrypt;
        out
    }
}

/// Remote Name Request Complete event parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteNameRequestComplete {
    /// Peer address
    pub bd_addr: BluetoothAddress,
}

impl RemoteNameRequestComplete {
    /// Encode the event parameters with the peer's zero-padded name
    #[must_use]
    pub fn to_bytes(self, name: Option<&str>) -> [u8; 7 + MAX_DEVICE_NAME_LENGTH] {
        let mut out = [0u8; 7 + MAX_DEVICE_NAME_LENGTH];
        out[0] = Status::Success.to_u8();
        out[1..7].copy_from_slice(self.bd_addr.as_bytes());
        if let Some(name) = name {
            let bytes = name.as_bytes();
            let len = bytes.len().min(MAX_DEVICE_NAME_LENGTH);
            out[7..7 + len].copy_from_slice(&bytes[..len]);
        }
        out
    }
}

/// Read Remote Supported Features Complete event parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRemoteFeaturesComplete {
    /// Queried handle
    pub handle: u16,
    /// Peer's LMP feature bitmap
    pub features: u64,
}

impl ReadRemoteFeaturesComplete {
    /// Encode the event parameters
    #[must_use]
    pub fn to_bytes(self) -> [u8; 11] {
        let mut out = [0u8; 11];
        out[0] = Status::Success.to_u8();
        put_u16(&mut out, 1, self.handle);
        out[3..11].copy_from_slice(&self.features.to_le_bytes());
        out
    }
}

/// Read Remote Extended Features Complete event parameters
///
/// The controller supports no extended feature pages on peers, so the event
/// always carries the Unsupported Feature status with zeroed pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRemoteExtFeaturesComplete {
    /// Queried handle
    pub handle: u16,
}

impl ReadRemoteExtFeaturesComplete {
    /// Encode the event parameters
    #[must_use]
    pub fn to_bytes(self) -> [u8; 13] {
        let mut out = [0u8; 13];
        out[0] = Status::UnsupportedFeature.to_u8();
        put_u16(&mut out, 1, self.handle);
        out
    }
}

/// Read Remote Version Information Complete event parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRemoteVersionComplete {
    /// Queried handle
    pub handle: u16,
}

impl ReadRemoteVersionComplete {
    /// Encode the event parameters
    #[must_use]
    pub fn to_bytes(self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0] = Status::Success.to_u8();
        put_u16(&mut out, 1, self.handle);
        out[3] = 0x03; // LMP 1.2
        put_u16(&mut out, 4, 0xA000);
        put_u16(&mut out, 6, 0xA607);
        out
    }
}

/// Read Clock Offset Complete event parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadClockOffsetComplete {
    /// Queried handle
    pub handle: u16,
    /// Peer's clock offset
    pub clock_offset: u16,
}

impl ReadClockOffsetComplete {
    /// Encode the event parameters
    #[must_use]
    pub fn to_bytes(self) -> [u8; 5] {
        let mut out = [0u8; 5];
        out[0] = Status::Success.to_u8();
        put_u16(&mut out, 1, self.handle);
        put_u16(&mut out, 3, self.clock_offset);
        out
    }
}

/// Mode Change event parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeChange {
    /// Affected handle
    pub handle: u16,
    /// New ACL mode
    pub mode: u8,
    /// Mode interval in baseband slots
    pub interval: u16,
}

impl ModeChange {
    /// Encode the event parameters
    #[must_use]
    pub fn to_bytes(self) -> [u8; 6] {
        let mut out = [0u8; 6];
        out[0] = Status::Success.to_u8();
        put_u16(&mut out, 1, self.handle);
        out[3] = self.mode;
        put_u16(&mut out, 4, self.interval);
        out
    }
}

/// Number Of Completed Packets event parameters (single handle)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumCompletedPackets {
    /// Handle the packets were consumed on
    pub handle: u16,
    /// Number of packets consumed
    pub packets: u16,
}

impl NumCompletedPackets {
    /// Encode the event parameters
    #[must_use]
    pub fn to_bytes(self) -> [u8; 5] {
        let mut out = [0u8; 5];
        out[0] = 1; // one handle entry
        put_u16(&mut out, 1, self.handle);
        put_u16(&mut out, 3, self.packets);
        out
    }
}

/// Flush Occurred event parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushOccurred {
    /// Handle that was flushed
    pub handle: u16,
}

impl FlushOccurred {
    /// Encode the event parameters
    #[must_use]
    pub fn to_bytes(self) -> [u8; 2] {
        self.handle.to_le_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_status_layout() {
        let bytes = CommandStatus {
            status: Status::Success,
            num_cmd: 1,
            opcode: 0x0401,
        }
        .to_bytes();
        assert_eq!(bytes, [0x00, 0x01, 0x01, 0x04]);
    }

    #[test]
    fn test_connection_complete_layout() {
        let bytes = ConnectionComplete {
            status: Status::Success,
            handle: 0x0021,
            bd_addr: BluetoothAddress::new([1, 2, 3, 4, 5, 6]),
        }
        .to_bytes();
        assert_eq!(bytes[0], 0x00);
        assert_eq!(&bytes[1..3], &[0x21, 0x00]);
        assert_eq!(&bytes[3..9], &[1, 2, 3, 4, 5, 6]);
        assert_eq!(bytes[9], LINK_TYPE_ACL);
        assert_eq!(bytes[10], 0x00);
    }

    #[test]
    fn test_inquiry_result_formats() {
        let result = InquiryResult {
            bd_addr: BluetoothAddress::new([1, 2, 3, 4, 5, 6]),
            dev_class: [0x40, 0x25, 0x00],
            clock_offset: 0x3333,
        };

        let standard = result.to_bytes();
        assert_eq!(standard[0], 1);
        assert_eq!(&standard[10..13], &[0x40, 0x25, 0x00]);

        let rssi = result.to_bytes_with_rssi(20);
        assert_eq!(&rssi[9..12], &[0x40, 0x25, 0x00]);
        assert_eq!(rssi[14] as i8, 20);
    }

    #[test]
    fn test_remote_name_padding() {
        let bytes = RemoteNameRequestComplete {
            bd_addr: BluetoothAddress::new([1, 2, 3, 4, 5, 6]),
        }
        .to_bytes(Some("wren"));
        assert_eq!(&bytes[7..11], b"wren");
        assert!(bytes[11..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_reserved_mask_never_gates_command_events() {
        for evt in [code::COMMAND_COMPLETE, code::COMMAND_STATUS] {
            let byte = usize::from((evt - 1) >> 3);
            let bit = (evt - 1) & 7;
            assert_eq!(RESERVED_EVENT_MASK[byte] & (1 << bit), 0);
        }
    }
}
