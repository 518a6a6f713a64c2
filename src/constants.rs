//! `Mockingbird` Constants
//!
//! This module contains all the constants used throughout the `Mockingbird`
//! library. These define the emulated controller's limits, default values and
//! Bluetooth-specific parameters.

/// Maximum number of devices in one scatternet
pub const MAX_DEVICES: usize = 4;

/// Maximum number of simultaneous ACL connection handles per controller
pub const MAX_HCI_HANDLES: usize = 0x10;

/// Offset added to a handle table index to form a connection handle
pub const HCI_HANDLE_OFFSET: u16 = 0x20;

/// Maximum number of outstanding outgoing connection attempts
pub const MAX_AWAITING_CONNECTIONS: usize = MAX_HCI_HANDLES;

/// One inquiry length unit in microseconds (1.28 s)
pub const INQUIRY_UNIT_US: u64 = 1_280_000;

/// One baseband slot in microseconds (0.625 ms)
pub const BASEBAND_SLOT_US: u64 = 625;

/// RSSI reported for every inquiry response, in dBm
pub const DEFAULT_RSSI_DBM: i8 = 20;

/// Default Connection Accept Timeout in baseband slots (5 s)
pub const DEFAULT_CONN_ACCEPT_TIMEOUT: u16 = 0x1F40;

/// LMP features reported by the emulated controller
///
/// Kept in sync with the supported-commands bitmask returned by
/// Read Local Supported Commands.
pub const LOCAL_LMP_FEATURES: u64 = 0x8000_199B_7E85_355F;

/// Maximum length of a device name on the wire
pub const MAX_DEVICE_NAME_LENGTH: usize = 248;

/// Maximum HCI event parameter length
pub const MAX_EVENT_PARAMS: usize = 255;

/// Size of a complete HCI event packet (header plus parameters)
pub const EVENT_PACKET_SIZE: usize = MAX_EVENT_PARAMS + 2;

/// Largest ACL data fragment accepted from or sent towards the host
pub const ACL_FRAGMENT_SIZE: usize = 1024;

/// Size of a complete HCI ACL packet (header plus payload)
pub const ACL_PACKET_SIZE: usize = ACL_FRAGMENT_SIZE + 4;

/// Depth of the controller-to-host event queue
pub const EVENT_QUEUE_DEPTH: usize = 16;

/// Depth of the controller-to-host ACL data queue
pub const ACL_QUEUE_DEPTH: usize = 8;

/// Depth of the scatternet's pending link-layer signal queue
pub const SIGNAL_QUEUE_DEPTH: usize = 16;

/// Maximum number of armed timers per scatternet
pub const MAX_TIMERS: usize = 16;

/// Size of the per-link L2CAP PDU recombination buffer
pub const L2CAP_FRAME_BUFFER_SIZE: usize = 2048;

/// Size of the per-channel segmented-SDU reassembly buffer
pub const L2CAP_SDU_BUFFER_SIZE: usize = 2048;

/// Maximum number of PSM registrations per peer device
pub const MAX_PSM_REGISTRATIONS: usize = 4;

/// Maximum number of concurrent ACL links per peer device
pub const MAX_PEER_LINKS: usize = 2;
