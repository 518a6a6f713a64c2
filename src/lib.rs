#![no_std]
#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![allow(dead_code, clippy::cast_possible_truncation, clippy::too_many_lines)]

mod address;
mod class_of_device;
pub mod clock;
pub mod constants;
mod device;
pub mod hci;
pub mod l2cap;
pub mod processor;
pub mod sdp;

use embassy_sync::{
    blocking_mutex::raw::CriticalSectionRawMutex,
    mutex::{MappedMutexGuard, Mutex, MutexGuard},
};

pub use address::BluetoothAddress;
pub use class_of_device::{ClassOfDevice, MajorDeviceClass, MajorServiceClasses};
pub use device::{AclMode, Device, DeviceId, LinkKey, LinkRole, Scatternet};
pub use l2cap::PsmService;

/// Global `Scatternet`, initialized by the client at runtime
pub(crate) static SCATTERNET: Mutex<CriticalSectionRawMutex, Option<Scatternet>> =
    Mutex::new(None);

/// Initialize the global `Scatternet`
///
/// Must be called before spawning [`processor::run`] or using
/// [`scatternet`]. Devices are added through the returned guard of
/// [`scatternet`] afterwards.
///
/// # Errors
///
/// Returns an error if the `Scatternet` has already been initialized.
pub async fn init_scatternet() -> Result<(), &'static str> {
    let mut guard = SCATTERNET.lock().await;
    if guard.is_some() {
        return Err("Scatternet already initialized");
    }
    *guard = Some(Scatternet::new());
    Ok(())
}

/// Get a locked reference to the global `Scatternet`
///
/// # Errors
///
/// Returns an error if the `Scatternet` has not been initialized.
///
/// # Panics
///
/// Panics if the mutex guard cannot be mapped (should never happen in
/// practice).
pub async fn scatternet<'a>()
-> Result<MappedMutexGuard<'a, CriticalSectionRawMutex, Scatternet>, &'static str> {
    let guard = SCATTERNET.lock().await;
    if guard.is_none() {
        return Err("Scatternet not initialized");
    }
    Ok(MutexGuard::map(guard, |opt| opt.as_mut().unwrap()))
}

/// Bluetooth-related errors of the embedding API
///
/// Protocol errors never surface here; peers see them as ordinary protocol
/// responses. These cover misuse of the crate API itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum BluetoothError {
    /// Invalid parameter provided (e.g., malformed address)
    InvalidParameter,
    /// The device slot is empty or holds the wrong device kind
    InvalidDevice,
    /// Every device slot of the scatternet is occupied
    TooManyDevices,
    /// The PSM is already bound on this device
    DuplicatePsm,
    /// The PSM registration table is full
    RegistryFull,
}

/// Options for an emulated peer device
///
/// Controllers ignore these; their identity is configured by the host
/// through HCI commands.
#[derive(Debug, Clone, Copy)]
pub struct DeviceOptions {
    /// Device name answered to remote name requests
    pub name: &'static str,
    /// Class of Device reported in inquiry results
    pub class_of_device: ClassOfDevice,
    /// Whether the device answers inquiries
    pub inquiry_scan: bool,
    /// Whether the device answers pages
    pub page_scan: bool,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            name: "",
            class_of_device: ClassOfDevice::UNSPECIFIED,
            inquiry_scan: true,
            page_scan: true,
        }
    }
}

#[cfg(test)]
mod test_logger {
    #[defmt::global_logger]
    struct Logger;

    unsafe impl defmt::Logger for Logger {
        fn acquire() {}
        unsafe fn flush() {}
        unsafe fn release() {}
        unsafe fn write(_bytes: &[u8]) {}
    }

    defmt::timestamp!("{=u64}", 0);

    #[defmt::panic_handler]
    fn defmt_panic() -> ! {
        core::panic!()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::Duration, hci::opcode::cmd};
    use heapless::Vec;

    fn command(opcode: u16, params: &[u8]) -> Vec<u8, 64> {
        let mut packet = Vec::new();
        packet.extend_from_slice(&opcode.to_le_bytes()).unwrap();
        packet.push(params.len() as u8).unwrap();
        packet.extend_from_slice(params).unwrap();
        packet
    }

    fn acl_packet(handle: u16, payload: &[u8]) -> Vec<u8, 512> {
        let mut packet = Vec::new();
        let handle_flags = handle | (0x2 << 12); // start fragment
        packet.extend_from_slice(&handle_flags.to_le_bytes()).unwrap();
        packet
            .extend_from_slice(&(payload.len() as u16).to_le_bytes())
            .unwrap();
        packet.extend_from_slice(payload).unwrap();
        packet
    }

    fn l2cap_pdu(cid: u16, payload: &[u8]) -> Vec<u8, 480> {
        let mut pdu = Vec::new();
        pdu.extend_from_slice(&(payload.len() as u16).to_le_bytes())
            .unwrap();
        pdu.extend_from_slice(&cid.to_le_bytes()).unwrap();
        pdu.extend_from_slice(payload).unwrap();
        pdu
    }

    fn signalling(code: u8, identifier: u8, params: &[u8]) -> Vec<u8, 128> {
        let mut command = Vec::new();
        command.push(code).unwrap();
        command.push(identifier).unwrap();
        command
            .extend_from_slice(&(params.len() as u16).to_le_bytes())
            .unwrap();
        command.extend_from_slice(params).unwrap();
        command
    }

    fn drain_events(net: &mut Scatternet, device: DeviceId) -> Vec<hci::EventPacket, 16> {
        let mut events = Vec::new();
        while let Some(event) = net.poll_event(device) {
            events.push(event).unwrap();
        }
        events
    }

    fn drain_acl(net: &mut Scatternet, device: DeviceId) -> Vec<hci::AclPacket, 8> {
        let mut packets = Vec::new();
        while let Some(packet) = net.poll_acl(device) {
            packets.push(packet).unwrap();
        }
        packets
    }

    /// Drive Create Connection to completion, returning the new handle
    fn connect(net: &mut Scatternet, hci_dev: DeviceId, peer: DeviceId) -> u16 {
        let peer_addr = net.device_info(peer).unwrap().bd_addr;
        let mut params: Vec<u8, 16> = Vec::new();
        params.extend_from_slice(peer_addr.as_bytes()).unwrap();
        params.extend_from_slice(&0xCC18u16.to_le_bytes()).unwrap();
        params.extend_from_slice(&[0x01, 0x00, 0x00, 0x00, 0x01]).unwrap();

        net.hci_command(hci_dev, &command(cmd::CREATE_CONNECTION, &params))
            .unwrap();
        let events = drain_events(net, hci_dev);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0][0], 0x0F); // Command Status
        assert_eq!(events[0][2], 0x00);
        assert_eq!(events[1][0], 0x03); // Connection Complete
        assert_eq!(events[1][2], 0x00, "connection failed");
        u16::from_le_bytes([events[1][3], events[1][4]])
    }

    /// Open an L2CAP channel to `psm` and finish configuration,
    /// returning the peer-assigned CID
    fn open_channel(
        net: &mut Scatternet,
        hci_dev: DeviceId,
        handle: u16,
        psm: u16,
        scid: u16,
    ) -> u16 {
        let mut conn_req: Vec<u8, 8> = Vec::new();
        conn_req.extend_from_slice(&psm.to_le_bytes()).unwrap();
        conn_req.extend_from_slice(&scid.to_le_bytes()).unwrap();
        net.hci_acl(
            hci_dev,
            &acl_packet(handle, &l2cap_pdu(1, &signalling(0x02, 1, &conn_req))),
        )
        .unwrap();

        let responses = drain_acl(net, hci_dev);
        assert_eq!(responses.len(), 2);
        // Connection Response.
        assert_eq!(responses[0][8], 0x03);
        let dcid = u16::from_le_bytes([responses[0][12], responses[0][13]]);
        assert_eq!(
            u16::from_le_bytes([responses[0][16], responses[0][17]]),
            0x0000,
            "channel refused"
        );
        // The engine's own Configuration Request follows immediately.
        assert_eq!(responses[1][8], 0x04);
        let peer_config_id = responses[1][9];

        // Our configuration: offer MTU 672.
        let mut conf_req: Vec<u8, 16> = Vec::new();
        conf_req.extend_from_slice(&dcid.to_le_bytes()).unwrap();
        conf_req.extend_from_slice(&[0x00, 0x00]).unwrap();
        conf_req.extend_from_slice(&[0x01, 0x02, 0xA0, 0x02]).unwrap();
        net.hci_acl(
            hci_dev,
            &acl_packet(handle, &l2cap_pdu(1, &signalling(0x04, 2, &conf_req))),
        )
        .unwrap();
        let responses = drain_acl(net, hci_dev);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0][8], 0x05); // Configuration Response
        assert_eq!(
            u16::from_le_bytes([responses[0][16], responses[0][17]]),
            0x0000,
            "configuration rejected"
        );

        // Accept the engine's configuration request.
        let mut conf_rsp: Vec<u8, 8> = Vec::new();
        conf_rsp.extend_from_slice(&dcid.to_le_bytes()).unwrap();
        conf_rsp.extend_from_slice(&[0x00, 0x00]).unwrap();
        conf_rsp.extend_from_slice(&[0x00, 0x00]).unwrap();
        net.hci_acl(
            hci_dev,
            &acl_packet(
                handle,
                &l2cap_pdu(1, &signalling(0x05, peer_config_id, &conf_rsp)),
            ),
        )
        .unwrap();
        assert!(drain_acl(net, hci_dev).is_empty());

        dcid
    }

    // --------------------------------------------------------------
    // Scenario A: inquiry

    #[test]
    fn test_inquiry_scenario() {
        let mut net = Scatternet::new();
        let hci_dev = net.add_controller().unwrap();
        let peer = net.add_peer(DeviceOptions::default()).unwrap();
        let peer_addr = net.device_info(peer).unwrap().bd_addr;

        net.hci_command(
            hci_dev,
            &command(cmd::INQUIRY, &[0x33, 0x8B, 0x9E, 0x04, 0x00]),
        )
        .unwrap();

        let events = drain_events(&mut net, hci_dev);
        assert_eq!(events.len(), 2);
        // Command Status, success.
        assert_eq!(events[0][0], 0x0F);
        assert_eq!(events[0][2], 0x00);
        assert_eq!(
            u16::from_le_bytes([events[0][4], events[0][5]]),
            cmd::INQUIRY
        );
        // Exactly one Inquiry Result for the scannable peer.
        assert_eq!(events[1][0], 0x02);
        assert_eq!(events[1][2], 1);
        assert_eq!(&events[1][3..9], peer_addr.as_bytes());

        // Nothing more until the 4 x 1.28 s window closes.
        net.advance(Duration::from_secs(5));
        assert!(drain_events(&mut net, hci_dev).is_empty());
        net.advance(Duration::from_millis(200));

        let events = drain_events(&mut net, hci_dev);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0][0], 0x01); // Inquiry Complete
        assert_eq!(events[0][2], 0x00);
    }

    #[test]
    fn test_inquiry_with_rssi_mode() {
        let mut net = Scatternet::new();
        let hci_dev = net.add_controller().unwrap();
        net.add_peer(DeviceOptions::default()).unwrap();

        net.hci_command(hci_dev, &command(cmd::WRITE_INQUIRY_MODE, &[0x01]))
            .unwrap();
        drain_events(&mut net, hci_dev);

        net.hci_command(
            hci_dev,
            &command(cmd::INQUIRY, &[0x33, 0x8B, 0x9E, 0x01, 0x00]),
        )
        .unwrap();
        let events = drain_events(&mut net, hci_dev);
        assert_eq!(events[1][0], 0x22); // Inquiry Result With RSSI
        assert_eq!(events[1][16] as i8, constants::DEFAULT_RSSI_DBM);
    }

    #[test]
    fn test_inquiry_cancel_requires_active_inquiry() {
        let mut net = Scatternet::new();
        let hci_dev = net.add_controller().unwrap();

        net.hci_command(hci_dev, &command(cmd::INQUIRY_CANCEL, &[]))
            .unwrap();
        let events = drain_events(&mut net, hci_dev);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0][0], 0x0E);
        assert_eq!(events[0][5], 0x0C); // Command Disallowed
    }

    // --------------------------------------------------------------
    // Scenario C: malformed command

    #[test]
    fn test_short_command_leaves_state_untouched() {
        let mut net = Scatternet::new();
        let hci_dev = net.add_controller().unwrap();

        net.hci_command(hci_dev, &[0x01, 0x04]).unwrap();
        let events = drain_events(&mut net, hci_dev);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0][0], 0x0F);
        assert_eq!(events[0][2], 0x12); // Invalid HCI Command Parameters
        // No command was decoded, so no opcode to correlate with.
        assert_eq!(u16::from_le_bytes([events[0][4], events[0][5]]), 0x0000);

        // The engine keeps answering normally.
        net.hci_command(hci_dev, &command(cmd::READ_BD_ADDR, &[]))
            .unwrap();
        let events = drain_events(&mut net, hci_dev);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0][0], 0x0E);
        assert_eq!(events[0][5], 0x00);
    }

    #[test]
    fn test_unknown_opcode_and_nop_probe() {
        let mut net = Scatternet::new();
        let hci_dev = net.add_controller().unwrap();

        // Zero OGF/OCF is a NOP probe: no response at all.
        net.hci_command(hci_dev, &[0x00, 0x00, 0x00]).unwrap();
        assert!(drain_events(&mut net, hci_dev).is_empty());

        // An unknown opcode produces Command Status with Unknown Command.
        net.hci_command(hci_dev, &[0xFF, 0x3F, 0x00]).unwrap();
        let events = drain_events(&mut net, hci_dev);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0][0], 0x0F);
        assert_eq!(events[0][2], 0x01);
    }

    // --------------------------------------------------------------
    // Connection lifecycle

    #[test]
    fn test_connection_handles_unique_and_reused() {
        let mut net = Scatternet::new();
        let hci_dev = net.add_controller().unwrap();
        let p1 = net.add_peer(DeviceOptions::default()).unwrap();
        let p2 = net.add_peer(DeviceOptions::default()).unwrap();

        let h1 = connect(&mut net, hci_dev, p1);
        let h2 = connect(&mut net, hci_dev, p2);
        assert_ne!(h1, h2);
        assert_eq!(h1 & 0xFFE0, 0x0020);
        assert_eq!(h2 & 0xFFE0, 0x0020);

        // Disconnect the first link.
        let mut params: Vec<u8, 4> = Vec::new();
        params.extend_from_slice(&h1.to_le_bytes()).unwrap();
        params.push(0x13).unwrap();
        net.hci_command(hci_dev, &command(cmd::DISCONNECT, &params))
            .unwrap();
        let events = drain_events(&mut net, hci_dev);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1][0], 0x05); // Disconnection Complete
        assert_eq!(u16::from_le_bytes([events[1][3], events[1][4]]), h1);
        assert_eq!(events[1][5], 0x16); // terminated by local host

        // The freed handle index becomes available again.
        let h3 = connect(&mut net, hci_dev, p1);
        assert_ne!(h3, h2);
    }

    #[test]
    fn test_create_connection_to_unknown_address() {
        let mut net = Scatternet::new();
        let hci_dev = net.add_controller().unwrap();

        let mut params: Vec<u8, 16> = Vec::new();
        params
            .extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01])
            .unwrap();
        params.extend_from_slice(&0xCC18u16.to_le_bytes()).unwrap();
        params.extend_from_slice(&[0x01, 0x00, 0x00, 0x00, 0x01]).unwrap();

        net.hci_command(hci_dev, &command(cmd::CREATE_CONNECTION, &params))
            .unwrap();
        let events = drain_events(&mut net, hci_dev);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0][0], 0x0F);
        assert_eq!(events[1][0], 0x03);
        assert_eq!(events[1][2], 0x02); // Unknown Connection Identifier
        assert_eq!(u16::from_le_bytes([events[1][3], events[1][4]]), 0);
    }

    #[test]
    fn test_create_connection_cancel_converges() {
        let mut net = Scatternet::new();
        let hci_a = net.add_controller().unwrap();
        let hci_b = net.add_controller().unwrap();
        let b_addr = net.device_info(hci_b).unwrap().bd_addr;

        // B scans so A can page it; B's host must accept manually.
        net.hci_command(hci_b, &command(cmd::WRITE_SCAN_ENABLE, &[0x03]))
            .unwrap();
        drain_events(&mut net, hci_b);

        let mut params: Vec<u8, 16> = Vec::new();
        params.extend_from_slice(b_addr.as_bytes()).unwrap();
        params.extend_from_slice(&0xCC18u16.to_le_bytes()).unwrap();
        params.extend_from_slice(&[0x01, 0x00, 0x00, 0x00, 0x01]).unwrap();
        net.hci_command(hci_a, &command(cmd::CREATE_CONNECTION, &params))
            .unwrap();
        drain_events(&mut net, hci_a);
        // B's host sees the request.
        let events = drain_events(&mut net, hci_b);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0][0], 0x04); // Connection Request

        // A cancels while B has not answered.
        net.hci_command(
            hci_a,
            &command(cmd::CREATE_CONNECTION_CANCEL, b_addr.as_bytes()),
        )
        .unwrap();
        let events = drain_events(&mut net, hci_a);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0][0], 0x0E);
        assert_eq!(events[0][5], 0x00); // cancel succeeded

        // B's host accepts anyway; both sides converge on "no connection".
        let mut accept: Vec<u8, 8> = Vec::new();
        accept.extend_from_slice(
            net.device_info(hci_a).unwrap().bd_addr.as_bytes(),
        )
        .unwrap();
        accept.push(0x01).unwrap();
        net.hci_command(hci_b, &command(cmd::ACCEPT_CONNECTION_REQUEST, &accept))
            .unwrap();

        // A answers the late completion with a failed Connection Complete.
        let events = drain_events(&mut net, hci_a);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0][0], 0x03);
        assert_eq!(events[0][2], 0x02);

        // B briefly had the link and sees it torn down again.
        let events = drain_events(&mut net, hci_b);
        assert!(events.iter().any(|e| e[0] == 0x05));
    }

    #[test]
    fn test_hold_mode_expires_back_to_active() {
        let mut net = Scatternet::new();
        let hci_dev = net.add_controller().unwrap();
        let peer = net.add_peer(DeviceOptions::default()).unwrap();
        let handle = connect(&mut net, hci_dev, peer);

        let mut params: Vec<u8, 8> = Vec::new();
        params.extend_from_slice(&handle.to_le_bytes()).unwrap();
        params.extend_from_slice(&0x0800u16.to_le_bytes()).unwrap(); // max
        params.extend_from_slice(&0x0002u16.to_le_bytes()).unwrap(); // min

        net.hci_command(hci_dev, &command(cmd::HOLD_MODE, &params))
            .unwrap();
        let events = drain_events(&mut net, hci_dev);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1][0], 0x14); // Mode Change
        assert_eq!(events[1][5], 0x01); // hold

        // 0x0800 slots is 1.28 s; the mode auto-reverts afterwards.
        net.advance(Duration::from_secs(2));
        let events = drain_events(&mut net, hci_dev);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0][0], 0x14);
        assert_eq!(events[0][5], 0x00); // active again

        // A second hold with odd intervals is invalid.
        let mut bad: Vec<u8, 8> = Vec::new();
        bad.extend_from_slice(&handle.to_le_bytes()).unwrap();
        bad.extend_from_slice(&0x0801u16.to_le_bytes()).unwrap();
        bad.extend_from_slice(&0x0003u16.to_le_bytes()).unwrap();
        net.hci_command(hci_dev, &command(cmd::HOLD_MODE, &bad))
            .unwrap();
        let events = drain_events(&mut net, hci_dev);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0][2], 0x12);
    }

    // --------------------------------------------------------------
    // Scenario B: connection + SDP query

    #[test]
    fn test_connect_and_query_sdp() {
        let mut net = Scatternet::new();
        let hci_dev = net.add_controller().unwrap();
        let peer = net.add_peer(DeviceOptions::default()).unwrap();

        let handle = connect(&mut net, hci_dev, peer);
        let dcid = open_channel(&mut net, hci_dev, handle, 0x0001, 0x0040);

        // Service Search for the SDP server class (0x1000).
        let mut query: Vec<u8, 32> = Vec::new();
        query
            .extend_from_slice(&[
                0x02, 0x12, 0x34, 0x00, 0x08, // header, 8 parameter bytes
                0x35, 0x03, 0x19, 0x10, 0x00, // pattern: uuid16 0x1000
                0x00, 0x10, // max count
                0x00, // no continuation
            ])
            .unwrap();
        net.hci_acl(hci_dev, &acl_packet(handle, &l2cap_pdu(dcid, &query)))
            .unwrap();

        let responses = drain_acl(&mut net, hci_dev);
        assert_eq!(responses.len(), 1);
        // The response comes back on our channel.
        assert_eq!(u16::from_le_bytes([responses[0][6], responses[0][7]]), 0x0040);
        let sdp = &responses[0][8..];
        assert_eq!(sdp[0], 0x03); // Service Search Response
        assert_eq!(&sdp[1..3], &[0x12, 0x34]);
        let total = u16::from_be_bytes([sdp[5], sdp[6]]);
        let current = u16::from_be_bytes([sdp[7], sdp[8]]);
        assert_eq!(total, 1);
        assert_eq!(current, 1);
        let record = u32::from_be_bytes([sdp[9], sdp[10], sdp[11], sdp[12]]);
        assert_eq!(record, sdp::record::SDP_SERVER_RECORD_HANDLE);
    }

    #[test]
    fn test_cid_allocation_bounded_and_unique() {
        let mut net = Scatternet::new();
        let hci_dev = net.add_controller().unwrap();
        let peer = net.add_peer(DeviceOptions::default()).unwrap();
        let handle = connect(&mut net, hci_dev, peer);

        let mut seen: Vec<u16, 16> = Vec::new();
        for i in 0..l2cap::channel::MAX_L2CAP_CHANNELS as u16 {
            let scid = 0x0040 + i;
            let mut conn_req: Vec<u8, 8> = Vec::new();
            conn_req.extend_from_slice(&0x0001u16.to_le_bytes()).unwrap();
            conn_req.extend_from_slice(&scid.to_le_bytes()).unwrap();
            net.hci_acl(
                hci_dev,
                &acl_packet(handle, &l2cap_pdu(1, &signalling(0x02, 1 + i as u8, &conn_req))),
            )
            .unwrap();
            let responses = drain_acl(&mut net, hci_dev);
            let dcid = u16::from_le_bytes([responses[0][12], responses[0][13]]);
            assert!((0x0040..0x0100).contains(&dcid));
            assert!(!seen.contains(&dcid));
            seen.push(dcid).unwrap();
        }

        // The table is full now; the next open is refused with No Resources.
        let mut conn_req: Vec<u8, 8> = Vec::new();
        conn_req.extend_from_slice(&0x0001u16.to_le_bytes()).unwrap();
        conn_req.extend_from_slice(&0x0060u16.to_le_bytes()).unwrap();
        net.hci_acl(
            hci_dev,
            &acl_packet(handle, &l2cap_pdu(1, &signalling(0x02, 0x20, &conn_req))),
        )
        .unwrap();
        let responses = drain_acl(&mut net, hci_dev);
        assert_eq!(responses[0][8], 0x03);
        assert_eq!(
            u16::from_le_bytes([responses[0][16], responses[0][17]]),
            0x0004
        );
    }

    #[test]
    fn test_bad_psm_rejected() {
        let mut net = Scatternet::new();
        let hci_dev = net.add_controller().unwrap();
        let peer = net.add_peer(DeviceOptions::default()).unwrap();
        let handle = connect(&mut net, hci_dev, peer);

        let mut conn_req: Vec<u8, 8> = Vec::new();
        conn_req.extend_from_slice(&0x7777u16.to_le_bytes()).unwrap();
        conn_req.extend_from_slice(&0x0040u16.to_le_bytes()).unwrap();
        net.hci_acl(
            hci_dev,
            &acl_packet(handle, &l2cap_pdu(1, &signalling(0x02, 1, &conn_req))),
        )
        .unwrap();
        let responses = drain_acl(&mut net, hci_dev);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0][8], 0x03);
        assert_eq!(
            u16::from_le_bytes([responses[0][16], responses[0][17]]),
            0x0002 // PSM not supported
        );
    }

    #[test]
    fn test_configuration_negotiation_converges() {
        let mut net = Scatternet::new();
        let hci_dev = net.add_controller().unwrap();
        let peer = net.add_peer(DeviceOptions::default()).unwrap();
        let handle = connect(&mut net, hci_dev, peer);

        let mut conn_req: Vec<u8, 8> = Vec::new();
        conn_req.extend_from_slice(&0x0001u16.to_le_bytes()).unwrap();
        conn_req.extend_from_slice(&0x0040u16.to_le_bytes()).unwrap();
        net.hci_acl(
            hci_dev,
            &acl_packet(handle, &l2cap_pdu(1, &signalling(0x02, 1, &conn_req))),
        )
        .unwrap();
        let responses = drain_acl(&mut net, hci_dev);
        let dcid = u16::from_le_bytes([responses[0][12], responses[0][13]]);

        // Offer an MTU below what the SDP service tolerates.
        let mut conf_req: Vec<u8, 16> = Vec::new();
        conf_req.extend_from_slice(&dcid.to_le_bytes()).unwrap();
        conf_req.extend_from_slice(&[0x00, 0x00]).unwrap();
        conf_req.extend_from_slice(&[0x01, 0x02, 0x14, 0x00]).unwrap(); // MTU 20
        net.hci_acl(
            hci_dev,
            &acl_packet(handle, &l2cap_pdu(1, &signalling(0x04, 2, &conf_req))),
        )
        .unwrap();
        let responses = drain_acl(&mut net, hci_dev);
        assert_eq!(responses[0][8], 0x05);
        let result = u16::from_le_bytes([responses[0][16], responses[0][17]]);
        assert_eq!(result, 0x0001); // unacceptable, corrected value attached
        let corrected = u16::from_le_bytes([responses[0][20], responses[0][21]]);
        assert!(corrected >= 48);

        // Retrying with the corrected value succeeds; that is the native
        // renegotiation loop of the protocol.
        let mut retry: Vec<u8, 16> = Vec::new();
        retry.extend_from_slice(&dcid.to_le_bytes()).unwrap();
        retry.extend_from_slice(&[0x00, 0x00]).unwrap();
        retry.extend_from_slice(&[0x01, 0x02]).unwrap();
        retry.extend_from_slice(&corrected.to_le_bytes()).unwrap();
        net.hci_acl(
            hci_dev,
            &acl_packet(handle, &l2cap_pdu(1, &signalling(0x04, 3, &retry))),
        )
        .unwrap();
        let responses = drain_acl(&mut net, hci_dev);
        let result = u16::from_le_bytes([responses[0][16], responses[0][17]]);
        assert_eq!(result, 0x0000);
    }

    #[test]
    fn test_disconnection_is_idempotent() {
        let mut net = Scatternet::new();
        let hci_dev = net.add_controller().unwrap();
        let peer = net.add_peer(DeviceOptions::default()).unwrap();
        let handle = connect(&mut net, hci_dev, peer);
        let dcid = open_channel(&mut net, hci_dev, handle, 0x0001, 0x0040);

        let mut disc: Vec<u8, 8> = Vec::new();
        disc.extend_from_slice(&dcid.to_le_bytes()).unwrap();
        disc.extend_from_slice(&0x0040u16.to_le_bytes()).unwrap();

        for ident in [7u8, 8u8] {
            net.hci_acl(
                hci_dev,
                &acl_packet(handle, &l2cap_pdu(1, &signalling(0x06, ident, &disc))),
            )
            .unwrap();
            let responses = drain_acl(&mut net, hci_dev);
            assert_eq!(responses.len(), 1);
            assert_eq!(responses[0][8], 0x07); // Disconnection Response
            assert_eq!(responses[0][9], ident);
        }
    }

    #[test]
    fn test_echo_and_information_requests() {
        let mut net = Scatternet::new();
        let hci_dev = net.add_controller().unwrap();
        let peer = net.add_peer(DeviceOptions::default()).unwrap();
        let handle = connect(&mut net, hci_dev, peer);

        net.hci_acl(
            hci_dev,
            &acl_packet(handle, &l2cap_pdu(1, &signalling(0x08, 5, b"ping"))),
        )
        .unwrap();
        let responses = drain_acl(&mut net, hci_dev);
        assert_eq!(responses[0][8], 0x09); // Echo Response
        assert_eq!(&responses[0][12..16], b"ping");

        // Feature mask: flow control and retransmission.
        net.hci_acl(
            hci_dev,
            &acl_packet(handle, &l2cap_pdu(1, &signalling(0x0A, 6, &[0x02, 0x00]))),
        )
        .unwrap();
        let responses = drain_acl(&mut net, hci_dev);
        assert_eq!(responses[0][8], 0x0B);
        assert_eq!(
            u16::from_le_bytes([responses[0][14], responses[0][15]]),
            0x0000 // success
        );
        assert_eq!(responses[0][16], 0x03);
    }

    #[test]
    fn test_malformed_signalling_rejected() {
        let mut net = Scatternet::new();
        let hci_dev = net.add_controller().unwrap();
        let peer = net.add_peer(DeviceOptions::default()).unwrap();
        let handle = connect(&mut net, hci_dev, peer);

        // A Connection Request with a truncated payload.
        net.hci_acl(
            hci_dev,
            &acl_packet(handle, &l2cap_pdu(1, &signalling(0x02, 9, &[0x01, 0x00]))),
        )
        .unwrap();
        let responses = drain_acl(&mut net, hci_dev);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0][8], 0x01); // Command Reject
        assert_eq!(responses[0][9], 9);
        assert_eq!(
            u16::from_le_bytes([responses[0][12], responses[0][13]]),
            0x0000 // command not understood
        );
    }

    #[test]
    fn test_loopback_service_roundtrip() {
        let mut net = Scatternet::new();
        let hci_dev = net.add_controller().unwrap();
        let peer = net.add_peer(DeviceOptions::default()).unwrap();
        net.register_psm(peer, 0x1001, 48, PsmService::Loopback).unwrap();
        // Re-binding the same PSM is a configuration error.
        assert_eq!(
            net.register_psm(peer, 0x1001, 48, PsmService::Loopback),
            Err(BluetoothError::DuplicatePsm)
        );

        let handle = connect(&mut net, hci_dev, peer);
        let dcid = open_channel(&mut net, hci_dev, handle, 0x1001, 0x0050);

        net.hci_acl(hci_dev, &acl_packet(handle, &l2cap_pdu(dcid, b"mock")))
            .unwrap();
        let responses = drain_acl(&mut net, hci_dev);
        assert_eq!(responses.len(), 1);
        assert_eq!(u16::from_le_bytes([responses[0][6], responses[0][7]]), 0x0050);
        assert_eq!(&responses[0][8..12], b"mock");
    }

    #[test]
    fn test_retransmission_mode_iframe_reassembly() {
        let mut net = Scatternet::new();
        let hci_dev = net.add_controller().unwrap();
        let peer = net.add_peer(DeviceOptions::default()).unwrap();
        net.register_psm(peer, 0x1003, 48, PsmService::Loopback).unwrap();
        let handle = connect(&mut net, hci_dev, peer);

        // Open a channel and negotiate Retransmission mode via RFC option.
        let mut conn_req: Vec<u8, 8> = Vec::new();
        conn_req.extend_from_slice(&0x1003u16.to_le_bytes()).unwrap();
        conn_req.extend_from_slice(&0x0060u16.to_le_bytes()).unwrap();
        net.hci_acl(
            hci_dev,
            &acl_packet(handle, &l2cap_pdu(1, &signalling(0x02, 1, &conn_req))),
        )
        .unwrap();
        let responses = drain_acl(&mut net, hci_dev);
        let dcid = u16::from_le_bytes([responses[0][12], responses[0][13]]);
        let peer_config_id = responses[1][9];

        let mut conf_req: Vec<u8, 24> = Vec::new();
        conf_req.extend_from_slice(&dcid.to_le_bytes()).unwrap();
        conf_req.extend_from_slice(&[0x00, 0x00]).unwrap();
        // RFC: retransmission mode, window 8, max transmit 3, timeouts
        // 1000 ms, MPS 672.
        conf_req.extend_from_slice(&[0x04, 0x09, 0x01, 0x08, 0x03]).unwrap();
        conf_req.extend_from_slice(&1000u16.to_le_bytes()).unwrap();
        conf_req.extend_from_slice(&1000u16.to_le_bytes()).unwrap();
        conf_req.extend_from_slice(&672u16.to_le_bytes()).unwrap();
        net.hci_acl(
            hci_dev,
            &acl_packet(handle, &l2cap_pdu(1, &signalling(0x04, 2, &conf_req))),
        )
        .unwrap();
        let responses = drain_acl(&mut net, hci_dev);
        assert_eq!(
            u16::from_le_bytes([responses[0][16], responses[0][17]]),
            0x0000,
            "retransmission mode refused"
        );

        let mut conf_rsp: Vec<u8, 8> = Vec::new();
        conf_rsp.extend_from_slice(&dcid.to_le_bytes()).unwrap();
        conf_rsp.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]).unwrap();
        net.hci_acl(
            hci_dev,
            &acl_packet(
                handle,
                &l2cap_pdu(1, &signalling(0x05, peer_config_id, &conf_rsp)),
            ),
        )
        .unwrap();

        // An I-frame with a payload, its FCS computed over header plus body.
        let iframe = |cid: u16, control: [u8; 2], body: &[u8]| -> Vec<u8, 64> {
            let mut payload: Vec<u8, 64> = Vec::new();
            payload.extend_from_slice(&control).unwrap();
            payload.extend_from_slice(body).unwrap();
            let mut frame: Vec<u8, 64> = Vec::new();
            frame
                .extend_from_slice(&((payload.len() + 2) as u16).to_le_bytes())
                .unwrap();
            frame.extend_from_slice(&cid.to_le_bytes()).unwrap();
            frame.extend_from_slice(&payload).unwrap();
            let fcs = l2cap::packet::fcs16(&frame);
            frame.extend_from_slice(&fcs.to_le_bytes()).unwrap();
            frame
        };

        // "hello" split across a start and an end segment.
        let mut start_body: Vec<u8, 8> = Vec::new();
        start_body.extend_from_slice(&5u16.to_le_bytes()).unwrap();
        start_body.extend_from_slice(b"hel").unwrap();
        net.hci_acl(
            hci_dev,
            &acl_packet(handle, &iframe(dcid, [0x00, 0x40], &start_body)),
        )
        .unwrap();
        assert!(drain_acl(&mut net, hci_dev).is_empty());

        net.hci_acl(hci_dev, &acl_packet(handle, &iframe(dcid, [0x00, 0x80], b"lo")))
            .unwrap();

        // The loopback service echoes the reassembled SDU; the engine only
        // ever transmits Basic-mode frames, even on this channel.
        let responses = drain_acl(&mut net, hci_dev);
        assert_eq!(responses.len(), 1);
        assert_eq!(u16::from_le_bytes([responses[0][6], responses[0][7]]), 0x0060);
        assert_eq!(&responses[0][8..13], b"hello");
    }

    #[test]
    fn test_iframe_with_bad_fcs_dropped() {
        let mut net = Scatternet::new();
        let hci_dev = net.add_controller().unwrap();
        let peer = net.add_peer(DeviceOptions::default()).unwrap();
        net.register_psm(peer, 0x1003, 48, PsmService::Loopback).unwrap();
        let handle = connect(&mut net, hci_dev, peer);
        let dcid = open_channel(&mut net, hci_dev, handle, 0x1003, 0x0060);

        // Flip the channel into retransmission mode.
        let mut conf_req: Vec<u8, 24> = Vec::new();
        conf_req.extend_from_slice(&dcid.to_le_bytes()).unwrap();
        conf_req.extend_from_slice(&[0x00, 0x00]).unwrap();
        conf_req.extend_from_slice(&[0x04, 0x09, 0x01, 0x08, 0x03]).unwrap();
        conf_req.extend_from_slice(&1000u16.to_le_bytes()).unwrap();
        conf_req.extend_from_slice(&1000u16.to_le_bytes()).unwrap();
        conf_req.extend_from_slice(&672u16.to_le_bytes()).unwrap();
        net.hci_acl(
            hci_dev,
            &acl_packet(handle, &l2cap_pdu(1, &signalling(0x04, 9, &conf_req))),
        )
        .unwrap();
        drain_acl(&mut net, hci_dev);

        // An unsegmented I-frame with a corrupted FCS is dropped silently.
        let mut frame: Vec<u8, 32> = Vec::new();
        frame.extend_from_slice(&9u16.to_le_bytes()).unwrap();
        frame.extend_from_slice(&dcid.to_le_bytes()).unwrap();
        frame.extend_from_slice(&[0x00, 0x00]).unwrap();
        frame.extend_from_slice(b"hello").unwrap();
        frame.extend_from_slice(&[0xDE, 0xAD]).unwrap();
        net.hci_acl(hci_dev, &acl_packet(handle, &frame)).unwrap();
        assert!(drain_acl(&mut net, hci_dev).is_empty());
    }

    #[test]
    fn test_acl_on_bad_handle_dropped() {
        let mut net = Scatternet::new();
        let hci_dev = net.add_controller().unwrap();

        net.hci_acl(hci_dev, &acl_packet(0x0021, &[0x00])).unwrap();
        assert!(drain_events(&mut net, hci_dev).is_empty());
        assert!(drain_acl(&mut net, hci_dev).is_empty());
    }

    #[test]
    fn test_acl_data_flow_control_event() {
        let mut net = Scatternet::new();
        let hci_dev = net.add_controller().unwrap();
        let peer = net.add_peer(DeviceOptions::default()).unwrap();
        let handle = connect(&mut net, hci_dev, peer);

        // An incomplete L2CAP fragment: consumed, acknowledged, no reply.
        net.hci_acl(hci_dev, &acl_packet(handle, &[0x10, 0x00]))
            .unwrap();
        let events = drain_events(&mut net, hci_dev);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0][0], 0x13); // Number Of Completed Packets
        assert_eq!(u16::from_le_bytes([events[0][3], events[0][4]]), handle);
        assert_eq!(u16::from_le_bytes([events[0][5], events[0][6]]), 1);
    }

    #[test]
    fn test_remote_name_request() {
        let mut net = Scatternet::new();
        let hci_dev = net.add_controller().unwrap();
        let peer = net
            .add_peer(DeviceOptions {
                name: "warbler",
                ..DeviceOptions::default()
            })
            .unwrap();
        let peer_addr = net.device_info(peer).unwrap().bd_addr;

        let mut params: Vec<u8, 16> = Vec::new();
        params.extend_from_slice(peer_addr.as_bytes()).unwrap();
        params.extend_from_slice(&[0x01, 0x00, 0x00, 0x00]).unwrap();
        net.hci_command(hci_dev, &command(cmd::REMOTE_NAME_REQUEST, &params))
            .unwrap();

        let events = drain_events(&mut net, hci_dev);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1][0], 0x07);
        assert_eq!(&events[1][3..9], peer_addr.as_bytes());
        assert_eq!(&events[1][9..16], b"warbler");
        assert_eq!(events[1][16], 0);
    }

    #[test]
    fn test_controller_removal_disconnects_links() {
        let mut net = Scatternet::new();
        let hci_a = net.add_controller().unwrap();
        let hci_b = net.add_controller().unwrap();

        net.hci_command(hci_b, &command(cmd::WRITE_SCAN_ENABLE, &[0x03]))
            .unwrap();
        drain_events(&mut net, hci_b);

        let b_addr = net.device_info(hci_b).unwrap().bd_addr;
        let mut params: Vec<u8, 16> = Vec::new();
        params.extend_from_slice(b_addr.as_bytes()).unwrap();
        params.extend_from_slice(&0xCC18u16.to_le_bytes()).unwrap();
        params.extend_from_slice(&[0x01, 0x00, 0x00, 0x00, 0x01]).unwrap();
        net.hci_command(hci_a, &command(cmd::CREATE_CONNECTION, &params))
            .unwrap();
        drain_events(&mut net, hci_a);

        let mut accept: Vec<u8, 8> = Vec::new();
        accept
            .extend_from_slice(net.device_info(hci_a).unwrap().bd_addr.as_bytes())
            .unwrap();
        accept.push(0x01).unwrap();
        net.hci_command(hci_b, &command(cmd::ACCEPT_CONNECTION_REQUEST, &accept))
            .unwrap();
        drain_events(&mut net, hci_b);
        let events = drain_events(&mut net, hci_a);
        assert!(events.iter().any(|e| e[0] == 0x03 && e[2] == 0x00));

        // Powering A off walks its handle table and disconnects B cleanly.
        net.remove_device(hci_a).unwrap();
        let events = drain_events(&mut net, hci_b);
        assert!(events.iter().any(|e| e[0] == 0x05 && e[5] == 0x15));
    }
}
