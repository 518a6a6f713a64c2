//! Emulated HCI Controller
//!
//! The controller side of the Host Controller Interface: commands and ACL
//! data arrive from a host transport, events and ACL data flow back, and the
//! link manager drives inquiry, paging, connection lifecycle and ACL mode
//! changes against the other devices of the owning scatternet.
//!
//! Everything is synchronous and run-to-completion; the only re-entry points
//! besides packets are the scatternet timers (inquiry windows, mode expiry).

pub mod command;
pub mod event;
pub mod opcode;
pub mod status;

pub use status::Status;

use crate::{
    BluetoothAddress, ClassOfDevice,
    clock::Duration,
    constants::{
        ACL_PACKET_SIZE, ACL_QUEUE_DEPTH, DEFAULT_CONN_ACCEPT_TIMEOUT, DEFAULT_RSSI_DBM,
        EVENT_PACKET_SIZE, EVENT_QUEUE_DEPTH, HCI_HANDLE_OFFSET, MAX_AWAITING_CONNECTIONS,
        MAX_EVENT_PARAMS, MAX_HCI_HANDLES,
    },
    device::{AclMode, Device, DeviceId, LinkKey, LinkRole, LmpSignal, Scatternet, TimerKind},
};
use heapless::{Deque, String, Vec};

/// A complete controller-to-host event packet
pub type EventPacket = Vec<u8, EVENT_PACKET_SIZE>;

/// A complete controller-to-host ACL data packet
pub type AclPacket = Vec<u8, ACL_PACKET_SIZE>;

/// ACL packet boundary flag: continuing fragment
const ACL_CONT: u16 = 0x01;
/// ACL packet boundary flag: first fragment of a PDU
const ACL_START: u16 = 0x02;
/// ACL broadcast flags: active slave broadcast
const ACL_ACTIVE_BCAST: u16 = 0x04;
/// ACL broadcast flags: parked slave broadcast
const ACL_PICO_BCAST: u16 = 0x08;

/// Supported-commands bitmask returned by Read Local Supported Commands
///
/// Kept in sync with the dispatcher below.
const LOCAL_SUPPORTED_COMMANDS: [u8; 64] = [
    0xBF, 0x80, 0xF9, 0x03, 0xB2, 0xC0, 0x03, 0xC3, //
    0x00, 0x0F, 0x80, 0x00, 0xC0, 0x00, 0xE8, 0x13, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Extended features page 0
const LOCAL_EXT_FEATURES_PAGE0: [u8; 8] = [0x5F, 0x35, 0x85, 0x7E, 0x9B, 0x19, 0x00, 0x80];

/// One allocated entry of the connection handle table
#[derive(Debug, Clone, Copy)]
struct HandleEntry {
    key: LinkKey,
    role: LinkRole,
    mode: AclMode,
    interval: u16,
}

/// Link manager state of one controller
#[derive(Debug)]
struct LinkManager {
    inquiry_active: bool,
    periodic: bool,
    responses_left: u32,
    responses: u32,
    inquiry_length: u8,
    inquiry_period: u16,
    inquiry_mode: u8,
    handles: [Option<HandleEntry>; MAX_HCI_HANDLES],
    last_handle: usize,
    awaiting: Vec<BluetoothAddress, MAX_AWAITING_CONNECTIONS>,
}

impl LinkManager {
    fn new() -> Self {
        Self {
            inquiry_active: false,
            periodic: false,
            responses_left: 0,
            responses: 0,
            inquiry_length: 0,
            inquiry_period: 0,
            inquiry_mode: 0,
            handles: [None; MAX_HCI_HANDLES],
            last_handle: 0,
            awaiting: Vec::new(),
        }
    }
}

/// One emulated HCI controller
#[derive(Debug)]
pub struct HciController {
    device: Device,
    events: Deque<EventPacket, EVENT_QUEUE_DEPTH>,
    acl_out: Deque<AclPacket, ACL_QUEUE_DEPTH>,
    last_cmd: u16,
    conn_req_host: Option<DeviceId>,
    lm: LinkManager,
    event_mask: [u8; 8],
    voice_setting: u16,
    conn_accept_timeout: u16,
    asb_handle: u16,
    psb_handle: u16,
}

impl HciController {
    pub(crate) fn new(mut device: Device) -> Self {
        // A controller boots with scanning off and no name until the host
        // configures it.
        device.inquiry_scan = false;
        device.page_scan = false;
        device.name = None;
        device.class_of_device = ClassOfDevice::UNSPECIFIED;

        let mut controller = Self {
            device,
            events: Deque::new(),
            acl_out: Deque::new(),
            last_cmd: 0,
            conn_req_host: None,
            lm: LinkManager::new(),
            event_mask: [0; 8],
            voice_setting: 0,
            conn_accept_timeout: DEFAULT_CONN_ACCEPT_TIMEOUT,
            asb_handle: 0,
            psb_handle: 0,
        };
        controller.reset_state();
        controller
    }

    /// Shared device state
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Shared device state, mutable
    pub fn device_mut(&mut self) -> &mut Device {
        &mut self.device
    }

    /// Reinitialize the host-visible configuration
    ///
    /// Idempotent; live links survive a reset, matching the reference
    /// behaviour.
    pub fn reset(&mut self, net: &mut Scatternet) {
        self.reset_state();
        self.lm.inquiry_active = false;
        self.lm.periodic = false;
        net.cancel_timer(self.device.id, TimerKind::InquiryDone);
        net.cancel_timer(self.device.id, TimerKind::InquiryNext);
        net.cancel_timer(self.device.id, TimerKind::ConnAcceptTimeout);
    }

    fn reset_state(&mut self) {
        self.lm.awaiting.clear();
        self.event_mask = [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x1F, 0x00, 0x00];
        self.device.inquiry_scan = false;
        self.device.page_scan = false;
        self.device.name = None;
        self.device.class_of_device = ClassOfDevice::UNSPECIFIED;
        self.voice_setting = 0x0000;
        self.conn_accept_timeout = DEFAULT_CONN_ACCEPT_TIMEOUT;
        self.lm.inquiry_mode = 0x00;
        self.psb_handle = 0x000;
        self.asb_handle = 0x000;
    }

    pub(crate) fn pop_event(&mut self) -> Option<EventPacket> {
        self.events.pop_front()
    }

    pub(crate) fn pop_acl(&mut self) -> Option<AclPacket> {
        self.acl_out.pop_front()
    }

    // ------------------------------------------------------------------
    // Event emission

    fn emit(&mut self, code: u8, params: &[u8]) {
        if params.len() > MAX_EVENT_PARAMS {
            defmt::error!("[HCI] event {:02x} params too long ({})", code, params.len());
            return;
        }

        let byte = usize::from((code - 1) >> 3);
        let bit = 1u8 << ((code - 1) & 7);
        if bit & event::RESERVED_EVENT_MASK[byte] & !self.event_mask[byte] != 0 {
            return;
        }

        let mut packet = EventPacket::new();
        packet.push(code).ok();
        packet.push(params.len() as u8).ok();
        packet.extend_from_slice(params).ok();
        if self.events.push_back(packet).is_err() {
            defmt::error!("[HCI] event queue full, dropping event {:02x}", code);
        }
    }

    fn command_status(&mut self, status: Status) {
        let params = event::CommandStatus {
            status,
            num_cmd: 1,
            opcode: self.last_cmd,
        }
        .to_bytes();
        self.emit(event::code::COMMAND_STATUS, &params);
    }

    fn command_complete(&mut self, ret: &[u8]) {
        let mut params = Vec::<u8, MAX_EVENT_PARAMS>::new();
        params.push(1).ok(); // num_cmd
        params.extend_from_slice(&self.last_cmd.to_le_bytes()).ok();
        if params.extend_from_slice(ret).is_err() {
            defmt::error!("[HCI] command return parameters too long");
            return;
        }
        self.emit(event::code::COMMAND_COMPLETE, &params);
    }

    fn command_complete_status(&mut self, status: Status) {
        self.command_complete(&[status.to_u8()]);
    }

    fn short_command(&mut self, length: usize) {
        defmt::warn!("[HCI] command packet too short ({}B)", length);
        self.command_status(Status::InvalidParameters);
    }

    // ------------------------------------------------------------------
    // Handle table

    fn handle_index(&self, handle: u16) -> Option<usize> {
        if handle & HCI_HANDLE_OFFSET == 0 || handle >= (HCI_HANDLE_OFFSET | MAX_HCI_HANDLES as u16)
        {
            return None;
        }
        let index = usize::from(handle & !HCI_HANDLE_OFFSET);
        self.lm.handles[index].map(|_| index)
    }

    fn alloc_handle(&mut self) -> Option<usize> {
        for step in 1..=MAX_HCI_HANDLES {
            let index = (self.lm.last_handle + step) % MAX_HCI_HANDLES;
            let handle = HCI_HANDLE_OFFSET | index as u16;
            if self.lm.handles[index].is_none()
                && handle != self.asb_handle
                && handle != self.psb_handle
            {
                self.lm.last_handle = index;
                return Some(index);
            }
        }
        None
    }

    fn teardown_link(&mut self, net: &mut Scatternet, index: usize) {
        if let Some(entry) = self.lm.handles[index].take() {
            if entry.role == LinkRole::Central {
                let handle = HCI_HANDLE_OFFSET | index as u16;
                net.cancel_timer(self.device.id, TimerKind::AclModeExpiry { handle });
            }
        }
    }

    fn take_awaiting(&mut self, bd_addr: BluetoothAddress) -> bool {
        if let Some(pos) = self.lm.awaiting.iter().position(|a| *a == bd_addr) {
            self.lm.awaiting.swap_remove(pos);
            true
        } else {
            false
        }
    }

    // ------------------------------------------------------------------
    // Inquiry

    fn inquiry_result(&mut self, peer: &Device) {
        if !peer.inquiry_scan || self.lm.responses_left == 0 {
            return;
        }

        self.lm.responses_left -= 1;
        self.lm.responses += 1;

        let result = event::InquiryResult {
            bd_addr: peer.bd_addr,
            dev_class: peer.class_of_device.to_bytes(),
            clock_offset: peer.clock_offset,
        };
        match self.lm.inquiry_mode {
            0x00 => self.emit(event::code::INQUIRY_RESULT, &result.to_bytes()),
            0x01 => self.emit(
                event::code::INQUIRY_RESULT_WITH_RSSI,
                &result.to_bytes_with_rssi(DEFAULT_RSSI_DBM),
            ),
            mode => defmt::error!("[HCI] bad inquiry mode {:02x}", mode),
        }
    }

    fn inquiry_start(&mut self, net: &mut Scatternet, length: u8) {
        self.lm.inquiry_length = length;
        for id in 0..net.capacity() {
            // Our own slot is absent while we run, so this walks the others.
            let Some(peer) = net.device_info(id) else {
                continue;
            };
            self.inquiry_result(peer);
        }

        if self.lm.responses_left > 0 {
            net.set_timer(
                self.device.id,
                TimerKind::InquiryDone,
                net.now() + Duration::from_inquiry_units(u16::from(length)),
            );
        } else {
            self.inquiry_done();
        }

        if self.lm.periodic {
            net.set_timer(
                self.device.id,
                TimerKind::InquiryNext,
                net.now() + Duration::from_inquiry_units(self.lm.inquiry_period),
            );
        }
    }

    fn inquiry_done(&mut self) {
        if !self.lm.periodic {
            self.lm.inquiry_active = false;
        }
        self.emit(event::code::INQUIRY_COMPLETE, &[Status::Success.to_u8()]);
    }

    fn inquiry_next(&mut self, net: &mut Scatternet) {
        self.lm.responses_left = self.lm.responses_left.saturating_add(self.lm.responses);
        self.lm.responses = 0;
        self.inquiry_start(net, self.lm.inquiry_length);
    }

    // ------------------------------------------------------------------
    // Connection lifecycle

    fn connect(&mut self, net: &mut Scatternet, bd_addr: BluetoothAddress) -> Result<(), ()> {
        let target = net.find_page_scan(bd_addr).ok_or(())?;

        self.lm.awaiting.push(bd_addr).map_err(|_| ())?;
        let key = LinkKey {
            central: self.device.id,
            peripheral: target,
        };
        // Always last: the peer's answer must find our bookkeeping done.
        net.send_signal(target, LmpSignal::ConnectionRequest { key });
        Ok(())
    }

    fn connection_reject_event(&mut self, bd_addr: BluetoothAddress) {
        let params = event::ConnectionComplete {
            status: Status::NoConnection,
            handle: 0,
            bd_addr,
        }
        .to_bytes();
        self.emit(event::code::CONNECTION_COMPLETE, &params);
    }

    fn connection_accept(&mut self, net: &mut Scatternet, host: DeviceId) {
        let Some(host_addr) = net.device_info(host).map(|d| d.bd_addr) else {
            defmt::warn!("[HCI] accepting connection from vanished device {}", host);
            return;
        };
        let key = LinkKey {
            central: host,
            peripheral: self.device.id,
        };

        match self.alloc_handle() {
            Some(index) => {
                self.lm.handles[index] = Some(HandleEntry {
                    key,
                    role: LinkRole::Peripheral,
                    mode: AclMode::Active,
                    interval: 0,
                });
                let handle = HCI_HANDLE_OFFSET | index as u16;
                let params = event::ConnectionComplete {
                    status: Status::Success,
                    handle,
                    bd_addr: host_addr,
                }
                .to_bytes();
                self.emit(event::code::CONNECTION_COMPLETE, &params);
                // Sequenced last: the central's completion handling may
                // immediately disconnect us again.
                net.send_signal(host, LmpSignal::ConnectionComplete { key, status: 0 });
            }
            None => {
                net.send_signal(
                    host,
                    LmpSignal::ConnectionComplete {
                        key,
                        status: Status::RejectedLimitedResources.to_u8(),
                    },
                );
                let params = event::ConnectionComplete {
                    status: Status::NoConnection,
                    handle: 0,
                    bd_addr: host_addr,
                }
                .to_bytes();
                self.emit(event::code::CONNECTION_COMPLETE, &params);
            }
        }
    }

    fn lmp_connection_request(&mut self, net: &mut Scatternet, key: LinkKey) {
        if self.conn_req_host.is_some() {
            // One pending inbound request at a time.
            net.send_signal(
                key.central,
                LmpSignal::ConnectionComplete {
                    key,
                    status: Status::RejectedLimitedResources.to_u8(),
                },
            );
            return;
        }
        let Some(host) = net.device_info(key.central) else {
            return;
        };
        let params = event::ConnectionRequest {
            bd_addr: host.bd_addr,
            dev_class: host.class_of_device.to_bytes(),
        }
        .to_bytes();
        self.conn_req_host = Some(key.central);
        net.set_timer(
            self.device.id,
            TimerKind::ConnAcceptTimeout,
            net.now() + Duration::from_slots(self.conn_accept_timeout),
        );
        self.emit(event::code::CONNECTION_REQUEST, &params);
    }

    fn lmp_connection_complete(&mut self, net: &mut Scatternet, key: LinkKey, status: u8) {
        let Some(peer_addr) = net.device_info(key.peripheral).map(|d| d.bd_addr) else {
            defmt::warn!("[HCI] connection complete from vanished device");
            return;
        };

        if !self.take_awaiting(peer_addr) {
            // Cancelled locally in the meantime; converge with the peer by
            // detaching the link it may have set up.
            if status == 0 {
                net.send_signal(
                    key.peripheral,
                    LmpSignal::DisconnectPeripheral {
                        key,
                        reason: Status::RemoteUserTerminated.to_u8(),
                    },
                );
            }
            self.connection_reject_event(peer_addr);
            return;
        }

        if status != 0 {
            let mut params = event::ConnectionComplete {
                status: Status::NoConnection,
                handle: 0,
                bd_addr: peer_addr,
            }
            .to_bytes();
            params[0] = status;
            self.emit(event::code::CONNECTION_COMPLETE, &params);
            return;
        }

        match self.alloc_handle() {
            Some(index) => {
                self.lm.handles[index] = Some(HandleEntry {
                    key,
                    role: LinkRole::Central,
                    mode: AclMode::Active,
                    interval: 0,
                });
                let handle = HCI_HANDLE_OFFSET | index as u16;
                let params = event::ConnectionComplete {
                    status: Status::Success,
                    handle,
                    bd_addr: peer_addr,
                }
                .to_bytes();
                self.emit(event::code::CONNECTION_COMPLETE, &params);
            }
            None => {
                net.send_signal(
                    key.peripheral,
                    LmpSignal::DisconnectPeripheral {
                        key,
                        reason: Status::RejectedLimitedResources.to_u8(),
                    },
                );
                self.connection_reject_event(peer_addr);
            }
        }
    }

    fn disconnect(&mut self, net: &mut Scatternet, handle: u16, reason: u8) {
        let index = usize::from(handle & !HCI_HANDLE_OFFSET);
        let Some(entry) = self.lm.handles[index] else {
            return;
        };

        let signal = match entry.role {
            LinkRole::Central => LmpSignal::DisconnectPeripheral {
                key: entry.key,
                reason,
            },
            LinkRole::Peripheral => LmpSignal::DisconnectCentral {
                key: entry.key,
                reason,
            },
        };
        net.send_signal(entry.key.peer_of(self.device.id), signal);

        self.teardown_link(net, index);

        let params = event::DisconnectionComplete {
            status: Status::Success,
            handle,
            reason: Status::ConnectionTerminated.to_u8(),
        }
        .to_bytes();
        self.emit(event::code::DISCONNECTION_COMPLETE, &params);
    }

    fn lmp_disconnect(&mut self, net: &mut Scatternet, key: LinkKey, reason: u8) {
        let Some(index) = self
            .lm
            .handles
            .iter()
            .position(|entry| entry.is_some_and(|e| e.key == key))
        else {
            defmt::warn!("[HCI] disconnect for unknown link");
            return;
        };

        self.teardown_link(net, index);

        let params = event::DisconnectionComplete {
            status: Status::Success,
            handle: HCI_HANDLE_OFFSET | index as u16,
            reason,
        }
        .to_bytes();
        self.emit(event::code::DISCONNECTION_COMPLETE, &params);
    }

    // ------------------------------------------------------------------
    // ACL mode changes

    fn mode_change(
        &mut self,
        net: &mut Scatternet,
        handle: u16,
        interval: u16,
        mode: AclMode,
    ) -> Result<(), ()> {
        let index = self.handle_index(handle).ok_or(())?;
        let entry = self.lm.handles[index].ok_or(())?;
        if entry.role != LinkRole::Central {
            return Err(());
        }

        if entry.mode != AclMode::Active {
            self.command_status(Status::CommandDisallowed);
            return Ok(());
        }

        self.command_status(Status::Success);
        net.set_timer(
            self.device.id,
            TimerKind::AclModeExpiry { handle },
            net.now() + Duration::from_slots(interval),
        );
        self.apply_mode(net, index, mode, interval);
        Ok(())
    }

    fn mode_cancel(&mut self, net: &mut Scatternet, handle: u16, mode: AclMode) -> Result<(), ()> {
        let index = self.handle_index(handle).ok_or(())?;
        let entry = self.lm.handles[index].ok_or(())?;
        if entry.role != LinkRole::Central {
            return Err(());
        }

        if entry.mode != mode {
            self.command_status(Status::CommandDisallowed);
            return Ok(());
        }

        self.command_status(Status::Success);
        net.cancel_timer(self.device.id, TimerKind::AclModeExpiry { handle });
        self.apply_mode(net, index, AclMode::Active, 0);
        Ok(())
    }

    fn apply_mode(&mut self, net: &mut Scatternet, index: usize, mode: AclMode, interval: u16) {
        let Some(entry) = self.lm.handles[index].as_mut() else {
            return;
        };
        entry.mode = mode;
        entry.interval = interval;
        let key = entry.key;

        let handle = HCI_HANDLE_OFFSET | index as u16;
        let params = event::ModeChange {
            handle,
            mode: mode as u8,
            interval,
        }
        .to_bytes();
        self.emit(event::code::MODE_CHANGE, &params);

        net.send_signal(
            key.peer_of(self.device.id),
            LmpSignal::ModeChange {
                key,
                mode,
                interval,
            },
        );
    }

    fn lmp_mode_change(&mut self, key: LinkKey, mode: AclMode, interval: u16) {
        let Some(index) = self
            .lm
            .handles
            .iter()
            .position(|entry| entry.is_some_and(|e| e.key == key))
        else {
            return;
        };
        if let Some(entry) = self.lm.handles[index].as_mut() {
            entry.mode = mode;
            entry.interval = interval;
        }

        let params = event::ModeChange {
            handle: HCI_HANDLE_OFFSET | index as u16,
            mode: mode as u8,
            interval,
        }
        .to_bytes();
        self.emit(event::code::MODE_CHANGE, &params);
    }

    // ------------------------------------------------------------------
    // Remote queries

    fn remote_device(&self, handle: u16) -> Option<DeviceId> {
        let index = self.handle_index(handle)?;
        let entry = self.lm.handles[index]?;
        Some(entry.key.peer_of(self.device.id))
    }

    fn name_request(&mut self, net: &Scatternet, bd_addr: BluetoothAddress) -> Result<(), ()> {
        let target = net.find_page_scan(bd_addr).ok_or(())?;
        let peer = net.device_info(target).ok_or(())?;
        let name = peer.name.clone();
        let peer_addr = peer.bd_addr;

        self.command_status(Status::Success);
        let params =
            event::RemoteNameRequestComplete { bd_addr: peer_addr }.to_bytes(name.as_deref());
        self.emit(event::code::REMOTE_NAME_REQUEST_COMPLETE, &params);
        Ok(())
    }

    fn features_request(&mut self, net: &Scatternet, handle: u16) -> Result<(), ()> {
        let peer = self.remote_device(handle).ok_or(())?;
        let features = net.device_info(peer).ok_or(())?.lmp_features;

        self.command_status(Status::Success);
        let params = event::ReadRemoteFeaturesComplete { handle, features }.to_bytes();
        self.emit(event::code::READ_REMOTE_FEATURES_COMPLETE, &params);
        Ok(())
    }

    fn version_request(&mut self, handle: u16) -> Result<(), ()> {
        self.remote_device(handle).ok_or(())?;

        self.command_status(Status::Success);
        let params = event::ReadRemoteVersionComplete { handle }.to_bytes();
        self.emit(event::code::READ_REMOTE_VERSION_COMPLETE, &params);
        Ok(())
    }

    fn clock_offset_request(&mut self, net: &Scatternet, handle: u16) -> Result<(), ()> {
        let peer = self.remote_device(handle).ok_or(())?;
        let clock_offset = net.device_info(peer).ok_or(())?.clock_offset;

        self.command_status(Status::Success);
        let params = event::ReadClockOffsetComplete {
            handle,
            clock_offset,
        }
        .to_bytes();
        self.emit(event::code::READ_CLOCK_OFFSET_COMPLETE, &params);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Packet entry points

    pub(crate) fn submit_command(&mut self, net: &mut Scatternet, packet: &[u8]) {
        let Some(header) = command::CommandHeader::from_bytes(packet) else {
            self.short_command(packet.len());
            return;
        };
        self.last_cmd = header.opcode;

        if opcode::ogf(header.opcode) == 0 || opcode::ocf(header.opcode) == 0 {
            // NOP probe, no response.
            return;
        }

        let params = &packet[command::CommandHeader::SIZE..];
        if usize::from(header.param_len) > params.len() {
            defmt::warn!(
                "[HCI] declared parameter length {} exceeds packet",
                header.param_len
            );
            return;
        }

        self.execute(net, header.opcode, params);
    }

    #[allow(clippy::too_many_lines)]
    fn execute(&mut self, net: &mut Scatternet, cmd: u16, params: &[u8]) {
        use opcode::cmd as op;

        match cmd {
            op::INQUIRY => {
                let Some(p) = command::Inquiry::from_bytes(params) else {
                    return self.short_command(params.len());
                };
                if p.length < 1 {
                    self.command_complete_status(Status::InvalidParameters);
                    return;
                }
                self.lm.inquiry_active = true;
                self.lm.periodic = false;
                self.lm.responses_left = if p.num_rsp == 0 {
                    u32::MAX
                } else {
                    u32::from(p.num_rsp)
                };
                self.lm.responses = 0;
                self.command_status(Status::Success);
                self.inquiry_start(net, p.length);
            }

            op::INQUIRY_CANCEL => {
                if !self.lm.inquiry_active || self.lm.periodic {
                    defmt::warn!("[HCI] Inquiry Cancel while no inquiry is active");
                    self.command_complete_status(Status::CommandDisallowed);
                    return;
                }
                self.lm.inquiry_active = false;
                net.cancel_timer(self.device.id, TimerKind::InquiryDone);
                self.command_complete_status(Status::Success);
            }

            op::PERIODIC_INQUIRY => {
                let Some(p) = command::PeriodicInquiry::from_bytes(params) else {
                    return self.short_command(params.len());
                };
                let periods_ordered =
                    u16::from(p.length) < p.min_period && p.min_period < p.max_period;
                if !periods_ordered || p.length < 1 || p.min_period < 2 || p.max_period < 3 {
                    self.command_complete_status(Status::InvalidParameters);
                    return;
                }
                self.lm.inquiry_active = true;
                self.lm.periodic = true;
                self.lm.responses_left = u32::from(p.num_rsp);
                self.lm.responses = 0;
                self.lm.inquiry_period = p.max_period;
                self.command_complete_status(Status::Success);
                self.inquiry_start(net, p.length);
            }

            op::EXIT_PERIODIC_INQUIRY => {
                if !self.lm.inquiry_active || !self.lm.periodic {
                    defmt::warn!("[HCI] Exit Periodic Inquiry while not in periodic mode");
                    self.command_complete_status(Status::CommandDisallowed);
                    return;
                }
                self.lm.inquiry_active = false;
                self.lm.periodic = false;
                net.cancel_timer(self.device.id, TimerKind::InquiryDone);
                net.cancel_timer(self.device.id, TimerKind::InquiryNext);
                self.command_complete_status(Status::Success);
            }

            op::CREATE_CONNECTION => {
                let Some(p) = command::CreateConnection::from_bytes(params) else {
                    return self.short_command(params.len());
                };
                if self.lm.awaiting.len() >= MAX_AWAITING_CONNECTIONS {
                    self.command_status(Status::RejectedLimitedResources);
                    return;
                }
                self.command_status(Status::Success);
                if self.connect(net, p.bd_addr).is_err() {
                    self.connection_reject_event(p.bd_addr);
                }
            }

            op::DISCONNECT => {
                let Some(p) = command::Disconnect::from_bytes(params) else {
                    return self.short_command(params.len());
                };
                if self.handle_index(p.handle).is_none() {
                    self.command_status(Status::NoConnection);
                    return;
                }
                self.command_status(Status::Success);
                self.disconnect(net, p.handle, p.reason);
            }

            op::CREATE_CONNECTION_CANCEL => {
                let Some(p) = command::BdAddrParams::from_bytes(params) else {
                    return self.short_command(params.len());
                };
                if self.take_awaiting(p.bd_addr) {
                    self.conn_cancel_complete(Status::Success, p.bd_addr);
                } else {
                    let connected = self.lm.handles.iter().any(|entry| {
                        entry.is_some_and(|e| {
                            e.role == LinkRole::Central
                                && net
                                    .device_info(e.key.peripheral)
                                    .is_some_and(|d| d.bd_addr == p.bd_addr)
                        })
                    });
                    let status = if connected {
                        Status::AclConnectionExists
                    } else {
                        Status::NoConnection
                    };
                    self.conn_cancel_complete(status, p.bd_addr);
                }
            }

            op::ACCEPT_CONNECTION_REQUEST => {
                let Some(p) = command::AcceptConnectionRequest::from_bytes(params) else {
                    return self.short_command(params.len());
                };
                let Some(host) = self.pending_host(net, p.bd_addr) else {
                    self.command_status(Status::InvalidParameters);
                    return;
                };
                self.command_status(Status::Success);
                net.cancel_timer(self.device.id, TimerKind::ConnAcceptTimeout);
                self.connection_accept(net, host);
                self.conn_req_host = None;
            }

            op::REJECT_CONNECTION_REQUEST => {
                let Some(p) = command::RejectConnectionRequest::from_bytes(params) else {
                    return self.short_command(params.len());
                };
                let Some(host) = self.pending_host(net, p.bd_addr) else {
                    self.command_status(Status::InvalidParameters);
                    return;
                };
                self.command_status(Status::Success);
                net.cancel_timer(self.device.id, TimerKind::ConnAcceptTimeout);
                let key = LinkKey {
                    central: host,
                    peripheral: self.device.id,
                };
                net.send_signal(
                    host,
                    LmpSignal::ConnectionComplete {
                        key,
                        status: p.reason,
                    },
                );
                self.connection_reject_event(p.bd_addr);
                self.conn_req_host = None;
            }

            op::AUTH_REQUESTED => {
                let Some(p) = command::HandleParams::from_bytes(params) else {
                    return self.short_command(params.len());
                };
                if self.handle_index(p.handle).is_none() {
                    self.command_status(Status::NoConnection);
                } else {
                    self.command_status(Status::Success);
                    let auth = event::AuthComplete { handle: p.handle }.to_bytes();
                    self.emit(event::code::AUTH_COMPLETE, &auth);
                }
            }

            op::SET_CONNECTION_ENCRYPTION => {
                let Some(p) = command::SetConnectionEncryption::from_bytes(params) else {
                    return self.short_command(params.len());
                };
                if self.handle_index(p.handle).is_none() {
                    self.command_status(Status::NoConnection);
                } else {
                    self.command_status(Status::Success);
                    let change = event::EncryptionChange {
                        handle: p.handle,
                        encrypt: p.encrypt,
                    }
                    .to_bytes();
                    self.emit(event::code::ENCRYPTION_CHANGE, &change);
                }
            }

            op::REMOTE_NAME_REQUEST => {
                let Some(p) = command::RemoteNameRequest::from_bytes(params) else {
                    return self.short_command(params.len());
                };
                if self.name_request(net, p.bd_addr).is_err() {
                    self.command_status(Status::NoConnection);
                }
            }

            op::REMOTE_NAME_REQUEST_CANCEL => {
                let Some(p) = command::BdAddrParams::from_bytes(params) else {
                    return self.short_command(params.len());
                };
                // Name lookups complete synchronously; nothing is ever
                // cancellable here.
                let mut ret = [0u8; 7];
                ret[0] = Status::InvalidParameters.to_u8();
                ret[1..7].copy_from_slice(p.bd_addr.as_bytes());
                self.command_complete(&ret);
            }

            op::READ_REMOTE_FEATURES => {
                let Some(p) = command::HandleParams::from_bytes(params) else {
                    return self.short_command(params.len());
                };
                if self.features_request(net, p.handle).is_err() {
                    self.command_status(Status::NoConnection);
                }
            }

            op::READ_REMOTE_EXT_FEATURES => {
                let Some(p) = command::ReadRemoteExtFeatures::from_bytes(params) else {
                    return self.short_command(params.len());
                };
                if self.handle_index(p.handle).is_none() {
                    self.command_status(Status::NoConnection);
                } else {
                    self.command_status(Status::Success);
                    let ext = event::ReadRemoteExtFeaturesComplete { handle: p.handle }.to_bytes();
                    self.emit(event::code::READ_REMOTE_EXT_FEATURES_COMPLETE, &ext);
                }
            }

            op::READ_REMOTE_VERSION => {
                let Some(p) = command::HandleParams::from_bytes(params) else {
                    return self.short_command(params.len());
                };
                if self.version_request(p.handle).is_err() {
                    self.command_status(Status::NoConnection);
                }
            }

            op::READ_CLOCK_OFFSET => {
                let Some(p) = command::HandleParams::from_bytes(params) else {
                    return self.short_command(params.len());
                };
                if self.clock_offset_request(net, p.handle).is_err() {
                    self.command_status(Status::NoConnection);
                }
            }

            op::READ_LMP_HANDLE => {
                let Some(p) = command::HandleParams::from_bytes(params) else {
                    return self.short_command(params.len());
                };
                // LMP handles are not modelled.
                let mut ret = [0u8; 8];
                ret[0] = Status::NoConnection.to_u8();
                ret[1..3].copy_from_slice(&p.handle.to_le_bytes());
                self.command_complete(&ret);
            }

            op::HOLD_MODE => {
                let Some(p) = command::ModeParams::from_bytes(params) else {
                    return self.short_command(params.len());
                };
                if p.min_interval > p.max_interval
                    || p.min_interval < 0x0002
                    || p.max_interval > 0xFF00
                    || p.min_interval & 1 != 0
                    || p.max_interval & 1 != 0
                {
                    self.command_status(Status::InvalidParameters);
                    return;
                }
                if self
                    .mode_change(net, p.handle, p.max_interval, AclMode::Hold)
                    .is_err()
                {
                    self.command_status(Status::NoConnection);
                }
            }

            op::PARK_MODE => {
                let Some(p) = command::ModeParams::from_bytes(params) else {
                    return self.short_command(params.len());
                };
                if p.min_interval > p.max_interval
                    || p.min_interval < 0x000E
                    || p.min_interval & 1 != 0
                    || p.max_interval & 1 != 0
                {
                    self.command_status(Status::InvalidParameters);
                    return;
                }
                if self
                    .mode_change(net, p.handle, p.max_interval, AclMode::Park)
                    .is_err()
                {
                    self.command_status(Status::NoConnection);
                }
            }

            op::EXIT_PARK_MODE => {
                let Some(p) = command::HandleParams::from_bytes(params) else {
                    return self.short_command(params.len());
                };
                if self.mode_cancel(net, p.handle, AclMode::Park).is_err() {
                    self.command_status(Status::NoConnection);
                }
            }

            op::ROLE_DISCOVERY => {
                let Some(p) = command::HandleParams::from_bytes(params) else {
                    return self.short_command(params.len());
                };
                let mut ret = [0u8; 4];
                ret[1..3].copy_from_slice(&p.handle.to_le_bytes());
                match self.handle_index(p.handle) {
                    Some(index) => {
                        ret[0] = Status::Success.to_u8();
                        ret[3] = match self.lm.handles[index].map(|e| e.role) {
                            Some(LinkRole::Central) => 0x00,
                            _ => 0x01,
                        };
                    }
                    None => {
                        ret[0] = Status::NoConnection.to_u8();
                        ret[3] = 0x01;
                    }
                }
                self.command_complete(&ret);
            }

            op::SET_EVENT_MASK => {
                let Some(p) = command::SetEventMask::from_bytes(params) else {
                    return self.short_command(params.len());
                };
                self.event_mask = p.mask;
                self.command_complete_status(Status::Success);
            }

            op::RESET => {
                self.reset(net);
                self.command_status(Status::Success);
            }

            op::SET_EVENT_FILTER => {
                let clear_all = params
                    .first()
                    .is_some_and(|&t| t == command::FILTER_CLEAR_ALL);
                if !clear_all && params.len() < 2 {
                    return self.short_command(params.len());
                }
                // Filters are not implemented.
                self.command_complete_status(Status::Success);
            }

            op::FLUSH => {
                let Some(p) = command::HandleParams::from_bytes(params) else {
                    return self.short_command(params.len());
                };
                let mut ret = [0u8; 3];
                ret[1..3].copy_from_slice(&p.handle.to_le_bytes());
                if self.handle_index(p.handle).is_none() {
                    ret[0] = Status::NoConnection.to_u8();
                    self.command_complete(&ret);
                } else {
                    let flush = event::FlushOccurred { handle: p.handle }.to_bytes();
                    self.emit(event::code::FLUSH_OCCURRED, &flush);
                    ret[0] = Status::Success.to_u8();
                    self.command_complete(&ret);
                }
            }

            op::CHANGE_LOCAL_NAME => {
                let Some(p) = command::ChangeLocalName::from_bytes(params) else {
                    return self.short_command(params.len());
                };
                self.device.name = p.as_str().and_then(|s| String::try_from(s).ok());
                self.command_complete_status(Status::Success);
            }

            op::READ_LOCAL_NAME => {
                let mut ret = [0u8; 1 + crate::constants::MAX_DEVICE_NAME_LENGTH];
                ret[0] = Status::Success.to_u8();
                if let Some(name) = &self.device.name {
                    let bytes = name.as_bytes();
                    ret[1..1 + bytes.len()].copy_from_slice(bytes);
                }
                self.command_complete(&ret);
            }

            op::READ_CONN_ACCEPT_TIMEOUT => {
                let mut ret = [0u8; 3];
                ret[0] = Status::Success.to_u8();
                ret[1..3].copy_from_slice(&self.conn_accept_timeout.to_le_bytes());
                self.command_complete(&ret);
            }

            op::WRITE_CONN_ACCEPT_TIMEOUT => {
                let Some(p) = command::U16Params::from_bytes(params) else {
                    return self.short_command(params.len());
                };
                if p.value < 0x0001 || p.value > 0xB540 {
                    self.command_complete_status(Status::InvalidParameters);
                    return;
                }
                self.conn_accept_timeout = p.value;
                self.command_complete_status(Status::Success);
            }

            op::READ_SCAN_ENABLE => {
                let enable = if self.device.inquiry_scan {
                    command::SCAN_INQUIRY
                } else {
                    0
                } | if self.device.page_scan {
                    command::SCAN_PAGE
                } else {
                    0
                };
                self.command_complete(&[Status::Success.to_u8(), enable]);
            }

            op::WRITE_SCAN_ENABLE => {
                let Some(p) = command::U8Params::from_bytes(params) else {
                    return self.short_command(params.len());
                };
                self.device.inquiry_scan = p.value & command::SCAN_INQUIRY != 0;
                self.device.page_scan = p.value & command::SCAN_PAGE != 0;
                self.command_complete_status(Status::Success);
            }

            op::READ_CLASS_OF_DEVICE => {
                let mut ret = [0u8; 4];
                ret[0] = Status::Success.to_u8();
                ret[1..4].copy_from_slice(&self.device.class_of_device.to_bytes());
                self.command_complete(&ret);
            }

            op::WRITE_CLASS_OF_DEVICE => {
                let Some(p) = command::WriteClassOfDevice::from_bytes(params) else {
                    return self.short_command(params.len());
                };
                self.device.class_of_device = ClassOfDevice::from_bytes(p.dev_class);
                self.command_complete_status(Status::Success);
            }

            op::READ_VOICE_SETTING => {
                let mut ret = [0u8; 3];
                ret[0] = Status::Success.to_u8();
                ret[1..3].copy_from_slice(&self.voice_setting.to_le_bytes());
                self.command_complete(&ret);
            }

            op::WRITE_VOICE_SETTING => {
                let Some(p) = command::U16Params::from_bytes(params) else {
                    return self.short_command(params.len());
                };
                self.voice_setting = p.value;
                self.command_complete_status(Status::Success);
            }

            op::HOST_NUM_COMPLETED_PACKETS => {
                let Some(&count) = params.first() else {
                    return self.short_command(params.len());
                };
                let needed = usize::from(count) * 2 + 1;
                if params.len() < needed {
                    return self.short_command(params.len());
                }
                for i in 0..usize::from(count) {
                    let handle = u16::from_le_bytes([params[i * 2 + 1], params[i * 2 + 2]]);
                    if self.handle_index(handle).is_none() {
                        self.command_complete_status(Status::InvalidParameters);
                    }
                }
                // No response on success.
            }

            op::READ_INQUIRY_MODE => {
                self.command_complete(&[Status::Success.to_u8(), self.lm.inquiry_mode]);
            }

            op::WRITE_INQUIRY_MODE => {
                let Some(p) = command::U8Params::from_bytes(params) else {
                    return self.short_command(params.len());
                };
                if p.value > 0x01 {
                    self.command_complete_status(Status::InvalidParameters);
                    return;
                }
                self.lm.inquiry_mode = p.value;
                self.command_complete_status(Status::Success);
            }

            op::READ_LOCAL_VERSION => {
                let mut ret = [0u8; 9];
                ret[0] = Status::Success.to_u8();
                ret[1] = 0x03; // HCI 1.2
                ret[2..4].copy_from_slice(&0xA607u16.to_le_bytes());
                ret[4] = 0x03; // LMP 1.2
                ret[5..7].copy_from_slice(&0xA000u16.to_le_bytes());
                ret[7..9].copy_from_slice(&0xA607u16.to_le_bytes());
                self.command_complete(&ret);
            }

            op::READ_LOCAL_COMMANDS => {
                let mut ret = [0u8; 65];
                ret[0] = Status::Success.to_u8();
                ret[1..65].copy_from_slice(&LOCAL_SUPPORTED_COMMANDS);
                self.command_complete(&ret);
            }

            op::READ_LOCAL_FEATURES => {
                let mut ret = [0u8; 9];
                ret[0] = Status::Success.to_u8();
                ret[1..9].copy_from_slice(&self.device.lmp_features.to_le_bytes());
                self.command_complete(&ret);
            }

            op::READ_LOCAL_EXT_FEATURES => {
                let Some(p) = command::U8Params::from_bytes(params) else {
                    return self.short_command(params.len());
                };
                let mut ret = [0u8; 11];
                ret[0] = Status::Success.to_u8();
                ret[1] = p.value;
                ret[2] = 0x00; // max page
                if p.value == 0 {
                    ret[3..11].copy_from_slice(&LOCAL_EXT_FEATURES_PAGE0);
                }
                self.command_complete(&ret);
            }

            op::READ_BUFFER_SIZE => {
                let mut ret = [0u8; 8];
                ret[0] = Status::Success.to_u8();
                ret[1..3].copy_from_slice(&0x0200u16.to_le_bytes()); // ACL MTU
                ret[3] = 0x00; // SCO MTU
                ret[4..6].copy_from_slice(&0x0001u16.to_le_bytes()); // ACL packets
                ret[6..8].copy_from_slice(&0x0000u16.to_le_bytes()); // SCO packets
                self.command_complete(&ret);
            }

            op::READ_COUNTRY_CODE => {
                // Deprecated; North America & Europe.
                self.command_complete(&[Status::Success.to_u8(), 0x00]);
            }

            op::READ_BD_ADDR => {
                let mut ret = [0u8; 7];
                ret[0] = Status::Success.to_u8();
                ret[1..7].copy_from_slice(self.device.bd_addr.as_bytes());
                self.command_complete(&ret);
            }

            op::READ_LINK_QUALITY => {
                let Some(p) = command::HandleParams::from_bytes(params) else {
                    return self.short_command(params.len());
                };
                let mut ret = [0u8; 4];
                ret[0] = if self.handle_index(p.handle).is_some() {
                    Status::Success.to_u8()
                } else {
                    Status::NoConnection.to_u8()
                };
                ret[1..3].copy_from_slice(&p.handle.to_le_bytes());
                ret[3] = 0xFF;
                self.command_complete(&ret);
            }

            _ => {
                self.command_status(Status::UnknownCommand);
            }
        }
    }

    fn conn_cancel_complete(&mut self, status: Status, bd_addr: BluetoothAddress) {
        let mut ret = [0u8; 7];
        ret[0] = status.to_u8();
        ret[1..7].copy_from_slice(bd_addr.as_bytes());
        self.command_complete(&ret);
    }

    fn pending_host(&self, net: &Scatternet, bd_addr: BluetoothAddress) -> Option<DeviceId> {
        let host = self.conn_req_host?;
        let host_addr = net.device_info(host)?.bd_addr;
        (host_addr == bd_addr).then_some(host)
    }

    pub(crate) fn submit_acl(&mut self, net: &mut Scatternet, packet: &[u8]) {
        if packet.len() < 4 {
            defmt::warn!("[HCI] ACL packet too short ({}B)", packet.len());
            return;
        }

        let handle_flags = u16::from_le_bytes([packet[0], packet[1]]);
        let handle = handle_flags & 0x0FFF;
        let flags = handle_flags >> 12;
        let datalen = usize::from(u16::from_le_bytes([packet[2], packet[3]]));
        let data = &packet[4..];

        let Some(index) = self.handle_index(handle) else {
            defmt::warn!("[HCI] invalid ACL handle {:03x}", handle);
            return;
        };

        if datalen > data.len() {
            defmt::warn!("[HCI] ACL packet shorter than its length field");
            return;
        }

        if flags & !0x3 == ACL_ACTIVE_BCAST {
            if self.asb_handle == 0 {
                self.asb_handle = handle;
            } else if handle != self.asb_handle {
                defmt::warn!("[HCI] bad handle {:03x} in Active Slave Broadcast", handle);
                return;
            }
        }

        if flags & !0x3 == ACL_PICO_BCAST {
            if self.psb_handle == 0 {
                self.psb_handle = handle;
            } else if handle != self.psb_handle {
                defmt::warn!("[HCI] bad handle {:03x} in Parked Slave Broadcast", handle);
                return;
            }
        }

        // The controller never buffers: each packet is consumed on the spot.
        let comp = event::NumCompletedPackets { handle, packets: 1 }.to_bytes();
        self.emit(event::code::NUM_COMPLETED_PACKETS, &comp);

        let Some(entry) = self.lm.handles[index] else {
            return;
        };
        let mut payload = Vec::new();
        if payload.extend_from_slice(data).is_err() {
            defmt::warn!("[HCI] can't take ACL packets {} bytes long", data.len());
            return;
        }

        // Forwarded last: the peer may synchronously answer back into us.
        net.send_signal(
            entry.key.peer_of(self.device.id),
            LmpSignal::AclData {
                key: entry.key,
                start: flags & 0x3 == ACL_START,
                data: payload,
            },
        );
    }

    pub(crate) fn submit_sco(&mut self, packet: &[u8]) {
        if packet.len() < 3 {
            return;
        }

        let handle = u16::from_le_bytes([packet[0], packet[1]]) & 0x0FFF;
        let datalen = usize::from(packet[2]);

        if self.handle_index(handle).is_none() {
            defmt::warn!("[HCI] invalid SCO handle {:03x}", handle);
            return;
        }

        if datalen > packet.len() - 3 {
            defmt::warn!("[HCI] SCO packet shorter than its length field");
        }
        // The audio path is not modelled; payload dropped after validation.
    }

    fn lmp_acl_data(&mut self, key: LinkKey, start: bool, data: &[u8]) {
        let Some(index) = self
            .lm
            .handles
            .iter()
            .position(|entry| entry.is_some_and(|e| e.key == key))
        else {
            defmt::warn!("[HCI] ACL data for unknown link");
            return;
        };
        let handle = HCI_HANDLE_OFFSET | index as u16;

        let boundary = if start { ACL_START } else { ACL_CONT };
        let mut packet = AclPacket::new();
        packet
            .extend_from_slice(&(handle | (boundary << 12)).to_le_bytes())
            .ok();
        packet
            .extend_from_slice(&(data.len() as u16).to_le_bytes())
            .ok();
        if packet.extend_from_slice(data).is_err() {
            defmt::error!("[HCI] outbound ACL payload too long ({}B)", data.len());
            return;
        }
        if self.acl_out.push_back(packet).is_err() {
            defmt::error!("[HCI] ACL queue full, dropping packet");
        }
    }

    // ------------------------------------------------------------------
    // Scatternet integration

    pub(crate) fn handle_signal(&mut self, net: &mut Scatternet, signal: LmpSignal) {
        match signal {
            LmpSignal::ConnectionRequest { key } => self.lmp_connection_request(net, key),
            LmpSignal::ConnectionComplete { key, status } => {
                self.lmp_connection_complete(net, key, status);
            }
            LmpSignal::DisconnectPeripheral { key, reason }
            | LmpSignal::DisconnectCentral { key, reason } => self.lmp_disconnect(net, key, reason),
            LmpSignal::AclData { key, start, data } => self.lmp_acl_data(key, start, &data),
            LmpSignal::ModeChange {
                key,
                mode,
                interval,
            } => self.lmp_mode_change(key, mode, interval),
        }
    }

    pub(crate) fn handle_timer(&mut self, net: &mut Scatternet, kind: TimerKind) {
        match kind {
            TimerKind::InquiryDone => self.inquiry_done(),
            TimerKind::InquiryNext => self.inquiry_next(net),
            TimerKind::ConnAcceptTimeout => {
                if self.conn_req_host.is_some() {
                    // The host still has to answer; the peer will learn the
                    // outcome from its accept or reject.
                    defmt::debug!("[HCI] connection accept timeout with request pending");
                }
            }
            TimerKind::AclModeExpiry { handle } => {
                let index = usize::from(handle & !HCI_HANDLE_OFFSET);
                if self.lm.handles[index].is_some_and(|e| e.role == LinkRole::Central) {
                    self.apply_mode(net, index, AclMode::Active, 0);
                }
            }
        }
    }

    pub(crate) fn power_off(&mut self, net: &mut Scatternet) {
        if let Some(host) = self.conn_req_host.take() {
            let key = LinkKey {
                central: host,
                peripheral: self.device.id,
            };
            net.send_signal(
                host,
                LmpSignal::ConnectionComplete {
                    key,
                    status: Status::RemotePowerOff.to_u8(),
                },
            );
        }

        for index in 0..MAX_HCI_HANDLES {
            if self.lm.handles[index].is_some() {
                self.disconnect(
                    net,
                    HCI_HANDLE_OFFSET | index as u16,
                    Status::RemotePowerOff.to_u8(),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DeviceOptions;

    fn controller() -> HciController {
        let device = Device::new(0, BluetoothAddress::from_index(0), &DeviceOptions::default());
        HciController::new(device)
    }

    fn entry(index: usize) -> HandleEntry {
        HandleEntry {
            key: LinkKey {
                central: 0,
                peripheral: index % 4,
            },
            role: LinkRole::Central,
            mode: AclMode::Active,
            interval: 0,
        }
    }

    #[test]
    fn test_handle_allocation_round_robin() {
        let mut hci = controller();

        let first = hci.alloc_handle().unwrap();
        hci.lm.handles[first] = Some(entry(first));
        let second = hci.alloc_handle().unwrap();
        hci.lm.handles[second] = Some(entry(second));

        // Probing starts after the last assigned index.
        assert_eq!(first, 1);
        assert_eq!(second, 2);

        // A freed low index is not reused until the probe wraps around.
        hci.lm.handles[first] = None;
        let third = hci.alloc_handle().unwrap();
        assert_eq!(third, 3);
    }

    #[test]
    fn test_handle_allocation_exhausts() {
        let mut hci = controller();
        let mut allocated = 0;
        while let Some(index) = hci.alloc_handle() {
            hci.lm.handles[index] = Some(entry(index));
            allocated += 1;
            assert!(allocated <= MAX_HCI_HANDLES);
        }
        assert_eq!(allocated, MAX_HCI_HANDLES);

        // Freeing any slot makes allocation succeed again.
        hci.lm.handles[5] = None;
        assert_eq!(hci.alloc_handle(), Some(5));
    }

    #[test]
    fn test_handle_allocation_skips_broadcast_handles() {
        let mut hci = controller();
        hci.asb_handle = HCI_HANDLE_OFFSET | 1;
        hci.psb_handle = HCI_HANDLE_OFFSET | 2;

        let index = hci.alloc_handle().unwrap();
        assert_eq!(index, 3);
    }

    #[test]
    fn test_handle_index_validation() {
        let mut hci = controller();
        hci.lm.handles[2] = Some(entry(2));

        assert_eq!(hci.handle_index(0x0022), Some(2));
        // Missing offset bit, out of range, or unallocated.
        assert_eq!(hci.handle_index(0x0002), None);
        assert_eq!(hci.handle_index(0x0030), None);
        assert_eq!(hci.handle_index(0x0021), None);
    }

    #[test]
    fn test_event_mask_gates_maskable_events_only() {
        let mut hci = controller();
        hci.event_mask = [0; 8];

        // Inquiry Complete is maskable and disappears.
        hci.emit(event::code::INQUIRY_COMPLETE, &[0]);
        assert!(hci.pop_event().is_none());

        // Command Status is not maskable and always gets through.
        hci.command_status(Status::Success);
        let event = hci.pop_event().unwrap();
        assert_eq!(event[0], event::code::COMMAND_STATUS);
    }

    #[test]
    fn test_reset_is_idempotent() {
        let mut net = Scatternet::new();
        let mut hci = controller();
        hci.voice_setting = 0x1234;
        hci.device.inquiry_scan = true;

        hci.reset(&mut net);
        assert_eq!(hci.voice_setting, 0x0000);
        assert!(!hci.device.inquiry_scan);
        assert_eq!(hci.conn_accept_timeout, DEFAULT_CONN_ACCEPT_TIMEOUT);

        hci.reset(&mut net);
        assert_eq!(hci.voice_setting, 0x0000);
    }
}
