//! L2CAP Engine and Peer Device
//!
//! [`L2capPeer`] is an emulated L2CAP-rooted scatternet device: it accepts
//! every page (it is only paged while page-scanning), runs one
//! [`L2capInstance`] per ACL link and serves the PSMs registered on it. The
//! engine is initiator-passive: it answers Connection, Disconnection, Echo
//! and Information Requests but never issues its own, with the single
//! exception of the Configuration Request it owes each accepted channel.

use super::{
    channel::{Channel, ChannelMode, MAX_L2CAP_CHANNELS},
    packet::{BasicHeader, ChannelId, GROUP_MTU, cid, fcs16, psm},
    signaling::{
        ConfigurationResult, ConnectionRequest, ConnectionResponse, ConnectionResult,
        DisconnectionRequest, DisconnectionResponse, InformationRequest, SignalingCode,
        SignalingHeader, conf_opt, info_result, info_type, reject_reason,
    },
};
use crate::{
    BluetoothError,
    constants::{ACL_FRAGMENT_SIZE, L2CAP_FRAME_BUFFER_SIZE, MAX_PEER_LINKS,
        MAX_PSM_REGISTRATIONS},
    device::{Device, DeviceId, LinkKey, LinkRole, LmpSignal, Scatternet},
    sdp::server::SdpServer,
};
use heapless::{FnvIndexMap, Vec};

/// Largest SDU a bound service may hand back for transmission
pub const MAX_SDU_OUT: usize = 672;

/// Largest signalling command PDU the engine will build
const MAX_SIGNALLING_PDU: usize = 256;

/// Services that can be bound to a PSM registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum PsmService {
    /// The built-in Service Discovery Protocol server
    Sdp,
    /// Echo every inbound SDU back to the sender
    ///
    /// Stands in for external profile collaborators in tests and demos.
    Loopback,
}

/// One PSM registered on a peer device
#[derive(Debug)]
struct PsmRegistration {
    psm: u16,
    min_mtu: u16,
    service: PsmService,
}

/// Per-channel service instance
#[derive(Debug)]
enum ChannelService {
    Sdp(SdpServer),
    Loopback,
}

type PeerChannel = Channel<ChannelService>;

/// Per-ACL-link L2CAP state
#[derive(Debug)]
struct L2capInstance {
    key: LinkKey,
    role: LinkRole,
    frame_in: Vec<u8, L2CAP_FRAME_BUFFER_SIZE>,
    channels: FnvIndexMap<ChannelId, PeerChannel, MAX_L2CAP_CHANNELS>,
    last_id: u8,
    next_id: u8,
}

impl L2capInstance {
    fn new(key: LinkKey, role: LinkRole) -> Self {
        Self {
            key,
            role,
            frame_in: Vec::new(),
            channels: FnvIndexMap::new(),
            last_id: 0,
            next_id: 1,
        }
    }

    fn link_peer(&self) -> DeviceId {
        match self.role {
            LinkRole::Peripheral => self.key.central,
            LinkRole::Central => self.key.peripheral,
        }
    }

    // --------------------------------------------------------------
    // Outbound path

    fn pdu_out(&self, net: &mut Scatternet, channel_id: ChannelId, payload: &[u8]) {
        let mut data: Vec<u8, ACL_FRAGMENT_SIZE> = Vec::new();
        data.extend_from_slice(&BasicHeader::new(payload.len() as u16, channel_id).to_bytes())
            .ok();
        if data.extend_from_slice(payload).is_err() {
            defmt::error!("[L2CAP] outbound PDU too long ({}B)", payload.len());
            return;
        }
        net.send_signal(
            self.link_peer(),
            LmpSignal::AclData {
                key: self.key,
                start: true,
                data,
            },
        );
    }

    fn send_command(&self, net: &mut Scatternet, code: SignalingCode, ident: u8, payload: &[u8]) {
        let mut pdu: Vec<u8, MAX_SIGNALLING_PDU> = Vec::new();
        pdu.extend_from_slice(
            &SignalingHeader::new(code, ident, payload.len() as u16).to_bytes(),
        )
        .ok();
        if pdu.extend_from_slice(payload).is_err() {
            defmt::error!("[L2CAP] signalling command too long");
            return;
        }
        self.pdu_out(net, cid::SIGNALLING, &pdu);
    }

    fn command_reject(&self, net: &mut Scatternet, ident: u8, reason: u16, data: &[u8]) {
        let mut payload: Vec<u8, 8> = Vec::new();
        payload.extend_from_slice(&reason.to_le_bytes()).ok();
        payload.extend_from_slice(data).ok();
        self.send_command(net, SignalingCode::CommandReject, ident, &payload);
    }

    fn command_reject_cid(
        &self,
        net: &mut Scatternet,
        ident: u8,
        dcid: ChannelId,
        scid: ChannelId,
    ) {
        let mut data = [0u8; 4];
        data[0..2].copy_from_slice(&dcid.to_le_bytes());
        data[2..4].copy_from_slice(&scid.to_le_bytes());
        self.command_reject(net, ident, reject_reason::CID_INVALID, &data);
    }

    // --------------------------------------------------------------
    // Recombination

    fn acl_in(
        &mut self,
        net: &mut Scatternet,
        registrations: &[PsmRegistration],
        start: bool,
        data: &[u8],
    ) {
        if start {
            self.frame_in.clear();
        }

        let space = L2CAP_FRAME_BUFFER_SIZE - self.frame_in.len();
        if data.len() > space {
            // Best effort: dispatch what fits, drop the tail.
            defmt::warn!("[L2CAP] recombination buffer overflow, truncating PDU");
            self.frame_in.extend_from_slice(&data[..space]).ok();
            self.dispatch_frame(net, registrations);
            return;
        }

        self.frame_in.extend_from_slice(data).ok();
        let Ok(header) = BasicHeader::from_bytes(&self.frame_in) else {
            return;
        };
        if self.frame_in.len() >= BasicHeader::SIZE + usize::from(header.length) {
            // There is never the start of a second PDU in the same ACL
            // packet, so one dispatch per completion suffices.
            self.dispatch_frame(net, registrations);
        }
    }

    fn dispatch_frame(&mut self, net: &mut Scatternet, registrations: &[PsmRegistration]) {
        let frame = core::mem::take(&mut self.frame_in);
        let Ok(header) = BasicHeader::from_bytes(&frame) else {
            return;
        };
        let available = frame.len() - BasicHeader::SIZE;
        let length = usize::from(header.length).min(available);
        let payload = &frame[BasicHeader::SIZE..BasicHeader::SIZE + length];

        match header.channel_id {
            cid::SIGNALLING => self.cframe_in(net, registrations, payload),
            cid::GROUP => {
                // Connection-less group traffic is accepted and ignored.
            }
            id => match self.channels.get(&id).map(|ch| ch.mode) {
                Some(ChannelMode::Basic) => self.deliver_sdu(net, id, payload),
                Some(_) => self.iframe_in(net, id, &frame[..BasicHeader::SIZE + length]),
                None => {
                    defmt::warn!("[L2CAP] frame for non-existent channel {:04x}", id);
                }
            },
        }
    }

    // --------------------------------------------------------------
    // Data plane

    fn deliver_sdu(&mut self, net: &mut Scatternet, local_cid: ChannelId, data: &[u8]) {
        let mut response: Vec<u8, MAX_SDU_OUT> = Vec::new();
        let remote_cid;
        let remote_mtu;
        {
            let Some(channel) = self.channels.get_mut(&local_cid) else {
                return;
            };
            if !channel.config.is_open() {
                defmt::warn!("[L2CAP] data on half-configured channel {:04x}", local_cid);
                return;
            }
            remote_cid = channel.remote_cid;
            remote_mtu = channel.remote_mtu;

            match &mut channel.service {
                ChannelService::Sdp(server) => {
                    if !server.handle_request(data, &mut response) {
                        return;
                    }
                }
                ChannelService::Loopback => {
                    if response.extend_from_slice(data).is_err() {
                        defmt::warn!("[L2CAP] loopback SDU too long, dropped");
                        return;
                    }
                }
            }
        }

        if response.len() > usize::from(remote_mtu) {
            // A service producing more than the negotiated MTU is a local
            // configuration error, never a wire condition.
            defmt::error!(
                "[L2CAP] SDU for CID {:04x} longer than {} octets",
                remote_cid,
                remote_mtu
            );
            return;
        }
        self.pdu_out(net, remote_cid, &response);
    }

    /// Retransmission/Flow-Control mode frame, FCS-checked
    fn iframe_in(&mut self, net: &mut Scatternet, local_cid: ChannelId, frame: &[u8]) {
        let payload = &frame[BasicHeader::SIZE..];
        let len = payload.len();

        let mut complete: Vec<u8, { crate::constants::L2CAP_SDU_BUFFER_SIZE }> = Vec::new();
        let mut deliver = false;
        {
            let Some(channel) = self.channels.get_mut(&local_cid) else {
                return;
            };

            if len < 4 {
                channel.sar_reset();
                return;
            }
            let fcs = u16::from_le_bytes([payload[len - 2], payload[len - 1]]);
            if fcs16(&frame[..frame.len() - 2]) != fcs {
                defmt::warn!("[L2CAP] bad FCS on channel {:04x}", local_cid);
                channel.sar_reset();
                return;
            }

            let retransmission_disabled = payload[0] >> 7 != 0;
            if retransmission_disabled == channel.rexmit {
                // Toggle tracked; the retransmission and monitor timers of
                // these modes are not modelled.
                channel.rexmit = !retransmission_disabled;
            }

            if payload[0] & 1 != 0 {
                // Supervisory frame; nothing to acknowledge in this engine.
                return;
            }

            let mps = channel.mps as usize;
            match payload[1] >> 6 {
                0b00 => {
                    // Unsegmented SDU
                    if channel.sar_in_progress() || len - 4 > mps {
                        channel.sar_reset();
                        return;
                    }
                    complete.extend_from_slice(&payload[2..len - 2]).ok();
                    deliver = true;
                }
                0b01 => {
                    // Start of a segmented SDU
                    if channel.sar_in_progress() || len < 6 || len - 6 > mps {
                        channel.sar_reset();
                        return;
                    }
                    let total = usize::from(u16::from_le_bytes([payload[2], payload[3]]));
                    if len >= 6 + total || !channel.sar_start(total, &payload[4..len - 2]) {
                        channel.sar_reset();
                    }
                }
                0b10 => {
                    // End of a segmented SDU
                    if !channel.sar_in_progress() || len - 4 > mps {
                        channel.sar_reset();
                        return;
                    }
                    match channel.sar_end(&payload[2..len - 2]) {
                        Some(sdu) => {
                            complete.extend_from_slice(sdu).ok();
                            deliver = true;
                        }
                        None => channel.sar_reset(),
                    }
                }
                _ => {
                    // Continuation segment
                    if !channel.sar_in_progress()
                        || len - 4 > mps
                        || !channel.sar_continue(&payload[2..len - 2])
                    {
                        channel.sar_reset();
                    }
                }
            }
        }

        if deliver {
            self.deliver_sdu(net, local_cid, &complete);
        }
    }

    // --------------------------------------------------------------
    // Signalling channel

    fn cframe_in(&mut self, net: &mut Scatternet, registrations: &[PsmRegistration], data: &[u8]) {
        let mut rest = data;
        while !rest.is_empty() {
            let Ok(header) = SignalingHeader::from_bytes(rest) else {
                defmt::warn!("[L2CAP] truncated signalling header");
                return;
            };
            rest = &rest[SignalingHeader::SIZE..];

            let length = usize::from(header.length);
            if rest.len() < length {
                self.command_reject(
                    net,
                    header.identifier,
                    reject_reason::CMD_NOT_UNDERSTOOD,
                    &[],
                );
                break;
            }

            self.command(net, registrations, header, &rest[..length]);
            rest = &rest[length..];
        }
    }

    #[allow(clippy::too_many_lines)]
    fn command(
        &mut self,
        net: &mut Scatternet,
        registrations: &[PsmRegistration],
        header: SignalingHeader,
        params: &[u8],
    ) {
        // One outstanding request at a time keeps identifier bookkeeping
        // trivial: the last received identifier is the one responses carry.
        self.last_id = header.identifier;
        self.next_id = if header.identifier == 255 {
            1
        } else {
            header.identifier + 1
        };

        let ident = header.identifier;
        match SignalingCode::from_u8(header.code) {
            Some(SignalingCode::CommandReject) => {
                if !matches!(params.len(), 2 | 4 | 6) {
                    self.command_reject(net, ident, reject_reason::CMD_NOT_UNDERSTOOD, &[]);
                    return;
                }
                // We only ever send responses, so nothing of ours can be
                // rejected.
                defmt::warn!("[L2CAP] stray Command Reject ({:02x}) ignored", ident);
            }

            Some(SignalingCode::ConnectionRequest) => {
                let Ok(request) = ConnectionRequest::from_bytes(params) else {
                    self.command_reject(net, ident, reject_reason::CMD_NOT_UNDERSTOOD, &[]);
                    return;
                };
                if params.len() != ConnectionRequest::SIZE {
                    self.command_reject(net, ident, reject_reason::CMD_NOT_UNDERSTOOD, &[]);
                    return;
                }
                self.channel_open(net, registrations, request.psm, request.source_cid);
            }

            Some(SignalingCode::ConnectionResponse) => {
                if params.len() != ConnectionResponse::SIZE {
                    self.command_reject(net, ident, reject_reason::CMD_NOT_UNDERSTOOD, &[]);
                    return;
                }
                defmt::warn!("[L2CAP] unexpected Connection Response ({:02x}) ignored", ident);
            }

            Some(SignalingCode::ConfigurationRequest) => {
                if params.len() < 4 {
                    self.command_reject(net, ident, reject_reason::CMD_NOT_UNDERSTOOD, &[]);
                    return;
                }
                let dcid = u16::from_le_bytes([params[0], params[1]]);
                let flags = u16::from_le_bytes([params[2], params[3]]) & 1;
                self.configuration_request(net, flags, dcid, &params[4..]);
            }

            Some(SignalingCode::ConfigurationResponse) => {
                if params.len() < 6 {
                    self.command_reject(net, ident, reject_reason::CMD_NOT_UNDERSTOOD, &[]);
                    return;
                }
                let scid = u16::from_le_bytes([params[0], params[1]]);
                let flags = u16::from_le_bytes([params[2], params[3]]) & 1;
                let result = u16::from_le_bytes([params[4], params[5]]);
                if self.configuration_response(net, result, flags, scid) {
                    defmt::warn!(
                        "[L2CAP] unexpected Configuration Response ({:02x}) ignored",
                        ident
                    );
                }
            }

            Some(SignalingCode::DisconnectionRequest) => {
                let Ok(request) = DisconnectionRequest::from_bytes(params) else {
                    self.command_reject(net, ident, reject_reason::CMD_NOT_UNDERSTOOD, &[]);
                    return;
                };
                if params.len() != DisconnectionRequest::SIZE {
                    self.command_reject(net, ident, reject_reason::CMD_NOT_UNDERSTOOD, &[]);
                    return;
                }
                self.channel_close(net, request.destination_cid, request.source_cid);
            }

            Some(SignalingCode::DisconnectionResponse) => {
                if params.len() != DisconnectionResponse::SIZE {
                    self.command_reject(net, ident, reject_reason::CMD_NOT_UNDERSTOOD, &[]);
                    return;
                }
                defmt::warn!(
                    "[L2CAP] unexpected Disconnection Response ({:02x}) ignored",
                    ident
                );
            }

            Some(SignalingCode::EchoRequest) => {
                self.send_command(net, SignalingCode::EchoResponse, self.last_id, params);
            }

            Some(SignalingCode::EchoResponse) => {
                defmt::warn!("[L2CAP] unexpected Echo Response ({:02x}) ignored", ident);
            }

            Some(SignalingCode::InformationRequest) => {
                let Ok(request) = InformationRequest::from_bytes(params) else {
                    self.command_reject(net, ident, reject_reason::CMD_NOT_UNDERSTOOD, &[]);
                    return;
                };
                if params.len() != InformationRequest::SIZE {
                    self.command_reject(net, ident, reject_reason::CMD_NOT_UNDERSTOOD, &[]);
                    return;
                }
                self.information(net, request.info_type);
            }

            Some(SignalingCode::InformationResponse) => {
                if params.len() < 4 {
                    self.command_reject(net, ident, reject_reason::CMD_NOT_UNDERSTOOD, &[]);
                    return;
                }
                defmt::warn!(
                    "[L2CAP] unexpected Information Response ({:02x}) ignored",
                    ident
                );
            }

            None => {
                self.command_reject(net, ident, reject_reason::CMD_NOT_UNDERSTOOD, &[]);
            }
        }
    }

    fn channel_open(
        &mut self,
        net: &mut Scatternet,
        registrations: &[PsmRegistration],
        request_psm: u16,
        source_cid: ChannelId,
    ) {
        let free_cid = if self.channels.len() >= MAX_L2CAP_CHANNELS {
            None
        } else {
            (cid::DYNAMIC_START..cid::DYNAMIC_END).find(|c| !self.channels.contains_key(c))
        };

        let (result, dcid) = match free_cid {
            None => (ConnectionResult::NoResources, cid::NULL),
            Some(local_cid) => {
                match registrations.iter().find(|r| r.psm == request_psm) {
                    None => (ConnectionResult::PsmNotSupported, local_cid),
                    Some(registration) => {
                        let service = match registration.service {
                            PsmService::Sdp => ChannelService::Sdp(SdpServer::new()),
                            PsmService::Loopback => ChannelService::Loopback,
                        };
                        let channel = Channel::new(source_cid, registration.min_mtu, service);
                        self.channels.insert(local_cid, channel).ok();
                        (ConnectionResult::Success, local_cid)
                    }
                }
            }
        };

        // Exactly one Connection Response, whatever happened above.
        let response = ConnectionResponse {
            destination_cid: dcid,
            source_cid,
            result,
            status: 0,
        };
        self.send_command(
            net,
            SignalingCode::ConnectionResponse,
            self.last_id,
            &response.to_bytes(),
        );

        if result == ConnectionResult::Success {
            let pending = self
                .channels
                .get(&dcid)
                .is_some_and(|ch| !ch.config.local_done && ch.config_req_id.is_none());
            if pending {
                self.send_configuration_request(net, dcid);
            }
        }
    }

    fn channel_close(&mut self, net: &mut Scatternet, dcid: ChannelId, scid: ChannelId) {
        if dcid < cid::DYNAMIC_START {
            self.command_reject_cid(net, self.last_id, dcid, scid);
            return;
        }

        if let Some(channel) = self.channels.get(&dcid) {
            if channel.remote_cid != scid {
                defmt::warn!(
                    "[L2CAP] ignoring Disconnection Request with invalid SCID {:04x}",
                    scid
                );
                return;
            }
            // Channel state, including any per-channel SDP database, dies
            // here.
            self.channels.remove(&dcid);
        }

        // A closed channel still answers, so the peer's state machine always
        // completes its disconnect.
        let response = DisconnectionResponse {
            destination_cid: dcid,
            source_cid: scid,
        };
        self.send_command(
            net,
            SignalingCode::DisconnectionResponse,
            self.last_id,
            &response.to_bytes(),
        );
    }

    fn send_configuration_request(&mut self, net: &mut Scatternet, local_cid: ChannelId) {
        let Some(remote_cid) = self.channels.get(&local_cid).map(|ch| ch.remote_cid) else {
            return;
        };

        self.last_id = self.next_id;
        self.next_id = if self.next_id == 255 { 1 } else { self.next_id + 1 };

        // All default options; nothing to negotiate from our side.
        let mut payload = [0u8; 4];
        payload[0..2].copy_from_slice(&remote_cid.to_le_bytes());
        self.send_command(
            net,
            SignalingCode::ConfigurationRequest,
            self.last_id,
            &payload,
        );

        if let Some(channel) = self.channels.get_mut(&local_cid) {
            channel.config_req_id = Some(self.last_id);
            channel.config.local_done = false;
        }
    }

    fn configuration_request(
        &mut self,
        net: &mut Scatternet,
        flags: u16,
        dcid: ChannelId,
        options: &[u8],
    ) {
        if !self.channels.contains_key(&dcid) {
            self.command_reject_cid(net, self.last_id, dcid, 0x0000);
            return;
        }

        let mut result = ConfigurationResult::Rejected;
        let mut echoed = Vec::new();
        let mut remote_cid = cid::NULL;
        if let Some(channel) = self.channels.get_mut(&dcid) {
            channel.config.remote_accepted = false;
            (result, echoed) = apply_config_options(channel, options);
            remote_cid = channel.remote_cid;
        }

        let mut payload: Vec<u8, MAX_SIGNALLING_PDU> = Vec::new();
        payload.extend_from_slice(&remote_cid.to_le_bytes()).ok();
        payload.extend_from_slice(&flags.to_le_bytes()).ok();
        payload
            .extend_from_slice(&(result as u16).to_le_bytes())
            .ok();
        payload.extend_from_slice(&echoed).ok();
        self.send_command(
            net,
            SignalingCode::ConfigurationResponse,
            self.last_id,
            &payload,
        );

        let accepted = result == ConfigurationResult::Success && flags == 0;
        let mut request_pending = false;
        if let Some(channel) = self.channels.get_mut(&dcid) {
            if accepted {
                channel.config.remote_accepted = true;
            }
            request_pending = !channel.config.local_done
                && channel.config.remote_accepted
                && channel.config_req_id.is_none();
        }
        if request_pending {
            self.send_configuration_request(net, dcid);
        }
    }

    /// Returns `true` when the response matches no request of ours
    fn configuration_response(
        &mut self,
        net: &mut Scatternet,
        result: u16,
        flags: u16,
        scid: ChannelId,
    ) -> bool {
        if !self.channels.contains_key(&scid) {
            self.command_reject_cid(net, self.last_id, scid, 0x0000);
            return false;
        }

        let mut stray = false;
        let mut retry = false;
        if let Some(channel) = self.channels.get_mut(&scid) {
            if channel.config_req_id != Some(self.last_id) {
                return true;
            }
            channel.config_req_id = None;

            if result == ConfigurationResult::Success as u16 {
                if flags == 0 {
                    channel.config.local_done = true;
                } else {
                    // Continuation: finish with an empty request.
                    retry = true;
                }
            } else {
                // The peer rewrote our options; retry until it is satisfied.
                retry = true;
            }
        } else {
            stray = true;
        }

        if retry {
            self.send_configuration_request(net, scid);
        }
        stray
    }

    fn information(&mut self, net: &mut Scatternet, requested: u16) {
        let mut data: Vec<u8, 4> = Vec::new();
        let result = match requested {
            info_type::CONNECTIONLESS_MTU => {
                data.extend_from_slice(&GROUP_MTU.to_le_bytes()).ok();
                info_result::SUCCESS
            }
            info_type::FEATURE_MASK => {
                // Flow control and Retransmission modes, receive side.
                data.extend_from_slice(&0x0000_0003u32.to_le_bytes()).ok();
                info_result::SUCCESS
            }
            _ => info_result::NOT_SUPPORTED,
        };

        let mut payload: Vec<u8, 8> = Vec::new();
        payload.extend_from_slice(&requested.to_le_bytes()).ok();
        payload.extend_from_slice(&result.to_le_bytes()).ok();
        payload.extend_from_slice(&data).ok();
        self.send_command(
            net,
            SignalingCode::InformationResponse,
            self.last_id,
            &payload,
        );
    }

    fn teardown(&mut self) {
        // Dropping the channels drops their services.
        self.channels.clear();
    }
}

/// Scan one configuration option list, correcting unacceptable values
///
/// The response echoes the peer's option bytes with every unacceptable value
/// rewritten to one the engine accepts, built in a fresh buffer. Scanning
/// stops at the first failing option.
fn apply_config_options(
    channel: &mut PeerChannel,
    options: &[u8],
) -> (ConfigurationResult, Vec<u8, MAX_SIGNALLING_PDU>) {
    let mut echoed: Vec<u8, MAX_SIGNALLING_PDU> = Vec::new();
    if echoed.extend_from_slice(options).is_err() {
        return (ConfigurationResult::Rejected, Vec::new());
    }

    let mut result = ConfigurationResult::Success;
    let mut at = 0usize;
    while at < echoed.len() {
        if echoed.len() - at < 2 {
            result = ConfigurationResult::Rejected;
            break;
        }
        let opt_type = echoed[at];
        let opt_len = usize::from(echoed[at + 1]);
        let value_at = at + 2;
        if echoed.len() - value_at < opt_len {
            result = ConfigurationResult::Rejected;
            break;
        }

        match opt_type & 0x7F {
            conf_opt::MTU => {
                if opt_len != 2 {
                    result = ConfigurationResult::Rejected;
                    break;
                }
                let mtu = u16::from_le_bytes([echoed[value_at], echoed[value_at + 1]]);
                if mtu < channel.min_mtu {
                    echoed[value_at..value_at + 2]
                        .copy_from_slice(&channel.min_mtu.to_le_bytes());
                    result = ConfigurationResult::UnacceptableParameters;
                } else {
                    channel.remote_mtu = mtu;
                }
            }

            conf_opt::FLUSH_TIMEOUT => {
                if opt_len != 2 {
                    result = ConfigurationResult::Rejected;
                    break;
                }
                let timeout = u16::from_le_bytes([echoed[value_at], echoed[value_at + 1]]);
                if timeout < 0x0001 {
                    echoed[value_at] = 0xFF;
                    echoed[value_at + 1] = 0xFF;
                    result = ConfigurationResult::UnacceptableParameters;
                }
            }

            conf_opt::QOS => {
                if opt_len != conf_opt::QOS_SIZE {
                    result = ConfigurationResult::Rejected;
                    break;
                }
                if echoed[value_at] != 0 {
                    echoed[value_at] = 0;
                    result = ConfigurationResult::UnacceptableParameters;
                }
                let service_type = echoed[value_at + 1];
                if service_type != conf_opt::QOS_BEST_EFFORT
                    && service_type != conf_opt::QOS_NO_TRAFFIC
                {
                    echoed[value_at + 1] = conf_opt::QOS_BEST_EFFORT;
                    result = ConfigurationResult::UnacceptableParameters;
                }
                if service_type != conf_opt::QOS_NO_TRAFFIC {
                    let rate_at = value_at + 2;
                    let token_rate = u32::from_le_bytes([
                        echoed[rate_at],
                        echoed[rate_at + 1],
                        echoed[rate_at + 2],
                        echoed[rate_at + 3],
                    ]);
                    if token_rate == conf_opt::QOS_WILDCARD {
                        echoed[rate_at..rate_at + 4]
                            .copy_from_slice(&0x0010_0000u32.to_le_bytes());
                    }
                    let bucket_at = value_at + 6;
                    let bucket = u32::from_le_bytes([
                        echoed[bucket_at],
                        echoed[bucket_at + 1],
                        echoed[bucket_at + 2],
                        echoed[bucket_at + 3],
                    ]);
                    if bucket == conf_opt::QOS_WILDCARD {
                        echoed[bucket_at..bucket_at + 4]
                            .copy_from_slice(&65500u32.to_le_bytes());
                    }
                    // Peak bandwidth, access latency and delay variation are
                    // correct to return as-is.
                }
            }

            conf_opt::RFC => {
                if opt_len != conf_opt::RFC_SIZE {
                    result = ConfigurationResult::Rejected;
                    break;
                }
                match ChannelMode::from_u8(echoed[value_at]) {
                    Some(ChannelMode::Basic) => {
                        // All other parameters shall be ignored.
                        channel.mode = ChannelMode::Basic;
                    }
                    Some(mode) => {
                        channel.mode = mode;
                        // Most parameters describe incoming traffic we accept
                        // at any rate; only the sizes matter.
                        let tx_window = echoed[value_at + 1];
                        if tx_window < 1 || tx_window > 32 {
                            echoed[value_at + 1] = 32;
                            result = ConfigurationResult::UnacceptableParameters;
                            break;
                        }
                        if echoed[value_at + 2] < 1 {
                            echoed[value_at + 2] = 1;
                            result = ConfigurationResult::UnacceptableParameters;
                            break;
                        }
                        let monitor =
                            u16::from_le_bytes([echoed[value_at + 5], echoed[value_at + 6]]);
                        if monitor < 30 {
                            echoed[value_at + 5..value_at + 7]
                                .copy_from_slice(&100u16.to_le_bytes());
                            result = ConfigurationResult::UnacceptableParameters;
                            break;
                        }
                        channel.monitor_timeout = monitor;
                        let mps = u16::from_le_bytes([echoed[value_at + 7], echoed[value_at + 8]]);
                        if mps < channel.min_mtu {
                            echoed[value_at + 7..value_at + 9]
                                .copy_from_slice(&channel.min_mtu.to_le_bytes());
                            result = ConfigurationResult::UnacceptableParameters;
                            break;
                        }
                        channel.mps = u32::from(mps);
                    }
                    None => {
                        result = ConfigurationResult::UnacceptableParameters;
                    }
                }
            }

            _ => {
                if opt_type & conf_opt::HINT == 0 {
                    result = ConfigurationResult::UnknownOptions;
                }
            }
        }

        if result != ConfigurationResult::Success {
            break;
        }
        at = value_at + opt_len;
    }

    (result, echoed)
}

/// An emulated L2CAP-rooted peer device
///
/// Comes with the SDP server registered on PSM 0x0001; further services are
/// added through [`Scatternet::register_psm`](crate::Scatternet::register_psm)
/// at construction time, before any link exists.
#[derive(Debug)]
pub struct L2capPeer {
    device: Device,
    registrations: Vec<PsmRegistration, MAX_PSM_REGISTRATIONS>,
    instances: Vec<L2capInstance, MAX_PEER_LINKS>,
}

impl L2capPeer {
    pub(crate) fn new(device: Device) -> Self {
        let mut peer = Self {
            device,
            registrations: Vec::new(),
            instances: Vec::new(),
        };
        peer.register_psm(psm::SDP, crate::sdp::MAX_PDU_OUT_SIZE as u16, PsmService::Sdp)
            .ok();
        peer
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

    /// Bind a service to a PSM
    ///
    /// # Errors
    /// Returns `BluetoothError::DuplicatePsm` when the PSM is already bound;
    /// wiring up the same PSM twice is a configuration error of the embedder
    /// and is never reported to a peer. `BluetoothError::RegistryFull` when
    /// the registration table is exhausted.
    pub fn register_psm(
        &mut self,
        psm: u16,
        min_mtu: u16,
        service: PsmService,
    ) -> Result<(), BluetoothError> {
        if self.registrations.iter().any(|r| r.psm == psm) {
            defmt::error!("[L2CAP] PSM {:04x} already registered", psm);
            return Err(BluetoothError::DuplicatePsm);
        }
        self.registrations
            .push(PsmRegistration {
                psm,
                min_mtu,
                service,
            })
            .map_err(|_| BluetoothError::RegistryFull)
    }

    pub(crate) fn handle_signal(&mut self, net: &mut Scatternet, signal: LmpSignal) {
        match signal {
            LmpSignal::ConnectionRequest { key } => {
                // We only get paged while page-scanning; always accept as
                // long as a link slot is free.
                let status = if self.instances.iter().any(|i| i.key == key) {
                    // One baseband link per device pair.
                    crate::hci::Status::AclConnectionExists.to_u8()
                } else if self
                    .instances
                    .push(L2capInstance::new(key, LinkRole::Peripheral))
                    .is_ok()
                {
                    0
                } else {
                    crate::hci::Status::RejectedLimitedResources.to_u8()
                };
                // Always at the end, so our bookkeeping is complete when the
                // central reacts.
                net.send_signal(key.central, LmpSignal::ConnectionComplete { key, status });
            }

            LmpSignal::ConnectionComplete { .. } => {
                // This device never pages anyone.
                defmt::warn!("[L2CAP] unexpected connection complete signal");
            }

            LmpSignal::DisconnectPeripheral { key, .. }
            | LmpSignal::DisconnectCentral { key, .. } => {
                if let Some(index) = self.instances.iter().position(|i| i.key == key) {
                    self.instances[index].teardown();
                    self.instances.swap_remove(index);
                } else {
                    defmt::warn!("[L2CAP] disconnect for unknown link");
                }
            }

            LmpSignal::AclData { key, start, data } => {
                let registrations = &self.registrations;
                let Some(instance) = self.instances.iter_mut().find(|i| i.key == key) else {
                    defmt::warn!("[L2CAP] ACL data for unknown link");
                    return;
                };
                instance.acl_in(net, registrations, start, &data);
            }

            LmpSignal::ModeChange { .. } => {
                // ACL mode is a baseband affair; nothing changes up here.
            }
        }
    }

    pub(crate) fn power_off(&mut self, net: &mut Scatternet) {
        for instance in &mut self.instances {
            instance.teardown();
            let reason = crate::hci::Status::RemotePowerOff.to_u8();
            net.send_signal(
                instance.key.central,
                LmpSignal::DisconnectCentral {
                    key: instance.key,
                    reason,
                },
            );
        }
        self.instances.clear();
    }
}
