//! Device, Link and Scatternet Model
//!
//! A [`Scatternet`] owns every emulated device in a slot arena and mediates
//! all interaction between them. Devices never hold references to each other;
//! the link layer between two devices is an explicit [`LmpSignal`] queue that
//! the scatternet drains run-to-completion before any entry point returns.
//! This replaces the usual callback web of a native stack and guarantees that
//! completion notifications are always delivered after the initiating
//! device's bookkeeping has finished.
//!
//! Time is virtual: the embedder calls [`Scatternet::advance`] and armed
//! timers re-enter the engines exactly like another packet arriving.

use crate::{
    BluetoothAddress, BluetoothError, ClassOfDevice, DeviceOptions,
    clock::{Duration, Instant},
    constants::{MAX_DEVICES, MAX_DEVICE_NAME_LENGTH, MAX_TIMERS, SIGNAL_QUEUE_DEPTH},
    hci::{AclPacket, EventPacket, HciController},
    l2cap::engine::L2capPeer,
};
use heapless::{Deque, String, Vec};

/// Index of a device slot within its scatternet
pub type DeviceId = usize;

/// Role of a device on one ACL link
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum LinkRole {
    /// The paging side; owns the link policy
    Central,
    /// The page-scanning side
    Peripheral,
}

/// ACL link mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
#[repr(u8)]
pub enum AclMode {
    /// Normal operation
    Active = 0x00,
    /// Hold mode, auto-reverts to active
    Hold = 0x01,
    /// Sniff mode (never entered by this engine)
    Sniff = 0x02,
    /// Park state, exited via Exit Park Mode or timer expiry
    Park = 0x03,
}

/// Identity of one baseband link: the pair of devices it connects
///
/// There is at most one ACL link between any two devices, so the ordered
/// pair is a complete key on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub struct LinkKey {
    /// The device that paged
    pub central: DeviceId,
    /// The device that page-scanned
    pub peripheral: DeviceId,
}

impl LinkKey {
    /// The far end of the link as seen from `local`
    #[must_use]
    pub fn peer_of(&self, local: DeviceId) -> DeviceId {
        if self.central == local {
            self.peripheral
        } else {
            self.central
        }
    }

    /// The role `local` plays on this link
    #[must_use]
    pub fn role_of(&self, local: DeviceId) -> LinkRole {
        if self.central == local {
            LinkRole::Central
        } else {
            LinkRole::Peripheral
        }
    }
}

/// Link-layer traffic between two scatternet devices
///
/// Each variant corresponds to one of the LMP-level notifications devices
/// exchange. Reasons and statuses travel inside the signal rather than
/// through shared device state.
#[derive(Debug, Clone)]
pub enum LmpSignal {
    /// A central pages the target device
    ConnectionRequest {
        /// Link being established
        key: LinkKey,
    },
    /// The peripheral answered a page; 0 means accepted, anything else is
    /// the rejection reason
    ConnectionComplete {
        /// Link that was being established
        key: LinkKey,
        /// HCI status code
        status: u8,
    },
    /// The central tears the link down; target is the peripheral
    DisconnectPeripheral {
        /// Link being torn down
        key: LinkKey,
        /// HCI reason code
        reason: u8,
    },
    /// The peripheral tears the link down; target is the central
    DisconnectCentral {
        /// Link being torn down
        key: LinkKey,
        /// HCI reason code
        reason: u8,
    },
    /// One ACL fragment crossing the link
    AclData {
        /// Link carrying the data
        key: LinkKey,
        /// Whether this fragment starts a new L2CAP PDU
        start: bool,
        /// Fragment payload
        data: Vec<u8, { crate::constants::ACL_FRAGMENT_SIZE }>,
    },
    /// The central changed the ACL mode of the link
    ModeChange {
        /// Affected link
        key: LinkKey,
        /// New mode
        mode: AclMode,
        /// Mode interval in baseband slots
        interval: u16,
    },
}

/// Timer classes a device can arm on the scatternet clock
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum TimerKind {
    /// Inquiry window expiry
    InquiryDone,
    /// Next periodic inquiry round
    InquiryNext,
    /// Connection Accept Timeout
    ConnAcceptTimeout,
    /// ACL mode auto-revert for one connection handle
    AclModeExpiry {
        /// Handle whose mode expires
        handle: u16,
    },
}

#[derive(Debug)]
struct TimerEntry {
    deadline: Instant,
    device: DeviceId,
    kind: TimerKind,
    seq: u64,
}

/// Shared identity and baseband state of one scatternet member
#[derive(Debug)]
pub struct Device {
    /// Slot index within the owning scatternet
    pub id: DeviceId,
    /// Device address
    pub bd_addr: BluetoothAddress,
    /// Class of Device reported in inquiry results and connection requests
    pub class_of_device: ClassOfDevice,
    /// LMP feature bitmap
    pub lmp_features: u64,
    /// Human-readable device name, if any
    pub name: Option<String<MAX_DEVICE_NAME_LENGTH>>,
    /// Whether the device answers inquiries
    pub inquiry_scan: bool,
    /// Whether the device answers pages
    pub page_scan: bool,
    /// Clock offset reported to inquirers
    pub clock_offset: u16,
}

impl Device {
    pub(crate) fn new(id: DeviceId, bd_addr: BluetoothAddress, options: &DeviceOptions) -> Self {
        let name = if options.name.is_empty() {
            None
        } else {
            String::try_from(options.name).ok()
        };
        Self {
            id,
            bd_addr,
            class_of_device: options.class_of_device,
            lmp_features: crate::constants::LOCAL_LMP_FEATURES,
            name,
            inquiry_scan: options.inquiry_scan,
            page_scan: options.page_scan,
            clock_offset: 0x3333,
        }
    }
}

/// One scatternet member, dispatched by kind
///
/// Peer devices implement only the subset of link-layer notifications that
/// can reach them; the enum keeps that shape with static dispatch.
#[derive(Debug)]
pub enum DeviceSlot {
    /// An emulated controller driven by a host over HCI
    Controller(HciController),
    /// An emulated L2CAP-rooted peer (SDP server and registered services)
    Peer(L2capPeer),
}

impl DeviceSlot {
    /// Shared device state
    #[must_use]
    pub fn device(&self) -> &Device {
        match self {
            Self::Controller(c) => c.device(),
            Self::Peer(p) => p.device(),
        }
    }

    /// Shared device state, mutable
    pub fn device_mut(&mut self) -> &mut Device {
        match self {
            Self::Controller(c) => c.device_mut(),
            Self::Peer(p) => p.device_mut(),
        }
    }

    fn handle_signal(&mut self, net: &mut Scatternet, signal: LmpSignal) {
        match self {
            Self::Controller(c) => c.handle_signal(net, signal),
            Self::Peer(p) => p.handle_signal(net, signal),
        }
    }

    fn handle_timer(&mut self, net: &mut Scatternet, kind: TimerKind) {
        match self {
            Self::Controller(c) => c.handle_timer(net, kind),
            Self::Peer(p) => {
                defmt::debug!("[NET] spurious timer {:?} for peer device", kind);
                let _ = p;
            }
        }
    }

    fn prepare_remove(&mut self, net: &mut Scatternet) {
        match self {
            Self::Controller(c) => c.power_off(net),
            Self::Peer(p) => p.power_off(net),
        }
    }
}

/// The set of devices that can hear each other
///
/// Owns the device arena, the virtual clock, the timer table and the pending
/// link-layer signal queue. All public entry points are run-to-completion:
/// every nested notification and event emission settles before they return.
#[derive(Debug)]
pub struct Scatternet {
    slots: Vec<Option<DeviceSlot>, MAX_DEVICES>,
    next_index: u32,
    now: Instant,
    timers: Vec<TimerEntry, MAX_TIMERS>,
    timer_seq: u64,
    signals: Deque<(DeviceId, LmpSignal), SIGNAL_QUEUE_DEPTH>,
}

impl Scatternet {
    /// Create an empty scatternet with its clock at zero
    #[must_use]
    pub fn new() -> Self {
        let mut slots = Vec::new();
        for _ in 0..MAX_DEVICES {
            slots.push(None).ok();
        }
        Self {
            slots,
            next_index: 0,
            now: Instant::ZERO,
            timers: Vec::new(),
            timer_seq: 0,
            signals: Deque::new(),
        }
    }

    /// Current virtual time
    #[must_use]
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Add an emulated controller to the scatternet
    ///
    /// # Errors
    /// Returns `BluetoothError::TooManyDevices` if every slot is occupied.
    pub fn add_controller(&mut self) -> Result<DeviceId, BluetoothError> {
        let (id, addr) = self.claim_slot()?;
        let controller = HciController::new(Device::new(id, addr, &DeviceOptions::default()));
        self.slots[id] = Some(DeviceSlot::Controller(controller));
        Ok(id)
    }

    /// Add an emulated L2CAP peer device to the scatternet
    ///
    /// The peer comes with the SDP server registered on PSM 0x0001.
    ///
    /// # Errors
    /// Returns `BluetoothError::TooManyDevices` if every slot is occupied.
    pub fn add_peer(&mut self, options: DeviceOptions) -> Result<DeviceId, BluetoothError> {
        let (id, addr) = self.claim_slot()?;
        let peer = L2capPeer::new(Device::new(id, addr, &options));
        self.slots[id] = Some(DeviceSlot::Peer(peer));
        Ok(id)
    }

    /// Remove a device, disconnecting every live link first
    ///
    /// A controller with a pending inbound connection request rejects it with
    /// the power-off reason before disappearing.
    ///
    /// # Errors
    /// Returns `BluetoothError::InvalidDevice` for an empty slot.
    pub fn remove_device(&mut self, id: DeviceId) -> Result<(), BluetoothError> {
        self.with_slot(id, |slot, net| slot.prepare_remove(net))?;
        self.drain_signals();
        self.timers.retain(|t| t.device != id);
        self.slots[id] = None;
        Ok(())
    }

    /// Shared device state for one slot
    #[must_use]
    pub fn device_info(&self, id: DeviceId) -> Option<&Device> {
        self.slots.get(id)?.as_ref().map(DeviceSlot::device)
    }

    /// Number of slots in the arena (some may be empty)
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Bind a service to a PSM on a peer device
    ///
    /// Services are wired up once, at device-construction time, before any
    /// link exists.
    ///
    /// # Errors
    /// Returns `BluetoothError::InvalidDevice` if the slot does not hold a
    /// peer, `BluetoothError::DuplicatePsm` if the PSM is already bound, or
    /// `BluetoothError::RegistryFull` if the registration table is full.
    pub fn register_psm(
        &mut self,
        id: DeviceId,
        psm: u16,
        min_mtu: u16,
        service: crate::l2cap::PsmService,
    ) -> Result<(), BluetoothError> {
        match self.slots.get_mut(id).and_then(Option::as_mut) {
            Some(DeviceSlot::Peer(peer)) => peer.register_psm(psm, min_mtu, service),
            _ => Err(BluetoothError::InvalidDevice),
        }
    }

    /// Submit an HCI command packet to a controller
    ///
    /// # Errors
    /// Returns `BluetoothError::InvalidDevice` if the slot does not hold a
    /// controller. Protocol errors are reported in-band as HCI events.
    pub fn hci_command(&mut self, id: DeviceId, packet: &[u8]) -> Result<(), BluetoothError> {
        self.with_controller(id, |c, net| c.submit_command(net, packet))?;
        self.drain_signals();
        Ok(())
    }

    /// Submit an HCI ACL data packet to a controller
    ///
    /// # Errors
    /// Returns `BluetoothError::InvalidDevice` if the slot does not hold a
    /// controller.
    pub fn hci_acl(&mut self, id: DeviceId, packet: &[u8]) -> Result<(), BluetoothError> {
        self.with_controller(id, |c, net| c.submit_acl(net, packet))?;
        self.drain_signals();
        Ok(())
    }

    /// Submit an HCI SCO data packet to a controller
    ///
    /// # Errors
    /// Returns `BluetoothError::InvalidDevice` if the slot does not hold a
    /// controller.
    pub fn hci_sco(&mut self, id: DeviceId, packet: &[u8]) -> Result<(), BluetoothError> {
        self.with_controller(id, |c, _net| c.submit_sco(packet))?;
        self.drain_signals();
        Ok(())
    }

    /// One-shot hardware address override for a controller
    ///
    /// # Errors
    /// Returns `BluetoothError::InvalidDevice` if the slot does not hold a
    /// controller.
    pub fn set_bdaddr(
        &mut self,
        id: DeviceId,
        bd_addr: BluetoothAddress,
    ) -> Result<(), BluetoothError> {
        self.with_controller(id, |c, _net| c.device_mut().bd_addr = bd_addr)
    }

    /// Take the next pending controller-to-host event packet
    #[must_use]
    pub fn poll_event(&mut self, id: DeviceId) -> Option<EventPacket> {
        match self.slots.get_mut(id)?.as_mut()? {
            DeviceSlot::Controller(c) => c.pop_event(),
            DeviceSlot::Peer(_) => None,
        }
    }

    /// Take the next pending controller-to-host ACL data packet
    #[must_use]
    pub fn poll_acl(&mut self, id: DeviceId) -> Option<AclPacket> {
        match self.slots.get_mut(id)?.as_mut()? {
            DeviceSlot::Controller(c) => c.pop_acl(),
            DeviceSlot::Peer(_) => None,
        }
    }

    /// Advance the virtual clock, firing every timer that becomes due
    ///
    /// Timers fire in deadline order and re-enter the engines exactly like
    /// inbound packets, including any cascade of signals they trigger.
    pub fn advance(&mut self, duration: Duration) {
        let target = self.now + duration;

        loop {
            let due = self
                .timers
                .iter()
                .enumerate()
                .filter(|(_, t)| t.deadline <= target)
                .min_by_key(|(_, t)| (t.deadline, t.seq))
                .map(|(i, _)| i);
            let Some(index) = due else { break };

            let entry = self.timers.swap_remove(index);
            if entry.deadline > self.now {
                self.now = entry.deadline;
            }
            let _ = self.with_slot(entry.device, |slot, net| {
                slot.handle_timer(net, entry.kind);
            });
            self.drain_signals();
        }

        self.now = target;
    }

    /// Arm (or re-arm) a timer for a device
    pub(crate) fn set_timer(&mut self, device: DeviceId, kind: TimerKind, deadline: Instant) {
        self.cancel_timer(device, kind);
        let seq = self.timer_seq;
        self.timer_seq += 1;
        if self
            .timers
            .push(TimerEntry {
                deadline,
                device,
                kind,
                seq,
            })
            .is_err()
        {
            defmt::error!("[NET] timer table full, dropping {:?}", kind);
        }
    }

    /// Disarm a timer if it is armed
    pub(crate) fn cancel_timer(&mut self, device: DeviceId, kind: TimerKind) {
        self.timers.retain(|t| t.device != device || t.kind != kind);
    }

    /// Queue a link-layer signal for another device
    pub(crate) fn send_signal(&mut self, target: DeviceId, signal: LmpSignal) {
        if self.signals.push_back((target, signal)).is_err() {
            defmt::error!("[NET] signal queue full, dropping signal");
        }
    }

    /// Find a page-scanning device by address
    pub(crate) fn find_page_scan(&self, bd_addr: BluetoothAddress) -> Option<DeviceId> {
        (0..self.slots.len()).find(|&id| {
            self.device_info(id)
                .is_some_and(|d| d.page_scan && d.bd_addr == bd_addr)
        })
    }

    fn claim_slot(&mut self) -> Result<(DeviceId, BluetoothAddress), BluetoothError> {
        let id = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(BluetoothError::TooManyDevices)?;
        let addr = BluetoothAddress::from_index(self.next_index);
        self.next_index += 1;
        Ok((id, addr))
    }

    fn with_slot<R>(
        &mut self,
        id: DeviceId,
        f: impl FnOnce(&mut DeviceSlot, &mut Scatternet) -> R,
    ) -> Result<R, BluetoothError> {
        let mut slot = self
            .slots
            .get_mut(id)
            .and_then(Option::take)
            .ok_or(BluetoothError::InvalidDevice)?;
        let result = f(&mut slot, self);
        self.slots[id] = Some(slot);
        Ok(result)
    }

    fn with_controller<R>(
        &mut self,
        id: DeviceId,
        f: impl FnOnce(&mut HciController, &mut Scatternet) -> R,
    ) -> Result<R, BluetoothError> {
        self.with_slot(id, |slot, net| match slot {
            DeviceSlot::Controller(c) => Ok(f(c, net)),
            DeviceSlot::Peer(_) => Err(BluetoothError::InvalidDevice),
        })?
    }

    fn drain_signals(&mut self) {
        while let Some((target, signal)) = self.signals.pop_front() {
            if self
                .with_slot(target, |slot, net| slot.handle_signal(net, signal))
                .is_err()
            {
                defmt::warn!("[NET] dropping signal for vanished device {}", target);
            }
        }
    }
}

impl Default for Scatternet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_arena_assigns_unique_addresses() {
        let mut net = Scatternet::new();
        let a = net.add_controller().unwrap();
        let b = net.add_peer(DeviceOptions::default()).unwrap();

        let addr_a = net.device_info(a).unwrap().bd_addr;
        let addr_b = net.device_info(b).unwrap().bd_addr;
        assert_ne!(addr_a, addr_b);
    }

    #[test]
    fn test_removed_slot_is_reusable() {
        let mut net = Scatternet::new();
        let a = net.add_controller().unwrap();
        net.remove_device(a).unwrap();
        assert!(net.device_info(a).is_none());

        let b = net.add_controller().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_capacity_limit() {
        let mut net = Scatternet::new();
        for _ in 0..MAX_DEVICES {
            net.add_peer(DeviceOptions::default()).unwrap();
        }
        assert_eq!(
            net.add_controller().unwrap_err(),
            BluetoothError::TooManyDevices
        );
    }

    #[test]
    fn test_link_key_orientation() {
        let key = LinkKey {
            central: 0,
            peripheral: 2,
        };
        assert_eq!(key.role_of(0), LinkRole::Central);
        assert_eq!(key.role_of(2), LinkRole::Peripheral);
        assert_eq!(key.peer_of(0), 2);
        assert_eq!(key.peer_of(2), 0);
    }

    #[test]
    fn test_clock_advances_monotonically() {
        let mut net = Scatternet::new();
        assert_eq!(net.now(), Instant::ZERO);
        net.advance(Duration::from_millis(10));
        net.advance(Duration::from_millis(5));
        assert_eq!(net.now().as_micros(), 15_000);
    }

    #[test]
    fn test_hci_entry_points_reject_peer_slots() {
        let mut net = Scatternet::new();
        let peer = net.add_peer(DeviceOptions::default()).unwrap();
        assert_eq!(
            net.hci_command(peer, &[0x03, 0x0C, 0x00]).unwrap_err(),
            BluetoothError::InvalidDevice
        );
        assert!(net.poll_event(peer).is_none());
    }
}
