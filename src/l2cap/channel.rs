//! L2CAP Channel State
//!
//! A connection-oriented channel with the configuration state machine
//! collapsed onto two bits: one for "our configuration request was accepted"
//! and one for "we accepted the peer's". The channel is open exactly when
//! both are set; this engine never renegotiates an open channel, so no other
//! states can occur.

use super::packet::{ChannelId, DEFAULT_MTU, MIN_MTU};
use crate::constants::L2CAP_SDU_BUFFER_SIZE;
use heapless::Vec;

/// Maximum number of dynamically allocated channels per L2CAP instance
pub const MAX_L2CAP_CHANNELS: usize = 8;

/// Channel operating mode negotiated through the RFC configuration option
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
#[repr(u8)]
pub enum ChannelMode {
    /// Basic L2CAP mode
    Basic = 0x00,
    /// Retransmission mode
    Retransmission = 0x01,
    /// Flow control mode
    FlowControl = 0x02,
}

impl ChannelMode {
    /// Convert from the raw RFC option mode byte
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Basic),
            0x01 => Some(Self::Retransmission),
            0x02 => Some(Self::FlowControl),
            _ => None,
        }
    }
}

/// Configuration progress of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, defmt::Format)]
pub struct ConfigFlags {
    /// The peer accepted our configuration request
    pub local_done: bool,
    /// We accepted the peer's configuration request
    pub remote_accepted: bool,
}

impl ConfigFlags {
    /// Whether the channel is open for user data
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.local_done && self.remote_accepted
    }
}

/// One dynamically allocated connection-oriented channel
#[derive(Debug)]
pub struct Channel<S> {
    /// The peer's identifier for this channel
    pub remote_cid: ChannelId,
    /// Outgoing MTU negotiated with the peer
    pub remote_mtu: u16,
    /// Smallest MTU the bound service tolerates
    pub min_mtu: u16,
    /// Largest PDU accepted on the receive path
    pub mps: u32,
    /// Negotiated operating mode
    pub mode: ChannelMode,
    /// Identifier of our in-flight configuration request, if any
    pub config_req_id: Option<u8>,
    /// Two-bit configuration progress
    pub config: ConfigFlags,
    /// Monitor timeout from the RFC option, in milliseconds
    pub monitor_timeout: u16,
    /// Retransmission-disabled bit last seen from the peer
    pub rexmit: bool,
    /// Service bound to the channel
    pub service: S,
    sdu: Vec<u8, L2CAP_SDU_BUFFER_SIZE>,
    sdu_total: usize,
}

impl<S> Channel<S> {
    /// Create a channel accepted from a peer's Connection Request
    #[must_use]
    pub fn new(remote_cid: ChannelId, min_mtu: u16, service: S) -> Self {
        let min_mtu = min_mtu.max(MIN_MTU);
        Self {
            remote_cid,
            remote_mtu: min_mtu.max(DEFAULT_MTU),
            min_mtu,
            mps: 65536,
            mode: ChannelMode::Basic,
            config_req_id: None,
            config: ConfigFlags::default(),
            monitor_timeout: 0,
            rexmit: false,
            service,
            sdu: Vec::new(),
            sdu_total: 0,
        }
    }

    /// Whether segmented-SDU reassembly is in progress
    #[must_use]
    pub fn sar_in_progress(&self) -> bool {
        self.sdu_total != 0
    }

    /// Begin reassembling a segmented SDU of `total` bytes
    ///
    /// Returns `false` when the announced SDU exceeds the reassembly buffer.
    pub fn sar_start(&mut self, total: usize, first: &[u8]) -> bool {
        if total > L2CAP_SDU_BUFFER_SIZE || first.len() > total {
            return false;
        }
        self.sdu.clear();
        self.sdu.extend_from_slice(first).ok();
        self.sdu_total = total;
        true
    }

    /// Append a continuation segment
    ///
    /// Returns `false` when the segment does not fit the announced length.
    pub fn sar_continue(&mut self, segment: &[u8]) -> bool {
        if self.sdu.len() + segment.len() >= self.sdu_total {
            return false;
        }
        self.sdu.extend_from_slice(segment).ok();
        true
    }

    /// Append the final segment and return the complete SDU
    ///
    /// A final segment may overshoot the announced length; only the
    /// announced bytes are delivered.
    pub fn sar_end(&mut self, segment: &[u8]) -> Option<&[u8]> {
        let total = self.sdu_total;
        if self.sdu.len() + segment.len() < total
            || self.sdu.len() + segment.len() > L2CAP_SDU_BUFFER_SIZE
        {
            return None;
        }
        self.sdu.extend_from_slice(segment).ok();
        self.sdu_total = 0;
        Some(&self.sdu[..total])
    }

    /// Drop any partially reassembled SDU
    pub fn sar_reset(&mut self) {
        self.sdu.clear();
        self.sdu_total = 0;
    }

    /// Bytes of the announced SDU received so far
    #[must_use]
    pub fn sar_received(&self) -> usize {
        self.sdu.len()
    }

    /// Announced length of the SDU being reassembled
    #[must_use]
    pub fn sar_total(&self) -> usize {
        self.sdu_total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_channel_defaults() {
        let ch: Channel<()> = Channel::new(0x0040, 0, ());
        assert_eq!(ch.min_mtu, MIN_MTU);
        assert_eq!(ch.remote_mtu, DEFAULT_MTU);
        assert_eq!(ch.mode, ChannelMode::Basic);
        assert!(!ch.config.is_open());
    }

    #[test]
    fn test_min_mtu_floor_carries_into_remote_mtu() {
        let ch: Channel<()> = Channel::new(0x0040, 800, ());
        assert_eq!(ch.min_mtu, 800);
        assert_eq!(ch.remote_mtu, 800);
    }

    #[test]
    fn test_open_requires_both_flags() {
        let mut flags = ConfigFlags::default();
        assert!(!flags.is_open());
        flags.local_done = true;
        assert!(!flags.is_open());
        flags.remote_accepted = true;
        assert!(flags.is_open());
    }

    #[test]
    fn test_sar_assembly() {
        let mut ch: Channel<()> = Channel::new(0x0040, 48, ());

        assert!(ch.sar_start(10, b"hell"));
        assert!(ch.sar_in_progress());
        assert!(ch.sar_continue(b"o wo"));
        let sdu = ch.sar_end(b"rl").unwrap();
        assert_eq!(sdu, b"hello worl");
        assert!(!ch.sar_in_progress());
    }

    #[test]
    fn test_sar_rejects_overfull_continuation() {
        let mut ch: Channel<()> = Channel::new(0x0040, 48, ());
        assert!(ch.sar_start(4, b"ab"));
        // A continuation that would already complete the SDU is an error;
        // completion must come through the end segment.
        assert!(!ch.sar_continue(b"cd"));
    }

    #[test]
    fn test_sar_reset_allows_new_sdu() {
        let mut ch: Channel<()> = Channel::new(0x0040, 48, ());
        assert!(ch.sar_start(8, b"abc"));
        ch.sar_reset();
        assert!(!ch.sar_in_progress());
        assert!(ch.sar_start(3, b"xy"));
        assert_eq!(ch.sar_end(b"z").unwrap(), b"xyz");
    }
}
