//! L2CAP Signaling Protocol
//!
//! Codecs for the signalling-channel command set: Command Reject, Connection
//! Request/Response, Configuration Request/Response, Disconnection
//! Request/Response, Echo and Information exchanges, as defined in the
//! Bluetooth Core Specification.

use super::packet::{ChannelId, L2capError, ProtocolServiceMultiplexer};
use heapless::Vec;

/// L2CAP Signaling Command Codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
#[repr(u8)]
pub enum SignalingCode {
    /// Command Reject
    CommandReject = 0x01,
    /// Connection Request
    ConnectionRequest = 0x02,
    /// Connection Response
    ConnectionResponse = 0x03,
    /// Configuration Request
    ConfigurationRequest = 0x04,
    /// Configuration Response
    ConfigurationResponse = 0x05,
    /// Disconnection Request
    DisconnectionRequest = 0x06,
    /// Disconnection Response
    DisconnectionResponse = 0x07,
    /// Echo Request
    EchoRequest = 0x08,
    /// Echo Response
    EchoResponse = 0x09,
    /// Information Request
    InformationRequest = 0x0A,
    /// Information Response
    InformationResponse = 0x0B,
}

impl SignalingCode {
    /// Convert from raw byte value
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::CommandReject),
            0x02 => Some(Self::ConnectionRequest),
            0x03 => Some(Self::ConnectionResponse),
            0x04 => Some(Self::ConfigurationRequest),
            0x05 => Some(Self::ConfigurationResponse),
            0x06 => Some(Self::DisconnectionRequest),
            0x07 => Some(Self::DisconnectionResponse),
            0x08 => Some(Self::EchoRequest),
            0x09 => Some(Self::EchoResponse),
            0x0A => Some(Self::InformationRequest),
            0x0B => Some(Self::InformationResponse),
            _ => None,
        }
    }
}

/// L2CAP Signaling Command Header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalingHeader {
    /// Raw command code (kept raw so unknown codes can be rejected)
    pub code: u8,
    /// Command identifier matching requests to responses
    pub identifier: u8,
    /// Length of the command payload
    pub length: u16,
}

impl SignalingHeader {
    /// Size of signaling header in bytes
    pub const SIZE: usize = 4;

    /// Create a new signaling header
    #[must_use]
    pub fn new(code: SignalingCode, identifier: u8, length: u16) -> Self {
        Self {
            code: code as u8,
            identifier,
            length,
        }
    }

    /// Parse signaling header from bytes
    ///
    /// # Errors
    /// Returns `L2capError::InsufficientData` if not enough bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, L2capError> {
        if bytes.len() < Self::SIZE {
            return Err(L2capError::InsufficientData);
        }
        Ok(Self {
            code: bytes[0],
            identifier: bytes[1],
            length: u16::from_le_bytes([bytes[2], bytes[3]]),
        })
    }

    /// Convert header to bytes
    #[must_use]
    pub fn to_bytes(self) -> [u8; 4] {
        let mut bytes = [0u8; 4];
        bytes[0] = self.code;
        bytes[1] = self.identifier;
        bytes[2..4].copy_from_slice(&self.length.to_le_bytes());
        bytes
    }
}

/// Command Reject reasons
pub mod reject_reason {
    /// Command not understood
    pub const CMD_NOT_UNDERSTOOD: u16 = 0x0000;
    /// Signalling MTU exceeded
    pub const MTU_EXCEEDED: u16 = 0x0001;
    /// Invalid CID in request
    pub const CID_INVALID: u16 = 0x0002;
}

/// Connection Response result codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
#[repr(u16)]
pub enum ConnectionResult {
    /// Connection successful
    Success = 0x0000,
    /// Connection pending
    Pending = 0x0001,
    /// Connection refused, PSM not supported
    PsmNotSupported = 0x0002,
    /// Connection refused, security block
    SecurityBlock = 0x0003,
    /// Connection refused, no resources available
    NoResources = 0x0004,
}

/// Configuration Response result codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
#[repr(u16)]
pub enum ConfigurationResult {
    /// Success
    Success = 0x0000,
    /// Failure, unacceptable parameters (corrected values attached)
    UnacceptableParameters = 0x0001,
    /// Failure, rejected without explanation
    Rejected = 0x0002,
    /// Failure, unknown options
    UnknownOptions = 0x0003,
}

impl ConfigurationResult {
    /// Convert from raw u16 value
    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0000 => Some(Self::Success),
            0x0001 => Some(Self::UnacceptableParameters),
            0x0002 => Some(Self::Rejected),
            0x0003 => Some(Self::UnknownOptions),
            _ => None,
        }
    }
}

/// Information Request/Response types
pub mod info_type {
    /// Connection-less MTU
    pub const CONNECTIONLESS_MTU: u16 = 0x0001;
    /// Extended features mask
    pub const FEATURE_MASK: u16 = 0x0002;
}

/// Information Response results
pub mod info_result {
    /// Requested information available
    pub const SUCCESS: u16 = 0x0000;
    /// Requested information not supported
    pub const NOT_SUPPORTED: u16 = 0x0001;
}

/// Configuration option types
pub mod conf_opt {
    /// Maximum Transmission Unit
    pub const MTU: u8 = 0x01;
    /// Flush timeout
    pub const FLUSH_TIMEOUT: u8 = 0x02;
    /// Quality of Service
    pub const QOS: u8 = 0x03;
    /// Retransmission and Flow Control
    pub const RFC: u8 = 0x04;
    /// Hint bit: option may be ignored when unknown
    pub const HINT: u8 = 0x80;

    /// Size of the QoS option payload
    pub const QOS_SIZE: usize = 22;
    /// Size of the RFC option payload
    pub const RFC_SIZE: usize = 9;
    /// QoS wildcard value for token rate and bucket size
    pub const QOS_WILDCARD: u32 = 0xFFFF_FFFF;
    /// QoS service type: no traffic
    pub const QOS_NO_TRAFFIC: u8 = 0x00;
    /// QoS service type: best effort
    pub const QOS_BEST_EFFORT: u8 = 0x01;
}

/// L2CAP Connection Request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionRequest {
    /// Protocol Service Multiplexer the channel is for
    pub psm: ProtocolServiceMultiplexer,
    /// Requester's channel identifier
    pub source_cid: ChannelId,
}

impl ConnectionRequest {
    /// Size in bytes
    pub const SIZE: usize = 4;

    /// Parse from bytes
    ///
    /// # Errors
    /// Returns `L2capError::InsufficientData` if not enough bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, L2capError> {
        if bytes.len() < Self::SIZE {
            return Err(L2capError::InsufficientData);
        }
        Ok(Self {
            psm: u16::from_le_bytes([bytes[0], bytes[1]]),
            source_cid: u16::from_le_bytes([bytes[2], bytes[3]]),
        })
    }

    /// Convert to bytes
    #[must_use]
    pub fn to_bytes(self) -> [u8; 4] {
        let mut bytes = [0u8; 4];
        bytes[0..2].copy_from_slice(&self.psm.to_le_bytes());
        bytes[2..4].copy_from_slice(&self.source_cid.to_le_bytes());
        bytes
    }
}

/// L2CAP Connection Response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionResponse {
    /// Responder's channel identifier
    pub destination_cid: ChannelId,
    /// Requester's channel identifier, echoed
    pub source_cid: ChannelId,
    /// Connection result
    pub result: ConnectionResult,
    /// Connection status (only meaningful for pending results)
    pub status: u16,
}

impl ConnectionResponse {
    /// Size in bytes
    pub const SIZE: usize = 8;

    /// Convert to bytes
    #[must_use]
    pub fn to_bytes(self) -> [u8; 8] {
        let mut bytes = [0u8; 8];
        bytes[0..2].copy_from_slice(&self.destination_cid.to_le_bytes());
        bytes[2..4].copy_from_slice(&self.source_cid.to_le_bytes());
        bytes[4..6].copy_from_slice(&(self.result as u16).to_le_bytes());
        bytes[6..8].copy_from_slice(&self.status.to_le_bytes());
        bytes
    }
}

/// L2CAP Configuration Request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationRequest<const N: usize = 64> {
    /// Responder's channel identifier
    pub destination_cid: ChannelId,
    /// Continuation flags
    pub flags: u16,
    /// Raw configuration option bytes
    pub options: Vec<u8, N>,
}

impl<const N: usize> ConfigurationRequest<N> {
    /// Minimum size in bytes (without options)
    pub const MIN_SIZE: usize = 4;

    /// Parse from bytes
    ///
    /// # Errors
    /// Returns `L2capError` if not enough bytes or the options overflow `N`
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, L2capError> {
        if bytes.len() < Self::MIN_SIZE {
            return Err(L2capError::InsufficientData);
        }
        let mut options = Vec::new();
        options
            .extend_from_slice(&bytes[4..])
            .map_err(|()| L2capError::PayloadTooLarge)?;
        Ok(Self {
            destination_cid: u16::from_le_bytes([bytes[0], bytes[1]]),
            flags: u16::from_le_bytes([bytes[2], bytes[3]]),
            options,
        })
    }

    /// Convert to bytes
    ///
    /// # Errors
    /// Returns `L2capError::PayloadTooLarge` if the result overflows the buffer
    pub fn to_bytes<const M: usize>(&self) -> Result<Vec<u8, M>, L2capError> {
        let mut bytes = Vec::new();
        bytes
            .extend_from_slice(&self.destination_cid.to_le_bytes())
            .map_err(|()| L2capError::PayloadTooLarge)?;
        bytes
            .extend_from_slice(&self.flags.to_le_bytes())
            .map_err(|()| L2capError::PayloadTooLarge)?;
        bytes
            .extend_from_slice(&self.options)
            .map_err(|()| L2capError::PayloadTooLarge)?;
        Ok(bytes)
    }
}

/// L2CAP Configuration Response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationResponse<const N: usize = 64> {
    /// Requester's channel identifier, echoed
    pub source_cid: ChannelId,
    /// Continuation flags
    pub flags: u16,
    /// Configuration result
    pub result: ConfigurationResult,
    /// Option bytes, possibly rewritten to acceptable values
    pub options: Vec<u8, N>,
}

impl<const N: usize> ConfigurationResponse<N> {
    /// Minimum size in bytes (without options)
    pub const MIN_SIZE: usize = 6;

    /// Parse from bytes
    ///
    /// # Errors
    /// Returns `L2capError` if not enough bytes, an unknown result code, or
    /// the options overflow `N`
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, L2capError> {
        if bytes.len() < Self::MIN_SIZE {
            return Err(L2capError::InsufficientData);
        }
        let result = ConfigurationResult::from_u16(u16::from_le_bytes([bytes[4], bytes[5]]))
            .ok_or(L2capError::InsufficientData)?;
        let mut options = Vec::new();
        options
            .extend_from_slice(&bytes[6..])
            .map_err(|()| L2capError::PayloadTooLarge)?;
        Ok(Self {
            source_cid: u16::from_le_bytes([bytes[0], bytes[1]]),
            flags: u16::from_le_bytes([bytes[2], bytes[3]]),
            result,
            options,
        })
    }

    /// Convert to bytes
    ///
    /// # Errors
    /// Returns `L2capError::PayloadTooLarge` if the result overflows the buffer
    pub fn to_bytes<const M: usize>(&self) -> Result<Vec<u8, M>, L2capError> {
        let mut bytes = Vec::new();
        bytes
            .extend_from_slice(&self.source_cid.to_le_bytes())
            .map_err(|()| L2capError::PayloadTooLarge)?;
        bytes
            .extend_from_slice(&self.flags.to_le_bytes())
            .map_err(|()| L2capError::PayloadTooLarge)?;
        bytes
            .extend_from_slice(&(self.result as u16).to_le_bytes())
            .map_err(|()| L2capError::PayloadTooLarge)?;
        bytes
            .extend_from_slice(&self.options)
            .map_err(|()| L2capError::PayloadTooLarge)?;
        Ok(bytes)
    }
}

/// L2CAP Disconnection Request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectionRequest {
    /// Responder's channel identifier
    pub destination_cid: ChannelId,
    /// Requester's channel identifier
    pub source_cid: ChannelId,
}

impl DisconnectionRequest {
    /// Size in bytes
    pub const SIZE: usize = 4;

    /// Parse from bytes
    ///
    /// # Errors
    /// Returns `L2capError::InsufficientData` if not enough bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, L2capError> {
        if bytes.len() < Self::SIZE {
            return Err(L2capError::InsufficientData);
        }
        Ok(Self {
            destination_cid: u16::from_le_bytes([bytes[0], bytes[1]]),
            source_cid: u16::from_le_bytes([bytes[2], bytes[3]]),
        })
    }
}

/// L2CAP Disconnection Response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectionResponse {
    /// Responder's channel identifier, echoed
    pub destination_cid: ChannelId,
    /// Requester's channel identifier, echoed
    pub source_cid: ChannelId,
}

impl DisconnectionResponse {
    /// Size in bytes
    pub const SIZE: usize = 4;

    /// Convert to bytes
    #[must_use]
    pub fn to_bytes(self) -> [u8; 4] {
        let mut bytes = [0u8; 4];
        bytes[0..2].copy_from_slice(&self.destination_cid.to_le_bytes());
        bytes[2..4].copy_from_slice(&self.source_cid.to_le_bytes());
        bytes
    }
}

/// L2CAP Information Request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InformationRequest {
    /// Requested information type
    pub info_type: u16,
}

impl InformationRequest {
    /// Size in bytes
    pub const SIZE: usize = 2;

    /// Parse from bytes
    ///
    /// # Errors
    /// Returns `L2capError::InsufficientData` if not enough bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, L2capError> {
        if bytes.len() < Self::SIZE {
            return Err(L2capError::InsufficientData);
        }
        Ok(Self {
            info_type: u16::from_le_bytes([bytes[0], bytes[1]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signaling_header() {
        let header = SignalingHeader::new(SignalingCode::ConnectionRequest, 0x42, 4);
        let bytes = header.to_bytes();
        assert_eq!(bytes, [0x02, 0x42, 0x04, 0x00]);

        let parsed = SignalingHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_connection_request_roundtrip() {
        let req = ConnectionRequest {
            psm: 0x0001,
            source_cid: 0x0040,
        };
        let bytes = req.to_bytes();
        assert_eq!(bytes, [0x01, 0x00, 0x40, 0x00]);
        assert_eq!(ConnectionRequest::from_bytes(&bytes).unwrap(), req);
    }

    #[test]
    fn test_connection_response_layout() {
        let rsp = ConnectionResponse {
            destination_cid: 0x0040,
            source_cid: 0x0041,
            result: ConnectionResult::PsmNotSupported,
            status: 0,
        };
        assert_eq!(
            rsp.to_bytes(),
            [0x40, 0x00, 0x41, 0x00, 0x02, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_configuration_request_parsing() {
        let bytes = [0x40, 0x00, 0x00, 0x00, 0x01, 0x02, 0x00, 0x04];
        let req: ConfigurationRequest = ConfigurationRequest::from_bytes(&bytes).unwrap();
        assert_eq!(req.destination_cid, 0x0040);
        assert_eq!(req.flags, 0);
        assert_eq!(req.options.as_slice(), &[0x01, 0x02, 0x00, 0x04]);
    }

    #[test]
    fn test_configuration_response_roundtrip() {
        let rsp: ConfigurationResponse = ConfigurationResponse {
            source_cid: 0x0040,
            flags: 0,
            result: ConfigurationResult::UnacceptableParameters,
            options: Vec::new(),
        };
        let bytes: Vec<u8, 64> = rsp.to_bytes().unwrap();
        let parsed: ConfigurationResponse = ConfigurationResponse::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, rsp);
    }

    #[test]
    fn test_disconnection_request() {
        let req = DisconnectionRequest::from_bytes(&[0x41, 0x00, 0x40, 0x00]).unwrap();
        assert_eq!(req.destination_cid, 0x0041);
        assert_eq!(req.source_cid, 0x0040);
    }

    #[test]
    fn test_unknown_code_stays_raw() {
        let header = SignalingHeader::from_bytes(&[0x7F, 0x01, 0x00, 0x00]).unwrap();
        assert_eq!(header.code, 0x7F);
        assert!(SignalingCode::from_u8(header.code).is_none());
    }
}
