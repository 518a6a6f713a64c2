//! SDP Server
//!
//! The request/response query engine behind PSM 0x0001. Three request PDUs
//! are served against the record database built at channel-open time; every
//! parse failure is answered with an Error Response carrying the offending
//! transaction id, so a peer always hears back.
//!
//! Large results are paginated: the full result is materialized once into a
//! bounded staging buffer and a two-byte big-endian offset cursor, echoed
//! through the continuation state, resumes it across responses.

use super::{
    MAX_PDU_OUT_SIZE, SdpErrorCode, SdpPduId, TransactionId,
    record::{MAX_SERVICE_RECORDS, ServiceRecord, builtin_records, reduce_uuid128},
};
use heapless::Vec;

/// Size of the SDP PDU header: id, transaction id, parameter length
pub const PDU_HEADER_SIZE: usize = 5;

/// Maximum UUIDs in a service search pattern
pub const MAX_SEARCH_PATTERN: usize = 12;

/// Bytes reserved for the continuation-state trailer of a response
const CONTINUATION_RESERVE: usize = 3;

/// Staging capacity for one fully materialized result
const MAX_RESULT_BYTES: usize = 1024;

/// Data element type: unsigned integer
const TYPE_UINT: u8 = 1;
/// Data element type: UUID
const TYPE_UUID: u8 = 3;
/// Data element type: sequence
const TYPE_SEQUENCE: u8 = 6;

/// Descriptor byte of a 16-bit unsigned integer
const DESC_UINT16: u8 = 0x09;
/// Descriptor byte of a sequence with 16-bit length
const DESC_SEQ16: u8 = 0x36;

type Params = Vec<u8, MAX_PDU_OUT_SIZE>;
type Staging = Vec<u8, MAX_RESULT_BYTES>;

/// The SDP server state of one L2CAP channel
#[derive(Debug)]
pub struct SdpServer {
    records: Vec<ServiceRecord, MAX_SERVICE_RECORDS>,
}

impl SdpServer {
    /// Build the server with the built-in service record database
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: builtin_records(),
        }
    }

    /// Number of records in the database
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Look up one record by handle
    #[must_use]
    pub fn record(&self, handle: u32) -> Option<&ServiceRecord> {
        self.records.iter().find(|r| r.handle == handle)
    }

    /// Process one request PDU, writing the response into `out`
    ///
    /// Returns `false` only for packets too short to carry a transaction id;
    /// everything else produces a response, if only an Error Response.
    pub fn handle_request<const N: usize>(&mut self, request: &[u8], out: &mut Vec<u8, N>) -> bool {
        if request.len() < PDU_HEADER_SIZE {
            defmt::warn!("[SDP] short PDU ({}B) dropped", request.len());
            return false;
        }

        let pdu_id = request[0];
        let transaction_id = u16::from_be_bytes([request[1], request[2]]);
        let param_len = usize::from(u16::from_be_bytes([request[3], request[4]]));
        let params = &request[PDU_HEADER_SIZE..];

        let mut response = Params::new();
        let result = if params.len() != param_len {
            Err(SdpErrorCode::InvalidPduSize)
        } else {
            match pdu_id {
                id if id == SdpPduId::ServiceSearchRequest as u8 => self
                    .service_search(params, &mut response)
                    .map(|()| SdpPduId::ServiceSearchResponse),
                id if id == SdpPduId::ServiceAttributeRequest as u8 => self
                    .service_attribute(params, &mut response)
                    .map(|()| SdpPduId::ServiceAttributeResponse),
                id if id == SdpPduId::ServiceSearchAttributeRequest as u8 => self
                    .service_search_attribute(params, &mut response)
                    .map(|()| SdpPduId::ServiceSearchAttributeResponse),
                _ => Err(SdpErrorCode::InvalidRequestSyntax),
            }
        };

        match result {
            Ok(response_id) => write_pdu(out, response_id as u8, transaction_id, &response),
            Err(code) => {
                defmt::debug!("[SDP] request {:02x} failed: {:?}", pdu_id, code);
                let error = (code as u16).to_be_bytes();
                write_pdu(out, SdpPduId::ErrorResponse as u8, transaction_id, &error)
            }
        }
    }

    // --------------------------------------------------------------
    // Request handlers

    fn service_search(&self, params: &[u8], out: &mut Params) -> Result<(), SdpErrorCode> {
        let mut reader = ElementReader::new(params);
        let pattern = SearchPattern::parse(&mut reader)?;
        let max_count = usize::from(reader.u16be().ok_or(SdpErrorCode::InvalidRequestSyntax)?);
        let offset = parse_continuation(&mut reader)?;

        let mut handles: Vec<u32, MAX_SERVICE_RECORDS> = Vec::new();
        for record in &self.records {
            if pattern.matches(record) {
                handles.push(record.handle).ok();
            }
        }

        let limit = handles.len().min(max_count);
        let start = usize::from(offset);
        if start > limit {
            return Err(SdpErrorCode::InvalidContinuationState);
        }

        let room = (MAX_PDU_OUT_SIZE - PDU_HEADER_SIZE - 4 - CONTINUATION_RESERVE) / 4;
        let end = limit.min(start + room);

        push_u16(out, limit as u16)?; // total record count
        push_u16(out, (end - start) as u16)?; // current record count
        for handle in &handles[start..end] {
            push_slice(out, &handle.to_be_bytes())?;
        }
        push_continuation(out, end < limit, end as u16)
    }

    fn service_attribute(&self, params: &[u8], out: &mut Params) -> Result<(), SdpErrorCode> {
        let mut reader = ElementReader::new(params);
        let handle = reader.u32be().ok_or(SdpErrorCode::InvalidRequestSyntax)?;
        let max_bytes = usize::from(reader.u16be().ok_or(SdpErrorCode::InvalidRequestSyntax)?);
        if max_bytes < 7 {
            return Err(SdpErrorCode::InvalidRequestSyntax);
        }
        let filter = AttributeFilter::parse(&mut reader)?;
        let offset = parse_continuation(&mut reader)?;

        let record = self
            .record(handle)
            .ok_or(SdpErrorCode::InvalidServiceRecordHandle)?;

        let mut staging = Staging::new();
        append_attribute_list(record, &filter, &mut staging)?;

        paginate(&staging, usize::from(offset), max_bytes, out)
    }

    fn service_search_attribute(&self, params: &[u8], out: &mut Params) -> Result<(), SdpErrorCode> {
        let mut reader = ElementReader::new(params);
        let pattern = SearchPattern::parse(&mut reader)?;
        let max_bytes = usize::from(reader.u16be().ok_or(SdpErrorCode::InvalidRequestSyntax)?);
        if max_bytes < 7 {
            return Err(SdpErrorCode::InvalidRequestSyntax);
        }
        let filter = AttributeFilter::parse(&mut reader)?;
        let offset = parse_continuation(&mut reader)?;

        // One outer sequence grouping the attribute list of every match.
        let mut staging = Staging::new();
        push_staging(&mut staging, &[DESC_SEQ16, 0, 0])?;
        let body_start = staging.len();
        for record in &self.records {
            if pattern.matches(record) {
                append_attribute_list(record, &filter, &mut staging)?;
            }
        }
        let body_len = (staging.len() - body_start) as u16;
        staging[body_start - 2..body_start].copy_from_slice(&body_len.to_be_bytes());

        paginate(&staging, usize::from(offset), max_bytes, out)
    }
}

impl Default for SdpServer {
    fn default() -> Self {
        Self::new()
    }
}

// ------------------------------------------------------------------
// Response assembly

fn write_pdu<const N: usize>(
    out: &mut Vec<u8, N>,
    pdu_id: u8,
    transaction_id: TransactionId,
    params: &[u8],
) -> bool {
    out.clear();
    let fits = out.push(pdu_id).is_ok()
        && out.extend_from_slice(&transaction_id.to_be_bytes()).is_ok()
        && out
            .extend_from_slice(&(params.len() as u16).to_be_bytes())
            .is_ok()
        && out.extend_from_slice(params).is_ok();
    if !fits {
        defmt::error!("[SDP] response buffer too small for PDU {:02x}", pdu_id);
        out.clear();
    }
    fits
}

/// Slice one response-sized window out of a materialized result
fn paginate(
    staging: &[u8],
    start: usize,
    max_bytes: usize,
    out: &mut Params,
) -> Result<(), SdpErrorCode> {
    if start > staging.len() {
        return Err(SdpErrorCode::InvalidContinuationState);
    }

    let room = MAX_PDU_OUT_SIZE - PDU_HEADER_SIZE - 2 - CONTINUATION_RESERVE;
    let chunk = (staging.len() - start).min(room).min(max_bytes);
    let end = start + chunk;

    push_u16(out, chunk as u16)?; // attribute list byte count
    push_slice(out, &staging[start..end])?;
    push_continuation(out, end < staging.len(), end as u16)
}

fn push_continuation(out: &mut Params, more: bool, offset: u16) -> Result<(), SdpErrorCode> {
    if more {
        push_slice(out, &[2])?;
        push_slice(out, &offset.to_be_bytes())
    } else {
        push_slice(out, &[0])
    }
}

fn push_u16(out: &mut Params, value: u16) -> Result<(), SdpErrorCode> {
    push_slice(out, &value.to_be_bytes())
}

fn push_slice(out: &mut Params, bytes: &[u8]) -> Result<(), SdpErrorCode> {
    out.extend_from_slice(bytes)
        .map_err(|()| SdpErrorCode::InsufficientResources)
}

fn push_staging(staging: &mut Staging, bytes: &[u8]) -> Result<(), SdpErrorCode> {
    staging
        .extend_from_slice(bytes)
        .map_err(|()| SdpErrorCode::InsufficientResources)
}

/// Append one record's filtered attribute list as a sequence element
fn append_attribute_list(
    record: &ServiceRecord,
    filter: &AttributeFilter,
    staging: &mut Staging,
) -> Result<(), SdpErrorCode> {
    push_staging(staging, &[DESC_SEQ16, 0, 0])?;
    let start = staging.len();

    for (id, value) in record.attributes() {
        if filter.matches(id) {
            push_staging(staging, &[DESC_UINT16])?;
            push_staging(staging, &id.to_be_bytes())?;
            push_staging(staging, value)?;
        }
    }

    let len = (staging.len() - start) as u16;
    staging[start - 2..start].copy_from_slice(&len.to_be_bytes());
    Ok(())
}

// ------------------------------------------------------------------
// Request parsing

/// Big-endian data element reader
struct ElementReader<'a> {
    data: &'a [u8],
    at: usize,
}

impl<'a> ElementReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, at: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.at
    }

    fn u8(&mut self) -> Option<u8> {
        let byte = *self.data.get(self.at)?;
        self.at += 1;
        Some(byte)
    }

    fn u16be(&mut self) -> Option<u16> {
        let bytes = self.take(2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u32be(&mut self) -> Option<u32> {
        let bytes = self.take(4)?;
        Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.remaining() < len {
            return None;
        }
        let slice = &self.data[self.at..self.at + len];
        self.at += len;
        Some(slice)
    }

    /// Read one element descriptor, returning its type and payload size
    fn element_header(&mut self) -> Option<(u8, usize)> {
        let descriptor = self.u8()?;
        let element_type = descriptor >> 3;
        let size = match descriptor & 7 {
            0 => usize::from(element_type != 0),
            1 => 2,
            2 => 4,
            3 => 8,
            4 => 16,
            5 => usize::from(self.u8()?),
            6 => usize::from(self.u16be()?),
            _ => {
                let size = self.u32be()?;
                usize::try_from(size).ok()?
            }
        };
        Some((element_type, size))
    }
}

/// Parsed service search pattern
struct SearchPattern {
    uuids: Vec<u16, MAX_SEARCH_PATTERN>,
    /// A UUID with no 16-bit short form can never match any record
    unmatchable: bool,
}

impl SearchPattern {
    fn parse(reader: &mut ElementReader<'_>) -> Result<Self, SdpErrorCode> {
        let (element_type, size) = reader
            .element_header()
            .ok_or(SdpErrorCode::InvalidRequestSyntax)?;
        if element_type != TYPE_SEQUENCE {
            return Err(SdpErrorCode::InvalidRequestSyntax);
        }
        let body = reader
            .take(size)
            .ok_or(SdpErrorCode::InvalidRequestSyntax)?;

        let mut pattern = Self {
            uuids: Vec::new(),
            unmatchable: false,
        };
        let mut inner = ElementReader::new(body);
        while inner.remaining() > 0 {
            let (element_type, size) = inner
                .element_header()
                .ok_or(SdpErrorCode::InvalidRequestSyntax)?;
            if element_type != TYPE_UUID {
                return Err(SdpErrorCode::InvalidRequestSyntax);
            }
            let bytes = inner.take(size).ok_or(SdpErrorCode::InvalidRequestSyntax)?;
            let reduced = match size {
                2 => Some(u16::from_be_bytes([bytes[0], bytes[1]])),
                4 => {
                    let wide = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                    u16::try_from(wide).ok()
                }
                16 => {
                    let mut uuid = [0u8; 16];
                    uuid.copy_from_slice(bytes);
                    reduce_uuid128(&uuid)
                }
                _ => return Err(SdpErrorCode::InvalidRequestSyntax),
            };
            match reduced {
                Some(short) => {
                    if pattern.uuids.push(short).is_err() {
                        return Err(SdpErrorCode::InvalidRequestSyntax);
                    }
                }
                None => {
                    // No short form; such a UUID matches nothing here.
                    defmt::debug!("[SDP] unreducible UUID in search pattern");
                    pattern.unmatchable = true;
                }
            }
        }

        if pattern.uuids.is_empty() && !pattern.unmatchable {
            return Err(SdpErrorCode::InvalidRequestSyntax);
        }
        Ok(pattern)
    }

    /// A record matches when it carries every UUID of the pattern
    fn matches(&self, record: &ServiceRecord) -> bool {
        !self.unmatchable && self.uuids.iter().all(|&uuid| record.matches_uuid(uuid))
    }
}

/// Parsed attribute id list: single ids and inclusive ranges
struct AttributeFilter {
    ids: Vec<u16, 16>,
    ranges: Vec<(u16, u16), 8>,
}

impl AttributeFilter {
    fn parse(reader: &mut ElementReader<'_>) -> Result<Self, SdpErrorCode> {
        let (element_type, size) = reader
            .element_header()
            .ok_or(SdpErrorCode::InvalidRequestSyntax)?;
        if element_type != TYPE_SEQUENCE {
            return Err(SdpErrorCode::InvalidRequestSyntax);
        }
        let body = reader
            .take(size)
            .ok_or(SdpErrorCode::InvalidRequestSyntax)?;

        let mut filter = Self {
            ids: Vec::new(),
            ranges: Vec::new(),
        };
        let mut inner = ElementReader::new(body);
        while inner.remaining() > 0 {
            let (element_type, size) = inner
                .element_header()
                .ok_or(SdpErrorCode::InvalidRequestSyntax)?;
            if element_type != TYPE_UINT {
                return Err(SdpErrorCode::InvalidRequestSyntax);
            }
            let bytes = inner.take(size).ok_or(SdpErrorCode::InvalidRequestSyntax)?;
            match size {
                2 => {
                    let id = u16::from_be_bytes([bytes[0], bytes[1]]);
                    filter
                        .ids
                        .push(id)
                        .map_err(|_| SdpErrorCode::InvalidRequestSyntax)?;
                }
                4 => {
                    let from = u16::from_be_bytes([bytes[0], bytes[1]]);
                    let to = u16::from_be_bytes([bytes[2], bytes[3]]);
                    if from > to {
                        return Err(SdpErrorCode::InvalidRequestSyntax);
                    }
                    filter
                        .ranges
                        .push((from, to))
                        .map_err(|_| SdpErrorCode::InvalidRequestSyntax)?;
                }
                _ => return Err(SdpErrorCode::InvalidRequestSyntax),
            }
        }

        if filter.ids.is_empty() && filter.ranges.is_empty() {
            return Err(SdpErrorCode::InvalidRequestSyntax);
        }
        Ok(filter)
    }

    fn matches(&self, id: u16) -> bool {
        self.ids.contains(&id) || self.ranges.iter().any(|&(from, to)| id >= from && id <= to)
    }
}

/// Parse the continuation-state trailer into a resume offset
fn parse_continuation(reader: &mut ElementReader<'_>) -> Result<u16, SdpErrorCode> {
    let len = reader.u8().ok_or(SdpErrorCode::InvalidRequestSyntax)?;
    match len {
        0 => Ok(0),
        2 => reader
            .u16be()
            .ok_or(SdpErrorCode::InvalidContinuationState),
        _ => Err(SdpErrorCode::InvalidContinuationState),
    }
}

#[cfg(test)]
mod tests {
    use super::super::record::{BASE_UUID_SUFFIX, SDP_SERVER_RECORD_HANDLE, attr, uuid};
    use super::*;

    fn request(pdu_id: u8, transaction_id: u16, params: &[u8]) -> Vec<u8, 256> {
        let mut pdu = Vec::new();
        pdu.push(pdu_id).unwrap();
        pdu.extend_from_slice(&transaction_id.to_be_bytes()).unwrap();
        pdu.extend_from_slice(&(params.len() as u16).to_be_bytes())
            .unwrap();
        pdu.extend_from_slice(params).unwrap();
        pdu
    }

    fn uuid16_pattern(value: u16) -> Vec<u8, 16> {
        let mut pattern = Vec::new();
        pattern.extend_from_slice(&[0x35, 0x03, 0x19]).unwrap();
        pattern.extend_from_slice(&value.to_be_bytes()).unwrap();
        pattern
    }

    #[test]
    fn test_service_search_finds_sdp_server() {
        let mut server = SdpServer::new();
        let mut params: Vec<u8, 64> = Vec::new();
        params
            .extend_from_slice(&uuid16_pattern(uuid::SERVICE_DISCOVERY_SERVER))
            .unwrap();
        params.extend_from_slice(&0x0010u16.to_be_bytes()).unwrap(); // max count
        params.push(0).unwrap(); // no continuation

        let pdu = request(0x02, 0x1234, &params);
        let mut out: Vec<u8, 128> = Vec::new();
        assert!(server.handle_request(&pdu, &mut out));

        assert_eq!(out[0], 0x03); // Service Search Response
        assert_eq!(&out[1..3], &[0x12, 0x34]); // transaction id echoed
        let total = u16::from_be_bytes([out[5], out[6]]);
        let current = u16::from_be_bytes([out[7], out[8]]);
        assert_eq!(total, 1);
        assert_eq!(current, 1);
        let handle = u32::from_be_bytes([out[9], out[10], out[11], out[12]]);
        assert_eq!(handle, SDP_SERVER_RECORD_HANDLE);
        assert_eq!(out[13], 0); // no continuation
    }

    #[test]
    fn test_service_search_128_bit_base_uuid() {
        let mut server = SdpServer::new();

        let mut full = [0u8; 16];
        full[2..4].copy_from_slice(&uuid::HID_SERVICE.to_be_bytes());
        full[4..16].copy_from_slice(&BASE_UUID_SUFFIX);

        let mut params: Vec<u8, 64> = Vec::new();
        params.extend_from_slice(&[0x35, 0x11, 0x1C]).unwrap();
        params.extend_from_slice(&full).unwrap();
        params.extend_from_slice(&0x0010u16.to_be_bytes()).unwrap();
        params.push(0).unwrap();

        let pdu = request(0x02, 1, &params);
        let mut out: Vec<u8, 128> = Vec::new();
        assert!(server.handle_request(&pdu, &mut out));
        assert_eq!(u16::from_be_bytes([out[5], out[6]]), 1);

        // Same UUID under a foreign suffix matches nothing.
        let mut alien = full;
        alien[15] = 0x00;
        let mut params: Vec<u8, 64> = Vec::new();
        params.extend_from_slice(&[0x35, 0x11, 0x1C]).unwrap();
        params.extend_from_slice(&alien).unwrap();
        params.extend_from_slice(&0x0010u16.to_be_bytes()).unwrap();
        params.push(0).unwrap();

        let pdu = request(0x02, 2, &params);
        let mut out: Vec<u8, 128> = Vec::new();
        assert!(server.handle_request(&pdu, &mut out));
        assert_eq!(out[0], 0x03);
        assert_eq!(u16::from_be_bytes([out[5], out[6]]), 0);
    }

    #[test]
    fn test_attribute_request_returns_class_list() {
        let mut server = SdpServer::new();
        let mut params: Vec<u8, 64> = Vec::new();
        params
            .extend_from_slice(&SDP_SERVER_RECORD_HANDLE.to_be_bytes())
            .unwrap();
        params.extend_from_slice(&0x0040u16.to_be_bytes()).unwrap(); // max bytes
        // Attribute id list: the service class id list only.
        params.extend_from_slice(&[0x35, 0x03, 0x09]).unwrap();
        params
            .extend_from_slice(&attr::SERVICE_CLASS_ID_LIST.to_be_bytes())
            .unwrap();
        params.push(0).unwrap();

        let pdu = request(0x04, 7, &params);
        let mut out: Vec<u8, 128> = Vec::new();
        assert!(server.handle_request(&pdu, &mut out));
        assert_eq!(out[0], 0x05);

        let byte_count = usize::from(u16::from_be_bytes([out[5], out[6]]));
        let list = &out[7..7 + byte_count];
        // Outer sequence, then attribute id 0x0001, then the UUID sequence.
        assert_eq!(list[0], 0x36);
        assert_eq!(&list[3..6], &[0x09, 0x00, 0x01]);
        assert_eq!(list[6], 0x36);
        assert_eq!(&list[9..12], &[0x19, 0x10, 0x00]);
    }

    #[test]
    fn test_bad_handle_yields_error_response() {
        let mut server = SdpServer::new();
        let mut params: Vec<u8, 64> = Vec::new();
        params.extend_from_slice(&0xDEAD_BEEFu32.to_be_bytes()).unwrap();
        params.extend_from_slice(&0x0040u16.to_be_bytes()).unwrap();
        params
            .extend_from_slice(&[0x35, 0x05, 0x0A, 0x00, 0x00, 0xFF, 0xFF])
            .unwrap();
        params.push(0).unwrap();

        let pdu = request(0x04, 0xBEEF, &params);
        let mut out: Vec<u8, 128> = Vec::new();
        assert!(server.handle_request(&pdu, &mut out));
        assert_eq!(out[0], 0x01); // Error Response
        assert_eq!(&out[1..3], &[0xBE, 0xEF]);
        assert_eq!(
            u16::from_be_bytes([out[5], out[6]]),
            SdpErrorCode::InvalidServiceRecordHandle as u16
        );
    }

    #[test]
    fn test_declared_length_mismatch_yields_invalid_pdu_size() {
        let mut server = SdpServer::new();
        let mut pdu: Vec<u8, 16> = Vec::new();
        pdu.extend_from_slice(&[0x02, 0x00, 0x05, 0x00, 0x10]).unwrap(); // claims 16 bytes
        pdu.push(0).unwrap();

        let mut out: Vec<u8, 128> = Vec::new();
        assert!(server.handle_request(&pdu, &mut out));
        assert_eq!(out[0], 0x01);
        assert_eq!(
            u16::from_be_bytes([out[5], out[6]]),
            SdpErrorCode::InvalidPduSize as u16
        );
    }

    #[test]
    fn test_search_attribute_continuation_resumes() {
        let mut server = SdpServer::new();

        let full_range: [u8; 7] = [0x35, 0x05, 0x0A, 0x00, 0x00, 0xFF, 0xFF];
        let mut collected: Vec<u8, MAX_RESULT_BYTES> = Vec::new();
        let mut continuation: Vec<u8, 3> = Vec::new();
        continuation.push(0).unwrap();

        for _ in 0..64 {
            let mut params: Vec<u8, 64> = Vec::new();
            params
                .extend_from_slice(&uuid16_pattern(uuid::HID_SERVICE))
                .unwrap();
            params.extend_from_slice(&0x0030u16.to_be_bytes()).unwrap(); // small window
            params.extend_from_slice(&full_range).unwrap();
            params.extend_from_slice(&continuation).unwrap();

            let pdu = request(0x06, 3, &params);
            let mut out: Vec<u8, 128> = Vec::new();
            assert!(server.handle_request(&pdu, &mut out));
            assert_eq!(out[0], 0x07);

            let byte_count = usize::from(u16::from_be_bytes([out[5], out[6]]));
            assert!(byte_count <= 0x30);
            collected
                .extend_from_slice(&out[7..7 + byte_count])
                .unwrap();

            let cont_len = out[7 + byte_count];
            if cont_len == 0 {
                break;
            }
            continuation.clear();
            continuation
                .extend_from_slice(&out[7 + byte_count..7 + byte_count + 3])
                .unwrap();
        }

        // The reassembled result is one outer sequence holding the HID
        // record's attribute list.
        assert_eq!(collected[0], 0x36);
        let outer_len = usize::from(u16::from_be_bytes([collected[1], collected[2]]));
        assert_eq!(collected.len(), 3 + outer_len);
        assert_eq!(collected[3], 0x36);
    }

    #[test]
    fn test_stale_continuation_rejected() {
        let mut server = SdpServer::new();
        let mut params: Vec<u8, 64> = Vec::new();
        params
            .extend_from_slice(&uuid16_pattern(uuid::SERVICE_DISCOVERY_SERVER))
            .unwrap();
        params.extend_from_slice(&0x0010u16.to_be_bytes()).unwrap();
        params.extend_from_slice(&[2, 0x7F, 0xFF]).unwrap(); // absurd offset

        let pdu = request(0x02, 9, &params);
        let mut out: Vec<u8, 128> = Vec::new();
        assert!(server.handle_request(&pdu, &mut out));
        assert_eq!(out[0], 0x01);
        assert_eq!(
            u16::from_be_bytes([out[5], out[6]]),
            SdpErrorCode::InvalidContinuationState as u16
        );
    }
}
