//! SDP Service Records
//!
//! Service records are built once, when an SDP channel opens, from the
//! compile-time service-definition table at the bottom of this module, and
//! are immutable afterwards. Each record keeps its attribute values in one
//! flat pre-encoded buffer with two derived indexes: attribute entries
//! sorted by id for range queries, and the record's UUIDs reduced to 16-bit
//! form and sorted for binary-search matching.

use heapless::Vec;

/// Maximum number of built service records
pub const MAX_SERVICE_RECORDS: usize = 4;

/// Maximum encoded attribute data per record
pub const MAX_RECORD_DATA: usize = 512;

/// Maximum number of attributes per service record
pub const MAX_ATTRIBUTES_PER_RECORD: usize = 24;

/// Maximum number of distinct UUIDs per record
pub const MAX_RECORD_UUIDS: usize = 16;

/// Attribute ID type
pub type AttributeId = u16;

/// Service record handle type
pub type ServiceRecordHandle = u32;

/// The Bluetooth Base UUID suffix: `-0000-1000-8000-00805F9B34FB`
///
/// A 128-bit UUID reduces to 16-bit form exactly when its last twelve bytes
/// equal this suffix and its first four bytes fit sixteen bits.
pub const BASE_UUID_SUFFIX: [u8; 12] = [
    0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0x80, 0x5F, 0x9B, 0x34, 0xFB,
];

/// Reduce a 128-bit UUID to its 16-bit short form, if it has one
#[must_use]
pub fn reduce_uuid128(uuid: &[u8; 16]) -> Option<u16> {
    if uuid[4..16] != BASE_UUID_SUFFIX {
        return None;
    }
    let head = u32::from_be_bytes([uuid[0], uuid[1], uuid[2], uuid[3]]);
    u16::try_from(head).ok()
}

/// Universal attribute IDs
pub mod attr {
    /// Service Record Handle
    pub const SERVICE_RECORD_HANDLE: u16 = 0x0000;
    /// Service Class ID List
    pub const SERVICE_CLASS_ID_LIST: u16 = 0x0001;
    /// Protocol Descriptor List
    pub const PROTOCOL_DESCRIPTOR_LIST: u16 = 0x0004;
    /// Browse Group List
    pub const BROWSE_GROUP_LIST: u16 = 0x0005;
    /// Language Base Attribute ID List
    pub const LANGUAGE_BASE_ATTRIBUTE_ID_LIST: u16 = 0x0006;
    /// Bluetooth Profile Descriptor List
    pub const PROFILE_DESCRIPTOR_LIST: u16 = 0x0009;
    /// Additional Protocol Descriptor Lists
    pub const ADDITIONAL_PROTOCOL_DESCRIPTOR_LISTS: u16 = 0x000D;
    /// Service Name (at the default language base)
    pub const SERVICE_NAME: u16 = 0x0100;
    /// Service Description (at the default language base)
    pub const SERVICE_DESCRIPTION: u16 = 0x0101;
    /// Provider Name (at the default language base)
    pub const PROVIDER_NAME: u16 = 0x0102;
    /// Version Number List (SDP server record)
    pub const VERSION_NUMBER_LIST: u16 = 0x0200;
}

/// Well-known service class and protocol UUIDs
pub mod uuid {
    /// SDP protocol
    pub const SDP_PROTOCOL: u16 = 0x0001;
    /// HIDP protocol
    pub const HIDP_PROTOCOL: u16 = 0x0011;
    /// L2CAP protocol
    pub const L2CAP_PROTOCOL: u16 = 0x0100;
    /// Service Discovery Server service class
    pub const SERVICE_DISCOVERY_SERVER: u16 = 0x1000;
    /// Public Browse Root browse group
    pub const PUBLIC_BROWSE_ROOT: u16 = 0x1002;
    /// Human Interface Device service class
    pub const HID_SERVICE: u16 = 0x1124;
    /// PnP Information (Device ID) service class
    pub const PNP_INFORMATION: u16 = 0x1200;
}

/// Data element descriptor bytes: `type << 3 | size-class`, big-endian values
mod desc {
    pub const UINT8: u8 = 0x08;
    pub const UINT16: u8 = 0x09;
    pub const UINT32: u8 = 0x0A;
    pub const UUID16: u8 = 0x19;
    pub const UUID128: u8 = 0x1C;
    pub const STRING8: u8 = 0x25;
    pub const BOOL: u8 = 0x28;
    pub const SEQ16: u8 = 0x36;
    pub const URL8: u8 = 0x45;
}

#[derive(Debug, Clone, Copy)]
struct AttributeIndex {
    id: AttributeId,
    offset: u16,
    len: u16,
}

/// One immutable service record
#[derive(Debug)]
pub struct ServiceRecord {
    /// Handle the record is addressed by
    pub handle: ServiceRecordHandle,
    data: Vec<u8, MAX_RECORD_DATA>,
    attributes: Vec<AttributeIndex, MAX_ATTRIBUTES_PER_RECORD>,
    uuids: Vec<u16, MAX_RECORD_UUIDS>,
}

impl ServiceRecord {
    /// Encoded value of one attribute
    #[must_use]
    pub fn attribute(&self, id: AttributeId) -> Option<&[u8]> {
        let index = self
            .attributes
            .binary_search_by_key(&id, |a| a.id)
            .ok()?;
        let entry = self.attributes[index];
        Some(&self.data[usize::from(entry.offset)..usize::from(entry.offset + entry.len)])
    }

    /// All attributes in ascending id order
    pub fn attributes(&self) -> impl Iterator<Item = (AttributeId, &[u8])> {
        self.attributes.iter().map(|entry| {
            (
                entry.id,
                &self.data[usize::from(entry.offset)..usize::from(entry.offset + entry.len)],
            )
        })
    }

    /// Whether the record carries the given UUID (16-bit short form)
    #[must_use]
    pub fn matches_uuid(&self, uuid: u16) -> bool {
        self.uuids.binary_search(&uuid).is_ok()
    }

    /// Number of attributes in the record
    #[must_use]
    pub fn attribute_count(&self) -> usize {
        self.attributes.len()
    }
}

/// Writer for one big-endian data element tree
///
/// Every UUID written anywhere in a record is also collected into the
/// record's match index.
pub struct ElementWriter<'a> {
    buf: &'a mut Vec<u8, MAX_RECORD_DATA>,
    uuids: &'a mut Vec<u16, MAX_RECORD_UUIDS>,
}

impl ElementWriter<'_> {
    /// 8-bit unsigned integer element
    pub fn uint8(&mut self, value: u8) {
        self.buf.push(desc::UINT8).ok();
        self.buf.push(value).ok();
    }

    /// 16-bit unsigned integer element
    pub fn uint16(&mut self, value: u16) {
        self.buf.push(desc::UINT16).ok();
        self.buf.extend_from_slice(&value.to_be_bytes()).ok();
    }

    /// 32-bit unsigned integer element
    pub fn uint32(&mut self, value: u32) {
        self.buf.push(desc::UINT32).ok();
        self.buf.extend_from_slice(&value.to_be_bytes()).ok();
    }

    /// 16-bit UUID element
    pub fn uuid16(&mut self, value: u16) {
        self.buf.push(desc::UUID16).ok();
        self.buf.extend_from_slice(&value.to_be_bytes()).ok();
        self.note_uuid(value);
    }

    /// 128-bit UUID element
    pub fn uuid128(&mut self, value: &[u8; 16]) {
        self.buf.push(desc::UUID128).ok();
        self.buf.extend_from_slice(value).ok();
        if let Some(short) = reduce_uuid128(value) {
            self.note_uuid(short);
        }
    }

    /// Boolean element
    pub fn boolean(&mut self, value: bool) {
        self.buf.push(desc::BOOL).ok();
        self.buf.push(u8::from(value)).ok();
    }

    /// Text string element (single-byte length)
    pub fn text(&mut self, value: &str) {
        self.string_like(desc::STRING8, value.as_bytes());
    }

    /// Text string element from raw bytes (HID descriptors and the like)
    pub fn bytes(&mut self, value: &[u8]) {
        self.string_like(desc::STRING8, value);
    }

    /// URL element (single-byte length)
    pub fn url(&mut self, value: &str) {
        self.string_like(desc::URL8, value.as_bytes());
    }

    /// Nested data element sequence
    pub fn sequence(&mut self, f: impl FnOnce(&mut ElementWriter<'_>)) {
        self.buf.push(desc::SEQ16).ok();
        let len_at = self.buf.len();
        self.buf.extend_from_slice(&[0, 0]).ok();
        let start = self.buf.len();

        f(self);

        let len = (self.buf.len() - start) as u16;
        if len_at + 2 <= self.buf.len() {
            self.buf[len_at..len_at + 2].copy_from_slice(&len.to_be_bytes());
        }
    }

    fn string_like(&mut self, descriptor: u8, bytes: &[u8]) {
        let len = bytes.len().min(255);
        self.buf.push(descriptor).ok();
        self.buf.push(len as u8).ok();
        self.buf.extend_from_slice(&bytes[..len]).ok();
    }

    fn note_uuid(&mut self, value: u16) {
        if !self.uuids.contains(&value) {
            self.uuids.push(value).ok();
        }
    }
}

/// Builder assembling one service record
pub struct RecordBuilder {
    handle: ServiceRecordHandle,
    data: Vec<u8, MAX_RECORD_DATA>,
    attributes: Vec<AttributeIndex, MAX_ATTRIBUTES_PER_RECORD>,
    uuids: Vec<u16, MAX_RECORD_UUIDS>,
}

impl RecordBuilder {
    fn new(handle: ServiceRecordHandle) -> Self {
        let mut builder = Self {
            handle,
            data: Vec::new(),
            attributes: Vec::new(),
            uuids: Vec::new(),
        };
        builder.attribute(attr::SERVICE_RECORD_HANDLE, |e| e.uint32(handle));
        builder
    }

    /// Add one attribute with an element tree as its value
    pub fn attribute(&mut self, id: AttributeId, f: impl FnOnce(&mut ElementWriter<'_>)) {
        let offset = self.data.len() as u16;
        {
            let mut writer = ElementWriter {
                buf: &mut self.data,
                uuids: &mut self.uuids,
            };
            f(&mut writer);
        }
        let len = self.data.len() as u16 - offset;
        if self.attributes.push(AttributeIndex { id, offset, len }).is_err() {
            defmt::error!("[SDP] attribute table full for record {:08x}", self.handle);
        }
    }

    fn finish(mut self) -> ServiceRecord {
        self.attributes.sort_unstable_by_key(|a| a.id);
        self.uuids.sort_unstable();
        ServiceRecord {
            handle: self.handle,
            data: self.data,
            attributes: self.attributes,
            uuids: self.uuids,
        }
    }
}

// ----------------------------------------------------------------------
// Built-in service definitions

/// Handle of the SDP server's own record, reserved by the protocol
pub const SDP_SERVER_RECORD_HANDLE: ServiceRecordHandle = 0x0000_0000;

/// First handle assigned to the remaining built-in records
const RECORD_HANDLE_BASE: ServiceRecordHandle = 0x0001_0000;

/// Boot-protocol keyboard report descriptor served by the HID record
const KEYBOARD_REPORT_DESCRIPTOR: [u8; 63] = [
    0x05, 0x01, 0x09, 0x06, 0xA1, 0x01, 0x05, 0x07, 0x19, 0xE0, 0x29, 0xE7, 0x15, 0x00, 0x25,
    0x01, 0x75, 0x01, 0x95, 0x08, 0x81, 0x02, 0x95, 0x01, 0x75, 0x08, 0x81, 0x01, 0x95, 0x05,
    0x75, 0x01, 0x05, 0x08, 0x19, 0x01, 0x29, 0x05, 0x91, 0x02, 0x95, 0x01, 0x75, 0x03, 0x91,
    0x01, 0x95, 0x06, 0x75, 0x08, 0x15, 0x00, 0x25, 0xFF, 0x05, 0x07, 0x19, 0x00, 0x29, 0xFF,
    0x81, 0x00, 0xC0,
];

fn language_base(builder: &mut RecordBuilder) {
    builder.attribute(attr::LANGUAGE_BASE_ATTRIBUTE_ID_LIST, |e| {
        e.sequence(|e| {
            e.uint16(0x656E); // "en"
            e.uint16(0x006A); // UTF-8
            e.uint16(0x0100);
        });
    });
}

fn l2cap_protocol(builder: &mut RecordBuilder, psm: u16, protocol: u16) {
    builder.attribute(attr::PROTOCOL_DESCRIPTOR_LIST, |e| {
        e.sequence(|e| {
            e.sequence(|e| {
                e.uuid16(uuid::L2CAP_PROTOCOL);
                e.uint16(psm);
            });
            e.sequence(|e| {
                e.uuid16(protocol);
            });
        });
    });
}

fn browse_group(builder: &mut RecordBuilder) {
    builder.attribute(attr::BROWSE_GROUP_LIST, |e| {
        e.sequence(|e| {
            e.uuid16(uuid::PUBLIC_BROWSE_ROOT);
        });
    });
}

fn sdp_server_record(builder: &mut RecordBuilder) {
    builder.attribute(attr::SERVICE_CLASS_ID_LIST, |e| {
        e.sequence(|e| {
            e.uuid16(uuid::SERVICE_DISCOVERY_SERVER);
        });
    });
    l2cap_protocol(builder, crate::sdp::SDP_PSM, uuid::SDP_PROTOCOL);
    browse_group(builder);
    language_base(builder);
    builder.attribute(attr::SERVICE_NAME, |e| e.text("Service Discovery"));
    builder.attribute(attr::SERVICE_DESCRIPTION, |e| {
        e.text("Service record database");
    });
    builder.attribute(attr::PROVIDER_NAME, |e| e.text("Mockingbird"));
    builder.attribute(attr::VERSION_NUMBER_LIST, |e| {
        e.sequence(|e| {
            e.uint16(0x0100);
        });
    });
}

fn pnp_record(builder: &mut RecordBuilder) {
    builder.attribute(attr::SERVICE_CLASS_ID_LIST, |e| {
        e.sequence(|e| {
            e.uuid16(uuid::PNP_INFORMATION);
        });
    });
    l2cap_protocol(builder, crate::sdp::SDP_PSM, uuid::SDP_PROTOCOL);
    browse_group(builder);
    language_base(builder);
    builder.attribute(attr::SERVICE_NAME, |e| e.text("PnP Information"));
    builder.attribute(0x0200, |e| e.uint16(0x0103)); // specification id
    builder.attribute(0x0201, |e| e.uint16(0xFFFF)); // vendor id
    builder.attribute(0x0202, |e| e.uint16(0x0001)); // product id
    builder.attribute(0x0203, |e| e.uint16(0x0100)); // version
    builder.attribute(0x0204, |e| e.boolean(true)); // primary record
    builder.attribute(0x0205, |e| e.uint16(0x0002)); // vendor id source: USB-IF
}

fn hid_record(builder: &mut RecordBuilder) {
    builder.attribute(attr::SERVICE_CLASS_ID_LIST, |e| {
        e.sequence(|e| {
            e.uuid16(uuid::HID_SERVICE);
        });
    });
    l2cap_protocol(
        builder,
        crate::l2cap::packet::psm::HID_CONTROL,
        uuid::HIDP_PROTOCOL,
    );
    browse_group(builder);
    language_base(builder);
    builder.attribute(attr::PROFILE_DESCRIPTOR_LIST, |e| {
        e.sequence(|e| {
            e.sequence(|e| {
                e.uuid16(uuid::HID_SERVICE);
                e.uint16(0x0100);
            });
        });
    });
    builder.attribute(attr::ADDITIONAL_PROTOCOL_DESCRIPTOR_LISTS, |e| {
        e.sequence(|e| {
            e.sequence(|e| {
                e.sequence(|e| {
                    e.uuid16(uuid::L2CAP_PROTOCOL);
                    e.uint16(crate::l2cap::packet::psm::HID_INTERRUPT);
                });
                e.sequence(|e| {
                    e.uuid16(uuid::HIDP_PROTOCOL);
                });
            });
        });
    });
    builder.attribute(attr::SERVICE_NAME, |e| e.text("Keyboard"));
    builder.attribute(0x0201, |e| e.uint16(0x0111)); // HID parser version
    builder.attribute(0x0202, |e| e.uint8(0x40)); // device subclass: keyboard
    builder.attribute(0x0203, |e| e.uint8(0x00)); // country code
    builder.attribute(0x0204, |e| e.boolean(true)); // virtual cable
    builder.attribute(0x0205, |e| e.boolean(true)); // reconnect initiate
    builder.attribute(0x0206, |e| {
        // descriptor list: one report descriptor
        e.sequence(|e| {
            e.sequence(|e| {
                e.uint8(0x22);
                e.bytes(&KEYBOARD_REPORT_DESCRIPTOR);
            });
        });
    });
    builder.attribute(0x0207, |e| {
        // language id base list
        e.sequence(|e| {
            e.sequence(|e| {
                e.uint16(0x0409);
                e.uint16(0x0100);
            });
        });
    });
    builder.attribute(0x020B, |e| e.uint16(0x0100)); // profile version
}

/// The compile-time service definition table
static BUILTIN_SERVICES: &[fn(&mut RecordBuilder)] = &[sdp_server_record, pnp_record, hid_record];

/// Build the service record database served on every new SDP channel
#[must_use]
pub fn builtin_records() -> Vec<ServiceRecord, MAX_SERVICE_RECORDS> {
    let mut records = Vec::new();
    for (index, define) in BUILTIN_SERVICES.iter().enumerate() {
        let handle = if index == 0 {
            SDP_SERVER_RECORD_HANDLE
        } else {
            RECORD_HANDLE_BASE + index as u32 - 1
        };
        let mut builder = RecordBuilder::new(handle);
        define(&mut builder);
        records.push(builder.finish()).ok();
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_reduction() {
        let mut full = [0u8; 16];
        full[2..4].copy_from_slice(&0x1000u16.to_be_bytes());
        full[4..16].copy_from_slice(&BASE_UUID_SUFFIX);
        assert_eq!(reduce_uuid128(&full), Some(0x1000));

        // Different suffix never reduces.
        let mut alien = full;
        alien[15] = 0xFC;
        assert_eq!(reduce_uuid128(&alien), None);

        // Head beyond 16 bits never reduces.
        let mut wide = full;
        wide[0] = 0x01;
        assert_eq!(reduce_uuid128(&wide), None);
    }

    #[test]
    fn test_builtin_records_built_and_indexed() {
        let records = builtin_records();
        assert_eq!(records.len(), 3);

        let sdp = &records[0];
        assert_eq!(sdp.handle, SDP_SERVER_RECORD_HANDLE);
        assert!(sdp.matches_uuid(uuid::SERVICE_DISCOVERY_SERVER));
        assert!(sdp.matches_uuid(uuid::L2CAP_PROTOCOL));
        assert!(!sdp.matches_uuid(uuid::HID_SERVICE));

        let hid = &records[2];
        assert!(hid.matches_uuid(uuid::HID_SERVICE));
        assert!(hid.matches_uuid(uuid::HIDP_PROTOCOL));
    }

    #[test]
    fn test_attribute_lookup_is_sorted() {
        let records = builtin_records();
        let record = &records[0];

        let mut last = None;
        for (id, value) in record.attributes() {
            assert!(!value.is_empty());
            if let Some(previous) = last {
                assert!(id > previous);
            }
            last = Some(id);
        }

        let handle = record.attribute(attr::SERVICE_RECORD_HANDLE).unwrap();
        assert_eq!(handle[0], 0x0A); // uint32 descriptor
        assert_eq!(&handle[1..5], &SDP_SERVER_RECORD_HANDLE.to_be_bytes());
    }

    #[test]
    fn test_element_writer_encodings() {
        let mut builder = RecordBuilder::new(0x0001_0000);
        builder.attribute(0x0300, |e| {
            e.sequence(|e| {
                e.uuid16(0x110A);
                e.uint16(0x0019);
            });
        });
        let record = builder.finish();

        let value = record.attribute(0x0300).unwrap();
        // Sequence descriptor with 16-bit length, then UUID and uint.
        assert_eq!(value[0], 0x36);
        assert_eq!(u16::from_be_bytes([value[1], value[2]]), 6);
        assert_eq!(&value[3..6], &[0x19, 0x11, 0x0A]);
        assert_eq!(&value[6..9], &[0x09, 0x00, 0x19]);
        assert!(record.matches_uuid(0x110A));
    }
}
