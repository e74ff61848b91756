//! Wire packet codec.
//!
//! A frame on the air is `[header:1][path_len:1][path:0-64][payload:0-180]`.
//! The header byte packs three fields:
//! `(route & 0x03) | ((payload_type & 0x0F) << 2) | ((version & 0x03) << 6)`.
//!
//! The path carries one single-byte node hash per hop. For flood routing it
//! records the hops traversed so far; for direct routing it is the remaining
//! source route, next hop first.

use thiserror::Error;

/// Maximum number of hops in a packet path.
pub const MAX_PATH_LEN: usize = 64;
/// Maximum payload length in bytes.
pub const MAX_PAYLOAD_LEN: usize = 180;

const HEADER_ROUTE_MASK: u8 = 0x03;
const HEADER_TYPE_MASK: u8 = 0x0F;
const HEADER_TYPE_SHIFT: u8 = 2;
const HEADER_VER_MASK: u8 = 0x03;
const HEADER_VER_SHIFT: u8 = 6;

/// Payload format version carried in the top two header bits.
pub const PAYLOAD_VER_1: u8 = 0x00;

/// Routing mode, two bits of the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RouteType {
    TransportFlood = 0x00,
    Flood = 0x01,
    Direct = 0x02,
    TransportDirect = 0x03,
}

impl RouteType {
    /// Decode the route bits of a header byte.
    pub fn of(header: u8) -> RouteType {
        match header & HEADER_ROUTE_MASK {
            0x00 => RouteType::TransportFlood,
            0x01 => RouteType::Flood,
            0x02 => RouteType::Direct,
            _ => RouteType::TransportDirect,
        }
    }

    /// Two-letter tag used in logs.
    pub fn name(self) -> &'static str {
        match self {
            RouteType::TransportFlood => "TF",
            RouteType::Flood => "FL",
            RouteType::Direct => "DR",
            RouteType::TransportDirect => "TD",
        }
    }
}

/// Payload kind, four bits of the header. Values 0x0C-0x0E are unassigned
/// on the wire; payload types are therefore compared as raw bytes
/// (`pkt.payload_type() == PayloadType::Advert as u8`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadType {
    Request = 0x00,
    Response = 0x01,
    Plain = 0x02,
    Ack = 0x03,
    Advert = 0x04,
    GroupText = 0x05,
    GroupData = 0x06,
    AnonReq = 0x07,
    PathReturn = 0x08,
    PathTrace = 0x09,
    Multipart = 0x0A,
    Control = 0x0B,
    Raw = 0x0F,
}

/// Three-letter tag for a payload type byte, used in logs.
pub fn payload_type_name(pt: u8) -> &'static str {
    match pt {
        x if x == PayloadType::Request as u8 => "REQ",
        x if x == PayloadType::Response as u8 => "RSP",
        x if x == PayloadType::Plain as u8 => "TXT",
        x if x == PayloadType::Ack as u8 => "ACK",
        x if x == PayloadType::Advert as u8 => "ADV",
        x if x == PayloadType::GroupText as u8 => "GTX",
        x if x == PayloadType::GroupData as u8 => "GDT",
        x if x == PayloadType::AnonReq as u8 => "ANO",
        x if x == PayloadType::PathReturn as u8 => "PTH",
        x if x == PayloadType::PathTrace as u8 => "TRC",
        x if x == PayloadType::Multipart as u8 => "MUL",
        x if x == PayloadType::Control as u8 => "CTL",
        x if x == PayloadType::Raw as u8 => "RAW",
        _ => "???",
    }
}

/// Errors surfaced by [`Packet::deserialize`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Input shorter than the fixed header or truncated before the declared
    /// path end.
    #[error("frame too short ({0} bytes)")]
    Short(usize),
    /// Declared path length exceeds [`MAX_PATH_LEN`].
    #[error("path length {0} exceeds {MAX_PATH_LEN}")]
    PathTooLong(u8),
}

/// Pack route, payload type and version into a header byte.
pub fn make_header(route: RouteType, payload_type: PayloadType, version: u8) -> u8 {
    (route as u8 & HEADER_ROUTE_MASK)
        | ((payload_type as u8 & HEADER_TYPE_MASK) << HEADER_TYPE_SHIFT)
        | ((version & HEADER_VER_MASK) << HEADER_VER_SHIFT)
}

/// A wire packet plus transient reception metadata.
///
/// `rssi`, `snr` and `rx_time_ms` are filled in by the receiver and are not
/// part of the transmitted frame. SNR is quarter-dB fixed point (+8.0 dB is
/// stored as 32).
#[derive(Debug, Clone, Default)]
pub struct Packet {
    pub header: u8,
    pub path: Vec<u8>,
    pub payload: Vec<u8>,
    pub rx_time_ms: u64,
    pub snr: i16,
    pub rssi: i16,
}

impl Packet {
    pub fn new() -> Packet {
        Packet::default()
    }

    pub fn set_header(&mut self, route: RouteType, payload_type: PayloadType, version: u8) {
        self.header = make_header(route, payload_type, version);
    }

    pub fn route_type(&self) -> RouteType {
        RouteType::of(self.header)
    }

    /// Raw four-bit payload type.
    pub fn payload_type(&self) -> u8 {
        (self.header >> HEADER_TYPE_SHIFT) & HEADER_TYPE_MASK
    }

    pub fn version(&self) -> u8 {
        (self.header >> HEADER_VER_SHIFT) & HEADER_VER_MASK
    }

    pub fn is_flood(&self) -> bool {
        matches!(
            self.route_type(),
            RouteType::Flood | RouteType::TransportFlood
        )
    }

    pub fn is_direct(&self) -> bool {
        matches!(
            self.route_type(),
            RouteType::Direct | RouteType::TransportDirect
        )
    }

    pub fn path_len(&self) -> usize {
        self.path.len()
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Total on-air size of the serialized frame.
    pub fn total_size(&self) -> usize {
        2 + self.path.len() + self.payload.len()
    }

    /// Serialize to wire format `[header][path_len][path...][payload...]`.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.total_size());
        buf.push(self.header);
        buf.push(self.path.len() as u8);
        buf.extend_from_slice(&self.path);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Deserialize from wire format.
    ///
    /// Rejects truncated input and over-long declared paths. Payload bytes
    /// beyond [`MAX_PAYLOAD_LEN`] are truncated, not rejected.
    pub fn deserialize(data: &[u8]) -> Result<Packet, CodecError> {
        if data.len() < 2 {
            return Err(CodecError::Short(data.len()));
        }

        let path_len = data[1] as usize;
        if path_len > MAX_PATH_LEN {
            return Err(CodecError::PathTooLong(data[1]));
        }
        if 2 + path_len > data.len() {
            return Err(CodecError::Short(data.len()));
        }

        let mut payload = &data[2 + path_len..];
        if payload.len() > MAX_PAYLOAD_LEN {
            payload = &payload[..MAX_PAYLOAD_LEN];
        }

        Ok(Packet {
            header: data[0],
            path: data[2..2 + path_len].to_vec(),
            payload: payload.to_vec(),
            rx_time_ms: 0,
            snr: 0,
            rssi: 0,
        })
    }

    /// DJB2 fingerprint used for deduplication.
    ///
    /// Hashes the header, then at most the first 8 path bytes and the first
    /// 16 payload bytes, so every node on the mesh computes the same
    /// identifier for the same frame regardless of trailing content.
    pub fn packet_id(&self) -> u32 {
        let mut h: u32 = 5381;
        h = (h.wrapping_shl(5).wrapping_add(h)) ^ self.header as u32;
        for &b in self.path.iter().take(8) {
            h = (h.wrapping_shl(5).wrapping_add(h)) ^ b as u32;
        }
        for &b in self.payload.iter().take(16) {
            h = (h.wrapping_shl(5).wrapping_add(h)) ^ b as u32;
        }
        h
    }
}
