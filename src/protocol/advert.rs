//! Advert payload build and parse.
//!
//! Layout (offsets in the packet payload):
//!
//! | offset | size | field |
//! |--------|------|-------|
//! | 0      | 32   | public key |
//! | 32     | 4    | timestamp, unix seconds LE |
//! | 36     | 64   | Ed25519 signature over pubkey + timestamp + appdata |
//! | 100    | 1    | flags |
//! | 101    | 8    | lat/lon, LE i32 microdegrees each (if has-location) |
//! | ...    | 0-15 | UTF-8 name (if has-name) |
//!
//! Signature verification is not part of the parse path; callers that want
//! to authenticate an advert before trusting it invoke [`verify_signature`].

use thiserror::Error;

use crate::protocol::identity::{
    FLAG_HAS_LOCATION, FLAG_HAS_NAME, Identity, MAX_NAME_LEN, NODE_TYPE_CHAT, NODE_TYPE_MASK,
    NODE_TYPE_REPEATER, NODE_TYPE_SENSOR, PUBLIC_KEY_SIZE,
};
use crate::protocol::packet::{PAYLOAD_VER_1, Packet, PayloadType, RouteType};
use crate::protocol::timesync::TimeSync;

pub const ADVERT_TIMESTAMP_OFFSET: usize = 32;
pub const ADVERT_SIGNATURE_OFFSET: usize = 36;
pub const ADVERT_FLAGS_OFFSET: usize = 100;
pub const ADVERT_MIN_SIZE: usize = 101;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdvertError {
    #[error("advert payload too short ({0} bytes)")]
    Short(usize),
}

/// Fields parsed out of an advert payload.
#[derive(Debug, Clone, Default)]
pub struct AdvertInfo {
    pub public_key: [u8; PUBLIC_KEY_SIZE],
    /// Single-byte node hash (first public-key byte).
    pub hash: u8,
    pub timestamp: u32,
    pub flags: u8,
    pub has_location: bool,
    pub latitude: i32,
    pub longitude: i32,
    pub has_name: bool,
    pub name: String,
    pub is_repeater: bool,
    pub is_chat_node: bool,
    /// True when the flags byte looked invalid and the chat-node default was
    /// substituted (compatibility shim, see [`parse_advert`]).
    pub flags_coerced: bool,
}

/// Build a signed advert packet for `identity` at the node's current wall
/// clock. Flood routing unless the caller asks for a zero-hop local advert.
pub fn build_advert(identity: &Identity, time_sync: &TimeSync, route: RouteType) -> Packet {
    let mut pkt = Packet::new();
    pkt.set_header(route, PayloadType::Advert, PAYLOAD_VER_1);

    let timestamp = time_sync.get_timestamp();
    let appdata = build_appdata(identity);

    let mut sign_data = Vec::with_capacity(PUBLIC_KEY_SIZE + 4 + appdata.len());
    sign_data.extend_from_slice(&identity.public_key);
    sign_data.extend_from_slice(&timestamp.to_le_bytes());
    sign_data.extend_from_slice(&appdata);
    let signature = identity.sign(&sign_data);

    let mut payload = Vec::with_capacity(ADVERT_MIN_SIZE + appdata.len());
    payload.extend_from_slice(&identity.public_key);
    payload.extend_from_slice(&timestamp.to_le_bytes());
    payload.extend_from_slice(&signature);
    payload.extend_from_slice(&appdata);

    pkt.payload = payload;
    pkt
}

/// Appdata: `[flags][lat/lon?][name?]`.
fn build_appdata(identity: &Identity) -> Vec<u8> {
    let mut buf = vec![identity.flags];
    if identity.has_location() {
        buf.extend_from_slice(&identity.latitude.to_le_bytes());
        buf.extend_from_slice(&identity.longitude.to_le_bytes());
    }
    if identity.flags & FLAG_HAS_NAME != 0 {
        let name = identity.name.as_bytes();
        buf.extend_from_slice(&name[..name.len().min(MAX_NAME_LEN)]);
    }
    buf
}

/// Extract the timestamp field, or 0 for an undersized payload.
pub fn extract_timestamp(payload: &[u8]) -> u32 {
    if payload.len() < ADVERT_MIN_SIZE {
        return 0;
    }
    let bytes: [u8; 4] = payload[ADVERT_TIMESTAMP_OFFSET..ADVERT_TIMESTAMP_OFFSET + 4]
        .try_into()
        .unwrap_or_default();
    u32::from_le_bytes(bytes)
}

/// Parse an advert payload.
///
/// Compatibility shim: a flags byte with the name bit clear or an
/// out-of-range node type is treated as malformed and replaced by the
/// chat-node-with-name default, with the name read from offset 101 onward.
/// This mirrors deployed firmware and may hide genuine protocol violations;
/// `flags_coerced` records that it fired.
pub fn parse_advert(payload: &[u8]) -> Result<AdvertInfo, AdvertError> {
    if payload.len() < ADVERT_MIN_SIZE {
        return Err(AdvertError::Short(payload.len()));
    }

    let mut info = AdvertInfo {
        public_key: payload[..PUBLIC_KEY_SIZE].try_into().unwrap_or_default(),
        hash: payload[0],
        timestamp: extract_timestamp(payload),
        flags: payload[ADVERT_FLAGS_OFFSET],
        ..AdvertInfo::default()
    };

    let mut pos = ADVERT_FLAGS_OFFSET + 1;

    let node_type = info.flags & NODE_TYPE_MASK;
    let flags_valid = info.flags & FLAG_HAS_NAME != 0 && node_type <= NODE_TYPE_SENSOR;

    if flags_valid {
        info.is_repeater = node_type == NODE_TYPE_REPEATER;
        info.is_chat_node = node_type == NODE_TYPE_CHAT;
        info.has_location = info.flags & FLAG_HAS_LOCATION != 0;
        info.has_name = true;

        if info.has_location && payload.len() >= pos + 8 {
            info.latitude = i32::from_le_bytes(payload[pos..pos + 4].try_into().unwrap_or_default());
            info.longitude =
                i32::from_le_bytes(payload[pos + 4..pos + 8].try_into().unwrap_or_default());
            pos += 8;
        }
    } else {
        info.flags = NODE_TYPE_CHAT | FLAG_HAS_NAME;
        info.is_chat_node = true;
        info.has_name = true;
        info.flags_coerced = true;
    }

    if info.has_name && payload.len() > pos {
        let name_len = (payload.len() - pos).min(MAX_NAME_LEN);
        info.name = String::from_utf8_lossy(&payload[pos..pos + name_len]).into_owned();
    }

    Ok(info)
}

/// Opt-in signature check over `pubkey + timestamp + appdata`.
pub fn verify_signature(payload: &[u8]) -> bool {
    if payload.len() < ADVERT_MIN_SIZE {
        return false;
    }
    let mut signed = Vec::with_capacity(payload.len() - 64);
    signed.extend_from_slice(&payload[..ADVERT_SIGNATURE_OFFSET]);
    signed.extend_from_slice(&payload[ADVERT_FLAGS_OFFSET..]);
    Identity::verify(
        &payload[..PUBLIC_KEY_SIZE],
        &signed,
        &payload[ADVERT_SIGNATURE_OFFSET..ADVERT_SIGNATURE_OFFSET + 64],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::identity::FLAG_HAS_NAME;
    use crate::simulation::clock::VirtualClock;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn make_identity(name: &str, node_type: u8) -> Identity {
        let mut rng = StdRng::seed_from_u64(99);
        let mut id = Identity::generate(name, &mut rng);
        id.flags = node_type | FLAG_HAS_NAME;
        id
    }

    fn synced_time() -> TimeSync {
        let mut ts = TimeSync::new(VirtualClock::new());
        ts.set_time(1_700_000_000);
        ts
    }

    #[test]
    fn build_parse_roundtrip() {
        let id = make_identity("Relay1", NODE_TYPE_REPEATER);
        let pkt = build_advert(&id, &synced_time(), RouteType::Flood);

        assert_eq!(pkt.route_type(), RouteType::Flood);
        assert_eq!(pkt.payload_type(), PayloadType::Advert as u8);
        assert!(pkt.path.is_empty());

        let info = parse_advert(&pkt.payload).unwrap();
        assert_eq!(info.public_key, id.public_key);
        assert_eq!(info.hash, id.hash);
        assert_eq!(info.timestamp, 1_700_000_000);
        assert!(info.is_repeater);
        assert!(!info.is_chat_node);
        assert!(info.has_name);
        assert!(!info.has_location);
        assert_eq!(info.name, "Relay1");
        assert!(!info.flags_coerced);
    }

    #[test]
    fn location_is_carried_when_flagged() {
        let mut id = make_identity("Geo", NODE_TYPE_CHAT);
        id.set_location(45.5, -9.25);
        let pkt = build_advert(&id, &synced_time(), RouteType::Flood);
        let info = parse_advert(&pkt.payload).unwrap();
        assert!(info.has_location);
        assert_eq!(info.latitude, 45_500_000);
        assert_eq!(info.longitude, -9_250_000);
        assert_eq!(info.name, "Geo");
    }

    #[test]
    fn name_is_capped_at_15_bytes() {
        let id = make_identity("ABCDEFGHIJKLMNOPQRST", NODE_TYPE_CHAT);
        let pkt = build_advert(&id, &synced_time(), RouteType::Flood);
        let info = parse_advert(&pkt.payload).unwrap();
        assert_eq!(info.name, "ABCDEFGHIJKLMNO");
    }

    #[test]
    fn minimum_size_parses_with_empty_name() {
        let id = make_identity("Min", NODE_TYPE_CHAT);
        let mut pkt = build_advert(&id, &synced_time(), RouteType::Flood);
        pkt.payload.truncate(ADVERT_MIN_SIZE);
        assert_eq!(pkt.payload.len(), 101);

        let info = parse_advert(&pkt.payload).unwrap();
        assert!(!info.has_location);
        assert_eq!(info.name, "");
    }

    #[test]
    fn short_payload_is_rejected() {
        assert_eq!(
            parse_advert(&[0u8; 100]).unwrap_err(),
            AdvertError::Short(100)
        );
        assert_eq!(extract_timestamp(&[0u8; 100]), 0);
    }

    #[test]
    fn malformed_flags_are_coerced_to_chat_defaults() {
        let id = make_identity("Shim", NODE_TYPE_REPEATER);
        let pkt = build_advert(&id, &synced_time(), RouteType::Flood);

        // Clear the name bit: 0x02 fails the validity test.
        let mut payload = pkt.payload.clone();
        payload[ADVERT_FLAGS_OFFSET] = NODE_TYPE_REPEATER;
        let info = parse_advert(&payload).unwrap();
        assert!(info.flags_coerced);
        assert_eq!(info.flags, NODE_TYPE_CHAT | FLAG_HAS_NAME);
        assert!(info.is_chat_node);
        assert!(!info.is_repeater);
        // The name is still read from the byte after the flags.
        assert_eq!(info.name, "Shim");

        // Node type above 0x04 also trips the shim.
        let mut payload = pkt.payload.clone();
        payload[ADVERT_FLAGS_OFFSET] = FLAG_HAS_NAME | 0x05;
        assert!(parse_advert(&payload).unwrap().flags_coerced);
    }

    #[test]
    fn timestamp_extraction_matches_wire_field() {
        let id = make_identity("T", NODE_TYPE_CHAT);
        let mut ts = TimeSync::new(VirtualClock::new());
        ts.set_time(1_723_456_789);
        let pkt = build_advert(&id, &ts, RouteType::Flood);
        assert_eq!(extract_timestamp(&pkt.payload), 1_723_456_789);
    }

    #[test]
    fn signature_verifies_and_detects_tampering() {
        let mut id = make_identity("Signer", NODE_TYPE_REPEATER);
        id.set_location(1.0, 2.0);
        let pkt = build_advert(&id, &synced_time(), RouteType::Flood);
        assert!(verify_signature(&pkt.payload));

        // Flipping a bit in the appdata breaks the signature.
        let mut tampered = pkt.payload.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        assert!(!verify_signature(&tampered));

        // So does a forged timestamp.
        let mut tampered = pkt.payload.clone();
        tampered[ADVERT_TIMESTAMP_OFFSET] ^= 0x01;
        assert!(!verify_signature(&tampered));
    }

    #[test]
    fn local_advert_uses_direct_route() {
        let id = make_identity("Local", NODE_TYPE_REPEATER);
        let pkt = build_advert(&id, &synced_time(), RouteType::Direct);
        assert_eq!(pkt.route_type(), RouteType::Direct);
        assert!(pkt.path.is_empty());
    }
}
