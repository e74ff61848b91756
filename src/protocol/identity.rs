//! Node identity: an Ed25519 keypair plus display attributes.
//!
//! The single-byte node hash is the first byte of the public key and is used
//! everywhere paths or destinations name a node. Collisions are possible and
//! accepted; the full public key travels in adverts for hosts that need
//! stronger identification.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::StdRng;

/// Ed25519 public key length.
pub const PUBLIC_KEY_SIZE: usize = 32;
/// Ed25519 signature length.
pub const SIGNATURE_SIZE: usize = 64;
/// Maximum display-name length in bytes (UTF-8).
pub const MAX_NAME_LEN: usize = 15;

/// Identity flags byte: low nibble is the node type, high bits are feature
/// markers.
pub const FLAG_HAS_LOCATION: u8 = 0x10;
pub const FLAG_HAS_NAME: u8 = 0x80;

pub const NODE_TYPE_CHAT: u8 = 0x01;
pub const NODE_TYPE_REPEATER: u8 = 0x02;
pub const NODE_TYPE_ROOM_SERVER: u8 = 0x03;
pub const NODE_TYPE_SENSOR: u8 = 0x04;
pub const NODE_TYPE_MASK: u8 = 0x0F;

/// Ed25519 identity of a mesh node. Created at node init, immutable keys.
pub struct Identity {
    signing_key: SigningKey,
    pub public_key: [u8; PUBLIC_KEY_SIZE],
    /// Single-byte node hash: first byte of the public key.
    pub hash: u8,
    pub name: String,
    pub flags: u8,
    /// Signed microdegrees.
    pub latitude: i32,
    /// Signed microdegrees.
    pub longitude: i32,
}

impl Identity {
    /// Generate a fresh identity from the injected CSPRNG. An empty name
    /// falls back to `CC-XXXXXX` derived from the public key.
    pub fn generate(name: &str, rng: &mut StdRng) -> Identity {
        let signing_key = SigningKey::generate(rng);
        let public_key = signing_key.verifying_key().to_bytes();
        let name = if name.is_empty() {
            format!(
                "CC-{:02X}{:02X}{:02X}",
                public_key[0], public_key[1], public_key[2]
            )
        } else {
            name.to_string()
        };
        Identity {
            signing_key,
            public_key,
            hash: public_key[0],
            name,
            flags: 0,
            latitude: 0,
            longitude: 0,
        }
    }

    /// Sign arbitrary bytes, returning the 64-byte signature.
    pub fn sign(&self, data: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing_key.sign(data).to_bytes()
    }

    /// Verify an Ed25519 signature against a raw 32-byte public key.
    pub fn verify(public_key: &[u8], data: &[u8], signature: &[u8]) -> bool {
        let Ok(pk) = <[u8; PUBLIC_KEY_SIZE]>::try_from(public_key) else {
            return false;
        };
        let Ok(sig) = <[u8; SIGNATURE_SIZE]>::try_from(signature) else {
            return false;
        };
        let Ok(vk) = VerifyingKey::from_bytes(&pk) else {
            return false;
        };
        vk.verify(data, &Signature::from_bytes(&sig)).is_ok()
    }

    /// Set the advertised position in degrees; clears the location flag when
    /// both coordinates are zero.
    pub fn set_location(&mut self, lat: f64, lon: f64) {
        self.latitude = (lat * 1_000_000.0) as i32;
        self.longitude = (lon * 1_000_000.0) as i32;
        if lat != 0.0 || lon != 0.0 {
            self.flags |= FLAG_HAS_LOCATION;
        } else {
            self.flags &= !FLAG_HAS_LOCATION;
        }
    }

    pub fn has_location(&self) -> bool {
        self.flags & FLAG_HAS_LOCATION != 0
    }

    pub fn node_type(&self) -> u8 {
        self.flags & NODE_TYPE_MASK
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    #[test]
    fn hash_is_first_public_key_byte() {
        let id = Identity::generate("TestNode", &mut rng());
        assert_eq!(id.hash, id.public_key[0]);
    }

    #[test]
    fn generation_is_deterministic_under_a_seed() {
        let a = Identity::generate("A", &mut rng());
        let b = Identity::generate("A", &mut rng());
        assert_eq!(a.public_key, b.public_key);
    }

    #[test]
    fn default_name_derived_from_key() {
        let id = Identity::generate("", &mut rng());
        let expected = format!(
            "CC-{:02X}{:02X}{:02X}",
            id.public_key[0], id.public_key[1], id.public_key[2]
        );
        assert_eq!(id.name, expected);
    }

    #[test]
    fn sign_and_verify() {
        let id = Identity::generate("Signer", &mut rng());
        let sig = id.sign(b"payload bytes");
        assert!(Identity::verify(&id.public_key, b"payload bytes", &sig));
        assert!(!Identity::verify(&id.public_key, b"other bytes", &sig));

        let other = Identity::generate("Other", &mut StdRng::seed_from_u64(7));
        assert!(!Identity::verify(&other.public_key, b"payload bytes", &sig));
    }

    #[test]
    fn verify_rejects_malformed_inputs() {
        let id = Identity::generate("X", &mut rng());
        let sig = id.sign(b"data");
        assert!(!Identity::verify(&id.public_key[..31], b"data", &sig));
        assert!(!Identity::verify(&id.public_key, b"data", &sig[..63]));
    }

    #[test]
    fn location_flag_tracks_coordinates() {
        let mut id = Identity::generate("Geo", &mut rng());
        assert!(!id.has_location());

        id.set_location(45.464211, 9.191383);
        assert!(id.has_location());
        assert_eq!(id.latitude, 45_464_211);
        assert_eq!(id.longitude, 9_191_383);

        id.set_location(0.0, 0.0);
        assert!(!id.has_location());
    }
}
