//! The MeshCore protocol core: wire codec, crypto primitives, identity,
//! time synchronization, adverts, the per-node containers, the mailbox,
//! link-health controls and the node state machine itself.

pub mod advert;
pub mod crypto;
pub mod health;
pub mod identity;
pub mod mailbox;
pub mod node;
pub mod packet;
pub mod tables;
pub mod timesync;
