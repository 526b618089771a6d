//! The protocol hello sent to every approved client.

/// Hello packet of the connect server protocol (`C1 04 00 01`).
///
/// It is always the first thing a peer receives.
pub const HELLO_PACKET: [u8; 4] = [0xC1, 0x04, 0x00, 0x01];
