//! Message authentication algorithms.
//!
//! The SSH protocol supports many message authentication algorithms (MACs), which are used to
//! provide **integrity** (the attacker cannot modify the messages that we exchange over SSH).
//!
//! The MAC is computed over the packet sequence number and the unencrypted packet (RFC 4253,
//! section 6.4). When the negotiated [cipher][crate::cipher] is an AEAD cipher, the MAC is not
//! used at all.
//!
//! # Supported algorithms
//!
//! - "hmac-sha2-256" ([`HMAC_SHA2_256`])
//! - "hmac-sha2-512" ([`HMAC_SHA2_512`])
//! - "hmac-sha1" ([`HMAC_SHA1`])
//! - "none" ([`NONE`])
use derivative::Derivative;
use crate::Result;
pub use self::hmac::{HMAC_SHA2_256, HMAC_SHA2_512, HMAC_SHA1};
pub use self::none::NONE;
pub(crate) use self::none::Empty;

mod hmac;
mod none;

/// All MAC algorithms implemented by this crate.
pub static ALL: &[&MacAlgo] = &[&HMAC_SHA2_256, &HMAC_SHA2_512, &HMAC_SHA1, &NONE];

/// Finds a MAC algorithm by its name.
pub fn by_name(name: &str) -> Option<&'static MacAlgo> {
    ALL.iter().copied().find(|algo| algo.name == name)
}

/// Algorithm for authenticating messages.
///
/// See the [module documentation][self] for details.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct MacAlgo {
    /// Name of the algorithm.
    pub name: &'static str,
    pub(crate) tag_len: usize,
    pub(crate) key_len: usize,
    #[derivative(Debug = "ignore")]
    pub(crate) make_mac: fn(key: &[u8]) -> Result<Box<dyn Mac + Send>>,
}

pub(crate) trait Mac {
    fn sign(&mut self, packet_seq: u32, data: &[u8], tag: &mut [u8]);
    fn verify(&mut self, packet_seq: u32, data: &[u8], tag: &[u8]) -> Result<MacVerified>;
}

/// Witness that the MAC of a packet was verified.
#[derive(Debug)]
pub(crate) struct MacVerified(());

impl MacVerified {
    pub fn assertion() -> Self {
        Self(())
    }
}
