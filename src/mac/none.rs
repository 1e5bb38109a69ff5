use crate::Result;
use super::{Mac, MacAlgo, MacVerified};

/// "none" MAC (no message authentication).
///
/// This is only used before the first key exchange completes.
pub static NONE: MacAlgo = MacAlgo {
    name: "none",
    tag_len: 0,
    key_len: 0,
    make_mac: |_key| Ok(Box::new(Empty)),
};

#[derive(Debug)]
pub struct Empty;

impl Mac for Empty {
    fn sign(&mut self, _packet_seq: u32, _data: &[u8], tag: &mut [u8]) {
        debug_assert!(tag.is_empty());
    }

    fn verify(&mut self, _packet_seq: u32, _data: &[u8], tag: &[u8]) -> Result<MacVerified> {
        debug_assert!(tag.is_empty());
        Ok(MacVerified::assertion())
    }
}
