use hmac::digest::core_api::BlockSizeUser;
use hmac::digest::{Digest, FixedOutputReset, KeyInit};
use hmac::{Mac as _, SimpleHmac};
use crate::{Error, Result};
use super::{Mac, MacAlgo, MacVerified};

/// "hmac-sha2-256" MAC from RFC 6668.
pub static HMAC_SHA2_256: MacAlgo = MacAlgo {
    name: "hmac-sha2-256",
    tag_len: 32,
    key_len: 32,
    make_mac: |key| Ok(Box::new(new_hmac::<sha2::Sha256>(key)?)),
};

/// "hmac-sha2-512" MAC from RFC 6668.
pub static HMAC_SHA2_512: MacAlgo = MacAlgo {
    name: "hmac-sha2-512",
    tag_len: 64,
    key_len: 64,
    make_mac: |key| Ok(Box::new(new_hmac::<sha2::Sha512>(key)?)),
};

/// "hmac-sha1" MAC from RFC 4253.
pub static HMAC_SHA1: MacAlgo = MacAlgo {
    name: "hmac-sha1",
    tag_len: 20,
    key_len: 20,
    make_mac: |key| Ok(Box::new(new_hmac::<sha1::Sha1>(key)?)),
};

struct HmacMac<D: Digest + BlockSizeUser> {
    hmac: SimpleHmac<D>,
}

fn new_hmac<D: Digest + BlockSizeUser>(key: &[u8]) -> Result<HmacMac<D>> {
    let hmac = <SimpleHmac<D> as KeyInit>::new_from_slice(key)
        .map_err(|_| Error::Crypto("invalid hmac key"))?;
    Ok(HmacMac { hmac })
}

impl<D: Digest + BlockSizeUser + FixedOutputReset> HmacMac<D> {
    fn update(&mut self, packet_seq: u32, data: &[u8]) {
        self.hmac.update(&packet_seq.to_be_bytes());
        self.hmac.update(data);
    }
}

impl<D: Digest + BlockSizeUser + FixedOutputReset> Mac for HmacMac<D> {
    fn sign(&mut self, packet_seq: u32, data: &[u8], tag: &mut [u8]) {
        self.update(packet_seq, data);
        tag.copy_from_slice(&self.hmac.finalize_reset().into_bytes());
    }

    fn verify(&mut self, packet_seq: u32, data: &[u8], tag: &[u8]) -> Result<MacVerified> {
        self.update(packet_seq, data);
        // constant-time comparison
        match self.hmac.verify_slice_reset(tag) {
            Ok(_) => Ok(MacVerified::assertion()),
            Err(_) => Err(Error::Mac),
        }
    }
}
