use aes::cipher::{BlockCipher, BlockEncrypt, BlockSizeUser, KeyInit};
use aes::cipher::consts::{U12, U16};
use aes::cipher::generic_array::GenericArray;
use aes_gcm::aead::AeadInPlace as _;
use crate::{Error, Result};
use crate::mac::MacVerified;
use super::{CipherAlgo, CipherAlgoVariant, AeadCipherAlgo, AeadEncrypt, AeadDecrypt};

/// "aes128-gcm@openssh.com" cipher described in RFC 5647 and slightly modified by OpenSSH.
///
/// This is an AEAD cipher that does not use an additional [mac algorithm][crate::mac].
pub static AES128_GCM: CipherAlgo = CipherAlgo {
    name: "aes128-gcm@openssh.com",
    block_len: 16,
    key_len: 16,
    iv_len: 12,
    variant: CipherAlgoVariant::Aead(AeadCipherAlgo {
        tag_len: 16,
        make_encrypt: |key, iv| Ok(Box::new(new_aes_gcm::<aes::Aes128>(key, iv)?)),
        make_decrypt: |key, iv| Ok(Box::new(new_aes_gcm::<aes::Aes128>(key, iv)?)),
    }),
};

/// "aes256-gcm@openssh.com" cipher described in RFC 5647 and slightly modified by OpenSSH.
///
/// This is an AEAD cipher that does not use an additional [mac algorithm][crate::mac].
pub static AES256_GCM: CipherAlgo = CipherAlgo {
    name: "aes256-gcm@openssh.com",
    block_len: 16,
    key_len: 32,
    iv_len: 12,
    variant: CipherAlgoVariant::Aead(AeadCipherAlgo {
        tag_len: 16,
        make_encrypt: |key, iv| Ok(Box::new(new_aes_gcm::<aes::Aes256>(key, iv)?)),
        make_decrypt: |key, iv| Ok(Box::new(new_aes_gcm::<aes::Aes256>(key, iv)?)),
    }),
};

struct AesGcmCipher<Aes> {
    aes_gcm: aes_gcm::AesGcm<Aes, U12>,
    iv_fixed: [u8; 4],
    iv_counter: u64,
}

fn new_aes_gcm<Aes>(key: &[u8], iv: &[u8]) -> Result<AesGcmCipher<Aes>>
    where Aes: KeyInit + BlockCipher + BlockSizeUser<BlockSize = U16> + BlockEncrypt,
{
    let aes_gcm = aes_gcm::AesGcm::new_from_slice(key)
        .map_err(|_| Error::Crypto("invalid key length for aes-gcm"))?;
    if iv.len() != 12 {
        return Err(Error::Crypto("invalid iv length for aes-gcm"))
    }

    // RFC 5647, section 7.1: the nonce is a fixed 4-byte field followed by an 8-byte invocation
    // counter that is incremented after every packet
    let mut iv_fixed = [0; 4];
    iv_fixed.copy_from_slice(&iv[..4]);
    let mut iv_counter = [0; 8];
    iv_counter.copy_from_slice(&iv[4..]);
    Ok(AesGcmCipher { aes_gcm, iv_fixed, iv_counter: u64::from_be_bytes(iv_counter) })
}

impl<Aes> AesGcmCipher<Aes> {
    fn next_nonce(&mut self) -> GenericArray<u8, U12> {
        let mut nonce = GenericArray::default();
        nonce[..4].copy_from_slice(&self.iv_fixed);
        nonce[4..].copy_from_slice(&self.iv_counter.to_be_bytes());
        self.iv_counter = self.iv_counter.wrapping_add(1);
        nonce
    }
}

impl<Aes> AeadEncrypt for AesGcmCipher<Aes>
    where Aes: BlockCipher + BlockSizeUser<BlockSize = U16> + BlockEncrypt,
{
    fn encrypt_and_sign(&mut self, _packet_seq: u32, packet: &mut [u8], tag: &mut [u8]) -> Result<()> {
        // the packet length is sent in plaintext, but it is authenticated as associated data
        let nonce = self.next_nonce();
        let (packet_len, packet_rest) = packet.split_at_mut(4);
        let aes_gcm_tag = self.aes_gcm.encrypt_in_place_detached(&nonce, packet_len, packet_rest)
            .map_err(|_| Error::Crypto("aes-gcm encryption failed"))?;
        tag.copy_from_slice(&aes_gcm_tag);
        Ok(())
    }
}

impl<Aes> AeadDecrypt for AesGcmCipher<Aes>
    where Aes: BlockCipher + BlockSizeUser<BlockSize = U16> + BlockEncrypt,
{
    fn decrypt_packet_len(&mut self, _packet_seq: u32, ciphertext: &[u8], plaintext: &mut [u8]) {
        plaintext.copy_from_slice(ciphertext);
    }

    fn decrypt_and_verify(&mut self, _packet_seq: u32, packet: &mut [u8], tag: &[u8]) -> Result<MacVerified> {
        let aes_gcm_tag = GenericArray::clone_from_slice(tag);
        let nonce = self.next_nonce();
        let (packet_len, packet_rest) = packet.split_at_mut(4);
        match self.aes_gcm.decrypt_in_place_detached(&nonce, packet_len, packet_rest, &aes_gcm_tag) {
            Ok(_) => Ok(MacVerified::assertion()),
            Err(_) => Err(Error::Mac),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonce_increments() {
        let mut iv = [0u8; 12];
        iv[11] = 0xff;
        let mut cipher = new_aes_gcm::<aes::Aes128>(&[0; 16], &iv).unwrap();
        assert_eq!(cipher.next_nonce()[11], 0xff);
        let nonce = cipher.next_nonce();
        assert_eq!(&nonce[10..], &[0x01, 0x00]);
    }

    #[test]
    fn test_tampered_packet_fails() {
        let (key, iv) = ([9u8; 32], [4u8; 12]);
        let mut encrypt = new_aes_gcm::<aes::Aes256>(&key, &iv).unwrap();
        let mut decrypt = new_aes_gcm::<aes::Aes256>(&key, &iv).unwrap();

        let mut packet = *b"\x00\x00\x00\x0cpayload-0123";
        let mut tag = [0; 16];
        encrypt.encrypt_and_sign(0, &mut packet, &mut tag).unwrap();
        packet[6] ^= 1;
        assert!(matches!(decrypt.decrypt_and_verify(0, &mut packet, &tag), Err(Error::Mac)));
    }
}
