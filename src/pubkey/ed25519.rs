use bytes::Bytes;
use ed25519_dalek::Signer as _;
use std::fmt;
use crate::codec::{PacketDecode, PacketEncode};
use crate::error::{Result, Error};
use super::{PubkeyAlgo, Pubkey, Privkey, SignatureVerified};

const ALGO_NAME: &str = "ssh-ed25519";

/// "ssh-ed25519" public key algorithm from RFC 8709.
///
/// This algorithm is compatible with [`Ed25519Pubkey`] and [`Ed25519Privkey`].
pub static SSH_ED25519: PubkeyAlgo = PubkeyAlgo {
    name: ALGO_NAME,
    verify,
    sign,
};

/// Ed25519 public key from RFC 8032.
///
/// Converts to and from [`ed25519_dalek::VerifyingKey`] with `from()`/`into()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ed25519Pubkey {
    pub(crate) verifying: ed25519_dalek::VerifyingKey,
}

/// Ed25519 keypair from RFC 8032.
///
/// Converts to and from [`ed25519_dalek::SigningKey`] with `from()`/`into()`.
#[derive(Clone)]
#[cfg_attr(feature = "debug_less_secure", derive(Debug))]
pub struct Ed25519Privkey {
    pub(crate) signing: ed25519_dalek::SigningKey,
}

impl Ed25519Privkey {
    /// The public half of the keypair.
    pub fn pubkey(&self) -> Ed25519Pubkey {
        self.signing.verifying_key().into()
    }
}

/// Signature blob: string "ssh-ed25519" followed by the 64 signature bytes (RFC 8709, section 6).
fn decode_signature(blob: Bytes) -> Result<ed25519_dalek::Signature> {
    let mut blob = PacketDecode::new(blob);
    if blob.get_string()? != ALGO_NAME {
        return Err(Error::Decode("ed25519 signature has unexpected format"))
    }
    Ok(ed25519_dalek::Signature::from_bytes(&blob.get_byte_array::<64>()?))
}

fn verify(pubkey: &Pubkey, message: &[u8], signature: Bytes) -> Result<SignatureVerified> {
    let Pubkey::Ed25519(pubkey) = pubkey else { return Err(Error::PubkeyFormat) };
    let signature = decode_signature(signature)?;
    pubkey.verifying.verify_strict(message, &signature)
        .map(|_| SignatureVerified::assertion())
        .map_err(|_| Error::Signature)
}

fn sign(privkey: &Privkey, message: &[u8]) -> Result<Bytes> {
    let Privkey::Ed25519(privkey) = privkey else { return Err(Error::PrivkeyAlgo(ALGO_NAME)) };
    let signature = privkey.signing.try_sign(message)
        .map_err(|_| Error::Crypto("ed25519 signing failed"))?;

    let mut blob = PacketEncode::new();
    blob.put_str(ALGO_NAME);
    blob.put_bytes(&signature.to_bytes());
    Ok(blob.finish())
}

pub(super) fn encode_pubkey(blob: &mut PacketEncode, pubkey: &Ed25519Pubkey) {
    blob.put_str(ALGO_NAME);
    blob.put_bytes(pubkey.verifying.as_bytes());
}

pub(super) fn decode_pubkey(blob: &mut PacketDecode) -> Result<Ed25519Pubkey> {
    let point = blob.get_byte_array::<32>()?;
    ed25519_dalek::VerifyingKey::from_bytes(&point)
        .map(Ed25519Pubkey::from)
        .map_err(|_| Error::Crypto("ed25519 public key is not a valid point"))
}

impl From<ed25519_dalek::VerifyingKey> for Ed25519Pubkey {
    fn from(verifying: ed25519_dalek::VerifyingKey) -> Self { Self { verifying } }
}

impl From<Ed25519Pubkey> for ed25519_dalek::VerifyingKey {
    fn from(pubkey: Ed25519Pubkey) -> Self { pubkey.verifying }
}

impl From<ed25519_dalek::SigningKey> for Ed25519Privkey {
    fn from(signing: ed25519_dalek::SigningKey) -> Self { Self { signing } }
}

impl From<Ed25519Privkey> for ed25519_dalek::SigningKey {
    fn from(privkey: Ed25519Privkey) -> Self { privkey.signing }
}

impl fmt::Display for Ed25519Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ed25519 {:x}", Bytes::copy_from_slice(self.verifying.as_bytes()))
    }
}

impl PartialEq for Ed25519Privkey {
    fn eq(&self, other: &Self) -> bool {
        self.signing.as_bytes() == other.signing.as_bytes()
    }
}

impl Eq for Ed25519Privkey {}

#[cfg(test)]
mod tests {
    use super::*;

    fn privkey(seed: u8) -> Privkey {
        ed25519_dalek::SigningKey::from_bytes(&[seed; 32]).into()
    }

    #[test]
    fn test_sign_verify() {
        let key = privkey(1);
        let signature = sign(&key, b"exchange hash").unwrap();
        assert!(verify(&key.pubkey(), b"exchange hash", signature.clone()).is_ok());
        assert!(matches!(verify(&key.pubkey(), b"other hash", signature.clone()), Err(Error::Signature)));
        assert!(matches!(verify(&privkey(2).pubkey(), b"exchange hash", signature), Err(Error::Signature)));
    }

    #[test]
    fn test_signature_with_wrong_name() {
        let mut blob = PacketEncode::new();
        blob.put_str("ssh-rsa");
        blob.put_bytes(&[0; 64]);
        assert!(matches!(decode_signature(blob.finish()), Err(Error::Decode(_))));
    }

    #[test]
    fn test_pubkey_blob() {
        let pubkey = match privkey(3).pubkey() {
            Pubkey::Ed25519(pubkey) => pubkey,
            pubkey => panic!("unexpected key {}", pubkey),
        };
        let mut blob = PacketEncode::new();
        encode_pubkey(&mut blob, &pubkey);
        let mut blob = PacketDecode::new(blob.finish());
        assert_eq!(blob.get_string().unwrap(), ALGO_NAME);
        assert_eq!(decode_pubkey(&mut blob).unwrap(), pubkey);
    }
}
