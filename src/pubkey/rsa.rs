use bytes::Bytes;
use rsa::traits::PublicKeyParts as _;
use sha2::Digest;
use std::fmt;
use crate::codec::{PacketDecode, PacketEncode};
use crate::error::{Result, Error};
use super::{PubkeyAlgo, Pubkey, Privkey, SignatureVerified};

/// "ssh-rsa" public key algorithm using SHA-1 from RFC 4253.
///
/// This algorithm is compatible with [`RsaPubkey`] and [`RsaPrivkey`].
pub static SSH_RSA_SHA1: PubkeyAlgo = PubkeyAlgo {
    name: "ssh-rsa",
    verify: verify::<sha1::Sha1>,
    sign: sign::<sha1::Sha1>,
};

/// "rsa-sha2-256" public key algorithm using SHA-256 from RFC 8332.
///
/// This algorithm is compatible with [`RsaPubkey`] and [`RsaPrivkey`].
pub static RSA_SHA2_256: PubkeyAlgo = PubkeyAlgo {
    name: "rsa-sha2-256",
    verify: verify::<sha2::Sha256>,
    sign: sign::<sha2::Sha256>,
};

/// "rsa-sha2-512" public key algorithm using SHA-512 from RFC 8332.
///
/// This algorithm is compatible with [`RsaPubkey`] and [`RsaPrivkey`].
pub static RSA_SHA2_512: PubkeyAlgo = PubkeyAlgo {
    name: "rsa-sha2-512",
    verify: verify::<sha2::Sha512>,
    sign: sign::<sha2::Sha512>,
};

/// Largest RSA modulus that we accept from the peer, in bits.
const MODULUS_BITS_MAX: usize = 16384;

/// RSA public key.
///
/// You can convert it to and from [`rsa::RsaPublicKey`] using `from()`/`into()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsaPubkey {
    pub(crate) pubkey: rsa::RsaPublicKey,
}

/// RSA private key.
///
/// You can convert it to and from [`rsa::RsaPrivateKey`] using `from()`/`into()`.
#[derive(Clone, PartialEq, Eq)]
#[cfg_attr(feature = "debug_less_secure", derive(Debug))]
pub struct RsaPrivkey {
    pub(crate) privkey: rsa::RsaPrivateKey,
}

impl RsaPrivkey {
    /// Get the public key associated with this private key.
    pub fn pubkey(&self) -> RsaPubkey {
        RsaPubkey { pubkey: self.privkey.to_public_key() }
    }
}

/// Name of the signature format of an algorithm that uses the hash `H`.
trait RsaHash: Digest + sha2::digest::const_oid::AssociatedOid {
    const SIGNATURE_FORMAT: &'static str;
}

impl RsaHash for sha1::Sha1 {
    const SIGNATURE_FORMAT: &'static str = "ssh-rsa";
}

impl RsaHash for sha2::Sha256 {
    const SIGNATURE_FORMAT: &'static str = "rsa-sha2-256";
}

impl RsaHash for sha2::Sha512 {
    const SIGNATURE_FORMAT: &'static str = "rsa-sha2-512";
}

fn verify<H: RsaHash>(pubkey: &Pubkey, message: &[u8], signature: Bytes) -> Result<SignatureVerified> {
    let Pubkey::Rsa(pubkey) = pubkey else { return Err(Error::PubkeyFormat) };

    let mut signature = PacketDecode::new(signature);
    if signature.get_string()? != H::SIGNATURE_FORMAT {
        return Err(Error::Decode("unexpected rsa signature format"))
    }
    let signature_data = signature.get_bytes()?;

    let hashed = H::digest(message);
    let scheme = rsa::Pkcs1v15Sign::new::<H>();
    match pubkey.pubkey.verify(scheme, &hashed, &signature_data) {
        Ok(_) => Ok(SignatureVerified::assertion()),
        Err(_) => Err(Error::Signature),
    }
}

fn sign<H: RsaHash>(privkey: &Privkey, message: &[u8]) -> Result<Bytes> {
    let Privkey::Rsa(privkey) = privkey else { return Err(Error::PrivkeyAlgo(H::SIGNATURE_FORMAT)) };

    let hashed = H::digest(message);
    let scheme = rsa::Pkcs1v15Sign::new::<H>();
    let signature_data = privkey.privkey.sign(scheme, &hashed)
        .map_err(|_| Error::Crypto("could not sign with rsa"))?;

    let mut signature = PacketEncode::new();
    signature.put_str(H::SIGNATURE_FORMAT);
    signature.put_bytes(&signature_data);
    Ok(signature.finish())
}

pub(super) fn encode_pubkey(blob: &mut PacketEncode, pubkey: &RsaPubkey) {
    blob.put_str("ssh-rsa");
    blob.put_biguint(pubkey.pubkey.e());
    blob.put_biguint(pubkey.pubkey.n());
}

pub(super) fn decode_pubkey(blob: &mut PacketDecode) -> Result<RsaPubkey> {
    let e = blob.get_biguint()?;
    let n = blob.get_biguint()?;
    let pubkey = rsa::RsaPublicKey::new_with_max_size(n, e, MODULUS_BITS_MAX)
        .map_err(|_| Error::Decode("decoded ssh-rsa pubkey is invalid"))?;
    Ok(RsaPubkey { pubkey })
}

impl From<rsa::RsaPublicKey> for RsaPubkey {
    fn from(pubkey: rsa::RsaPublicKey) -> Self { Self { pubkey } }
}

impl From<RsaPubkey> for rsa::RsaPublicKey {
    fn from(pubkey: RsaPubkey) -> Self { pubkey.pubkey }
}

impl From<rsa::RsaPrivateKey> for RsaPrivkey {
    fn from(privkey: rsa::RsaPrivateKey) -> Self { Self { privkey } }
}

impl From<RsaPrivkey> for rsa::RsaPrivateKey {
    fn from(privkey: RsaPrivkey) -> Self { privkey.privkey }
}

impl fmt::Display for RsaPubkey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "rsa {} bits, e {}", self.pubkey.n().bits(), self.pubkey.e())
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng as _;
    use super::*;

    #[test]
    fn test_rsa_sign_verify() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(3);
        let privkey: Privkey = rsa::RsaPrivateKey::new(&mut rng, 1024).unwrap().into();
        let pubkey = privkey.pubkey();

        for algo in [&RSA_SHA2_256, &RSA_SHA2_512, &SSH_RSA_SHA1] {
            let signature = (algo.sign)(&privkey, b"message").unwrap();
            assert!((algo.verify)(&pubkey, b"message", signature.clone()).is_ok());
            assert!((algo.verify)(&pubkey, b"massage", signature).is_err());
        }

        // a signature with sha-256 is not accepted as sha-512
        let signature = (RSA_SHA2_256.sign)(&privkey, b"message").unwrap();
        assert!((RSA_SHA2_512.verify)(&pubkey, b"message", signature).is_err());

        let decoded = Pubkey::decode(pubkey.encode()).unwrap();
        assert_eq!(decoded, pubkey);
    }
}
