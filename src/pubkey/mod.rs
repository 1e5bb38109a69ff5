//! Public key algorithms.
//!
//! The SSH protocol supports several public key algorithms, which are used to authenticate the
//! server (the server signs the exchange hash with its host key) and might also be used to
//! authenticate the client.
//!
//! # Supported algorithms
//!
//! - "ssh-ed25519" ([`SSH_ED25519`], uses [`Ed25519Pubkey`] and [`Ed25519Privkey`])
//! - "rsa-sha2-256" ([`RSA_SHA2_256`], uses [`RsaPubkey`] and [`RsaPrivkey`])
//! - "rsa-sha2-512" ([`RSA_SHA2_512`], uses [`RsaPubkey`] and [`RsaPrivkey`])
//! - "ssh-rsa" ([`SSH_RSA_SHA1`], uses [`RsaPubkey`] and [`RsaPrivkey`])
use bytes::Bytes;
use derivative::Derivative;
use std::fmt;
use crate::codec::{PacketDecode, PacketEncode};
use crate::error::{Result, Error};
pub use self::ed25519::{SSH_ED25519, Ed25519Pubkey, Ed25519Privkey};
pub use self::rsa::{SSH_RSA_SHA1, RSA_SHA2_256, RSA_SHA2_512, RsaPubkey, RsaPrivkey};

mod ed25519;
mod rsa;

/// All public key algorithms implemented by this crate.
pub static ALL: &[&PubkeyAlgo] = &[&SSH_ED25519, &RSA_SHA2_256, &RSA_SHA2_512, &SSH_RSA_SHA1];

/// Finds a public key algorithm by its name.
pub fn by_name(name: &str) -> Option<&'static PubkeyAlgo> {
    ALL.iter().copied().find(|algo| algo.name == name)
}

/// Algorithm for public key cryptography.
///
/// See the [module documentation][self] for details.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct PubkeyAlgo {
    /// Name of the algorithm.
    pub name: &'static str,
    #[derivative(Debug = "ignore")]
    pub(crate) verify: fn(pubkey: &Pubkey, message: &[u8], signature: Bytes) -> Result<SignatureVerified>,
    #[derivative(Debug = "ignore")]
    pub(crate) sign: fn(privkey: &Privkey, message: &[u8]) -> Result<Bytes>,
}

impl PubkeyAlgo {
    /// Can this algorithm be used with the given key?
    pub fn is_compatible(&'static self, pubkey: &Pubkey) -> bool {
        pubkey.algos_compatible_less_secure().iter().any(|algo| std::ptr::eq(*algo, self))
    }
}

/// Public key in one of supported formats.
///
/// This enum is marked as `#[non_exhaustive]`, so we might add new variants without breaking
/// backwards compatibility.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Pubkey {
    /// Ed25519 public key.
    Ed25519(Ed25519Pubkey),
    /// RSA public key.
    Rsa(RsaPubkey),
}

impl Pubkey {
    /// Get best public key algorithms that work with this key.
    ///
    /// With RSA keys ([`Pubkey::Rsa`]) there are multiple algorithms that differ in the hash
    /// function. This method returns only highly secure algorithms, but older peers may not
    /// support them.
    pub fn algos_secure(&self) -> &'static [&'static PubkeyAlgo] {
        static ED25519: &[&PubkeyAlgo] = &[&SSH_ED25519];
        static RSA: &[&PubkeyAlgo] = &[&RSA_SHA2_256, &RSA_SHA2_512];
        match self {
            Pubkey::Ed25519(_) => ED25519,
            Pubkey::Rsa(_) => RSA,
        }
    }

    /// Get all public key algorithms that work with this key.
    pub fn algos_compatible_less_secure(&self) -> &'static [&'static PubkeyAlgo] {
        static RSA: &[&PubkeyAlgo] = &[&RSA_SHA2_256, &RSA_SHA2_512, &SSH_RSA_SHA1];
        match self {
            Pubkey::Rsa(_) => RSA,
            _ => self.algos_secure(),
        }
    }

    /// Decode a public key from SSH wire encoding (RFC 4253, section 6.6).
    pub fn decode(blob: Bytes) -> Result<Self> {
        let mut blob = PacketDecode::new(blob);
        let format = blob.get_string()?;
        match format.as_str() {
            "ssh-ed25519" => ed25519::decode_pubkey(&mut blob).map(Pubkey::Ed25519),
            "ssh-rsa" => rsa::decode_pubkey(&mut blob).map(Pubkey::Rsa),
            _ => {
                log::debug!("unknown pubkey format {:?}", format);
                Err(Error::PubkeyFormat)
            },
        }
    }

    /// Encode a public key into SSH wire encoding.
    pub fn encode(&self) -> Bytes {
        let mut blob = PacketEncode::new();
        match self {
            Pubkey::Ed25519(pubkey) => ed25519::encode_pubkey(&mut blob, pubkey),
            Pubkey::Rsa(pubkey) => rsa::encode_pubkey(&mut blob, pubkey),
        }
        blob.finish()
    }

    /// Compute a fingerprint of the public key.
    ///
    /// The fingerprint is the SHA-256 digest of the encoded public key in base64 (not padded
    /// with `=` characters) and prefixed with `SHA256:`, in the format used by OpenSSH.
    pub fn fingerprint(&self) -> String {
        use base64::Engine as _;
        use sha2::Digest as _;
        let digest = sha2::Sha256::digest(self.encode());
        format!("SHA256:{}", base64::engine::general_purpose::STANDARD_NO_PAD.encode(digest))
    }
}

impl fmt::Display for Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Pubkey::Ed25519(pubkey) => fmt::Display::fmt(pubkey, f),
            Pubkey::Rsa(pubkey) => fmt::Display::fmt(pubkey, f),
        }
    }
}

/// Witness that a signature was verified.
#[derive(Debug)]
pub(crate) struct SignatureVerified(());

impl SignatureVerified {
    fn assertion() -> Self { Self(()) }
}

/// Private key (keypair) in one of supported formats.
///
/// Servers use private keys as host keys and clients use them for public key authentication.
/// Use `from()` to convert keys from [`ed25519_dalek`] or [`rsa`][::rsa].
#[derive(Clone, PartialEq, Eq)]
#[non_exhaustive]
#[cfg_attr(feature = "debug_less_secure", derive(Debug))]
pub enum Privkey {
    /// Ed25519 private key.
    Ed25519(Ed25519Privkey),
    /// RSA private key.
    Rsa(RsaPrivkey),
}

impl Privkey {
    /// Return the public key associated with this private key.
    pub fn pubkey(&self) -> Pubkey {
        match self {
            Privkey::Ed25519(privkey) => Pubkey::Ed25519(privkey.pubkey()),
            Privkey::Rsa(privkey) => Pubkey::Rsa(privkey.pubkey()),
        }
    }

    /// Sign a message with the given algorithm, returning the SSH encoding of the signature.
    pub fn sign(&self, algo: &'static PubkeyAlgo, message: &[u8]) -> Result<Bytes> {
        (algo.sign)(self, message)
    }
}

impl From<ed25519_dalek::SigningKey> for Privkey {
    fn from(signing: ed25519_dalek::SigningKey) -> Self {
        Privkey::Ed25519(signing.into())
    }
}

impl From<::rsa::RsaPrivateKey> for Privkey {
    fn from(privkey: ::rsa::RsaPrivateKey) -> Self {
        Privkey::Rsa(privkey.into())
    }
}

impl Pubkey {
    /// Verify a signature made with the given algorithm.
    pub fn verify(&self, algo: &'static PubkeyAlgo, message: &[u8], signature: Bytes) -> Result<()> {
        (algo.verify)(self, message, signature).map(|_| ())
    }
}
