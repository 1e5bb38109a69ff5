//! Encryption and decryption algorithms.
//!
//! The SSH protocol supports many symmetric encryption algorithms (ciphers), which are used to
//! provide **confidentiality** (the attacker cannot see the content of the messages that we exchange
//! over SSH).
//!
//! The client and the server exchange lists of supported algorithms, and the first algorithm on
//! the client's list that is also supported by the server is used for the connection. The
//! algorithms are chosen independently for each direction.
//!
//! # Supported algorithms
//!
//! - "aes128-gcm@openssh.com" ([`AES128_GCM`])
//! - "aes256-gcm@openssh.com" ([`AES256_GCM`])
//! - "aes128-ctr" ([`AES128_CTR`])
//! - "aes192-ctr" ([`AES192_CTR`])
//! - "aes256-ctr" ([`AES256_CTR`])
//! - "aes128-cbc" ([`AES128_CBC`])
//! - "aes192-cbc" ([`AES192_CBC`])
//! - "aes256-cbc" ([`AES256_CBC`])
//! - "none" ([`NONE`])
use derivative::Derivative;
use crate::Result;
use crate::mac::{Mac, MacVerified};
pub use self::aes_gcm::{AES128_GCM, AES256_GCM};
pub use self::block::{AES128_CBC, AES192_CBC, AES256_CBC};
pub use self::none::NONE;
pub use self::stream::{AES128_CTR, AES192_CTR, AES256_CTR};
pub(crate) use self::none::Identity;

mod aes_gcm;
mod block;
mod none;
mod stream;

/// All cipher algorithms implemented by this crate.
pub static ALL: &[&CipherAlgo] = &[
    &AES128_GCM, &AES256_GCM,
    &AES128_CTR, &AES192_CTR, &AES256_CTR,
    &AES128_CBC, &AES192_CBC, &AES256_CBC,
    &NONE,
];

/// Finds a cipher algorithm by its name.
pub fn by_name(name: &str) -> Option<&'static CipherAlgo> {
    ALL.iter().copied().find(|algo| algo.name == name)
}

/// Algorithm for encrypting and decrypting messages.
///
/// See the [module documentation][self] for details.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct CipherAlgo {
    /// Name of the algorithm.
    pub name: &'static str,
    pub(crate) block_len: usize,
    pub(crate) key_len: usize,
    pub(crate) iv_len: usize,
    #[derivative(Debug = "ignore")]
    pub(crate) variant: CipherAlgoVariant,
}

impl CipherAlgo {
    /// Does this cipher also authenticate the packets, so that no MAC is needed?
    pub fn is_aead(&self) -> bool {
        matches!(self.variant, CipherAlgoVariant::Aead(_))
    }

    pub(crate) fn tag_len(&self) -> Option<usize> {
        match &self.variant {
            CipherAlgoVariant::Standard(_) => None,
            CipherAlgoVariant::Aead(aead) => Some(aead.tag_len),
        }
    }
}

pub(crate) enum CipherAlgoVariant {
    Standard(StandardCipherAlgo),
    Aead(AeadCipherAlgo),
}

pub(crate) struct StandardCipherAlgo {
    pub make_encrypt: fn(key: &[u8], iv: &[u8]) -> Result<Box<dyn Encrypt + Send>>,
    pub make_decrypt: fn(key: &[u8], iv: &[u8]) -> Result<Box<dyn Decrypt + Send>>,
}

pub(crate) struct AeadCipherAlgo {
    pub tag_len: usize,
    pub make_encrypt: fn(key: &[u8], iv: &[u8]) -> Result<Box<dyn AeadEncrypt + Send>>,
    pub make_decrypt: fn(key: &[u8], iv: &[u8]) -> Result<Box<dyn AeadDecrypt + Send>>,
}

/// Block cipher or stream cipher used with a separate MAC.
pub(crate) trait Encrypt {
    fn encrypt(&mut self, data: &mut [u8]);
}

pub(crate) trait Decrypt {
    fn decrypt(&mut self, data: &mut [u8]);
}

/// Cipher that authenticates the packet on its own.
pub(crate) trait AeadEncrypt {
    fn encrypt_and_sign(&mut self, packet_seq: u32, packet: &mut [u8], tag: &mut [u8]) -> Result<()>;
}

pub(crate) trait AeadDecrypt {
    fn decrypt_packet_len(&mut self, packet_seq: u32, ciphertext: &[u8], plaintext: &mut [u8]);
    fn decrypt_and_verify(&mut self, packet_seq: u32, packet: &mut [u8], tag: &[u8]) -> Result<MacVerified>;
}

pub(crate) enum PacketEncrypt {
    EncryptAndMac(Box<dyn Encrypt + Send>, Box<dyn Mac + Send>),
    Aead(Box<dyn AeadEncrypt + Send>),
}

pub(crate) enum PacketDecrypt {
    EncryptAndMac(Box<dyn Decrypt + Send>, Box<dyn Mac + Send>),
    Aead(Box<dyn AeadDecrypt + Send>),
}

impl PacketEncrypt {
    pub fn is_aead(&self) -> bool {
        matches!(self, PacketEncrypt::Aead(_))
    }
}

impl PacketDecrypt {
    pub fn is_aead(&self) -> bool {
        matches!(self, PacketDecrypt::Aead(_))
    }
}
