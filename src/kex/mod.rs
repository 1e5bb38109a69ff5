//! Key exchange algorithms.
//!
//! The SSH protocol supports several key exchange (kex) algorithms, which are used to establish
//! the one-time keys used for message [encryption][crate::cipher] and
//! [authentication][crate::mac].
//!
//! The client and the server exchange lists of supported algorithms, and the first algorithm on
//! the client's list that is also supported by the server is used for the connection. Every
//! algorithm in this module implements both the client and the server half of the exchange.
//!
//! # Supported algorithms
//!
//! - "curve25519-sha256" / "curve25519-sha256@libssh.org" ([`CURVE25519_SHA256`] /
//! [`CURVE25519_SHA256_LIBSSH`])
//! - "diffie-hellman-group-exchange-sha256" ([`DIFFIE_HELLMAN_GROUP_EXCHANGE_SHA256`])
//! - "diffie-hellman-group-exchange-sha1" ([`DIFFIE_HELLMAN_GROUP_EXCHANGE_SHA1`])
//! - "diffie-hellman-group14-sha256" ([`DIFFIE_HELLMAN_GROUP14_SHA256`])
//! - "diffie-hellman-group16-sha512" ([`DIFFIE_HELLMAN_GROUP16_SHA512`])
//! - "diffie-hellman-group18-sha512" ([`DIFFIE_HELLMAN_GROUP18_SHA512`])
//! - "diffie-hellman-group14-sha1" ([`DIFFIE_HELLMAN_GROUP14_SHA1`])
use bytes::Bytes;
use derivative::Derivative;
use std::task::Poll;
use crate::Result;
use crate::codec::PacketDecode;
use crate::error::Error;
use crate::pubkey::{Privkey, PubkeyAlgo};
use crate::session::Role;
use crate::util::CryptoRngCore;
pub use self::curve25519::{CURVE25519_SHA256, CURVE25519_SHA256_LIBSSH};
pub use self::dh::{
    DIFFIE_HELLMAN_GROUP14_SHA1, DIFFIE_HELLMAN_GROUP14_SHA256,
    DIFFIE_HELLMAN_GROUP16_SHA512, DIFFIE_HELLMAN_GROUP18_SHA512,
};
pub use self::dh_gex::{
    GexBits, DIFFIE_HELLMAN_GROUP_EXCHANGE_SHA1, DIFFIE_HELLMAN_GROUP_EXCHANGE_SHA256,
};

mod curve25519;
mod dh;
mod dh_gex;
mod group;

/// All key exchange algorithms implemented by this crate, from the most preferred.
pub static ALL: &[&KexAlgo] = &[
    &CURVE25519_SHA256, &CURVE25519_SHA256_LIBSSH,
    &DIFFIE_HELLMAN_GROUP_EXCHANGE_SHA256,
    &DIFFIE_HELLMAN_GROUP16_SHA512, &DIFFIE_HELLMAN_GROUP18_SHA512,
    &DIFFIE_HELLMAN_GROUP14_SHA256,
    &DIFFIE_HELLMAN_GROUP_EXCHANGE_SHA1, &DIFFIE_HELLMAN_GROUP14_SHA1,
];

/// Finds a key exchange algorithm by its name.
pub fn by_name(name: &str) -> Option<&'static KexAlgo> {
    ALL.iter().copied().find(|algo| algo.name == name)
}

/// Algorithm for key exchange.
///
/// See the [module documentation][self] for details.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct KexAlgo {
    /// Name of the algorithm.
    pub name: &'static str,
    #[derivative(Debug = "ignore")]
    pub(crate) make_kex: fn(params: KexParams) -> Result<Box<dyn Kex + Send>>,
}

/// Parameters of a single run of the key exchange.
pub(crate) struct KexParams<'a> {
    pub role: Role,
    pub rng: &'a mut dyn CryptoRngCore,
    pub gex_bits: GexBits,
}

#[derive(Debug)]
pub(crate) struct KexInput<'a> {
    pub client_ident: &'a [u8],
    pub server_ident: &'a [u8],
    pub client_kex_init: &'a [u8],
    pub server_kex_init: &'a [u8],
    /// Host key that the server uses to sign the exchange hash (`None` on the client).
    pub host_key: Option<HostKey<'a>>,
}

#[derive(Derivative, Clone, Copy)]
#[derivative(Debug)]
pub(crate) struct HostKey<'a> {
    #[derivative(Debug = "ignore")]
    pub privkey: &'a Privkey,
    pub algo: &'static PubkeyAlgo,
}

pub(crate) struct KexOutput {
    pub shared_secret_be: Vec<u8>,
    pub exchange_hash: Vec<u8>,
    /// Encoded host key of the server (`K_S`).
    pub server_pubkey: Bytes,
    /// Signature of the exchange hash, which must be verified by the client.
    pub server_exchange_hash_sign: Bytes,
}

/// One run of a key exchange algorithm, for either role.
///
/// The session feeds received kex packets into [`recv_packet()`][Kex::recv_packet], drains
/// outgoing packets from [`send_packet()`][Kex::send_packet] and polls for the result. On the
/// server, the reply is queued when `poll()` returns `Ready`, so the session must drain
/// `send_packet()` once more after that.
pub(crate) trait Kex {
    fn recv_packet(&mut self, msg_id: u8, payload: &mut PacketDecode) -> Result<()>;
    fn send_packet(&mut self) -> Result<Option<Bytes>>;
    fn poll(&mut self, input: KexInput) -> Poll<Result<KexOutput>>;
    fn compute_hash(&self, data: &[u8]) -> Vec<u8>;
}

type HashFn = fn(&[u8]) -> Vec<u8>;

fn compute_hash_sha1(data: &[u8]) -> Vec<u8> {
    use sha1::digest::Digest as _;
    sha1::Sha1::digest(data).to_vec()
}

fn compute_hash_sha256(data: &[u8]) -> Vec<u8> {
    use sha2::digest::Digest as _;
    sha2::Sha256::digest(data).to_vec()
}

fn compute_hash_sha512(data: &[u8]) -> Vec<u8> {
    use sha2::digest::Digest as _;
    sha2::Sha512::digest(data).to_vec()
}

fn server_host_key<'a>(input: &KexInput<'a>) -> Result<HostKey<'a>> {
    input.host_key.ok_or(Error::Kex("server has no host key for the negotiated algorithm"))
}
