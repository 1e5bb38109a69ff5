use derivative::Derivative;
use std::time::Duration;
use crate::{Error, Result};
use crate::cipher::{self, CipherAlgo};
use crate::compress::{self, CompressAlgo};
use crate::kex::{self, GexBits, KexAlgo};
use crate::mac::{self, MacAlgo};
use crate::pubkey::{self, Privkey, PubkeyAlgo};

/// Configuration of a [`Session`][super::Session].
///
/// You should start from the [default][Default] instance, which has reasonable default
/// configuration, and modify it according to your needs. You may also find the method
/// [`SessionConfig::with()`] syntactically convenient.
///
/// If you need compatibility with old SSH implementations that use outdated crypto, you may use
/// [`SessionConfig::default_compatible_less_secure()`]. However, this configuration is less
/// secure.
///
/// Some fields are only used by one side of the connection: a client ignores
/// [`host_keys`][Self::host_keys], [`auth_methods`][Self::auth_methods],
/// [`auth_banner`][Self::auth_banner] and [`max_auth_attempts`][Self::max_auth_attempts], and a
/// server ignores [`kbd_interactive_trials`][Self::kbd_interactive_trials].
///
/// This struct is `#[non_exhaustive]`, so we may add more fields without breaking backward
/// compatibility.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
#[non_exhaustive]
pub struct SessionConfig {
    /// Supported [key exchange algorithms][crate::kex].
    ///
    /// The first algorithm in the client's list that is also supported by the server is used. If
    /// there is no overlap, the connection will abort.
    pub kex_algos: Vec<&'static KexAlgo>,

    /// Supported [server public key algorithms][crate::pubkey].
    ///
    /// A server only offers the algorithms that work with one of its
    /// [`host_keys`][Self::host_keys].
    pub server_pubkey_algos: Vec<&'static PubkeyAlgo>,

    /// Supported [encryption algorithms][crate::cipher], in both directions.
    pub cipher_algos: Vec<&'static CipherAlgo>,

    /// Supported [message authentication algorithms][crate::mac], in both directions.
    ///
    /// The MAC is not negotiated for AEAD ciphers, which authenticate the packets themselves.
    pub mac_algos: Vec<&'static MacAlgo>,

    /// Supported [compression algorithms][crate::compress], in both directions.
    pub compress_algos: Vec<&'static CompressAlgo>,

    /// Start key re-exchange after this many bytes.
    ///
    /// The amount of data that symmetric ciphers can securely encrypt is limited, so we
    /// periodically repeat key exchange to generate new symmetric keys (RFC 4253, section 9). We
    /// trigger a key re-exchange after this number of bytes is sent or received.
    ///
    /// By default, this is 2^30 bytes (as recommended by RFC 4253). You can only make
    /// this value lower: higher values are ignored and the default is used instead.
    pub rekey_after_bytes: u64,

    /// Start key re-exchange after this amount of time.
    ///
    /// By default, we perform the re-exchange after one hour (as recommended by RFC 4253).
    pub rekey_after_duration: Duration,

    /// Bounds on the group size that a client requests in the Diffie-Hellman group exchange.
    pub gex_bits: GexBits,

    /// Maximal size of a received packet (payload and padding).
    pub recv_packet_len_max: usize,

    /// Default configuration of channels that we open or accept.
    pub channel: ChannelConfig,

    /// Software version that we send in our identification string.
    ///
    /// The identification string is `SSH-2.0-<software_version>`.
    pub software_version: String,

    /// How many times the client retries the "keyboard-interactive" method in
    /// [`Session::authenticate()`][super::Session::authenticate()].
    pub kbd_interactive_trials: u32,

    /// Private keys that the server uses to prove its identity.
    #[derivative(Debug = "ignore")]
    pub host_keys: Vec<Privkey>,

    /// Authentication methods that the server offers to clients.
    pub auth_methods: Vec<String>,

    /// Banner that the server sends to the client before the first authentication response.
    pub auth_banner: Option<String>,

    /// Number of failed authentication attempts after which the server disconnects.
    pub max_auth_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            kex_algos: vec![
                &kex::CURVE25519_SHA256, &kex::CURVE25519_SHA256_LIBSSH,
                &kex::DIFFIE_HELLMAN_GROUP_EXCHANGE_SHA256,
                &kex::DIFFIE_HELLMAN_GROUP16_SHA512, &kex::DIFFIE_HELLMAN_GROUP18_SHA512,
                &kex::DIFFIE_HELLMAN_GROUP14_SHA256,
            ],
            server_pubkey_algos: vec![
                &pubkey::SSH_ED25519,
                &pubkey::RSA_SHA2_256, &pubkey::RSA_SHA2_512,
            ],
            cipher_algos: vec![
                &cipher::AES128_GCM, &cipher::AES256_GCM,
                &cipher::AES128_CTR, &cipher::AES192_CTR, &cipher::AES256_CTR,
            ],
            mac_algos: vec![
                &mac::HMAC_SHA2_256, &mac::HMAC_SHA2_512,
            ],
            compress_algos: vec![
                &compress::NONE, &compress::ZLIB_OPENSSH, &compress::ZLIB,
            ],
            rekey_after_bytes: REKEY_AFTER_BYTES_MAX,
            rekey_after_duration: Duration::from_secs(60 * 60),
            gex_bits: GexBits::default(),
            recv_packet_len_max: 256 * 1024,
            channel: ChannelConfig::default(),
            software_version: concat!("hashi_", env!("CARGO_PKG_VERSION")).into(),
            kbd_interactive_trials: 3,
            host_keys: Vec::new(),
            auth_methods: vec![
                "publickey".into(), "password".into(), "keyboard-interactive".into(),
            ],
            auth_banner: None,
            max_auth_attempts: 6,
        }
    }
}

pub(super) const REKEY_AFTER_BYTES_MAX: u64 = 1 << 30;

impl SessionConfig {
    /// Default configuration with higher compatibility and lower security.
    ///
    /// Returns a configuration that includes support for outdated and potentially insecure crypto,
    /// notably SHA-1. **Use at your own risk!**
    pub fn default_compatible_less_secure() -> SessionConfig {
        Self::default().with(|c| {
            c.kex_algos.extend_from_slice(&[
                &kex::DIFFIE_HELLMAN_GROUP_EXCHANGE_SHA1,
                &kex::DIFFIE_HELLMAN_GROUP14_SHA1,
            ]);
            c.server_pubkey_algos.push(&pubkey::SSH_RSA_SHA1);
            c.cipher_algos.extend_from_slice(&[
                &cipher::AES128_CBC, &cipher::AES192_CBC, &cipher::AES256_CBC,
            ]);
            c.mac_algos.push(&mac::HMAC_SHA1);
        })
    }

    /// Mutate `self` in a closure.
    ///
    /// This method applies your closure to `self` and returns the mutated configuration.
    pub fn with<F: FnOnce(&mut Self)>(mut self, f: F) -> Self {
        f(&mut self);
        self
    }

    /// Replaces the algorithm lists with algorithms looked up by their names.
    ///
    /// An empty slice keeps the current list of that category. Unknown names produce
    /// [`Error::Config`].
    pub fn with_algo_names(
        mut self,
        kex_names: &[&str],
        cipher_names: &[&str],
        mac_names: &[&str],
        compress_names: &[&str],
    ) -> Result<Self> {
        fn lookup<A: ?Sized + 'static>(
            names: &[&str],
            by_name: fn(&str) -> Option<&'static A>,
            algos: &mut Vec<&'static A>,
            unknown_err: &'static str,
        ) -> Result<()> {
            if names.is_empty() {
                return Ok(())
            }
            *algos = names.iter()
                .map(|name| by_name(name).ok_or(Error::Config(unknown_err)))
                .collect::<Result<_>>()?;
            Ok(())
        }

        lookup(kex_names, kex::by_name, &mut self.kex_algos, "unknown key exchange algorithm")?;
        lookup(cipher_names, cipher::by_name, &mut self.cipher_algos, "unknown cipher")?;
        lookup(mac_names, mac::by_name, &mut self.mac_algos, "unknown mac algorithm")?;
        lookup(compress_names, compress::by_name, &mut self.compress_algos,
            "unknown compression algorithm")?;
        Ok(self)
    }

    pub(super) fn validate(&self) -> Result<()> {
        if self.kex_algos.is_empty() || self.server_pubkey_algos.is_empty() ||
            self.cipher_algos.is_empty() || self.compress_algos.is_empty()
        {
            return Err(Error::Config("algorithm lists must not be empty"))
        }
        if self.gex_bits.min > self.gex_bits.preferred || self.gex_bits.preferred > self.gex_bits.max {
            return Err(Error::Config("group exchange bounds must satisfy min <= preferred <= max"))
        }
        if !self.software_version.is_ascii() || self.software_version.contains([' ', '\r', '\n']) {
            return Err(Error::Config("software version must be printable ascii without spaces"))
        }
        Ok(())
    }

    pub(super) fn rekey_after_bytes(&self) -> u64 {
        self.rekey_after_bytes.min(REKEY_AFTER_BYTES_MAX)
    }
}

/// Configuration of a [`Channel`][super::Channel].
///
/// The defaults are used for channels opened with
/// [`Session::open_channel()`][super::Session::open_channel()].
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ChannelConfig {
    /// Maximal size of the receive window.
    ///
    /// The peer may send at most this many bytes before we replenish the window. We replenish the
    /// window only with data that you have received from the
    /// [`ChannelReceiver`][super::ChannelReceiver], so this also bounds the amount of data that is
    /// buffered in the channel.
    pub recv_window_max: u32,

    /// Maximal size of a data packet that we accept on the channel.
    pub recv_packet_len_max: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            recv_window_max: 2 * 1024 * 1024,
            recv_packet_len_max: 32 * 1024,
        }
    }
}

impl ChannelConfig {
    /// Mutate `self` in a closure.
    pub fn with<F: FnOnce(&mut Self)>(mut self, f: F) -> Self {
        f(&mut self);
        self
    }
}
