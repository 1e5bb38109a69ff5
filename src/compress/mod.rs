//! Compression algorithms.
//!
//! Compression is negotiated independently for each direction, like [ciphers][crate::cipher] and
//! [MACs][crate::mac]. The payload of every packet is compressed before it is encrypted, and the
//! compression context is shared by all packets in one direction (RFC 4253, section 6.2).
//!
//! # Supported algorithms
//!
//! - "none" ([`NONE`])
//! - "zlib@openssh.com" ([`ZLIB_OPENSSH`]), which is only activated after the user is
//!   authenticated
//! - "zlib" ([`ZLIB`])
use derivative::Derivative;
use crate::Result;
pub use self::zlib::{ZLIB, ZLIB_OPENSSH};

mod zlib;

/// All compression algorithms implemented by this crate.
pub static ALL: &[&CompressAlgo] = &[&NONE, &ZLIB_OPENSSH, &ZLIB];

/// Finds a compression algorithm by its name.
pub fn by_name(name: &str) -> Option<&'static CompressAlgo> {
    ALL.iter().copied().find(|algo| algo.name == name)
}

/// "none" compression (payloads are sent as they are).
pub static NONE: CompressAlgo = CompressAlgo {
    name: "none",
    delayed: false,
    make_compress: || None,
    make_decompress: |_| None,
};

/// Algorithm for compressing packet payloads.
///
/// See the [module documentation][self] for details.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct CompressAlgo {
    /// Name of the algorithm.
    pub name: &'static str,
    /// Is the compression only started after successful authentication?
    pub delayed: bool,
    #[derivative(Debug = "ignore")]
    pub(crate) make_compress: fn() -> Option<Box<dyn Compress + Send>>,
    #[derivative(Debug = "ignore")]
    pub(crate) make_decompress: fn(len_max: usize) -> Option<Box<dyn Decompress + Send>>,
}

pub(crate) trait Compress {
    fn compress(&mut self, payload: &[u8]) -> Result<Vec<u8>>;
}

pub(crate) trait Decompress {
    fn decompress(&mut self, payload: &[u8]) -> Result<Vec<u8>>;
}

/// Compression state of one direction of the connection.
///
/// The state tracks the negotiated algorithm separately from the active context: delayed
/// algorithms are negotiated during key exchange, but the context is created only after
/// authentication.
pub(crate) struct CompressState<T: ?Sized> {
    algo: &'static CompressAlgo,
    context: Option<Box<T>>,
}

impl<T: ?Sized> CompressState<T> {
    pub fn new() -> Self {
        Self { algo: &NONE, context: None }
    }

    /// Switches to a newly negotiated algorithm. The existing context is kept when the
    /// algorithm did not change, so that rekeying does not reset the compression stream.
    pub fn set_algo(&mut self, algo: &'static CompressAlgo) {
        if self.algo.name != algo.name {
            log::debug!("compression changed from {:?} to {:?}", self.algo.name, algo.name);
            self.algo = algo;
            self.context = None;
        }
    }

    /// Creates the context if the algorithm should be active now.
    pub fn enable(&mut self, authenticated: bool, make: impl FnOnce(&'static CompressAlgo) -> Option<Box<T>>) {
        if self.context.is_none() && (!self.algo.delayed || authenticated) {
            self.context = make(self.algo);
            if self.context.is_some() {
                log::debug!("compression {:?} activated", self.algo.name);
            }
        }
    }

    pub fn context(&mut self) -> Option<&mut T> {
        self.context.as_deref_mut()
    }
}
