//! Asynchronous SSH transport and connection protocol engine in pure Rust.
//!
//! The same [`Session`] state machine runs both sides of an SSH connection:
//!
//! - Clients call [`Session::connect()`], verify the server key from
//! [`SessionEvent::ServerPubkey`], authenticate with [`Session::authenticate()`] (or the
//! `auth_*` methods) and then open channels.
//! - Servers call [`Session::accept()`] with at least one host key in
//! [`SessionConfig::host_keys`], answer [`SessionEvent::AuthRequest`] events and accept channels
//! from [`SessionEvent::Channel`].
//!
//! Every operation that waits for the peer returns a [`Promise`].
#![allow(clippy::box_default)]
#![allow(clippy::collapsible_if)]
#![allow(clippy::unused_unit)]
#![allow(clippy::unit_arg)]
#![allow(clippy::module_inception)]
#![allow(clippy::type_complexity)]
#![warn(missing_docs)]

pub use crate::codec::{PacketEncode, PacketDecode};
pub use crate::error::{Result, Error, AlgoNegotiateError, DisconnectError, ChannelOpenError};
pub use crate::promise::Promise;
pub use crate::util::CryptoRngCore;
pub use crate::session::{
    Session, SessionReceiver, SessionFuture, SessionConfig, ChannelConfig, Role, Phase,
};
pub use crate::session::{
    SessionEvent, AcceptPubkey, AcceptChannel, DebugMsg, AuthBanner, GlobalReq, GlobalReply,
    GlobalReplySender,
};
pub use crate::session::{
    AuthFailure, AuthResult, AuthPasswordPrompt, AuthCredentials, KbdInteractivePrompter,
    KbdInfoRequest, KbdPrompt,
};
pub use crate::session::{AuthRequest, AuthRequestMethod, AuthResponse, AuthResponder};
pub use crate::session::{
    Channel, ChannelReceiver, ChannelEvent, ChannelReq, ChannelReplySender, ChannelPhase,
    DATA_STDERR,
};

pub use self::cipher::CipherAlgo;
pub use self::compress::CompressAlgo;
pub use self::kex::{KexAlgo, GexBits};
pub use self::mac::MacAlgo;
pub use self::pubkey::{PubkeyAlgo, Pubkey, Privkey};

pub use bytes;
pub use ed25519_dalek;
pub use rsa;

pub mod cipher;
mod codec;
pub mod codes;
pub mod compress;
mod error;
pub mod kex;
pub mod mac;
mod promise;
pub mod pubkey;
pub mod session;
mod util;
