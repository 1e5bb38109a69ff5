//! SSH sessions for clients and servers.
//!
//! A [`Session`] is one SSH connection. The same state machine serves both sides of the
//! connection; the [`Role`] that you choose when you create the session (with
//! [`Session::connect()`] or [`Session::accept()`]) decides which half of the protocol we run.
pub use self::auth::{AuthFailure, AuthResult, AuthPasswordPrompt};
pub use self::auth_method::keyboard_interactive::{KbdInteractivePrompter, KbdInfoRequest, KbdPrompt};
pub use self::auth_server::{AuthRequest, AuthRequestMethod, AuthResponse, AuthResponder};
pub use self::authenticate::AuthCredentials;
pub use self::channel::{
    Channel, ChannelReceiver, ChannelEvent, ChannelReq, ChannelReplySender, ChannelPhase,
    DATA_STDERR,
};
pub use self::config::{SessionConfig, ChannelConfig};
pub use self::event::{
    SessionEvent, AcceptPubkey, AcceptChannel, DebugMsg, AuthBanner, GlobalReq, GlobalReply,
    GlobalReplySender,
};
pub use self::session::{Session, SessionReceiver, SessionFuture};
pub use self::state::Phase;

#[macro_use] mod pump;
mod auth;
mod auth_method;
mod auth_server;
mod authenticate;
mod channel;
mod channel_state;
mod config;
mod conn;
mod event;
mod negotiate;
mod recv;
#[allow(clippy::module_inception)]
mod session;
mod state;
mod window;

/// The side of the connection that we are playing.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Role {
    /// We connected to a server.
    Client,
    /// A client connected to us.
    Server,
}
