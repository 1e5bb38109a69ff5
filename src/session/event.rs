use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::oneshot;
use crate::error::{ChannelOpenError, Error, Result};
use crate::promise::{Promise, Resolver};
use crate::pubkey::Pubkey;
use super::auth_server::AuthRequest;
use super::channel::{Channel, ChannelReceiver};
use super::config::ChannelConfig;

/// An event returned from [`SessionReceiver`][super::SessionReceiver].
///
/// These are "global" events that are related to the SSH connection, not to a particular channel.
/// A client must handle [`ServerPubkey`][Self::ServerPubkey] and a server must handle
/// [`AuthRequest`][Self::AuthRequest]; if you ignore these events, the key is rejected (and the
/// connection aborted) or the authentication request fails. You can safely ignore the other
/// events.
///
/// This enum is marked as `#[non_exhaustive]`, so that we can add new variants without breaking
/// backwards compatibility.
#[non_exhaustive]
#[derive(Debug)]
pub enum SessionEvent {
    /// Server presented its public key and you should verify it (client only).
    ///
    /// This event is produced as part of the SSH key exchange. You will always receive this event
    /// during the initial handshake, and you receive it again after every key re-exchange.
    ///
    /// We have already verified that the server owns the private key of this [`Pubkey`]; it is up
    /// to you to decide whether the key belongs to the server that you wanted to connect to (RFC
    /// 4251, section 4.1).
    ServerPubkey(Pubkey, AcceptPubkey),

    /// Peer sent us a debugging message (`SSH_MSG_DEBUG`, RFC 4253, section 11.3).
    DebugMsg(DebugMsg),

    /// Server sent a text that the user should see before authentication (client only).
    ///
    /// This is the `SSH_MSG_USERAUTH_BANNER` described in RFC 4252, section 5.4.
    AuthBanner(AuthBanner),

    /// Client asked to be authenticated (server only).
    AuthRequest(AuthRequest),

    /// Peer wants to open a channel.
    ///
    /// This corresponds to a received `SSH_MSG_CHANNEL_OPEN` (RFC 4254, section 5.1). If you drop
    /// the [`AcceptChannel`], the channel is rejected.
    Channel(AcceptChannel),

    /// Peer sent a global request.
    ///
    /// This corresponds to `SSH_MSG_GLOBAL_REQUEST` (RFC 4254, section 4). Replies are sent in the
    /// order of the requests, so a slow reply stalls the replies to the following requests.
    GlobalRequest(GlobalReq),
}

/// Debugging message sent by the peer.
#[derive(Debug, Clone)]
pub struct DebugMsg {
    /// If true, you should display this message.
    pub always_display: bool,
    /// The debugging message string.
    pub message: String,
    /// Language tag of the message (as in RFC 3066).
    pub message_lang: String,
}

/// Banner message sent by the server.
#[derive(Debug, Clone)]
pub struct AuthBanner {
    /// The banner message string.
    pub message: String,
    /// Language tag of the message (per RFC 3066).
    pub message_lang: String,
}

/// Tell us whether the server public key is valid.
///
/// You receive this object in [`SessionEvent::ServerPubkey`]. If you drop this object, it is
/// treated as rejection.
#[derive(Debug)]
pub struct AcceptPubkey {
    pub(super) accept_tx: oneshot::Sender<Result<PubkeyAccepted>>,
}

/// A "witness" that the user has really called [`AcceptPubkey::accept()`].
#[derive(Debug)]
pub(super) struct PubkeyAccepted(());

impl AcceptPubkey {
    /// Accept the server public key.
    pub fn accept(self) {
        let _ = self.accept_tx.send(Ok(PubkeyAccepted(())));
    }

    /// Reject the server public key.
    ///
    /// The connection will be aborted with error [`Error::PubkeyAccept`].
    pub fn reject<E: std::error::Error + Send + Sync + 'static>(self, err: E) {
        let _ = self.accept_tx.send(Err(Error::PubkeyAccept(Arc::new(err))));
    }
}

/// Channel that the peer wants to open.
///
/// You receive this object in [`SessionEvent::Channel`] and either
/// [accept][Self::accept()] or [reject][Self::reject()] the channel. Dropping it rejects the
/// channel with `SSH_OPEN_ADMINISTRATIVELY_PROHIBITED`.
#[derive(Debug)]
pub struct AcceptChannel {
    /// The type of the channel, such as `"session"` or `"direct-tcpip"`.
    pub channel_type: String,
    /// Channel specific data from the `SSH_MSG_CHANNEL_OPEN` packet.
    pub open_payload: Bytes,
    pub(super) decision_tx: oneshot::Sender<AcceptDecision>,
}

#[derive(Debug)]
pub(super) enum AcceptDecision {
    Accept {
        config: ChannelConfig,
        confirm_payload: Bytes,
        resolver: Resolver<(Channel, ChannelReceiver)>,
    },
    Reject(ChannelOpenError),
}

impl AcceptChannel {
    /// Accept the channel.
    ///
    /// The `confirm_payload` is appended to the `SSH_MSG_CHANNEL_OPEN_CONFIRMATION` as channel
    /// specific data. The promise resolves once the confirmation is sent.
    pub fn accept(self, config: ChannelConfig, confirm_payload: Bytes) -> Promise<(Channel, ChannelReceiver)> {
        let (resolver, promise) = Promise::new();
        let decision = AcceptDecision::Accept { config, confirm_payload, resolver };
        match self.decision_tx.send(decision) {
            Ok(()) => promise,
            Err(_) => Promise::ready(Err(Error::SessionClosed)),
        }
    }

    /// Reject the channel with the given error.
    pub fn reject(self, error: ChannelOpenError) {
        let _ = self.decision_tx.send(AcceptDecision::Reject(error));
    }
}

/// Global request received from the peer.
#[derive(Debug)]
pub struct GlobalReq {
    /// The type of the request, such as `"tcpip-forward"`.
    pub request_type: String,
    /// The raw type-specific request data.
    pub payload: Bytes,
    /// Sender for the reply, present if the peer wants a reply.
    ///
    /// If you drop the sender without replying, we send a failure reply.
    pub reply: Option<GlobalReplySender>,
}

/// Reply to a global request (RFC 4254, section 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalReply {
    /// Successful reply (`SSH_MSG_REQUEST_SUCCESS`) with response specific data.
    Success(Bytes),
    /// Failure reply (`SSH_MSG_REQUEST_FAILURE`).
    Failure,
}

/// Sends a reply to a [`GlobalReq`].
#[derive(Debug)]
pub struct GlobalReplySender {
    pub(super) reply_tx: oneshot::Sender<GlobalReply>,
}

impl GlobalReplySender {
    /// Reply with success and response specific data.
    pub fn success(self, payload: Bytes) {
        let _ = self.reply_tx.send(GlobalReply::Success(payload));
    }

    /// Reply with failure.
    pub fn failure(self) {
        let _ = self.reply_tx.send(GlobalReply::Failure);
    }
}
