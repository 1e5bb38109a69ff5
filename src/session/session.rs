use bytes::Bytes;
use parking_lot::Mutex;
use pin_project::pin_project;
use rand::rngs::OsRng;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use crate::error::{Error, Result, DisconnectError};
use crate::promise::Promise;
use crate::pubkey::{Privkey, PubkeyAlgo};
use crate::util::CryptoRngCore;
use super::{auth, authenticate, conn, negotiate, Role};
use super::auth::AuthResult;
use super::auth_method::AuthMethod;
use super::auth_method::keyboard_interactive::{AuthKbdInteractive, KbdInteractivePrompter};
use super::auth_method::none::AuthNone;
use super::auth_method::password::AuthPassword;
use super::auth_method::pubkey::AuthPubkey;
use super::authenticate::AuthCredentials;
use super::channel::{Channel, ChannelReceiver};
use super::config::{SessionConfig, ChannelConfig};
use super::conn::OpenChannel;
use super::event::{SessionEvent, GlobalReply};
use super::state::{self, SessionState, Phase};

/// Handle to an SSH session.
///
/// Use this object to interact with the peer: authenticate (as a client), open channels, send
/// global requests, rekey and disconnect. In tandem, you will also need to use
/// [`SessionReceiver`] to handle events produced by the peer, and [`SessionFuture`] to perform the
/// actual I/O.
///
/// You can cheaply clone this object and safely share the clones between tasks.
#[derive(Debug, Clone)]
pub struct Session {
    st: Weak<Mutex<SessionState>>,
}

impl Session {
    /// Creates the client side of an SSH session from an existing stream.
    ///
    /// We initialize the session, but do not perform any I/O in this method. You should use the
    /// returned objects as follows:
    ///
    /// - [`Session`] allows you to interact with the SSH session. As a client, you should use it
    /// to authenticate yourself to the server and then you can open channels.
    /// - [`SessionReceiver`] produces [`SessionEvent`]s, which mostly correspond to actions
    /// initiated by the peer. A client must handle [`SessionEvent::ServerPubkey`]. You **must**
    /// receive these events in a timely manner, otherwise the session will stall.
    /// - [`SessionFuture`] is a future that you must poll to drive the session forward. You will
    /// usually spawn a task for this future.
    pub fn connect<IO>(stream: IO, config: SessionConfig) -> Result<(Session, SessionReceiver, SessionFuture<IO>)>
        where IO: AsyncRead + AsyncWrite
    {
        Self::connect_with_rng(stream, config, Box::new(OsRng))
    }

    /// Creates the server side of an SSH session from a stream accepted from a client.
    ///
    /// The [`host_keys`][SessionConfig::host_keys] in `config` must not be empty. A server must
    /// handle [`SessionEvent::AuthRequest`] to let clients in.
    pub fn accept<IO>(stream: IO, config: SessionConfig) -> Result<(Session, SessionReceiver, SessionFuture<IO>)>
        where IO: AsyncRead + AsyncWrite
    {
        Self::accept_with_rng(stream, config, Box::new(OsRng))
    }

    /// Like [`connect()`][Self::connect()], but uses `rng` for all randomness of the session.
    pub fn connect_with_rng<IO>(
        stream: IO,
        config: SessionConfig,
        rng: Box<dyn CryptoRngCore + Send>,
    ) -> Result<(Session, SessionReceiver, SessionFuture<IO>)>
        where IO: AsyncRead + AsyncWrite
    {
        Self::new(Role::Client, stream, config, rng)
    }

    /// Like [`accept()`][Self::accept()], but uses `rng` for all randomness of the session.
    pub fn accept_with_rng<IO>(
        stream: IO,
        config: SessionConfig,
        rng: Box<dyn CryptoRngCore + Send>,
    ) -> Result<(Session, SessionReceiver, SessionFuture<IO>)>
        where IO: AsyncRead + AsyncWrite
    {
        Self::new(Role::Server, stream, config, rng)
    }

    fn new<IO>(
        role: Role,
        stream: IO,
        config: SessionConfig,
        rng: Box<dyn CryptoRngCore + Send>,
    ) -> Result<(Session, SessionReceiver, SessionFuture<IO>)>
        where IO: AsyncRead + AsyncWrite
    {
        let (event_tx, event_rx) = mpsc::channel(1);
        let session_st = state::new_session(role, config, rng, event_tx)?;
        log::debug!("created {:?} session", role);

        let session = Session { st: Arc::downgrade(&session_st) };
        let session_rx = SessionReceiver { event_rx };
        let session_fut = SessionFuture { session_st, stream };
        Ok((session, session_rx, session_fut))
    }

    fn upgrade(&self) -> Result<Arc<Mutex<SessionState>>> {
        self.st.upgrade().ok_or(Error::SessionClosed)
    }

    fn with_state<T, F>(&self, f: F) -> Result<T>
        where F: FnOnce(&mut SessionState) -> Result<T>
    {
        let st = self.upgrade()?;
        let mut st = st.lock();
        f(&mut st)
    }

    fn promise<T, F>(&self, f: F) -> Promise<T>
        where F: FnOnce(&mut SessionState, crate::promise::Resolver<T>) -> Result<()>
    {
        let (resolver, promise) = Promise::new();
        match self.with_state(|st| f(st, resolver)) {
            Ok(()) => promise,
            Err(err) => Promise::ready(Err(err)),
        }
    }

    /// Our role in the session.
    pub fn role(&self) -> Result<Role> {
        self.with_state(|st| Ok(st.role))
    }

    /// Current phase of the session.
    pub fn phase(&self) -> Phase {
        match self.st.upgrade() {
            Some(st) => state::phase(&st.lock()),
            None => Phase::Closed,
        }
    }

    /// Returns true while a key re-exchange is running.
    pub fn is_rekeying(&self) -> bool {
        match self.st.upgrade() {
            Some(st) => negotiate::is_rekeying(&st.lock()),
            None => false,
        }
    }

    /// The session identifier, the exchange hash of the first key exchange.
    ///
    /// Returns `None` before the first key exchange finishes. Once set, the identifier never
    /// changes, not even after a key re-exchange.
    pub fn session_id(&self) -> Option<Bytes> {
        let st = self.st.upgrade()?;
        let st = st.lock();
        st.session_id.as_deref().map(Bytes::copy_from_slice)
    }

    /// Returns true if the client has been authenticated.
    pub fn is_authenticated(&self) -> Result<bool> {
        self.with_state(|st| Ok(state::is_authenticated(st)))
    }

    /// Triggers key re-exchange.
    ///
    /// Normally, we trigger the re-exchange automatically (see
    /// [`SessionConfig::rekey_after_bytes`] and [`SessionConfig::rekey_after_duration`]), but you
    /// can use this method to start the exchange earlier. If an exchange is already in progress,
    /// the promise resolves when it completes.
    pub fn rekey(&self) -> Promise<()> {
        self.promise(|st, resolver| {
            state::check_open(st)?;
            negotiate::start_kex(st, resolver);
            Ok(())
        })
    }

    /// Disconnects and closes the session.
    ///
    /// We send `SSH_MSG_DISCONNECT` to the peer, so that they can be sure that we intended to
    /// close the connection. After this message is sent, the [`SessionFuture`] returns. You may
    /// want to use [`DisconnectError::by_app()`] as a reasonable default value of `error`.
    pub fn disconnect(&self, error: DisconnectError) -> Result<()> {
        self.with_state(|st| state::disconnect(st, error))
    }

    /// Tries to authenticate using the "none" method (client only).
    ///
    /// The "none" method (RFC 4252, section 5.2) is mostly useful to learn the list of methods
    /// that the server supports for this user.
    pub fn auth_none(&self, username: String) -> Promise<AuthResult> {
        self.start_auth(|resolver| Box::new(AuthNone::new(username, resolver)))
    }

    /// Tries to authenticate using the "password" method (client only).
    ///
    /// If the server asks for a password change, the promise resolves with
    /// [`AuthResult::ChangePassword`] and you may call
    /// [`auth_password_change()`][Self::auth_password_change()].
    pub fn auth_password(&self, username: String, password: String) -> Promise<AuthResult> {
        self.start_auth(|resolver| Box::new(AuthPassword::new(username, password, None, resolver)))
    }

    /// Tries to authenticate with the "password" method while changing the password.
    pub fn auth_password_change(
        &self,
        username: String,
        old_password: String,
        new_password: String,
    ) -> Promise<AuthResult> {
        self.start_auth(|resolver| {
            Box::new(AuthPassword::new(username, old_password, Some(new_password), resolver))
        })
    }

    /// Tries to authenticate using the "publickey" method (client only).
    ///
    /// You must specify the private key `privkey` and `pubkey_algo`, the algorithm used to prove
    /// that you own the private key. The algorithm must be compatible with the key (see
    /// [`Pubkey::algos_secure()`][crate::Pubkey::algos_secure()]).
    pub fn auth_pubkey(
        &self,
        username: String,
        privkey: Privkey,
        pubkey_algo: &'static PubkeyAlgo,
    ) -> Promise<AuthResult> {
        self.start_auth(|resolver| Box::new(AuthPubkey::new(username, privkey, pubkey_algo, resolver)))
    }

    /// Tries to authenticate using the "keyboard-interactive" method (client only).
    ///
    /// Every `SSH_MSG_USERAUTH_INFO_REQUEST` from the server is passed to `prompter`, which returns
    /// the responses (RFC 4256).
    pub fn auth_keyboard_interactive(
        &self,
        username: String,
        prompter: Arc<dyn KbdInteractivePrompter + Send + Sync>,
    ) -> Promise<AuthResult> {
        self.start_auth(|resolver| Box::new(AuthKbdInteractive::new(username, prompter, resolver)))
    }

    fn start_auth<F>(&self, make_method: F) -> Promise<AuthResult>
        where F: FnOnce(crate::promise::Resolver<AuthResult>) -> Box<dyn AuthMethod + Send>
    {
        self.promise(|st, resolver| {
            if st.role != Role::Client {
                return Err(Error::WrongRole)
            }
            auth::start_method(st, make_method(resolver))
        })
    }

    /// Authenticates the client by trying the methods in `credentials` (client only).
    ///
    /// We first send the "none" method to learn which methods the server accepts, then try
    /// "publickey" with each of the keys, "keyboard-interactive" and "password", skipping the
    /// methods that the server does not list. If no method succeeds, we disconnect and return
    /// [`Error::AuthFailed`].
    pub async fn authenticate(&self, username: &str, credentials: AuthCredentials) -> Result<()> {
        let (role, kbd_interactive_trials) = self.with_state(|st| {
            Ok((st.role, st.config.kbd_interactive_trials))
        })?;
        if role != Role::Client {
            return Err(Error::WrongRole)
        }
        authenticate::authenticate(self, username, credentials, kbd_interactive_trials).await
    }

    /// Opens a channel with the default [`ChannelConfig`] from the [`SessionConfig`].
    ///
    /// See [`open_channel_with_config()`][Self::open_channel_with_config()].
    pub fn open_channel(&self, channel_type: &str, open_payload: Bytes) -> Promise<(Channel, ChannelReceiver, Bytes)> {
        let config = match self.with_state(|st| Ok(st.config.channel.clone())) {
            Ok(config) => config,
            Err(err) => return Promise::ready(Err(err)),
        };
        self.open_channel_with_config(channel_type, config, open_payload)
    }

    /// Opens a channel (RFC 4254, section 5.1).
    ///
    /// The bytes in `open_payload` are appended to the `SSH_MSG_CHANNEL_OPEN` packet as the
    /// "channel specific data". If the peer confirms the channel, you receive the [`Channel`], the
    /// [`ChannelReceiver`] and the channel specific data from
    /// `SSH_MSG_CHANNEL_OPEN_CONFIRMATION`. If the peer refuses, the promise fails with
    /// [`Error::ChannelOpen`].
    ///
    /// The channel is opened only after the client is authenticated.
    pub fn open_channel_with_config(
        &self,
        channel_type: &str,
        config: ChannelConfig,
        open_payload: Bytes,
    ) -> Promise<(Channel, ChannelReceiver, Bytes)> {
        self.promise(|st, resolver| {
            state::check_open(st)?;
            let open = OpenChannel { channel_type: channel_type.into(), config, open_payload, resolver };
            conn::open_channel(st, open);
            Ok(())
        })
    }

    /// Sends a global request and waits for the reply (RFC 4254, section 4).
    pub fn global_request(&self, request_type: &str, payload: Bytes) -> Promise<GlobalReply> {
        self.promise(|st, resolver| {
            conn::send_global_request(st, request_type.into(), payload, Some(resolver))
        })
    }

    /// Sends a global request without asking for a reply.
    pub fn send_global_request(&self, request_type: &str, payload: Bytes) -> Result<()> {
        self.with_state(|st| conn::send_global_request(st, request_type.into(), payload, None))
    }
}

/// Receiving half of a [`Session`].
///
/// [`SessionReceiver`] provides you with the [`SessionEvent`]s, various events that are produced
/// during the life of the session. You **must** receive these events, otherwise the session will
/// stall when the internal buffer of events fills up.
#[derive(Debug)]
pub struct SessionReceiver {
    event_rx: mpsc::Receiver<SessionEvent>,
}

impl SessionReceiver {
    /// Waits for the next event.
    ///
    /// Returns `None` if the session was closed.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.event_rx.recv().await
    }

    /// Poll-friendly variant of [`.recv()`][Self::recv()].
    pub fn poll_recv(&mut self, cx: &mut Context) -> Poll<Option<SessionEvent>> {
        self.event_rx.poll_recv(cx)
    }
}

/// Future that drives the session state machine.
///
/// This future performs the reads and writes on `IO` and stores the state of the session. You
/// must poll this future, usually by spawning a task for it. The future completes when the
/// session is closed or when an error happens.
#[pin_project]
pub struct SessionFuture<IO> {
    session_st: Arc<Mutex<SessionState>>,
    #[pin] stream: IO,
}

impl<IO> SessionFuture<IO> {
    /// Deconstructs the future and gives the `IO` back to you.
    pub fn into_stream(self) -> IO {
        self.stream
    }
}

impl<IO> Future for SessionFuture<IO>
    where IO: AsyncRead + AsyncWrite
{
    type Output = Result<()>;
    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<()>> {
        let this = self.project();
        let mut st = this.session_st.lock();
        state::poll_session(&mut st, this.stream, cx)
    }
}
