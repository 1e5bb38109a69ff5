use bytes::Bytes;
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;
use crate::codec::{Codec, RecvPipe, SendPipe, PacketEncode};
use crate::codes::msg;
use crate::error::{Error, Result, DisconnectError};
use crate::util::{poll_read_buf, AsyncReadWrite, CryptoRngCore};
use super::Role;
use super::auth::{self, AuthState};
use super::auth_server::{self, AuthServerState};
use super::config::SessionConfig;
use super::conn::{self, ConnState};
use super::event::SessionEvent;
use super::negotiate::{self, NegotiateState};
use super::pump::Pump;
use super::recv::{self, RecvState};

/// Phase of the life of a [`Session`][super::Session].
///
/// Key re-exchange can happen in the `Authenticating` and `Connected` phases, it is reported
/// separately by [`Session::is_rekeying()`][super::Session::is_rekeying()].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Waiting for the identification string of the peer.
    VersionExchange,
    /// Running the first key exchange.
    KeyExchange,
    /// The transport is encrypted, but the client is not yet authenticated.
    Authenticating,
    /// The client is authenticated and channels can be used.
    Connected,
    /// The session is sending a disconnect message or failed with an error.
    Disconnecting,
    /// The session is closed.
    Closed,
}

pub(super) struct SessionState {
    pub role: Role,
    pub config: SessionConfig,
    pub rng: Box<dyn CryptoRngCore + Send>,
    pub self_weak: Weak<Mutex<SessionState>>,
    pub event_tx: PollSender<SessionEvent>,
    pub codec: Codec,
    pub our_ident: Bytes,
    pub their_ident: Option<Bytes>,
    pub recv_st: Option<Box<dyn RecvState + Send>>,
    pub negotiate_st: Box<NegotiateState>,
    pub auth_st: Box<AuthState>,
    pub auth_server_st: Box<AuthServerState>,
    pub conn_st: Box<ConnState>,
    pub session_id: Option<Vec<u8>>,
    our_disconnect: Option<DisconnectError>,
    disconnect_sent: bool,
    failure: Option<Error>,
    closed: bool,
    waker: Option<Waker>,
}

pub(super) fn new_session(
    role: Role,
    config: SessionConfig,
    mut rng: Box<dyn CryptoRngCore + Send>,
    event_tx: mpsc::Sender<SessionEvent>,
) -> Result<Arc<Mutex<SessionState>>> {
    config.validate()?;
    if role == Role::Server && config.host_keys.is_empty() {
        return Err(Error::Config("server needs at least one host key"))
    }

    let mut send_pipe = SendPipe::new(&mut *rng)?;
    let our_ident: Bytes = format!("SSH-2.0-{}", config.software_version).into();
    send_pipe.feed_ident(&our_ident);
    let recv_pipe = RecvPipe::new(config.recv_packet_len_max);
    let negotiate_st = negotiate::init_negotiate();
    let auth_server_st = auth_server::init_auth_server(&config);

    Ok(Arc::new_cyclic(|self_weak| Mutex::new(SessionState {
        role,
        config,
        rng,
        self_weak: self_weak.clone(),
        event_tx: PollSender::new(event_tx),
        codec: Codec { recv_pipe, send_pipe },
        our_ident,
        their_ident: None,
        recv_st: None,
        negotiate_st: Box::new(negotiate_st),
        auth_st: Box::new(auth::init_auth()),
        auth_server_st: Box::new(auth_server_st),
        conn_st: Box::new(conn::init_conn()),
        session_id: None,
        our_disconnect: None,
        disconnect_sent: false,
        failure: None,
        closed: false,
        waker: None,
    })))
}

pub(super) fn poll_session(
    st: &mut SessionState,
    mut stream: Pin<&mut dyn AsyncReadWrite>,
    cx: &mut Context,
) -> Poll<Result<()>> {
    if st.closed {
        return Poll::Ready(Err(Error::SessionClosed))
    }

    match poll_pumps(st, stream.as_mut(), cx) {
        Poll::Ready(Ok(())) => {
            log::debug!("session closed after disconnect");
            st.closed = true;
            abort_all(st, &Error::SessionClosed);
            Poll::Ready(Ok(()))
        },
        Poll::Ready(Err(err)) => {
            fail_session(st, err.clone());
            flush_after_failure(st, stream, cx);
            st.closed = true;
            Poll::Ready(Err(err))
        },
        Poll::Pending => Poll::Pending,
    }
}

fn poll_pumps(
    st: &mut SessionState,
    mut stream: Pin<&mut dyn AsyncReadWrite>,
    cx: &mut Context,
) -> Poll<Result<()>> {
    if !st.disconnect_sent {
        if let Some(error) = st.our_disconnect.take() {
            send_disconnect(st, &error)?;
            st.disconnect_sent = true;
            abort_all(st, &Error::SessionClosed);
        }
    }

    loop {
        let mut progress = false;

        if !st.disconnect_sent {
            while recv::pump_recv(st, cx)?.is_progress() { progress = true }
            while negotiate::pump_negotiate(st, cx)?.is_progress() { progress = true }
            match st.role {
                Role::Client => while auth::pump_auth(st, cx)?.is_progress() { progress = true },
                Role::Server => while auth_server::pump_auth_server(st, cx)?.is_progress() { progress = true },
            }
            while conn::pump_conn(st, cx)?.is_progress() { progress = true }

            if pump_read(st, stream.as_mut(), cx)?.is_progress() { continue }
        }

        while pump_write(st, stream.as_mut(), cx)?.is_progress() { progress = true }

        if !progress { break }
    }

    let flushed = flush_write(st, stream.as_mut(), cx)?;
    if st.disconnect_sent && flushed {
        return Poll::Ready(Ok(()))
    }

    st.waker = Some(cx.waker().clone());
    Poll::Pending
}

pub(super) fn wakeup(st: &mut SessionState) {
    if let Some(waker) = st.waker.take() {
        waker.wake();
    }
}

pub(super) fn phase(st: &SessionState) -> Phase {
    if st.closed {
        Phase::Closed
    } else if st.failure.is_some() || st.disconnect_sent || st.our_disconnect.is_some() {
        Phase::Disconnecting
    } else if st.their_ident.is_none() {
        Phase::VersionExchange
    } else if st.session_id.is_none() {
        Phase::KeyExchange
    } else if !is_authenticated(st) {
        Phase::Authenticating
    } else {
        Phase::Connected
    }
}

pub(super) fn is_authenticated(st: &SessionState) -> bool {
    match st.role {
        Role::Client => auth::is_authenticated(st),
        Role::Server => auth_server::is_authenticated(st),
    }
}

/// Returns an error if the session no longer accepts new operations.
pub(super) fn check_open(st: &SessionState) -> Result<()> {
    if let Some(err) = st.failure.as_ref() {
        Err(err.clone())
    } else if st.closed || st.disconnect_sent || st.our_disconnect.is_some() {
        Err(Error::SessionClosed)
    } else {
        Ok(())
    }
}

fn pump_read(
    st: &mut SessionState,
    stream: Pin<&mut dyn AsyncReadWrite>,
    cx: &mut Context,
) -> Result<Pump> {
    if st.their_ident.is_some() {
        pump_read_packet(st, stream, cx)
    } else {
        pump_read_ident(st, stream, cx)
    }
}

fn pump_read_packet(
    st: &mut SessionState,
    mut stream: Pin<&mut dyn AsyncReadWrite>,
    cx: &mut Context,
) -> Result<Pump> {
    if st.recv_st.is_some() {
        return Ok(Pump::Pending)
    }

    let packet = pump_ready!(poll_read(st, stream.as_mut(), cx, |pipe| pipe.consume_packet()))?;
    st.recv_st = recv::recv_packet(st, packet)?;
    Ok(Pump::Progress)
}

fn pump_read_ident(
    st: &mut SessionState,
    mut stream: Pin<&mut dyn AsyncReadWrite>,
    cx: &mut Context,
) -> Result<Pump> {
    // only a server may send other lines before its identification (RFC 4253, section 4.2)
    let allow_preamble = st.role == Role::Client;
    let ident = pump_ready!(poll_read(st, stream.as_mut(), cx,
        |pipe| pipe.consume_ident(allow_preamble)))?;
    check_ident(&ident)?;

    // the returned `Bytes` reference the internal buffer in `st.codec.recv_pipe`, so we
    // copy the data into a new `Bytes` to avoid keeping this reference in `SessionState`
    let ident = Bytes::copy_from_slice(&ident);
    log::debug!("received peer identifier: {:?}", ident);
    st.their_ident = Some(ident);

    Ok(Pump::Progress)
}

fn check_ident(ident: &[u8]) -> Result<()> {
    // "SSH-1.99" announces a server that also speaks SSH 2.0 (RFC 4253, section 5.1)
    if ident.starts_with(b"SSH-2.0-") || ident.starts_with(b"SSH-1.99-") {
        Ok(())
    } else {
        Err(Error::Version("peer does not support protocol version 2.0"))
    }
}

fn pump_write(
    st: &mut SessionState,
    mut stream: Pin<&mut dyn AsyncReadWrite>,
    cx: &mut Context,
) -> Result<Pump> {
    let data = st.codec.send_pipe.peek_bytes();
    if data.is_empty() { return Ok(Pump::Pending) }
    match stream.as_mut().poll_write(cx, data) {
        Poll::Ready(Ok(0)) | Poll::Pending => {
            log::trace!("pending write of {} bytes", data.len());
            Ok(Pump::Pending)
        },
        Poll::Ready(Ok(written_len)) => {
            log::trace!("written {}/{} bytes", written_len, data.len());
            st.codec.send_pipe.consume_bytes(written_len);
            Ok(Pump::Progress)
        },
        Poll::Ready(Err(err)) => {
            log::debug!("error when writing: {}", err);
            Err(Error::WriteIo(Arc::new(err)))
        },
    }
}

fn flush_write(
    st: &mut SessionState,
    stream: Pin<&mut dyn AsyncReadWrite>,
    cx: &mut Context,
) -> Result<bool> {
    match stream.poll_flush(cx) {
        Poll::Ready(Ok(())) => Ok(st.codec.send_pipe.is_empty()),
        Poll::Pending => Ok(false),
        Poll::Ready(Err(err)) => Err(Error::WriteIo(Arc::new(err))),
    }
}

fn poll_read<F, T>(
    st: &mut SessionState,
    mut stream: Pin<&mut dyn AsyncReadWrite>,
    cx: &mut Context,
    consume_f: F
) -> Poll<Result<T>>
    where F: Fn(&mut RecvPipe) -> Result<Option<T>>
{
    loop {
        if let Some(value) = consume_f(&mut st.codec.recv_pipe)? {
            return Poll::Ready(Ok(value))
        }

        let buf = st.codec.recv_pipe.feed_buf();
        buf.reserve(READ_CHUNK_LEN);
        match poll_read_buf(stream.as_mut(), cx, buf) {
            Poll::Pending => {
                log::trace!("pending read");
                return Poll::Pending
            },
            Poll::Ready(Ok(0)) => {
                log::debug!("received eof");
                return Poll::Ready(Err(Error::PeerClosed))
            },
            Poll::Ready(Ok(read_len)) => {
                log::trace!("read {} bytes", read_len);
                continue
            },
            Poll::Ready(Err(err)) => {
                log::debug!("error when reading: {}", err);
                return Poll::Ready(Err(Error::ReadIo(Arc::new(err))))
            },
        }
    }
}

const READ_CHUNK_LEN: usize = 8 * 1024;

pub(super) fn disconnect(st: &mut SessionState, error: DisconnectError) -> Result<()> {
    check_open(st)?;
    st.our_disconnect = Some(error);
    wakeup(st);
    Ok(())
}

fn send_disconnect(st: &mut SessionState, error: &DisconnectError) -> Result<()> {
    let mut payload = PacketEncode::new();
    payload.put_u8(msg::DISCONNECT);
    payload.put_u32(error.reason_code);
    payload.put_str(&error.description);
    payload.put_str(&error.description_lang);
    st.codec.send_pipe.feed_packet(&payload.finish())?;
    log::debug!("sending SSH_MSG_DISCONNECT with reason code {}", error.reason_code);
    Ok(())
}

/// Moves the session into the failed state and settles every pending operation with `err`.
fn fail_session(st: &mut SessionState, err: Error) {
    log::debug!("session failed: {}", err);
    abort_all(st, &err);

    if !st.disconnect_sent {
        if err.disconnect_reason().is_some() {
            let _: Result<()> = send_disconnect(st, &DisconnectError::from(&err));
        }
        st.disconnect_sent = true;
    }
    st.failure = Some(err);
}

/// Writes as much of the pending output (including our `SSH_MSG_DISCONNECT`) as the stream
/// accepts without blocking.
fn flush_after_failure(st: &mut SessionState, mut stream: Pin<&mut dyn AsyncReadWrite>, cx: &mut Context) {
    while let Ok(Pump::Progress) = pump_write(st, stream.as_mut(), cx) {}
    let _: Result<bool> = flush_write(st, stream, cx);
}

fn abort_all(st: &mut SessionState, err: &Error) {
    negotiate::abort(st, err);
    auth::abort(st, err);
    conn::abort(st, err);
}
