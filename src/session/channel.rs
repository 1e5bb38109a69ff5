use bytes::Bytes;
use futures_core::ready;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use crate::error::{Error, Result};
use crate::promise::Promise;
use super::channel_state::{self, ChannelState, ChannelSendData};
use super::state::{self, SessionState};

/// Handle to an SSH channel.
///
/// Use this object to send requests and data to the peer over an SSH channel. To receive events
/// and data from the peer, use the matching [`ChannelReceiver`]. You obtain both halves from
/// [`Session::open_channel()`][super::Session::open_channel()] or from
/// [`AcceptChannel::accept()`][super::AcceptChannel::accept()].
///
/// The channel is described in RFC 4254, section 5. You can cheaply clone this object and safely
/// share the clones between tasks.
#[derive(Debug, Clone)]
pub struct Channel {
    pub(super) session_st: Weak<Mutex<SessionState>>,
    pub(super) channel_st: Weak<Mutex<ChannelState>>,
}

/// Phase in the life of a [`Channel`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ChannelPhase {
    /// Data flows in both directions.
    Open,
    /// We sent EOF, but the peer may still send data.
    LocalEof,
    /// The peer sent EOF, but we may still send data.
    RemoteEof,
    /// One of the sides sent `SSH_MSG_CHANNEL_CLOSE` (or both sides sent EOF).
    Closing,
    /// The channel is closed and forgotten.
    Closed,
}

impl Channel {
    /// Sends data to the channel.
    ///
    /// This sends a series of `SSH_MSG_CHANNEL_DATA` (RFC 4254, section 5.2). We split `data` into
    /// packets that fit into the window and the maximum packet size of the peer. The promise
    /// resolves after all bytes have been accepted by the flow control and written to the internal
    /// send buffer.
    pub fn send_data(&self, data: Bytes) -> Promise<()> {
        self.send_channel_data(ChannelSendData::Data(data, None))
    }

    /// Sends extended data (`SSH_MSG_CHANNEL_EXTENDED_DATA`), such as [`DATA_STDERR`].
    pub fn send_extended_data(&self, data_type_code: u32, data: Bytes) -> Promise<()> {
        self.send_channel_data(ChannelSendData::Data(data, Some(data_type_code)))
    }

    /// Sends end-of-file (`SSH_MSG_CHANNEL_EOF`) after all data queued before.
    pub fn send_eof(&self) -> Promise<()> {
        self.send_channel_data(ChannelSendData::Eof)
    }

    /// Closes the channel gracefully.
    ///
    /// We send all data that was queued before, then EOF (if it was not sent yet) and
    /// `SSH_MSG_CHANNEL_CLOSE`. The promise resolves when the peer has also closed the channel.
    pub fn close(&self) -> Promise<()> {
        let (resolver, promise) = Promise::new();
        match self.with_state(|st, channel_st| {
            channel_state::close(st, channel_st, resolver);
            Ok(())
        }) {
            Ok(()) => promise,
            // closing a channel that is already gone is not an error
            Err(Error::ChannelClosed) => Promise::ready(Ok(())),
            Err(err) => Promise::ready(Err(err)),
        }
    }

    /// Sends a channel request and waits for the reply.
    ///
    /// This sends `SSH_MSG_CHANNEL_REQUEST` with `want reply` set (RFC 4254, section 5.4). The
    /// promise fails with [`Error::ChannelReq`] if the peer replies with failure.
    pub fn request(&self, request_type: &str, payload: Bytes) -> Promise<()> {
        let (resolver, promise) = Promise::new();
        let res = self.with_state(|st, channel_st| {
            channel_state::send_request(st, channel_st, request_type.into(), payload, Some(resolver))
        });
        match res {
            Ok(()) => promise,
            Err(err) => Promise::ready(Err(err)),
        }
    }

    /// Sends a channel request without asking for a reply.
    pub fn send_request(&self, request_type: &str, payload: Bytes) -> Result<()> {
        self.with_state(|st, channel_st| {
            channel_state::send_request(st, channel_st, request_type.into(), payload, None)
        })
    }

    /// Number of bytes that the peer currently allows us to send.
    pub fn send_window(&self) -> u64 {
        match self.channel_st.upgrade() {
            Some(channel_st) => channel_state::send_window(&channel_st.lock()),
            None => 0,
        }
    }

    /// Current phase of the channel.
    pub fn phase(&self) -> ChannelPhase {
        match self.channel_st.upgrade() {
            Some(channel_st) => channel_state::phase(&channel_st.lock()),
            None => ChannelPhase::Closed,
        }
    }

    fn send_channel_data(&self, data: ChannelSendData) -> Promise<()> {
        let (resolver, promise) = Promise::new();
        match self.with_state(|st, channel_st| channel_state::send_data(st, channel_st, data, resolver)) {
            Ok(()) => promise,
            Err(err) => Promise::ready(Err(err)),
        }
    }

    fn with_state<T, F>(&self, f: F) -> Result<T>
        where F: FnOnce(&mut SessionState, &mut ChannelState) -> Result<T>
    {
        let session_st = self.session_st.upgrade().ok_or(Error::SessionClosed)?;
        let mut st = session_st.lock();
        state::check_open(&st)?;
        let channel_st = self.channel_st.upgrade().ok_or(Error::ChannelClosed)?;
        let mut channel_st = channel_st.lock();
        f(&mut st, &mut channel_st)
    }
}

/// Receiving half of a [`Channel`].
///
/// [`ChannelReceiver`] produces [`ChannelEvent`]s with the data and requests sent by the peer.
/// The events are buffered without a limit, but the peer can only send as much data as the
/// receive window allows, and we enlarge the window only after you take the data out of this
/// receiver. If you stop receiving, the peer eventually stops sending.
#[derive(Debug)]
pub struct ChannelReceiver {
    pub(super) session_st: Weak<Mutex<SessionState>>,
    pub(super) channel_st: Weak<Mutex<ChannelState>>,
    pub(super) event_rx: mpsc::UnboundedReceiver<ChannelEvent>,
    pub(super) error_rx: Option<oneshot::Receiver<Error>>,
}

impl ChannelReceiver {
    /// Waits for the next event.
    ///
    /// Returns `Ok(None)` if the channel was closed, or an error if the channel (or the whole
    /// session) was aborted.
    pub async fn recv(&mut self) -> Result<Option<ChannelEvent>> {
        std::future::poll_fn(|cx| self.poll_recv(cx)).await
    }

    /// Poll-friendly variant of [`.recv()`][Self::recv()].
    pub fn poll_recv(&mut self, cx: &mut Context) -> Poll<Result<Option<ChannelEvent>>> {
        match ready!(self.event_rx.poll_recv(cx)) {
            Some(event) => {
                if let Some(len) = event.data_len() {
                    self.report_consumed(len);
                }
                Poll::Ready(Ok(Some(event)))
            },
            None => match self.error_rx.take().map(|mut error_rx| error_rx.try_recv()) {
                Some(Ok(err)) => Poll::Ready(Err(err)),
                _ => Poll::Ready(Ok(None)),
            },
        }
    }

    fn report_consumed(&self, len: usize) {
        let (Some(session_st), Some(channel_st)) = (self.session_st.upgrade(), self.channel_st.upgrade()) else {
            return
        };
        let mut st = session_st.lock();
        channel_state::consumed(&mut st, &mut channel_st.lock(), len);
    }
}

/// An event returned from [`ChannelReceiver`].
///
/// These are the requests and data sent by the peer on the channel. This enum is marked as
/// `#[non_exhaustive]`; it is always safe to ignore events that you don't intend to handle.
#[derive(Debug)]
#[non_exhaustive]
pub enum ChannelEvent {
    /// Data received from the peer (`SSH_MSG_CHANNEL_DATA`, RFC 4254, section 5.2).
    ///
    /// You should handle the data as a byte stream, the boundaries between consecutive events
    /// might be arbitrary.
    Data(Bytes),

    /// Extended data received from the peer (`SSH_MSG_CHANNEL_EXTENDED_DATA`), with the data type
    /// code such as [`DATA_STDERR`].
    ExtendedData(u32, Bytes),

    /// End-of-file received from the peer (`SSH_MSG_CHANNEL_EOF`, RFC 4254, section 5.3).
    Eof,

    /// Request received from the peer (`SSH_MSG_CHANNEL_REQUEST`, RFC 4254, section 5.4).
    ///
    /// Replies are sent in the order of the requests, so if you take a long time to reply to a
    /// request, replies to the following requests will be stalled.
    Request(ChannelReq),
}

impl ChannelEvent {
    fn data_len(&self) -> Option<usize> {
        match self {
            ChannelEvent::Data(data) | ChannelEvent::ExtendedData(_, data) => Some(data.len()),
            _ => None,
        }
    }
}

/// Request received on an SSH channel.
#[derive(Debug)]
pub struct ChannelReq {
    /// The type of the request, such as `"exec"` or `"exit-status"`.
    pub request_type: String,

    /// The raw type-specific request data.
    ///
    /// You may want to use [`PacketDecode`][crate::PacketDecode] to decode it.
    pub payload: Bytes,

    /// The reply sender, present if the peer wants a reply.
    ///
    /// If you drop it without replying, we send a failure reply.
    pub reply: Option<ChannelReplySender>,
}

/// Sends the reply to a [`ChannelReq`].
#[derive(Debug)]
pub struct ChannelReplySender {
    pub(super) reply_tx: oneshot::Sender<bool>,
}

impl ChannelReplySender {
    /// Replies with `SSH_MSG_CHANNEL_SUCCESS`.
    pub fn success(self) {
        let _ = self.reply_tx.send(true);
    }

    /// Replies with `SSH_MSG_CHANNEL_FAILURE`.
    pub fn failure(self) {
        let _ = self.reply_tx.send(false);
    }
}

/// Data type code of the standard error stream in `SSH_MSG_CHANNEL_EXTENDED_DATA` (RFC 4254,
/// section 5.2).
pub const DATA_STDERR: u32 = 1;

pub(super) fn new_channel(
    session_st: Weak<Mutex<SessionState>>,
    channel_st: &Arc<Mutex<ChannelState>>,
    event_rx: mpsc::UnboundedReceiver<ChannelEvent>,
    error_rx: oneshot::Receiver<Error>,
) -> (Channel, ChannelReceiver) {
    let channel = Channel {
        session_st: session_st.clone(),
        channel_st: Arc::downgrade(channel_st),
    };
    let receiver = ChannelReceiver {
        session_st,
        channel_st: Arc::downgrade(channel_st),
        event_rx,
        error_rx: Some(error_rx),
    };
    (channel, receiver)
}
