use bytes::Bytes;
use std::cmp::min;
use std::collections::VecDeque;
use std::future::Future as _;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use crate::codec::{PacketEncode, PacketDecode};
use crate::codes::msg;
use crate::error::{Result, Error};
use crate::promise::Resolver;
use super::channel::{ChannelEvent, ChannelPhase, ChannelReq, ChannelReplySender};
use super::negotiate;
use super::pump::Pump;
use super::state::{self, SessionState};
use super::window::Window;

pub(super) struct ChannelInit {
    pub our_id: u32,
    pub their_id: u32,
    pub event_tx: mpsc::UnboundedSender<ChannelEvent>,
    pub error_tx: oneshot::Sender<Error>,
    pub send_window: u32,
    pub send_packet_len_max: u32,
    pub recv_window_max: u32,
    pub recv_packet_len_max: u32,
}

pub(super) struct ChannelState {
    our_id: u32,
    their_id: u32,
    eof_sent: bool,
    eof_recvd: bool,
    want_close: bool,
    close_sent: bool,
    close_recvd: bool,
    closed: bool,
    event_tx: Option<mpsc::UnboundedSender<ChannelEvent>>,
    error_tx: Option<oneshot::Sender<Error>>,
    send_reqs: VecDeque<SendReq>,
    send_datas: VecDeque<SendData>,
    recv_replies: VecDeque<Option<Resolver<()>>>,
    their_replies: VecDeque<oneshot::Receiver<bool>>,
    close_txs: Vec<Resolver<()>>,
    send_window: Window,
    recv_window: Window,
    send_len_max: usize,
    recv_window_max: u32,
    recv_packet_len_max: u32,
    app_consumed: u64,
}

struct SendReq {
    request_type: String,
    payload: Bytes,
    reply_tx: Option<Resolver<()>>,
}

struct SendData {
    data: ChannelSendData,
    sent_tx: Resolver<()>,
}

#[derive(Debug)]
pub(super) enum ChannelSendData {
    /// Data with an optional extended data type code.
    Data(Bytes, Option<u32>),
    Eof,
}

pub(super) fn init_channel(init: ChannelInit) -> ChannelState {
    ChannelState {
        our_id: init.our_id,
        their_id: init.their_id,
        eof_sent: false,
        eof_recvd: false,
        want_close: false,
        close_sent: false,
        close_recvd: false,
        closed: false,
        event_tx: Some(init.event_tx),
        error_tx: Some(init.error_tx),
        send_reqs: VecDeque::new(),
        send_datas: VecDeque::new(),
        recv_replies: VecDeque::new(),
        their_replies: VecDeque::new(),
        close_txs: Vec::new(),
        send_window: Window::new(init.send_window),
        recv_window: Window::new(init.recv_window_max),
        send_len_max: packet_len_max_to_len_max(init.send_packet_len_max),
        recv_window_max: init.recv_window_max,
        recv_packet_len_max: init.recv_packet_len_max,
        app_consumed: 0,
    }
}

pub(super) fn pump_channel(
    st: &mut SessionState,
    channel_st: &mut ChannelState,
    cx: &mut Context,
) -> Result<Pump> {
    if channel_st.closed || !negotiate::is_ready(st) {
        return Ok(Pump::Pending)
    }

    if channel_st.close_sent && channel_st.close_recvd {
        log::debug!("our channel {} is closed", channel_st.our_id);
        finish_channel(channel_st, Error::ChannelClosed);
        for close_tx in channel_st.close_txs.drain(..) {
            close_tx.resolve(Ok(()));
        }
        return Ok(Pump::Progress)
    }

    if channel_st.close_recvd && !channel_st.close_sent {
        // the peer closed the channel, we must reply with our close and drop the pending data
        fail_pending(channel_st, &Error::ChannelClosed);
        send_channel_close(st, channel_st)?;
        return Ok(Pump::Progress)
    }

    if channel_st.close_sent {
        return Ok(Pump::Pending)
    }

    if let Some(reply_rx) = channel_st.their_replies.front_mut() {
        let success = match Pin::new(reply_rx).poll(cx) {
            Poll::Ready(Ok(success)) => Some(success),
            Poll::Ready(Err(_)) => Some(false),
            Poll::Pending => None,
        };
        if let Some(success) = success {
            channel_st.their_replies.pop_front();
            send_channel_reply(st, channel_st, success)?;
            return Ok(Pump::Progress)
        }
    }

    if let Some(req) = channel_st.send_reqs.pop_front() {
        send_channel_request(st, channel_st, &req)?;
        channel_st.recv_replies.push_back(req.reply_tx);
        return Ok(Pump::Progress)
    }

    if let Some(mut data) = channel_st.send_datas.pop_front() {
        let progress = send_channel_data(st, channel_st, &mut data.data)?;
        if is_sent(&data.data) {
            data.sent_tx.resolve(Ok(()));
            return Ok(Pump::Progress)
        }
        channel_st.send_datas.push_front(data);
        if progress {
            return Ok(Pump::Progress)
        }
    }

    if should_adjust_window(channel_st) {
        let adjust = u32::try_from(channel_st.app_consumed).unwrap_or(u32::MAX);
        channel_st.recv_window.adjust(adjust)?;
        channel_st.app_consumed -= adjust as u64;
        send_channel_window_adjust(st, channel_st, adjust)?;
        return Ok(Pump::Progress)
    }

    if channel_st.want_close && channel_st.send_datas.is_empty() {
        if !channel_st.eof_sent {
            send_channel_eof(st, channel_st)?;
        }
        send_channel_close(st, channel_st)?;
        return Ok(Pump::Progress)
    }

    Ok(Pump::Pending)
}

/// Should we enlarge the receive window of the peer?
///
/// We only give back the bytes that the application has already received, and only after the
/// window drops below half of its maximum.
fn should_adjust_window(channel_st: &ChannelState) -> bool {
    channel_st.app_consumed > 0 && !channel_st.eof_recvd &&
        channel_st.recv_window.available() < channel_st.recv_window_max as u64 / 2
}

/// The application took `len` bytes out of the [`ChannelReceiver`][super::ChannelReceiver].
pub(super) fn consumed(st: &mut SessionState, channel_st: &mut ChannelState, len: usize) {
    channel_st.app_consumed += len as u64;
    if should_adjust_window(channel_st) {
        state::wakeup(st);
    }
}

pub(super) fn send_request(
    st: &mut SessionState,
    channel_st: &mut ChannelState,
    request_type: String,
    payload: Bytes,
    reply_tx: Option<Resolver<()>>,
) -> Result<()> {
    if channel_st.closed || channel_st.close_sent || channel_st.want_close {
        return Err(Error::ChannelClosed)
    }
    channel_st.send_reqs.push_back(SendReq { request_type, payload, reply_tx });
    state::wakeup(st);
    Ok(())
}

fn send_channel_request(st: &mut SessionState, channel_st: &ChannelState, req: &SendReq) -> Result<()> {
    let mut payload = PacketEncode::new();
    payload.put_u8(msg::CHANNEL_REQUEST);
    payload.put_u32(channel_st.their_id);
    payload.put_str(&req.request_type);
    payload.put_bool(req.reply_tx.is_some());
    payload.put_raw(&req.payload);
    st.codec.send_pipe.feed_packet(&payload.finish())?;
    log::debug!("sending SSH_MSG_CHANNEL_REQUEST {:?} for our channel {}",
        req.request_type, channel_st.our_id);
    Ok(())
}

pub(super) fn recv_channel_success(channel_st: &mut ChannelState) -> Result<()> {
    let Some(reply_tx) = pop_reply(channel_st)? else { return Ok(()) };
    log::debug!("received SSH_MSG_CHANNEL_SUCCESS for our channel {}", channel_st.our_id);
    reply_tx.resolve(Ok(()));
    Ok(())
}

pub(super) fn recv_channel_failure(channel_st: &mut ChannelState) -> Result<()> {
    let Some(reply_tx) = pop_reply(channel_st)? else { return Ok(()) };
    log::debug!("received SSH_MSG_CHANNEL_FAILURE for our channel {}", channel_st.our_id);
    reply_tx.resolve(Err(Error::ChannelReq));
    Ok(())
}

fn pop_reply(channel_st: &mut ChannelState) -> Result<Option<Resolver<()>>> {
    // requests without `want reply` are in the queue as `None`, but the peer never replies to
    // them, so we skip them
    while let Some(reply_tx) = channel_st.recv_replies.pop_front() {
        if reply_tx.is_some() {
            return Ok(reply_tx)
        }
    }
    Err(Error::ChannelProtocol("received a reply, but no reply was expected"))
}

pub(super) fn recv_channel_request(channel_st: &mut ChannelState, payload: &mut PacketDecode) -> Result<()> {
    let request_type = payload.get_string()?;
    let want_reply = payload.get_bool()?;
    let req_payload = payload.remaining();
    log::debug!("received SSH_MSG_CHANNEL_REQUEST {:?} for our channel {}",
        request_type, channel_st.our_id);

    let reply = if want_reply {
        let (reply_tx, reply_rx) = oneshot::channel();
        channel_st.their_replies.push_back(reply_rx);
        Some(ChannelReplySender { reply_tx })
    } else {
        None
    };

    let req = ChannelReq { request_type, payload: req_payload, reply };
    // if the receiver is dropped, the reply sender is dropped with the event and we reply with
    // failure
    send_event(channel_st, ChannelEvent::Request(req));
    Ok(())
}

fn send_channel_reply(st: &mut SessionState, channel_st: &ChannelState, success: bool) -> Result<()> {
    let mut payload = PacketEncode::new();
    payload.put_u8(if success { msg::CHANNEL_SUCCESS } else { msg::CHANNEL_FAILURE });
    payload.put_u32(channel_st.their_id);
    st.codec.send_pipe.feed_packet(&payload.finish())?;
    log::debug!("sending {} for our channel {}",
        if success { "SSH_MSG_CHANNEL_SUCCESS" } else { "SSH_MSG_CHANNEL_FAILURE" }, channel_st.our_id);
    Ok(())
}

pub(super) fn send_data(
    st: &mut SessionState,
    channel_st: &mut ChannelState,
    data: ChannelSendData,
    sent_tx: Resolver<()>,
) -> Result<()> {
    if channel_st.closed || channel_st.close_sent || channel_st.want_close || channel_st.eof_sent {
        return Err(Error::ChannelClosed)
    }
    if matches!(data, ChannelSendData::Eof) {
        // data queued after this would be rejected anyway
        channel_st.eof_sent = true;
    }
    channel_st.send_datas.push_back(SendData { data, sent_tx });
    state::wakeup(st);
    Ok(())
}

fn is_sent(data: &ChannelSendData) -> bool {
    match data {
        ChannelSendData::Data(data, _) => data.is_empty(),
        ChannelSendData::Eof => false,
    }
}

/// Sends as much of `data` as the window allows. Returns true if any packet was sent.
fn send_channel_data(st: &mut SessionState, channel_st: &mut ChannelState, data: &mut ChannelSendData) -> Result<bool> {
    match data {
        ChannelSendData::Data(data, data_type) => {
            let window = usize::try_from(channel_st.send_window.available()).unwrap_or(usize::MAX);
            let send_len = min(data.len(), min(window, channel_st.send_len_max));
            if send_len == 0 {
                return Ok(false)
            }
            let send_data = data.split_to(send_len);

            let mut payload = PacketEncode::new();
            match data_type {
                None => {
                    payload.put_u8(msg::CHANNEL_DATA);
                    payload.put_u32(channel_st.their_id);
                },
                Some(code) => {
                    payload.put_u8(msg::CHANNEL_EXTENDED_DATA);
                    payload.put_u32(channel_st.their_id);
                    payload.put_u32(*code);
                },
            }
            payload.put_bytes(&send_data);
            st.codec.send_pipe.feed_packet(&payload.finish())?;
            channel_st.send_window.consume(send_len)?;
            log::trace!("sending {} bytes of data for our channel {}, window {}",
                send_len, channel_st.our_id, channel_st.send_window.available());
            Ok(true)
        },
        ChannelSendData::Eof => {
            send_channel_eof(st, channel_st)?;
            // turn the item into empty data, so that it counts as sent
            *data = ChannelSendData::Data(Bytes::new(), None);
            Ok(true)
        },
    }
}

fn send_channel_eof(st: &mut SessionState, channel_st: &mut ChannelState) -> Result<()> {
    let mut payload = PacketEncode::new();
    payload.put_u8(msg::CHANNEL_EOF);
    payload.put_u32(channel_st.their_id);
    st.codec.send_pipe.feed_packet(&payload.finish())?;
    channel_st.eof_sent = true;
    log::debug!("sending SSH_MSG_CHANNEL_EOF for our channel {}", channel_st.our_id);
    Ok(())
}

pub(super) fn recv_channel_data(channel_st: &mut ChannelState, payload: &mut PacketDecode) -> Result<()> {
    let data = payload.get_bytes()?;
    recv_data(channel_st, data, None)
}

pub(super) fn recv_channel_extended_data(channel_st: &mut ChannelState, payload: &mut PacketDecode) -> Result<()> {
    let code = payload.get_u32()?;
    let data = payload.get_bytes()?;
    recv_data(channel_st, data, Some(code))
}

fn recv_data(channel_st: &mut ChannelState, data: Bytes, code: Option<u32>) -> Result<()> {
    if channel_st.eof_recvd || channel_st.close_recvd {
        return Err(Error::ChannelProtocol("received data after EOF"))
    }
    if data.len() > channel_st.recv_packet_len_max as usize {
        log::warn!("received {} bytes of data for our channel {}, more than the maximum packet size {}",
            data.len(), channel_st.our_id, channel_st.recv_packet_len_max);
    }
    channel_st.recv_window.consume(data.len())?;
    log::trace!("received {} bytes of data for our channel {}, window {}",
        data.len(), channel_st.our_id, channel_st.recv_window.available());

    let len = data.len();
    let event = match code {
        None => ChannelEvent::Data(data),
        Some(code) => ChannelEvent::ExtendedData(code, data),
    };
    if !send_event(channel_st, event) {
        // nobody will receive the data, so it is consumed right away
        channel_st.app_consumed += len as u64;
    }
    Ok(())
}

pub(super) fn recv_channel_eof(channel_st: &mut ChannelState) -> Result<()> {
    if channel_st.eof_recvd {
        return Err(Error::ChannelProtocol("received SSH_MSG_CHANNEL_EOF twice"))
    }
    log::debug!("received SSH_MSG_CHANNEL_EOF for our channel {}", channel_st.our_id);
    channel_st.eof_recvd = true;
    send_event(channel_st, ChannelEvent::Eof);
    Ok(())
}

fn send_channel_window_adjust(st: &mut SessionState, channel_st: &ChannelState, adjust: u32) -> Result<()> {
    let mut payload = PacketEncode::new();
    payload.put_u8(msg::CHANNEL_WINDOW_ADJUST);
    payload.put_u32(channel_st.their_id);
    payload.put_u32(adjust);
    st.codec.send_pipe.feed_packet(&payload.finish())?;
    log::trace!("sending SSH_MSG_CHANNEL_WINDOW_ADJUST for our channel {} with {} bytes",
        channel_st.our_id, adjust);
    Ok(())
}

pub(super) fn recv_channel_window_adjust(channel_st: &mut ChannelState, payload: &mut PacketDecode) -> Result<()> {
    let adjust = payload.get_u32()?;
    channel_st.send_window.adjust(adjust)?;
    log::trace!("received SSH_MSG_CHANNEL_WINDOW_ADJUST for our channel {} with {} bytes",
        channel_st.our_id, adjust);
    Ok(())
}

pub(super) fn send_window(channel_st: &ChannelState) -> u64 {
    channel_st.send_window.available()
}

pub(super) fn close(st: &mut SessionState, channel_st: &mut ChannelState, close_tx: Resolver<()>) {
    if channel_st.closed {
        close_tx.resolve(Ok(()));
        return
    }
    channel_st.close_txs.push(close_tx);
    if !channel_st.want_close {
        channel_st.want_close = true;
        state::wakeup(st);
    }
}

fn send_channel_close(st: &mut SessionState, channel_st: &mut ChannelState) -> Result<()> {
    let mut payload = PacketEncode::new();
    payload.put_u8(msg::CHANNEL_CLOSE);
    payload.put_u32(channel_st.their_id);
    st.codec.send_pipe.feed_packet(&payload.finish())?;
    channel_st.close_sent = true;
    log::debug!("sending SSH_MSG_CHANNEL_CLOSE for our channel {}", channel_st.our_id);
    Ok(())
}

pub(super) fn recv_channel_close(channel_st: &mut ChannelState) -> Result<()> {
    if channel_st.close_recvd {
        return Err(Error::ChannelProtocol("received SSH_MSG_CHANNEL_CLOSE twice"))
    }
    log::debug!("received SSH_MSG_CHANNEL_CLOSE for our channel {}", channel_st.our_id);
    channel_st.close_recvd = true;
    Ok(())
}

/// Aborts the channel after a channel-fatal error: the receiver gets the error and we close the
/// channel without waiting for the pending data.
pub(super) fn abort_channel(st: &mut SessionState, channel_st: &mut ChannelState, err: Error) {
    log::debug!("aborting our channel {}: {}", channel_st.our_id, err);
    fail_pending(channel_st, &err);
    if let Some(error_tx) = channel_st.error_tx.take() {
        let _ = error_tx.send(err);
    }
    channel_st.event_tx = None;
    channel_st.want_close = true;
    state::wakeup(st);
}

/// Aborts the channel when the whole session fails.
pub(super) fn abort_session(channel_st: &mut ChannelState, err: &Error) {
    finish_channel(channel_st, err.clone());
    for close_tx in channel_st.close_txs.drain(..) {
        close_tx.resolve(Err(err.clone()));
    }
}

fn finish_channel(channel_st: &mut ChannelState, err: Error) {
    fail_pending(channel_st, &err);
    channel_st.their_replies.clear();
    if let Some(error_tx) = channel_st.error_tx.take() {
        if !matches!(err, Error::ChannelClosed) {
            let _ = error_tx.send(err);
        }
    }
    channel_st.event_tx = None;
    channel_st.closed = true;
}

fn fail_pending(channel_st: &mut ChannelState, err: &Error) {
    for data in channel_st.send_datas.drain(..) {
        data.sent_tx.resolve(Err(err.clone()));
    }
    for req in channel_st.send_reqs.drain(..) {
        if let Some(reply_tx) = req.reply_tx {
            reply_tx.resolve(Err(err.clone()));
        }
    }
    for reply_tx in channel_st.recv_replies.drain(..).flatten() {
        reply_tx.resolve(Err(err.clone()));
    }
}

pub(super) fn is_closed(channel_st: &ChannelState) -> bool {
    channel_st.closed
}

pub(super) fn phase(channel_st: &ChannelState) -> ChannelPhase {
    if channel_st.closed {
        ChannelPhase::Closed
    } else if channel_st.close_sent || channel_st.close_recvd || channel_st.want_close ||
        (channel_st.eof_sent && channel_st.eof_recvd)
    {
        ChannelPhase::Closing
    } else if channel_st.eof_sent {
        ChannelPhase::LocalEof
    } else if channel_st.eof_recvd {
        ChannelPhase::RemoteEof
    } else {
        ChannelPhase::Open
    }
}

/// Sends an event to the [`ChannelReceiver`][super::ChannelReceiver]; returns false if nobody
/// listens.
fn send_event(channel_st: &mut ChannelState, event: ChannelEvent) -> bool {
    match channel_st.event_tx.as_ref() {
        Some(event_tx) => event_tx.send(event).is_ok(),
        None => false,
    }
}

fn packet_len_max_to_len_max(packet_len_max: u32) -> usize {
    // it is not clear whether the 'maximum packet size' of the channel limits only the data or
    // the whole packet payload (or even more), so we send chunks that are a bit smaller, but never
    // larger than the limit itself
    let packet_len_max = packet_len_max as usize;
    usize::min(packet_len_max, usize::max(packet_len_max, 200) - 100).max(1)
}
