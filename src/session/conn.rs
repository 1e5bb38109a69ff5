use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::future::Future as _;
use std::mem::replace;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use crate::codec::{PacketEncode, PacketDecode};
use crate::codes::{msg, open};
use crate::error::{Result, ChannelOpenError, Error};
use crate::promise::{Promise, Resolver};
use super::channel::{self, Channel, ChannelReceiver};
use super::channel_state::{self, ChannelState, ChannelInit};
use super::config::ChannelConfig;
use super::event::{SessionEvent, AcceptChannel, AcceptDecision, GlobalReq, GlobalReply, GlobalReplySender};
use super::negotiate;
use super::pump::Pump;
use super::recv::{self, ResultRecvState};
use super::state::{self, SessionState};

#[derive(Default)]
pub(super) struct ConnState {
    open_channels: VecDeque<OpenChannel>,
    channels: Arc<Mutex<HashMap<u32, ConnChannelState>>>,
    send_reqs: VecDeque<SendGlobalReq>,
    recv_replies: VecDeque<Resolver<GlobalReply>>,
    their_replies: VecDeque<oneshot::Receiver<GlobalReply>>,
    outbox: VecDeque<Bytes>,
}

enum ConnChannelState {
    Open(OpenChannelState),
    Accept(AcceptChannelState),
    Ready(Arc<Mutex<ChannelState>>),
    Closed,
}

struct OpenChannelState {
    our_id: u32,
    open: OpenChannel,
    open_sent: bool,
}

pub(super) struct OpenChannel {
    pub channel_type: String,
    pub config: ChannelConfig,
    pub open_payload: Bytes,
    pub resolver: Resolver<(Channel, ChannelReceiver, Bytes)>,
}

struct AcceptChannelState {
    our_id: u32,
    their_id: u32,
    send_window: u32,
    send_packet_len_max: u32,
    decision_rx: oneshot::Receiver<AcceptDecision>,
}

struct SendGlobalReq {
    request_type: String,
    payload: Bytes,
    reply_tx: Option<Resolver<GlobalReply>>,
}

pub(super) fn init_conn() -> ConnState {
    ConnState::default()
}

pub(super) fn pump_conn(st: &mut SessionState, cx: &mut Context) -> Result<Pump> {
    if !state::is_authenticated(st) || !negotiate::is_ready(st) {
        return Ok(Pump::Pending)
    }

    if let Some(payload) = st.conn_st.outbox.pop_front() {
        st.codec.send_pipe.feed_packet(&payload)?;
        return Ok(Pump::Progress)
    }

    if let Some(reply_rx) = st.conn_st.their_replies.front_mut() {
        let reply = match Pin::new(reply_rx).poll(cx) {
            Poll::Ready(Ok(reply)) => Some(reply),
            // the user dropped the reply sender
            Poll::Ready(Err(_)) => Some(GlobalReply::Failure),
            Poll::Pending => None,
        };
        if let Some(reply) = reply {
            st.conn_st.their_replies.pop_front();
            send_global_reply(st, &reply)?;
            return Ok(Pump::Progress)
        }
    }

    if let Some(req) = st.conn_st.send_reqs.pop_front() {
        send_global_request_packet(st, &req)?;
        if let Some(reply_tx) = req.reply_tx {
            st.conn_st.recv_replies.push_back(reply_tx);
        }
        return Ok(Pump::Progress)
    }

    pump_channels(st, cx)
}

fn pump_channels(st: &mut SessionState, cx: &mut Context) -> Result<Pump> {
    let channels = st.conn_st.channels.clone();
    let mut channels = channels.lock();
    let mut progress = Pump::Pending;

    while let Some(open) = st.conn_st.open_channels.pop_front() {
        match alloc_our_id(&channels) {
            Ok(our_id) => {
                let open_st = OpenChannelState { our_id, open, open_sent: false };
                channels.insert(our_id, ConnChannelState::Open(open_st));
            },
            Err(err) => open.resolver.resolve(Err(err)),
        }
        progress = Pump::Progress;
    }

    for conn_channel_st in channels.values_mut() {
        while pump_channel(st, conn_channel_st, cx)?.is_progress() {
            progress = Pump::Progress
        }
    }

    channels.retain(|_, conn_channel_st| !matches!(conn_channel_st, ConnChannelState::Closed));
    Ok(progress)
}

fn pump_channel(
    st: &mut SessionState,
    conn_channel_st: &mut ConnChannelState,
    cx: &mut Context,
) -> Result<Pump> {
    let mut progress = Pump::Pending;
    // we move out of `*conn_channel_st` here, every branch must restore the state that should
    // stay in the map
    match replace(conn_channel_st, ConnChannelState::Closed) {
        ConnChannelState::Open(mut open_st) => {
            if !open_st.open_sent {
                send_channel_open(st, &open_st)?;
                open_st.open_sent = true;
                progress = Pump::Progress;
            }
            *conn_channel_st = ConnChannelState::Open(open_st);
        },
        ConnChannelState::Accept(mut accept_st) => {
            match Pin::new(&mut accept_st.decision_rx).poll(cx) {
                Poll::Ready(Ok(AcceptDecision::Accept { config, confirm_payload, resolver })) => {
                    send_channel_open_confirmation(st, &accept_st, &config, &confirm_payload)?;
                    *conn_channel_st = init_accepted_channel(st, accept_st, config, resolver);
                    progress = Pump::Progress;
                },
                Poll::Ready(Ok(AcceptDecision::Reject(open_err))) => {
                    send_channel_open_failure(st, accept_st.their_id, open_err)?;
                    progress = Pump::Progress;
                },
                Poll::Ready(Err(_)) => {
                    let open_err = ChannelOpenError::new(open::ADMINISTRATIVELY_PROHIBITED,
                        "channel was not accepted");
                    send_channel_open_failure(st, accept_st.their_id, open_err)?;
                    progress = Pump::Progress;
                },
                Poll::Pending => {
                    *conn_channel_st = ConnChannelState::Accept(accept_st);
                },
            }
        },
        ConnChannelState::Ready(channel_mutex) => {
            let mut channel_st = channel_mutex.lock();
            progress |= channel_state::pump_channel(st, &mut channel_st, cx)?;
            if !channel_state::is_closed(&channel_st) {
                drop(channel_st);
                *conn_channel_st = ConnChannelState::Ready(channel_mutex);
            }
        },
        ConnChannelState::Closed => {},
    }
    Ok(progress)
}

pub(super) fn recv_conn_packet(
    st: &mut SessionState,
    msg_id: u8,
    payload: &mut PacketDecode,
) -> ResultRecvState {
    match msg_id {
        msg::GLOBAL_REQUEST => recv_global_request(st, payload),
        msg::REQUEST_SUCCESS => recv_request_success(st, payload),
        msg::REQUEST_FAILURE => recv_request_failure(st),
        msg::CHANNEL_OPEN => recv_channel_open(st, payload),
        msg::CHANNEL_OPEN_CONFIRMATION => recv_channel_open_confirmation(st, payload),
        msg::CHANNEL_OPEN_FAILURE => recv_channel_open_failure(st, payload),
        msg::CHANNEL_SUCCESS => recv_channel_packet(st, payload, "SSH_MSG_CHANNEL_SUCCESS",
            |channel_st, _| channel_state::recv_channel_success(channel_st)),
        msg::CHANNEL_FAILURE => recv_channel_packet(st, payload, "SSH_MSG_CHANNEL_FAILURE",
            |channel_st, _| channel_state::recv_channel_failure(channel_st)),
        msg::CHANNEL_REQUEST => recv_channel_packet(st, payload, "SSH_MSG_CHANNEL_REQUEST",
            channel_state::recv_channel_request),
        msg::CHANNEL_DATA => recv_channel_packet(st, payload, "SSH_MSG_CHANNEL_DATA",
            channel_state::recv_channel_data),
        msg::CHANNEL_EXTENDED_DATA => recv_channel_packet(st, payload, "SSH_MSG_CHANNEL_EXTENDED_DATA",
            channel_state::recv_channel_extended_data),
        msg::CHANNEL_WINDOW_ADJUST => recv_channel_packet(st, payload, "SSH_MSG_CHANNEL_WINDOW_ADJUST",
            channel_state::recv_channel_window_adjust),
        msg::CHANNEL_EOF => recv_channel_packet(st, payload, "SSH_MSG_CHANNEL_EOF",
            |channel_st, _| channel_state::recv_channel_eof(channel_st)),
        msg::CHANNEL_CLOSE => recv_channel_packet(st, payload, "SSH_MSG_CHANNEL_CLOSE",
            |channel_st, _| channel_state::recv_channel_close(channel_st)),
        _ => Err(Error::PacketNotImplemented(msg_id)),
    }
}

/// Routes a packet to the channel given by the recipient channel id in the packet.
///
/// Errors that concern only the channel abort the channel; other errors fail the session.
fn recv_channel_packet<F>(
    st: &mut SessionState,
    payload: &mut PacketDecode,
    packet_name: &'static str,
    callback: F,
) -> ResultRecvState
    where F: FnOnce(&mut ChannelState, &mut PacketDecode) -> Result<()>
{
    let our_id = payload.get_u32()?;

    let channels = st.conn_st.channels.clone();
    let channels = channels.lock();
    let Some(conn_channel_st) = channels.get(&our_id) else {
        log::debug!("received {} for unknown channel {}", packet_name, our_id);
        return Err(Error::Protocol("received a channel message for an unknown channel"))
    };
    let ConnChannelState::Ready(channel_mutex) = conn_channel_st else {
        log::debug!("received {} for channel {} that is not open", packet_name, our_id);
        return Err(Error::Protocol("received a channel message for a channel that is not open"))
    };

    let mut channel_st = channel_mutex.lock();
    match callback(&mut channel_st, payload) {
        Ok(()) => {
            state::wakeup(st);
            Ok(None)
        },
        Err(err) if err.is_channel_fatal() => {
            log::debug!("error when handling {} for our channel {}: {}", packet_name, our_id, err);
            channel_state::abort_channel(st, &mut channel_st, err);
            Ok(None)
        },
        Err(err) => Err(err),
    }
}

pub(super) fn open_channel(st: &mut SessionState, open: OpenChannel) {
    st.conn_st.open_channels.push_back(open);
    state::wakeup(st);
}

fn alloc_our_id(channels: &HashMap<u32, ConnChannelState>) -> Result<u32> {
    (0..=u32::MAX)
        .find(|our_id| !channels.contains_key(our_id))
        .ok_or(Error::Protocol("no free channel ids"))
}

fn send_channel_open(st: &mut SessionState, open_st: &OpenChannelState) -> Result<()> {
    let mut payload = PacketEncode::new();
    payload.put_u8(msg::CHANNEL_OPEN);
    payload.put_str(&open_st.open.channel_type);
    payload.put_u32(open_st.our_id);
    payload.put_u32(open_st.open.config.recv_window_max);
    payload.put_u32(open_st.open.config.recv_packet_len_max);
    payload.put_raw(&open_st.open.open_payload);
    st.codec.send_pipe.feed_packet(&payload.finish())?;
    log::debug!("sending SSH_MSG_CHANNEL_OPEN {:?} for our channel {}",
        open_st.open.channel_type, open_st.our_id);
    Ok(())
}

fn recv_channel_open_confirmation(st: &mut SessionState, payload: &mut PacketDecode) -> ResultRecvState {
    let our_id = payload.get_u32()?;
    let their_id = payload.get_u32()?;
    let send_window = payload.get_u32()?;
    let send_packet_len_max = payload.get_u32()?;
    let confirm_payload = payload.remaining();

    log::debug!("received SSH_MSG_CHANNEL_OPEN_CONFIRMATION for our channel {}, \
        window {}, max packet size {}", our_id, send_window, send_packet_len_max);

    let channels = st.conn_st.channels.clone();
    let mut channels = channels.lock();
    let open_st = take_opening(&mut channels, our_id)?;

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (error_tx, error_rx) = oneshot::channel();
    let channel_st = channel_state::init_channel(ChannelInit {
        our_id,
        their_id,
        event_tx,
        error_tx,
        send_window,
        send_packet_len_max,
        recv_window_max: open_st.open.config.recv_window_max,
        recv_packet_len_max: open_st.open.config.recv_packet_len_max,
    });
    let channel_mutex = Arc::new(Mutex::new(channel_st));

    if open_st.open.resolver.is_waiting() {
        let (channel, receiver) = channel::new_channel(st.self_weak.clone(), &channel_mutex, event_rx, error_rx);
        open_st.open.resolver.resolve(Ok((channel, receiver, confirm_payload)));
    } else {
        // nobody wants the channel any more
        let (close_tx, _) = Promise::new();
        channel_state::close(st, &mut channel_mutex.lock(), close_tx);
    }

    channels.insert(our_id, ConnChannelState::Ready(channel_mutex));
    state::wakeup(st);
    Ok(None)
}

fn recv_channel_open_failure(st: &mut SessionState, payload: &mut PacketDecode) -> ResultRecvState {
    let our_id = payload.get_u32()?;
    let error = ChannelOpenError {
        reason_code: payload.get_u32()?,
        description: payload.get_string()?,
        description_lang: payload.get_string()?,
    };

    let channels = st.conn_st.channels.clone();
    let mut channels = channels.lock();
    let open_st = take_opening(&mut channels, our_id)?;
    channels.remove(&our_id);

    log::debug!("received SSH_MSG_CHANNEL_OPEN_FAILURE for our channel {}: {}", our_id, error);
    open_st.open.resolver.resolve(Err(Error::ChannelOpen(error)));
    Ok(None)
}

/// Takes the state of a channel that we are opening out of the map, leaving `Closed` in its
/// place.
fn take_opening(channels: &mut HashMap<u32, ConnChannelState>, our_id: u32) -> Result<OpenChannelState> {
    let Some(conn_channel_st) = channels.get_mut(&our_id) else {
        return Err(Error::Protocol("received open reply for unknown channel"))
    };
    match replace(conn_channel_st, ConnChannelState::Closed) {
        ConnChannelState::Open(open_st) if open_st.open_sent => Ok(open_st),
        other => {
            *conn_channel_st = other;
            Err(Error::Protocol("received open reply for a channel that is not being opened"))
        },
    }
}

fn recv_channel_open(st: &mut SessionState, payload: &mut PacketDecode) -> ResultRecvState {
    let channel_type = payload.get_string()?;
    let their_id = payload.get_u32()?;
    let send_window = payload.get_u32()?;
    let send_packet_len_max = payload.get_u32()?;
    let open_payload = payload.remaining();

    let channels = st.conn_st.channels.clone();
    let mut channels = channels.lock();
    let Ok(our_id) = alloc_our_id(&channels) else {
        let open_err = ChannelOpenError::new(open::RESOURCE_SHORTAGE, "no free channel ids");
        st.conn_st.outbox.push_back(encode_channel_open_failure(their_id, &open_err));
        state::wakeup(st);
        return Ok(None)
    };

    let (decision_tx, decision_rx) = oneshot::channel();
    let accept_st = AcceptChannelState { our_id, their_id, send_window, send_packet_len_max, decision_rx };
    channels.insert(our_id, ConnChannelState::Accept(accept_st));
    drop(channels);

    log::debug!("received SSH_MSG_CHANNEL_OPEN {:?} for our channel {}, their channel {}",
        channel_type, our_id, their_id);

    state::wakeup(st);
    let accept = AcceptChannel { channel_type, open_payload, decision_tx };
    recv::send_event(SessionEvent::Channel(accept))
}

fn init_accepted_channel(
    st: &mut SessionState,
    accept_st: AcceptChannelState,
    config: ChannelConfig,
    resolver: Resolver<(Channel, ChannelReceiver)>,
) -> ConnChannelState {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (error_tx, error_rx) = oneshot::channel();
    let channel_st = channel_state::init_channel(ChannelInit {
        our_id: accept_st.our_id,
        their_id: accept_st.their_id,
        event_tx,
        error_tx,
        send_window: accept_st.send_window,
        send_packet_len_max: accept_st.send_packet_len_max,
        recv_window_max: config.recv_window_max,
        recv_packet_len_max: config.recv_packet_len_max,
    });
    let channel_mutex = Arc::new(Mutex::new(channel_st));

    let (channel, receiver) = channel::new_channel(st.self_weak.clone(), &channel_mutex, event_rx, error_rx);
    resolver.resolve(Ok((channel, receiver)));
    ConnChannelState::Ready(channel_mutex)
}

fn send_channel_open_confirmation(
    st: &mut SessionState,
    accept_st: &AcceptChannelState,
    config: &ChannelConfig,
    confirm_payload: &Bytes,
) -> Result<()> {
    let mut payload = PacketEncode::new();
    payload.put_u8(msg::CHANNEL_OPEN_CONFIRMATION);
    payload.put_u32(accept_st.their_id);
    payload.put_u32(accept_st.our_id);
    payload.put_u32(config.recv_window_max);
    payload.put_u32(config.recv_packet_len_max);
    payload.put_raw(confirm_payload);
    st.codec.send_pipe.feed_packet(&payload.finish())?;
    log::debug!("sending SSH_MSG_CHANNEL_OPEN_CONFIRMATION for our channel {}", accept_st.our_id);
    Ok(())
}

fn send_channel_open_failure(st: &mut SessionState, their_id: u32, open_err: ChannelOpenError) -> Result<()> {
    st.codec.send_pipe.feed_packet(&encode_channel_open_failure(their_id, &open_err))?;
    log::debug!("sending SSH_MSG_CHANNEL_OPEN_FAILURE for their channel {}: {}", their_id, open_err);
    Ok(())
}

fn encode_channel_open_failure(their_id: u32, open_err: &ChannelOpenError) -> Bytes {
    let mut payload = PacketEncode::new();
    payload.put_u8(msg::CHANNEL_OPEN_FAILURE);
    payload.put_u32(their_id);
    payload.put_u32(open_err.reason_code);
    payload.put_str(&open_err.description);
    payload.put_str(&open_err.description_lang);
    payload.finish()
}

pub(super) fn send_global_request(
    st: &mut SessionState,
    request_type: String,
    payload: Bytes,
    reply_tx: Option<Resolver<GlobalReply>>,
) -> Result<()> {
    state::check_open(st)?;
    st.conn_st.send_reqs.push_back(SendGlobalReq { request_type, payload, reply_tx });
    state::wakeup(st);
    Ok(())
}

fn send_global_request_packet(st: &mut SessionState, req: &SendGlobalReq) -> Result<()> {
    let mut payload = PacketEncode::new();
    payload.put_u8(msg::GLOBAL_REQUEST);
    payload.put_str(&req.request_type);
    payload.put_bool(req.reply_tx.is_some());
    payload.put_raw(&req.payload);
    st.codec.send_pipe.feed_packet(&payload.finish())?;
    log::debug!("sending SSH_MSG_GLOBAL_REQUEST {:?}", req.request_type);
    Ok(())
}

fn recv_request_success(st: &mut SessionState, payload: &mut PacketDecode) -> ResultRecvState {
    let Some(reply_tx) = st.conn_st.recv_replies.pop_front() else {
        return Err(Error::Protocol("received SSH_MSG_REQUEST_SUCCESS, but no reply was expected"))
    };
    log::debug!("received SSH_MSG_REQUEST_SUCCESS");
    reply_tx.resolve(Ok(GlobalReply::Success(payload.remaining())));
    Ok(None)
}

fn recv_request_failure(st: &mut SessionState) -> ResultRecvState {
    let Some(reply_tx) = st.conn_st.recv_replies.pop_front() else {
        return Err(Error::Protocol("received SSH_MSG_REQUEST_FAILURE, but no reply was expected"))
    };
    log::debug!("received SSH_MSG_REQUEST_FAILURE");
    reply_tx.resolve(Ok(GlobalReply::Failure));
    Ok(None)
}

fn recv_global_request(st: &mut SessionState, payload: &mut PacketDecode) -> ResultRecvState {
    let request_type = payload.get_string()?;
    let want_reply = payload.get_bool()?;
    let req_payload = payload.remaining();
    log::debug!("received SSH_MSG_GLOBAL_REQUEST {:?}", request_type);

    let reply = if want_reply {
        let (reply_tx, reply_rx) = oneshot::channel();
        st.conn_st.their_replies.push_back(reply_rx);
        state::wakeup(st);
        Some(GlobalReplySender { reply_tx })
    } else {
        None
    };

    let req = GlobalReq { request_type, payload: req_payload, reply };
    recv::send_event(SessionEvent::GlobalRequest(req))
}

fn send_global_reply(st: &mut SessionState, reply: &GlobalReply) -> Result<()> {
    let mut payload = PacketEncode::new();
    match reply {
        GlobalReply::Success(reply_payload) => {
            payload.put_u8(msg::REQUEST_SUCCESS);
            payload.put_raw(reply_payload);
            log::debug!("sending SSH_MSG_REQUEST_SUCCESS");
        },
        GlobalReply::Failure => {
            payload.put_u8(msg::REQUEST_FAILURE);
            log::debug!("sending SSH_MSG_REQUEST_FAILURE");
        },
    }
    st.codec.send_pipe.feed_packet(&payload.finish())?;
    Ok(())
}

pub(super) fn abort(st: &mut SessionState, err: &Error) {
    for open in st.conn_st.open_channels.drain(..) {
        open.resolver.resolve(Err(err.clone()));
    }
    for req in st.conn_st.send_reqs.drain(..) {
        if let Some(reply_tx) = req.reply_tx {
            reply_tx.resolve(Err(err.clone()));
        }
    }
    for reply_tx in st.conn_st.recv_replies.drain(..) {
        reply_tx.resolve(Err(err.clone()));
    }
    st.conn_st.their_replies.clear();
    st.conn_st.outbox.clear();

    let mut channels = st.conn_st.channels.lock();
    for (_, conn_channel_st) in channels.drain() {
        match conn_channel_st {
            ConnChannelState::Open(open_st) => open_st.open.resolver.resolve(Err(err.clone())),
            ConnChannelState::Ready(channel_mutex) =>
                channel_state::abort_session(&mut channel_mutex.lock(), err),
            ConnChannelState::Accept(_) | ConnChannelState::Closed => {},
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng as _;
    use crate::util::CryptoRngCore;
    use super::*;
    use super::super::Role;
    use super::super::channel::ChannelEvent;
    use super::super::config::SessionConfig;

    fn insert_channel(st: &mut SessionState, our_id: u32, recv_window_max: u32) -> (Channel, ChannelReceiver) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = oneshot::channel();
        let channel_st = channel_state::init_channel(ChannelInit {
            our_id,
            their_id: our_id + 10,
            event_tx,
            error_tx,
            send_window: 1000,
            send_packet_len_max: 1000,
            recv_window_max,
            recv_packet_len_max: 1000,
        });
        let channel_mutex = Arc::new(Mutex::new(channel_st));
        let handles = channel::new_channel(st.self_weak.clone(), &channel_mutex, event_rx, error_rx);
        st.conn_st.channels.lock().insert(our_id, ConnChannelState::Ready(channel_mutex));
        handles
    }

    fn channel_data(our_id: u32, len: usize) -> PacketDecode {
        let mut payload = PacketEncode::new();
        payload.put_u32(our_id);
        payload.put_bytes(&vec![0x5a; len]);
        PacketDecode::new(payload.finish())
    }

    #[tokio::test]
    async fn test_window_overrun_aborts_only_that_channel() {
        let (event_tx, _event_rx) = mpsc::channel(1);
        let rng: Box<dyn CryptoRngCore + Send> = Box::new(rand_chacha::ChaCha8Rng::seed_from_u64(1));
        let session_st = state::new_session(Role::Client, SessionConfig::default(), rng, event_tx).unwrap();

        let ((_channel_a, mut receiver_a), (_channel_b, mut receiver_b)) = {
            let mut st = session_st.lock();
            (insert_channel(&mut st, 0, 100), insert_channel(&mut st, 1, 100))
        };

        {
            let mut st = session_st.lock();
            assert!(recv_conn_packet(&mut st, msg::CHANNEL_DATA, &mut channel_data(0, 150)).unwrap().is_none());
            assert!(recv_conn_packet(&mut st, msg::CHANNEL_DATA, &mut channel_data(1, 80)).unwrap().is_none());
            assert!(state::check_open(&st).is_ok());
            assert!(matches!(st.conn_st.channels.lock().get(&1), Some(ConnChannelState::Ready(_))));
        }

        assert!(matches!(receiver_a.recv().await, Err(Error::ChannelWindowExceeded)));
        match receiver_b.recv().await {
            Ok(Some(ChannelEvent::Data(data))) => assert_eq!(data.len(), 80),
            res => panic!("unexpected result {:?}", res),
        }

        // the other channel keeps accepting data after the overrun
        let mut st = session_st.lock();
        assert!(recv_conn_packet(&mut st, msg::CHANNEL_DATA, &mut channel_data(1, 20)).unwrap().is_none());
        assert!(state::check_open(&st).is_ok());
    }

    #[test]
    fn test_alloc_our_id_reuses_free_ids() {
        let mut channels = HashMap::new();
        assert_eq!(alloc_our_id(&channels).unwrap(), 0);
        channels.insert(0, ConnChannelState::Closed);
        channels.insert(1, ConnChannelState::Closed);
        channels.insert(3, ConnChannelState::Closed);
        assert_eq!(alloc_our_id(&channels).unwrap(), 2);
        channels.remove(&0);
        assert_eq!(alloc_our_id(&channels).unwrap(), 0);
    }

    #[test]
    fn test_encode_channel_open_failure() {
        let open_err = ChannelOpenError::new(open::UNKNOWN_CHANNEL_TYPE, "nope");
        let mut payload = PacketDecode::new(encode_channel_open_failure(42, &open_err));
        assert_eq!(payload.get_u8().unwrap(), msg::CHANNEL_OPEN_FAILURE);
        assert_eq!(payload.get_u32().unwrap(), 42);
        assert_eq!(payload.get_u32().unwrap(), open::UNKNOWN_CHANNEL_TYPE);
        assert_eq!(payload.get_string().unwrap(), "nope");
        assert_eq!(payload.get_string().unwrap(), "");
    }
}
