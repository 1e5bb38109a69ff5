use futures_core::ready;
use std::task::{Context, Poll};
use crate::codec::{PacketDecode, PacketEncode, RecvPacket};
use crate::codes::msg;
use crate::error::{Error, Result, DisconnectError};
use super::{auth, auth_server, conn, negotiate, Role};
use super::event::{SessionEvent, DebugMsg};
use super::pump::Pump;
use super::state::{self, SessionState};

/// Work left over from a received packet that must finish before we read the next one.
pub(super) trait RecvState {
    fn poll(&mut self, st: &mut SessionState, cx: &mut Context) -> Poll<Result<()>>;
}

pub(super) type ResultRecvState = Result<Option<Box<dyn RecvState + Send>>>;

pub(super) fn pump_recv(st: &mut SessionState, cx: &mut Context) -> Result<Pump> {
    match st.recv_st.take() {
        Some(mut recv_st) => match recv_st.poll(st, cx) {
            Poll::Ready(Ok(())) => Ok(Pump::Progress),
            Poll::Ready(Err(err)) => Err(err),
            Poll::Pending => {
                st.recv_st = Some(recv_st);
                Ok(Pump::Pending)
            },
        },
        None => Ok(Pump::Pending),
    }
}

pub(super) fn recv_packet(st: &mut SessionState, packet: RecvPacket) -> ResultRecvState {
    let mut payload = PacketDecode::new(packet.payload.clone());
    let msg_id = payload.get_u8()?;
    log::trace!("received packet {}, seq {}", msg_id, packet.packet_seq);

    check_phase(st, msg_id)?;
    let result = if msg_id == msg::KEXINIT {
        negotiate::recv_kex_init(st, packet.payload.clone(), &mut payload)
    } else {
        recv_packet_dispatch(st, msg_id, &mut payload)
    };

    match result {
        Ok(recv_state) => Ok(recv_state),
        Err(Error::PacketNotImplemented(msg_id)) => not_implemented(st, msg_id, &packet),
        Err(err) => Err(err),
    }
}

/// Rejects messages that the peer must not send in the current phase of the session.
fn check_phase(st: &SessionState, msg_id: u8) -> Result<()> {
    let is_known = matches!(msg_id, msg::SERVICE_REQUEST | msg::SERVICE_ACCEPT) ||
        msg::is_kex(msg_id) || msg::is_auth(msg_id) || msg::is_conn(msg_id);
    if msg::is_transport_generic(msg_id) || !is_known {
        return Ok(())
    }

    // after the peer sent SSH_MSG_KEXINIT, only key exchange messages may follow until its
    // SSH_MSG_NEWKEYS (RFC 4253, section 7.1)
    if negotiate::is_peer_in_kex(st) && !msg::is_kex(msg_id) {
        log::debug!("received packet {} during key exchange", msg_id);
        return Err(Error::Protocol("received a non-kex message during key exchange"))
    }

    if msg::is_kex(msg_id) {
        Ok(())
    } else if st.session_id.is_none() {
        log::debug!("received packet {} before the first key exchange", msg_id);
        Err(Error::Protocol("received a message before the first key exchange"))
    } else if msg::is_conn(msg_id) && !state::is_authenticated(st) {
        log::debug!("received packet {} before authentication", msg_id);
        Err(Error::Protocol("received a connection message before authentication"))
    } else {
        Ok(())
    }
}

fn recv_packet_dispatch(st: &mut SessionState, msg_id: u8, payload: &mut PacketDecode) -> ResultRecvState {
    match (msg_id, st.role) {
        (msg::DISCONNECT, _) => recv_disconnect(st, payload),
        (msg::DEBUG, _) => recv_debug(st, payload),
        (msg::UNIMPLEMENTED, _) => recv_unimplemented(st, payload),
        (msg::IGNORE, _) => Ok(None),
        (msg::SERVICE_ACCEPT, Role::Client) => recv_service_accept(st, payload),
        (msg::SERVICE_REQUEST, Role::Server) => auth_server::recv_service_request(st, payload),
        (21..=29, _) => negotiate::recv_negotiate_packet(st, msg_id, payload),
        (30..=49, _) => negotiate::recv_kex_packet(st, msg_id, payload),
        (50..=79, Role::Client) => auth::recv_auth_packet(st, msg_id, payload),
        (50..=79, Role::Server) => auth_server::recv_auth_packet(st, msg_id, payload),
        (80..=127, _) => conn::recv_conn_packet(st, msg_id, payload),
        _ => Err(Error::PacketNotImplemented(msg_id)),
    }
}

fn recv_disconnect(_: &mut SessionState, payload: &mut PacketDecode) -> ResultRecvState {
    let disconnect = DisconnectError {
        reason_code: payload.get_u32()?,
        description: payload.get_string()?,
        description_lang: payload.get_string()?,
    };
    log::debug!("received SSH_MSG_DISCONNECT: {:?}", disconnect);
    Err(Error::PeerDisconnected(disconnect))
}

fn recv_debug(_st: &mut SessionState, payload: &mut PacketDecode) -> ResultRecvState {
    let debug_msg = DebugMsg {
        always_display: payload.get_bool()?,
        message: payload.get_string()?,
        message_lang: payload.get_string()?,
    };
    log::debug!("received SSH_MSG_DEBUG: {:?}", debug_msg.message);
    send_event(SessionEvent::DebugMsg(debug_msg))
}

fn recv_unimplemented(_st: &mut SessionState, payload: &mut PacketDecode) -> ResultRecvState {
    let packet_seq = payload.get_u32()?;
    log::debug!("received SSH_MSG_UNIMPLEMENTED for packet seq {}", packet_seq);
    Ok(None)
}

fn recv_service_accept(st: &mut SessionState, payload: &mut PacketDecode) -> ResultRecvState {
    let service_name = payload.get_string()?;

    if service_name.as_str() == "ssh-userauth" {
        auth::recv_service_accept(st)
    } else {
        log::debug!("received SSH_MSG_SERVICE_ACCEPT for unknown service {:?}", service_name);
        Ok(None)
    }
}

pub(super) fn send_event(event: SessionEvent) -> ResultRecvState {
    struct SendEventState {
        event: Option<SessionEvent>,
    }

    impl RecvState for SendEventState {
        fn poll(&mut self, st: &mut SessionState, cx: &mut Context) -> Poll<Result<()>> {
            let reserve_res = ready!(st.event_tx.poll_reserve(cx));
            if let (Ok(()), Some(event)) = (reserve_res, self.event.take()) {
                let _ = st.event_tx.send_item(event);
            }
            Poll::Ready(Ok(()))
        }
    }

    Ok(Some(Box::new(SendEventState { event: Some(event) })))
}

fn not_implemented(st: &mut SessionState, msg_id: u8, packet: &RecvPacket) -> ResultRecvState {
    log::debug!("received unimplemented packet {}, seq {}", msg_id, packet.packet_seq);
    let mut reply = PacketEncode::new();
    reply.put_u8(msg::UNIMPLEMENTED);
    reply.put_u32(packet.packet_seq);
    st.codec.send_pipe.feed_packet(&reply.finish())?;
    Ok(None)
}
