use std::task::Context;
use crate::codec::{PacketDecode, PacketEncode};
use crate::codes::msg;
use crate::error::{Result, Error};
use super::auth_method::AuthMethod;
use super::event::{SessionEvent, AuthBanner};
use super::negotiate;
use super::pump::Pump;
use super::recv::{self, ResultRecvState};
use super::state::{self, SessionState};

/// Message sent by the server when authentication attempt fails.
///
/// This corresponds to `SSH_MSG_USERAUTH_FAILURE` (RFC 4252, section 5.1). Note that this may
/// actually represent a [partial success][Self::partial_success].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailure {
    /// Authentication methods that may productively continue the authentication.
    ///
    /// Note that the server must not list the `"none"` method here, even if it is supported.
    pub methods_can_continue: Vec<String>,

    /// True if the authentication request was successful, but the authentication should continue.
    ///
    /// For example, this might be used if the server requires that you pass multiple
    /// authentications before continuing.
    pub partial_success: bool,
}

/// Result of a single authentication method.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum AuthResult {
    /// The authentication was successful.
    Success,

    /// The authentication was rejected (or partially successful).
    Failure(AuthFailure),

    /// The server asks you to change your password (only for the "password" method).
    ///
    /// This corresponds to `SSH_MSG_USERAUTH_PASSWD_CHANGEREQ` (RFC 4252, section 8).
    ChangePassword(AuthPasswordPrompt),
}

impl AuthResult {
    /// Returns `Ok` if this is a success, `Err` otherwise.
    pub fn success_or_error(&self) -> Result<()> {
        match self {
            Self::Success => Ok(()),
            Self::Failure(_) | Self::ChangePassword(_) => Err(Error::AuthFailed),
        }
    }
}

/// Prompt for changing the password, sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPasswordPrompt {
    /// Prompt that should be displayed to the user.
    pub prompt: String,
    /// Language tag of the prompt (as in RFC 3066).
    pub prompt_lang: String,
}

#[derive(Default)]
pub(super) struct AuthState {
    service_requested: bool,
    service_accepted: bool,
    method: Option<Box<dyn AuthMethod + Send>>,
    success: bool,
}

pub(super) fn init_auth() -> AuthState {
    AuthState::default()
}

pub(super) fn start_method(st: &mut SessionState, method: Box<dyn AuthMethod + Send>) -> Result<()> {
    state::check_open(st)?;
    if st.auth_st.success {
        return Err(Error::Protocol("client is already authenticated"))
    }
    if st.auth_st.method.is_some() {
        return Err(Error::AuthMethodPending)
    }
    st.auth_st.method = Some(method);
    state::wakeup(st);
    Ok(())
}

pub(super) fn pump_auth(st: &mut SessionState, _cx: &mut Context) -> Result<Pump> {
    if st.session_id.is_none() || !negotiate::is_ready(st) {
        // we must not send auth messages during the key exchange
        return Ok(Pump::Pending)
    }

    if !st.auth_st.service_requested {
        send_service_request(st)?;
        st.auth_st.service_requested = true;
        return Ok(Pump::Progress)
    }

    if !st.auth_st.service_accepted {
        return Ok(Pump::Pending)
    }

    let Some(method) = st.auth_st.method.as_mut() else {
        return Ok(Pump::Pending)
    };

    if st.auth_st.success {
        method.recv_success()?;
    }

    let session_id = st.session_id.as_deref().unwrap_or_default();
    if let Some(payload) = method.send_packet(session_id)? {
        st.codec.send_pipe.feed_packet(&payload)?;
        return Ok(Pump::Progress)
    }

    if method.is_done() {
        st.auth_st.method = None;
        return Ok(Pump::Progress)
    }

    Ok(Pump::Pending)
}

fn send_service_request(st: &mut SessionState) -> Result<()> {
    let mut payload = PacketEncode::new();
    payload.put_u8(msg::SERVICE_REQUEST);
    payload.put_str("ssh-userauth");
    st.codec.send_pipe.feed_packet(&payload.finish())?;
    log::debug!("sending SSH_MSG_SERVICE_REQUEST for 'ssh-userauth'");
    Ok(())
}

pub(super) fn recv_service_accept(st: &mut SessionState) -> ResultRecvState {
    if !st.auth_st.service_requested || st.auth_st.service_accepted {
        return Err(Error::Protocol("received unexpected SSH_MSG_SERVICE_ACCEPT"))
    }
    log::debug!("received SSH_MSG_SERVICE_ACCEPT for 'ssh-userauth'");
    st.auth_st.service_accepted = true;
    Ok(None)
}

pub(super) fn recv_auth_packet(
    st: &mut SessionState,
    msg_id: u8,
    payload: &mut PacketDecode,
) -> ResultRecvState {
    match msg_id {
        msg::USERAUTH_FAILURE => recv_auth_failure(st, payload),
        msg::USERAUTH_SUCCESS => recv_auth_success(st, payload),
        msg::USERAUTH_BANNER => recv_auth_banner(st, payload),
        60..=79 => recv_auth_method_packet(st, msg_id, payload),
        _ => Err(Error::PacketNotImplemented(msg_id)),
    }
}

fn recv_auth_method_packet(
    st: &mut SessionState,
    msg_id: u8,
    payload: &mut PacketDecode,
) -> ResultRecvState {
    if let Some(method) = st.auth_st.method.as_mut() {
        method.recv_packet(msg_id, payload)?;
        Ok(None)
    } else {
        Err(Error::PacketNotImplemented(msg_id))
    }
}

fn recv_auth_failure(st: &mut SessionState, payload: &mut PacketDecode) -> ResultRecvState {
    let failure = AuthFailure {
        methods_can_continue: payload.get_name_list()?,
        partial_success: payload.get_bool()?,
    };
    log::debug!("received SSH_MSG_USERAUTH_FAILURE: {:?}", failure);

    if let Some(method) = st.auth_st.method.as_mut() {
        method.recv_failure(failure)?;
        Ok(None)
    } else {
        Err(Error::Protocol("received unexpected SSH_MSG_USERAUTH_FAILURE"))
    }
}

fn recv_auth_success(st: &mut SessionState, _payload: &mut PacketDecode) -> ResultRecvState {
    if st.auth_st.success {
        return Err(Error::Protocol("received SSH_MSG_USERAUTH_SUCCESS twice"))
    }
    st.auth_st.success = true;
    log::debug!("received SSH_MSG_USERAUTH_SUCCESS");

    // "zlib@openssh.com" starts to compress after the authentication (RFC 4253, section 6.2 and
    // the OpenSSH PROTOCOL file); the server enables it right after sending the success
    st.codec.send_pipe.enable_compress(true);
    st.codec.recv_pipe.enable_decompress(true);
    Ok(None)
}

fn recv_auth_banner(_st: &mut SessionState, payload: &mut PacketDecode) -> ResultRecvState {
    let banner = AuthBanner {
        message: payload.get_string()?,
        message_lang: payload.get_string()?,
    };
    log::debug!("received SSH_MSG_USERAUTH_BANNER");
    recv::send_event(SessionEvent::AuthBanner(banner))
}

pub(super) fn is_authenticated(st: &SessionState) -> bool {
    st.auth_st.success
}

pub(super) fn abort(st: &mut SessionState, err: &Error) {
    if let Some(mut method) = st.auth_st.method.take() {
        method.abort(err.clone());
    }
}
