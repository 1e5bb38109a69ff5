use bytes::Bytes;
use std::collections::VecDeque;
use std::future::Future as _;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use crate::codec::{PacketDecode, PacketEncode};
use crate::codes::msg;
use crate::error::{Error, Result};
use crate::pubkey::{self, Pubkey, PubkeyAlgo};
use super::auth_method::keyboard_interactive::{self, KbdInfoRequest};
use super::auth_method::pubkey::signed_data;
use super::config::SessionConfig;
use super::event::SessionEvent;
use super::negotiate;
use super::pump::Pump;
use super::recv::ResultRecvState;
use super::state::{self, SessionState};

/// Authentication request from a client (server only).
///
/// You receive this in [`SessionEvent::AuthRequest`] and answer it through the
/// [`responder`][Self::responder]. The request is already checked by the session: the username
/// and service did not change, the method is one of
/// [`SessionConfig::auth_methods`][super::SessionConfig::auth_methods] and public key signatures
/// are verified.
#[derive(Debug)]
pub struct AuthRequest {
    /// Name of the user that wants to be authenticated.
    pub username: String,
    /// The authentication method and its data.
    pub method: AuthRequestMethod,
    /// Sends the decision back to the session.
    pub responder: AuthResponder,
}

/// Method-specific data of an [`AuthRequest`].
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum AuthRequestMethod {
    /// The "password" method (RFC 4252, section 8).
    Password {
        /// The password given by the client.
        password: String,
        /// New password, if the client is changing the password.
        new_password: Option<String>,
    },

    /// The "publickey" method (RFC 4252, section 7).
    Pubkey {
        /// The public key of the client.
        pubkey: Pubkey,
        /// The signature algorithm.
        algo: &'static PubkeyAlgo,
        /// True if the client proved that it owns the private key (the signature was verified).
        ///
        /// If this is false, the client only asks whether the key would be acceptable; accepting
        /// the request answers with `SSH_MSG_USERAUTH_PK_OK` and does not authenticate the
        /// client.
        signed: bool,
    },

    /// The "keyboard-interactive" method (RFC 4256).
    KeyboardInteractive {
        /// Submethods hinted by the client (may be empty).
        submethods: String,
        /// Responses to the prompts of the previous [`AuthResponse::InfoRequest`], or `None` for
        /// the first request.
        responses: Option<Vec<String>>,
    },
}

impl AuthRequestMethod {
    /// Name of the method on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Password { .. } => "password",
            Self::Pubkey { .. } => "publickey",
            Self::KeyboardInteractive { .. } => "keyboard-interactive",
        }
    }
}

/// Decision of the server about an [`AuthRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResponse {
    /// Authenticate the client.
    Accept,
    /// Reject the request; this counts as a failed attempt.
    Reject,
    /// The method succeeded, but the client must also pass another method.
    PartialSuccess,
    /// Send prompts to the client (only for "keyboard-interactive").
    InfoRequest(KbdInfoRequest),
}

/// Sends the [`AuthResponse`] to an [`AuthRequest`].
///
/// Dropping the responder rejects the request.
#[derive(Debug)]
pub struct AuthResponder {
    response_tx: oneshot::Sender<AuthResponse>,
}

impl AuthResponder {
    /// Sends a response.
    pub fn respond(self, response: AuthResponse) {
        let _ = self.response_tx.send(response);
    }

    /// Accepts the request.
    pub fn accept(self) {
        self.respond(AuthResponse::Accept)
    }

    /// Rejects the request.
    pub fn reject(self) {
        self.respond(AuthResponse::Reject)
    }

    /// Reports a partial success.
    pub fn partial_success(self) {
        self.respond(AuthResponse::PartialSuccess)
    }

    /// Sends keyboard-interactive prompts to the client.
    pub fn info_request(self, request: KbdInfoRequest) {
        self.respond(AuthResponse::InfoRequest(request))
    }
}

pub(super) struct AuthServerState {
    service_accepted: bool,
    username: Option<String>,
    service: Option<String>,
    methods: Vec<String>,
    failures: u32,
    banner: Option<String>,
    pending: Option<PendingRequest>,
    kbd_prompt_count: Option<usize>,
    outbox: VecDeque<Outgoing>,
    success_queued: bool,
    success: bool,
}

struct PendingRequest {
    method_name: &'static str,
    event: Option<SessionEvent>,
    response_rx: oneshot::Receiver<AuthResponse>,
    pk_query: Option<(&'static str, Bytes)>,
}

enum Outgoing {
    Packet(Bytes),
    Success,
}

pub(super) fn init_auth_server(config: &SessionConfig) -> AuthServerState {
    AuthServerState {
        service_accepted: false,
        username: None,
        service: None,
        methods: config.auth_methods.clone(),
        failures: 0,
        banner: config.auth_banner.clone(),
        pending: None,
        kbd_prompt_count: None,
        outbox: VecDeque::new(),
        success_queued: false,
        success: false,
    }
}

pub(super) fn pump_auth_server(st: &mut SessionState, cx: &mut Context) -> Result<Pump> {
    if st.session_id.is_none() || !negotiate::is_ready(st) {
        return Ok(Pump::Pending)
    }

    if let Some(outgoing) = st.auth_server_st.outbox.pop_front() {
        match outgoing {
            Outgoing::Packet(payload) => { st.codec.send_pipe.feed_packet(&payload)?; },
            Outgoing::Success => { send_success(st)?; },
        }
        return Ok(Pump::Progress)
    }

    if st.auth_server_st.pending.is_some() {
        return pump_pending(st, cx)
    }

    Ok(Pump::Pending)
}

fn pump_pending(st: &mut SessionState, cx: &mut Context) -> Result<Pump> {
    let Some(pending) = st.auth_server_st.pending.as_mut() else {
        return Ok(Pump::Pending)
    };

    if pending.event.is_some() {
        let reserve_res = pump_ready!(st.event_tx.poll_reserve(cx));
        if let (Ok(()), Some(event)) = (reserve_res, pending.event.take()) {
            let _ = st.event_tx.send_item(event);
        }
        pending.event = None;
    }

    let response = match Pin::new(&mut pending.response_rx).poll(cx) {
        Poll::Ready(Ok(response)) => response,
        Poll::Ready(Err(_)) => AuthResponse::Reject,
        Poll::Pending => return Ok(Pump::Pending),
    };

    let Some(pending) = st.auth_server_st.pending.take() else {
        return Ok(Pump::Pending)
    };
    log::debug!("authentication request for method {:?}: {:?}", pending.method_name, response);
    handle_response(st, pending, response)?;
    Ok(Pump::Progress)
}

fn handle_response(st: &mut SessionState, pending: PendingRequest, response: AuthResponse) -> Result<()> {
    let auth_st = &mut st.auth_server_st;
    if pending.method_name != "keyboard-interactive" {
        auth_st.kbd_prompt_count = None;
    }

    match response {
        AuthResponse::Accept => match pending.pk_query {
            Some((algo_name, pubkey_blob)) => {
                // RFC 4252, section 7
                let mut payload = PacketEncode::new();
                payload.put_u8(msg::USERAUTH_PK_OK);
                payload.put_str(algo_name);
                payload.put_bytes(&pubkey_blob);
                push_response(auth_st, Outgoing::Packet(payload.finish()));
            },
            None => {
                auth_st.kbd_prompt_count = None;
                auth_st.success_queued = true;
                push_response(auth_st, Outgoing::Success);
            },
        },
        AuthResponse::PartialSuccess => {
            auth_st.kbd_prompt_count = None;
            auth_st.methods.retain(|name| name != pending.method_name);
            let failure = encode_failure(&auth_st.methods, true);
            push_response(auth_st, Outgoing::Packet(failure));
        },
        AuthResponse::InfoRequest(request) if pending.method_name == "keyboard-interactive" => {
            auth_st.kbd_prompt_count = Some(request.prompts.len());
            let payload = keyboard_interactive::encode_info_request(&request);
            push_response(auth_st, Outgoing::Packet(payload));
        },
        AuthResponse::InfoRequest(_) => {
            log::warn!("ignoring info request for method {:?}", pending.method_name);
            record_failure(st)?;
        },
        AuthResponse::Reject => record_failure(st)?,
    }
    Ok(())
}

/// Counts a failed attempt and answers with `SSH_MSG_USERAUTH_FAILURE`.
fn record_failure(st: &mut SessionState) -> Result<()> {
    let auth_st = &mut st.auth_server_st;
    auth_st.kbd_prompt_count = None;
    auth_st.failures += 1;
    if auth_st.failures >= st.config.max_auth_attempts {
        log::debug!("client failed to authenticate {} times", auth_st.failures);
        return Err(Error::AuthExhausted)
    }
    let failure = encode_failure(&auth_st.methods, false);
    push_response(auth_st, Outgoing::Packet(failure));
    Ok(())
}

fn push_response(auth_st: &mut AuthServerState, outgoing: Outgoing) {
    // the banner must come before the end of the authentication (RFC 4252, section 5.4)
    if let Some(banner) = auth_st.banner.take() {
        let mut payload = PacketEncode::new();
        payload.put_u8(msg::USERAUTH_BANNER);
        payload.put_str(&banner);
        payload.put_str("");
        auth_st.outbox.push_back(Outgoing::Packet(payload.finish()));
    }
    auth_st.outbox.push_back(outgoing);
}

fn encode_failure(methods: &[String], partial_success: bool) -> Bytes {
    let mut payload = PacketEncode::new();
    payload.put_u8(msg::USERAUTH_FAILURE);
    payload.put_name_list(methods);
    payload.put_bool(partial_success);
    payload.finish()
}

fn send_success(st: &mut SessionState) -> Result<()> {
    let mut payload = PacketEncode::new();
    payload.put_u8(msg::USERAUTH_SUCCESS);
    st.codec.send_pipe.feed_packet(&payload.finish())?;
    st.auth_server_st.success = true;
    log::debug!("sending SSH_MSG_USERAUTH_SUCCESS");

    st.codec.send_pipe.enable_compress(true);
    st.codec.recv_pipe.enable_decompress(true);
    state::wakeup(st);
    Ok(())
}

pub(super) fn recv_service_request(st: &mut SessionState, payload: &mut PacketDecode) -> ResultRecvState {
    let service_name = payload.get_string()?;
    log::debug!("received SSH_MSG_SERVICE_REQUEST for {:?}", service_name);
    if service_name != "ssh-userauth" || st.auth_server_st.service_accepted {
        return Err(Error::ServiceNotAvailable(service_name))
    }

    let mut reply = PacketEncode::new();
    reply.put_u8(msg::SERVICE_ACCEPT);
    reply.put_str(&service_name);
    st.auth_server_st.outbox.push_back(Outgoing::Packet(reply.finish()));
    st.auth_server_st.service_accepted = true;
    Ok(None)
}

pub(super) fn recv_auth_packet(
    st: &mut SessionState,
    msg_id: u8,
    payload: &mut PacketDecode,
) -> ResultRecvState {
    match msg_id {
        msg::USERAUTH_REQUEST => recv_request(st, payload),
        msg::USERAUTH_INFO_RESPONSE => recv_info_response(st, payload),
        _ => Err(Error::PacketNotImplemented(msg_id)),
    }
}

fn recv_request(st: &mut SessionState, payload: &mut PacketDecode) -> ResultRecvState {
    let username = payload.get_string()?;
    let service = payload.get_string()?;
    let method_name = payload.get_string()?;
    log::debug!("received SSH_MSG_USERAUTH_REQUEST for user {:?}, method {:?}", username, method_name);

    if st.auth_server_st.success || st.auth_server_st.success_queued {
        // RFC 4252, section 5.1
        log::debug!("ignoring authentication request after success");
        return Ok(None)
    }
    if !st.auth_server_st.service_accepted {
        return Err(Error::Protocol("received SSH_MSG_USERAUTH_REQUEST before SSH_MSG_SERVICE_ACCEPT"))
    }
    check_constant(&mut st.auth_server_st.username, &username,
        "client changed the username during authentication")?;
    check_constant(&mut st.auth_server_st.service, &service,
        "client changed the service during authentication")?;
    if service != "ssh-connection" {
        return Err(Error::ServiceNotAvailable(service))
    }

    if st.auth_server_st.pending.take().is_some() {
        log::debug!("new authentication request replaces the pending one");
    }
    st.auth_server_st.kbd_prompt_count = None;

    if method_name == "none" {
        let failure = encode_failure(&st.auth_server_st.methods, false);
        push_response(&mut st.auth_server_st, Outgoing::Packet(failure));
        return Ok(None)
    }

    if !st.auth_server_st.methods.iter().any(|name| *name == method_name) {
        log::debug!("method {:?} is not offered", method_name);
        record_failure(st)?;
        return Ok(None)
    }

    let (method, pk_query) = match method_name.as_str() {
        "password" => {
            let changing = payload.get_bool()?;
            let password = payload.get_string()?;
            let new_password = if changing { Some(payload.get_string()?) } else { None };
            (AuthRequestMethod::Password { password, new_password }, None)
        },
        "publickey" => match decode_pubkey_request(st, &username, &service, payload)? {
            Some(decoded) => decoded,
            None => {
                record_failure(st)?;
                return Ok(None)
            },
        },
        "keyboard-interactive" => {
            let _lang = payload.get_string()?;
            let submethods = payload.get_string()?;
            (AuthRequestMethod::KeyboardInteractive { submethods, responses: None }, None)
        },
        _ => {
            record_failure(st)?;
            return Ok(None)
        },
    };

    start_request(st, username, method, pk_query);
    Ok(None)
}

/// Decodes a "publickey" request and verifies its signature.
///
/// Returns `None` if the request must be rejected without asking the application.
fn decode_pubkey_request(
    st: &SessionState,
    username: &str,
    service: &str,
    payload: &mut PacketDecode,
) -> Result<Option<(AuthRequestMethod, Option<(&'static str, Bytes)>)>> {
    let signed = payload.get_bool()?;
    let algo_name = payload.get_string()?;
    let pubkey_blob = payload.get_bytes()?;
    let signature = if signed { Some(payload.get_bytes()?) } else { None };

    let Some(algo) = pubkey::by_name(&algo_name) else {
        log::debug!("unknown public key algorithm {:?}", algo_name);
        return Ok(None)
    };
    let pubkey = match Pubkey::decode(pubkey_blob.clone()) {
        Ok(pubkey) if algo.is_compatible(&pubkey) => pubkey,
        _ => {
            log::debug!("public key does not match algorithm {:?}", algo_name);
            return Ok(None)
        },
    };

    if let Some(signature) = signature {
        let session_id = st.session_id.as_deref().unwrap_or_default();
        let signed_data = signed_data(session_id, username, service, algo.name, &pubkey_blob);
        if let Err(err) = pubkey.verify(algo, &signed_data, signature) {
            log::debug!("public key signature is invalid: {}", err);
            return Ok(None)
        }
    }

    let pk_query = if signed { None } else { Some((algo.name, pubkey_blob)) };
    Ok(Some((AuthRequestMethod::Pubkey { pubkey, algo, signed }, pk_query)))
}

fn recv_info_response(st: &mut SessionState, payload: &mut PacketDecode) -> ResultRecvState {
    let Some(prompt_count) = st.auth_server_st.kbd_prompt_count.take() else {
        return Err(Error::Protocol("received unexpected SSH_MSG_USERAUTH_INFO_RESPONSE"))
    };

    let response_count = payload.get_u32()?;
    let mut responses = Vec::new();
    for _ in 0..response_count {
        responses.push(payload.get_string()?);
    }
    if responses.len() != prompt_count {
        log::warn!("received {} responses to {} keyboard-interactive prompts",
            responses.len(), prompt_count);
    }

    let Some(username) = st.auth_server_st.username.clone() else {
        return Err(Error::Protocol("received SSH_MSG_USERAUTH_INFO_RESPONSE without a request"))
    };
    let method = AuthRequestMethod::KeyboardInteractive {
        submethods: String::new(),
        responses: Some(responses),
    };
    start_request(st, username, method, None);
    Ok(None)
}

fn start_request(
    st: &mut SessionState,
    username: String,
    method: AuthRequestMethod,
    pk_query: Option<(&'static str, Bytes)>,
) {
    let (response_tx, response_rx) = oneshot::channel();
    let method_name = method.name();
    let request = AuthRequest { username, method, responder: AuthResponder { response_tx } };
    st.auth_server_st.pending = Some(PendingRequest {
        method_name,
        event: Some(SessionEvent::AuthRequest(request)),
        response_rx,
        pk_query,
    });
}

fn check_constant(slot: &mut Option<String>, value: &str, err: &'static str) -> Result<()> {
    match slot {
        Some(expected) if expected != value => Err(Error::Protocol(err)),
        Some(_) => Ok(()),
        None => {
            *slot = Some(value.into());
            Ok(())
        },
    }
}

pub(super) fn is_authenticated(st: &SessionState) -> bool {
    st.auth_server_st.success
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_constant() {
        let mut slot = None;
        check_constant(&mut slot, "alice", "changed").unwrap();
        assert_eq!(slot.as_deref(), Some("alice"));
        check_constant(&mut slot, "alice", "changed").unwrap();
        assert!(matches!(check_constant(&mut slot, "bob", "changed"), Err(Error::Protocol("changed"))));
    }

    #[test]
    fn test_banner_precedes_first_response() {
        let config = SessionConfig::default().with(|c| c.auth_banner = Some("welcome".into()));
        let mut auth_st = init_auth_server(&config);
        let failure = encode_failure(&auth_st.methods, false);
        push_response(&mut auth_st, Outgoing::Packet(failure));
        push_response(&mut auth_st, Outgoing::Success);

        let msg_ids = auth_st.outbox.iter().map(|outgoing| match outgoing {
            Outgoing::Packet(payload) => payload[0],
            Outgoing::Success => msg::USERAUTH_SUCCESS,
        }).collect::<Vec<_>>();
        assert_eq!(msg_ids, vec![msg::USERAUTH_BANNER, msg::USERAUTH_FAILURE, msg::USERAUTH_SUCCESS]);
    }

    #[test]
    fn test_encode_failure() {
        let methods = vec!["publickey".to_string(), "password".to_string()];
        let mut payload = PacketDecode::new(encode_failure(&methods, true));
        assert_eq!(payload.get_u8().unwrap(), msg::USERAUTH_FAILURE);
        assert_eq!(payload.get_name_list().unwrap(), methods);
        assert!(payload.get_bool().unwrap());
    }
}
