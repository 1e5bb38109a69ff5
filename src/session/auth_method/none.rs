use bytes::Bytes;
use crate::codec::PacketDecode;
use crate::error::{Error, Result};
use crate::promise::Resolver;
use super::super::auth::{AuthFailure, AuthResult};
use super::{AuthMethod, ResultSlot, request_header};

/// The "none" method, used to learn which methods the server supports (RFC 4252, section 5.2).
#[derive(Debug)]
pub struct AuthNone {
    username: String,
    request_sent: bool,
    result: ResultSlot,
}

impl AuthNone {
    pub fn new(username: String, result_tx: Resolver<AuthResult>) -> AuthNone {
        AuthNone { username, request_sent: false, result: ResultSlot::new(result_tx) }
    }
}

impl AuthMethod for AuthNone {
    fn recv_success(&mut self) -> Result<()> {
        self.result.resolve(Ok(AuthResult::Success));
        Ok(())
    }

    fn recv_failure(&mut self, failure: AuthFailure) -> Result<()> {
        self.result.resolve(Ok(AuthResult::Failure(failure)));
        Ok(())
    }

    fn recv_packet(&mut self, msg_id: u8, _payload: &mut PacketDecode) -> Result<()> {
        Err(Error::PacketNotImplemented(msg_id))
    }

    fn send_packet(&mut self, _session_id: &[u8]) -> Result<Option<Bytes>> {
        if self.request_sent {
            return Ok(None)
        }
        let payload = request_header(&self.username, "none");
        log::debug!("sending SSH_MSG_USERAUTH_REQUEST for method 'none'");
        self.request_sent = true;
        Ok(Some(payload.finish()))
    }

    fn is_done(&self) -> bool {
        self.result.is_done()
    }

    fn abort(&mut self, err: Error) {
        self.result.resolve(Err(err));
    }
}
