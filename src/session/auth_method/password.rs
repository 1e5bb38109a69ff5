use bytes::Bytes;
use crate::codec::PacketDecode;
use crate::codes::msg;
use crate::error::{Error, Result};
use crate::promise::Resolver;
use super::super::auth::{AuthFailure, AuthPasswordPrompt, AuthResult};
use super::{AuthMethod, ResultSlot, request_header};

/// The "password" method (RFC 4252, section 8).
pub struct AuthPassword {
    username: String,
    password: String,
    new_password: Option<String>,
    request_sent: bool,
    result: ResultSlot,
}

impl AuthPassword {
    pub fn new(
        username: String,
        password: String,
        new_password: Option<String>,
        result_tx: Resolver<AuthResult>,
    ) -> AuthPassword {
        AuthPassword {
            username, password, new_password,
            request_sent: false,
            result: ResultSlot::new(result_tx),
        }
    }
}

impl AuthMethod for AuthPassword {
    fn recv_success(&mut self) -> Result<()> {
        self.result.resolve(Ok(AuthResult::Success));
        Ok(())
    }

    fn recv_failure(&mut self, failure: AuthFailure) -> Result<()> {
        self.result.resolve(Ok(AuthResult::Failure(failure)));
        Ok(())
    }

    fn recv_packet(&mut self, msg_id: u8, payload: &mut PacketDecode) -> Result<()> {
        if msg_id != msg::USERAUTH_PASSWD_CHANGEREQ {
            return Err(Error::PacketNotImplemented(msg_id))
        }
        let prompt = AuthPasswordPrompt {
            prompt: payload.get_string()?,
            prompt_lang: payload.get_string()?,
        };
        log::debug!("received SSH_MSG_USERAUTH_PASSWD_CHANGEREQ");
        self.result.resolve(Ok(AuthResult::ChangePassword(prompt)));
        Ok(())
    }

    fn send_packet(&mut self, _session_id: &[u8]) -> Result<Option<Bytes>> {
        if self.request_sent {
            return Ok(None)
        }
        let mut payload = request_header(&self.username, "password");
        payload.put_bool(self.new_password.is_some());
        payload.put_str(&self.password);
        if let Some(new_password) = self.new_password.as_ref() {
            payload.put_str(new_password);
        }
        log::debug!("sending SSH_MSG_USERAUTH_REQUEST for method 'password'");
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
