use bytes::Bytes;
use crate::codec::{PacketDecode, PacketEncode};
use crate::codes::msg;
use crate::error::{Error, Result};
use crate::promise::Resolver;
use super::auth::{AuthFailure, AuthResult};

pub mod keyboard_interactive;
pub mod none;
pub mod password;
pub mod pubkey;

/// One run of an authentication method on the client.
pub trait AuthMethod {
    fn recv_success(&mut self) -> Result<()>;
    fn recv_failure(&mut self, failure: AuthFailure) -> Result<()>;
    fn recv_packet(&mut self, msg_id: u8, payload: &mut PacketDecode) -> Result<()>;
    fn send_packet(&mut self, session_id: &[u8]) -> Result<Option<Bytes>>;
    fn is_done(&self) -> bool;
    fn abort(&mut self, err: Error);
}

/// Holds the resolver of the result of an authentication method.
#[derive(Debug)]
struct ResultSlot {
    result_tx: Option<Resolver<AuthResult>>,
}

impl ResultSlot {
    fn new(result_tx: Resolver<AuthResult>) -> ResultSlot {
        ResultSlot { result_tx: Some(result_tx) }
    }

    fn resolve(&mut self, result: Result<AuthResult>) {
        if let Some(result_tx) = self.result_tx.take() {
            result_tx.resolve(result);
        }
    }

    fn is_done(&self) -> bool {
        self.result_tx.is_none()
    }
}

/// Starts an `SSH_MSG_USERAUTH_REQUEST` (RFC 4252, section 5).
fn request_header(username: &str, method_name: &str) -> PacketEncode {
    let mut payload = PacketEncode::new();
    payload.put_u8(msg::USERAUTH_REQUEST);
    payload.put_str(username);
    payload.put_str("ssh-connection");
    payload.put_str(method_name);
    payload
}
