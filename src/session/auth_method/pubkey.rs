use bytes::Bytes;
use crate::codec::{PacketDecode, PacketEncode};
use crate::codes::msg;
use crate::error::{Error, Result};
use crate::promise::Resolver;
use crate::pubkey::{Privkey, PubkeyAlgo};
use super::super::auth::{AuthFailure, AuthResult};
use super::{AuthMethod, ResultSlot, request_header};

/// The "publickey" method with a signature (RFC 4252, section 7).
pub struct AuthPubkey {
    username: String,
    privkey: Privkey,
    pubkey_algo: &'static PubkeyAlgo,
    request_sent: bool,
    result: ResultSlot,
}

impl AuthPubkey {
    pub fn new(
        username: String,
        privkey: Privkey,
        pubkey_algo: &'static PubkeyAlgo,
        result_tx: Resolver<AuthResult>,
    ) -> AuthPubkey {
        AuthPubkey {
            username, privkey, pubkey_algo,
            request_sent: false,
            result: ResultSlot::new(result_tx),
        }
    }
}

/// Data that the client signs to prove that it owns the private key.
pub(crate) fn signed_data(
    session_id: &[u8],
    username: &str,
    service: &str,
    algo_name: &str,
    pubkey_blob: &[u8],
) -> Bytes {
    let mut signed = PacketEncode::new();
    signed.put_bytes(session_id);
    signed.put_u8(msg::USERAUTH_REQUEST);
    signed.put_str(username);
    signed.put_str(service);
    signed.put_str("publickey");
    signed.put_bool(true);
    signed.put_str(algo_name);
    signed.put_bytes(pubkey_blob);
    signed.finish()
}

impl AuthMethod for AuthPubkey {
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

    fn send_packet(&mut self, session_id: &[u8]) -> Result<Option<Bytes>> {
        if self.request_sent {
            return Ok(None)
        }

        let pubkey_blob = self.privkey.pubkey().encode();
        let signed = signed_data(session_id, &self.username, "ssh-connection",
            self.pubkey_algo.name, &pubkey_blob);
        let signature = match self.privkey.sign(self.pubkey_algo, &signed) {
            Ok(signature) => signature,
            Err(err) => {
                // the key does not support the algorithm; this fails only this method, the
                // session stays alive
                self.request_sent = true;
                self.result.resolve(Err(err));
                return Ok(None)
            },
        };

        let mut payload = request_header(&self.username, "publickey");
        payload.put_bool(true);
        payload.put_str(self.pubkey_algo.name);
        payload.put_bytes(&pubkey_blob);
        payload.put_bytes(&signature);
        log::debug!("sending SSH_MSG_USERAUTH_REQUEST for method 'publickey' with {:?}",
            self.pubkey_algo.name);
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
