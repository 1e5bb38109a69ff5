use bytes::Bytes;
use std::task::Poll;
use x25519_dalek::{EphemeralSecret, PublicKey};
use crate::codec::{PacketDecode, PacketEncode};
use crate::codes::msg;
use crate::error::{Error, Result};
use crate::session::Role;
use super::{KexAlgo, KexInput, KexOutput, KexParams, Kex};

/// "curve25519-sha256" key exchange from RFC 8731.
pub static CURVE25519_SHA256: KexAlgo = KexAlgo {
    name: "curve25519-sha256",
    make_kex: |params| Ok(Box::new(init_kex(params))),
};

/// "curve25519-sha256@libssh.org" key exchange, the same as [`CURVE25519_SHA256`] under the name
/// used before RFC 8731.
pub static CURVE25519_SHA256_LIBSSH: KexAlgo = KexAlgo {
    name: "curve25519-sha256@libssh.org",
    make_kex: |params| Ok(Box::new(init_kex(params))),
};

struct Curve25519Kex {
    role: Role,
    our_eph_privkey: Option<EphemeralSecret>,
    our_eph_pubkey: PublicKey,
    ecdh_init_sent: bool,
    ecdh_init: Option<PublicKey>,
    ecdh_reply: Option<EcdhReply>,
    ecdh_reply_payload: Option<Bytes>,
}

struct EcdhReply {
    server_pubkey: Bytes,
    server_eph_pubkey: PublicKey,
    server_exchange_hash_sign: Bytes,
}

impl Kex for Curve25519Kex {
    fn recv_packet(&mut self, msg_id: u8, payload: &mut PacketDecode) -> Result<()> {
        match (self.role, msg_id) {
            (Role::Client, msg::KEX_ECDH_REPLY) => recv_ecdh_reply(self, payload),
            (Role::Server, msg::KEX_ECDH_INIT) => recv_ecdh_init(self, payload),
            _ => Err(Error::PacketNotImplemented(msg_id)),
        }
    }

    fn send_packet(&mut self) -> Result<Option<Bytes>> {
        match self.role {
            Role::Client if !self.ecdh_init_sent => {
                self.ecdh_init_sent = true;
                Ok(Some(send_ecdh_init(self)))
            },
            Role::Server => Ok(self.ecdh_reply_payload.take()),
            _ => Ok(None),
        }
    }

    fn poll(&mut self, input: KexInput) -> Poll<Result<KexOutput>> {
        if self.our_eph_privkey.is_none() {
            return Poll::Pending
        }
        match self.role {
            Role::Client if self.ecdh_reply.is_some() => Poll::Ready(exchange_client(self, input)),
            Role::Server if self.ecdh_init.is_some() => Poll::Ready(exchange_server(self, input)),
            _ => Poll::Pending,
        }
    }

    fn compute_hash(&self, data: &[u8]) -> Vec<u8> {
        super::compute_hash_sha256(data)
    }
}

fn init_kex(params: KexParams) -> Curve25519Kex {
    let our_eph_privkey = EphemeralSecret::random_from_rng(params.rng);
    let our_eph_pubkey = PublicKey::from(&our_eph_privkey);
    log::debug!("initialized curve25519 kex as {:?}", params.role);
    Curve25519Kex {
        role: params.role,
        our_eph_privkey: Some(our_eph_privkey),
        our_eph_pubkey,
        ecdh_init_sent: false,
        ecdh_init: None,
        ecdh_reply: None,
        ecdh_reply_payload: None,
    }
}

fn send_ecdh_init(kex: &Curve25519Kex) -> Bytes {
    // RFC 5656, section 4
    let mut payload = PacketEncode::with_msg(msg::KEX_ECDH_INIT);
    payload.put_bytes(kex.our_eph_pubkey.as_bytes());
    log::debug!("sending SSH_MSG_KEX_ECDH_INIT");
    payload.finish()
}

fn decode_eph_pubkey(payload: &mut PacketDecode) -> Result<PublicKey> {
    // RFC 8731, section 3
    let bytes = payload.get_bytes()?;
    let bytes = <[u8; 32]>::try_from(bytes.as_ref())
        .map_err(|_| Error::Kex("curve25519 ephemeral public key has invalid length"))?;
    Ok(PublicKey::from(bytes))
}

fn recv_ecdh_init(kex: &mut Curve25519Kex, payload: &mut PacketDecode) -> Result<()> {
    if kex.ecdh_init.is_some() {
        return Err(Error::Protocol("received duplicate SSH_MSG_KEX_ECDH_INIT"))
    }
    kex.ecdh_init = Some(decode_eph_pubkey(payload)?);
    log::debug!("received SSH_MSG_KEX_ECDH_INIT");
    Ok(())
}

fn recv_ecdh_reply(kex: &mut Curve25519Kex, payload: &mut PacketDecode) -> Result<()> {
    if kex.ecdh_reply.is_some() {
        return Err(Error::Protocol("received duplicate SSH_MSG_KEX_ECDH_REPLY"))
    }

    // RFC 5656, section 4 and RFC 8731, section 3.1
    let server_pubkey = payload.get_bytes()?;
    let server_eph_pubkey = decode_eph_pubkey(payload)?;
    let server_exchange_hash_sign = payload.get_bytes()?;

    kex.ecdh_reply = Some(EcdhReply { server_pubkey, server_eph_pubkey, server_exchange_hash_sign });
    log::debug!("received SSH_MSG_KEX_ECDH_REPLY");
    Ok(())
}

fn agree(kex: &mut Curve25519Kex, peer_eph_pubkey: &PublicKey) -> Result<Vec<u8>> {
    let our_eph_privkey = kex.our_eph_privkey.take()
        .ok_or(Error::Protocol("curve25519 key was already used"))?;
    let shared_secret = our_eph_privkey.diffie_hellman(peer_eph_pubkey);
    // RFC 8731, section 3: reject the all-zero shared secret
    if !shared_secret.was_contributory() {
        return Err(Error::Kex("curve25519 shared secret is not contributory"))
    }
    Ok(shared_secret.as_bytes().to_vec())
}

fn exchange_hash(
    input: &KexInput,
    server_pubkey: &[u8],
    client_eph_pubkey: &PublicKey,
    server_eph_pubkey: &PublicKey,
    shared_secret_be: &[u8],
) -> Vec<u8> {
    let mut exchange_data = PacketEncode::new();
    exchange_data.put_bytes(input.client_ident);
    exchange_data.put_bytes(input.server_ident);
    exchange_data.put_bytes(input.client_kex_init);
    exchange_data.put_bytes(input.server_kex_init);
    exchange_data.put_bytes(server_pubkey);
    exchange_data.put_bytes(client_eph_pubkey.as_bytes());
    exchange_data.put_bytes(server_eph_pubkey.as_bytes());
    exchange_data.put_mpint_uint_be(shared_secret_be);
    super::compute_hash_sha256(&exchange_data.finish())
}

fn exchange_client(kex: &mut Curve25519Kex, input: KexInput) -> Result<KexOutput> {
    let EcdhReply { server_pubkey, server_eph_pubkey, server_exchange_hash_sign } =
        kex.ecdh_reply.take().ok_or(Error::Protocol("kex reply is missing"))?;

    let shared_secret_be = agree(kex, &server_eph_pubkey)?;
    let exchange_hash = exchange_hash(&input,
        &server_pubkey, &kex.our_eph_pubkey, &server_eph_pubkey, &shared_secret_be);

    Ok(KexOutput { shared_secret_be, exchange_hash, server_pubkey, server_exchange_hash_sign })
}

fn exchange_server(kex: &mut Curve25519Kex, input: KexInput) -> Result<KexOutput> {
    let client_eph_pubkey = kex.ecdh_init.take().ok_or(Error::Protocol("kex init is missing"))?;
    let host_key = super::server_host_key(&input)?;
    let server_pubkey = host_key.privkey.pubkey().encode();

    let shared_secret_be = agree(kex, &client_eph_pubkey)?;
    let exchange_hash = exchange_hash(&input,
        &server_pubkey, &client_eph_pubkey, &kex.our_eph_pubkey, &shared_secret_be);
    let server_exchange_hash_sign = host_key.privkey.sign(host_key.algo, &exchange_hash)?;

    let mut payload = PacketEncode::with_msg(msg::KEX_ECDH_REPLY);
    payload.put_bytes(&server_pubkey);
    payload.put_bytes(kex.our_eph_pubkey.as_bytes());
    payload.put_bytes(&server_exchange_hash_sign);
    kex.ecdh_reply_payload = Some(payload.finish());
    log::debug!("queued SSH_MSG_KEX_ECDH_REPLY");

    Ok(KexOutput { shared_secret_be, exchange_hash, server_pubkey, server_exchange_hash_sign })
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng as _;
    use crate::kex::tests::check_agreement;
    use super::*;

    #[test]
    fn test_curve25519() {
        check_agreement(&CURVE25519_SHA256, Default::default());
        check_agreement(&CURVE25519_SHA256_LIBSSH, Default::default());
    }

    #[test]
    fn test_reject_low_order_point() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(20);
        let params = KexParams { role: Role::Server, rng: &mut rng, gex_bits: Default::default() };
        let mut server = (CURVE25519_SHA256.make_kex)(params).unwrap();

        let mut payload = PacketEncode::new();
        payload.put_bytes(&[0; 32]);
        server.recv_packet(msg::KEX_ECDH_INIT, &mut PacketDecode::new(payload.finish())).unwrap();

        let host_privkey = crate::kex::tests::host_privkey();
        let input = KexInput {
            client_ident: b"SSH-2.0-client",
            server_ident: b"SSH-2.0-server",
            client_kex_init: b"",
            server_kex_init: b"",
            host_key: Some(crate::kex::HostKey { privkey: &host_privkey, algo: &crate::pubkey::SSH_ED25519 }),
        };
        assert!(matches!(server.poll(input), Poll::Ready(Err(Error::Kex(_)))));
    }

    #[test]
    fn test_reject_short_pubkey() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(21);
        let params = KexParams { role: Role::Server, rng: &mut rng, gex_bits: Default::default() };
        let mut server = (CURVE25519_SHA256.make_kex)(params).unwrap();
        let mut payload = PacketEncode::new();
        payload.put_bytes(&[1; 31]);
        let res = server.recv_packet(msg::KEX_ECDH_INIT, &mut PacketDecode::new(payload.finish()));
        assert!(matches!(res, Err(Error::Kex(_))));
    }
}
