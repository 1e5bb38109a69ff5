use bytes::Bytes;
use derivative::Derivative;
use num_bigint_dig::BigUint;
use std::task::Poll;
use crate::codec::{PacketDecode, PacketEncode};
use crate::codes::msg;
use crate::error::{Error, Result};
use crate::session::Role;
use super::{KexAlgo, KexInput, KexOutput, KexParams, Kex, HashFn};
use super::group::{EphKeypair, Group};

/// "diffie-hellman-group14-sha1" key exchange from RFC 4253.
pub static DIFFIE_HELLMAN_GROUP14_SHA1: KexAlgo = KexAlgo {
    name: "diffie-hellman-group14-sha1",
    make_kex: |params| Ok(Box::new(init_kex(Group::group_14(), super::compute_hash_sha1, params))),
};

/// "diffie-hellman-group14-sha256" key exchange from RFC 8268.
pub static DIFFIE_HELLMAN_GROUP14_SHA256: KexAlgo = KexAlgo {
    name: "diffie-hellman-group14-sha256",
    make_kex: |params| Ok(Box::new(init_kex(Group::group_14(), super::compute_hash_sha256, params))),
};

/// "diffie-hellman-group16-sha512" key exchange from RFC 8268.
pub static DIFFIE_HELLMAN_GROUP16_SHA512: KexAlgo = KexAlgo {
    name: "diffie-hellman-group16-sha512",
    make_kex: |params| Ok(Box::new(init_kex(Group::group_16(), super::compute_hash_sha512, params))),
};

/// "diffie-hellman-group18-sha512" key exchange from RFC 8268.
pub static DIFFIE_HELLMAN_GROUP18_SHA512: KexAlgo = KexAlgo {
    name: "diffie-hellman-group18-sha512",
    make_kex: |params| Ok(Box::new(init_kex(Group::group_18(), super::compute_hash_sha512, params))),
};

#[derive(Derivative)]
#[derivative(Debug)]
struct DiffieHellmanKex {
    role: Role,
    group: Group,
    #[derivative(Debug = "ignore")]
    compute_hash: HashFn,
    #[derivative(Debug = "ignore")]
    our_eph: EphKeypair,
    kexdh_init_sent: bool,
    kexdh_init: Option<BigUint>,
    kexdh_reply: Option<KexdhReply>,
    kexdh_reply_payload: Option<Bytes>,
    done: bool,
}

#[derive(Debug)]
struct KexdhReply {
    server_pubkey: Bytes,
    server_eph_pubkey: BigUint,
    server_exchange_hash_sign: Bytes,
}

fn init_kex(group: Group, compute_hash: HashFn, params: KexParams) -> DiffieHellmanKex {
    let our_eph = group.gen_keypair(params.rng);
    log::debug!("initialized diffie-hellman kex with {}-bit group as {:?}", group.bits(), params.role);
    DiffieHellmanKex {
        role: params.role, group, compute_hash, our_eph,
        kexdh_init_sent: false,
        kexdh_init: None,
        kexdh_reply: None,
        kexdh_reply_payload: None,
        done: false,
    }
}

impl Kex for DiffieHellmanKex {
    fn recv_packet(&mut self, msg_id: u8, payload: &mut PacketDecode) -> Result<()> {
        match (self.role, msg_id) {
            (Role::Client, msg::KEXDH_REPLY) => recv_kexdh_reply(self, payload),
            (Role::Server, msg::KEXDH_INIT) => recv_kexdh_init(self, payload),
            _ => Err(Error::PacketNotImplemented(msg_id)),
        }
    }

    fn send_packet(&mut self) -> Result<Option<Bytes>> {
        match self.role {
            Role::Client if !self.kexdh_init_sent => {
                self.kexdh_init_sent = true;
                Ok(Some(send_kexdh_init(self)))
            },
            Role::Server => Ok(self.kexdh_reply_payload.take()),
            _ => Ok(None),
        }
    }

    fn poll(&mut self, input: KexInput) -> Poll<Result<KexOutput>> {
        if self.done {
            return Poll::Pending
        }
        let ready = match self.role {
            Role::Client => self.kexdh_reply.is_some(),
            Role::Server => self.kexdh_init.is_some(),
        };
        if ready {
            self.done = true;
            return Poll::Ready(match self.role {
                Role::Client => exchange_client(self, input),
                Role::Server => exchange_server(self, input),
            })
        }
        Poll::Pending
    }

    fn compute_hash(&self, data: &[u8]) -> Vec<u8> {
        (self.compute_hash)(data)
    }
}

fn send_kexdh_init(kex: &DiffieHellmanKex) -> Bytes {
    // RFC 4253, section 8
    let mut payload = PacketEncode::with_msg(msg::KEXDH_INIT);
    payload.put_biguint(&kex.our_eph.pubkey);
    log::debug!("sending SSH_MSG_KEXDH_INIT");
    payload.finish()
}

fn recv_kexdh_init(kex: &mut DiffieHellmanKex, payload: &mut PacketDecode) -> Result<()> {
    if kex.kexdh_init.is_some() {
        return Err(Error::Protocol("received duplicate SSH_MSG_KEXDH_INIT"))
    }

    let client_eph_pubkey = payload.get_biguint()?;
    if !kex.group.is_valid_element(&client_eph_pubkey) {
        return Err(Error::Kex("client sent invalid Diffie-Hellman ephemeral public key"))
    }

    kex.kexdh_init = Some(client_eph_pubkey);
    log::debug!("received SSH_MSG_KEXDH_INIT");
    Ok(())
}

fn recv_kexdh_reply(kex: &mut DiffieHellmanKex, payload: &mut PacketDecode) -> Result<()> {
    if kex.kexdh_reply.is_some() {
        return Err(Error::Protocol("received duplicate SSH_MSG_KEXDH_REPLY"))
    }

    // RFC 4253, section 8
    let server_pubkey = payload.get_bytes()?;
    let server_eph_pubkey = payload.get_biguint()?;
    let server_exchange_hash_sign = payload.get_bytes()?;

    // RFC 8268, section 4
    if !kex.group.is_valid_element(&server_eph_pubkey) {
        return Err(Error::Kex("server sent invalid Diffie-Hellman ephemeral public key"))
    }

    kex.kexdh_reply = Some(KexdhReply { server_pubkey, server_eph_pubkey, server_exchange_hash_sign });
    log::debug!("received SSH_MSG_KEXDH_REPLY");
    Ok(())
}

fn exchange_hash(
    kex: &DiffieHellmanKex,
    input: &KexInput,
    server_pubkey: &[u8],
    client_eph_pubkey: &BigUint,
    server_eph_pubkey: &BigUint,
    shared_secret: &BigUint,
) -> Vec<u8> {
    let mut exchange_data = PacketEncode::new();
    exchange_data.put_bytes(input.client_ident);
    exchange_data.put_bytes(input.server_ident);
    exchange_data.put_bytes(input.client_kex_init);
    exchange_data.put_bytes(input.server_kex_init);
    exchange_data.put_bytes(server_pubkey);
    exchange_data.put_biguint(client_eph_pubkey);
    exchange_data.put_biguint(server_eph_pubkey);
    exchange_data.put_biguint(shared_secret);
    (kex.compute_hash)(&exchange_data.finish())
}

fn exchange_client(kex: &mut DiffieHellmanKex, input: KexInput) -> Result<KexOutput> {
    let KexdhReply { server_pubkey, server_eph_pubkey, server_exchange_hash_sign } =
        kex.kexdh_reply.take().ok_or(Error::Protocol("kex reply is missing"))?;

    let shared_secret = kex.group.agree(&kex.our_eph, &server_eph_pubkey);
    let exchange_hash = exchange_hash(kex, &input,
        &server_pubkey, &kex.our_eph.pubkey, &server_eph_pubkey, &shared_secret);

    Ok(KexOutput {
        shared_secret_be: shared_secret.to_bytes_be(),
        exchange_hash, server_pubkey, server_exchange_hash_sign,
    })
}

fn exchange_server(kex: &mut DiffieHellmanKex, input: KexInput) -> Result<KexOutput> {
    let client_eph_pubkey = kex.kexdh_init.take().ok_or(Error::Protocol("kex init is missing"))?;
    let host_key = super::server_host_key(&input)?;
    let server_pubkey = host_key.privkey.pubkey().encode();

    let shared_secret = kex.group.agree(&kex.our_eph, &client_eph_pubkey);
    let exchange_hash = exchange_hash(kex, &input,
        &server_pubkey, &client_eph_pubkey, &kex.our_eph.pubkey, &shared_secret);
    let server_exchange_hash_sign = host_key.privkey.sign(host_key.algo, &exchange_hash)?;

    let mut payload = PacketEncode::with_msg(msg::KEXDH_REPLY);
    payload.put_bytes(&server_pubkey);
    payload.put_biguint(&kex.our_eph.pubkey);
    payload.put_bytes(&server_exchange_hash_sign);
    kex.kexdh_reply_payload = Some(payload.finish());
    log::debug!("queued SSH_MSG_KEXDH_REPLY");

    Ok(KexOutput {
        shared_secret_be: shared_secret.to_bytes_be(),
        exchange_hash, server_pubkey, server_exchange_hash_sign,
    })
}

#[cfg(test)]
mod tests {
    use crate::codec::PacketEncode;
    use crate::kex::tests::check_agreement;
    use rand::SeedableRng as _;
    use super::*;

    #[test]
    fn test_group14_sha256() {
        check_agreement(&DIFFIE_HELLMAN_GROUP14_SHA256, Default::default());
    }

    #[test]
    fn test_group14_sha1() {
        check_agreement(&DIFFIE_HELLMAN_GROUP14_SHA1, Default::default());
    }

    #[test]
    fn test_group16_sha512() {
        check_agreement(&DIFFIE_HELLMAN_GROUP16_SHA512, Default::default());
    }

    #[test]
    fn test_reject_invalid_pubkey() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(5);
        let params = KexParams { role: Role::Server, rng: &mut rng, gex_bits: Default::default() };
        let mut server = (DIFFIE_HELLMAN_GROUP14_SHA256.make_kex)(params).unwrap();

        let mut payload = PacketEncode::new();
        payload.put_biguint(&BigUint::from(1u32));
        let mut payload = PacketDecode::new(payload.finish());
        assert!(matches!(server.recv_packet(msg::KEXDH_INIT, &mut payload), Err(Error::Kex(_))));
    }

    #[test]
    fn test_unexpected_packet() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(6);
        let params = KexParams { role: Role::Client, rng: &mut rng, gex_bits: Default::default() };
        let mut client = (DIFFIE_HELLMAN_GROUP14_SHA256.make_kex)(params).unwrap();
        let mut payload = PacketDecode::new(Bytes::new());
        assert!(matches!(client.recv_packet(msg::KEXDH_INIT, &mut payload),
            Err(Error::PacketNotImplemented(30))));
    }
}
