use bytes::Bytes;
use derivative::Derivative;
use num_bigint_dig::BigUint;
use std::task::Poll;
use crate::codec::{PacketDecode, PacketEncode};
use crate::codes::msg;
use crate::error::{Error, Result};
use crate::session::Role;
use super::{KexAlgo, KexInput, KexOutput, KexParams, Kex, HashFn};
use super::group::{self, EphKeypair, Group};

/// "diffie-hellman-group-exchange-sha256" key exchange from RFC 4419.
pub static DIFFIE_HELLMAN_GROUP_EXCHANGE_SHA256: KexAlgo = KexAlgo {
    name: "diffie-hellman-group-exchange-sha256",
    make_kex: |params| Ok(Box::new(init_kex(super::compute_hash_sha256, params))),
};

/// "diffie-hellman-group-exchange-sha1" key exchange from RFC 4419.
pub static DIFFIE_HELLMAN_GROUP_EXCHANGE_SHA1: KexAlgo = KexAlgo {
    name: "diffie-hellman-group-exchange-sha1",
    make_kex: |params| Ok(Box::new(init_kex(super::compute_hash_sha1, params))),
};

/// Bounds on the size of the group (in bits) that the client requests in the group exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GexBits {
    /// Minimal acceptable size of the prime.
    pub min: u32,
    /// Preferred size of the prime.
    pub preferred: u32,
    /// Maximal acceptable size of the prime.
    pub max: u32,
}

impl Default for GexBits {
    fn default() -> Self {
        GexBits { min: 2048, preferred: 3072, max: 8192 }
    }
}

/// Bounds assumed for the legacy `SSH_MSG_KEX_DH_GEX_REQUEST_OLD`.
const OLD_REQUEST_MIN: u32 = 1024;
const OLD_REQUEST_MAX: u32 = 8192;

/// Sizes requested by the client, as they enter the exchange hash.
#[derive(Debug, Clone, Copy)]
enum Request {
    New(GexBits),
    Old(u32),
}

#[derive(Derivative)]
#[derivative(Debug)]
struct GroupExchangeKex {
    role: Role,
    #[derivative(Debug = "ignore")]
    compute_hash: HashFn,
    #[derivative(Debug = "ignore")]
    our_eph_privkey: Option<BigUint>,
    request: Option<Request>,
    group: Option<Group>,
    #[derivative(Debug = "ignore")]
    our_eph: Option<EphKeypair>,
    peer_eph_pubkey: Option<BigUint>,
    server_pubkey: Option<Bytes>,
    server_exchange_hash_sign: Option<Bytes>,
    #[derivative(Debug = "ignore")]
    send_queue: Vec<Bytes>,
    done: bool,
}

fn init_kex(compute_hash: HashFn, params: KexParams) -> GroupExchangeKex {
    let mut kex = GroupExchangeKex {
        role: params.role,
        compute_hash,
        our_eph_privkey: Some(group::gen_exponent(params.rng)),
        request: None,
        group: None,
        our_eph: None,
        peer_eph_pubkey: None,
        server_pubkey: None,
        server_exchange_hash_sign: None,
        send_queue: Vec::new(),
        done: false,
    };

    if params.role == Role::Client {
        // RFC 4419, section 3
        let bits = params.gex_bits;
        let mut payload = PacketEncode::with_msg(msg::KEX_DH_GEX_REQUEST);
        payload.put_u32(bits.min);
        payload.put_u32(bits.preferred);
        payload.put_u32(bits.max);
        kex.request = Some(Request::New(bits));
        kex.send_queue.push(payload.finish());
        log::debug!("sending SSH_MSG_KEX_DH_GEX_REQUEST {}/{}/{}", bits.min, bits.preferred, bits.max);
    }
    kex
}

impl Kex for GroupExchangeKex {
    fn recv_packet(&mut self, msg_id: u8, payload: &mut PacketDecode) -> Result<()> {
        match (self.role, msg_id) {
            (Role::Client, msg::KEX_DH_GEX_GROUP) => recv_group(self, payload),
            (Role::Client, msg::KEX_DH_GEX_REPLY) => recv_reply(self, payload),
            (Role::Server, msg::KEX_DH_GEX_REQUEST) => recv_request(self, payload, false),
            (Role::Server, msg::KEX_DH_GEX_REQUEST_OLD) => recv_request(self, payload, true),
            (Role::Server, msg::KEX_DH_GEX_INIT) => recv_init(self, payload),
            _ => Err(Error::PacketNotImplemented(msg_id)),
        }
    }

    fn send_packet(&mut self) -> Result<Option<Bytes>> {
        if self.send_queue.is_empty() {
            return Ok(None)
        }
        Ok(Some(self.send_queue.remove(0)))
    }

    fn poll(&mut self, input: KexInput) -> Poll<Result<KexOutput>> {
        if self.done {
            return Poll::Pending
        }
        let ready = match self.role {
            Role::Client => self.server_exchange_hash_sign.is_some(),
            Role::Server => self.peer_eph_pubkey.is_some(),
        };
        if ready {
            self.done = true;
            return Poll::Ready(exchange(self, input))
        }
        Poll::Pending
    }

    fn compute_hash(&self, data: &[u8]) -> Vec<u8> {
        (self.compute_hash)(data)
    }
}

/// Picks the smallest built-in group with at least `preferred` bits, falling back to the largest
/// group that fits into the bounds.
fn choose_group(bits: GexBits) -> Option<Group> {
    let fitting = Group::builtin().into_iter()
        .filter(|group| group.bits() >= bits.min as usize && group.bits() <= bits.max as usize)
        .collect::<Vec<_>>();
    let preferred = fitting.iter().position(|group| group.bits() >= bits.preferred as usize);
    match preferred {
        Some(idx) => fitting.into_iter().nth(idx),
        None => fitting.into_iter().last(),
    }
}

fn recv_request(kex: &mut GroupExchangeKex, payload: &mut PacketDecode, old: bool) -> Result<()> {
    if kex.request.is_some() {
        return Err(Error::Protocol("received duplicate group exchange request"))
    }

    let (request, bits) = if old {
        let n = payload.get_u32()?;
        (Request::Old(n), GexBits { min: OLD_REQUEST_MIN, preferred: n, max: OLD_REQUEST_MAX })
    } else {
        let min = payload.get_u32()?;
        let preferred = payload.get_u32()?;
        let max = payload.get_u32()?;
        let bits = GexBits { min, preferred, max };
        (Request::New(bits), bits)
    };
    log::debug!("received group exchange request {}/{}/{}", bits.min, bits.preferred, bits.max);

    if bits.max < bits.min || bits.preferred < bits.min || bits.max < bits.preferred {
        return Err(Error::Kex("client requested inconsistent group size bounds"))
    }
    let group = choose_group(bits).ok_or(Error::Kex("no group of the requested size is available"))?;

    // RFC 4419, section 3
    let mut payload = PacketEncode::with_msg(msg::KEX_DH_GEX_GROUP);
    payload.put_biguint(&group.p);
    payload.put_biguint(&group.g);
    kex.send_queue.push(payload.finish());
    log::debug!("sending SSH_MSG_KEX_DH_GEX_GROUP with {}-bit prime", group.bits());

    let privkey = kex.our_eph_privkey.take().ok_or(Error::Protocol("group was already chosen"))?;
    kex.our_eph = Some(group.keypair(privkey));
    kex.request = Some(request);
    kex.group = Some(group);
    Ok(())
}

fn recv_group(kex: &mut GroupExchangeKex, payload: &mut PacketDecode) -> Result<()> {
    if kex.group.is_some() {
        return Err(Error::Protocol("received duplicate SSH_MSG_KEX_DH_GEX_GROUP"))
    }
    let Some(Request::New(bits)) = kex.request else {
        return Err(Error::Protocol("received SSH_MSG_KEX_DH_GEX_GROUP without a request"))
    };

    let p = payload.get_biguint()?;
    let g = payload.get_biguint()?;
    let group = Group::new(g, p);
    log::debug!("received SSH_MSG_KEX_DH_GEX_GROUP with {}-bit prime", group.bits());

    if group.bits() < bits.min as usize || group.bits() > bits.max as usize {
        return Err(Error::Kex("server sent a group outside of the requested bounds"))
    }
    if !group.is_valid_element(&group.g) {
        return Err(Error::Kex("server sent a group with invalid generator"))
    }

    let privkey = kex.our_eph_privkey.take().ok_or(Error::Protocol("group was already received"))?;
    let our_eph = group.keypair(privkey);

    let mut payload = PacketEncode::with_msg(msg::KEX_DH_GEX_INIT);
    payload.put_biguint(&our_eph.pubkey);
    kex.send_queue.push(payload.finish());
    log::debug!("sending SSH_MSG_KEX_DH_GEX_INIT");

    kex.our_eph = Some(our_eph);
    kex.group = Some(group);
    Ok(())
}

fn recv_init(kex: &mut GroupExchangeKex, payload: &mut PacketDecode) -> Result<()> {
    let Some(group) = kex.group.as_ref() else {
        return Err(Error::Protocol("received SSH_MSG_KEX_DH_GEX_INIT before a group was chosen"))
    };
    if kex.peer_eph_pubkey.is_some() {
        return Err(Error::Protocol("received duplicate SSH_MSG_KEX_DH_GEX_INIT"))
    }

    let client_eph_pubkey = payload.get_biguint()?;
    if !group.is_valid_element(&client_eph_pubkey) {
        return Err(Error::Kex("client sent invalid Diffie-Hellman ephemeral public key"))
    }
    kex.peer_eph_pubkey = Some(client_eph_pubkey);
    log::debug!("received SSH_MSG_KEX_DH_GEX_INIT");
    Ok(())
}

fn recv_reply(kex: &mut GroupExchangeKex, payload: &mut PacketDecode) -> Result<()> {
    let Some(group) = kex.group.as_ref() else {
        return Err(Error::Protocol("received SSH_MSG_KEX_DH_GEX_REPLY before the group"))
    };
    if kex.server_exchange_hash_sign.is_some() {
        return Err(Error::Protocol("received duplicate SSH_MSG_KEX_DH_GEX_REPLY"))
    }

    let server_pubkey = payload.get_bytes()?;
    let server_eph_pubkey = payload.get_biguint()?;
    let server_exchange_hash_sign = payload.get_bytes()?;
    if !group.is_valid_element(&server_eph_pubkey) {
        return Err(Error::Kex("server sent invalid Diffie-Hellman ephemeral public key"))
    }

    kex.server_pubkey = Some(server_pubkey);
    kex.peer_eph_pubkey = Some(server_eph_pubkey);
    kex.server_exchange_hash_sign = Some(server_exchange_hash_sign);
    log::debug!("received SSH_MSG_KEX_DH_GEX_REPLY");
    Ok(())
}

fn exchange(kex: &mut GroupExchangeKex, input: KexInput) -> Result<KexOutput> {
    let (Some(request), Some(group), Some(our_eph), Some(peer_eph_pubkey)) =
        (kex.request, kex.group.as_ref(), kex.our_eph.as_ref(), kex.peer_eph_pubkey.as_ref())
        else { return Err(Error::Protocol("group exchange is not complete")) };

    let (server_pubkey, host_key) = match kex.role {
        Role::Client => {
            let server_pubkey = kex.server_pubkey.take()
                .ok_or(Error::Protocol("group exchange reply is missing"))?;
            (server_pubkey, None)
        },
        Role::Server => {
            let host_key = super::server_host_key(&input)?;
            (host_key.privkey.pubkey().encode(), Some(host_key))
        },
    };
    let (client_eph_pubkey, server_eph_pubkey) = match kex.role {
        Role::Client => (&our_eph.pubkey, peer_eph_pubkey),
        Role::Server => (peer_eph_pubkey, &our_eph.pubkey),
    };
    let shared_secret = group.agree(our_eph, peer_eph_pubkey);

    // RFC 4419, section 3
    let mut exchange_data = PacketEncode::new();
    exchange_data.put_bytes(input.client_ident);
    exchange_data.put_bytes(input.server_ident);
    exchange_data.put_bytes(input.client_kex_init);
    exchange_data.put_bytes(input.server_kex_init);
    exchange_data.put_bytes(&server_pubkey);
    match request {
        Request::New(bits) => {
            exchange_data.put_u32(bits.min);
            exchange_data.put_u32(bits.preferred);
            exchange_data.put_u32(bits.max);
        },
        Request::Old(n) => exchange_data.put_u32(n),
    }
    exchange_data.put_biguint(&group.p);
    exchange_data.put_biguint(&group.g);
    exchange_data.put_biguint(client_eph_pubkey);
    exchange_data.put_biguint(server_eph_pubkey);
    exchange_data.put_biguint(&shared_secret);
    let exchange_hash = (kex.compute_hash)(&exchange_data.finish());

    let server_exchange_hash_sign = match host_key {
        Some(host_key) => {
            let signature = host_key.privkey.sign(host_key.algo, &exchange_hash)?;
            let mut payload = PacketEncode::with_msg(msg::KEX_DH_GEX_REPLY);
            payload.put_bytes(&server_pubkey);
            payload.put_biguint(&our_eph.pubkey);
            payload.put_bytes(&signature);
            kex.send_queue.push(payload.finish());
            log::debug!("queued SSH_MSG_KEX_DH_GEX_REPLY");
            signature
        },
        None => kex.server_exchange_hash_sign.take()
            .ok_or(Error::Protocol("group exchange reply is missing"))?,
    };

    Ok(KexOutput {
        shared_secret_be: shared_secret.to_bytes_be(),
        exchange_hash, server_pubkey, server_exchange_hash_sign,
    })
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng as _;
    use crate::kex::tests::check_agreement;
    use super::*;

    const SMALL: GexBits = GexBits { min: 2048, preferred: 2048, max: 4096 };

    #[test]
    fn test_gex_sha256() {
        check_agreement(&DIFFIE_HELLMAN_GROUP_EXCHANGE_SHA256, SMALL);
    }

    #[test]
    fn test_gex_sha1() {
        check_agreement(&DIFFIE_HELLMAN_GROUP_EXCHANGE_SHA1, SMALL);
    }

    #[test]
    fn test_choose_group() {
        let bits = |min, preferred, max| choose_group(GexBits { min, preferred, max }).map(|g| g.bits());
        assert_eq!(bits(2048, 3072, 8192), Some(4096));
        assert_eq!(bits(1024, 2048, 8192), Some(2048));
        assert_eq!(bits(2048, 8192, 8192), Some(8192));
        assert_eq!(bits(1024, 6144, 6144), Some(4096));
        assert_eq!(bits(1024, 1024, 1536), None);
    }

    fn server() -> Box<dyn Kex + Send> {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(10);
        let params = KexParams { role: Role::Server, rng: &mut rng, gex_bits: GexBits::default() };
        (DIFFIE_HELLMAN_GROUP_EXCHANGE_SHA256.make_kex)(params).unwrap()
    }

    #[test]
    fn test_server_accepts_old_request() {
        let mut server = server();
        let mut payload = PacketEncode::new();
        payload.put_u32(2048);
        server.recv_packet(msg::KEX_DH_GEX_REQUEST_OLD, &mut PacketDecode::new(payload.finish())).unwrap();

        let group = server.send_packet().unwrap().unwrap();
        let mut group = PacketDecode::new(group);
        assert_eq!(group.get_u8().unwrap(), msg::KEX_DH_GEX_GROUP);
        assert_eq!(group.get_biguint().unwrap().bits(), 2048);
        assert!(server.send_packet().unwrap().is_none());
    }

    #[test]
    fn test_server_rejects_bad_bounds() {
        let mut server = server();
        let mut payload = PacketEncode::new();
        payload.put_u32(4096);
        payload.put_u32(2048);
        payload.put_u32(8192);
        let res = server.recv_packet(msg::KEX_DH_GEX_REQUEST, &mut PacketDecode::new(payload.finish()));
        assert!(matches!(res, Err(Error::Kex(_))));
    }

    #[test]
    fn test_client_rejects_small_group() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(11);
        let params = KexParams { role: Role::Client, rng: &mut rng, gex_bits: GexBits::default() };
        let mut client = (DIFFIE_HELLMAN_GROUP_EXCHANGE_SHA256.make_kex)(params).unwrap();
        assert!(client.send_packet().unwrap().is_some());

        let mut payload = PacketEncode::new();
        payload.put_biguint(&BigUint::from(23u32));
        payload.put_biguint(&BigUint::from(5u32));
        let res = client.recv_packet(msg::KEX_DH_GEX_GROUP, &mut PacketDecode::new(payload.finish()));
        assert!(matches!(res, Err(Error::Kex(_))));
    }
}
