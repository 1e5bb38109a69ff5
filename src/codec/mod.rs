pub use self::packet_encode::PacketEncode;
pub use self::packet_decode::PacketDecode;
pub(crate) use self::recv_pipe::{RecvPipe, RecvPacket};
pub(crate) use self::send_pipe::SendPipe;

/// Both directions of the binary packet protocol.
pub(crate) struct Codec {
    pub recv_pipe: RecvPipe,
    pub send_pipe: SendPipe,
}

mod packet_encode;
mod packet_decode;
mod recv_pipe;
mod send_pipe;

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use rand::{Rng as _, SeedableRng as _};
    use crate::{cipher, compress, mac};
    use crate::cipher::{CipherAlgoVariant, PacketDecrypt, PacketEncrypt};
    use super::*;

    fn pipes(
        cipher_algo: &'static cipher::CipherAlgo,
        mac_algo: &'static mac::MacAlgo,
        compress_algo: &'static compress::CompressAlgo,
    ) -> (SendPipe, RecvPipe) {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(7);
        let key = vec![0x42; cipher_algo.key_len];
        let iv = vec![0x17; cipher_algo.iv_len];
        let mac_key = vec![0x99; mac_algo.key_len];

        let (encrypt, decrypt, tag_len) = match &cipher_algo.variant {
            CipherAlgoVariant::Standard(algo) => (
                PacketEncrypt::EncryptAndMac(
                    (algo.make_encrypt)(&key, &iv).unwrap(), (mac_algo.make_mac)(&mac_key).unwrap()),
                PacketDecrypt::EncryptAndMac(
                    (algo.make_decrypt)(&key, &iv).unwrap(), (mac_algo.make_mac)(&mac_key).unwrap()),
                mac_algo.tag_len,
            ),
            CipherAlgoVariant::Aead(algo) => (
                PacketEncrypt::Aead((algo.make_encrypt)(&key, &iv).unwrap()),
                PacketDecrypt::Aead((algo.make_decrypt)(&key, &iv).unwrap()),
                algo.tag_len,
            ),
        };

        let mut send_pipe = SendPipe::new(&mut rng).unwrap();
        send_pipe.set_encrypt(encrypt, cipher_algo.block_len, tag_len);
        send_pipe.set_compress(compress_algo, false);
        let mut recv_pipe = RecvPipe::new(256 * 1024);
        recv_pipe.set_decrypt(decrypt, cipher_algo.block_len, tag_len);
        recv_pipe.set_decompress(compress_algo, false);
        (send_pipe, recv_pipe)
    }

    #[test]
    fn test_encode_decode_identity() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(42);
        let combinations: &[(&cipher::CipherAlgo, &mac::MacAlgo, &compress::CompressAlgo)] = &[
            (&cipher::NONE, &mac::NONE, &compress::NONE),
            (&cipher::AES128_CTR, &mac::HMAC_SHA2_256, &compress::NONE),
            (&cipher::AES256_CTR, &mac::HMAC_SHA2_512, &compress::ZLIB),
            (&cipher::AES192_CBC, &mac::HMAC_SHA1, &compress::NONE),
            (&cipher::AES128_GCM, &mac::NONE, &compress::ZLIB),
            (&cipher::AES256_GCM, &mac::NONE, &compress::NONE),
        ];

        for &(cipher_algo, mac_algo, compress_algo) in combinations {
            let (mut send_pipe, mut recv_pipe) = pipes(cipher_algo, mac_algo, compress_algo);
            for seq in 0..50u32 {
                let payload_len = rng.gen_range(0..3000);
                let mut payload = vec![0; payload_len];
                rng.fill(&mut payload[..]);
                assert_eq!(send_pipe.feed_packet(&payload).unwrap(), seq);

                let wire = send_pipe.peek_bytes().to_vec();
                send_pipe.consume_bytes(wire.len());

                // deliver the bytes in two arbitrary pieces
                let split = rng.gen_range(0..=wire.len());
                recv_pipe.feed_buf().extend_from_slice(&wire[..split]);
                if split < wire.len() {
                    assert!(recv_pipe.consume_packet().unwrap().is_none());
                    recv_pipe.feed_buf().extend_from_slice(&wire[split..]);
                }

                let packet = recv_pipe.consume_packet().unwrap().unwrap();
                assert_eq!(packet.payload, Bytes::from(payload), "{}", cipher_algo.name);
                assert_eq!(packet.packet_seq, seq);
            }
        }
    }

    #[test]
    fn test_corrupted_packet_is_rejected() {
        let (mut send_pipe, mut recv_pipe) = pipes(&cipher::AES128_CTR, &mac::HMAC_SHA2_256, &compress::NONE);
        send_pipe.feed_packet(b"\x5eimportant data").unwrap();
        let mut wire = send_pipe.peek_bytes().to_vec();
        let last = wire.len() - 40;
        wire[last] ^= 1;
        recv_pipe.feed_buf().extend_from_slice(&wire);
        assert!(matches!(recv_pipe.consume_packet(), Err(crate::Error::Mac)));
    }
}
