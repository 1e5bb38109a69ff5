use aes::cipher::{BlockCipher, BlockEncrypt, BlockSizeUser, KeyIvInit, StreamCipher as _};
use aes::cipher::consts::U16;
use crate::{Error, Result};
use super::{CipherAlgo, CipherAlgoVariant, StandardCipherAlgo, Encrypt, Decrypt};

/// "aes128-ctr" cipher from RFC 4344.
pub static AES128_CTR: CipherAlgo = CipherAlgo {
    name: "aes128-ctr",
    block_len: 16,
    key_len: 16,
    iv_len: 16,
    variant: CipherAlgoVariant::Standard(StandardCipherAlgo {
        make_encrypt: |key, iv| Ok(Box::new(new_ctr::<aes::Aes128>(key, iv)?)),
        make_decrypt: |key, iv| Ok(Box::new(new_ctr::<aes::Aes128>(key, iv)?)),
    }),
};

/// "aes192-ctr" cipher from RFC 4344.
pub static AES192_CTR: CipherAlgo = CipherAlgo {
    name: "aes192-ctr",
    block_len: 16,
    key_len: 24,
    iv_len: 16,
    variant: CipherAlgoVariant::Standard(StandardCipherAlgo {
        make_encrypt: |key, iv| Ok(Box::new(new_ctr::<aes::Aes192>(key, iv)?)),
        make_decrypt: |key, iv| Ok(Box::new(new_ctr::<aes::Aes192>(key, iv)?)),
    }),
};

/// "aes256-ctr" cipher from RFC 4344.
pub static AES256_CTR: CipherAlgo = CipherAlgo {
    name: "aes256-ctr",
    block_len: 16,
    key_len: 32,
    iv_len: 16,
    variant: CipherAlgoVariant::Standard(StandardCipherAlgo {
        make_encrypt: |key, iv| Ok(Box::new(new_ctr::<aes::Aes256>(key, iv)?)),
        make_decrypt: |key, iv| Ok(Box::new(new_ctr::<aes::Aes256>(key, iv)?)),
    }),
};

struct CtrCipher<C>
    where C: BlockEncrypt + BlockCipher + BlockSizeUser<BlockSize = U16>
{
    ctr: ctr::Ctr128BE<C>,
}

fn new_ctr<C>(key: &[u8], iv: &[u8]) -> Result<CtrCipher<C>>
    where C: BlockEncrypt + BlockCipher + BlockSizeUser<BlockSize = U16>,
          ctr::Ctr128BE<C>: KeyIvInit,
{
    let ctr = ctr::Ctr128BE::<C>::new_from_slices(key, iv)
        .map_err(|_| Error::Crypto("invalid key or iv length for ctr cipher"))?;
    Ok(CtrCipher { ctr })
}

impl<C> Encrypt for CtrCipher<C>
    where C: BlockEncrypt + BlockCipher + BlockSizeUser<BlockSize = U16>
{
    fn encrypt(&mut self, data: &mut [u8]) {
        self.ctr.apply_keystream(data)
    }
}

impl<C> Decrypt for CtrCipher<C>
    where C: BlockEncrypt + BlockCipher + BlockSizeUser<BlockSize = U16>
{
    fn decrypt(&mut self, data: &mut [u8]) {
        self.ctr.apply_keystream(data)
    }
}
