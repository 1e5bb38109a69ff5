use flate2::{Compression, FlushCompress, FlushDecompress, Status};
use crate::{Error, Result};
use super::{CompressAlgo, Compress, Decompress};

/// "zlib" compression from RFC 4253.
pub static ZLIB: CompressAlgo = CompressAlgo {
    name: "zlib",
    delayed: false,
    make_compress: || Some(Box::new(ZlibCompress::new())),
    make_decompress: |len_max| Some(Box::new(ZlibDecompress::new(len_max))),
};

/// "zlib@openssh.com" compression, which is "zlib" delayed until the user is authenticated.
pub static ZLIB_OPENSSH: CompressAlgo = CompressAlgo {
    name: "zlib@openssh.com",
    delayed: true,
    make_compress: || Some(Box::new(ZlibCompress::new())),
    make_decompress: |len_max| Some(Box::new(ZlibDecompress::new(len_max))),
};

struct ZlibCompress {
    inner: flate2::Compress,
}

impl ZlibCompress {
    fn new() -> Self {
        Self { inner: flate2::Compress::new(Compression::default(), true) }
    }
}

impl Compress for ZlibCompress {
    fn compress(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        // every packet ends with a flush, so that the peer can decompress it without waiting for
        // more data
        let mut output = Vec::with_capacity(payload.len() + 64);
        let in_start = self.inner.total_in();
        loop {
            let consumed = (self.inner.total_in() - in_start) as usize;
            self.inner.compress_vec(&payload[consumed..], &mut output, FlushCompress::Sync)
                .map_err(|_| Error::Compress("zlib compression failed"))?;

            let consumed = (self.inner.total_in() - in_start) as usize;
            if consumed == payload.len() && output.len() < output.capacity() {
                return Ok(output)
            }
            output.reserve(output.capacity().max(64));
        }
    }
}

struct ZlibDecompress {
    inner: flate2::Decompress,
    len_max: usize,
}

impl ZlibDecompress {
    fn new(len_max: usize) -> Self {
        Self { inner: flate2::Decompress::new(true), len_max }
    }
}

impl Decompress for ZlibDecompress {
    fn decompress(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut output = Vec::with_capacity(2 * payload.len() + 64);
        let in_start = self.inner.total_in();
        loop {
            let consumed = (self.inner.total_in() - in_start) as usize;
            let status = self.inner.decompress_vec(&payload[consumed..], &mut output, FlushDecompress::Sync)
                .map_err(|_| Error::Compress("zlib decompression failed"))?;

            let consumed = (self.inner.total_in() - in_start) as usize;
            if output.len() > self.len_max {
                return Err(Error::Compress("decompressed payload is too long"))
            }
            if status == Status::StreamEnd {
                return Err(Error::Compress("unexpected end of zlib stream"))
            }
            if consumed == payload.len() && output.len() < output.capacity() {
                return Ok(output)
            }
            output.reserve(output.capacity().max(64));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_across_packets() {
        let mut compress = ZlibCompress::new();
        let mut decompress = ZlibDecompress::new(1 << 20);

        let payloads: Vec<Vec<u8>> = vec![
            b"".to_vec(),
            b"exec ls -la /tmp".to_vec(),
            (0..5000u32).map(|x| (x % 251) as u8).collect(),
            vec![b'x'; 100_000],
        ];
        for payload in payloads.iter() {
            let compressed = compress.compress(payload).unwrap();
            assert_eq!(&decompress.decompress(&compressed).unwrap(), payload);
        }
    }

    #[test]
    fn test_decompress_limit() {
        let mut compress = ZlibCompress::new();
        let mut decompress = ZlibDecompress::new(1000);
        let compressed = compress.compress(&vec![0; 5000]).unwrap();
        assert!(matches!(decompress.decompress(&compressed), Err(Error::Compress(_))));
    }

    #[test]
    fn test_garbage_is_rejected() {
        let mut decompress = ZlibDecompress::new(1000);
        assert!(decompress.decompress(b"definitely not zlib").is_err());
    }
}
