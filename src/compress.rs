//! Streaming DEFLATE codec.
//!
//! Used by the network-key payload paths when compression is requested, and
//! exposed directly for callers that want to compress before encrypting by
//! hand. Block boundaries are not preserved: concatenating the outputs of
//! any sequence of `compress_block` calls plus `finish` yields the same
//! stream as one big call, and the decompressor accepts any re-chunking of
//! that stream.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::CryptoError;
use crate::session::SessionContext;

const FILE_CHUNK: usize = 64 * 1024;

/// Streaming raw-DEFLATE compressor.
pub struct Compressor {
    inner: Compress,
}

impl Compressor {
    pub fn new() -> Self {
        Compressor {
            inner: Compress::new(Compression::default(), false),
        }
    }

    /// Compress one block. Output may be empty while the stream buffers.
    pub fn compress_block(&mut self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.run(data, FlushCompress::None)
    }

    /// Flush everything still buffered and terminate the stream.
    pub fn finish(&mut self) -> Result<Vec<u8>, CryptoError> {
        self.run(&[], FlushCompress::Finish)
    }

    fn run(&mut self, mut input: &[u8], flush: FlushCompress) -> Result<Vec<u8>, CryptoError> {
        let mut out = Vec::with_capacity(input.len() / 2 + 128);
        loop {
            if out.len() == out.capacity() {
                out.reserve(4096);
            }
            let before = self.inner.total_in();
            let status = self
                .inner
                .compress_vec(input, &mut out, flush)
                .map_err(|_| CryptoError::BadFormat("deflate stream"))?;
            let consumed = (self.inner.total_in() - before) as usize;
            input = &input[consumed..];
            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    if matches!(flush, FlushCompress::None) && input.is_empty() {
                        break;
                    }
                }
            }
        }
        Ok(out)
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new()
    }
}

/// Streaming raw-DEFLATE decompressor.
pub struct Decompressor {
    inner: Decompress,
}

impl Decompressor {
    pub fn new() -> Self {
        Decompressor {
            inner: Decompress::new(false),
        }
    }

    /// Decompress one block of the stream, split anywhere.
    pub fn decompress_block(&mut self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut input = data;
        let mut out = Vec::with_capacity(data.len() * 2 + 128);
        loop {
            if out.len() == out.capacity() {
                out.reserve(4096);
            }
            let before = self.inner.total_in();
            let status = self
                .inner
                .decompress_vec(input, &mut out, FlushDecompress::None)
                .map_err(|_| CryptoError::BadFormat("deflate stream"))?;
            let consumed = (self.inner.total_in() - before) as usize;
            input = &input[consumed..];
            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    if input.is_empty() {
                        break;
                    }
                }
            }
        }
        Ok(out)
    }
}

impl Default for Decompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionContext {
    /// Compress a file, reporting progress over the input size.
    pub fn compress_file(&mut self, src: &Path, dst: &Path) -> Result<(), CryptoError> {
        let mut input = File::open(src)?;
        let total = input.metadata()?.len();
        let mut output = File::create(dst)?;
        let mut codec = Compressor::new();
        let mut buf = vec![0u8; FILE_CHUNK];
        let mut done = 0u64;
        loop {
            let n = input.read(&mut buf)?;
            if n == 0 {
                break;
            }
            output.write_all(&codec.compress_block(&buf[..n])?)?;
            done += n as u64;
            self.report_progress(done, total);
        }
        output.write_all(&codec.finish()?)?;
        self.report_progress(total, total);
        Ok(())
    }

    /// Decompress a file, reporting progress over the input size.
    pub fn decompress_file(&mut self, src: &Path, dst: &Path) -> Result<(), CryptoError> {
        let mut input = File::open(src)?;
        let total = input.metadata()?.len();
        let mut output = File::create(dst)?;
        let mut codec = Decompressor::new();
        let mut buf = vec![0u8; FILE_CHUNK];
        let mut done = 0u64;
        loop {
            let n = input.read(&mut buf)?;
            if n == 0 {
                break;
            }
            output.write_all(&codec.decompress_block(&buf[..n])?)?;
            done += n as u64;
            self.report_progress(done, total);
        }
        self.report_progress(total, total);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn sample(len: usize) -> Vec<u8> {
        // Compressible but not constant.
        (0..len).map(|i| ((i / 7) % 251) as u8).collect()
    }

    fn round_trip(data: &[u8], chunk: usize) -> Vec<u8> {
        let mut c = Compressor::new();
        let mut packed = Vec::new();
        for block in data.chunks(chunk.max(1)) {
            packed.extend_from_slice(&c.compress_block(block).unwrap());
        }
        packed.extend_from_slice(&c.finish().unwrap());

        let mut d = Decompressor::new();
        let mut plain = Vec::new();
        for block in packed.chunks(chunk.max(1)) {
            plain.extend_from_slice(&d.decompress_block(block).unwrap());
        }
        plain
    }

    #[test]
    fn round_trips_at_odd_chunkings() {
        let data = sample(50_000);
        for chunk in [1, 13, 4096, 50_000] {
            assert_eq!(round_trip(&data, chunk), data);
        }
    }

    #[test]
    fn chunking_does_not_change_the_stream() {
        let data = sample(20_000);
        let mut one = Compressor::new();
        let mut whole = one.compress_block(&data).unwrap();
        whole.extend_from_slice(&one.finish().unwrap());

        let mut two = Compressor::new();
        let mut split = Vec::new();
        for block in data.chunks(777) {
            split.extend_from_slice(&two.compress_block(block).unwrap());
        }
        split.extend_from_slice(&two.finish().unwrap());
        assert_eq!(whole, split);
    }

    #[test]
    fn empty_input() {
        assert_eq!(round_trip(&[], 64), Vec::<u8>::new());
    }

    #[test]
    fn garbage_is_rejected() {
        let mut d = Decompressor::new();
        assert!(d.decompress_block(&[0xde, 0xad, 0xbe, 0xef, 0x01]).is_err());
    }

    #[test]
    fn file_round_trip_with_progress() {
        use crate::session::{test_session, ProgressSink};
        use std::sync::{Arc, Mutex};

        struct Recorder(Arc<Mutex<Vec<(u64, u64)>>>);
        impl ProgressSink for Recorder {
            fn progress(&mut self, done: u64, total: u64) {
                self.0.lock().unwrap().push((done, total));
            }
        }

        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("plain");
        let packed = tmp.path().join("packed");
        let restored = tmp.path().join("restored");
        let data = sample(200_000);
        fs::write(&src, &data).unwrap();

        let mut session = test_session();
        let calls = Arc::new(Mutex::new(Vec::new()));
        session.set_progress_sink(Some(Box::new(Recorder(calls.clone()))));

        session.compress_file(&src, &packed).unwrap();
        session.decompress_file(&packed, &restored).unwrap();
        assert_eq!(fs::read(&restored).unwrap(), data);

        let calls = calls.lock().unwrap();
        assert!(!calls.is_empty());
        let (done, total) = *calls.last().unwrap();
        assert_eq!(done, total);
    }
}
