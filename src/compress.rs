//! DEFLATE wrapping of encoded frames
//!
//! Frames travel zlib-compressed end to end. Inflation doubles as the
//! integrity check on the consumer: a blob assembled from a corrupted frame
//! fails here and is counted as loss.

use bytes::Bytes;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{self, Read, Write};

/// Compresses an encoded frame into the blob carried on the data channel.
pub fn deflate(data: &[u8]) -> Bytes {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data).expect("writing to a Vec cannot fail");
    Bytes::from(encoder.finish().expect("writing to a Vec cannot fail"))
}

/// Decompresses a received blob back into the encoded frame.
pub fn inflate(data: &[u8]) -> io::Result<Bytes> {
    let mut out = Vec::with_capacity(data.len() * 2);
    ZlibDecoder::new(data).read_to_end(&mut out)?;
    Ok(Bytes::from(out))
}
