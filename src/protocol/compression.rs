//! zlib framing used for every payload on the wire

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{self, Read, Write};

/// Compress at the maximum level, as the server-side client does
pub fn compress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2 + 16), Compression::best());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Largest inflated payload accepted from the wire
pub const MAX_INFLATED_SIZE: usize = 4 * 1024 * 1024;

pub fn decompress(data: &[u8]) -> io::Result<Vec<u8>> {
    decompress_bounded(data, MAX_INFLATED_SIZE)
}

/// Inflate `data`, failing with `InvalidData` once the output passes `limit`
pub fn decompress_bounded(data: &[u8], limit: usize) -> io::Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data).take(limit as u64 + 1);
    let mut out = Vec::with_capacity(data.len().saturating_mul(4).min(limit));
    decoder.read_to_end(&mut out)?;
    if out.len() > limit {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("inflated payload exceeds {limit} bytes"),
        ));
    }
    Ok(out)
}
