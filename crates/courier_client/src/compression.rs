//! Payload compression
//!
//! The producer compresses the whole payload (a single message or a serialized
//! batch) and records the codec and the original size in the metadata.

use std::io::{Read, Write};

use courier_transport::CompressionType;

use crate::error::{Error, Result};

pub fn compress(compression: CompressionType, data: &[u8]) -> Result<Vec<u8>> {
    match compression {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Lz4 => Ok(lz4_flex::compress(data)),
        CompressionType::Zlib => {
            let mut encoder =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(data)
                .and_then(|_| encoder.finish())
                .map_err(|e| Error::InvalidMessage(format!("zlib compression failed: {e}")))
        }
    }
}

pub fn decompress(
    compression: CompressionType,
    data: &[u8],
    uncompressed_size: usize,
) -> Result<Vec<u8>> {
    let decompressed = match compression {
        CompressionType::None => return Ok(data.to_vec()),
        CompressionType::Lz4 => lz4_flex::decompress(data, uncompressed_size)
            .map_err(|e| Error::InvalidMessage(format!("lz4 decompression failed: {e}")))?,
        CompressionType::Zlib => {
            let mut out = Vec::with_capacity(uncompressed_size);
            flate2::read::ZlibDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| Error::InvalidMessage(format!("zlib decompression failed: {e}")))?;
            out
        }
    };

    if decompressed.len() != uncompressed_size {
        return Err(Error::InvalidMessage(format!(
            "decompressed {} bytes, expected {uncompressed_size}",
            decompressed.len()
        )));
    }
    Ok(decompressed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        b"hello hello hello hello hello courier"
            .iter()
            .cycle()
            .take(4096)
            .copied()
            .collect()
    }

    #[test]
    fn lz4_shrinks_repetitive_payloads() {
        let data = sample();
        let packed = compress(CompressionType::Lz4, &data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(
            decompress(CompressionType::Lz4, &packed, data.len()).unwrap(),
            data
        );
    }

    #[test]
    fn zlib_restores_payload() {
        let data = sample();
        let packed = compress(CompressionType::Zlib, &data).unwrap();
        assert_eq!(
            decompress(CompressionType::Zlib, &packed, data.len()).unwrap(),
            data
        );
    }

    #[test]
    fn none_is_identity() {
        assert_eq!(compress(CompressionType::None, b"abc").unwrap(), b"abc");
    }

    #[test]
    fn wrong_size_is_rejected() {
        let packed = compress(CompressionType::Zlib, b"abcdef").unwrap();
        assert!(matches!(
            decompress(CompressionType::Zlib, &packed, 3),
            Err(Error::InvalidMessage(_))
        ));
        assert!(decompress(CompressionType::Lz4, b"\xff\xff", 10).is_err());
    }
}
