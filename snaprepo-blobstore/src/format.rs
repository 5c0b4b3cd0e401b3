//! Typed, checksummed, optionally compressed metadata blobs.

use std::io::Read;
use std::marker::PhantomData;

use anyhow::{Context, Error};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use snaprepo_api_types::{CompressionType, RepoError};

use crate::container::{BlobContainer, BlobContainerExt};

// openssl::sha::sha256(b"snaprepo checksummed blob v1")[0..4]
pub const CHECKSUM_BLOB_MAGIC: [u8; 4] = [54, 111, 245, 220];

/// Compressed bodies are self describing: the compressor writes a four
/// byte marker in front of its output. Uncompressed bodies are JSON
/// and start with `{`, so the markers cannot be confused with payload.
const DEFLATE_BODY_HEADER: [u8; 4] = *b"DFL\0";
const LZ4_BODY_HEADER: [u8; 4] = *b"LZ4\0";

/// Current version of the generational blob format.
pub const FORMAT_VERSION: i32 = 2;
/// Oldest version this build still reads.
pub const MIN_FORMAT_VERSION: i32 = 2;

const MAX_CODEC_LEN: usize = 127;

/// Reads and writes blobs of the shape
///
/// ```text
/// magic(4) | codec-len(1) | codec(ascii) | version(i32 BE) | body | crc32(u32 BE)
/// ```
///
/// where the CRC covers everything before it. The body is the JSON
/// serialization of `T`, optionally compressed (deflate or lz4, only
/// kept when it is actually smaller).
pub struct ChecksumBlobFormat<T> {
    codec: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> ChecksumBlobFormat<T> {
    pub const fn new(codec: &'static str) -> Self {
        Self {
            codec,
            _marker: PhantomData,
        }
    }

    pub fn codec(&self) -> &'static str {
        self.codec
    }

    fn corrupt(&self, name: &str, reason: impl Into<String>) -> Error {
        Error::new(RepoError::CorruptBlob {
            name: name.to_string(),
            reason: reason.into(),
        })
    }

    pub fn serialize(&self, value: &T, compress: Option<CompressionType>) -> Result<Vec<u8>, Error> {
        assert!(self.codec.len() <= MAX_CODEC_LEN && self.codec.is_ascii());

        let body = serde_json::to_vec(value)?;
        let body = match compress {
            Some(compression) => compress_body(&body, compression)?,
            None => body,
        };

        let mut raw = Vec::with_capacity(body.len() + self.codec.len() + 13);
        raw.extend_from_slice(&CHECKSUM_BLOB_MAGIC);
        raw.write_u8(self.codec.len() as u8)?;
        raw.extend_from_slice(self.codec.as_bytes());
        raw.write_i32::<BigEndian>(FORMAT_VERSION)?;
        raw.extend_from_slice(&body);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&raw);
        raw.write_u32::<BigEndian>(hasher.finalize())?;

        Ok(raw)
    }

    pub fn deserialize(&self, name: &str, data: &[u8]) -> Result<T, Error> {
        // magic + codec-len + version + crc is the smallest possible blob
        if data.len() < 4 + 1 + 4 + 4 {
            return Err(self.corrupt(name, format!("blob too small ({} bytes)", data.len())));
        }

        let (payload, crc_bytes) = data.split_at(data.len() - 4);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(payload);
        let expected_crc = (&crc_bytes[..]).read_u32::<BigEndian>()?;
        if hasher.finalize() != expected_crc {
            return Err(self.corrupt(name, "checksum mismatch"));
        }

        let mut reader = payload;
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if magic != CHECKSUM_BLOB_MAGIC {
            return Err(self.corrupt(name, "wrong magic number"));
        }

        let codec_len = reader.read_u8()? as usize;
        if codec_len > reader.len() {
            return Err(self.corrupt(name, "truncated codec name"));
        }
        let (codec, rest) = reader.split_at(codec_len);
        if codec != self.codec.as_bytes() {
            return Err(self.corrupt(
                name,
                format!(
                    "codec mismatch: got {:?}, expected {:?}",
                    String::from_utf8_lossy(codec),
                    self.codec,
                ),
            ));
        }

        let mut rest = rest;
        let version = rest.read_i32::<BigEndian>()?;
        if version > FORMAT_VERSION {
            return Err(Error::new(RepoError::FormatTooNew {
                name: name.to_string(),
                version,
                supported: FORMAT_VERSION,
            }));
        }
        if version < MIN_FORMAT_VERSION {
            return Err(Error::new(RepoError::FormatTooOld {
                name: name.to_string(),
                version,
                supported: MIN_FORMAT_VERSION,
            }));
        }

        let body = decompress_body(rest)
            .map_err(|err| self.corrupt(name, format!("unable to decompress body - {}", err)))?;
        serde_json::from_slice(&body)
            .map_err(|err| self.corrupt(name, format!("unable to parse body - {}", err)))
    }

    /// Read and verify the blob `name` from `container`.
    pub fn read(&self, container: &dyn BlobContainer, name: &str) -> Result<T, Error> {
        let data = container.read_blob_bytes(name)?;
        self.deserialize(&format!("{}/{}", container.path(), name), &data)
    }

    /// Plain (non-atomic) write.
    pub fn write(
        &self,
        container: &dyn BlobContainer,
        name: &str,
        value: &T,
        compress: Option<CompressionType>,
        fail_if_exists: bool,
    ) -> Result<(), Error> {
        let raw = self.serialize(value, compress)?;
        container
            .write_blob_bytes(name, &raw, fail_if_exists)
            .with_context(|| format!("unable to write blob '{}'", name))
    }

    /// Atomic write: the blob is visible only after a full success.
    pub fn write_atomic(
        &self,
        container: &dyn BlobContainer,
        name: &str,
        value: &T,
        compress: Option<CompressionType>,
        fail_if_exists: bool,
    ) -> Result<(), Error> {
        let raw = self.serialize(value, compress)?;
        container
            .write_blob_bytes_atomic(name, &raw, fail_if_exists)
            .with_context(|| format!("unable to write blob '{}'", name))
    }
}

fn compress_body(body: &[u8], compression: CompressionType) -> Result<Vec<u8>, Error> {
    let mut compressed = match compression {
        CompressionType::Deflate => {
            let mut out = Vec::with_capacity(body.len() / 2 + 8);
            out.extend_from_slice(&DEFLATE_BODY_HEADER);
            let mut encoder =
                flate2::write::DeflateEncoder::new(out, flate2::Compression::default());
            use std::io::Write;
            encoder.write_all(body)?;
            encoder.finish()?
        }
        CompressionType::Lz4 => {
            let mut out = Vec::with_capacity(body.len() / 2 + 8);
            out.extend_from_slice(&LZ4_BODY_HEADER);
            out.extend_from_slice(&lz4_flex::compress_prepend_size(body));
            out
        }
    };
    // only use compression if the result is shorter
    if compressed.len() >= body.len() {
        compressed.clear();
        compressed.extend_from_slice(body);
    }
    Ok(compressed)
}

fn decompress_body(body: &[u8]) -> Result<Vec<u8>, Error> {
    if body.len() >= 4 && body[..4] == DEFLATE_BODY_HEADER {
        let mut decoder = flate2::read::DeflateDecoder::new(&body[4..]);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out)?;
        Ok(out)
    } else if body.len() >= 4 && body[..4] == LZ4_BODY_HEADER {
        Ok(lz4_flex::decompress_size_prepended(&body[4..])
            .map_err(|err| anyhow::format_err!("{}", err))?)
    } else {
        Ok(body.to_vec())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
    struct Payload {
        name: String,
        entries: Vec<u64>,
    }

    const FORMAT: ChecksumBlobFormat<Payload> = ChecksumBlobFormat::new("test-payload");

    fn payload() -> Payload {
        Payload {
            name: "shard".into(),
            entries: (0..512).collect(),
        }
    }

    #[test]
    fn round_trip_uncompressed() {
        let raw = FORMAT.serialize(&payload(), None).unwrap();
        assert_eq!(FORMAT.deserialize("blob", &raw).unwrap(), payload());
    }

    #[test]
    fn round_trip_compressed() {
        for compression in [CompressionType::Deflate, CompressionType::Lz4] {
            let raw = FORMAT.serialize(&payload(), Some(compression)).unwrap();
            let plain = FORMAT.serialize(&payload(), None).unwrap();
            assert!(raw.len() < plain.len(), "{:?} did not shrink the body", compression);
            assert_eq!(FORMAT.deserialize("blob", &raw).unwrap(), payload());
        }
    }

    #[test]
    fn bit_flip_is_detected() {
        let mut raw = FORMAT.serialize(&payload(), None).unwrap();
        let middle = raw.len() / 2;
        raw[middle] ^= 0x80;
        let err = FORMAT.deserialize("blob", &raw).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RepoError>(),
            Some(RepoError::CorruptBlob { .. })
        ));
    }

    #[test]
    fn truncation_is_detected() {
        let raw = FORMAT.serialize(&payload(), None).unwrap();
        let err = FORMAT.deserialize("blob", &raw[..raw.len() - 1]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RepoError>(),
            Some(RepoError::CorruptBlob { .. })
        ));
    }

    #[test]
    fn wrong_codec_is_rejected() {
        let other: ChecksumBlobFormat<Payload> = ChecksumBlobFormat::new("other-codec");
        let raw = other.serialize(&payload(), None).unwrap();
        let err = FORMAT.deserialize("blob", &raw).unwrap_err();
        assert!(err.to_string().contains("codec mismatch"));
    }
}
