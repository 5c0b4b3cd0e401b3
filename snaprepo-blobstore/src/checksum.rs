use std::io::{Read, Write};

use anyhow::Error;

use snaprepo_api_types::RepoError;

/// Digests of a fully consumed stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamDigests {
    pub crc32: u32,
    pub sha256: [u8; 32],
    pub length: u64,
}

impl StreamDigests {
    pub fn sha256_hex(&self) -> String {
        hex::encode(self.sha256)
    }

    pub fn crc32_hex(&self) -> String {
        hex::encode(self.crc32.to_be_bytes())
    }
}

/// A writer computing CRC32 and SHA-256 of everything written.
pub struct ChecksumWriter<W> {
    writer: W,
    hasher: crc32fast::Hasher,
    sha: openssl::sha::Sha256,
    length: u64,
}

impl<W: Write> ChecksumWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            hasher: crc32fast::Hasher::new(),
            sha: openssl::sha::Sha256::new(),
            length: 0,
        }
    }

    pub fn finish(self) -> (W, StreamDigests) {
        let digests = StreamDigests {
            crc32: self.hasher.finalize(),
            sha256: self.sha.finish(),
            length: self.length,
        };
        (self.writer, digests)
    }
}

impl<W: Write> Write for ChecksumWriter<W> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, std::io::Error> {
        let count = self.writer.write(buf)?;
        self.hasher.update(&buf[..count]);
        self.sha.update(&buf[..count]);
        self.length += count as u64;
        Ok(count)
    }

    fn flush(&mut self) -> Result<(), std::io::Error> {
        self.writer.flush()
    }
}

/// A reader computing CRC32 and SHA-256 of everything read.
///
/// `finish_verified` compares the digests against the expectation and
/// reports a [`RepoError::CorruptBlob`] on mismatch; callers decide
/// whether that marks the local store corrupted.
pub struct ChecksumReader<R> {
    reader: R,
    hasher: crc32fast::Hasher,
    sha: openssl::sha::Sha256,
    length: u64,
}

impl<R: Read> ChecksumReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            hasher: crc32fast::Hasher::new(),
            sha: openssl::sha::Sha256::new(),
            length: 0,
        }
    }

    pub fn finish(self) -> StreamDigests {
        StreamDigests {
            crc32: self.hasher.finalize(),
            sha256: self.sha.finish(),
            length: self.length,
        }
    }

    /// Finish the stream and verify length and SHA-256 digest.
    pub fn finish_verified(
        self,
        name: &str,
        expected_length: u64,
        expected_sha256_hex: &str,
    ) -> Result<StreamDigests, Error> {
        let digests = self.finish();
        if digests.length != expected_length {
            return Err(Error::new(RepoError::CorruptBlob {
                name: name.to_string(),
                reason: format!(
                    "length mismatch: got {} bytes, expected {}",
                    digests.length, expected_length
                ),
            }));
        }
        if digests.sha256_hex() != expected_sha256_hex {
            return Err(Error::new(RepoError::CorruptBlob {
                name: name.to_string(),
                reason: format!(
                    "digest mismatch: got {}, expected {}",
                    digests.sha256_hex(),
                    expected_sha256_hex
                ),
            }));
        }
        Ok(digests)
    }
}

impl<R: Read> Read for ChecksumReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, std::io::Error> {
        let count = self.reader.read(buf)?;
        self.hasher.update(&buf[..count]);
        self.sha.update(&buf[..count]);
        self.length += count as u64;
        Ok(count)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reader_and_writer_agree() {
        let data = b"some shard file contents";

        let mut writer = ChecksumWriter::new(Vec::new());
        writer.write_all(data).unwrap();
        let (written, write_digests) = writer.finish();
        assert_eq!(written, data);

        let mut reader = ChecksumReader::new(&data[..]);
        std::io::copy(&mut reader, &mut std::io::sink()).unwrap();
        let read_digests = reader.finish();

        assert_eq!(write_digests, read_digests);
        assert_eq!(read_digests.length, data.len() as u64);
    }

    #[test]
    fn verification_detects_mutation() {
        let data = b"original";
        let mut reader = ChecksumReader::new(&data[..]);
        std::io::copy(&mut reader, &mut std::io::sink()).unwrap();
        let digests = reader.finish();

        let mutated = b"0riginal";
        let mut reader = ChecksumReader::new(&mutated[..]);
        std::io::copy(&mut reader, &mut std::io::sink()).unwrap();
        let err = reader
            .finish_verified("file", data.len() as u64, &digests.sha256_hex())
            .unwrap_err();
        assert!(err.to_string().contains("digest mismatch"));
    }
}
