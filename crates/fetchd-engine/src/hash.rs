use std::fmt;
use std::io::{self, Read};
use std::str::FromStr;

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use thiserror::Error;

const READ_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown hash algorithm '{0}'")]
pub struct UnknownAlgorithm(pub String);

impl HashAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha224 => "sha224",
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
        }
    }
}

impl FromStr for HashAlgorithm {
    type Err = UnknownAlgorithm;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "").as_str() {
            "md5" => Ok(Self::Md5),
            "sha1" => Ok(Self::Sha1),
            "sha224" => Ok(Self::Sha224),
            "sha256" => Ok(Self::Sha256),
            "sha384" => Ok(Self::Sha384),
            "sha512" => Ok(Self::Sha512),
            _ => Err(UnknownAlgorithm(s.to_string())),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Streaming digest over a finished file.
pub struct HashVerifier;

impl HashVerifier {
    /// Lowercase hex digest of everything `reader` yields.
    pub fn compute(algorithm: HashAlgorithm, reader: impl Read) -> io::Result<String> {
        match algorithm {
            HashAlgorithm::Md5 => digest::<Md5>(reader),
            HashAlgorithm::Sha1 => digest::<Sha1>(reader),
            HashAlgorithm::Sha224 => digest::<Sha224>(reader),
            HashAlgorithm::Sha256 => digest::<Sha256>(reader),
            HashAlgorithm::Sha384 => digest::<Sha384>(reader),
            HashAlgorithm::Sha512 => digest::<Sha512>(reader),
        }
    }

    /// Returns the computed checksum alongside the verdict so callers can
    /// report it on mismatch.
    pub fn verify(
        expected_hex: &str,
        algorithm: HashAlgorithm,
        reader: impl Read,
    ) -> io::Result<(bool, String)> {
        let checksum = Self::compute(algorithm, reader)?;
        Ok((checksum.eq_ignore_ascii_case(expected_hex.trim()), checksum))
    }
}

fn digest<D: Digest>(mut reader: impl Read) -> io::Result<String> {
    let mut hasher = D::new();
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
