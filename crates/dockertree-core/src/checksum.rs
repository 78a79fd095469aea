//! SHA-256 file digests for package manifests.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::Error;

/// Compute the SHA-256 digest of a file's raw bytes as lowercase hex.
///
/// # Errors
///
/// Returns [`Error::Io`] if the file cannot be opened or read.
pub fn file_sha256(path: &Path) -> Result<String, Error> {
    let mut file = File::open(path)
        .map_err(|e| Error::io(format!("failed to open {}", path.display()), e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| Error::io(format!("failed to read {}", path.display()), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex_encode(&hasher.finalize()))
}

/// Verify a file against an expected lowercase-hex SHA-256 digest.
///
/// # Errors
///
/// Returns [`Error::Integrity`] on mismatch and [`Error::Io`] if the file
/// cannot be read.
pub fn verify_sha256(path: &Path, expected: &str) -> Result<(), Error> {
    let actual = file_sha256(path)?;
    if actual != expected.to_ascii_lowercase() {
        return Err(Error::integrity(format!(
            "checksum mismatch for {}: expected {expected}, got {actual}",
            path.display()
        )));
    }
    Ok(())
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_matches_known_vector() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, b"hello\n").unwrap();
        // sha256sum of "hello\n"
        assert_eq!(
            file_sha256(&path).unwrap(),
            "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03"
        );
    }

    #[test]
    fn verify_rejects_single_byte_flip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        std::fs::write(&path, b"payload").unwrap();
        let digest = file_sha256(&path).unwrap();
        assert!(verify_sha256(&path, &digest).is_ok());

        std::fs::write(&path, b"paxload").unwrap();
        let err = verify_sha256(&path, &digest).unwrap_err();
        assert_eq!(err.code(), "integrity_error");
    }
}
