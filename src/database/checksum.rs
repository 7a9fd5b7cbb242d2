//! Streaming SHA-256 checksums of backup files

use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::database::Result;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Compute the hex-encoded SHA-256 digest of a file.
///
/// The file is read once through a fixed-size buffer, so memory use does not
/// depend on the file size.
pub async fn checksum_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}
