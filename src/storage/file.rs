use std::fs;
use std::io::Write;
use std::path::Path;

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::debug;

use super::Storage;
use crate::core::{MsiError, Result};

const MAGIC: &[u8; 8] = b"MSIQSTG1";
const DIGEST_LEN: usize = 32;

fn encode(storage: &Storage) -> Result<Vec<u8>> {
    let payload = bincode::serialize(storage).map_err(|e| MsiError::Serialization(e.to_string()))?;
    let digest = Sha256::digest(&payload);
    let mut out = Vec::with_capacity(MAGIC.len() + DIGEST_LEN + payload.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&digest);
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Reads a container file, verifying its magic and digest.
pub fn load_storage(path: impl AsRef<Path>) -> Result<Storage> {
    let path = path.as_ref();
    let data = fs::read(path)?;
    let header = MAGIC.len() + DIGEST_LEN;
    if data.len() < header || &data[..MAGIC.len()] != MAGIC {
        return Err(MsiError::InvalidData(format!("{} is not a database container", path.display())));
    }
    let payload = &data[header..];
    if Sha256::digest(payload).as_slice() != &data[MAGIC.len()..header] {
        return Err(MsiError::InvalidData(format!("{} failed its integrity check", path.display())));
    }
    let storage = bincode::deserialize(payload).map_err(|e| MsiError::Serialization(e.to_string()))?;
    debug!(path = %path.display(), size = data.len(), "loaded container");
    Ok(storage)
}

/// Writes a container to a temp file next to `path`, then renames it
/// over `path`. Nothing at `path` changes if any step fails.
pub fn save_storage(storage: &Storage, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let encoded = encode(storage)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(&encoded)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| MsiError::Io(e.error))?;
    debug!(path = %path.display(), size = encoded.len(), "saved container");
    Ok(())
}

/// Serializes a container into any writer.
pub fn write_storage(storage: &Storage, mut writer: impl Write) -> Result<()> {
    writer.write_all(&encode(storage)?)?;
    Ok(())
}
