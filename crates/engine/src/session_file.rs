//! On-disk token list used by backends without a native state format.
//!
//! Layout: magic `HRTH`, format version (`u32` LE), token count (`u32` LE),
//! then one `i32` LE per token.

use std::io::{Read, Write};
use std::path::Path;

use hearth_core::{BackendError, Token};

const MAGIC: &[u8; 4] = b"HRTH";
const VERSION: u32 = 1;

fn file_error(path: &Path, reason: impl Into<String>) -> BackendError {
    BackendError::SessionFile {
        path: path.display().to_string(),
        reason: reason.into(),
    }
}

pub fn encode(tokens: &[Token]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12 + tokens.len() * 4);
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&VERSION.to_le_bytes());
    buf.extend_from_slice(&(tokens.len() as u32).to_le_bytes());
    for token in tokens {
        buf.extend_from_slice(&token.to_le_bytes());
    }
    buf
}

pub fn decode(bytes: &[u8]) -> Result<Vec<Token>, String> {
    if bytes.len() < 12 || &bytes[..4] != MAGIC {
        return Err("not a session file".into());
    }
    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != VERSION {
        return Err(format!("unsupported session file version {version}"));
    }
    let count = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
    let body = &bytes[12..];
    if body.len() != count * 4 {
        return Err(format!(
            "token count {count} does not match {} payload bytes",
            body.len()
        ));
    }
    Ok(body
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

pub fn write(path: &Path, tokens: &[Token]) -> Result<(), BackendError> {
    let mut file = std::fs::File::create(path).map_err(|e| file_error(path, e.to_string()))?;
    file.write_all(&encode(tokens))
        .map_err(|e| file_error(path, e.to_string()))
}

/// Read a session file holding at most `capacity` tokens.
pub fn read(path: &Path, capacity: usize) -> Result<Vec<Token>, BackendError> {
    let mut bytes = Vec::new();
    std::fs::File::open(path)
        .and_then(|mut f| f.read_to_end(&mut bytes))
        .map_err(|e| file_error(path, e.to_string()))?;
    let tokens = decode(&bytes).map_err(|reason| file_error(path, reason))?;
    if tokens.len() > capacity {
        return Err(file_error(
            path,
            format!("{} tokens exceed capacity {capacity}", tokens.len()),
        ));
    }
    Ok(tokens)
}
