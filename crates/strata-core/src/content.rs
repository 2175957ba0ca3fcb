//! Content addressing helpers.
//!
//! Blob paths are a pure function of the content hash, so existence checks
//! never need a database round trip when only the hash is known.

use sha2::{Digest, Sha256};

use crate::defaults::DEFAULT_BLOB_EXTENSION;

/// Hex-encoded SHA-256 of `data`.
pub fn compute_content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Sharded storage path for a hash: `hash[0:2]/hash[2:4]/hash.ext`.
pub fn storage_path_for(hash: &str, ext: &str) -> String {
    let ext = sanitize_extension(ext).unwrap_or_else(|| DEFAULT_BLOB_EXTENSION.to_string());
    if hash.len() < 4 {
        return format!("{hash}.{ext}");
    }
    format!("{}/{}/{}.{}", &hash[0..2], &hash[2..4], hash, ext)
}

/// Pick a storage extension for an upload.
///
/// Prefers the filename's own extension, falls back to one implied by the
/// mime type, and finally to `bin`.
pub fn extension_for(filename: &str, mime_type: &str) -> String {
    filename
        .rsplit_once('.')
        .and_then(|(stem, ext)| (!stem.is_empty()).then_some(ext))
        .and_then(sanitize_extension)
        .or_else(|| mime_extension(mime_type).map(str::to_string))
        .unwrap_or_else(|| DEFAULT_BLOB_EXTENSION.to_string())
}

fn sanitize_extension(ext: &str) -> Option<String> {
    let ext = ext.trim().trim_start_matches('.').to_ascii_lowercase();
    if ext.is_empty() || ext.len() > 10 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext)
}

fn mime_extension(mime_type: &str) -> Option<&'static str> {
    let base = mime_type.split(';').next().unwrap_or_default().trim();
    Some(match base {
        "application/pdf" => "pdf",
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/svg+xml" => "svg",
        "text/plain" => "txt",
        "text/markdown" => "md",
        "text/html" => "html",
        "text/csv" => "csv",
        "application/json" => "json",
        _ => return None,
    })
}
