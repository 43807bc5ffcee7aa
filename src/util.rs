use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};

pub fn now_utc_string() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn utc_compact_string(ts: DateTime<Utc>) -> String {
    ts.format("%Y%m%dT%H%M%SZ").to_string()
}

pub fn ensure_directory(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory: {}", path.display()))
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let data = fs::read(path)
        .with_context(|| format!("failed to read file for hashing: {}", path.display()))?;

    let mut hasher = Sha256::new();
    hasher.update(&data);

    Ok(format!("{:x}", hasher.finalize()))
}

/// Whole-file JSON replacement: serialize to a sibling temp file, then rename
/// over the target. An interrupted run leaves either the old file or the new
/// one, never a truncated mix.
pub fn write_json_replace<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_directory(parent)?;
    }

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("invalid output path: {}", path.display()))?;
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    let mut data = serde_json::to_vec_pretty(value)
        .with_context(|| format!("failed to serialize json: {}", path.display()))?;
    data.push(b'\n');

    fs::write(&tmp_path, &data)
        .with_context(|| format!("failed to write json file: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to replace json file: {}", path.display()))?;

    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

/// First `max_chars` characters of a text, for bounded diagnostics.
pub fn bounded_prefix(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let prefix: String = text.chars().take(max_chars).collect();
    format!("{prefix}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_prefix_leaves_short_text_untouched() {
        assert_eq!(bounded_prefix("short", 10), "short");
    }

    #[test]
    fn bounded_prefix_truncates_on_char_boundaries() {
        let text = "blåbærsyltetøy";
        let prefix = bounded_prefix(text, 6);
        assert_eq!(prefix, "blåbær...");
    }

    #[test]
    fn write_json_replace_overwrites_existing_file() {
        let dir = std::env::temp_dir().join("biograf-util-test");
        ensure_directory(&dir).unwrap();
        let path = dir.join("value.json");

        write_json_replace(&path, &serde_json::json!({"v": 1})).unwrap();
        write_json_replace(&path, &serde_json::json!({"v": 2})).unwrap();

        let loaded: serde_json::Value = read_json(&path).unwrap();
        assert_eq!(loaded["v"], 2);
        assert!(!dir.join("value.json.tmp").exists());

        fs::remove_dir_all(&dir).ok();
    }
}
