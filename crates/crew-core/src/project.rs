//! Project references and path-derived project ids.
//!
//! A project id is a lossless, filesystem-safe encoding of a normalized
//! project path:
//!
//! - `\` and `/` are both accepted as separators and unified to `/`
//! - repeated separators collapse, trailing separators are dropped
//! - ASCII alphanumerics and `_` are kept, `/` becomes `-`
//! - every other byte becomes `~XX` (uppercase hex)
//!
//! ```text
//! /home/me/repo      ─▶ -home-me-repo
//! C:\Users\me\repo   ─▶ C~3A-Users-me-repo
//! ```
//!
//! Decoding reverses the escape and restores the separator style of the
//! path's flavor: drive-letter and UNC paths come back with `\`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::error::{DomainError, DomainResult};

const SEPARATOR: char = '/';
const ENCODED_SEPARATOR: u8 = b'-';
const ESCAPE: u8 = b'~';

// ============================================================================
// Project Id
// ============================================================================

/// Stable identifier derived from a project path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProjectId(String);

impl ProjectId {
    /// Derives the id for a filesystem path in either separator style.
    pub fn from_path(path: &str) -> DomainResult<Self> {
        let normalized = normalize_path(path);
        if normalized.is_empty() {
            return Err(DomainError::invalid_path(path, "path is empty"));
        }
        Ok(Self(encode(&normalized)))
    }

    /// Validates an id received from outside (e.g. a directory name).
    pub fn parse(id: &str) -> DomainResult<Self> {
        if id.is_empty() {
            return Err(DomainError::invalid_project_id(id, "id is empty"));
        }
        decode_normalized(id)?;
        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decodes back to the normalized path with `/` separators.
    pub fn normalized_path(&self) -> DomainResult<String> {
        decode_normalized(&self.0)
    }

    /// Decodes back to a path in its host separator style.
    pub fn decode(&self) -> DomainResult<String> {
        let normalized = self.normalized_path()?;
        if is_windows_flavor(&normalized) {
            Ok(normalized.replace(SEPARATOR, "\\"))
        } else {
            Ok(normalized)
        }
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for ProjectId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ProjectId> for String {
    fn from(id: ProjectId) -> Self {
        id.0
    }
}

// ============================================================================
// Project Reference
// ============================================================================

/// Path-derived project metadata handed to the engine by the project lister.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRef {
    /// Path exactly as supplied.
    pub path: String,

    /// Derived, reversible id.
    pub id: ProjectId,

    /// Last path component, for display.
    pub name: String,
}

impl ProjectRef {
    /// Builds a reference, rejecting relative paths and `..` components.
    pub fn new(path: impl Into<String>) -> DomainResult<Self> {
        let path = path.into();
        validate_project_path(&path)?;
        let id = ProjectId::from_path(&path)?;
        let normalized = normalize_path(&path);
        let name = normalized
            .rsplit(SEPARATOR)
            .find(|segment| !segment.is_empty())
            .unwrap_or(normalized.as_str())
            .to_string();

        Ok(Self { path, id, name })
    }

    /// Rebuilds a reference from a project id.
    pub fn from_id(id: &ProjectId) -> DomainResult<Self> {
        Self::new(id.decode()?)
    }

    /// Path usable as a working directory on this host.
    pub fn host_path(&self) -> PathBuf {
        PathBuf::from(&self.path)
    }
}

// ============================================================================
// Path helpers
// ============================================================================

/// Unifies separators to `/`, collapses repeats, drops trailing separators.
///
/// A leading `//` (UNC prefix) and drive roots such as `C:/` are preserved.
pub fn normalize_path(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let unc = unified.starts_with("//");

    let mut out = String::with_capacity(unified.len());
    if unc {
        out.push(SEPARATOR);
    }
    let mut previous_was_separator = false;
    for ch in unified.chars() {
        if ch == SEPARATOR {
            if !previous_was_separator {
                out.push(SEPARATOR);
            }
            previous_was_separator = true;
        } else {
            out.push(ch);
            previous_was_separator = false;
        }
    }

    while out.len() > 1 && out.ends_with(SEPARATOR) && !is_drive_root(&out) && out != "//" {
        out.pop();
    }
    out
}

/// Rejects paths that are relative or contain `..` components.
pub fn validate_project_path(path: &str) -> DomainResult<()> {
    let normalized = normalize_path(path);
    if normalized.is_empty() {
        return Err(DomainError::invalid_path(path, "path is empty"));
    }
    if !is_absolute(&normalized) {
        return Err(DomainError::invalid_path(path, "path must be absolute"));
    }
    if normalized.split(SEPARATOR).any(|segment| segment == "..") {
        return Err(DomainError::invalid_path(path, "path traversal is not allowed"));
    }
    if normalized.contains('\0') {
        return Err(DomainError::invalid_path(path, "path contains a NUL byte"));
    }
    Ok(())
}

fn has_drive_prefix(normalized: &str) -> bool {
    let bytes = normalized.as_bytes();
    matches!(bytes, [letter, b':', ..] if letter.is_ascii_alphabetic())
}

fn is_drive_root(normalized: &str) -> bool {
    normalized.len() == 3 && has_drive_prefix(normalized) && normalized.ends_with(SEPARATOR)
}

fn is_windows_flavor(normalized: &str) -> bool {
    has_drive_prefix(normalized) || normalized.starts_with("//")
}

fn is_absolute(normalized: &str) -> bool {
    normalized.starts_with(SEPARATOR)
        || (has_drive_prefix(normalized) && normalized.get(2..3) == Some("/"))
}

fn encode(normalized: &str) -> String {
    let mut out = String::with_capacity(normalized.len() + 8);
    for byte in normalized.bytes() {
        match byte {
            b'/' => out.push(char::from(ENCODED_SEPARATOR)),
            b if b.is_ascii_alphanumeric() || b == b'_' => out.push(char::from(b)),
            b => out.push_str(&format!("~{b:02X}")),
        }
    }
    out
}

fn decode_normalized(id: &str) -> DomainResult<String> {
    let mut bytes = Vec::with_capacity(id.len());
    let mut iter = id.bytes();
    while let Some(byte) = iter.next() {
        match byte {
            ENCODED_SEPARATOR => bytes.push(b'/'),
            ESCAPE => {
                let hi = iter.next().and_then(hex_value);
                let lo = iter.next().and_then(hex_value);
                match (hi, lo) {
                    (Some(hi), Some(lo)) => bytes.push((hi << 4) | lo),
                    _ => {
                        return Err(DomainError::invalid_project_id(id, "truncated escape"));
                    }
                }
            }
            b if b.is_ascii_alphanumeric() || b == b'_' => bytes.push(b),
            b => {
                return Err(DomainError::invalid_project_id(
                    id,
                    format!("unexpected character {:?}", char::from(b)),
                ));
            }
        }
    }
    String::from_utf8(bytes).map_err(|_| DomainError::invalid_project_id(id, "not valid UTF-8"))
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}
