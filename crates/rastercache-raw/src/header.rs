//! ENVI `.hdr` header files
//!
//! A header starts with a line reading `ENVI`, followed by `key = value`
//! lines. Values wrapped in `{ ... }` may span several lines. Keys are
//! normalised to lower case with spaces replaced by underscores, so
//! `header offset` and `Header Offset` both become `header_offset`.

use rastercache_common::{Error, Result};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Upper bound on one multi-line value
const MAX_VALUE_LEN: usize = 10 * 1024 * 1024;

/// Keys written first, in this order, by [`EnviHeader::to_text`]
const LEADING_KEYS: [&str; 9] = [
    "description",
    "samples",
    "lines",
    "bands",
    "header_offset",
    "file_type",
    "data_type",
    "interleave",
    "byte_order",
];

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnviHeader {
    entries: BTreeMap<String, String>,
}

fn normalize_key(key: &str) -> String {
    key.trim().to_ascii_lowercase().replace(' ', "_")
}

impl EnviHeader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse header text
    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines();
        match lines.next() {
            Some(first) if first.trim_start().starts_with("ENVI") => {}
            _ => {
                return Err(Error::configuration(
                    "header does not start with ENVI",
                ));
            }
        }

        let mut header = Self::new();
        while let Some(line) = lines.next() {
            let line = line.trim_start();
            if !line.contains('=') {
                continue;
            }
            let mut working = line.to_string();
            if working.contains('{') && !working.contains('}') {
                for next in lines.by_ref() {
                    working.push_str(next);
                    if working.len() > MAX_VALUE_LEN {
                        return Err(Error::configuration("header value exceeds 10 MiB"));
                    }
                    if next.contains('}') {
                        break;
                    }
                }
            }
            if let Some((key, value)) = working.split_once('=') {
                let key = normalize_key(key);
                if !key.is_empty() {
                    header.entries.insert(key, value.trim().to_string());
                }
            }
        }
        Ok(header)
    }

    /// Read and parse a header file
    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text).map_err(|e| match e {
            Error::Configuration(msg) => {
                Error::configuration(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(&normalize_key(key)).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.entries.insert(normalize_key(key), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(&normalize_key(key))
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Integer value of `key`, or `default` when absent
    pub fn get_u64_or(&self, key: &str, default: u64) -> Result<u64> {
        self.get(key).map_or(Ok(default), |v| parse_integer(key, v))
    }

    /// Positive integer value of a key that must be present
    pub fn require_dimension(&self, key: &str) -> Result<usize> {
        let value = self
            .get(key)
            .ok_or_else(|| Error::configuration(format!("header has no `{key}` keyword")))?;
        let n = parse_integer(key, value)?;
        usize::try_from(n)
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| Error::configuration(format!("invalid {key} = {value}")))
    }

    /// List value of `key`, split on commas
    pub fn get_list(&self, key: &str) -> Option<Vec<String>> {
        self.get(key).and_then(split_list)
    }

    /// Render the header, structural keys first
    pub fn to_text(&self) -> String {
        let mut out = String::from("ENVI\n");
        let mut push = |key: &str, value: &str| {
            let key = key.replace('_', " ");
            if value.contains('\n') && !value.starts_with('{') {
                let _ = writeln!(out, "{key} = {{\n{value}}}");
            } else {
                let _ = writeln!(out, "{key} = {value}");
            }
        };
        for key in LEADING_KEYS {
            if let Some(value) = self.entries.get(key) {
                push(key, value);
            }
        }
        for (key, value) in &self.entries {
            if !LEADING_KEYS.contains(&key.as_str()) {
                push(key, value);
            }
        }
        out
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_text())?;
        Ok(())
    }
}

fn parse_integer(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| Error::configuration(format!("invalid {key} = {value}")))
}

/// Split a `{a, b, c}` list into trimmed fields
///
/// Returns `None` when the value is not a braced list.
pub fn split_list(value: &str) -> Option<Vec<String>> {
    let inner = value.trim().strip_prefix('{')?;
    let inner = inner.split_once('}').map_or(inner, |(body, _)| body);
    if inner.trim().is_empty() {
        return Some(Vec::new());
    }
    Some(inner.split(',').map(|s| s.trim().to_string()).collect())
}

/// Locate the header belonging to a data file
///
/// Tries `<path>.hdr`, then the path with its extension replaced by `.hdr`,
/// each in lower and upper case.
pub fn find_header_file(data_path: &Path) -> Option<PathBuf> {
    let appended = |ext: &str| {
        let mut name = data_path.as_os_str().to_owned();
        name.push(".");
        name.push(ext);
        PathBuf::from(name)
    };
    [
        appended("hdr"),
        appended("HDR"),
        data_path.with_extension("hdr"),
        data_path.with_extension("HDR"),
    ]
    .into_iter()
    .find(|p| p != data_path && p.is_file())
}
