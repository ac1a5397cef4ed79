//! The property bag and its text codec.
//!
//! Entry metadata is a sorted map from property name to a pair of optional
//! halves: a byte string and a signed 64-bit integer. The encoded form is
//! line-oriented text built from reserved separators:
//!
//! ```text
//! name=66696c652e747874!1f4/store=4461746146696c6531!210
//! ```
//!
//! Each property is `name=hex(bytes)!hex(long)`, properties are joined with
//! `/`. An absent half encodes as the empty string, which is distinct from
//! a present zero. Longs are encoded as the two's-complement hex of the
//! value, so negatives round-trip exactly.

use std::collections::BTreeMap;

use crate::{Error, Result};

/// Separator between properties.
const PROP_SEP: char = '/';
/// Separator between a property name and its value.
const NAME_SEP: char = '=';
/// Separator between the byte half and the long half.
const HALF_SEP: char = '!';

/// One property value: an optional byte string and an optional long.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct PropertyValue {
    pub(crate) bytes: Option<Vec<u8>>,
    pub(crate) long: Option<i64>,
}

/// A sorted bag of named properties describing one container entry.
///
/// Property names must not contain the separator characters `=`, `!`, `/`
/// or `;`; all names used by this crate are short ASCII identifiers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct EntryProperties {
    values: BTreeMap<String, PropertyValue>,
}

impl EntryProperties {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Sets the byte half of `name`, preserving any long half.
    pub(crate) fn set_bytes(&mut self, name: &str, bytes: impl Into<Vec<u8>>) {
        debug_assert!(is_valid_name(name));
        self.values.entry(name.to_owned()).or_default().bytes = Some(bytes.into());
    }

    /// Sets the long half of `name`, preserving any byte half.
    pub(crate) fn set_long(&mut self, name: &str, long: i64) {
        debug_assert!(is_valid_name(name));
        self.values.entry(name.to_owned()).or_default().long = Some(long);
    }

    pub(crate) fn bytes(&self, name: &str) -> Option<&[u8]> {
        self.values.get(name)?.bytes.as_deref()
    }

    pub(crate) fn long(&self, name: &str) -> Option<i64> {
        self.values.get(name)?.long
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Fetches a required byte half, failing with a named parse error.
    pub(crate) fn require_bytes(&self, name: &str) -> Result<&[u8]> {
        self.bytes(name)
            .ok_or_else(|| Error::MalformedMetadata(format!("missing byte property '{name}'")))
    }

    /// Fetches a required long half, failing with a named parse error.
    pub(crate) fn require_long(&self, name: &str) -> Result<i64> {
        self.long(name)
            .ok_or_else(|| Error::MalformedMetadata(format!("missing long property '{name}'")))
    }

    /// Encodes the bag into its text form.
    pub(crate) fn encode(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.values {
            if !out.is_empty() {
                out.push(PROP_SEP);
            }
            out.push_str(name);
            out.push(NAME_SEP);
            if let Some(bytes) = &value.bytes {
                out.push_str(&hex::encode(bytes));
            }
            out.push(HALF_SEP);
            if let Some(long) = value.long {
                // Two's complement: negatives keep a fixed 16-digit width.
                out.push_str(&format!("{:x}", long as u64));
            }
        }
        out
    }

    /// Parses the text form back into a bag.
    pub(crate) fn decode(text: &str) -> Result<Self> {
        let mut values = BTreeMap::new();
        if text.is_empty() {
            return Ok(Self { values });
        }
        for prop in text.split(PROP_SEP) {
            let (name, rest) = prop.split_once(NAME_SEP).ok_or_else(|| {
                Error::MalformedMetadata(format!("property '{prop}' has no name separator"))
            })?;
            let (byte_half, long_half) = rest.rsplit_once(HALF_SEP).ok_or_else(|| {
                Error::MalformedMetadata(format!("property '{name}' has no half separator"))
            })?;
            if name.is_empty() || !is_valid_name(name) {
                return Err(Error::MalformedMetadata(format!(
                    "invalid property name '{name}'"
                )));
            }

            let bytes = if byte_half.is_empty() {
                None
            } else {
                Some(hex::decode(byte_half).map_err(|e| {
                    Error::MalformedMetadata(format!("property '{name}' byte half: {e}"))
                })?)
            };
            let long = if long_half.is_empty() {
                None
            } else {
                Some(u64::from_str_radix(long_half, 16).map_err(|e| {
                    Error::MalformedMetadata(format!("property '{name}' long half: {e}"))
                })? as i64)
            };

            if values
                .insert(name.to_owned(), PropertyValue { bytes, long })
                .is_some()
            {
                return Err(Error::MalformedMetadata(format!(
                    "duplicate property '{name}'"
                )));
            }
        }
        Ok(Self { values })
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.contains([PROP_SEP, NAME_SEP, HALF_SEP, ';'])
}
