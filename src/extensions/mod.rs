//! `Sec-WebSocket-Extensions` header grammar (RFC 6455 Section 9.1).
//!
//! Only permessage-deflate is implemented (see [`deflate`]); this module
//! parses and prints the header so offers and responses can be inspected.
//!
//! ```text
//! Sec-WebSocket-Extensions: permessage-deflate; client_max_window_bits, x-foo
//! ```

pub mod deflate;

use std::fmt;

use http::HeaderMap;
use http::header::SEC_WEBSOCKET_EXTENSIONS;

/// One `name[=value]` parameter of an extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionParam {
    pub name: String,
    /// `None` for flag parameters.
    pub value: Option<String>,
}

impl ExtensionParam {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }

    pub fn flag(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }

    /// Parse `param=value`, `param="value"` or `param`.
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        match s.split_once('=') {
            Some((name, value)) => Self::new(name.trim(), value.trim().trim_matches('"')),
            None => Self::flag(s),
        }
    }
}

impl fmt::Display for ExtensionParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(v) => write!(f, "{}={}", self.name, v),
            None => f.write_str(&self.name),
        }
    }
}

/// One extension entry: a name followed by `;`-separated parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionOffer {
    pub name: String,
    pub params: Vec<ExtensionParam>,
}

impl ExtensionOffer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_param(mut self, param: ExtensionParam) -> Self {
        self.params.push(param);
        self
    }

    /// Parse `name; p1=v1; p2`. Returns `None` for an empty entry.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split(';');
        let name = parts.next()?.trim();
        if name.is_empty() {
            return None;
        }
        let params = parts
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(ExtensionParam::parse)
            .collect();
        Some(Self {
            name: name.to_string(),
            params,
        })
    }

    /// Parse a comma-separated header value, skipping empty entries.
    pub fn parse_header(value: &str) -> Vec<Self> {
        value.split(',').filter_map(Self::parse).collect()
    }

    /// All entries of every `Sec-WebSocket-Extensions` header in `headers`.
    pub fn from_headers(headers: &HeaderMap) -> Vec<Self> {
        headers
            .get_all(SEC_WEBSOCKET_EXTENSIONS)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(Self::parse_header)
            .collect()
    }

    pub fn get_param(&self, name: &str) -> Option<&ExtensionParam> {
        self.params.iter().find(|p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.get_param(name).is_some()
    }

    /// Case-insensitive name match.
    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

impl fmt::Display for ExtensionOffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for param in &self.params {
            write!(f, "; {param}")?;
        }
        Ok(())
    }
}
