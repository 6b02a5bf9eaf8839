use std::fmt;
use std::str::FromStr;

use crate::error::{Result, TransportError};

/// A parsed radio URL, e.g. `spinel+hdlc+uart:///dev/ttyACM0?uart-baudrate=460800`.
///
/// Query parameters keep their order. Keys may repeat and may appear without a
/// value, in which case they act as flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadioUrl {
    raw: String,
    scheme: String,
    path: String,
    params: Vec<(String, Option<String>)>,
}

impl RadioUrl {
    pub fn parse(url: &str) -> Result<Self> {
        let invalid = |reason: &str| TransportError::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = url.split_once("://").ok_or_else(|| invalid("missing '://'"))?;
        if scheme.is_empty() {
            return Err(invalid("empty scheme"));
        }

        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (rest, None),
        };

        let mut params = Vec::new();
        for pair in query.into_iter().flat_map(|q| q.split('&')) {
            if pair.is_empty() {
                continue;
            }
            let param = match pair.split_once('=') {
                Some((key, value)) => (key.to_string(), Some(value.to_string())),
                None => (pair.to_string(), None),
            };
            if param.0.is_empty() {
                return Err(invalid("empty parameter name"));
            }
            params.push(param);
        }

        Ok(Self {
            raw: url.to_string(),
            scheme: scheme.to_string(),
            path: path.to_string(),
            params,
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Device path, program path or instance name, depending on the scheme.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// First value given for `key`. A bare flag has no value.
    pub fn get_value(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(name, _)| name == key)
            .and_then(|(_, value)| value.as_deref())
    }

    /// Every value given for `key`, in order.
    pub fn get_values<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.params
            .iter()
            .filter(move |(name, _)| name == key)
            .filter_map(|(_, value)| value.as_deref())
    }

    /// Whether `key` appears at all, with or without a value.
    pub fn has_param(&self, key: &str) -> bool {
        self.params.iter().any(|(name, _)| name == key)
    }

    /// Parse the first value of `key`, or `None` if absent.
    pub fn parse_value<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        match self.get_value(key) {
            None => Ok(None),
            Some(value) => value
                .parse()
                .map(Some)
                .map_err(|_| TransportError::InvalidUrl {
                    url: self.raw.clone(),
                    reason: format!("bad value {value:?} for {key}"),
                }),
        }
    }
}

impl FromStr for RadioUrl {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for RadioUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
