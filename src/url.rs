//! Channel initialization URLs.
//!
//! Channels are described by strings of the form
//! `proto://host;key=value;key=value`. The protocol selects the impl (via
//! the context registry), the host is transport specific, and parameters
//! are free-form dotted keys. A string without `://` parses as bare
//! parameters and is used for open-time arguments.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::config::ConfigTree;
use crate::error::{Error, Result};

/// Virtual parameter key addressing the protocol field.
pub const KEY_PROTO: &str = "tll.proto";
/// Virtual parameter key addressing the host field.
pub const KEY_HOST: &str = "tll.host";

/// A parsed channel URL.
///
/// Parameters are kept sorted, so serialisation is canonical: parsing and
/// re-serialising a URL yields the same string with keys in sorted order.
///
/// # Example
///
/// ```
/// use commlink::Url;
///
/// let url = Url::parse("tcp://localhost:5555;mode=client;name=up").unwrap();
/// assert_eq!(url.proto(), "tcp");
/// assert_eq!(url.host(), "localhost:5555");
/// assert_eq!(url.get("mode"), Some("client"));
/// assert_eq!(url.to_string(), "tcp://localhost:5555;mode=client;name=up");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Url {
    proto: String,
    host: String,
    params: BTreeMap<String, String>,
}

impl Url {
    /// Creates an empty URL with the given protocol.
    pub fn new(proto: impl Into<String>) -> Self {
        Self {
            proto: proto.into(),
            host: String::new(),
            params: BTreeMap::new(),
        }
    }

    /// Parses a full URL string (`proto://host;k=v;...`).
    ///
    /// A string without `://` is parsed as bare parameters with empty
    /// protocol and host. Duplicate keys within one string are rejected.
    pub fn parse(s: &str) -> Result<Self> {
        let mut url = Url::default();
        let rest = match s.find("://") {
            Some(pos) => {
                url.proto = s[..pos].to_string();
                if url.proto.is_empty() {
                    return Err(Error::invalid_arg(format!("empty protocol in url '{s}'")));
                }
                let rest = &s[pos + 3..];
                match rest.find(';') {
                    Some(sep) => {
                        url.host = rest[..sep].to_string();
                        &rest[sep + 1..]
                    }
                    None => {
                        url.host = rest.to_string();
                        ""
                    }
                }
            }
            None => s,
        };

        for part in rest.split(';') {
            if part.is_empty() {
                continue;
            }
            let (k, v) = part
                .split_once('=')
                .ok_or_else(|| Error::invalid_arg(format!("missing '=' in parameter '{part}'")))?;
            if k.is_empty() {
                return Err(Error::invalid_arg(format!("empty key in parameter '{part}'")));
            }
            url.set_checked(k, v)?;
        }
        Ok(url)
    }

    /// Parses an open-time parameter string (`k=v;k=v`, no protocol part).
    pub fn parse_params(s: &str) -> Result<Self> {
        if s.contains("://") {
            return Err(Error::invalid_arg(format!(
                "parameter string '{s}' must not contain a protocol"
            )));
        }
        Self::parse(s)
    }

    /// The protocol field.
    pub fn proto(&self) -> &str {
        &self.proto
    }

    /// Replaces the protocol field.
    pub fn set_proto(&mut self, proto: impl Into<String>) {
        self.proto = proto.into();
    }

    /// The host field, empty if none was given.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Replaces the host field.
    pub fn set_host(&mut self, host: impl Into<String>) {
        self.host = host.into();
    }

    /// Looks up a parameter. The virtual keys `tll.proto` and `tll.host`
    /// address the positional fields.
    pub fn get(&self, key: &str) -> Option<&str> {
        match key {
            KEY_PROTO => Some(&self.proto).filter(|s| !s.is_empty()).map(|s| s.as_str()),
            KEY_HOST => Some(&self.host).filter(|s| !s.is_empty()).map(|s| s.as_str()),
            _ => self.params.get(key).map(|s| s.as_str()),
        }
    }

    /// True if the parameter (or non-empty virtual field) is present.
    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Sets a parameter, overwriting any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match key.as_str() {
            KEY_PROTO => self.proto = value,
            KEY_HOST => self.host = value,
            _ => {
                self.params.insert(key, value);
            }
        }
    }

    /// Removes a parameter.
    pub fn unset(&mut self, key: &str) {
        self.params.remove(key);
    }

    /// Iterates over parameters in sorted key order (virtual keys excluded).
    pub fn params(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Serialises only the parameters (`k=v;k=v`), the form open-time
    /// arguments are passed in.
    pub fn params_string(&self) -> String {
        let mut out = String::new();
        for (k, v) in &self.params {
            if !out.is_empty() {
                out.push(';');
            }
            out.push_str(k);
            out.push('=');
            out.push_str(v);
        }
        out
    }

    fn set_checked(&mut self, key: &str, value: &str) -> Result<()> {
        if key == KEY_PROTO || key == KEY_HOST || self.params.contains_key(key) {
            return Err(Error::invalid_arg(format!("duplicate key '{key}'")));
        }
        self.params.insert(key.to_string(), value.to_string());
        Ok(())
    }

    // ============================================================================
    // Typed Getters
    // ============================================================================

    /// Boolean parameter: `yes`/`true`/`1` and `no`/`false`/`0`.
    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key) {
            None => Ok(default),
            Some("yes") | Some("true") | Some("1") => Ok(true),
            Some("no") | Some("false") | Some("0") => Ok(false),
            Some(v) => Err(Error::invalid_arg(format!(
                "invalid boolean value '{v}' for '{key}'"
            ))),
        }
    }

    /// Integer parameter.
    pub fn get_int(&self, key: &str, default: i64) -> Result<i64> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => v
                .parse()
                .map_err(|_| Error::invalid_arg(format!("invalid integer '{v}' for '{key}'"))),
        }
    }

    /// Duration parameter with a unit suffix: `ns`, `us`, `ms`, `s`, `m`, `h`.
    pub fn get_duration(&self, key: &str, default: Duration) -> Result<Duration> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => parse_duration(v)
                .ok_or_else(|| Error::invalid_arg(format!("invalid duration '{v}' for '{key}'"))),
        }
    }

    // ============================================================================
    // Config Round-Trip
    // ============================================================================

    /// Writes the URL into a config subtree (`tll.proto`, `tll.host` and
    /// one leaf per parameter).
    pub fn to_config(&self, cfg: &ConfigTree) {
        cfg.set(KEY_PROTO, &self.proto);
        if !self.host.is_empty() {
            cfg.set(KEY_HOST, &self.host);
        }
        for (k, v) in &self.params {
            cfg.set(k, v);
        }
    }

    /// Reconstructs a URL from a config subtree written by [`Url::to_config`].
    pub fn from_config(cfg: &ConfigTree) -> Result<Self> {
        let mut url = Url::default();
        for (k, v) in cfg.browse("") {
            match k.as_str() {
                KEY_PROTO => url.proto = v,
                KEY_HOST => url.host = v,
                _ => {
                    url.params.insert(k, v);
                }
            }
        }
        if url.proto.is_empty() {
            return Err(Error::invalid_arg("config subtree has no tll.proto"));
        }
        Ok(url)
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.proto, self.host)?;
        for (k, v) in &self.params {
            write!(f, ";{k}={v}")?;
        }
        Ok(())
    }
}

fn parse_duration(s: &str) -> Option<Duration> {
    let split = s.find(|c: char| !c.is_ascii_digit())?;
    let value: u64 = s[..split].parse().ok()?;
    match &s[split..] {
        "ns" => Some(Duration::from_nanos(value)),
        "us" => Some(Duration::from_micros(value)),
        "ms" => Some(Duration::from_millis(value)),
        "s" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_secs(value * 60)),
        "h" => Some(Duration::from_secs(value * 3600)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full() {
        let url = Url::parse("tcp://host:1234;mode=client;name=c0").unwrap();
        assert_eq!(url.proto(), "tcp");
        assert_eq!(url.host(), "host:1234");
        assert_eq!(url.get("mode"), Some("client"));
        assert_eq!(url.get("name"), Some("c0"));
        assert_eq!(url.get("missing"), None);
    }

    #[test]
    fn parse_bare_params() {
        let url = Url::parse("fd=12;mode=socket").unwrap();
        assert_eq!(url.proto(), "");
        assert_eq!(url.get("fd"), Some("12"));
        assert_eq!(url.get("mode"), Some("socket"));
    }

    #[test]
    fn virtual_keys() {
        let url = Url::parse("echo://box;a=1").unwrap();
        assert_eq!(url.get(KEY_PROTO), Some("echo"));
        assert_eq!(url.get(KEY_HOST), Some("box"));
        assert!(!Url::parse("echo://;a=1").unwrap().has(KEY_HOST));
    }

    #[test]
    fn canonical_roundtrip() {
        let url = Url::parse("echo://;z=1;a=2;m.sub=3").unwrap();
        assert_eq!(url.to_string(), "echo://;a=2;m.sub=3;z=1");
        let again = Url::parse(&url.to_string()).unwrap();
        assert_eq!(again, url);
    }

    #[test]
    fn duplicate_key_rejected() {
        assert!(Url::parse("echo://;a=1;a=2").is_err());
    }

    #[test]
    fn missing_separator_rejected() {
        assert!(Url::parse("echo://;novalue").is_err());
    }

    #[test]
    fn bool_values() {
        let url = Url::parse("echo://;a=yes;b=0;c=maybe").unwrap();
        assert!(url.get_bool("a", false).unwrap());
        assert!(!url.get_bool("b", true).unwrap());
        assert!(url.get_bool("missing", true).unwrap());
        assert!(url.get_bool("c", false).is_err());
    }

    #[test]
    fn durations() {
        let url = Url::parse("echo://;min=100ms;max=3s;bad=10parsecs").unwrap();
        assert_eq!(
            url.get_duration("min", Duration::ZERO).unwrap(),
            Duration::from_millis(100)
        );
        assert_eq!(
            url.get_duration("max", Duration::ZERO).unwrap(),
            Duration::from_secs(3)
        );
        assert!(url.get_duration("bad", Duration::ZERO).is_err());
    }

    #[test]
    fn config_roundtrip() {
        let url = Url::parse("tcp://peer:99;mode=client;extra.key=v").unwrap();
        let cfg = ConfigTree::new();
        url.to_config(&cfg);
        assert_eq!(cfg.get("tll.proto").as_deref(), Some("tcp"));
        assert_eq!(cfg.get("extra.key").as_deref(), Some("v"));
        let back = Url::from_config(&cfg).unwrap();
        assert_eq!(back, url);
    }
}
