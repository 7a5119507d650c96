//! Opaque message scheme references.
//!
//! Scheme parsing and code generation live outside the core; channels and
//! the context only pass scheme references around and cache them by source
//! URL. The one format the core understands natively is `yamls://<body>`,
//! which carries the scheme source inline and needs no external loader.

use std::sync::Arc;

use crate::error::{Error, Result};

/// An opaque, immutable message schema reference.
///
/// Compared by identity where it matters (cache hits return the same
/// `Arc`); the body is kept only for consumers that parse it downstream.
#[derive(Debug)]
pub struct Scheme {
    uri: String,
    body: Option<String>,
}

impl Scheme {
    /// Loads a scheme from its source URL.
    ///
    /// `yamls://` URLs embed the source inline. Everything else is kept as
    /// an opaque reference for an external loader; an empty URL is invalid.
    pub fn load(uri: &str) -> Result<Arc<Scheme>> {
        if uri.is_empty() {
            return Err(Error::invalid_arg("empty scheme url"));
        }
        let body = uri.strip_prefix("yamls://").map(|s| s.to_string());
        Ok(Arc::new(Scheme {
            uri: uri.to_string(),
            body,
        }))
    }

    /// The source URL this scheme was loaded from.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Inline source body, when the URL carried one.
    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_body() {
        let s = Scheme::load("yamls://- name: msg").unwrap();
        assert_eq!(s.body(), Some("- name: msg"));
        assert_eq!(s.uri(), "yamls://- name: msg");
    }

    #[test]
    fn opaque_reference() {
        let s = Scheme::load("yaml://scheme.yaml").unwrap();
        assert_eq!(s.body(), None);
        assert!(Scheme::load("").is_err());
    }
}
