//! Publisher identity resolution.
//!
//! Maps a raw location URL to the publisher identity attention is attributed
//! to. Resolution may fail (unparseable input) or decline (non-web schemes);
//! call sites treat both as "skip this attribution" and never propagate.

use crate::{DwellError, Result};
use url::Url;

pub trait PublisherResolver: Send + Sync {
    /// `Ok(None)` means the location has no publisher (internal pages,
    /// non-web schemes); `Err` means the location could not be parsed.
    fn resolve(&self, location: &str) -> Result<Option<String>>;
}

/// Default resolver: the registrable host of an http(s) URL, lowercased,
/// with a leading `www.` stripped.
#[derive(Debug, Clone, Copy, Default)]
pub struct DomainResolver;

impl PublisherResolver for DomainResolver {
    fn resolve(&self, location: &str) -> Result<Option<String>> {
        let url = Url::parse(location).map_err(|e| DwellError::Resolve(e.to_string()))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Ok(None);
        }
        let Some(host) = url.host_str() else {
            return Ok(None);
        };
        let host = host.to_ascii_lowercase();
        let publisher = host.strip_prefix("www.").unwrap_or(&host);
        Ok(Some(publisher.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolves_host() {
        let resolver = DomainResolver;
        assert_eq!(
            resolver.resolve("http://a.com/some/page").unwrap().as_deref(),
            Some("a.com")
        );
        assert_eq!(
            resolver.resolve("https://WWW.Example.COM/").unwrap().as_deref(),
            Some("example.com")
        );
    }

    #[test]
    fn test_declines_non_web_schemes() {
        let resolver = DomainResolver;
        assert_eq!(resolver.resolve("about:blank").unwrap(), None);
        assert_eq!(resolver.resolve("file:///tmp/x").unwrap(), None);
    }

    #[test]
    fn test_unparseable_is_an_error() {
        let resolver = DomainResolver;
        assert!(resolver.resolve("not a url").is_err());
    }
}
