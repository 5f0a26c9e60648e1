//! Byte-fetch capability, used for favicons.
//!
//! A non-200 status or a non-image body means "no favicon available", never
//! an error; only transport failures surface as `Err` and those too are
//! merely logged by the caller.

use crate::{DwellError, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::time::Duration;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// A fetched HTTP body with the metadata the engine cares about.
#[derive(Debug, Clone)]
pub struct FetchedBody {
    pub status: u16,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait BytesFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedBody>;
}

/// Real fetcher backed by a shared reqwest client.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| DwellError::Fetch(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl BytesFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedBody> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| DwellError::Fetch(e.to_string()))?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        let bytes = response
            .bytes()
            .await
            .map_err(|e| DwellError::Fetch(e.to_string()))?
            .to_vec();
        Ok(FetchedBody {
            status,
            content_type,
            bytes,
        })
    }
}

/// Convert a fetched body into a `data:` URI when it is a usable image.
pub fn image_data_uri(body: &FetchedBody) -> Option<String> {
    if body.status != 200 {
        return None;
    }
    let content_type = body.content_type.as_deref()?;
    // "image/x-icon; charset=binary" and friends still count.
    let media_type = content_type.split(';').next().unwrap_or(content_type).trim();
    if !media_type.starts_with("image/") {
        return None;
    }
    Some(format!(
        "data:{};base64,{}",
        media_type,
        BASE64.encode(&body.bytes)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_body_becomes_data_uri() {
        let body = FetchedBody {
            status: 200,
            content_type: Some("image/png".to_string()),
            bytes: vec![1, 2, 3],
        };
        let uri = image_data_uri(&body).unwrap();
        assert!(uri.starts_with("data:image/png;base64,"));
    }

    #[test]
    fn test_content_type_parameters_are_ignored() {
        let body = FetchedBody {
            status: 200,
            content_type: Some("image/x-icon; charset=binary".to_string()),
            bytes: vec![0],
        };
        assert!(image_data_uri(&body)
            .unwrap()
            .starts_with("data:image/x-icon;base64,"));
    }

    #[test]
    fn test_non_image_and_non_200_yield_none() {
        let html = FetchedBody {
            status: 200,
            content_type: Some("text/html".to_string()),
            bytes: vec![b'<'],
        };
        assert_eq!(image_data_uri(&html), None);

        let missing = FetchedBody {
            status: 404,
            content_type: Some("image/png".to_string()),
            bytes: Vec::new(),
        };
        assert_eq!(image_data_uri(&missing), None);

        let untyped = FetchedBody {
            status: 200,
            content_type: None,
            bytes: vec![0],
        };
        assert_eq!(image_data_uri(&untyped), None);
    }
}
