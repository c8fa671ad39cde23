//! Link previews for bookmark records.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::EnrichmentError;

/// Metadata shown on a bookmark card. Missing fields are empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkPreview {
    pub title: String,
    pub description: String,
    pub image: String,
    pub favicon: String,
}

impl LinkPreview {
    pub fn is_empty(&self) -> bool {
        self.title.is_empty()
            && self.description.is_empty()
            && self.image.is_empty()
            && self.favicon.is_empty()
    }
}

/// Fetches preview metadata for a URL.
pub trait LinkUnfurler: Send + Sync {
    fn unfurl(&self, url: &str) -> impl Future<Output = Result<LinkPreview, EnrichmentError>> + Send;
}

/// Unfurl `url`, falling back to an empty preview on error or timeout.
pub async fn unfurl_or_default<U: LinkUnfurler>(
    unfurler: &U,
    url: &str,
    timeout: Duration,
) -> LinkPreview {
    if url.trim().is_empty() {
        log::warn!("Unfurl requested without a url");
        return LinkPreview::default();
    }

    match tokio::time::timeout(timeout, unfurler.unfurl(url)).await {
        Ok(Ok(preview)) => preview,
        Ok(Err(e)) => {
            log::warn!("Unfurl failed for {url}: {e}");
            LinkPreview::default()
        }
        Err(_) => {
            log::warn!("Unfurl timed out for {url} after {timeout:?}");
            LinkPreview::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Result<LinkPreview, String>);

    impl LinkUnfurler for Fixed {
        async fn unfurl(&self, _url: &str) -> Result<LinkPreview, EnrichmentError> {
            self.0.clone().map_err(EnrichmentError::Upstream)
        }
    }

    struct Hanging;

    impl LinkUnfurler for Hanging {
        async fn unfurl(&self, _url: &str) -> Result<LinkPreview, EnrichmentError> {
            std::future::pending().await
        }
    }

    fn example() -> LinkPreview {
        LinkPreview {
            title: "Example".into(),
            description: "An example page".into(),
            image: "https://example.com/og.png".into(),
            favicon: "https://example.com/favicon.ico".into(),
        }
    }

    #[tokio::test]
    async fn test_successful_unfurl() {
        let preview =
            unfurl_or_default(&Fixed(Ok(example())), "https://example.com", Duration::from_secs(1))
                .await;
        assert_eq!(preview, example());
    }

    #[tokio::test]
    async fn test_error_falls_back_to_empty() {
        let preview = unfurl_or_default(
            &Fixed(Err("dns failure".into())),
            "https://example.com",
            Duration::from_secs(1),
        )
        .await;
        assert!(preview.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_falls_back_to_empty() {
        let preview =
            unfurl_or_default(&Hanging, "https://slow.example", Duration::from_millis(50)).await;
        assert_eq!(preview, LinkPreview::default());
    }

    #[tokio::test]
    async fn test_blank_url() {
        let preview = unfurl_or_default(&Fixed(Ok(example())), "  ", Duration::from_secs(1)).await;
        assert!(preview.is_empty());
    }
}
