//! Cursor pagination for list operations.
//!
//! REST list endpoints page through `Link` headers. Those links are exposed
//! as opaque cursors in a [`PageInfo`] shaped like GraphQL's, so callers page
//! REST and GraphQL lists the same way: keep passing `end_cursor` while
//! `has_next_page` is true.

use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::{header_str, GitHubError, GitHubErrorKind, GitHubResult};

/// GitHub caps `per_page` at this value.
pub const MAX_PER_PAGE: u32 = 100;

/// Pagination links parsed from a `Link` header (RFC 8288).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaginationLinks {
    /// URL for the next page.
    pub next: Option<String>,
    /// URL for the previous page.
    pub prev: Option<String>,
    /// URL for the first page.
    pub first: Option<String>,
    /// URL for the last page.
    pub last: Option<String>,
}

impl PaginationLinks {
    /// Parses a `Link` header value.
    pub fn from_header(header_value: &str) -> Self {
        let mut links = Self::default();

        for part in header_value.split(',') {
            let mut url = None;
            let mut rel = None;

            for segment in part.split(';') {
                let segment = segment.trim();
                if let Some(inner) = segment.strip_prefix('<').and_then(|s| s.strip_suffix('>')) {
                    url = Some(inner.to_string());
                } else if let Some(value) = segment.strip_prefix("rel=") {
                    rel = Some(value.trim_matches('"').to_string());
                }
            }

            if let (Some(url), Some(rel)) = (url, rel) {
                // A single link may carry several space-separated relations.
                for rel in rel.split_whitespace() {
                    match rel {
                        "next" => links.next = Some(url.clone()),
                        "prev" => links.prev = Some(url.clone()),
                        "first" => links.first = Some(url.clone()),
                        "last" => links.last = Some(url.clone()),
                        _ => {}
                    }
                }
            }
        }

        links
    }

    /// Parses pagination links from response headers.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        header_str(headers, "link")
            .map(Self::from_header)
            .unwrap_or_default()
    }

    /// Total page count read from the `last` link.
    pub fn total_pages(&self) -> Option<u32> {
        self.last.as_deref().and_then(extract_page_number)
    }
}

/// Position of a page within its list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    /// True when another page follows.
    pub has_next_page: bool,
    /// Cursor of the next page.
    pub end_cursor: Option<String>,
    /// True when a page precedes this one.
    pub has_previous_page: bool,
    /// Cursor of the previous page.
    pub start_cursor: Option<String>,
}

impl From<&PaginationLinks> for PageInfo {
    fn from(links: &PaginationLinks) -> Self {
        Self {
            has_next_page: links.next.is_some(),
            end_cursor: links.next.clone(),
            has_previous_page: links.prev.is_some(),
            start_cursor: links.prev.clone(),
        }
    }
}

/// A single page of results.
#[derive(Debug, Clone)]
pub struct Page<T> {
    /// The items in this page.
    pub items: Vec<T>,
    /// Cursors to the neighbouring pages.
    pub page_info: PageInfo,
    /// Total number of pages, when GitHub reports a `last` link.
    pub total_pages: Option<u32>,
}

impl<T> Page<T> {
    /// Creates a page from its items and the response's links.
    pub fn new(items: Vec<T>, links: &PaginationLinks) -> Self {
        Self {
            items,
            page_info: PageInfo::from(links),
            total_pages: links.total_pages(),
        }
    }

    /// Returns true if there is a next page.
    pub fn has_next(&self) -> bool {
        self.page_info.has_next_page
    }

    /// Cursor to pass back for the next page.
    pub fn next_cursor(&self) -> Option<&str> {
        self.page_info.end_cursor.as_deref()
    }

    /// Returns the number of items in this page.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if the page is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Consumes the page and returns the items.
    pub fn into_items(self) -> Vec<T> {
        self.items
    }

    /// Maps the items in this page.
    pub fn map<U, F>(self, f: F) -> Page<U>
    where
        F: FnMut(T) -> U,
    {
        Page {
            items: self.items.into_iter().map(f).collect(),
            page_info: self.page_info,
            total_pages: self.total_pages,
        }
    }
}

impl<T> IntoIterator for Page<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

/// Pagination parameters for the first page of a list.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PaginationParams {
    /// Page number (1-indexed).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    /// Items per page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_page: Option<u32>,
}

impl PaginationParams {
    /// Creates new pagination parameters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the page number.
    pub fn page(mut self, page: u32) -> Self {
        self.page = Some(page);
        self
    }

    /// Sets items per page, capped at [`MAX_PER_PAGE`].
    pub fn per_page(mut self, per_page: u32) -> Self {
        self.per_page = Some(per_page.min(MAX_PER_PAGE));
        self
    }
}

/// Resolves a cursor handed back by a caller.
///
/// Cursors are `Link` URLs; anything that does not point at the configured
/// API host and base path is refused so a tampered cursor cannot send a
/// credential elsewhere.
///
/// # Errors
///
/// `InvalidCursor` when the cursor is not a URL under `base`.
pub fn resolve_cursor(base: &Url, cursor: &str) -> GitHubResult<Url> {
    let invalid = |reason: &str| {
        GitHubError::new(
            GitHubErrorKind::InvalidCursor,
            format!("Invalid pagination cursor: {}", reason),
        )
        .local()
    };

    let url = Url::parse(cursor).map_err(|_| invalid("not a URL"))?;
    if url.scheme() != base.scheme()
        || url.host_str() != base.host_str()
        || url.port_or_known_default() != base.port_or_known_default()
    {
        return Err(invalid("points outside the API host"));
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(invalid("carries credentials"));
    }
    let base_path = base.path().trim_end_matches('/');
    if !url.path().starts_with(base_path) {
        return Err(invalid("points outside the API base path"));
    }
    Ok(url)
}

/// Extracts the `page` query parameter from a URL.
pub fn extract_page_number(url: &str) -> Option<u32> {
    Url::parse(url).ok().and_then(|u| {
        u.query_pairs()
            .find(|(k, _)| k == "page")
            .and_then(|(_, v)| v.parse().ok())
    })
}
