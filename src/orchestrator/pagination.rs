//! Pagination detection, driven by the same selector-fallback machinery as
//! field extraction.

use crate::selector_fallback::SelectorEngine;
use crate::url_utils;
use scraper::Html;

/// How the listing advances to its next page
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaginationStyle {
    /// An explicit next link; carries the absolute URL
    NextLink(String),
    /// Numeric page links; the orchestrator builds `?page=N` URLs
    Numeric,
    /// Infinite scroll; nothing a plain fetch can advance, so the listing is
    /// treated as a single page
    InfiniteScroll,
    /// No pagination found
    None,
}

/// Probe the DOM for a pagination style, most explicit first
pub fn detect(engine: &SelectorEngine, html: &Html, base_url: &str) -> PaginationStyle {
    let root = html.root_element();

    if let Some(href) = engine.extract(root, "pagination_next") {
        if let Some(absolute) = url_utils::to_absolute(&href, base_url) {
            return PaginationStyle::NextLink(absolute);
        }
    }
    if engine.extract(root, "pagination_numeric").is_some() {
        return PaginationStyle::Numeric;
    }
    if engine.extract(root, "pagination_infinite").is_some() {
        return PaginationStyle::InfiniteScroll;
    }
    PaginationStyle::None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use std::sync::Arc;

    fn engine() -> SelectorEngine {
        SelectorEngine::with_defaults(Arc::new(Metrics::new()))
    }

    #[test]
    fn test_detect_next_link() {
        let html = Html::parse_document(
            r#"<html><body><a rel="next" href="/vagas?page=2">next</a></body></html>"#,
        );
        assert_eq!(
            detect(&engine(), &html, "https://jobs.example.com/vagas"),
            PaginationStyle::NextLink("https://jobs.example.com/vagas?page=2".to_string())
        );
    }

    #[test]
    fn test_detect_numeric() {
        let html = Html::parse_document(
            r#"<html><body><nav class="pagination">
                <a href="/vagas?page=1">1</a><a href="/vagas?page=2">2</a>
            </nav></body></html>"#,
        );
        assert_eq!(
            detect(&engine(), &html, "https://jobs.example.com/vagas"),
            PaginationStyle::Numeric
        );
    }

    #[test]
    fn test_detect_infinite_scroll() {
        let html = Html::parse_document(
            r#"<html><body><div data-infinite-scroll="true"></div></body></html>"#,
        );
        assert_eq!(
            detect(&engine(), &html, "https://jobs.example.com/vagas"),
            PaginationStyle::InfiniteScroll
        );
    }

    #[test]
    fn test_detect_nothing() {
        let html = Html::parse_document("<html><body><p>single page</p></body></html>");
        assert_eq!(
            detect(&engine(), &html, "https://jobs.example.com/vagas"),
            PaginationStyle::None
        );
    }
}
