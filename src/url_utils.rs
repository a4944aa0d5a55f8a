//! URL helpers used throughout the pipeline

use url::Url;

/// Query parameters that never change the identity of a listing
const TRACKING_PARAMS: &[&str] = &[
    "ref",
    "fbclid",
    "gclid",
    "msclkid",
    "sessionid",
    "session_id",
    "sid",
    "phpsessid",
    "jsessionid",
];

/// Canonicalize a URL into the unique business-key form.
///
/// Strips tracking query parameters (`utm_*`, `ref`, `fbclid`, session ids)
/// and the fragment, lowercases scheme and host, and forces the scheme to
/// `https`. Idempotent: `canonicalize(canonicalize(u)) == canonicalize(u)`.
pub fn canonicalize(raw: &str) -> Option<String> {
    let mut parsed = Url::parse(raw.trim()).ok()?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    parsed.set_scheme("https").ok()?;

    // Url already lowercases scheme and host during parsing; the host is
    // re-set here so IDN forms normalize the same way on every pass.
    if let Some(host) = parsed.host_str().map(|h| h.to_lowercase()) {
        parsed.set_host(Some(&host)).ok()?;
    } else {
        return None;
    }

    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(key, _)| !is_tracking_param(key))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if kept.is_empty() {
        parsed.set_query(None);
    } else {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in &kept {
            serializer.append_pair(k, v);
        }
        parsed.set_query(Some(&serializer.finish()));
    }

    parsed.set_fragment(None);
    Some(parsed.to_string())
}

fn is_tracking_param(key: &str) -> bool {
    let lower = key.to_lowercase();
    lower.starts_with("utm_") || TRACKING_PARAMS.contains(&lower.as_str())
}

/// Extract the host portion of a URL
pub fn extract_host(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|s| s.to_string()))
}

/// Resolve a link against the provided base URL
pub fn to_absolute(link: &str, base_url: &str) -> Option<String> {
    let base = Url::parse(base_url).ok()?;
    base.join(link.trim()).ok().map(|u| u.to_string())
}

/// Build the URL for a given page number of a paginated listing.
///
/// Replaces an existing `page` query parameter or appends one.
pub fn with_page(seed: &str, page: u32) -> Option<String> {
    let parsed = Url::parse(seed).ok()?;
    let mut rebuilt = parsed.clone();

    let others: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| k != "page")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    rebuilt.set_query(None);
    {
        let mut qp = rebuilt.query_pairs_mut();
        for (k, v) in &others {
            qp.append_pair(k, v);
        }
        qp.append_pair("page", &page.to_string());
    }
    Some(rebuilt.to_string())
}
