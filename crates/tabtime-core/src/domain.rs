//! Domain resolution: maps a tab URL to its tracking bucket.

use url::Url;

use crate::types::DomainKey;

/// Browser-internal schemes that never accrue time.
///
/// Compared against `Url::scheme`, which is always lowercase.
const UNTRACKED_SCHEMES: &[&str] = &[
    "chrome",
    "chrome-extension",
    "chrome-untrusted",
    "chrome-search",
    "devtools",
    "edge",
    "brave",
    "about",
    "moz-extension",
];

/// Resolves a URL string to the domain key that should accrue time.
///
/// Returns `None` for unparsable input, browser-internal pages, and URLs
/// without a hostname (`file:`, `data:`, ...). The hostname is returned as
/// the URL parser produces it: ports are dropped, `www.` and subdomains are
/// kept.
pub fn resolve(url: &str) -> Option<DomainKey> {
    let parsed = Url::parse(url).ok()?;
    if is_untracked_scheme(parsed.scheme()) {
        return None;
    }
    let host = parsed.host_str()?;
    DomainKey::new(host).ok()
}

fn is_untracked_scheme(scheme: &str) -> bool {
    UNTRACKED_SCHEMES.contains(&scheme)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolved(url: &str) -> Option<String> {
        resolve(url).map(String::from)
    }

    #[test]
    fn test_resolves_hostname() {
        assert_eq!(
            resolved("https://github.com/rust-lang/rust"),
            Some("github.com".to_string())
        );
    }

    #[test]
    fn test_keeps_subdomains_distinct() {
        assert_eq!(
            resolved("https://www.example.com/"),
            Some("www.example.com".to_string())
        );
        assert_eq!(
            resolved("https://docs.example.com/"),
            Some("docs.example.com".to_string())
        );
    }

    #[test]
    fn test_drops_port() {
        assert_eq!(
            resolved("http://localhost:8080/index.html"),
            Some("localhost".to_string())
        );
    }

    #[test]
    fn test_internal_schemes_untracked() {
        assert_eq!(resolved("chrome://extensions"), None);
        assert_eq!(resolved("chrome-extension://abcdefghijklmnop/popup.html"), None);
        assert_eq!(resolved("CHROME://settings"), None);
        assert_eq!(resolved("about:blank"), None);
    }

    #[test]
    fn test_unparsable_untracked() {
        assert_eq!(resolved("not a url"), None);
        assert_eq!(resolved(""), None);
        assert_eq!(resolved("://missing-scheme.com"), None);
    }

    #[test]
    fn test_hostless_urls_untracked() {
        assert_eq!(resolved("file:///home/user/notes.txt"), None);
        assert_eq!(resolved("data:text/plain,hello"), None);
    }
}
