//! URL detection on outbound shell chunks
//!
//! In-container CLIs try to open browsers in various ways; the container has
//! none, so the backplane spots the attempts and tells the client instead.
//! The `OPEN_URL:` form is produced by overriding the in-container `BROWSER`
//! env to `echo "OPEN_URL:"`.

use std::sync::LazyLock;

use regex::Regex;

static URL_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?:xdg-open|open|start)\s+(https?://\S+)",
        r"OPEN_URL:\s*(https?://\S+)",
        r"Opening\s+(https?://\S+)",
        r"Visit:\s*(https?://\S+)",
        r"View at:\s*(https?://\S+)",
        r"Browse to:\s*(https?://\S+)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static regex"))
    .collect()
});

static OPEN_URL_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"OPEN_URL:\s*(https?://\S+)").expect("static regex"));

/// Result of scanning one terminal chunk
#[derive(Debug, Clone, PartialEq)]
pub struct UrlScan {
    /// Detected URLs, one `url_open` each
    pub urls: Vec<String>,
    /// Chunk to pass through, with `OPEN_URL:` lines rewritten
    pub passthrough: String,
}

/// Scan a chunk for browser-open attempts
pub fn scan_chunk(text: &str) -> UrlScan {
    let mut urls = Vec::new();

    for pattern in URL_PATTERNS.iter() {
        for capture in pattern.captures_iter(text) {
            if let Some(url) = capture.get(1) {
                let url = url.as_str().to_string();
                if !urls.contains(&url) {
                    urls.push(url);
                }
            }
        }
    }

    let passthrough = OPEN_URL_LINE
        .replace_all(text, "[INFO] Opening in browser: $1")
        .into_owned();

    UrlScan { urls, passthrough }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_urls_passes_through_untouched() {
        let scan = scan_chunk("compiling 3 crates...\r\n");
        assert!(scan.urls.is_empty());
        assert_eq!(scan.passthrough, "compiling 3 crates...\r\n");
    }

    #[test]
    fn test_xdg_open_detected() {
        let scan = scan_chunk("xdg-open https://example.com/auth\r\n");
        assert_eq!(scan.urls, ["https://example.com/auth"]);
    }

    #[test]
    fn test_open_url_rewritten_in_passthrough() {
        let scan = scan_chunk("OPEN_URL: https://example.com/device\r\n");
        assert_eq!(scan.urls, ["https://example.com/device"]);
        assert_eq!(
            scan.passthrough,
            "[INFO] Opening in browser: https://example.com/device\r\n"
        );
    }

    #[test]
    fn test_prose_patterns() {
        for text in [
            "Opening https://login.example.com in your browser",
            "Visit: https://login.example.com",
            "View at: https://login.example.com",
            "Browse to: https://login.example.com",
        ] {
            let scan = scan_chunk(text);
            assert!(
                scan.urls.iter().any(|u| u.starts_with("https://login")),
                "no url found in {:?}",
                text
            );
        }
    }

    #[test]
    fn test_duplicate_urls_deduplicated() {
        let scan = scan_chunk("Visit: https://a.io\r\nVisit: https://a.io\r\n");
        assert_eq!(scan.urls, ["https://a.io"]);
    }
}
