//! User-Agent classification for analytics.
//!
//! Derives a family ("Firefox", "cURL") and a type ("Browser", "Library",
//! "Robot") from an already-truncated User-Agent value. Patterns are checked
//! in order; the first match wins.

use once_cell::sync::Lazy;
use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAgentInfo {
    pub family: String,
    pub kind: &'static str,
}

const BROWSER: &str = "Browser";
const MOBILE_BROWSER: &str = "Mobile Browser";
const LIBRARY: &str = "Library";
const ROBOT: &str = "Robot";
const OFFLINE_BROWSER: &str = "Offline Browser";

struct Pattern {
    regex: Regex,
    /// Fixed family, or `None` to use the first capture group.
    family: Option<&'static str>,
    kind: &'static str,
}

fn pattern(re: &str, family: Option<&'static str>, kind: &'static str) -> Pattern {
    Pattern {
        regex: Regex::new(re).expect("valid regex"),
        family,
        kind,
    }
}

static PATTERNS: Lazy<Vec<Pattern>> = Lazy::new(|| {
    vec![
        // Crawlers first: many of them also claim to be Mozilla.
        pattern(r"(?i)\bGooglebot\b", Some("Googlebot"), ROBOT),
        pattern(r"(?i)\bbingbot\b", Some("Bingbot"), ROBOT),
        pattern(r"(?i)\bYandexBot\b", Some("YandexBot"), ROBOT),
        pattern(r"(?i)\bBaiduspider\b", Some("Baiduspider"), ROBOT),
        pattern(r"(?i)\bDuckDuckBot\b", Some("DuckDuckBot"), ROBOT),
        pattern(r"(?i)\b([a-z0-9_\-]*(?:bot|crawler|spider))\b", None, ROBOT),
        // HTTP libraries and command line clients
        pattern(r"^curl/", Some("cURL"), LIBRARY),
        pattern(r"(?i)^wget/", Some("Wget"), OFFLINE_BROWSER),
        pattern(r"^python-requests/", Some("Python Requests"), LIBRARY),
        pattern(r"^Python-urllib/", Some("Python-urllib"), LIBRARY),
        pattern(r"^Go-http-client/", Some("Go http package"), LIBRARY),
        pattern(r"^okhttp/", Some("OkHttp"), LIBRARY),
        pattern(r"^Java/", Some("Java"), LIBRARY),
        pattern(r"^libwww-perl/", Some("LWP"), LIBRARY),
        pattern(r"^Ruby\b", Some("Ruby"), LIBRARY),
        pattern(r"^axios/", Some("axios"), LIBRARY),
        pattern(r"^node-fetch/", Some("node-fetch"), LIBRARY),
        pattern(r"^reqwest\b", Some("reqwest"), LIBRARY),
        // Browsers, most specific tokens first
        pattern(r"\bEdgA?/", Some("Edge"), BROWSER),
        pattern(r"\b(?:OPR|Opera)/", Some("Opera"), BROWSER),
        pattern(r"\bSamsungBrowser/", Some("Samsung Internet"), MOBILE_BROWSER),
        pattern(r"\bFirefox/.*\bMobile\b", Some("Firefox Mobile"), MOBILE_BROWSER),
        pattern(r"\bFirefox/", Some("Firefox"), BROWSER),
        pattern(r"\bCriOS/", Some("Chrome Mobile iOS"), MOBILE_BROWSER),
        pattern(r"\bChrome/.*\bMobile\b", Some("Chrome Mobile"), MOBILE_BROWSER),
        pattern(r"\bChrome/", Some("Chrome"), BROWSER),
        pattern(r"\bVersion/.*\bMobile/.*\bSafari/", Some("Mobile Safari"), MOBILE_BROWSER),
        pattern(r"\bVersion/.*\bSafari/", Some("Safari"), BROWSER),
        pattern(r"\b(?:MSIE |Trident/)", Some("IE"), BROWSER),
    ]
});

/// Classify a User-Agent value. Unknown agents yield `None`.
pub fn classify(user_agent: &str) -> Option<UserAgentInfo> {
    if user_agent.is_empty() {
        return None;
    }
    PATTERNS.iter().find_map(|p| {
        let captures = p.regex.captures(user_agent)?;
        let family = match p.family {
            Some(family) => family.to_string(),
            None => captures.get(1)?.as_str().to_string(),
        };
        Some(UserAgentInfo {
            family,
            kind: p.kind,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn curl_is_a_library() {
        let info = classify("curl/7.37.1").unwrap();
        assert_eq!(info.family, "cURL");
        assert_eq!(info.kind, "Library");
    }

    #[test]
    fn browsers() {
        let chrome = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
        assert_eq!(classify(chrome).unwrap().family, "Chrome");
        let firefox = "Mozilla/5.0 (Windows NT 10.0; rv:121.0) Gecko/20100101 Firefox/121.0";
        assert_eq!(classify(firefox).unwrap().kind, "Browser");
        let iphone = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1";
        assert_eq!(classify(iphone).unwrap().family, "Mobile Safari");
    }

    #[test]
    fn crawlers() {
        let google = "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)";
        assert_eq!(classify(google).unwrap().kind, "Robot");
        let other = classify("Mozilla/5.0 (compatible; ExampleBot/1.0)").unwrap();
        assert_eq!(other.family, "ExampleBot");
    }

    #[test]
    fn unknown_agents() {
        assert!(classify("").is_none());
        assert!(classify("something-custom").is_none());
    }
}
