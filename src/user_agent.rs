//! Minimal user agent parsing for `ua_based` conditions.
use std::sync::OnceLock;

use regex::Regex;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct UserAgent {
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub browser_name: Option<String>,
    pub browser_version: Option<String>,
}

struct Pattern {
    regex: Regex,
    name: &'static str,
}

fn patterns(table: &'static OnceLock<Vec<Pattern>>, src: &[(&str, &'static str)]) -> &'static [Pattern] {
    table.get_or_init(|| {
        src.iter()
            .filter_map(|(re, name)| {
                Regex::new(re)
                    .ok()
                    .map(|regex| Pattern { regex, name })
            })
            .collect()
    })
}

fn os_patterns() -> &'static [Pattern] {
    static OS: OnceLock<Vec<Pattern>> = OnceLock::new();
    patterns(
        &OS,
        &[
            (r"(?:iPhone|CPU) OS (\d+(?:[_.]\d+)*)", "iOS"),
            (r"Android (\d+(?:\.\d+)*)", "Android"),
            (r"Windows NT (\d+(?:\.\d+)*)", "Windows"),
            (r"Mac OS X (\d+(?:[_.]\d+)*)", "Mac OS X"),
            (r"CrOS \S+ (\d+(?:\.\d+)*)", "Chrome OS"),
            (r"Linux()", "Linux"),
        ],
    )
}

fn browser_patterns() -> &'static [Pattern] {
    static BROWSERS: OnceLock<Vec<Pattern>> = OnceLock::new();
    patterns(
        &BROWSERS,
        &[
            (r"Edge?/(\d+(?:\.\d+)*)", "Edge"),
            (r"OPR/(\d+(?:\.\d+)*)", "Opera"),
            (r"CriOS/(\d+(?:\.\d+)*)", "Chrome Mobile iOS"),
            (r"Chrome/(\d+(?:\.\d+)*) Mobile", "Chrome Mobile"),
            (r"Chrome/(\d+(?:\.\d+)*)", "Chrome"),
            (r"FxiOS/(\d+(?:\.\d+)*)", "Firefox iOS"),
            (r"Firefox/(\d+(?:\.\d+)*)", "Firefox"),
            (r"Version/(\d+(?:\.\d+)*) Mobile/\S+ Safari", "Mobile Safari"),
            (r"Version/(\d+(?:\.\d+)*).*Safari", "Safari"),
        ],
    )
}

fn first_match(patterns: &[Pattern], ua: &str) -> (Option<String>, Option<String>) {
    for pattern in patterns {
        if let Some(captures) = pattern.regex.captures(ua) {
            let version = captures
                .get(1)
                .map(|m| m.as_str().replace('_', "."))
                .filter(|v| !v.is_empty());
            return (Some(pattern.name.to_owned()), version);
        }
    }
    (None, None)
}

pub(crate) fn parse(ua: &str) -> UserAgent {
    let (os_name, os_version) = first_match(os_patterns(), ua);
    let (browser_name, browser_version) = first_match(browser_patterns(), ua);
    UserAgent {
        os_name,
        os_version,
        browser_name,
        browser_version,
    }
}

impl UserAgent {
    /// Look up a `ua_based` condition field.
    pub(crate) fn get(&self, field: &str) -> Option<&str> {
        match field.to_lowercase().as_str() {
            "os_name" | "osname" => self.os_name.as_deref(),
            "os_version" | "osversion" => self.os_version.as_deref(),
            "browser_name" | "browsername" => self.browser_name.as_deref(),
            "browser_version" | "browserversion" => self.browser_version.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::parse;

    #[test]
    fn parses_desktop_chrome_on_mac() {
        let ua = parse("Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.6099.109 Safari/537.36");
        assert_eq!(ua.get("os_name"), Some("Mac OS X"));
        assert_eq!(ua.get("os_version"), Some("10.15.7"));
        assert_eq!(ua.get("browser_name"), Some("Chrome"));
        assert_eq!(ua.get("browser_version"), Some("120.0.6099.109"));
    }

    #[test]
    fn parses_mobile_safari_on_ios() {
        let ua = parse("Mozilla/5.0 (iPhone; CPU iPhone OS 17_1 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Mobile/15E148 Safari/604.1");
        assert_eq!(ua.get("os_name"), Some("iOS"));
        assert_eq!(ua.get("os_version"), Some("17.1"));
        assert_eq!(ua.get("browser_name"), Some("Mobile Safari"));
        assert_eq!(ua.get("browser_version"), Some("17.1"));
    }

    #[test]
    fn parses_firefox_on_windows() {
        let ua = parse("Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0");
        assert_eq!(ua.get("os_name"), Some("Windows"));
        assert_eq!(ua.get("os_version"), Some("10.0"));
        assert_eq!(ua.get("browser_name"), Some("Firefox"));
    }

    #[test]
    fn unknown_agent_has_no_fields() {
        let ua = parse("curl/8.4.0");
        assert_eq!(ua.get("os_name"), None);
        assert_eq!(ua.get("browser_name"), None);
        assert_eq!(ua.get("unsupported"), None);
    }
}
