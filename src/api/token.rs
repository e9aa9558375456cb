// Anti-forgery token captured from the site's page metadata.
//
// The site renders `<meta name="csrf-token" content="...">` into every page.
// Mutating requests must echo it back as the `authenticity_token` form field.
// The token is read once and never refreshed: if the site rotates it, later
// mutating calls fail until a new token is captured.

use std::fmt;
use std::sync::LazyLock;

use regex_lite::Regex;

/// Form field name the site expects the token under.
pub const TOKEN_FIELD: &str = "authenticity_token";

/// Value of the meta tag's `name` attribute that carries the token.
pub const TOKEN_META_NAME: &str = "csrf-token";

static META_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<meta\b[^>]*>").expect("valid meta tag pattern"));

static ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)([a-z_:][-a-z0-9_:.]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>/]+))"#)
        .expect("valid attribute pattern")
});

/// Site-issued anti-forgery token. Immutable once captured.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthenticityToken(String);

impl AuthenticityToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Extract the token from a page's HTML, if the page carries one.
    pub fn from_page(html: &str) -> Option<Self> {
        META_TAG.find_iter(html).find_map(|tag| {
            let mut name = None;
            let mut content = None;
            for caps in ATTRIBUTE.captures_iter(tag.as_str()) {
                let value = caps
                    .get(2)
                    .or_else(|| caps.get(3))
                    .or_else(|| caps.get(4))
                    .map(|m| m.as_str())
                    .unwrap_or_default();
                match caps[1].to_ascii_lowercase().as_str() {
                    "name" => name = Some(value),
                    "content" => content = Some(value),
                    _ => {}
                }
            }

            match (name, content) {
                (Some(name), Some(content))
                    if name.eq_ignore_ascii_case(TOKEN_META_NAME) && !content.is_empty() =>
                {
                    Some(Self(decode_entities(content)))
                }
                _ => None,
            }
        })
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthenticityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthenticityToken(<redacted>)")
    }
}

/// Undo the handful of entities a server emits inside attribute values.
fn decode_entities(value: &str) -> String {
    if !value.contains('&') {
        return value.to_string();
    }
    value
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}
