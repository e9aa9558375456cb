// URL-encoded form bodies for mutating requests.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use super::token::{AuthenticityToken, TOKEN_FIELD};

/// Characters left as-is, matching the browser's `encodeURIComponent`.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Percent-encode a single key or value.
pub fn encode_component(value: &str) -> String {
    utf8_percent_encode(value, COMPONENT).to_string()
}

/// Build `k=v&k=v` from `fields` in order, with the token appended last.
pub fn encode_form(fields: &[(&str, &str)], token: &AuthenticityToken) -> String {
    fields
        .iter()
        .copied()
        .chain(std::iter::once((TOKEN_FIELD, token.as_str())))
        .map(|(key, value)| format!("{}={}", encode_component(key), encode_component(value)))
        .collect::<Vec<_>>()
        .join("&")
}
