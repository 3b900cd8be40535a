//! Shared text post-processing applied to model output before it is
//! surfaced to a client (§4.4, §4.8).

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref MARKDOWN_IMAGE_RE: Regex = Regex::new(r"!\[[^\]]*\]\(([^)]+)\)").expect("valid regex");
    static ref EXCESS_NEWLINES_RE: Regex = Regex::new(r"\n{3,}").expect("valid regex");
}

fn is_placeholder_host(url: &str) -> bool {
    let url = url.trim();
    url.contains("via.placeholder.com") || url.contains("placeholder.") || url.contains("example.com")
}

/// Strip markdown image references pointing at a closed set of placeholder
/// hosts (`via.placeholder.com`, `placeholder.*`, `example.com`), then
/// collapse runs of three or more newlines to two.
pub fn strip_fake_images(text: &str) -> String {
    let without_placeholders = MARKDOWN_IMAGE_RE.replace_all(text, |caps: &regex::Captures| {
        if is_placeholder_host(&caps[1]) {
            String::new()
        } else {
            caps[0].to_string()
        }
    });
    EXCESS_NEWLINES_RE.replace_all(&without_placeholders, "\n\n").into_owned()
}
