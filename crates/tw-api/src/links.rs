//! RFC-5988 style `Link` header parsing.
//!
//! Responses carry navigation metadata as `<href>; rel="name"` values,
//! possibly several per header, comma separated. URLs are opaque: callers
//! never derive one link from another.

use std::collections::HashMap;

/// Well-known link relations used by the optimizer API.
pub const REL_SELF: &str = "self";
pub const REL_NEXT: &str = "next";
pub const REL_PREV: &str = "prev";
pub const REL_TRIALS: &str = "https://tunewise.io/rel/trials";
pub const REL_NEXT_TRIAL: &str = "https://tunewise.io/rel/next-trial";

/// Parse one `Link` header value into a relation → URL map. Malformed
/// segments are skipped.
pub fn parse_link_header(value: &str) -> HashMap<String, String> {
    let mut links = HashMap::new();
    for segment in split_links(value) {
        let mut parts = segment.split(';');
        let href = match parts.next().map(str::trim) {
            Some(h) if h.starts_with('<') && h.ends_with('>') => {
                h[1..h.len() - 1].to_string()
            }
            _ => continue,
        };
        for param in parts {
            let Some((key, raw)) = param.split_once('=') else {
                continue;
            };
            if key.trim() != "rel" {
                continue;
            }
            let rel = raw.trim().trim_matches('"');
            if !rel.is_empty() {
                links.insert(rel.to_string(), href.clone());
            }
        }
    }
    links
}

/// Merge several `Link` header values into one relation map.
pub fn parse_link_headers<'a>(values: impl Iterator<Item = &'a str>) -> HashMap<String, String> {
    let mut links = HashMap::new();
    for value in values {
        links.extend(parse_link_header(value));
    }
    links
}

// Split on commas that separate link-values, not commas inside `<...>`.
fn split_links(value: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in value.char_indices() {
        match c {
            '<' => depth += 1,
            '>' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                segments.push(&value[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    segments.push(&value[start..]);
    segments
}
