//! HTML text extraction.
//!
//! HTML files are reduced to plain text before segmentation; the cleaned
//! text is what the compound stores, so molecule byte ranges index it.

use once_cell::sync::Lazy;
use regex::Regex;

/// Elements whose bodies are never text.
const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style"];

const BLOCK_ELEMENTS: &[&str] = &[
    "address", "article", "aside", "blockquote", "br", "dd", "div", "dl", "dt", "fieldset",
    "figcaption", "figure", "footer", "form", "h1", "h2", "h3", "h4", "h5", "h6", "header", "hr",
    "legend", "li", "main", "nav", "ol", "p", "pre", "section", "table", "tbody", "td", "th",
    "thead", "tr", "ul",
];

const ENTITIES: &[(&str, char)] = &[
    ("&amp;", '&'),
    ("&lt;", '<'),
    ("&gt;", '>'),
    ("&quot;", '"'),
    ("&#39;", '\''),
];

static TITLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title\s*>").expect("valid title regex"));
static META_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<meta\b[^>]*>").expect("valid meta regex"));
static META_KEYWORDS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\bname\s*=\s*["']keywords["']"#).expect("valid meta name regex")
});
static META_CONTENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)\bcontent\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("valid meta content regex")
});

/// Metadata pulled from an HTML document head.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HtmlMetadata {
    pub title: Option<String>,
    pub keywords: Vec<String>,
}

pub fn is_html_path(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    lower.ends_with(".html") || lower.ends_with(".htm")
}

/// Strip tags, drop `<script>`/`<style>` bodies, decode the common
/// entities and collapse whitespace runs to a single space.
pub fn clean_html(html: &str) -> String {
    // ASCII lowercasing keeps byte offsets aligned with `html`.
    let lower = html.to_ascii_lowercase();
    let mut out = String::with_capacity(html.len());
    let mut i = 0;

    while i < html.len() {
        let rest = &html[i..];

        if rest.starts_with('<') {
            let name = tag_name(&lower[i..]);
            let mut tag_end_from = i;
            if RAW_TEXT_ELEMENTS.contains(&name) {
                let close = format!("</{}", name);
                tag_end_from = lower[i..]
                    .find(&close)
                    .map(|p| i + p)
                    .unwrap_or(html.len());
            }
            i = html[tag_end_from..]
                .find('>')
                .map(|p| tag_end_from + p + 1)
                .unwrap_or(html.len());
            if BLOCK_ELEMENTS.contains(&name) {
                push_space(&mut out);
            }
            continue;
        }

        if rest.starts_with('&') {
            if let Some((entity, ch)) = ENTITIES.iter().find(|(e, _)| rest.starts_with(e)) {
                out.push(*ch);
                i += entity.len();
                continue;
            }
        }

        let Some(ch) = rest.chars().next() else {
            break;
        };
        if ch.is_whitespace() {
            push_space(&mut out);
        } else {
            out.push(ch);
        }
        i += ch.len_utf8();
    }

    out.trim().to_string()
}

pub fn extract_metadata(html: &str) -> HtmlMetadata {
    let title = TITLE_RE
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| clean_html(m.as_str()))
        .filter(|t| !t.is_empty());

    let mut keywords = Vec::new();
    for tag in META_RE.find_iter(html) {
        let tag = tag.as_str();
        if !META_KEYWORDS_RE.is_match(tag) {
            continue;
        }
        let Some(caps) = META_CONTENT_RE.captures(tag) else {
            continue;
        };
        let content = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
        for keyword in content.split(',') {
            let keyword = keyword.trim();
            if !keyword.is_empty() && !keywords.iter().any(|k| k == keyword) {
                keywords.push(keyword.to_string());
            }
        }
    }

    HtmlMetadata { title, keywords }
}

/// Lowercase element name of the tag starting at `tag[0] == '<'`; empty for
/// comments and declarations.
fn tag_name(tag: &str) -> &str {
    let body = tag[1..].trim_start_matches('/');
    let end = body
        .find(|c: char| !c.is_ascii_alphanumeric())
        .unwrap_or(body.len());
    &body[..end]
}

fn push_space(out: &mut String) {
    if !out.is_empty() && !out.ends_with(' ') {
        out.push(' ');
    }
}
