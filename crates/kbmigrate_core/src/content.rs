use std::collections::BTreeMap;
use std::sync::OnceLock;

use scraper::{Html, Selector};
use url::Url;

use crate::mapping::Locale;

/// Links and images found in an article body, in document order without duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Discovered {
    pub internal_links: Vec<String>,
    pub image_sources: Vec<String>,
}

pub fn discover(html: &str, link_host: &str) -> Discovered {
    let document = Html::parse_fragment(html);
    let mut found = Discovered::default();

    if let Ok(anchors) = Selector::parse("a[href]") {
        for element in document.select(&anchors) {
            if let Some(href) = element.value().attr("href")
                && is_internal_link(href, link_host)
                && !found.internal_links.iter().any(|known| known == href)
            {
                found.internal_links.push(href.to_string());
            }
        }
    }
    if let Ok(images) = Selector::parse("img[src]") {
        for element in document.select(&images) {
            if let Some(src) = element.value().attr("src") {
                let src = src.trim();
                if !src.is_empty() && !found.image_sources.iter().any(|known| known == src) {
                    found.image_sources.push(src.to_string());
                }
            }
        }
    }
    found
}

/// True when `href` points at `link_host` or one of its subdomains.
pub fn is_internal_link(href: &str, link_host: &str) -> bool {
    let host = link_host.trim().trim_end_matches('/').to_ascii_lowercase();
    if host.is_empty() {
        return false;
    }
    match Url::parse(href.trim()) {
        Ok(url) => url.host_str().is_some_and(|candidate| {
            let candidate = candidate.to_ascii_lowercase();
            candidate == host || candidate.ends_with(&format!(".{host}"))
        }),
        Err(_) => false,
    }
}

/// Where a rewritten internal link should point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTarget {
    pub url: String,
    pub is_published: bool,
}

/// Article markup held as a sequence of text runs and parsed tags.
///
/// Untouched segments render byte-for-byte; only tags whose attributes were
/// edited are re-serialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Markup {
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Raw(String),
    Tag(Tag),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    name: String,
    attributes: Vec<Attribute>,
    self_closing: bool,
    raw: String,
    dirty: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Attribute {
    name: String,
    value: Option<String>,
}

impl Tag {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|attribute| attribute.name.eq_ignore_ascii_case(name))
            .and_then(|attribute| attribute.value.as_deref())
    }

    pub fn set_attr(&mut self, name: &str, value: &str) {
        if self.attr(name) == Some(value) {
            return;
        }
        match self
            .attributes
            .iter_mut()
            .find(|attribute| attribute.name.eq_ignore_ascii_case(name))
        {
            Some(attribute) => attribute.value = Some(value.to_string()),
            None => self.attributes.push(Attribute {
                name: name.to_ascii_lowercase(),
                value: Some(value.to_string()),
            }),
        }
        self.dirty = true;
    }

    fn render_into(&self, out: &mut String) {
        if !self.dirty {
            out.push_str(&self.raw);
            return;
        }
        out.push('<');
        out.push_str(&self.name);
        for attribute in &self.attributes {
            out.push(' ');
            out.push_str(&attribute.name);
            if let Some(value) = &attribute.value {
                out.push_str("=\"");
                out.push_str(&escape_attribute(value));
                out.push('"');
            }
        }
        if self.self_closing {
            out.push_str(" /");
        }
        out.push('>');
    }
}

impl Markup {
    pub fn parse(html: &str) -> Self {
        let mut segments = Vec::new();
        let mut text_start = 0;
        let mut cursor = 0;
        let bytes = html.as_bytes();

        while let Some(offset) = html[cursor..].find('<') {
            let start = cursor + offset;
            let next = bytes.get(start + 1).copied();
            let consumed = match next {
                Some(byte) if byte.is_ascii_alphabetic() => {
                    parse_start_tag(&html[start..]).map(|(tag, len)| (Some(tag), len))
                }
                Some(b'!') if html[start..].starts_with("<!--") => Some((
                    None,
                    html[start..]
                        .find("-->")
                        .map(|end| end + 3)
                        .unwrap_or(html.len() - start),
                )),
                Some(b'/') | Some(b'!') | Some(b'?') => Some((
                    None,
                    html[start..]
                        .find('>')
                        .map(|end| end + 1)
                        .unwrap_or(html.len() - start),
                )),
                _ => None,
            };

            let Some((tag, len)) = consumed else {
                cursor = start + 1;
                continue;
            };
            let Some(tag) = tag else {
                cursor = start + len;
                continue;
            };

            if text_start < start {
                segments.push(Segment::Raw(html[text_start..start].to_string()));
            }
            let raw_text_element = matches!(tag.name.as_str(), "script" | "style");
            let element_name = tag.name.clone();
            segments.push(Segment::Tag(tag));
            cursor = start + len;
            text_start = cursor;

            if raw_text_element {
                let closing = format!("</{element_name}");
                let rest = html[cursor..].to_ascii_lowercase();
                cursor = rest
                    .find(&closing)
                    .map(|index| cursor + index)
                    .unwrap_or(html.len());
            }
        }
        if text_start < html.len() {
            segments.push(Segment::Raw(html[text_start..].to_string()));
        }
        Self { segments }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Raw(text) => out.push_str(text),
                Segment::Tag(tag) => tag.render_into(&mut out),
            }
        }
        out
    }

    pub fn tags_mut<'a>(&'a mut self, name: &'a str) -> impl Iterator<Item = &'a mut Tag> + 'a {
        self.segments.iter_mut().filter_map(move |segment| match segment {
            Segment::Tag(tag) if tag.name.eq_ignore_ascii_case(name) => Some(tag),
            _ => None,
        })
    }

    pub fn tags<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Tag> + 'a {
        self.segments.iter().filter_map(move |segment| match segment {
            Segment::Tag(tag) if tag.name.eq_ignore_ascii_case(name) => Some(tag),
            _ => None,
        })
    }

    /// Point every `<img>` whose `src` is a key of `relocated` at its new location.
    pub fn rewrite_image_sources(&mut self, relocated: &BTreeMap<String, String>) -> usize {
        let mut changed = 0;
        for tag in self.tags_mut("img") {
            let Some(target) = tag.attr("src").and_then(|src| relocated.get(src.trim())) else {
                continue;
            };
            let target = target.clone();
            tag.set_attr("src", &target);
            changed += 1;
        }
        changed
    }

    /// Rewrite anchors whose `href` is a key of `targets`. Links to unpublished
    /// targets get a draft notice appended to their title.
    pub fn rewrite_links(&mut self, targets: &BTreeMap<String, LinkTarget>, locale: Locale) -> usize {
        let mut changed = 0;
        for tag in self.tags_mut("a") {
            let Some(target) = tag.attr("href").and_then(|href| targets.get(href)) else {
                continue;
            };
            let target = target.clone();
            tag.set_attr("href", &target.url);
            if !target.is_published {
                let notice = locale.draft_notice();
                let title = match tag.attr("title").map(str::trim) {
                    Some(existing) if existing.contains(notice) => existing.to_string(),
                    Some(existing) if !existing.is_empty() => format!("{existing} ({notice})"),
                    _ => notice.to_string(),
                };
                tag.set_attr("title", &title);
            }
            changed += 1;
        }
        changed
    }
}

fn parse_start_tag(input: &str) -> Option<(Tag, usize)> {
    let bytes = input.as_bytes();
    let mut index = 1;
    while index < bytes.len() && is_name_byte(bytes[index]) {
        index += 1;
    }
    let name = input[1..index].to_ascii_lowercase();
    let mut attributes = Vec::new();
    let mut self_closing = false;

    loop {
        while index < bytes.len() && bytes[index].is_ascii_whitespace() {
            index += 1;
        }
        let byte = *bytes.get(index)?;
        if byte == b'>' {
            index += 1;
            break;
        }
        if byte == b'/' {
            self_closing = true;
            index += 1;
            continue;
        }
        self_closing = false;

        let name_start = index;
        while index < bytes.len()
            && !bytes[index].is_ascii_whitespace()
            && !matches!(bytes[index], b'=' | b'>' | b'/')
        {
            index += 1;
        }
        if name_start == index {
            index += 1;
            continue;
        }
        let attribute_name = input[name_start..index].to_ascii_lowercase();

        while index < bytes.len() && bytes[index].is_ascii_whitespace() {
            index += 1;
        }
        let mut value = None;
        if bytes.get(index) == Some(&b'=') {
            index += 1;
            while index < bytes.len() && bytes[index].is_ascii_whitespace() {
                index += 1;
            }
            match bytes.get(index) {
                Some(&quote) if quote == b'"' || quote == b'\'' => {
                    let value_start = index + 1;
                    let end = input[value_start..].find(quote as char)? + value_start;
                    value = Some(decode_attribute(&input[value_start..end]));
                    index = end + 1;
                }
                Some(_) => {
                    let value_start = index;
                    while index < bytes.len()
                        && !bytes[index].is_ascii_whitespace()
                        && bytes[index] != b'>'
                    {
                        index += 1;
                    }
                    value = Some(decode_attribute(&input[value_start..index]));
                }
                None => return None,
            }
        }
        attributes.push(Attribute {
            name: attribute_name,
            value,
        });
    }

    Some((
        Tag {
            name,
            attributes,
            self_closing,
            raw: input[..index].to_string(),
            dirty: false,
        },
        index,
    ))
}

fn is_name_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b':')
}

fn escape_attribute(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Resolve character references in an attribute value with the same parser
/// `discover` reads documents with, so both agree on every URL.
fn decode_attribute(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }
    let quote = if raw.contains('"') { '\'' } else { '"' };
    let fragment = Html::parse_fragment(&format!("<span data-value={quote}{raw}{quote}></span>"));
    value_holder()
        .and_then(|selector| fragment.select(selector).next())
        .and_then(|element| element.value().attr("data-value"))
        .map(ToString::to_string)
        .unwrap_or_else(|| raw.to_string())
}

fn value_holder() -> Option<&'static Selector> {
    static SELECTOR: OnceLock<Option<Selector>> = OnceLock::new();
    SELECTOR
        .get_or_init(|| Selector::parse("span[data-value]").ok())
        .as_ref()
}
