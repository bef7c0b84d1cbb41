use crate::error::CrawlError;
use encoding_rs::{Encoding, UTF_16BE, UTF_16LE, UTF_8};
use log::{debug, warn};
use regex::Regex;
use scraper::{Html, Selector};

/// Symbols written as named entities when the target charset cannot encode them
pub const HTML_ENTITIES: &[(char, &str)] = &[
    ('\u{00a0}', "&nbsp;"),
    ('©', "&copy;"),
    ('®', "&reg;"),
    ('™', "&trade;"),
    ('¢', "&cent;"),
    ('£', "&pound;"),
    ('¥', "&yen;"),
    ('€', "&euro;"),
    ('§', "&sect;"),
];

const DEFAULT_CHARSET: &str = "utf-8";

/// Character set of a page, used to decode it for rewriting and to encode the
/// rewritten text back to the same bytes-on-disk form
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Charset {
    encoding: &'static Encoding,
}

impl Charset {
    pub fn utf8() -> Self {
        Self { encoding: UTF_8 }
    }

    /// Resolve a charset label such as `gbk` or `ISO-8859-1`
    pub fn from_label(label: &str) -> Result<Self, CrawlError> {
        let encoding = Encoding::for_label(label.trim().as_bytes())
            .ok_or_else(|| CrawlError::UnsupportedCharset(label.to_string()))?;

        // A meta tag can only be read if the page is ASCII-compatible, so a
        // declared UTF-16 really means UTF-8.
        let encoding = if encoding == UTF_16LE || encoding == UTF_16BE {
            UTF_8
        } else {
            encoding
        };
        Ok(Self { encoding })
    }

    /// Detect the charset declared in the page's meta tags
    pub fn detect(body: &[u8]) -> Result<Self, CrawlError> {
        let label = detect_label(body);
        debug!("Detected charset label {:?}", label);
        Self::from_label(&label)
    }

    /// Charset of a stylesheet from its leading `@charset` rule; utf-8 when
    /// absent or unknown
    pub fn detect_css(body: &[u8]) -> Self {
        let head = String::from_utf8_lossy(&body[..body.len().min(128)]);
        let label = head
            .trim_start_matches('\u{feff}')
            .strip_prefix("@charset \"")
            .and_then(|rest| rest.split_once('"'))
            .map(|(label, _)| label);

        match label.map(Self::from_label) {
            Some(Ok(charset)) => charset,
            Some(Err(e)) => {
                warn!("{}, reading stylesheet as utf-8", e);
                Self::utf8()
            }
            None => Self::utf8(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.encoding.name()
    }

    pub fn is_canonical(&self) -> bool {
        self.encoding == UTF_8
    }

    /// Decode raw page bytes into text
    pub fn decode(&self, body: &[u8]) -> String {
        let (text, had_errors) = self.encoding.decode_without_bom_handling(body);
        if had_errors {
            warn!("Malformed {} sequences replaced while decoding", self.name());
        }
        text.into_owned()
    }

    /// Encode text back to this charset. Entity-table symbols the charset
    /// cannot represent are written as named entities, any other
    /// unrepresentable character as a numeric character reference.
    pub fn encode(&self, text: &str) -> Vec<u8> {
        if self.is_canonical() {
            return text.as_bytes().to_vec();
        }

        let text = self.replace_unsupported_entities(text);
        let (bytes, _, _) = self.encoding.encode(&text);
        bytes.into_owned()
    }

    /// Substitute the entity-table symbols this charset cannot encode
    pub fn replace_unsupported_entities(&self, text: &str) -> String {
        if self.is_canonical() {
            return text.to_string();
        }

        let unsupported: Vec<(char, &str)> = HTML_ENTITIES
            .iter()
            .copied()
            .filter(|(ch, _)| {
                let mut buf = [0u8; 4];
                let (_, _, unmappable) = self.encoding.encode(ch.encode_utf8(&mut buf));
                unmappable
            })
            .collect();

        if unsupported.is_empty() {
            return text.to_string();
        }

        let mut output = String::with_capacity(text.len());
        for ch in text.chars() {
            match unsupported.iter().find(|(symbol, _)| *symbol == ch) {
                Some((_, entity)) => output.push_str(entity),
                None => output.push(ch),
            }
        }
        output
    }
}

/// Charset label from `<meta charset>`, then `<meta http-equiv content=...>`,
/// falling back to utf-8
fn detect_label(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let document = Html::parse_document(&text);

    if let Ok(selector) = Selector::parse("meta[charset]") {
        if let Some(charset) = document
            .select(&selector)
            .filter_map(|meta| meta.value().attr("charset"))
            .map(str::trim)
            .find(|charset| !charset.is_empty())
        {
            return charset.to_string();
        }
    }

    if let (Ok(selector), Ok(pattern)) = (
        Selector::parse("meta[http-equiv]"),
        Regex::new(r#"(?i)charset\s*=\s*([^\s;"']+)"#),
    ) {
        for meta in document.select(&selector) {
            let content = meta.value().attr("content").unwrap_or_default();
            if let Some(captures) = pattern.captures(content) {
                if let Some(charset) = captures.get(1) {
                    return charset.as_str().to_string();
                }
            }
        }
    }

    DEFAULT_CHARSET.to_string()
}
