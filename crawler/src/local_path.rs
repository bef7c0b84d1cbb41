//! Mapping from remote URLs to files under the mirror root.
//!
//! A URL maps to one logical path (unicode, rooted at `/`). The file on disk is
//! the logical path relative to the output directory; the link written into
//! documents is the logical path percent-encoded segment by segment, so a
//! static file server decodes it back to exactly the stored file.

use crate::config::host_with_port;
use crate::error::CrawlError;
use crate::models::UrlType;
use std::borrow::Cow;
use url::Url;

/// Filesystem-unsafe characters in query strings and their replacement tokens
pub const SPECIAL_CHARS: &[(char, &str)] = &[
    ('\\', "xg"),
    (':', "mh"),
    ('*', "xh"),
    ('?', "wh"),
    ('<', "xy"),
    ('>', "dy"),
    ('|', "sx"),
    (' ', "kg"),
];

/// Page extensions a static server can serve without a content-type rewrite
const SERVABLE_PAGE_EXTENSIONS: &[&str] = &[".html", ".htm", ".xhtml", ".xml"];

#[derive(Debug, Clone)]
pub struct LocalPathMapper {
    main_site: String,
}

impl LocalPathMapper {
    pub fn new(main_site: &str) -> Self {
        Self {
            main_site: main_site.to_string(),
        }
    }

    /// Root-relative link to write into a document in place of `url`
    pub fn local_link(&self, url: &Url, url_type: UrlType) -> Result<String, CrawlError> {
        let logical = self.logical_path(url, url_type)?;
        let encoded: Vec<Cow<str>> = logical
            .trim_start_matches('/')
            .split('/')
            .map(urlencoding::encode)
            .collect();
        Ok(format!("/{}", encoded.join("/")))
    }

    /// `(directory, file name)` relative to the mirror root
    pub fn local_path(&self, url: &Url, url_type: UrlType) -> Result<(String, String), CrawlError> {
        let logical = self.logical_path(url, url_type)?;
        let relative = logical.trim_start_matches('/');

        let (dir, file) = match relative.rsplit_once('/') {
            Some((dir, file)) => (dir.to_string(), file.to_string()),
            None => (String::new(), relative.to_string()),
        };

        if file.is_empty() {
            return Err(CrawlError::PathMapping(url.to_string()));
        }
        Ok((dir, file))
    }

    fn logical_path(&self, url: &Url, url_type: UrlType) -> Result<String, CrawlError> {
        let host = host_with_port(url).ok_or_else(|| CrawlError::PathMapping(url.to_string()))?;
        let index = match url_type {
            UrlType::Page => "index.html",
            UrlType::Asset => "index",
        };

        let mut path = decode(url.path());
        if path.is_empty() {
            path = format!("/{}", index);
        } else if path.ends_with('/') {
            path.push_str(index);
        }
        if !path.starts_with('/') {
            path.insert(0, '/');
        }

        if let Some(query) = url.query().filter(|q| !q.is_empty()) {
            path.push_str(special_token('?'));
            path.push_str(&replace_special_chars(&decode(query)));
        }

        if url_type == UrlType::Page && !is_servable_page(&path) {
            path.push_str(".html");
        }

        if host != self.main_site {
            path = format!("/{}{}", host.replace(':', special_token(':')), path);
        }

        if path.split('/').any(|segment| segment == ".." || segment == ".") {
            return Err(CrawlError::PathMapping(url.to_string()));
        }

        Ok(path)
    }
}

/// Replace every filesystem-unsafe character with its token
pub fn replace_special_chars(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    for ch in input.chars() {
        match SPECIAL_CHARS.iter().find(|(special, _)| *special == ch) {
            Some((_, token)) => output.push_str(token),
            None => output.push(ch),
        }
    }
    output
}

fn special_token(ch: char) -> &'static str {
    SPECIAL_CHARS
        .iter()
        .find(|(special, _)| *special == ch)
        .map(|(_, token)| *token)
        .unwrap_or("")
}

fn is_servable_page(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    SERVABLE_PAGE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// Percent-decode, keeping the raw form when the bytes are not UTF-8
fn decode(raw: &str) -> String {
    match urlencoding::decode(raw) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper() -> LocalPathMapper {
        LocalPathMapper::new("x.test")
    }

    fn link(s: &str, url_type: UrlType) -> String {
        mapper().local_link(&Url::parse(s).unwrap(), url_type).unwrap()
    }

    fn path(s: &str, url_type: UrlType) -> (String, String) {
        mapper().local_path(&Url::parse(s).unwrap(), url_type).unwrap()
    }

    #[test]
    fn empty_and_directory_paths_get_an_index() {
        assert_eq!(link("http://x.test", UrlType::Page), "/index.html");
        assert_eq!(link("http://x.test/", UrlType::Page), "/index.html");
        assert_eq!(link("http://x.test/docs/", UrlType::Page), "/docs/index.html");
        assert_eq!(link("http://x.test/static/", UrlType::Asset), "/static/index");
    }

    #[test]
    fn unservable_page_extensions_get_html_appended() {
        assert_eq!(link("http://x.test/about", UrlType::Page), "/about.html");
        assert_eq!(link("http://x.test/a.php", UrlType::Page), "/a.php.html");
        assert_eq!(link("http://x.test/a.HTM", UrlType::Page), "/a.HTM");
        assert_eq!(link("http://x.test/feed.xml", UrlType::Page), "/feed.xml");
        // Assets keep their names
        assert_eq!(link("http://x.test/app.js", UrlType::Asset), "/app.js");
    }

    #[test]
    fn query_strings_are_folded_into_the_name() {
        assert_eq!(
            link("http://x.test/list.php?page=2", UrlType::Page),
            "/list.phpwhpage%3D2.html"
        );
        assert_eq!(
            path("http://x.test/list.php?page=2", UrlType::Page),
            (String::new(), "list.phpwhpage=2.html".to_string())
        );
        assert_eq!(
            path("http://x.test/s?t=a:b|c%20d", UrlType::Asset),
            (String::new(), "swht=amhbsxckgd".to_string())
        );
        // An empty query is ignored
        assert_eq!(link("http://x.test/a.css?", UrlType::Asset), "/a.css");
    }

    #[test]
    fn cross_site_urls_live_under_their_host() {
        assert_eq!(link("http://cdn.test/logo.png", UrlType::Asset), "/cdn.test/logo.png");
        assert_eq!(
            path("http://cdn.test:8080/img/logo.png", UrlType::Asset),
            ("cdn.testmh8080/img".to_string(), "logo.png".to_string())
        );
        assert!(!link("http://cdn.test/about", UrlType::Asset).starts_with("/about"));
    }

    #[test]
    fn file_paths_are_decoded_and_links_encoded() {
        let url = "http://x.test/%E6%96%87%E6%A1%A3/a%20b.png";
        assert_eq!(
            path(url, UrlType::Asset),
            ("文档".to_string(), "a b.png".to_string())
        );
        assert_eq!(link(url, UrlType::Asset), "/%E6%96%87%E6%A1%A3/a%20b.png");
    }

    #[test]
    fn traversal_is_rejected() {
        let url = Url::parse("http://x.test/a/..%2Fetc/passwd").unwrap();
        assert!(matches!(
            mapper().local_path(&url, UrlType::Asset),
            Err(CrawlError::PathMapping(_))
        ));
    }

    #[test]
    fn nested_paths_split_into_dir_and_file() {
        assert_eq!(
            path("http://x.test/a/b/c.css", UrlType::Asset),
            ("a/b".to_string(), "c.css".to_string())
        );
        assert_eq!(
            path("http://x.test/", UrlType::Page),
            (String::new(), "index.html".to_string())
        );
    }
}
