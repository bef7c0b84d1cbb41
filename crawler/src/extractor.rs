use crate::error::CrawlError;
use crate::local_path::LocalPathMapper;
use crate::models::{UrlTask, UrlType};
use crate::scope::ScopePolicy;
use lol_html::html_content::Element;
use lol_html::{element, rewrite_str, RewriteStrSettings};
use log::debug;
use regex::Regex;
use std::cell::RefCell;
use url::Url;

/// Output of a rewrite: the document with its references pointing at the
/// mirror, and the tasks discovered along the way
#[derive(Debug, Default)]
pub struct Rewritten {
    pub text: String,
    pub discovered: Vec<UrlTask>,
}

/// Finds references in HTML and CSS, rewrites admitted ones to local links
/// and turns them into child tasks
#[derive(Debug, Clone)]
pub struct LinkRewriter {
    scope: ScopePolicy,
    mapper: LocalPathMapper,
    non_fetchable: Regex,
    css_url: Regex,
}

impl LinkRewriter {
    pub fn new(scope: ScopePolicy, mapper: LocalPathMapper) -> Result<Self, CrawlError> {
        let non_fetchable = Regex::new(r"(?i)(^data:)|(^mailto:)|(about:blank)|(javascript:)")
            .map_err(|e| CrawlError::Rewrite(e.to_string()))?;
        let css_url = Regex::new(r#"url\(\s*(?:'([^']*)'|"([^"]*)"|([^)'"]*))\s*\)"#)
            .map_err(|e| CrawlError::Rewrite(e.to_string()))?;

        Ok(Self {
            scope,
            mapper,
            non_fetchable,
            css_url,
        })
    }

    /// Rewrite `a[href]` (when `follow_pages`), `link[href]`, `script[src]` and
    /// `img[src]` in a page fetched for `task`
    pub fn rewrite_html(&self, html: &str, task: &UrlTask, follow_pages: bool) -> Result<Rewritten, CrawlError> {
        let base = parse_base(task)?;
        let discovered = RefCell::new(Vec::new());

        let text = rewrite_str(
            html,
            RewriteStrSettings {
                element_content_handlers: vec![
                    element!("a[href]", |el| {
                        if !follow_pages {
                            return Ok(());
                        }
                        if let Some(value) = attribute(el, "href") {
                            if let Some((link, child)) = self.resolve(&value, UrlType::Page, &base, task) {
                                el.set_attribute("href", &link)?;
                                discovered.borrow_mut().push(child);
                            }
                        }
                        Ok(())
                    }),
                    element!("link[href]", |el| {
                        if let Some(value) = attribute(el, "href") {
                            if let Some((link, child)) = self.resolve(&value, UrlType::Asset, &base, task) {
                                el.set_attribute("href", &link)?;
                                discovered.borrow_mut().push(child);
                            }
                        }
                        Ok(())
                    }),
                    element!("script[src]", |el| {
                        if let Some(value) = attribute(el, "src") {
                            if let Some((link, child)) = self.resolve(&value, UrlType::Asset, &base, task) {
                                el.set_attribute("src", &link)?;
                                discovered.borrow_mut().push(child);
                            }
                        }
                        Ok(())
                    }),
                    element!("img[src]", |el| {
                        if let Some(value) = attribute(el, "src") {
                            if let Some((link, child)) = self.resolve(&value, UrlType::Asset, &base, task) {
                                el.set_attribute("src", &link)?;
                                discovered.borrow_mut().push(child);
                            }
                        }
                        Ok(())
                    }),
                ],
                ..RewriteStrSettings::default()
            },
        )
        .map_err(|e| CrawlError::Rewrite(format!("{}: {}", task.url, e)))?;

        Ok(Rewritten {
            text,
            discovered: discovered.into_inner(),
        })
    }

    /// Rewrite every `url(...)` reference in a stylesheet fetched for `task`.
    /// Only the captured URL inside each match is replaced.
    pub fn rewrite_css(&self, css: &str, task: &UrlTask) -> Result<Rewritten, CrawlError> {
        let base = parse_base(task)?;
        let mut text = String::with_capacity(css.len());
        let mut discovered = Vec::new();
        let mut last = 0;

        for captures in self.css_url.captures_iter(css) {
            let Some(reference) = captures.get(1).or_else(|| captures.get(2)).or_else(|| captures.get(3)) else {
                continue;
            };
            let Some((link, child)) = self.resolve(reference.as_str(), UrlType::Asset, &base, task) else {
                continue;
            };

            text.push_str(&css[last..reference.start()]);
            text.push_str(&link);
            last = reference.end();
            discovered.push(child);
        }
        text.push_str(&css[last..]);

        Ok(Rewritten { text, discovered })
    }

    /// Resolve one reference against the document URL. Returns the local link
    /// to write in its place and the task to enqueue, or `None` to leave the
    /// reference untouched.
    fn resolve(&self, raw: &str, url_type: UrlType, base: &Url, parent: &UrlTask) -> Option<(String, UrlTask)> {
        let value = raw.trim();
        if value.is_empty() || self.non_fetchable.is_match(value) {
            return None;
        }

        let absolute = match base.join(value) {
            Ok(url) => url,
            Err(e) => {
                debug!("Cannot resolve {:?} against {}: {}", value, base, e);
                return None;
            }
        };
        if absolute.scheme() != "http" && absolute.scheme() != "https" {
            return None;
        }

        let mut stripped = absolute.clone();
        stripped.set_fragment(None);

        if !self.scope.admit(&stripped, url_type) {
            return None;
        }

        let mut link = match self.mapper.local_link(&stripped, url_type) {
            Ok(link) => link,
            Err(e) => {
                debug!("Leaving {} untouched: {}", stripped, e);
                return None;
            }
        };
        if let Some(fragment) = absolute.fragment() {
            link.push('#');
            link.push_str(fragment);
        }

        let child = UrlTask::child_of(parent, stripped.to_string(), url_type);
        Some((link, child))
    }
}

/// Attribute value with its character references decoded
fn attribute(el: &Element, name: &str) -> Option<String> {
    el.get_attribute(name)
        .map(|raw| html_escape::decode_html_entities(&raw).into_owned())
}

fn parse_base(task: &UrlTask) -> Result<Url, CrawlError> {
    Url::parse(&task.url).map_err(|e| CrawlError::Rewrite(format!("invalid document url {}: {}", task.url, e)))
}
