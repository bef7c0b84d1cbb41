use crate::config::{host_with_port, Config};
use crate::models::UrlType;
use log::debug;
use regex::Regex;
use url::Url;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "png", "bmp", "jpeg", "gif", "webp"];
const FONT_EXTENSIONS: &[&str] = &["ttf", "woff", "woff2", "otf", "eot"];

/// Admission filter for discovered URLs
///
/// Pure function of the URL, its role and the configuration it was built from.
#[derive(Debug, Clone)]
pub struct ScopePolicy {
    main_site: String,
    outsite_asset: bool,
    no_js: bool,
    no_css: bool,
    no_images: bool,
    no_fonts: bool,
    black_list: Vec<Regex>,
}

impl ScopePolicy {
    pub fn new(config: &Config) -> Self {
        Self {
            main_site: config.main_site.clone(),
            outsite_asset: config.outsite_asset,
            no_js: config.no_js,
            no_css: config.no_css,
            no_images: config.no_images,
            no_fonts: config.no_fonts,
            black_list: config.black_list_patterns.clone(),
        }
    }

    /// Decide whether `url` should be mirrored in the given role.
    /// Rules are evaluated in order and the first rejection wins.
    pub fn admit(&self, url: &Url, url_type: UrlType) -> bool {
        let same_site = host_with_port(url).as_deref() == Some(self.main_site.as_str());

        if url_type == UrlType::Page && !same_site {
            debug!("Skipping off-site page: {}", url);
            return false;
        }

        if url_type == UrlType::Asset {
            if !same_site && !self.outsite_asset {
                debug!("Skipping off-site asset: {}", url);
                return false;
            }

            let extension = extension_of(url);
            let extension = extension.as_deref();

            if self.no_js && extension == Some("js") {
                debug!("Skipping js asset: {}", url);
                return false;
            }
            if self.no_css && extension == Some("css") {
                debug!("Skipping css asset: {}", url);
                return false;
            }
            if self.no_images && extension.map_or(false, |ext| IMAGE_EXTENSIONS.contains(&ext)) {
                debug!("Skipping image asset: {}", url);
                return false;
            }
            if self.no_fonts && extension.map_or(false, |ext| FONT_EXTENSIONS.contains(&ext)) {
                debug!("Skipping font asset: {}", url);
                return false;
            }
        }

        if self.black_list.iter().any(|pattern| pattern.is_match(url.as_str())) {
            debug!("Skipping black-listed url: {}", url);
            return false;
        }

        true
    }
}

/// Lower-cased extension of the last path segment, if it has one
fn extension_of(url: &Url) -> Option<String> {
    let segment = url.path().rsplit('/').next()?;
    let (_, ext) = segment.rsplit_once('.')?;
    if ext.is_empty() {
        None
    } else {
        Some(ext.to_ascii_lowercase())
    }
}
