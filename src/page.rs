//! Streaming HTML extraction: first title, robots meta directives and
//! outbound links.

use std::cell::{Cell, RefCell};

use lol_html::html_content::Element;
use lol_html::{element, text, HtmlRewriter, Settings};
use thiserror::Error;

use crate::sanitized_url::SanitizedUrl;

/// Attributes beyond this index are ignored when inspecting a tag.
const MAX_ATTRS_PER_TAG: usize = 100;

#[derive(Debug, Error)]
pub enum PageError {
    #[error("failed to parse html: {0}")]
    Parse(String),
}

/// The parts of a fetched document the crawler cares about.
#[derive(Debug, Clone)]
pub struct Page {
    title: String,
    no_index: bool,
    no_follow: bool,
    urls: Vec<SanitizedUrl>,
}

impl Page {
    /// Tokenize `body` and extract title, robots directives and links.
    /// Links resolve against `base_url`; anything that fails sanitization is
    /// dropped silently.
    pub fn parse(base_url: &SanitizedUrl, body: &[u8]) -> Result<Page, PageError> {
        let title = RefCell::new(String::new());
        let titles_seen = Cell::new(0u32);
        let no_index = Cell::new(false);
        let no_follow = Cell::new(false);
        let urls = RefCell::new(Vec::new());

        let mut rewriter = HtmlRewriter::new(
            Settings {
                element_content_handlers: vec![
                    element!("title", |_el| {
                        titles_seen.set(titles_seen.get() + 1);
                        Ok(())
                    }),
                    text!("title", |t| {
                        if titles_seen.get() == 1 {
                            title.borrow_mut().push_str(t.as_str());
                        }
                        Ok(())
                    }),
                    element!("meta", |el| {
                        let name = capped_attr(el, "name").unwrap_or_default();
                        if name.to_lowercase() != "robots" {
                            return Ok(());
                        }

                        let content = capped_attr(el, "content")
                            .unwrap_or_default()
                            .to_lowercase();
                        if content.contains("noindex") {
                            no_index.set(true);
                        }
                        if content.contains("nofollow") {
                            no_follow.set(true);
                        }
                        Ok(())
                    }),
                    element!("a", |el| {
                        if let Some(url) = extract_link(base_url, el) {
                            urls.borrow_mut().push(url);
                        }
                        Ok(())
                    }),
                ],
                ..Settings::default()
            },
            |_: &[u8]| {},
        );

        rewriter
            .write(body)
            .and_then(|_| rewriter.end())
            .map_err(|e| PageError::Parse(e.to_string()))?;

        Ok(Page {
            title: title.into_inner().trim().to_string(),
            no_index: no_index.get(),
            no_follow: no_follow.get(),
            urls: urls.into_inner(),
        })
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn no_index(&self) -> bool {
        self.no_index
    }

    /// Links found in the document, in order. Empty when the page carried a
    /// `nofollow` directive.
    pub fn all_urls(&self) -> &[SanitizedUrl] {
        if self.no_follow {
            &[]
        } else {
            &self.urls
        }
    }
}

/// Attribute lookup honoring the per-tag attribute cap.
fn capped_attr(el: &Element, name: &str) -> Option<String> {
    el.attributes()
        .iter()
        .take(MAX_ATTRS_PER_TAG)
        .find(|a| a.name() == name)
        .map(|a| a.value().trim_matches(' ').to_string())
}

fn extract_link(base_url: &SanitizedUrl, el: &Element) -> Option<SanitizedUrl> {
    if let Some(rel) = capped_attr(el, "rel") {
        if rel.to_lowercase() == "nofollow" {
            return None;
        }
    }

    let href = capped_attr(el, "href")?;
    base_url.join(&href).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> SanitizedUrl {
        SanitizedUrl::parse("http://example.com/dir/page.html").unwrap()
    }

    fn parse(html: &str) -> Page {
        Page::parse(&base(), html.as_bytes()).unwrap()
    }

    #[test]
    fn extracts_title() {
        let page = parse("<html><head><title>Hello World</title></head></html>");
        assert_eq!(page.title(), "Hello World");
    }

    #[test]
    fn first_title_wins() {
        let page = parse("<title>first</title><title>second</title>");
        assert_eq!(page.title(), "first");
    }

    #[test]
    fn missing_title_is_empty() {
        let page = parse("<p>no title here</p>");
        assert_eq!(page.title(), "");
    }

    #[test]
    fn extracts_links_in_order() {
        let page = parse(
            r#"<a href="/a">a</a><a href="b.html">b</a><a href="http://other.com/c">c</a>"#,
        );
        let urls: Vec<&str> = page.all_urls().iter().map(|u| u.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "http://example.com/a",
                "http://example.com/dir/b.html",
                "http://other.com/c",
            ]
        );
    }

    #[test]
    fn drops_unsanitizable_links_silently() {
        let page = parse(
            r#"<a href="ftp://files.example.com/x">ftp</a>
               <a href="mailto:x@example.com">mail</a>
               <a href="/valid">ok</a>"#,
        );
        let urls: Vec<&str> = page.all_urls().iter().map(|u| u.as_str()).collect();
        assert_eq!(urls, vec!["http://example.com/valid"]);
    }

    #[test]
    fn anchor_without_href_is_ignored() {
        let page = parse(r#"<a name="top">anchor</a>"#);
        assert!(page.all_urls().is_empty());
    }

    #[test]
    fn rel_nofollow_links_are_skipped() {
        let page = parse(r#"<a href="/a" rel="nofollow">a</a><a href="/b" rel="NoFollow">b</a><a href="/c">c</a>"#);
        let urls: Vec<&str> = page.all_urls().iter().map(|u| u.as_str()).collect();
        assert_eq!(urls, vec!["http://example.com/c"]);
    }

    #[test]
    fn meta_robots_noindex() {
        let page = parse(r#"<meta name="robots" content="noindex"><a href="/a">a</a>"#);
        assert!(page.no_index());
        assert_eq!(page.all_urls().len(), 1);
    }

    #[test]
    fn meta_robots_nofollow_hides_links() {
        let page = parse(r#"<meta name="robots" content="NOFOLLOW"><a href="/a">a</a>"#);
        assert!(!page.no_index());
        assert!(page.all_urls().is_empty());
    }

    #[test]
    fn meta_robots_combined_directives() {
        let page = parse(r#"<meta name="ROBOTS" content="noindex, nofollow">"#);
        assert!(page.no_index());
        assert!(page.all_urls().is_empty());
    }

    #[test]
    fn unrelated_meta_is_ignored() {
        let page = parse(r#"<meta name="description" content="noindex nofollow">"#);
        assert!(!page.no_index());
    }

    #[test]
    fn attributes_beyond_cap_are_ignored() {
        let mut padded = String::from("<a ");
        for i in 0..MAX_ATTRS_PER_TAG {
            padded.push_str(&format!("data-x{}=\"1\" ", i));
        }
        padded.push_str(r#"href="/late">late</a>"#);

        let page = parse(&padded);
        assert!(page.all_urls().is_empty());

        let page = parse(r#"<a data-x="1" href="/early">early</a>"#);
        assert_eq!(page.all_urls().len(), 1);
    }
}
