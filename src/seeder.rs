//! Seed-list generation: RSS feeds and Wikipedia external-link dumps.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use quick_xml::events::Event;
use quick_xml::Reader;
use rand::seq::SliceRandom;
use regex::Regex;

/// HTTP client used for feed fetching; independent from the crawler's
/// politeness machinery since seeding runs offline.
pub fn feed_client(user_agent: &str) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(user_agent)
        .timeout(Duration::from_secs(10))
        .build()
        .context("failed to build feed client")
}

/// Fetch one RSS 1.0 feed and return the text of every `<link>` element.
pub async fn fetch_rss_links(client: &reqwest::Client, url: &str) -> anyhow::Result<Vec<String>> {
    let body = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("failed to get rss: {}", url))?
        .text()
        .await
        .with_context(|| format!("failed to read rss: {}", url))?;

    rss_links(&body)
}

/// Extract `<link>` text from RSS 1.0 XML.
pub fn rss_links(xml: &str) -> anyhow::Result<Vec<String>> {
    let mut reader = Reader::from_str(xml);
    let mut urls = Vec::new();
    let mut wait_link_text = false;

    loop {
        match reader.read_event().context("failed to parse rss")? {
            Event::Start(start) => {
                wait_link_text = start.local_name().as_ref() == b"link";
            }
            Event::Text(text) => {
                if wait_link_text {
                    wait_link_text = false;
                    urls.push(text.unescape().context("failed to parse rss")?.into_owned());
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(urls)
}

/// Sample URLs from a Wikipedia `externallinks.sql` dump: one random tuple
/// per INSERT statement, skipping wikimedia self-references, PDFs and
/// protocol-relative URLs.
pub fn sample_external_links<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<String>> {
    let file = File::open(path.as_ref())
        .with_context(|| format!("failed to open {}", path.as_ref().display()))?;

    // The third column of each tuple is the link target.
    let tuple = Regex::new(r"\((\d+),(\d+),'((?:[^'\\]|\\.)*)'").expect("static regex");
    let mut rng = rand::thread_rng();
    let mut urls = Vec::new();

    // Dump lines routinely exceed BufReader's default chunking, so read
    // line-wise rather than slurping the whole file.
    for line in BufReader::new(file).lines() {
        let line = line.context("failed to read dump")?;
        if !line.trim_start().starts_with("INSERT") {
            continue;
        }

        let candidates: Vec<&str> = tuple
            .captures_iter(&line)
            .filter_map(|captures| captures.get(3).map(|m| m.as_str()))
            .collect();

        let Some(choice) = candidates.choose(&mut rng) else {
            continue;
        };
        let url = choice.replace("\\'", "'");

        if url.contains("wikimedia") || url.contains(".pdf") || url.starts_with("//") {
            continue;
        }

        urls.push(url);
    }

    Ok(urls)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn extracts_rss_links() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
<rdf:RDF xmlns="http://purl.org/rss/1.0/" xmlns:rdf="http://www.w3.org/1999/02/22-rdf-syntax-ns#">
  <channel rdf:about="http://news.example.com/">
    <title>News</title>
    <link>http://news.example.com/</link>
  </channel>
  <item><title>One</title><link>http://news.example.com/one</link></item>
  <item><title>Two</title><link>http://news.example.com/two</link></item>
</rdf:RDF>"#;

        let links = rss_links(xml).unwrap();
        assert_eq!(
            links,
            vec![
                "http://news.example.com/",
                "http://news.example.com/one",
                "http://news.example.com/two",
            ]
        );
    }

    #[test]
    fn rss_without_links_is_empty() {
        let links = rss_links(r#"<rss><channel><title>x</title></channel></rss>"#).unwrap();
        assert!(links.is_empty());
    }

    #[test]
    fn samples_one_url_per_insert_statement() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "CREATE TABLE `externallinks` (`el_from` int, `el_id` int, `el_to` blob);"
        )
        .unwrap();
        writeln!(
            file,
            "INSERT INTO `externallinks` VALUES (1,1,'http://a.example.com/x');"
        )
        .unwrap();
        writeln!(
            file,
            "INSERT INTO `externallinks` VALUES (2,2,'http://b.example.com/y');"
        )
        .unwrap();

        let urls = sample_external_links(file.path()).unwrap();
        assert_eq!(
            urls,
            vec!["http://a.example.com/x", "http://b.example.com/y"]
        );
    }

    #[test]
    fn filters_unwanted_sampled_urls() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "INSERT INTO `externallinks` VALUES (1,1,'http://upload.wikimedia.org/img');"
        )
        .unwrap();
        writeln!(
            file,
            "INSERT INTO `externallinks` VALUES (2,2,'http://example.com/doc.pdf');"
        )
        .unwrap();
        writeln!(
            file,
            "INSERT INTO `externallinks` VALUES (3,3,'//protocol-relative.example.com/');"
        )
        .unwrap();
        writeln!(
            file,
            "INSERT INTO `externallinks` VALUES (4,4,'http://keep.example.com/');"
        )
        .unwrap();

        let urls = sample_external_links(file.path()).unwrap();
        assert_eq!(urls, vec!["http://keep.example.com/"]);
    }
}
