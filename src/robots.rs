//! robots.txt parsing and path-pattern matching.
//!
//! A parsed file holds up to three rule groups: one for the primary
//! user-agent, one for the secondary user-agent and the anonymous (`*`)
//! group. Group selection prefers primary, then secondary, then anonymous.

use std::collections::HashMap;

use thiserror::Error;

/// Lines longer than this are dropped without parsing.
const MAX_LINE_LEN: usize = 2000;
/// Crawl interval applied when a group carries no crawl-delay.
const DEFAULT_DELAY_SECS: u64 = 60;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("invalid path pattern")]
    Invalid,
}

/// A single `Allow`/`Disallow` pattern: must begin with `/`, `*` matches any
/// run of bytes, a terminal `$` anchors at end-of-path. Matching is
/// case-sensitive and byte-oriented.
#[derive(Debug, Clone)]
pub struct PathPattern(Vec<u8>);

impl PathPattern {
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        let bytes = pattern.as_bytes();
        if bytes.is_empty() || bytes[0] != b'/' {
            return Err(PatternError::Invalid);
        }
        Ok(Self(bytes.to_vec()))
    }

    pub fn matches(&self, path: &str) -> bool {
        let pattern = &self.0;
        // A NUL sentinel marks end-of-path so `$` can be matched like any
        // other byte.
        let mut bytes = path.as_bytes().to_vec();
        bytes.push(0);

        let mut pi = 0;
        let mut si = 0;

        loop {
            if pattern[pi] == b'*' {
                while pi < pattern.len() && pattern[pi] == b'*' {
                    pi += 1;
                }
                if pi == pattern.len() {
                    return true;
                }

                while si < bytes.len() && bytes[si] != pattern[pi] {
                    si += 1;
                }
                if si == bytes.len() {
                    return false;
                }
            } else if pattern[pi] == b'$' && bytes[si] == 0 {
                return true;
            } else if pattern[pi] == bytes[si] {
                pi += 1;
                si += 1;

                if pi == pattern.len() {
                    return true;
                }
                if si == bytes.len() {
                    return false;
                }
            } else {
                return false;
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Group {
    allowed: Vec<PathPattern>,
    disallowed: Vec<PathPattern>,
    delay: Option<u64>,
}

impl Group {
    fn allows(&self, path: &str) -> bool {
        !self.disallowed.iter().any(|p| p.matches(path))
            || self.allowed.iter().any(|p| p.matches(path))
    }
}

/// One parsed robots.txt.
#[derive(Debug, Clone)]
pub struct RobotsTxt {
    primary_ua: String,
    secondary_ua: String,
    anonymous: Group,
    named: HashMap<String, Group>,
}

impl RobotsTxt {
    /// Parse robots.txt content. Unknown fields, malformed lines, comments
    /// and over-long lines are skipped; parsing never fails.
    pub fn parse(content: &str, primary_ua: &str, secondary_ua: &str) -> Self {
        let mut txt = Self {
            primary_ua: primary_ua.to_lowercase(),
            secondary_ua: secondary_ua.to_lowercase(),
            anonymous: Group::default(),
            named: HashMap::new(),
        };

        // Entries before the first user-agent line accrue to the anonymous
        // group; the named map takes over afterwards.
        let mut current: Option<String> = None;

        for raw in content.lines() {
            if raw.len() > MAX_LINE_LEN {
                continue;
            }

            let line = raw.trim_matches([' ', '\t']);
            if line.starts_with('#') {
                continue;
            }

            let mut tokens = line.split(':');
            let (field, value) = match (tokens.next(), tokens.next(), tokens.next()) {
                (Some(f), Some(v), None) => (
                    f.trim_matches([' ', '\t']).to_lowercase(),
                    v.trim_matches([' ', '\t']),
                ),
                _ => continue,
            };

            match field.as_str() {
                "user-agent" => {
                    // Redeclaring a user-agent starts that group over; only
                    // the last block for a name counts.
                    let name = value.to_lowercase();
                    txt.named.insert(name.clone(), Group::default());
                    current = Some(name);
                }

                "allow" => {
                    if let Ok(pattern) = PathPattern::new(value) {
                        txt.group_mut(&current).allowed.push(pattern);
                    }
                }

                "disallow" => {
                    if let Ok(pattern) = PathPattern::new(value) {
                        txt.group_mut(&current).disallowed.push(pattern);
                    }
                }

                "crawl-delay" => {
                    if let Ok(delay) = value.parse::<i64>() {
                        let group = txt.group_mut(&current);
                        if delay > 0 && delay as u64 > group.delay.unwrap_or(0) {
                            group.delay = Some(delay as u64);
                        }
                    }
                }

                _ => {}
            }
        }

        txt
    }

    /// A permissive default used when no effective robots.txt exists:
    /// everything is allowed, delay is the default.
    pub fn permissive(primary_ua: &str, secondary_ua: &str) -> Self {
        Self::parse("", primary_ua, secondary_ua)
    }

    /// Whether crawling `path` is allowed. An explicit `Allow` overrides any
    /// matching `Disallow`.
    pub fn allows(&self, path: &str) -> bool {
        self.select_group().allows(path)
    }

    /// Crawl interval in seconds requested by the effective group.
    pub fn delay(&self) -> u64 {
        self.select_group().delay.unwrap_or(DEFAULT_DELAY_SECS)
    }

    fn select_group(&self) -> &Group {
        self.named
            .get(&self.primary_ua)
            .or_else(|| self.named.get(&self.secondary_ua))
            .or_else(|| self.named.get("*"))
            .unwrap_or(&self.anonymous)
    }

    fn group_mut(&mut self, current: &Option<String>) -> &mut Group {
        match current {
            Some(name) => self.named.get_mut(name).expect("current group exists"),
            None => &mut self.anonymous,
        }
    }
}
