use std::time::Duration;

use crate::clock;
use crate::errinput;
use crate::error::Result;
use crate::hash::{self, CRC32};

/// Edge label of the multi-level trailing wildcard (`...`).
pub const WILDCARD: u32 = u32::MAX;

/// Contract applied when the caller does not supply one.
pub const DEFAULT_CONTRACT: u32 = 0x5f4d_c1a9;

/// One level of a parsed topic path. `wildchars` counts the single-level
/// wildcards that directly follow this level, so `a.*.*.b` parses to
/// `[a{wildchars:2}, b{wildchars:0}]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Part {
    pub query: u32,
    pub wildchars: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TopicKind {
    Static,
    Wildcard,
}

/// A parsed topic with its query options split off.
#[derive(Clone, Debug)]
pub struct Topic {
    pub parts: Vec<Part>,
    pub depth: u8,
    pub kind: TopicKind,
    /// Path bytes without the `?...` option suffix.
    pub path: Vec<u8>,
    /// Absolute expiry from a `ttl=` option, unix seconds.
    pub ttl: Option<u32>,
    /// Window cutoff from a `last=` option, unix seconds.
    pub last: Option<i64>,
    /// Result limit from a `limit=` option.
    pub limit: Option<usize>,
}

impl Topic {
    /// Parses `path[?kv&kv...]`. Paths are dot-separated; `*` matches one
    /// level and `...` matches any number of trailing levels. Unknown
    /// options are ignored, malformed known options are rejected.
    pub fn parse(raw: &[u8]) -> Result<Topic> {
        let raw = std::str::from_utf8(raw)
            .map_err(|_| crate::Error::InvalidInput("topic is not valid utf-8".to_string()))?;

        let (path, options) = match raw.split_once('?') {
            Some((p, o)) => (p, Some(o)),
            None => (raw, None),
        };
        if path.is_empty() {
            return errinput!("empty topic");
        }

        let mut topic = Topic {
            parts: Vec::new(),
            depth: 0,
            kind: TopicKind::Static,
            path: path.as_bytes().to_vec(),
            ttl: None,
            last: None,
            limit: None,
        };

        // The multi-level wildcard is a suffix, not a path level of its
        // own: `unit.b...` is `unit`, `b` and the trailing wildcard.
        let (body, multi) = match path.strip_suffix("...") {
            Some(body) => (body, true),
            None => (path, false),
        };

        if !body.is_empty() {
            for seg in body.split('.') {
                match seg {
                    "*" => {
                        topic.kind = TopicKind::Wildcard;
                        match topic.parts.last_mut() {
                            Some(last) if last.query != WILDCARD => last.wildchars += 1,
                            _ => {
                                return errinput!(
                                    "topic cannot begin with a single-level wildcard"
                                )
                            }
                        }
                    }
                    "" => return errinput!("empty topic level in {path:?}"),
                    literal => topic.parts.push(Part {
                        query: part_query(literal.as_bytes()),
                        wildchars: 0,
                    }),
                }
                topic.depth += 1;
            }
        }
        if multi {
            topic.parts.push(Part {
                query: WILDCARD,
                wildchars: 0,
            });
            topic.kind = TopicKind::Wildcard;
            topic.depth += 1;
        }

        if let Some(options) = options {
            topic.parse_options(options)?;
        }
        Ok(topic)
    }

    fn parse_options(&mut self, options: &str) -> Result<()> {
        for kv in options.split('&') {
            let Some((key, value)) = kv.split_once('=') else {
                continue;
            };
            match key {
                "ttl" => {
                    let d = parse_duration(value)?;
                    self.ttl = Some((clock::unix() + d.as_secs() as i64) as u32);
                }
                "last" => {
                    let d = parse_duration(value)?;
                    self.last = Some(clock::unix() - d.as_secs() as i64);
                }
                "limit" => {
                    self.limit = Some(
                        value
                            .parse()
                            .map_err(|_| crate::Error::InvalidInput(format!(
                                "invalid limit {value:?}"
                            )))?,
                    );
                }
                // Unknown parameters are ignored.
                _ => {}
            }
        }
        Ok(())
    }

    /// Digest identifying this topic under the given contract.
    pub fn hash(&self, contract: u32) -> u64 {
        hash::topic_hash(contract, &self.path)
    }

    /// Path parts as addressed in the trie: prefixed with a contract
    /// level, so lookups under one contract never cross into another's
    /// topics.
    pub fn contract_parts(&self, contract: u32) -> (Vec<Part>, u8) {
        let mut parts = Vec::with_capacity(self.parts.len() + 1);
        parts.push(Part {
            query: part_query(&contract.to_le_bytes()),
            wildchars: 0,
        });
        parts.extend_from_slice(&self.parts);
        (parts, self.depth + 1)
    }
}

/// Edge label of one literal topic level. The multi-level wildcard label is
/// reserved, so a colliding digest is nudged off it.
pub fn part_query(part: &[u8]) -> u32 {
    let h = CRC32.checksum(part);
    if h == WILDCARD {
        h - 1
    } else {
        h
    }
}

/// Parses `90`, `30s`, `15m`, `2h`, `1d` and compounds such as `1h30m`.
/// A bare integer means seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    if s.is_empty() {
        return errinput!("empty duration");
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = 0u64;
    let mut digits = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let n: u64 = digits
            .parse()
            .map_err(|_| crate::Error::InvalidInput(format!("invalid duration {s:?}")))?;
        digits.clear();
        let unit = match c {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            'd' => 86400,
            _ => return errinput!("invalid duration unit {c:?} in {s:?}"),
        };
        total += n * unit;
    }
    if !digits.is_empty() {
        return errinput!("trailing digits in duration {s:?}");
    }
    Ok(Duration::from_secs(total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_static() {
        let t = Topic::parse(b"unit1.test").unwrap();
        assert_eq!(t.kind, TopicKind::Static);
        assert_eq!(t.depth, 2);
        assert_eq!(t.parts.len(), 2);
        assert_eq!(t.path, b"unit1.test");
        assert!(t.ttl.is_none() && t.last.is_none() && t.limit.is_none());
    }

    #[test]
    fn test_parse_wildchars_collapse() {
        let t = Topic::parse(b"unit.*.b1.b11.*.*.b11111.*").unwrap();
        assert_eq!(t.kind, TopicKind::Wildcard);
        assert_eq!(t.depth, 8);
        let wildchars: Vec<u8> = t.parts.iter().map(|p| p.wildchars).collect();
        assert_eq!(wildchars, vec![1, 0, 2, 1]);
    }

    #[test]
    fn test_parse_multi_wildcard() {
        let t = Topic::parse(b"unit.b...").unwrap();
        assert_eq!(t.kind, TopicKind::Wildcard);
        assert_eq!(t.depth, 3);
        assert_eq!(t.parts.last().unwrap().query, WILDCARD);

        assert!(Topic::parse(b"unit....b").is_err());
        assert!(Topic::parse(b"*.unit").is_err());
        assert!(Topic::parse(b"unit..b").is_err());
    }

    #[test]
    fn test_parse_options() {
        let t = Topic::parse(b"unit1.test?ttl=1m&last=1h&limit=50&frob=1").unwrap();
        let now = clock::unix();
        let ttl = t.ttl.unwrap() as i64;
        assert!((ttl - now - 60).abs() <= 1);
        let last = t.last.unwrap();
        assert!((now - last - 3600).abs() <= 1);
        assert_eq!(t.limit, Some(50));
        assert_eq!(t.path, b"unit1.test");

        assert!(Topic::parse(b"unit1.test?ttl=xx").is_err());
    }

    #[test]
    fn test_duration() {
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("15m").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86400));
        assert!(parse_duration("1w").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_hash_distinguishes_wildcard_paths() {
        let a = Topic::parse(b"unit.b").unwrap();
        let b = Topic::parse(b"unit.b...").unwrap();
        assert_ne!(a.hash(1), b.hash(1));
    }
}
