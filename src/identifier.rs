//! Hierarchical slash-separated identifiers
//!
//! Identifiers are the persistence key for user settings, so the same physical
//! sensor must produce the same path on every run, e.g.
//! `/intelcpu/0/temperature/2`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Slash-separated hierarchical path, ordered lexicographically
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(String);

const SEPARATOR: char = '/';

fn escape(segment: &str) -> String {
    segment.replace('%', "%25").replace(SEPARATOR, "%2F")
}

fn unescape(segment: &str) -> String {
    segment.replace("%2F", "/").replace("%25", "%")
}

impl Identifier {
    /// Build an identifier from root-level segments
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut id = Identifier(String::new());
        for segment in segments {
            id.push(segment.as_ref());
        }
        if id.0.is_empty() {
            id.0.push(SEPARATOR);
        }
        id
    }

    /// The root identifier `/`
    pub fn root() -> Self {
        Identifier(SEPARATOR.to_string())
    }

    fn push(&mut self, segment: &str) {
        if self.0.len() == 1 {
            // root
            self.0.clear();
        }
        self.0.push(SEPARATOR);
        self.0.push_str(&escape(segment));
    }

    /// Compose a child identifier
    pub fn child(&self, segment: impl fmt::Display) -> Self {
        let mut id = self.clone();
        id.push(&segment.to_string());
        id
    }

    /// Compose a child identifier from several segments
    pub fn join<I, S>(&self, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: fmt::Display,
    {
        let mut id = self.clone();
        for segment in segments {
            id.push(&segment.to_string());
        }
        id
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Unescaped path segments
    pub fn segments(&self) -> Vec<String> {
        self.0
            .split(SEPARATOR)
            .filter(|s| !s.is_empty())
            .map(unescape)
            .collect()
    }

    pub fn parent(&self) -> Option<Identifier> {
        let pos = self.0.rfind(SEPARATOR)?;
        if self.0.len() == 1 {
            return None;
        }
        if pos == 0 {
            return Some(Identifier::root());
        }
        Some(Identifier(self.0[..pos].to_string()))
    }

    pub fn is_descendant_of(&self, other: &Identifier) -> bool {
        if other.0.len() == 1 {
            return self.0.len() > 1;
        }
        self.0.len() > other.0.len()
            && self.0.starts_with(&other.0)
            && self.0[other.0.len()..].starts_with(SEPARATOR)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose() {
        let cpu = Identifier::new(["intelcpu", "0"]);
        let temp = cpu.join(["temperature", "2"]);
        assert_eq!(temp.to_string(), "/intelcpu/0/temperature/2");
        assert_eq!(Identifier::root().child("ram").as_str(), "/ram");
        assert_eq!(Identifier::new(Vec::<String>::new()).as_str(), "/");
    }

    #[test]
    fn test_escaping_is_total() {
        let id = Identifier::new(["hdd"]).child("a/b%c");
        assert_eq!(id.as_str(), "/hdd/a%2Fb%25c");
        assert_eq!(id.segments(), vec!["hdd".to_string(), "a/b%c".to_string()]);
    }

    #[test]
    fn test_parent_and_descendant() {
        let id = Identifier::new(["lpc", "nct6798d", "0", "fan", "1"]);
        let parent = id.parent().unwrap();
        assert_eq!(parent.as_str(), "/lpc/nct6798d/0/fan");
        assert!(id.is_descendant_of(&parent));
        assert!(!parent.is_descendant_of(&id));
        assert!(!Identifier::new(["lpcx"]).is_descendant_of(&Identifier::new(["lpc"])));
        assert_eq!(Identifier::new(["ram"]).parent(), Some(Identifier::root()));
        assert_eq!(Identifier::root().parent(), None);
    }

    #[test]
    fn test_ordering() {
        let mut ids = vec![
            Identifier::new(["b"]),
            Identifier::new(["a", "1"]),
            Identifier::new(["a"]),
        ];
        ids.sort();
        assert_eq!(ids[0].as_str(), "/a");
        assert_eq!(ids[1].as_str(), "/a/1");
        assert_eq!(ids[2].as_str(), "/b");
    }
}
