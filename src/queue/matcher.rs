//! Routing-key matchers for processor registration.

use regex::Regex;

/// Compiled processor key pattern.
///
/// Patterns without wildcards compare by equality; `*` matches any run of
/// characters and `?` matches exactly one.
#[derive(Debug, Clone)]
pub enum Matcher {
  Exact(String),
  Glob { pattern: String, regex: Regex },
}

impl Matcher {
  pub fn new(pattern: &str) -> Result<Self, regex::Error> {
    if !pattern.contains(|c: char| c == '*' || c == '?') {
      return Ok(Matcher::Exact(pattern.to_string()));
    }

    let mut source = String::with_capacity(pattern.len() + 8);
    source.push('^');
    let mut literal = String::new();
    for c in pattern.chars() {
      match c {
        '*' | '?' => {
          source.push_str(&regex::escape(&literal));
          literal.clear();
          source.push_str(if c == '*' { ".*" } else { "." });
        }
        _ => literal.push(c),
      }
    }
    source.push_str(&regex::escape(&literal));
    source.push('$');

    Ok(Matcher::Glob {
      pattern: pattern.to_string(),
      regex: Regex::new(&source)?,
    })
  }

  pub fn matches(&self, key: &str) -> bool {
    match self {
      Matcher::Exact(expected) => expected == key,
      Matcher::Glob { regex, .. } => regex.is_match(key),
    }
  }

  pub fn is_exact(&self) -> bool {
    matches!(self, Matcher::Exact(_))
  }

  pub fn pattern(&self) -> &str {
    match self {
      Matcher::Exact(pattern) => pattern,
      Matcher::Glob { pattern, .. } => pattern,
    }
  }
}
