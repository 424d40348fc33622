//! Blob path patterns with `{name}` placeholders.
//!
//! A pattern is parsed once into `/`-separated segments of literals and
//! wildcards. The container segment matches case-insensitively; a wildcard
//! runs up to the next literal, or to the final suffix when it is the last
//! wildcard in its segment.

use std::collections::HashSet;
use std::fmt;

use canopy_storage::BlobPath;
use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::error::PatternError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
  Literal(String),
  Wildcard(String),
}

/// Values captured by a successful match, in pattern order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captures {
  values: Vec<(String, String)>,
}

impl Captures {
  pub fn new() -> Self {
    Self::default()
  }

  /// Bind `name`, replacing any previous value.
  pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
    let name = name.into();
    let value = value.into();
    match self.values.iter_mut().find(|(n, _)| *n == name) {
      Some(entry) => entry.1 = value,
      None => self.values.push((name, value)),
    }
  }

  pub fn get(&self, name: &str) -> Option<&str> {
    self
      .values
      .iter()
      .find(|(n, _)| n == name)
      .map(|(_, v)| v.as_str())
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.values.iter().map(|(n, v)| (n.as_str(), v.as_str()))
  }

  pub fn len(&self) -> usize {
    self.values.len()
  }

  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Captures {
  fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
    let mut captures = Captures::new();
    for (name, value) in iter {
      captures.insert(name, value);
    }
    captures
  }
}

impl Serialize for Captures {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(self.values.len()))?;
    for (name, value) in &self.values {
      map.serialize_entry(name, value)?;
    }
    map.end()
  }
}

/// A blob path pattern such as `input/{name}.csv`.
///
/// Patterns are `/`-separated segments; the first segment is the container.
/// A segment mixes literal text and named wildcards. A wildcard captures text
/// up to the next occurrence of the literal that follows it, except that the
/// last wildcard in a segment followed by literal text treats that text as a
/// suffix: `{name}.csv` matches `a.b.csv` with `name = a.b`. Wildcards never
/// span segments, and container names compare case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
  text: String,
  segments: Vec<Vec<Token>>,
}

impl PathPattern {
  pub fn parse(text: &str) -> Result<Self, PatternError> {
    let raw_segments: Vec<&str> = text.split('/').collect();
    if raw_segments.len() < 2 {
      return Err(PatternError::invalid(text, "expected 'container/blob'"));
    }

    let mut names = HashSet::new();
    let mut segments = Vec::with_capacity(raw_segments.len());
    for (index, raw) in raw_segments.into_iter().enumerate() {
      if raw.is_empty() {
        return Err(PatternError::invalid(text, "empty path segment"));
      }
      let mut tokens = parse_segment(text, raw, &mut names)?;
      if index == 0 {
        for token in &mut tokens {
          if let Token::Literal(literal) = token {
            *literal = literal.to_lowercase();
          }
        }
      }
      segments.push(tokens);
    }

    Ok(Self {
      text: text.to_string(),
      segments,
    })
  }

  pub fn as_str(&self) -> &str {
    &self.text
  }

  /// The container name when the first segment is fully literal.
  pub fn container(&self) -> Option<&str> {
    match self.segments.first()?.as_slice() {
      [Token::Literal(name)] => Some(name),
      _ => None,
    }
  }

  /// Wildcard names in pattern order.
  pub fn parameter_names(&self) -> Vec<&str> {
    self
      .segments
      .iter()
      .flatten()
      .filter_map(|token| match token {
        Token::Wildcard(name) => Some(name.as_str()),
        Token::Literal(_) => None,
      })
      .collect()
  }

  /// Match an actual `container/blob` path. Returns `None` when it does not match.
  pub fn matches(&self, actual: &str) -> Option<Captures> {
    let parts: Vec<&str> = actual.split('/').collect();
    if parts.len() != self.segments.len() {
      return None;
    }

    let mut captures = Captures::new();
    for (index, (tokens, part)) in self.segments.iter().zip(parts).enumerate() {
      if index == 0 {
        match_segment(tokens, &part.to_lowercase(), &mut captures)?;
      } else {
        match_segment(tokens, part, &mut captures)?;
      }
    }
    Some(captures)
  }

  pub fn matches_path(&self, path: &BlobPath) -> Option<Captures> {
    self.matches(&path.to_string())
  }

  /// Substitute captured values into the pattern.
  pub fn apply(&self, captures: &Captures) -> Result<BlobPath, PatternError> {
    let mut segments = Vec::with_capacity(self.segments.len());
    for tokens in &self.segments {
      let mut segment = String::new();
      for token in tokens {
        match token {
          Token::Literal(literal) => segment.push_str(literal),
          Token::Wildcard(name) => {
            let value = captures.get(name).ok_or_else(|| PatternError::Unbound {
              pattern: self.text.clone(),
              name: name.clone(),
            })?;
            segment.push_str(value);
          }
        }
      }
      segments.push(segment);
    }

    let path = segments.join("/");
    BlobPath::parse(&path).ok_or_else(|| PatternError::InvalidPath {
      pattern: self.text.clone(),
      path,
    })
  }
}

impl fmt::Display for PathPattern {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.text)
  }
}

fn parse_segment(
  pattern: &str,
  segment: &str,
  names: &mut HashSet<String>,
) -> Result<Vec<Token>, PatternError> {
  let mut tokens = Vec::new();
  let mut rest = segment;

  while !rest.is_empty() {
    if let Some(after) = rest.strip_prefix('{') {
      let end = after
        .find('}')
        .ok_or_else(|| PatternError::invalid(pattern, "unclosed '{'"))?;
      let name = &after[..end];
      if name.contains('{') {
        return Err(PatternError::invalid(pattern, "nested '{'"));
      }
      if !is_identifier(name) {
        return Err(PatternError::invalid(
          pattern,
          format!("invalid wildcard name '{name}'"),
        ));
      }
      if matches!(tokens.last(), Some(Token::Wildcard(_))) {
        return Err(PatternError::invalid(
          pattern,
          "adjacent wildcards must be separated by literal text",
        ));
      }
      if !names.insert(name.to_string()) {
        return Err(PatternError::invalid(
          pattern,
          format!("duplicate wildcard '{name}'"),
        ));
      }
      tokens.push(Token::Wildcard(name.to_string()));
      rest = &after[end + 1..];
    } else {
      let end = rest.find(['{', '}']).unwrap_or(rest.len());
      if rest[end..].starts_with('}') {
        return Err(PatternError::invalid(pattern, "unmatched '}'"));
      }
      tokens.push(Token::Literal(rest[..end].to_string()));
      rest = &rest[end..];
    }
  }

  Ok(tokens)
}

fn is_identifier(name: &str) -> bool {
  let mut chars = name.chars();
  match chars.next() {
    Some(first) if first.is_alphabetic() || first == '_' => {
      chars.all(|c| c.is_alphanumeric() || c == '_')
    }
    _ => false,
  }
}

fn match_segment(tokens: &[Token], actual: &str, captures: &mut Captures) -> Option<()> {
  let mut rest = actual;

  for (index, token) in tokens.iter().enumerate() {
    match token {
      Token::Literal(literal) => rest = rest.strip_prefix(literal.as_str())?,
      Token::Wildcard(name) => {
        let value = match tokens.get(index + 1) {
          None => rest,
          Some(Token::Literal(suffix)) if index + 2 == tokens.len() => {
            rest.strip_suffix(suffix.as_str())?
          }
          Some(Token::Literal(next)) => &rest[..rest.find(next.as_str())?],
          Some(Token::Wildcard(_)) => return None,
        };
        if value.is_empty() {
          return None;
        }
        captures.insert(name.as_str(), value);
        rest = &rest[value.len()..];
      }
    }
  }

  rest.is_empty().then_some(())
}
