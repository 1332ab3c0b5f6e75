//! Resource name patterns and group templates.
//!
//! A pattern is a dotted name whose segments are one of:
//!
//! - a literal, matching exactly (`books`)
//! - a placeholder, capturing one segment as a path parameter (`$id`)
//! - a trailing wildcard, matching one or more remaining segments (`>`)
//!
//! A group template is a string with `${name}` tags replaced by path
//! parameters, e.g. `library.book.${id}`.

use crate::error::FrameworkError;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Literal(String),
    Placeholder(String),
    Wildcard,
}

/// A compiled resource name pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    source: String,
    tokens: Vec<Token>,
}

impl Pattern {
    pub fn parse(source: &str) -> Result<Self, FrameworkError> {
        let invalid = |reason| FrameworkError::InvalidPattern {
            pattern: source.to_string(),
            reason,
        };

        if source.is_empty() {
            return Err(invalid("empty pattern"));
        }

        let segments: Vec<&str> = source.split('.').collect();
        let last = segments.len() - 1;
        let mut names = HashSet::new();
        let mut tokens = Vec::with_capacity(segments.len());

        for (i, segment) in segments.into_iter().enumerate() {
            let token = match segment {
                "" => return Err(invalid("empty segment")),
                ">" if i == last => Token::Wildcard,
                ">" => return Err(invalid("wildcard must be the last segment")),
                s if s.starts_with('$') => {
                    let name = &s[1..];
                    if name.is_empty() || !is_name(name) {
                        return Err(invalid("invalid placeholder name"));
                    }
                    if !names.insert(name.to_string()) {
                        return Err(invalid("duplicate placeholder name"));
                    }
                    Token::Placeholder(name.to_string())
                }
                s if s.chars().all(is_literal_char) => Token::Literal(s.to_string()),
                _ => return Err(invalid("invalid character in literal segment")),
            };
            tokens.push(token);
        }

        Ok(Self {
            source: source.to_string(),
            tokens,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Placeholder names with their segment positions.
    pub fn placeholders(&self) -> impl Iterator<Item = (usize, &str)> {
        self.tokens.iter().enumerate().filter_map(|(i, t)| match t {
            Token::Placeholder(name) => Some((i, name.as_str())),
            _ => None,
        })
    }
}

impl FromStr for Pattern {
    type Err = FrameworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Pattern::parse(s)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn is_name(s: &str) -> bool {
    s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn is_literal_char(c: char) -> bool {
    !c.is_whitespace() && !matches!(c, '$' | '>' | '*' | '?' | '{' | '}')
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Text(String),
    Param(String),
}

/// A group key template, rendered from a match's path parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupTemplate {
    parts: Vec<Part>,
}

impl GroupTemplate {
    pub fn parse(template: &str) -> Result<Self, FrameworkError> {
        let invalid = |reason| FrameworkError::InvalidPattern {
            pattern: template.to_string(),
            reason,
        };

        let mut parts = Vec::new();
        let mut rest = template;
        while let Some(start) = rest.find("${") {
            if start > 0 {
                parts.push(Part::Text(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after.find('}').ok_or_else(|| invalid("unterminated group tag"))?;
            let name = &after[..end];
            if name.is_empty() || !is_name(name) {
                return Err(invalid("invalid group tag name"));
            }
            parts.push(Part::Param(name.to_string()));
            rest = &after[end + 1..];
        }
        if !rest.is_empty() {
            parts.push(Part::Text(rest.to_string()));
        }
        if parts.is_empty() {
            return Err(invalid("empty group"));
        }
        Ok(Self { parts })
    }

    /// Names of the path parameters the template refers to.
    pub fn params(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().filter_map(|p| match p {
            Part::Param(name) => Some(name.as_str()),
            Part::Text(_) => None,
        })
    }

    pub fn render(&self, params: &HashMap<String, String>) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Text(text) => out.push_str(text),
                Part::Param(name) => {
                    if let Some(value) = params.get(name) {
                        out.push_str(value);
                    }
                }
            }
        }
        out
    }
}
