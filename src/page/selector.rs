//! Minimal CSS selector engine for the in-memory page.
//!
//! Supported grammar:
//! - type selectors (`button`) and the universal selector (`*`)
//! - `#id`, `.class`, `[attr]`, `[attr=value]` (value bare or quoted)
//! - compound selectors (`button.primary[data-x]`)
//! - the descendant combinator (`form .field`)
//! - selector lists (`a, button`)
//!
//! Anything else (child/sibling combinators, pseudo-classes) is rejected with a
//! `SelectorError` rather than silently matching nothing.

use std::fmt;

use thiserror::Error;

/// Errors raised while parsing a selector.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("empty selector")]
    Empty,
    #[error("unexpected '{ch}' at offset {offset} in selector `{selector}`")]
    Unexpected {
        selector: String,
        ch: char,
        offset: usize,
    },
    #[error("unterminated attribute selector in `{0}`")]
    Unterminated(String),
}

/// The view of an element a selector needs in order to match it.
pub trait Subject: Sized {
    fn tag(&self) -> &str;
    fn attribute(&self, name: &str) -> Option<&str>;
    fn parent(&self) -> Option<Self>;

    fn has_class(&self, class: &str) -> bool {
        self.attribute("class")
            .is_some_and(|classes| classes.split_whitespace().any(|c| c == class))
    }
}

/// A parsed selector list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    source: String,
    groups: Vec<Complex>,
}

/// Compound selectors joined by descendant combinators, left to right.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Complex(Vec<Compound>);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Compound {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
    attributes: Vec<(String, Option<String>)>,
}

impl Selector {
    pub fn parse(source: &str) -> Result<Self, SelectorError> {
        let trimmed = source.trim();
        if trimmed.is_empty() {
            return Err(SelectorError::Empty);
        }

        let mut groups = Vec::new();
        for group in trimmed.split(',') {
            let mut parts = Vec::new();
            for token in group.split_whitespace() {
                parts.push(parse_compound(source, token)?);
            }
            if parts.is_empty() {
                return Err(SelectorError::Empty);
            }
            groups.push(Complex(parts));
        }

        Ok(Self {
            source: trimmed.to_string(),
            groups,
        })
    }

    /// Source text of the selector (trimmed).
    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches<S: Subject>(&self, subject: &S) -> bool {
        self.groups.iter().any(|group| group.matches(subject))
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Complex {
    fn matches<S: Subject>(&self, subject: &S) -> bool {
        let Some((last, ancestors)) = self.0.split_last() else {
            return false;
        };
        if !last.matches(subject) {
            return false;
        }

        // Descendant-only chains can be matched greedily against the nearest ancestor.
        let mut current = subject.parent();
        for part in ancestors.iter().rev() {
            loop {
                match current {
                    Some(node) => {
                        let found = part.matches(&node);
                        current = node.parent();
                        if found {
                            break;
                        }
                    }
                    None => return false,
                }
            }
        }
        true
    }
}

impl Compound {
    fn matches<S: Subject>(&self, subject: &S) -> bool {
        if self
            .tag
            .as_ref()
            .is_some_and(|tag| !tag.eq_ignore_ascii_case(subject.tag()))
        {
            return false;
        }
        if self
            .id
            .as_ref()
            .is_some_and(|id| subject.attribute("id") != Some(id.as_str()))
        {
            return false;
        }
        if !self.classes.iter().all(|class| subject.has_class(class)) {
            return false;
        }
        self.attributes
            .iter()
            .all(|(name, expected)| match (subject.attribute(name), expected) {
                (None, _) => false,
                (Some(_), None) => true,
                (Some(actual), Some(expected)) => actual == expected,
            })
    }
}

fn is_ident_char(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '-' || ch == '_'
}

fn parse_compound(selector: &str, token: &str) -> Result<Compound, SelectorError> {
    let chars: Vec<char> = token.chars().collect();
    let unexpected = |offset: usize| SelectorError::Unexpected {
        selector: selector.to_string(),
        ch: chars[offset],
        offset,
    };

    let mut compound = Compound::default();
    let mut i = 0;

    let read_ident = |start: usize| -> (String, usize) {
        let mut end = start;
        while end < chars.len() && is_ident_char(chars[end]) {
            end += 1;
        }
        (chars[start..end].iter().collect(), end)
    };

    if chars[0] == '*' {
        i = 1;
    } else if is_ident_char(chars[0]) {
        let (tag, end) = read_ident(0);
        compound.tag = Some(tag);
        i = end;
    }

    while i < chars.len() {
        match chars[i] {
            '#' | '.' => {
                let (name, end) = read_ident(i + 1);
                if name.is_empty() {
                    return Err(unexpected(i));
                }
                if chars[i] == '#' {
                    compound.id = Some(name);
                } else {
                    compound.classes.push(name);
                }
                i = end;
            }
            '[' => {
                let close = chars[i..]
                    .iter()
                    .position(|c| *c == ']')
                    .map(|p| p + i)
                    .ok_or_else(|| SelectorError::Unterminated(selector.to_string()))?;
                let inner: String = chars[i + 1..close].iter().collect();
                let (name, value) = match inner.split_once('=') {
                    Some((name, value)) => {
                        let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
                        (name.trim().to_string(), Some(value.to_string()))
                    }
                    None => (inner.trim().to_string(), None),
                };
                if name.is_empty() || !name.chars().all(is_ident_char) {
                    return Err(unexpected(i));
                }
                compound.attributes.push((name, value));
                i = close + 1;
            }
            _ => return Err(unexpected(i)),
        }
    }

    Ok(compound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[derive(Clone)]
    struct Node<'a> {
        tree: &'a [(Option<usize>, &'a str, BTreeMap<&'a str, &'a str>)],
        idx: usize,
    }

    impl Subject for Node<'_> {
        fn tag(&self) -> &str {
            self.tree[self.idx].1
        }
        fn attribute(&self, name: &str) -> Option<&str> {
            self.tree[self.idx].2.get(name).copied()
        }
        fn parent(&self) -> Option<Self> {
            self.tree[self.idx].0.map(|idx| Node {
                tree: self.tree,
                idx,
            })
        }
    }

    fn tree() -> Vec<(Option<usize>, &'static str, BTreeMap<&'static str, &'static str>)> {
        vec![
            (None, "form", BTreeMap::from([("id", "signup")])),
            (Some(0), "div", BTreeMap::from([("class", "field wide")])),
            (
                Some(1),
                "button",
                BTreeMap::from([("class", "btn primary"), ("data-role", "submit")]),
            ),
        ]
    }

    #[test]
    fn test_compound_matching() {
        let t = tree();
        let button = Node { tree: &t, idx: 2 };
        assert!(Selector::parse(".btn").unwrap().matches(&button));
        assert!(Selector::parse("button.btn.primary").unwrap().matches(&button));
        assert!(Selector::parse("[data-role=submit]").unwrap().matches(&button));
        assert!(Selector::parse("[data-role=\"submit\"]").unwrap().matches(&button));
        assert!(!Selector::parse("button.secondary").unwrap().matches(&button));
        assert!(!Selector::parse("a").unwrap().matches(&button));
    }

    #[test]
    fn test_descendant_and_lists() {
        let t = tree();
        let button = Node { tree: &t, idx: 2 };
        let field = Node { tree: &t, idx: 1 };
        assert!(Selector::parse("#signup .btn").unwrap().matches(&button));
        assert!(Selector::parse("form div button").unwrap().matches(&button));
        assert!(!Selector::parse(".btn .field").unwrap().matches(&field));
        assert!(Selector::parse("a, .field").unwrap().matches(&field));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Selector::parse("  "), Err(SelectorError::Empty));
        assert!(matches!(
            Selector::parse("a > b"),
            Err(SelectorError::Unexpected { ch: '>', .. })
        ));
        assert!(matches!(
            Selector::parse("[data-x"),
            Err(SelectorError::Unterminated(_))
        ));
        assert!(Selector::parse("a:hover").is_err());
    }
}
