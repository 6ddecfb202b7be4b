//! Splitting event titles into a category hierarchy, e.g.
//! `"Work: Deep Focus - Coding"` becomes `Work > Deep Focus > Coding`.

use std::fmt;

use crate::rules::ParsingRules;

pub const UNCATEGORIZED: &str = "Uncategorized";

/// One level of a [`CategoryPath`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    /// Never empty, never padded with whitespace.
    Named(String),
    /// The title had nothing usable at this depth.
    Uncategorized,
}

impl Segment {
    fn from_token(token: &str) -> Segment {
        let token = token.trim();
        if token.is_empty() {
            Segment::Uncategorized
        } else {
            Segment::Named(token.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Segment::Named(name) => name,
            Segment::Uncategorized => UNCATEGORIZED,
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CategoryPath {
    /// The title has no category delimiter.
    Uncategorized,
    /// Top-level category first. Never empty.
    Path(Vec<Segment>),
}

impl CategoryPath {
    /// Never fails: anything that doesn't fit the delimiter convention ends up
    /// as [`CategoryPath::Uncategorized`] or an [`Segment::Uncategorized`]
    /// level.
    pub fn parse(title: &str, rules: &ParsingRules) -> CategoryPath {
        let Some((category, rest)) = title.split_once(rules.category_delimiter.as_str()) else {
            return CategoryPath::Uncategorized;
        };

        let mut segments = vec![Segment::from_token(category)];

        if !rules.flatten {
            segments.extend(
                rest.split(rules.subcategory_delimiter.as_str())
                    .map(Segment::from_token),
            );
        }

        CategoryPath::Path(segments)
    }

    pub fn category(&self) -> &str {
        match self {
            CategoryPath::Uncategorized => UNCATEGORIZED,
            CategoryPath::Path(segments) => segments
                .first()
                .map_or(UNCATEGORIZED, Segment::as_str),
        }
    }

    /// Everything below the top-level category.
    pub fn subcategories(&self) -> &[Segment] {
        match self {
            CategoryPath::Uncategorized => &[],
            CategoryPath::Path(segments) => segments.get(1..).unwrap_or(&[]),
        }
    }

    pub fn depth(&self) -> usize {
        1 + self.subcategories().len()
    }
}

impl fmt::Display for CategoryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.category())?;
        for segment in self.subcategories() {
            write!(f, " > {}", segment)?;
        }
        Ok(())
    }
}
