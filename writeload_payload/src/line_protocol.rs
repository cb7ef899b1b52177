//! Line protocol points.
//!
//! A point renders as `measurement[,tag_key=tag_value...] field_key=field_value`.
//! Keys and values here are produced by this crate and never need escaping,
//! so none is done.

use core::fmt;

/// The value half of a [`Tag`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagValue<'a> {
    /// A fixed string, rendered as-is.
    Literal(&'a str),
    /// A numeric identifier with an optional prefix, rendered as
    /// `{prefix}{id}`, e.g. `server17`.
    Id {
        /// Text placed ahead of the identifier, possibly empty.
        prefix: &'a str,
        /// The identifier.
        id: u32,
    },
}

impl<'a> TagValue<'a> {
    /// Construct a [`TagValue::Literal`].
    #[must_use]
    pub fn literal(value: &'a str) -> Self {
        Self::Literal(value)
    }

    /// Construct a [`TagValue::Id`].
    #[must_use]
    pub fn id(prefix: &'a str, id: u32) -> Self {
        Self::Id { prefix, id }
    }
}

impl fmt::Display for TagValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::Literal(value) => write!(f, "{value}"),
            TagValue::Id { prefix, id } => write!(f, "{prefix}{id}"),
        }
    }
}

/// A `key=value` pair attached to a [`Point`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag<'a> {
    /// The tag key
    pub key: &'a str,
    /// The tag value
    pub value: TagValue<'a>,
}

/// A single line protocol record.
///
/// Points carry exactly one float field. They are immutable once built and
/// have no identity beyond their text.
#[derive(Debug, Clone, PartialEq)]
pub struct Point<'a> {
    measurement: &'a str,
    tags: Vec<Tag<'a>>,
    field: &'a str,
    value: f64,
}

impl<'a> Point<'a> {
    /// Construct a new untagged [`Point`].
    #[must_use]
    pub fn new(measurement: &'a str, field: &'a str, value: f64) -> Self {
        Self {
            measurement,
            tags: Vec::new(),
            field,
            value,
        }
    }

    /// Append a tag. Tags render in insertion order.
    #[must_use]
    pub fn tag(mut self, key: &'a str, value: TagValue<'a>) -> Self {
        self.tags.push(Tag { key, value });
        self
    }

    /// The measurement name
    #[must_use]
    pub fn measurement(&self) -> &str {
        self.measurement
    }

    /// The tags of this point, in render order
    #[must_use]
    pub fn tags(&self) -> &[Tag<'a>] {
        &self.tags
    }

    /// Look up the value of the first tag named `key`
    #[must_use]
    pub fn tag_value(&self, key: &str) -> Option<TagValue<'a>> {
        self.tags.iter().find(|t| t.key == key).map(|t| t.value)
    }

    /// The field value
    #[must_use]
    pub fn value(&self) -> f64 {
        self.value
    }
}

impl fmt::Display for Point<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.measurement)?;
        for tag in &self.tags {
            write!(f, ",{key}={value}", key = tag.key, value = tag.value)?;
        }
        write!(f, " {field}={value}", field = self.field, value = self.value)
    }
}
