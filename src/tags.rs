//! Immutable typed key/value tag sets attached to spans, metrics and
//! contexts.

use std::borrow::Cow;
use std::fmt;

/// The value of a single tag.
///
/// Tag values are deliberately restricted to the three types every
/// downstream encoding can represent without loss.
#[derive(Clone, Debug, PartialEq, Eq, Hash, serde::Serialize)]
pub enum TagValue {
    /// A string value.
    String(String),
    /// A 64-bit signed integer value.
    Long(i64),
    /// A boolean value.
    Boolean(bool),
}

impl TagValue {
    /// Renders the value the way the text propagation encoding does.
    pub fn render(&self) -> Cow<'_, str> {
        match self {
            TagValue::String(s) => Cow::Borrowed(s.as_str()),
            TagValue::Long(l) => Cow::Owned(l.to_string()),
            TagValue::Boolean(b) => Cow::Borrowed(if *b { "true" } else { "false" }),
        }
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::String(s) => f.write_str(s),
            TagValue::Long(l) => write!(f, "{l}"),
            TagValue::Boolean(b) => write!(f, "{b}"),
        }
    }
}

impl From<&str> for TagValue {
    fn from(value: &str) -> Self {
        TagValue::String(value.to_owned())
    }
}

impl From<String> for TagValue {
    fn from(value: String) -> Self {
        TagValue::String(value)
    }
}

impl From<i64> for TagValue {
    fn from(value: i64) -> Self {
        TagValue::Long(value)
    }
}

impl From<bool> for TagValue {
    fn from(value: bool) -> Self {
        TagValue::Boolean(value)
    }
}

/// An unordered, immutable mapping from tag keys to typed values.
///
/// Two tag sets are equal when they contain the same entries, regardless of
/// the order in which they were added. The in-memory representation is a
/// flat array sorted by key, which keeps small sets (the overwhelmingly
/// common case) cheap to compare, hash and iterate.
///
/// Tag sets are assembled through [`TagSetBuilder`]; adding an existing key
/// overwrites the previous value.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, serde::Serialize)]
pub struct TagSet {
    entries: Vec<(String, TagValue)>,
}

impl TagSet {
    /// The tag set with no entries.
    pub fn empty() -> TagSet {
        TagSet::default()
    }

    /// Starts building a new tag set.
    pub fn builder() -> TagSetBuilder {
        TagSetBuilder::default()
    }

    /// Builds a tag set with a single entry.
    pub fn of(key: impl Into<String>, value: impl Into<TagValue>) -> TagSet {
        TagSet::builder().add(key, value).build()
    }

    /// Builds a tag set from any iterable of key/value pairs.
    pub fn from_pairs<K, V, I>(pairs: I) -> TagSet
    where
        K: Into<String>,
        V: Into<TagValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut builder = TagSet::builder();
        for (key, value) in pairs {
            builder = builder.add(key, value);
        }
        builder.build()
    }

    /// Looks up the value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&TagValue> {
        self.entries
            .binary_search_by(|(k, _)| k.as_str().cmp(key))
            .ok()
            .map(|i| &self.entries[i].1)
    }

    /// Looks up a string tag; non-string values are not coerced.
    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(TagValue::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Looks up a long tag.
    pub fn get_long(&self, key: &str) -> Option<i64> {
        match self.get(key) {
            Some(TagValue::Long(l)) => Some(*l),
            _ => None,
        }
    }

    /// Looks up a boolean tag.
    pub fn get_boolean(&self, key: &str) -> Option<bool> {
        match self.get(key) {
            Some(TagValue::Boolean(b)) => Some(*b),
            _ => None,
        }
    }

    /// Number of entries in the set.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when the set has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &TagValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Returns a new set containing this set's entries overlaid with
    /// `other`'s; on key collision `other` wins.
    pub fn merged_with(&self, other: &TagSet) -> TagSet {
        if other.is_empty() {
            return self.clone();
        }
        if self.is_empty() {
            return other.clone();
        }
        let mut builder = TagSetBuilder::default();
        for (k, v) in self.iter() {
            builder.entries.insert(k.to_owned(), v.clone());
        }
        for (k, v) in other.iter() {
            builder.entries.insert(k.to_owned(), v.clone());
        }
        builder.build()
    }

    /// Returns a copy of this set with one additional entry.
    pub fn with_tag(&self, key: impl Into<String>, value: impl Into<TagValue>) -> TagSet {
        let mut builder = TagSetBuilder::default();
        for (k, v) in self.iter() {
            builder.entries.insert(k.to_owned(), v.clone());
        }
        builder.entries.insert(key.into(), value.into());
        builder.build()
    }
}

/// Accumulates entries for a [`TagSet`].
#[derive(Debug, Default)]
pub struct TagSetBuilder {
    entries: std::collections::BTreeMap<String, TagValue>,
}

impl TagSetBuilder {
    /// Adds an entry, overwriting any previous value under the same key.
    pub fn add(mut self, key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    /// In-place variant of [`TagSetBuilder::add`] for call sites that hold
    /// the builder behind a mutable reference.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<TagValue>) {
        self.entries.insert(key.into(), value.into());
    }

    /// `true` when nothing has been added yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Finishes the builder into an immutable tag set.
    pub fn build(self) -> TagSet {
        TagSet {
            entries: self.entries.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_ignores_insertion_order() {
        let a = TagSet::builder().add("one", 1i64).add("two", "2").build();
        let b = TagSet::builder().add("two", "2").add("one", 1i64).build();
        assert_eq!(a, b);
    }

    #[test]
    fn later_add_overwrites() {
        let tags = TagSet::builder()
            .add("key", "first")
            .add("key", "second")
            .build();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags.get_string("key"), Some("second"));
    }

    #[test]
    fn typed_lookups_do_not_coerce() {
        let tags = TagSet::builder()
            .add("port", 8080i64)
            .add("secure", true)
            .add("host", "localhost")
            .build();

        assert_eq!(tags.get_long("port"), Some(8080));
        assert_eq!(tags.get_boolean("secure"), Some(true));
        assert_eq!(tags.get_string("host"), Some("localhost"));
        assert_eq!(tags.get_string("port"), None);
        assert_eq!(tags.get_long("secure"), None);
    }

    #[test]
    fn merged_with_prefers_other() {
        let left = TagSet::builder().add("a", 1i64).add("b", 2i64).build();
        let right = TagSet::builder().add("b", 3i64).add("c", 4i64).build();
        let merged = left.merged_with(&right);

        assert_eq!(merged.get_long("a"), Some(1));
        assert_eq!(merged.get_long("b"), Some(3));
        assert_eq!(merged.get_long("c"), Some(4));
    }
}
