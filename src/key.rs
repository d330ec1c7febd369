//! Structured query keys with deep value equality.
//!
//! A [`Key`] is an ordered sequence of [`KeyPart`]s. Parts may be scalars,
//! ordered sequences, or structured records. Records compare by sorted,
//! null-elided fields so that `{status: "active", page: 2}` and
//! `{page: 2, status: "active", other: null}` are the same key.

use std::fmt;
use std::hash::{Hash, Hasher};

/// A single scalar value carried by a key part.
#[derive(Debug, Clone)]
pub enum Scalar {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
}

impl PartialEq for Scalar {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Scalar::Str(a), Scalar::Str(b)) => a == b,
            (Scalar::Int(a), Scalar::Int(b)) => a == b,
            (Scalar::Float(a), Scalar::Float(b)) => a.to_bits() == b.to_bits(),
            (Scalar::Int(a), Scalar::Float(b)) | (Scalar::Float(b), Scalar::Int(a)) => {
                (*a as f64).to_bits() == b.to_bits()
            }
            (Scalar::Bool(a), Scalar::Bool(b)) => a == b,
            (Scalar::Null, Scalar::Null) => true,
            _ => false,
        }
    }
}

impl Eq for Scalar {}

impl Hash for Scalar {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Scalar::Str(s) => {
                0u8.hash(state);
                s.hash(state);
            }
            Scalar::Int(i) => {
                1u8.hash(state);
                (*i as f64).to_bits().hash(state);
            }
            Scalar::Float(f) => {
                1u8.hash(state);
                f.to_bits().hash(state);
            }
            Scalar::Bool(b) => {
                2u8.hash(state);
                b.hash(state);
            }
            Scalar::Null => 3u8.hash(state),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Str(s) => write!(f, "{s:?}"),
            Scalar::Int(i) => write!(f, "{i}"),
            Scalar::Float(x) => write!(f, "{x}"),
            Scalar::Bool(b) => write!(f, "{b}"),
            Scalar::Null => write!(f, "null"),
        }
    }
}

macro_rules! scalar_from {
    ($ty:ty, $variant:ident) => {
        impl From<$ty> for Scalar {
            fn from(value: $ty) -> Self {
                Scalar::$variant(value.into())
            }
        }
    };
}

scalar_from!(&str, Str);
scalar_from!(String, Str);
scalar_from!(i64, Int);
scalar_from!(i32, Int);
scalar_from!(u32, Int);
scalar_from!(f64, Float);
scalar_from!(bool, Bool);

/// One part of a structured [`Key`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPart {
    Scalar(Scalar),
    Sequence(Vec<KeyPart>),
    /// Fields sorted by name with null-valued fields already elided.
    Record(Vec<(String, KeyPart)>),
}

impl KeyPart {
    fn is_null(&self) -> bool {
        matches!(self, KeyPart::Scalar(Scalar::Null))
    }

    fn fmt_debug(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Scalar(s) => write!(f, "{s}"),
            KeyPart::Sequence(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    item.fmt_debug(f)?;
                }
                write!(f, "]")
            }
            KeyPart::Record(fields) => {
                write!(f, "{{")?;
                for (i, (name, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{name}:")?;
                    value.fmt_debug(f)?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl<T: Into<Scalar>> From<T> for KeyPart {
    fn from(value: T) -> Self {
        KeyPart::Scalar(value.into())
    }
}

/// Builder for [`KeyPart::Record`] that sorts fields by name and elides
/// null-valued fields at construction time, so equality and hashing never
/// need to special-case nulls.
#[derive(Debug, Default, Clone)]
pub struct RecordBuilder {
    fields: Vec<(String, KeyPart)>,
}

impl RecordBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<KeyPart>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    pub fn build(mut self) -> KeyPart {
        self.fields.retain(|(_, value)| !value.is_null());
        self.fields.sort_by(|a, b| a.0.cmp(&b.0));
        KeyPart::Record(self.fields)
    }
}

/// An ordered, immutable, structurally-equal composite identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key(Vec<KeyPart>);

impl Key {
    pub fn new(parts: impl IntoIterator<Item = KeyPart>) -> Self {
        Key(parts.into_iter().collect())
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True iff `self`'s length is >= `prefix`'s and the leading parts of
    /// `self` are pairwise-equal to `prefix`'s parts.
    pub fn starts_with(&self, prefix: &Key) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            part.fmt_debug(f)?;
        }
        write!(f, "]")
    }
}

/// Convenience macro for building keys from heterogeneous parts:
/// `key!["todos", 2, rec!["status" => "active"]]`.
#[macro_export]
macro_rules! key {
    ($($part:expr),* $(,)?) => {
        $crate::key::Key::new(vec![$($crate::key::KeyPart::from($part)),*])
    };
}

impl<T: Into<Scalar>> From<Vec<T>> for Key {
    fn from(parts: Vec<T>) -> Self {
        Key::new(parts.into_iter().map(KeyPart::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(fields: &[(&str, KeyPart)]) -> KeyPart {
        let mut builder = RecordBuilder::new();
        for (name, value) in fields {
            builder = builder.field(*name, value.clone());
        }
        builder.build()
    }

    #[test]
    fn equal_scalars_compare_equal() {
        let a = Key::new(vec![KeyPart::from("todos"), KeyPart::from(2i64)]);
        let b = Key::new(vec![KeyPart::from("todos"), KeyPart::from(2i64)]);
        assert_eq!(a, b);
    }

    #[test]
    fn unequal_keys_differ() {
        let a = Key::new(vec![KeyPart::from("todos")]);
        let b = Key::new(vec![KeyPart::from("users")]);
        assert_ne!(a, b);
    }

    #[test]
    fn record_field_order_is_irrelevant() {
        let a = Key::new(vec![
            KeyPart::from("todos"),
            record(&[("status", KeyPart::from("active")), ("page", KeyPart::from(2i64))]),
        ]);
        let b = Key::new(vec![
            KeyPart::from("todos"),
            record(&[("page", KeyPart::from(2i64)), ("status", KeyPart::from("active"))]),
        ]);
        assert_eq!(a, b);
    }

    #[test]
    fn record_null_fields_are_elided() {
        let a = Key::new(vec![record(&[
            ("status", KeyPart::from("active")),
            ("page", KeyPart::from(2i64)),
        ])]);
        let b = Key::new(vec![record(&[
            ("page", KeyPart::from(2i64)),
            ("status", KeyPart::from("active")),
            ("other", KeyPart::Scalar(Scalar::Null)),
        ])]);
        assert_eq!(a, b);
    }

    #[test]
    fn sequence_parts_compare_pairwise_in_order() {
        let a = Key::new(vec![KeyPart::Sequence(vec![KeyPart::from(1i64), KeyPart::from(2i64)])]);
        let b = Key::new(vec![KeyPart::Sequence(vec![KeyPart::from(1i64), KeyPart::from(2i64)])]);
        let c = Key::new(vec![KeyPart::Sequence(vec![KeyPart::from(2i64), KeyPart::from(1i64)])]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn prefix_match_requires_pairwise_equal_leading_parts() {
        let full = Key::new(vec![KeyPart::from("todos"), KeyPart::from(1i64)]);
        let prefix = Key::new(vec![KeyPart::from("todos")]);
        let other = Key::new(vec![KeyPart::from("users")]);
        assert!(full.starts_with(&prefix));
        assert!(!full.starts_with(&other));
        assert!(!prefix.starts_with(&full));
    }

    #[test]
    fn hash_is_consistent_with_equality() {
        use std::collections::hash_map::DefaultHasher;
        let a = Key::new(vec![record(&[
            ("b", KeyPart::from(2i64)),
            ("a", KeyPart::from(1i64)),
        ])]);
        let b = Key::new(vec![record(&[
            ("a", KeyPart::from(1i64)),
            ("b", KeyPart::from(2i64)),
        ])]);
        let hash_of = |k: &Key| {
            let mut hasher = DefaultHasher::new();
            k.hash(&mut hasher);
            hasher.finish()
        };
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }
}
