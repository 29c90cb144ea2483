//! Parsed, mutable representation of one authentication cookie string.
//!
//! A raw cookie is a `"k=v; k2=v2"` string. The parsed form preserves field
//! order so that re-serialization after mutation reproduces an equivalent
//! string, and carries its store origin once it has been served so upstream
//! refreshes can be written back to the right slot.

use std::fmt;

/// Where a cookie was drawn from in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieOrigin {
    /// Recognized service name the cookie belongs to.
    pub service: String,
    /// Index into the service's entry list.
    pub index: usize,
}

/// One authentication cookie for one service.
///
/// Fields keep insertion order. Mutation happens in place; the store decides
/// when a mutated cookie is committed back and replicated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cookie {
    fields: Vec<(String, String)>,
    origin: Option<CookieOrigin>,
}

impl Cookie {
    /// Parses a raw `"k=v; k2=v2"` string.
    ///
    /// Segments without an `=` are ignored; whitespace around segments is
    /// trimmed. Values may themselves contain `=`.
    pub fn from_raw(raw: &str) -> Self {
        let fields = raw
            .split(';')
            .filter_map(|segment| {
                let segment = segment.trim();
                let (name, value) = segment.split_once('=')?;
                if name.is_empty() {
                    return None;
                }
                Some((name.to_string(), value.to_string()))
            })
            .collect();

        Self {
            fields,
            origin: None,
        }
    }

    /// Returns the value of a field, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Sets a field, appending it if absent. Returns whether the value changed.
    pub fn set(&mut self, name: &str, value: &str) -> bool {
        if let Some(entry) = self.fields.iter_mut().find(|(n, _)| n == name) {
            if entry.1 == value {
                return false;
            }
            entry.1 = value.to_string();
            true
        } else {
            self.fields.push((name.to_string(), value.to_string()));
            true
        }
    }

    /// Removes a field. Returns whether it was present.
    pub fn unset(&mut self, name: &str) -> bool {
        let before = self.fields.len();
        self.fields.retain(|(n, _)| n != name);
        self.fields.len() != before
    }

    /// Applies a batch of field mutations. Returns whether anything changed.
    pub fn apply<'a, I>(&mut self, fields: I) -> bool
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut changed = false;
        for (name, value) in fields {
            changed |= self.set(name, value);
        }
        changed
    }

    /// Returns the field names in order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(n, _)| n.as_str())
    }

    /// Number of fields currently held.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the cookie holds no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Store origin, set when the cookie was drawn via `CookieStore::get`.
    pub fn origin(&self) -> Option<&CookieOrigin> {
        self.origin.as_ref()
    }

    pub(crate) fn set_origin(&mut self, service: &str, index: usize) {
        self.origin = Some(CookieOrigin {
            service: service.to_string(),
            index,
        });
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, value) in &self.fields {
            if !first {
                f.write_str("; ")?;
            }
            write!(f, "{name}={value}")?;
            first = false;
        }
        Ok(())
    }
}
