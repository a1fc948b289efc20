//! Shared text buffers
//!
//! Every string held by an [`Event`](crate::Event) is a [`Text`]: a byte range
//! into a reference-counted buffer. Parsing slices the input buffer instead of
//! copying each field, clones and event copies share the buffer, and the
//! buffer is freed when the last slice pointing into it is dropped. A field
//! can be removed or overwritten independently because each slice holds its
//! own reference.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::Arc;

use serde::{Serialize, Serializer};

/// A string slice that keeps its backing buffer alive
#[derive(Clone)]
pub struct Text {
    buf: Arc<str>,
    start: usize,
    end: usize,
}

impl Text {
    /// Copy `s` into a fresh private buffer
    pub fn new(s: &str) -> Self {
        Self::from_buffer(Arc::from(s))
    }

    /// Wrap a whole shared buffer without copying
    pub fn from_buffer(buf: Arc<str>) -> Self {
        let end = buf.len();
        Self { buf, start: 0, end }
    }

    /// Slice a shared buffer without copying
    ///
    /// Returns `None` if the range is out of bounds or not on char boundaries.
    pub fn slice(buf: &Arc<str>, start: usize, end: usize) -> Option<Self> {
        buf.get(start..end)?;
        Some(Self {
            buf: Arc::clone(buf),
            start,
            end,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.buf[self.start..self.end]
    }

    /// Number of live references to the backing buffer
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.buf)
    }

    /// True if both slices point into the same buffer
    pub fn shares_buffer(&self, other: &Text) -> bool {
        Arc::ptr_eq(&self.buf, &other.buf)
    }

    /// Size of the whole backing buffer, not just this slice
    pub fn buffer_len(&self) -> usize {
        self.buf.len()
    }

    /// Point this slice at the same bytes inside another buffer
    pub(crate) fn rehome(&mut self, buf: &Arc<str>, start: usize) {
        let len = self.end - self.start;
        self.buf = Arc::clone(buf);
        self.start = start;
        self.end = start + len;
    }
}

impl Default for Text {
    fn default() -> Self {
        Self::new("")
    }
}

impl Deref for Text {
    type Target = str;

    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl AsRef<str> for Text {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl From<&str> for Text {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Text {
    fn from(s: String) -> Self {
        Self::from_buffer(Arc::from(s))
    }
}

impl From<&Text> for Text {
    fn from(t: &Text) -> Self {
        t.clone()
    }
}

impl PartialEq for Text {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for Text {}

impl PartialEq<str> for Text {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl PartialEq<&str> for Text {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

impl PartialOrd for Text {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Text {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_str().cmp(other.as_str())
    }
}

impl Hash for Text {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_str().hash(state);
    }
}

impl fmt::Debug for Text {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for Text {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Text {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// ASCII case-insensitive ordering used for attribute keys and variable names
pub fn cmp_ignore_case(a: &str, b: &str) -> Ordering {
    a.bytes()
        .map(|c| c.to_ascii_lowercase())
        .cmp(b.bytes().map(|c| c.to_ascii_lowercase()))
}
