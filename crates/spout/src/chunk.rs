//! Immutable, sliceable sequences of elements.

use std::fmt::{self, Debug};
use std::ops::{Bound, Deref, RangeBounds};
use std::sync::Arc;

/// An immutable sequence of `T` processed as a unit.
///
/// Cloning and slicing a chunk never copies elements: all slices of a chunk
/// share the same backing storage.
pub struct Chunk<T> {
    data: Arc<[T]>,
    start: usize,
    end: usize,
}

impl<T> Chunk<T> {
    pub fn empty() -> Self {
        Self::from(Vec::new())
    }

    pub fn singleton(value: T) -> Self {
        Self::from(vec![value])
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data[self.start..self.end]
    }

    /// Returns the chunk without its first `n` elements.
    ///
    /// Skipping more elements than the chunk holds yields an empty chunk.
    pub fn skip(&self, n: usize) -> Self {
        let start = self.start + n.min(self.len());
        Self {
            data: self.data.clone(),
            start,
            end: self.end,
        }
    }

    /// Returns the first `n` elements of the chunk.
    pub fn take(&self, n: usize) -> Self {
        let end = self.start + n.min(self.len());
        Self {
            data: self.data.clone(),
            start: self.start,
            end,
        }
    }

    pub fn split_at(&self, n: usize) -> (Self, Self) {
        (self.take(n), self.skip(n))
    }

    /// Returns the elements in `range`, clamped to the chunk's bounds.
    pub fn slice<R>(&self, range: R) -> Self
    where
        R: RangeBounds<usize>,
    {
        let from = match range.start_bound() {
            Bound::Included(&n) => n,
            Bound::Excluded(&n) => n.saturating_add(1),
            Bound::Unbounded => 0,
        };
        let to = match range.end_bound() {
            Bound::Included(&n) => n.saturating_add(1),
            Bound::Excluded(&n) => n,
            Bound::Unbounded => self.len(),
        };
        let to = to.min(self.len());
        let from = from.min(to);
        Self {
            data: self.data.clone(),
            start: self.start + from,
            end: self.start + to,
        }
    }
}

impl<T: Clone> Chunk<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.as_slice().to_vec()
    }

    /// Concatenates `chunks` into a single chunk.
    pub fn concat<'a, I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = &'a Chunk<T>>,
        T: 'a,
    {
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend_from_slice(chunk.as_slice());
        }
        Self::from(out)
    }
}

impl<T> Clone for Chunk<T> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            start: self.start,
            end: self.end,
        }
    }
}

impl<T> Default for Chunk<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Deref for Chunk<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T> AsRef<[T]> for Chunk<T> {
    fn as_ref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T> From<Vec<T>> for Chunk<T> {
    fn from(value: Vec<T>) -> Self {
        let end = value.len();
        Self {
            data: value.into(),
            start: 0,
            end,
        }
    }
}

impl<T: Clone> From<&[T]> for Chunk<T> {
    fn from(value: &[T]) -> Self {
        Self::from(value.to_vec())
    }
}

impl<T> FromIterator<T> for Chunk<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::from(iter.into_iter().collect::<Vec<_>>())
    }
}

impl<'a, T> IntoIterator for &'a Chunk<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.as_slice().iter()
    }
}

impl<T: PartialEq> PartialEq for Chunk<T> {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl<T: Eq> Eq for Chunk<T> {}

impl<T: Debug> Debug for Chunk<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Chunk").field(&self.as_slice()).finish()
    }
}
