//! A capacity-doubling sequence used to accumulate arguments and stages.

use std::ops::Deref;

/// An owned, resizable sequence of values.
///
/// The array starts with room for a single element and doubles its capacity
/// whenever a push would exceed it, so pushing is amortized O(1). Dropping the
/// array releases every stored value together with the backing storage, while
/// [`GrowableArray::clear`] releases the values but keeps the storage around
/// for the next round of pushes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrowableArray<T> {
    items: Vec<T>,
}

impl<T> GrowableArray<T> {
    /// Create an empty array with capacity for exactly one element.
    pub fn new() -> Self {
        Self {
            items: Vec::with_capacity(1),
        }
    }

    /// Append a value, doubling the capacity first if the array is full.
    pub fn push(&mut self, value: T) {
        let capacity = self.items.capacity();
        if self.items.len() == capacity {
            self.items.reserve_exact(capacity.max(1));
        }
        self.items.push(value);
    }

    /// Drop every stored value, retaining the allocation.
    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn capacity(&self) -> usize {
        self.items.capacity()
    }
}

impl<T> Default for GrowableArray<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Deref for GrowableArray<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.items
    }
}

impl<T> FromIterator<T> for GrowableArray<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut array = Self::new();
        for item in iter {
            array.push(item);
        }
        array
    }
}

impl<T> IntoIterator for GrowableArray<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a, T> IntoIterator for &'a GrowableArray<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}
