/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

//! Typed, immutable bags of data attached to resolver updates, endpoints and
//! addresses.  Parent LB policies use them to pass arguments to their
//! children without widening the policy traits.

use std::any::{Any, TypeId};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

/// Only types that support comparison may be stored, so that two attribute
/// sets compare by value rather than by pointer.
trait AttributeTrait: Any + Send + Sync + Debug {
    fn any_ref(&self) -> &dyn Any;
    fn dyn_eq(&self, other: &dyn AttributeTrait) -> bool;
    fn dyn_cmp(&self, other: &dyn AttributeTrait) -> Ordering;
}

impl<T: Any + Send + Sync + Eq + Ord + Debug> AttributeTrait for T {
    fn any_ref(&self) -> &dyn Any {
        self
    }

    fn dyn_eq(&self, other: &dyn AttributeTrait) -> bool {
        other
            .any_ref()
            .downcast_ref::<T>()
            .is_some_and(|other| self == other)
    }

    fn dyn_cmp(&self, other: &dyn AttributeTrait) -> Ordering {
        match other.any_ref().downcast_ref::<T>() {
            Some(other) => self.cmp(other),
            // Values are keyed by their TypeId, so this is only reachable when
            // comparing entries of two different keys.
            None => TypeId::of::<T>().cmp(&other.any_ref().type_id()),
        }
    }
}

#[derive(Clone, Debug)]
struct AttributeValue(Arc<dyn AttributeTrait>);

impl PartialEq for AttributeValue {
    fn eq(&self, other: &Self) -> bool {
        self.0.dyn_eq(other.0.as_ref())
    }
}

impl Eq for AttributeValue {}

impl PartialOrd for AttributeValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AttributeValue {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.dyn_cmp(other.0.as_ref())
    }
}

/// A collection of values indexed by their type.
///
/// `Attributes` is persistent: every mutation returns a new collection and
/// leaves the original untouched, so copies are cheap to hand to children.
/// Stored types must implement `Any + Send + Sync + Eq + Ord + Debug`.
#[derive(Clone, Default, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Attributes {
    map: Arc<BTreeMap<TypeId, AttributeValue>>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a new collection with `value` added, replacing any value of the
    /// same type.
    pub fn add<T: Send + Sync + Eq + Ord + Debug + 'static>(&self, value: T) -> Self {
        let mut map = (*self.map).clone();
        map.insert(TypeId::of::<T>(), AttributeValue(Arc::new(value)));
        Attributes { map: Arc::new(map) }
    }

    /// Gets a reference to the value of type T, if present.
    pub fn get<T: 'static>(&self) -> Option<&T> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|v| v.0.any_ref().downcast_ref())
    }

    /// Returns a new collection without the value of type T.
    pub fn remove<T: 'static>(&self) -> Self {
        let id = TypeId::of::<T>();
        if !self.map.contains_key(&id) {
            return self.clone();
        }
        let mut map = (*self.map).clone();
        map.remove(&id);
        Attributes { map: Arc::new(map) }
    }

    /// Returns a new collection holding the values of both, preferring the
    /// values in `other` when both contain the same type.
    pub fn union(&self, other: &Attributes) -> Self {
        let mut map = (*self.map).clone();
        map.extend(other.map.iter().map(|(k, v)| (*k, v.clone())));
        Attributes { map: Arc::new(map) }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
