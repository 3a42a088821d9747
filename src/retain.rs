//! Retained-message storage.
//!
//! Keeps the latest retained message per concrete topic in a trie mirroring
//! the topic hierarchy, so a subscription filter retrieves every matching
//! entry in one traversal:
//!
//! ```text
//! Root
//! ├── sensors
//! │   ├── 41 (value)
//! │   └── 42 (value)
//! └── alerts (value)
//! ```
//!
//! Storage follows MQTT-5 retained semantics: a publish replaces the prior
//! entry for its topic, an empty payload deletes it, and entries may carry
//! an expiry honored on lookup and purged by `remove_expired_messages`.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::topic::{Segment, TopicPath};
use crate::types::{HashMap, Retained};
use crate::utils::{Counter, TimedValue};

#[async_trait]
pub trait RetainStorage: Sync + Send {
    ///Stores `retained` under its concrete topic, latest wins. An empty
    ///payload deletes the entry.
    async fn set(&self, topic: &TopicPath, retained: Retained, expiry: Option<Duration>) -> Result<()>;

    ///Every stored entry whose topic matches `filter`.
    async fn matches(&self, filter: &TopicPath) -> Result<Vec<(TopicPath, Retained)>>;

    async fn count(&self) -> isize;
}

pub struct DefaultRetainStorage {
    messages: RwLock<RetainTree<TimedValue<Retained>>>,
    retaineds: Counter,
}

impl Default for DefaultRetainStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl DefaultRetainStorage {
    #[inline]
    pub fn new() -> DefaultRetainStorage {
        Self { messages: RwLock::new(RetainTree::default()), retaineds: Counter::new() }
    }

    ///Drops every expired entry, returning how many were removed.
    pub async fn remove_expired_messages(&self) -> usize {
        let mut messages = self.messages.write().await;
        messages.retain(|tv| {
            if tv.is_expired() {
                self.retaineds.dec();
                false
            } else {
                true
            }
        })
    }
}

#[async_trait]
impl RetainStorage for DefaultRetainStorage {
    async fn set(&self, topic: &TopicPath, retained: Retained, expiry: Option<Duration>) -> Result<()> {
        let mut messages = self.messages.write().await;
        let old = messages.remove(topic);
        if !retained.publish.payload.is_empty() {
            messages.insert(topic, TimedValue::new(retained, expiry));
            if old.is_none() {
                self.retaineds.inc();
            }
        } else if old.is_some() {
            self.retaineds.dec();
        }
        Ok(())
    }

    async fn matches(&self, filter: &TopicPath) -> Result<Vec<(TopicPath, Retained)>> {
        let retaineds = self
            .messages
            .read()
            .await
            .matches(filter)
            .into_iter()
            .filter_map(|(t, r)| if r.is_expired() { None } else { Some((t, r.into_value())) })
            .collect::<Vec<_>>();
        Ok(retaineds)
    }

    async fn count(&self) -> isize {
        self.retaineds.count()
    }
}

pub type RetainTree<V> = Node<V>;

pub struct Node<V> {
    value: Option<V>,
    branches: HashMap<Segment, Node<V>>,
}

impl<V> Default for Node<V> {
    #[inline]
    fn default() -> Node<V> {
        Self { value: None, branches: HashMap::default() }
    }
}

impl<V> Node<V>
where
    V: Clone,
{
    #[inline]
    pub fn insert(&mut self, topic: &TopicPath, value: V) {
        let mut path = topic.segments().to_vec();
        path.reverse();
        self._insert(path, value);
    }

    #[inline]
    fn _insert(&mut self, mut path: Vec<Segment>, value: V) {
        if let Some(first) = path.pop() {
            self.branches.entry(first).or_default()._insert(path, value)
        } else {
            self.value.replace(value);
        }
    }

    #[inline]
    pub fn remove(&mut self, topic: &TopicPath) -> Option<V> {
        self._remove(topic.segments())
    }

    #[inline]
    fn _remove(&mut self, path: &[Segment]) -> Option<V> {
        if path.is_empty() {
            self.value.take()
        } else {
            let t = &path[0];
            if let Some(x) = self.branches.get_mut(t) {
                let res = x._remove(&path[1..]);
                if x.value.is_none() && x.branches.is_empty() {
                    self.branches.remove(t);
                }
                res
            } else {
                None
            }
        }
    }

    ///Every stored topic matching `filter`, wildcards expanded against the
    ///stored hierarchy.
    #[inline]
    pub fn matches(&self, filter: &TopicPath) -> Vec<(TopicPath, V)> {
        let mut out = Vec::new();
        self._matches(filter.segments(), 0, &mut Vec::new(), &mut out);
        out
    }

    fn _matches(&self, path: &[Segment], depth: usize, acc: &mut Vec<Segment>, out: &mut Vec<(TopicPath, V)>) {
        match path.first() {
            None => {
                if let Some(v) = self.value.as_ref() {
                    out.push((TopicPath::from(acc.clone()), v.clone()));
                }
            }
            Some(Segment::MultiLevel) => {
                //# matches the parent itself plus everything below it
                if let Some(v) = self.value.as_ref() {
                    out.push((TopicPath::from(acc.clone()), v.clone()));
                }
                for (k, n) in self.branches.iter() {
                    if depth == 0 && k.is_sys() {
                        continue;
                    }
                    acc.push(k.clone());
                    n._collect_all(acc, out);
                    acc.pop();
                }
            }
            Some(Segment::SingleLevel) => {
                for (k, n) in self.branches.iter() {
                    if depth == 0 && k.is_sys() {
                        continue;
                    }
                    acc.push(k.clone());
                    n._matches(&path[1..], depth + 1, acc, out);
                    acc.pop();
                }
            }
            Some(seg) => {
                if let Some(n) = self.branches.get(seg) {
                    acc.push(seg.clone());
                    n._matches(&path[1..], depth + 1, acc, out);
                    acc.pop();
                }
            }
        }
    }

    fn _collect_all(&self, acc: &mut Vec<Segment>, out: &mut Vec<(TopicPath, V)>) {
        if let Some(v) = self.value.as_ref() {
            out.push((TopicPath::from(acc.clone()), v.clone()));
        }
        for (k, n) in self.branches.iter() {
            acc.push(k.clone());
            n._collect_all(acc, out);
            acc.pop();
        }
    }

    ///Removes every value for which `f` returns false, pruning emptied
    ///branches; returns how many were removed.
    pub fn retain<F>(&mut self, mut f: F) -> usize
    where
        F: FnMut(&V) -> bool,
    {
        let mut removeds = 0;
        self._retain(&mut f, &mut removeds);
        removeds
    }

    fn _retain<F>(&mut self, f: &mut F, removeds: &mut usize)
    where
        F: FnMut(&V) -> bool,
    {
        self.branches.retain(|_, child| {
            child._retain(f, removeds);
            if let Some(v) = child.value.as_ref() {
                if !f(v) {
                    let _ = child.value.take();
                    *removeds += 1;
                }
            }
            !(child.value.is_none() && child.branches.is_empty())
        });
    }

    #[inline]
    pub fn values_size(&self) -> usize {
        let len: usize = self.branches.values().map(|n| n.values_size()).sum();
        if self.value.is_some() {
            len + 1
        } else {
            len
        }
    }
}
