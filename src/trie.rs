//! Subscription matching structure.
//!
//! A trie keyed by topic-path segments with explicit single-level (`+`) and
//! multi-level (`#`) child slots. Filters are inserted with their wildcard
//! segments already normalized to sentinels, so lookups walk literal branches
//! and the two wildcard slots independently. Matching a concrete topic
//! yields every stored filter together with what each of its wildcards
//! bound to, in one traversal.

use std::fmt::Debug;
use std::hash::Hash;

use crate::topic::{Binding, Segment, TopicPath};
use crate::types::{HashMap, HashSet};

pub type SubTree<V> = Node<V>;

/// One filter matched by a concrete topic.
#[derive(Debug, Clone)]
pub struct FilterMatch<V> {
    ///The stored (normalized) filter.
    pub filter: TopicPath,
    ///What the filter's wildcards captured from the topic.
    pub bindings: Vec<Binding>,
    pub values: Vec<V>,
}

pub struct Node<V> {
    values: HashSet<V>,
    branches: HashMap<Segment, Node<V>>,
}

impl<V> Default for Node<V> {
    #[inline]
    fn default() -> Node<V> {
        Self { values: HashSet::default(), branches: HashMap::default() }
    }
}

impl<V> Node<V>
where
    V: Hash + Eq + Clone + Debug,
{
    #[inline]
    pub fn insert(&mut self, filter: &TopicPath, value: V) -> bool {
        let mut path = filter.segments().to_vec();
        path.reverse();
        self._insert(path, value)
    }

    #[inline]
    fn _insert(&mut self, mut path: Vec<Segment>, value: V) -> bool {
        if let Some(first) = path.pop() {
            self.branches.entry(first).or_default()._insert(path, value)
        } else {
            self.values.insert(value)
        }
    }

    #[inline]
    pub fn remove(&mut self, filter: &TopicPath, value: &V) -> bool {
        self._remove(filter.segments(), value)
    }

    #[inline]
    fn _remove(&mut self, path: &[Segment], value: &V) -> bool {
        if path.is_empty() {
            self.values.remove(value)
        } else {
            let t = &path[0];
            if let Some(x) = self.branches.get_mut(t) {
                let res = x._remove(&path[1..], value);
                if x.values.is_empty() && x.branches.is_empty() {
                    self.branches.remove(t);
                }
                res
            } else {
                false
            }
        }
    }

    ///All filters matching the concrete `topic`, with wildcard bindings.
    #[inline]
    pub fn matches(&self, topic: &TopicPath) -> Vec<FilterMatch<V>> {
        let mut out = Vec::new();
        self._matches(topic.segments(), 0, &mut Vec::new(), &mut Vec::new(), &mut out);
        out
    }

    fn _matches(
        &self,
        path: &[Segment],
        depth: usize,
        sub_path: &mut Vec<Segment>,
        bound: &mut Vec<Binding>,
        out: &mut Vec<FilterMatch<V>>,
    ) {
        let add_to_out = |filter: Vec<Segment>, bindings: Vec<Binding>, values: &HashSet<V>, out: &mut Vec<FilterMatch<V>>| {
            if !values.is_empty() {
                out.push(FilterMatch {
                    filter: TopicPath::from(filter),
                    bindings,
                    values: values.iter().cloned().collect(),
                });
            }
        };

        if path.is_empty() {
            //A subscription ending in # also matches its parent.
            if let Some(n) = self.branches.get(&Segment::MultiLevel) {
                let mut filter = sub_path.clone();
                filter.push(Segment::MultiLevel);
                let mut bindings = bound.clone();
                bindings.push(Binding::Suffix(Vec::new()));
                add_to_out(filter, bindings, &n.values, out);
            }
            add_to_out(sub_path.clone(), bound.clone(), &self.values, out);
            return;
        }

        //Topic names starting with $ cannot be matched by filters starting
        //with a wildcard.
        if !(depth == 0 && path[0].is_sys()) {
            if let Some(n) = self.branches.get(&Segment::MultiLevel) {
                let mut filter = sub_path.clone();
                filter.push(Segment::MultiLevel);
                let mut bindings = bound.clone();
                bindings.push(Binding::Suffix(path.iter().map(Segment::bound_value).collect()));
                add_to_out(filter, bindings, &n.values, out);
            }

            if let Some(n) = self.branches.get(&Segment::SingleLevel) {
                sub_path.push(Segment::SingleLevel);
                bound.push(Binding::Level(depth, path[0].bound_value()));
                n._matches(&path[1..], depth + 1, sub_path, bound, out);
                sub_path.pop();
                bound.pop();
            }
        }

        if let Some(n) = self.branches.get(&path[0]) {
            sub_path.push(path[0].clone());
            n._matches(&path[1..], depth + 1, sub_path, bound, out);
            sub_path.pop();
        }
    }

    #[inline]
    pub fn values_size(&self) -> usize {
        let len: usize = self.branches.values().map(|n| n.values_size()).sum();
        self.values.len() + len
    }

    #[inline]
    pub fn nodes_size(&self) -> usize {
        let len: usize = self.branches.values().map(|n| n.nodes_size()).sum();
        self.branches.len() + len
    }
}
