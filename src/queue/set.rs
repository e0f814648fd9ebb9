//! Merged iteration over several queues
//!
//! A [`QueueSet`] composes member queues behind the shared
//! [`Queue`](super::Queue) surface and interleaves their elements in
//! lexical leaf-name order, which approximates global insertion order
//! because leaf names start with a timestamp. Each member keeps its
//! own cursor; `next` only advances the member it returned from.

use crate::error::Result;
use crate::queue::{Queue, QueueId};

struct Member {
    queue: Box<dyn Queue>,
    head: Option<String>,
}

/// A set of queues iterated as one
#[derive(Default)]
pub struct QueueSet {
    members: Vec<Member>,
    primed: bool,
}

fn leaf(name: &str) -> &str {
    name.rsplit_once('/').map(|(_, leaf)| leaf).unwrap_or(name)
}

impl QueueSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member queue; duplicates (by identity) are refused
    ///
    /// Adding a member resets iteration.
    pub fn add(&mut self, queue: impl Queue + 'static) -> bool {
        self.add_boxed(Box::new(queue))
    }

    /// Add an already-boxed member, as produced by
    /// [`Queue::boxed_copy`]
    pub fn add_boxed(&mut self, queue: Box<dyn Queue>) -> bool {
        if self.members.iter().any(|m| m.queue.id() == queue.id()) {
            return false;
        }
        self.members.push(Member { queue, head: None });
        self.primed = false;
        true
    }

    /// Drop the member with the given identity
    ///
    /// Removing a member resets iteration.
    pub fn remove(&mut self, id: &QueueId) -> bool {
        let before = self.members.len();
        self.members.retain(|m| m.queue.id() != id);
        self.primed = false;
        self.members.len() != before
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Total element count across members; transient, not a snapshot
    pub fn count(&self) -> Result<usize> {
        let mut total = 0;
        for member in &self.members {
            total += member.queue.count()?;
        }
        Ok(total)
    }

    /// Reset every member cursor and return the globally first element
    /// as a member index and element name
    pub fn first(&mut self) -> Result<Option<(usize, String)>> {
        for member in &mut self.members {
            member.head = member.queue.first()?;
        }
        self.primed = true;
        self.pick()
    }

    /// Return the next element in merged order
    pub fn next(&mut self) -> Result<Option<(usize, String)>> {
        if !self.primed {
            return self.first();
        }
        self.pick()
    }

    fn pick(&mut self) -> Result<Option<(usize, String)>> {
        let best = self
            .members
            .iter()
            .enumerate()
            .filter_map(|(index, member)| member.head.as_deref().map(|head| (index, head)))
            .min_by(|a, b| {
                leaf(a.1)
                    .cmp(leaf(b.1))
                    .then_with(|| a.1.cmp(b.1))
                    .then_with(|| a.0.cmp(&b.0))
            })
            .map(|(index, _)| index);
        let index = match best {
            Some(index) => index,
            None => return Ok(None),
        };
        let head = self.members[index].head.take();
        self.members[index].head = self.members[index].queue.next()?;
        Ok(head.map(|name| (index, name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_comparison() {
        assert_eq!(leaf("00000001/00000000000002"), "00000000000002");
        assert_eq!(leaf("bare"), "bare");
        // the bucket prefix must not dominate the merge order
        assert!(leaf("00000009/00000000000001") < leaf("00000000/00000000000002"));
    }
}
