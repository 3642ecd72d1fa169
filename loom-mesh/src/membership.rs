//! Workspace topic membership learned from gossip.

use std::collections::{HashMap, HashSet};

use crate::topic::Topic;

/// Topic → node ids, with a ceiling on tracked topics.
#[derive(Debug)]
pub struct WorkspaceMembership {
    topics: HashMap<Topic, HashSet<String>>,
    max_topics: usize,
}

impl WorkspaceMembership {
    /// Create an empty membership table.
    pub fn new(max_topics: usize) -> Self {
        Self {
            topics: HashMap::new(),
            max_topics,
        }
    }

    /// Record `node_id` joining `topic`.
    ///
    /// Returns `false` if the node was already a member, or if `topic` is
    /// new and the table already tracks the maximum number of topics.
    pub fn join(&mut self, topic: Topic, node_id: &str) -> bool {
        if !self.topics.contains_key(&topic) && self.topics.len() >= self.max_topics {
            tracing::warn!(
                "Ignoring workspace join for {:?}: tracking {} topics already",
                topic,
                self.max_topics
            );
            return false;
        }
        self.topics
            .entry(topic)
            .or_default()
            .insert(node_id.to_string())
    }

    /// Record `node_id` leaving `topic`. Empty topics are pruned.
    pub fn leave(&mut self, topic: &Topic, node_id: &str) -> bool {
        let Some(members) = self.topics.get_mut(topic) else {
            return false;
        };
        let removed = members.remove(node_id);
        if members.is_empty() {
            self.topics.remove(topic);
        }
        removed
    }

    /// Remove `node_id` from every topic, returning the topics it left.
    pub fn remove_node(&mut self, node_id: &str) -> Vec<Topic> {
        let mut left = Vec::new();
        self.topics.retain(|topic, members| {
            if members.remove(node_id) {
                left.push(*topic);
            }
            !members.is_empty()
        });
        left
    }

    /// Members of `topic`, sorted.
    pub fn peers(&self, topic: &Topic) -> Vec<String> {
        let mut peers: Vec<String> = self
            .topics
            .get(topic)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default();
        peers.sort();
        peers
    }

    /// Number of tracked topics.
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}
