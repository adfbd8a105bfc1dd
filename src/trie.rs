use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use crate::topic::{Part, TopicKind, WILDCARD};

/// Stripe count of the per-topic-hash lock table. Must be a power of two.
const HASH_LOCKS: usize = 64;

const ROOT: usize = 0;

/// A topic as tracked by the trie: its digest and the file offset of its
/// most recent window block (0 when none has been written yet).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TopicHandle {
    pub hash: u64,
    pub offset: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct NodeKey {
    query: u32,
    wildchars: u8,
}

#[derive(Debug)]
struct Node {
    key: NodeKey,
    parent: usize,
    depth: u8,
    children: HashMap<NodeKey, usize>,
    topics: Vec<TopicHandle>,
}

impl Node {
    fn new(key: NodeKey, parent: usize) -> Self {
        Self {
            key,
            parent,
            depth: 0,
            children: HashMap::new(),
            topics: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct Inner {
    // Arena of nodes with parent indices; freed slots are recycled.
    nodes: Vec<Node>,
    free: Vec<usize>,
    // topic hash -> node index, for O(1) offset updates.
    summary: HashMap<u64, usize>,
}

impl Inner {
    fn alloc(&mut self, node: Node) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }
}

/// Trie of topic parts mapping topics and wildcard queries to the topic
/// hashes they address, and tracking the newest window block offset per
/// hash. Readers share a lock on the tree; writers additionally serialize
/// per topic hash through a striped lock table.
#[derive(Debug)]
pub struct Trie {
    inner: RwLock<Inner>,
    hash_locks: Vec<Mutex<()>>,
}

impl Default for Trie {
    fn default() -> Self {
        Self::new()
    }
}

impl Trie {
    pub fn new() -> Self {
        let root = Node::new(
            NodeKey {
                query: 0,
                wildchars: 0,
            },
            ROOT,
        );
        Self {
            inner: RwLock::new(Inner {
                nodes: vec![root],
                free: Vec::new(),
                summary: HashMap::new(),
            }),
            hash_locks: (0..HASH_LOCKS).map(|_| Mutex::new(())).collect(),
        }
    }

    fn hash_lock(&self, hash: u64) -> &Mutex<()> {
        &self.hash_locks[hash as usize & (HASH_LOCKS - 1)]
    }

    /// Number of distinct topics in the trie.
    pub fn count(&self) -> usize {
        self.inner.read().unwrap().summary.len()
    }

    /// Adds a topic under the given parts. Idempotent on the hash; a
    /// repeated add leaves the existing node untouched.
    pub fn add(&self, hash: u64, parts: &[Part], depth: u8) -> bool {
        let _hold = self.hash_lock(hash).lock().unwrap();
        let mut inner = self.inner.write().unwrap();
        if inner.summary.contains_key(&hash) {
            return true;
        }

        let mut curr = ROOT;
        for p in parts {
            let key = NodeKey {
                query: p.query,
                wildchars: p.wildchars,
            };
            curr = match inner.nodes[curr].children.get(&key).copied() {
                Some(child) => child,
                None => {
                    let child = inner.alloc(Node::new(key, curr));
                    inner.nodes[curr].children.insert(key, child);
                    child
                }
            };
        }

        add_unique(
            &mut inner.nodes[curr].topics,
            TopicHandle { hash, offset: 0 },
        );
        inner.nodes[curr].depth = depth;
        inner.summary.insert(hash, curr);
        true
    }

    /// Returns all topics addressed by the query, deduplicated by hash in
    /// DFS order.
    pub fn lookup(&self, query: &[Part], depth: u8, kind: TopicKind) -> Vec<TopicHandle> {
        let inner = self.inner.read().unwrap();
        let mut found = Vec::new();
        // Bound on wildcard descent so a pathological query cannot explode.
        let budget = 2 * query.len() + 16;
        walk(&inner, query, depth, kind, ROOT, budget, &mut found);
        found
    }

    /// Offset of the newest window block for the topic hash.
    pub fn get_offset(&self, hash: u64) -> Option<i64> {
        let inner = self.inner.read().unwrap();
        let &node = inner.summary.get(&hash)?;
        inner.nodes[node]
            .topics
            .iter()
            .find(|t| t.hash == hash)
            .map(|t| t.offset)
    }

    /// Records a new newest-block offset for the topic hash. Returns false
    /// if the topic is not in the trie.
    pub fn set_offset(&self, hash: u64, offset: i64) -> bool {
        let mut inner = self.inner.write().unwrap();
        let Some(&node) = inner.summary.get(&hash) else {
            return false;
        };
        add_unique(&mut inner.nodes[node].topics, TopicHandle { hash, offset });
        true
    }

    /// Detaches the topic and prunes any ancestors left empty.
    pub fn remove(&self, hash: u64) -> bool {
        let _hold = self.hash_lock(hash).lock().unwrap();
        let mut inner = self.inner.write().unwrap();
        let Some(node) = inner.summary.remove(&hash) else {
            return false;
        };
        inner.nodes[node].topics.retain(|t| t.hash != hash);

        let mut curr = node;
        while curr != ROOT
            && inner.nodes[curr].topics.is_empty()
            && inner.nodes[curr].children.is_empty()
        {
            let parent = inner.nodes[curr].parent;
            let key = inner.nodes[curr].key;
            inner.nodes[parent].children.remove(&key);
            inner.free.push(curr);
            curr = parent;
        }
        true
    }
}

fn add_unique(topics: &mut Vec<TopicHandle>, handle: TopicHandle) -> bool {
    for t in topics.iter_mut() {
        if t.hash == handle.hash {
            t.offset = handle.offset;
            return false;
        }
    }
    topics.push(handle);
    true
}

fn collect(found: &mut Vec<TopicHandle>, topics: &[TopicHandle]) {
    for t in topics {
        if !found.iter().any(|f| f.hash == t.hash) {
            found.push(*t);
        }
    }
}

fn walk(
    inner: &Inner,
    query: &[Part],
    depth: u8,
    kind: TopicKind,
    node: usize,
    budget: usize,
    found: &mut Vec<TopicHandle>,
) {
    if budget == 0 {
        return;
    }
    let n = &inner.nodes[node];

    // A node matches when the full query path was consumed down to it, or,
    // for static queries, when it sits behind a multi-level wildcard edge.
    if n.depth == depth || (kind == TopicKind::Static && n.key.query == WILDCARD) {
        collect(found, &n.topics);
    }

    if query.is_empty() {
        return;
    }
    let q = query[0];
    for (&key, &child) in &n.children {
        if key.query == q.query && key.wildchars == q.wildchars {
            walk(inner, &query[1..], depth, kind, child, budget - 1, found);
        } else if key.query == q.query && query.len() >= key.wildchars as usize + 1 {
            walk(
                inner,
                &query[key.wildchars as usize + 1..],
                depth,
                kind,
                child,
                budget - 1,
                found,
            );
        } else if key.query == WILDCARD {
            walk(inner, query, depth, kind, child, budget - 1, found);
        }
    }
}
