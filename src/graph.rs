//! The routing graph: nonterminal branch nodes, terminals, composition, and
//! traversal.
//!
//! Grounded on `ajenga/router/__init__.py`'s node classes (`EqualNode`,
//! `PrefixNode`, `PredicateNode`, `MessageTypeNode`, `ProcessNode`) and on
//! `langgraph-core`'s graph-composition style: nodes are reference-counted
//! and mutated in place through interior mutability, so merging two
//! subscriptions never invalidates a pointer a third subscription already
//! holds (see [`merge_into`] for the invariant this relies on).

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

use tracing::trace;

use crate::error::Result;
use crate::event::Event;
use crate::keyfunc::{KeyFunction, Process, RouteValue};
use crate::message::MessageKind;
use crate::priority::Priority;
use crate::store::RouteState;

pub(crate) type BoxFut<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + 'a>>;

/// Reserved merge-axis id for `MessageTypeNode`s, which have no
/// [`KeyFunction`] of their own (their extraction logic — the distinct
/// element kinds present in a message — is fixed). Set to `u64::MAX`, and
/// the engine root's axis to `0`, so neither can collide with a real
/// `KeyFunction` id handed out by [`crate::keyfunc::fresh_id`] (which starts
/// at 1).
const MESSAGE_TYPE_AXIS_ID: u64 = u64::MAX;

/// A leaf of the graph: a registered handler plus its scheduling
/// annotations (spec §3).
pub struct Terminal {
    id: u64,
    pub name: String,
    pub priority: Priority,
    pub count_finished: bool,
    handler: Rc<dyn Fn(RouteState) -> BoxFut<'static, ()>>,
}

impl std::fmt::Debug for Terminal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Terminal")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish()
    }
}

static NEXT_TERMINAL_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

impl Terminal {
    pub fn new<F, Fut>(name: impl Into<String>, priority: Priority, count_finished: bool, handler: F) -> Rc<Terminal>
    where
        F: Fn(RouteState) -> Fut + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        Rc::new(Terminal {
            id: NEXT_TERMINAL_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            name: name.into(),
            priority,
            count_finished,
            handler: Rc::new(move |state| Box::pin(handler(state))),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn invoke(&self, state: RouteState) -> Result<()> {
        (self.handler)(state).await
    }
}

impl PartialEq for Terminal {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Terminal {}

/// A simple char-indexed trie over string keys: "at most one node per
/// path", so the longest registered prefix matching a text is unambiguous
/// (spec §4.3).
#[derive(Default)]
pub struct PrefixTrie {
    children: HashMap<char, Box<PrefixTrie>>,
    successors: Option<Vec<NodeRef>>,
}

impl PrefixTrie {
    pub fn insert_prefix(&mut self, prefix: &str) -> &mut Vec<NodeRef> {
        let mut node = self;
        for ch in prefix.chars() {
            node = node.children.entry(ch).or_insert_with(|| Box::new(PrefixTrie::default()));
        }
        node.successors.get_or_insert_with(Vec::new)
    }

    /// The longest registered prefix of `text`, and its successors.
    pub fn longest_match<'a>(&'a self, text: &str) -> Option<(usize, &'a [NodeRef])> {
        let mut node = self;
        let mut best: Option<(usize, &[NodeRef])> = None;
        let mut len = 0usize;
        if let Some(succs) = &node.successors {
            best = Some((0, succs));
        }
        for ch in text.chars() {
            let Some(next) = node.children.get(&ch) else { break };
            len += ch.len_utf8();
            node = next;
            if let Some(succs) = &node.successors {
                best = Some((len, succs));
            }
        }
        best
    }

    /// Merges every registered prefix of `other` into `self`, recursively
    /// merging successor lists where both tries already have the same
    /// prefix registered.
    fn merge_from(&mut self, other: &PrefixTrie) {
        if let Some(succs) = &other.successors {
            let dst = self.successors.get_or_insert_with(Vec::new);
            for s in succs {
                merge_into_successor_list(dst, s.clone());
            }
        }
        for (ch, child) in &other.children {
            let entry = self.children.entry(*ch).or_insert_with(|| Box::new(PrefixTrie::default()));
            entry.merge_from(child);
        }
    }
}

/// The branching logic of one internal graph node (spec §3's `Nonterminal`
/// variants).
pub enum NonterminalKind {
    Equal {
        keyfn: KeyFunction,
        successors: RefCell<HashMap<RouteValue, Vec<NodeRef>>>,
    },
    Prefix {
        keyfn: KeyFunction,
        trie: RefCell<PrefixTrie>,
    },
    Predicate {
        keyfn: KeyFunction,
        on_true: RefCell<Vec<NodeRef>>,
        on_false: RefCell<Vec<NodeRef>>,
    },
    MessageType {
        successors: RefCell<HashMap<MessageKind, Vec<NodeRef>>>,
    },
    Process {
        process: Process,
        successors: RefCell<Vec<NodeRef>>,
    },
}

pub struct Nonterminal {
    pub kind: NonterminalKind,
}

/// A node of the installed graph: shared, reference-counted, and mutated
/// through the `RefCell`s inside [`NonterminalKind`] rather than replaced —
/// see the module doc for why this makes `Rc<Node>` pointers held by an
/// exit list remain valid across merges.
pub enum Node {
    Nonterminal(Nonterminal),
    Terminal(Rc<Terminal>),
}

pub type NodeRef = Rc<Node>;

impl Nonterminal {
    /// The axis two nonterminals must share to be merge-compatible: a
    /// `KeyFunction`/`Process` id, or the fixed [`MESSAGE_TYPE_AXIS_ID`] for
    /// `MessageType` nodes.
    pub fn merge_axis(&self) -> u64 {
        match &self.kind {
            NonterminalKind::Equal { keyfn, .. } => keyfn.id(),
            NonterminalKind::Prefix { keyfn, .. } => keyfn.id(),
            NonterminalKind::Predicate { keyfn, .. } => keyfn.id(),
            NonterminalKind::Process { process, .. } => process.id(),
            NonterminalKind::MessageType { .. } => MESSAGE_TYPE_AXIS_ID,
        }
    }

    async fn route<'a>(&'a self, event: &'a Event, state: &'a RouteState) -> Result<Vec<(Rc<Terminal>, RouteState)>> {
        match &self.kind {
            NonterminalKind::Equal { keyfn, successors } => {
                let v = keyfn.call(event, &state.store).await?;
                let mut child = state.fork();
                child.store.set(keyfn.key(), v.clone());
                let succs = successors.borrow().get(&v).cloned().unwrap_or_default();
                route_all(&succs, event, &child).await
            }
            NonterminalKind::Prefix { keyfn, trie } => {
                let v = keyfn.call(event, &state.store).await?;
                let text = v.as_str().unwrap_or_default().to_string();
                let matched = trie.borrow().longest_match(&text).map(|(len, succs)| (len, succs.to_vec()));
                match matched {
                    Some((len, succs)) => {
                        let mut child = state.fork();
                        child.store.set(keyfn.key(), RouteValue::Str(text[..len].to_string()));
                        child.store.set(format!("{}_len", keyfn.key()), RouteValue::Int(len as i64));
                        child.push_positional(RouteValue::Str(text[len..].to_string()));
                        route_all(&succs, event, &child).await
                    }
                    None => Ok(Vec::new()),
                }
            }
            NonterminalKind::Predicate { keyfn, on_true, on_false } => {
                let v = keyfn.call(event, &state.store).await?;
                let matched = v.as_bool().unwrap_or(false);
                let succs = if matched {
                    on_true.borrow().clone()
                } else {
                    on_false.borrow().clone()
                };
                let mut child = state.fork();
                child.store.set(keyfn.key(), RouteValue::Bool(matched));
                route_all(&succs, event, &child).await
            }
            NonterminalKind::MessageType { successors } => {
                let kinds = event.message().map(|m| m.kinds()).unwrap_or_default();
                let map = successors.borrow();
                let mut out = Vec::new();
                for kind in kinds {
                    if let Some(succs) = map.get(&kind) {
                        let mut child = state.fork();
                        child.store.set("message.type", RouteValue::MessageKind(kind));
                        out.extend(route_all(succs, event, &child).await?);
                    }
                }
                Ok(out)
            }
            NonterminalKind::Process { process, successors } => {
                let child = process.call(event.clone(), state.fork()).await?;
                let succs = successors.borrow().clone();
                route_all(&succs, event, &child).await
            }
        }
    }
}

/// Routes `event` through `node`, accumulating `(terminal, state')` matches.
/// Boxed because nonterminal routing recurses into successor nodes.
pub fn route<'a>(node: &'a NodeRef, event: &'a Event, state: &'a RouteState) -> BoxFut<'a, Vec<(Rc<Terminal>, RouteState)>> {
    Box::pin(async move {
        match &**node {
            Node::Terminal(t) => Ok(vec![(t.clone(), state.clone())]),
            Node::Nonterminal(nt) => nt.route(event, state).await,
        }
    })
}

async fn route_all<'a>(nodes: &'a [NodeRef], event: &'a Event, state: &'a RouteState) -> Result<Vec<(Rc<Terminal>, RouteState)>> {
    let mut out = Vec::new();
    for n in nodes {
        out.extend(route(n, event, state).await?);
    }
    Ok(out)
}

/// Pushes `new_node` into `dst`, merging it into an existing element of
/// `dst` that shares its merge axis instead of appending a duplicate
/// discriminator (spec §4.2's node-merging rule).
fn merge_into_successor_list(dst: &mut Vec<NodeRef>, new_node: NodeRef) {
    if let Node::Nonterminal(new_nt) = &*new_node {
        let axis = new_nt.merge_axis();
        if let Some(existing) = dst.iter().find(|n| matches!(&***n, Node::Nonterminal(e) if e.merge_axis() == axis)) {
            if let Node::Nonterminal(existing_nt) = &**existing {
                merge_into(existing_nt, new_nt);
            }
            return;
        }
    }
    dst.push(new_node);
}

/// Recursively merges `src`'s successor structure into `dst`. `dst` and
/// `src` must share a merge axis (checked by callers). `src` itself is left
/// untouched — only its branches are copied (by `Rc` clone) into `dst` —
/// which is what keeps any other pointer still referencing `src` valid.
fn merge_into(dst: &Nonterminal, src: &Nonterminal) {
    match (&dst.kind, &src.kind) {
        (NonterminalKind::Equal { successors: d, .. }, NonterminalKind::Equal { successors: s, .. }) => {
            for (key, succs) in s.borrow().iter() {
                let mut dm = d.borrow_mut();
                let slot = dm.entry(key.clone()).or_default();
                for n in succs {
                    merge_into_successor_list(slot, n.clone());
                }
            }
        }
        (NonterminalKind::Prefix { trie: d, .. }, NonterminalKind::Prefix { trie: s, .. }) => {
            d.borrow_mut().merge_from(&s.borrow());
        }
        (
            NonterminalKind::Predicate { on_true: dt, on_false: df, .. },
            NonterminalKind::Predicate { on_true: st, on_false: sf, .. },
        ) => {
            for n in st.borrow().iter() {
                merge_into_successor_list(&mut dt.borrow_mut(), n.clone());
            }
            for n in sf.borrow().iter() {
                merge_into_successor_list(&mut df.borrow_mut(), n.clone());
            }
        }
        (NonterminalKind::MessageType { successors: d }, NonterminalKind::MessageType { successors: s }) => {
            for (kind, succs) in s.borrow().iter() {
                let mut dm = d.borrow_mut();
                let slot = dm.entry(*kind).or_default();
                for n in succs {
                    merge_into_successor_list(slot, n.clone());
                }
            }
        }
        (NonterminalKind::Process { successors: d, .. }, NonterminalKind::Process { successors: s, .. }) => {
            for n in s.borrow().iter() {
                merge_into_successor_list(&mut d.borrow_mut(), n.clone());
            }
        }
        _ => unreachable!("merge_into called on nodes with mismatched kinds despite matching merge_axis"),
    }
}

/// Attaches `new_entry` as the continuation reached after `exit` matches,
/// merging the two nodes in place if they share a merge axis. Returns the
/// node callers should treat as having replaced `new_entry` — `exit` itself
/// if a merge occurred, `new_entry` unchanged otherwise.
fn attach_entry(exit: &NodeRef, new_entry: &NodeRef) -> NodeRef {
    if let (Node::Nonterminal(ex), Node::Nonterminal(en)) = (&**exit, &**new_entry) {
        if ex.merge_axis() == en.merge_axis() {
            merge_into(ex, en);
            return exit.clone();
        }
    }
    push_into_own_slot(exit, new_entry.clone());
    new_entry.clone()
}

/// Pushes `successor` into the one successor slot a freshly-constructed
/// leaf nonterminal exposes (its pre-populated match value for
/// `Equal`/`Prefix`/`MessageType`, its `on_true` branch for `Predicate`, or
/// its bare successor list for `Process`). Panics if `exit` is a `Terminal`
/// — composition only ever attaches to open (not-yet-closed) exits.
fn push_into_own_slot(exit: &NodeRef, successor: NodeRef) {
    let Node::Nonterminal(nt) = &**exit else {
        unreachable!("attaching a successor to an already-closed (Terminal) exit")
    };
    match &nt.kind {
        NonterminalKind::Equal { successors, .. } => {
            for succs in successors.borrow_mut().values_mut() {
                merge_into_successor_list(succs, successor.clone());
            }
        }
        NonterminalKind::Prefix { trie, .. } => {
            let mut trie = trie.borrow_mut();
            // A freshly-built leaf has exactly one registered prefix; fold
            // the successor into every leaf slot the trie currently has.
            fn push_all(node: &mut PrefixTrie, successor: &NodeRef) {
                if let Some(succs) = &mut node.successors {
                    merge_into_successor_list(succs, successor.clone());
                }
                for child in node.children.values_mut() {
                    push_all(child, successor);
                }
            }
            push_all(&mut trie, &successor);
        }
        NonterminalKind::Predicate { on_true, .. } => {
            merge_into_successor_list(&mut on_true.borrow_mut(), successor);
        }
        NonterminalKind::MessageType { successors } => {
            for succs in successors.borrow_mut().values_mut() {
                merge_into_successor_list(succs, successor.clone());
            }
        }
        NonterminalKind::Process { successors, .. } => {
            merge_into_successor_list(&mut successors.borrow_mut(), successor);
        }
    }
}

/// A graph under construction: an entry point and the open exits that
/// further composition (or `apply`) extends.
#[derive(Clone)]
pub struct OpenGraph {
    pub entry: NodeRef,
    pub exits: Vec<NodeRef>,
}

/// A graph whose exits have all been attached to terminals — immutable from
/// the engine's point of view, and ready to `subscribe`.
#[derive(Clone)]
pub struct ClosedGraph {
    pub entry: NodeRef,
    pub terminals: Vec<Rc<Terminal>>,
}

impl OpenGraph {
    pub fn leaf(node: NodeRef) -> Self {
        OpenGraph {
            exits: vec![node.clone()],
            entry: node,
        }
    }

    /// Serial composition: every exit of `self` gets `other.entry` as its
    /// successor (merging where axes coincide); the composite's exits
    /// become `other`'s exits, substituting any exit that turned out to
    /// equal `other.entry` itself with the (possibly merged) surviving
    /// node.
    pub fn then(self, other: OpenGraph) -> OpenGraph {
        let mut surviving_entry = other.entry.clone();
        for exit in &self.exits {
            surviving_entry = attach_entry(exit, &other.entry);
        }
        let exits = other
            .exits
            .iter()
            .map(|e| if Rc::ptr_eq(e, &other.entry) { surviving_entry.clone() } else { e.clone() })
            .collect();
        OpenGraph {
            entry: self.entry,
            exits,
        }
    }

    /// Parallel union: both branches remain independently reachable.
    /// Implemented as a bare `Process` dispatcher node (merge axis = a
    /// fresh id, so two unions never accidentally merge with each other)
    /// whose "side effect" is a no-op and which has both entries as
    /// successors.
    pub fn union(self, other: OpenGraph) -> OpenGraph {
        let dispatcher = Process::new(crate::keyfunc::fresh_id(), |_event, state| async move { Ok(state) });
        let node = Rc::new(Node::Nonterminal(Nonterminal {
            kind: NonterminalKind::Process {
                process: dispatcher,
                successors: RefCell::new(vec![self.entry.clone(), other.entry.clone()]),
            },
        }));
        let mut exits = self.exits;
        exits.extend(other.exits);
        OpenGraph { entry: node, exits }
    }

    /// Attaches `terminal` to every exit, closing the graph.
    pub fn apply(self, terminal: Rc<Terminal>) -> Result<ClosedGraph> {
        let terminal_node: NodeRef = Rc::new(Node::Terminal(terminal.clone()));
        for exit in &self.exits {
            push_into_own_slot(exit, terminal_node.clone());
        }
        trace!(terminal = %terminal.name, exits = self.exits.len(), "closed graph");
        Ok(ClosedGraph {
            entry: self.entry,
            terminals: vec![terminal],
        })
    }
}

impl std::ops::BitAnd for OpenGraph {
    type Output = OpenGraph;
    fn bitand(self, rhs: OpenGraph) -> OpenGraph {
        self.then(rhs)
    }
}

impl std::ops::BitOr for OpenGraph {
    type Output = OpenGraph;
    fn bitor(self, rhs: OpenGraph) -> OpenGraph {
        self.union(rhs)
    }
}

/// Merges `incoming.entry` into `root` (the engine's always-matching root
/// or any other already-installed node), exactly as `then` attaches an
/// exit — subscribing two graphs built independently over the same
/// `KeyFunction` axis therefore converges on one shared discriminator node.
pub fn merge_into_root(root: &NodeRef, incoming: &NodeRef) -> Result<()> {
    if let (Node::Nonterminal(r), Node::Nonterminal(i)) = (&**root, &**incoming) {
        if r.merge_axis() == i.merge_axis() {
            merge_into(r, i);
            return Ok(());
        }
    }
    push_into_own_slot(root, incoming.clone());
    Ok(())
}

/// Constructs the engine's permanent root: an always-matching `Process`
/// node (a no-op side effect) whose successors are every subscribed
/// graph's entry.
pub fn new_root() -> NodeRef {
    let always = Process::new(0, |_event, state| async move { Ok(state) });
    Rc::new(Node::Nonterminal(Nonterminal {
        kind: NonterminalKind::Process {
            process: always,
            successors: RefCell::new(Vec::new()),
        },
    }))
}

/// Removes every terminal whose id is in `remove` from the graph rooted at
/// `node`, pruning nonterminals left with no successors anywhere as a
/// result. Used by `unsubscribe_terminals` to retire an ephemeral
/// `wait_until` terminal (or any other) without leaking the discriminator
/// nodes it was the sole reason to keep.
///
/// Visits shared (merged) nodes more than once when reachable via more than
/// one parent; harmless, since pruning an already-pruned node is a no-op.
pub fn unsubscribe_terminals(node: &NodeRef, remove: &std::collections::HashSet<u64>) {
    let Node::Nonterminal(nt) = &**node else { return };
    match &nt.kind {
        NonterminalKind::Equal { successors, .. } => {
            let mut map = successors.borrow_mut();
            for succs in map.values_mut() {
                prune_list(succs, remove);
            }
            map.retain(|_, v| !v.is_empty());
        }
        NonterminalKind::Prefix { trie, .. } => {
            prune_trie(&mut trie.borrow_mut(), remove);
        }
        NonterminalKind::Predicate { on_true, on_false, .. } => {
            prune_list(&mut on_true.borrow_mut(), remove);
            prune_list(&mut on_false.borrow_mut(), remove);
        }
        NonterminalKind::MessageType { successors } => {
            let mut map = successors.borrow_mut();
            for succs in map.values_mut() {
                prune_list(succs, remove);
            }
            map.retain(|_, v| !v.is_empty());
        }
        NonterminalKind::Process { successors, .. } => {
            prune_list(&mut successors.borrow_mut(), remove);
        }
    }
}

fn prune_list(list: &mut Vec<NodeRef>, remove: &std::collections::HashSet<u64>) {
    list.retain(|n| match &**n {
        Node::Terminal(t) => !remove.contains(&t.id()),
        Node::Nonterminal(_) => true,
    });
    for n in list.iter() {
        unsubscribe_terminals(n, remove);
    }
    list.retain(|n| match &**n {
        Node::Nonterminal(nt) => !nonterminal_is_empty(nt),
        Node::Terminal(_) => true,
    });
}

fn prune_trie(trie: &mut PrefixTrie, remove: &std::collections::HashSet<u64>) {
    if let Some(succs) = &mut trie.successors {
        prune_list(succs, remove);
        if succs.is_empty() {
            trie.successors = None;
        }
    }
    trie.children.retain(|_, child| {
        prune_trie(child, remove);
        !(child.successors.is_none() && child.children.is_empty())
    });
}

fn nonterminal_is_empty(nt: &Nonterminal) -> bool {
    match &nt.kind {
        NonterminalKind::Equal { successors, .. } => successors.borrow().is_empty(),
        NonterminalKind::Prefix { trie, .. } => {
            let trie = trie.borrow();
            trie.successors.is_none() && trie.children.is_empty()
        }
        NonterminalKind::Predicate { on_true, on_false, .. } => on_true.borrow().is_empty() && on_false.borrow().is_empty(),
        NonterminalKind::MessageType { successors } => successors.borrow().is_empty(),
        NonterminalKind::Process { successors, .. } => successors.borrow().is_empty(),
    }
}

/// Recursively counts nonterminal nodes reachable from `node`, for the
/// merging-property test in §8 ("exactly one nonterminal per shared
/// axis"). Visits each distinct `Rc` pointer once.
pub fn count_nonterminals(node: &NodeRef) -> usize {
    fn walk(node: &NodeRef, seen: &mut Vec<*const Node>) {
        let ptr = Rc::as_ptr(node);
        if seen.contains(&ptr) {
            return;
        }
        seen.push(ptr);
        let Node::Nonterminal(nt) = &**node else { return };
        let children: Vec<NodeRef> = match &nt.kind {
            NonterminalKind::Equal { successors, .. } => successors.borrow().values().flatten().cloned().collect(),
            NonterminalKind::Prefix { trie, .. } => {
                fn collect(n: &PrefixTrie, out: &mut Vec<NodeRef>) {
                    if let Some(s) = &n.successors {
                        out.extend(s.iter().cloned());
                    }
                    for c in n.children.values() {
                        collect(c, out);
                    }
                }
                let mut out = Vec::new();
                collect(&trie.borrow(), &mut out);
                out
            }
            NonterminalKind::Predicate { on_true, on_false, .. } => {
                on_true.borrow().iter().chain(on_false.borrow().iter()).cloned().collect()
            }
            NonterminalKind::MessageType { successors } => successors.borrow().values().flatten().cloned().collect(),
            NonterminalKind::Process { successors, .. } => successors.borrow().clone(),
        };
        for c in &children {
            walk(c, seen);
        }
    }
    let mut seen = Vec::new();
    walk(node, &mut seen);
    seen.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, NamedSource};
    use crate::keyfunc::fresh_id;
    use crate::store::KeyStore;

    fn event_type_node(id: u64, kind: EventKind) -> NodeRef {
        let keyfn = KeyFunction::sync("event.type", id, move |event, _store| RouteValue::EventKind(event.kind()));
        let mut successors = HashMap::new();
        successors.insert(RouteValue::EventKind(kind), Vec::new());
        Rc::new(Node::Nonterminal(Nonterminal {
            kind: NonterminalKind::Equal {
                keyfn,
                successors: RefCell::new(successors),
            },
        }))
    }

    fn sample_event(kind: EventKind) -> Event {
        match kind {
            EventKind::FriendMessage => Event::FriendMessage {
                message: crate::message::MessageChain::plain("hi"),
                message_id: 1,
                sender: crate::event::Sender {
                    qq: 1,
                    name: "a".into(),
                    permission: crate::event::GroupPermission::None,
                },
            },
            EventKind::GroupMessage => Event::GroupMessage {
                message: crate::message::MessageChain::plain("hi"),
                message_id: 1,
                sender: crate::event::Sender {
                    qq: 1,
                    name: "a".into(),
                    permission: crate::event::GroupPermission::None,
                },
                group: 1,
            },
            _ => Event::Unknown,
        }
    }

    #[tokio::test]
    async fn equality_dispatch_matches_only_its_own_branch() {
        let id = fresh_id();
        let friend_node = event_type_node(id, EventKind::FriendMessage);
        let h1 = Terminal::new("h1", Priority::Normal, true, |_s| async { Ok(()) });
        let friend_graph = OpenGraph::leaf(friend_node).apply(h1.clone()).unwrap();

        let event = sample_event(EventKind::FriendMessage);
        let source = NamedSource::new("bot");
        let state = RouteState::new(KeyStore::for_event(event.clone(), source));
        let matches = route(&friend_graph.entry, &event, &state).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].0.id(), h1.id());
    }

    #[tokio::test]
    async fn shared_axis_merges_into_one_discriminator_node() {
        let id = fresh_id();
        let a = event_type_node(id, EventKind::FriendMessage);
        let h1 = Terminal::new("h1", Priority::Normal, true, |_s| async { Ok(()) });
        let graph_a = OpenGraph::leaf(a).apply(h1).unwrap();

        let b = event_type_node(id, EventKind::GroupMessage);
        let h2 = Terminal::new("h2", Priority::Normal, true, |_s| async { Ok(()) });
        let graph_b = OpenGraph::leaf(b).apply(h2).unwrap();

        let root = new_root();
        merge_into_root(&root, &graph_a.entry).unwrap();
        merge_into_root(&root, &graph_b.entry).unwrap();

        // root (process) -> one merged EqualNode, not two.
        assert_eq!(count_nonterminals(&root), 2);
    }

    #[tokio::test]
    async fn prefix_match_records_matched_prefix_and_remainder() {
        let keyfn = KeyFunction::sync("text", fresh_id(), |event, _s| {
            RouteValue::Str(event.message().map(|m| m.as_plain()).unwrap_or_default())
        });
        let mut trie = PrefixTrie::default();
        trie.insert_prefix("!help");
        let node = Rc::new(Node::Nonterminal(Nonterminal {
            kind: NonterminalKind::Prefix {
                keyfn,
                trie: RefCell::new(trie),
            },
        }));
        let h = Terminal::new("h", Priority::Normal, true, |_s| async { Ok(()) });
        let graph = OpenGraph::leaf(node).apply(h).unwrap();

        let event = Event::FriendMessage {
            message: crate::message::MessageChain::plain("  !help me"),
            message_id: 1,
            sender: crate::event::Sender {
                qq: 1,
                name: "a".into(),
                permission: crate::event::GroupPermission::None,
            },
        };
        let source = NamedSource::new("bot");
        let state = RouteState::new(KeyStore::for_event(event.clone(), source));
        let matches = route(&graph.entry, &event, &state).await.unwrap();
        assert_eq!(matches.len(), 1);
        let (_, matched_state) = &matches[0];
        assert_eq!(matched_state.store.get("text"), Some(RouteValue::Str("!help".into())));
        assert_eq!(matched_state.positional[0], RouteValue::Str(" me".into()));
    }

    #[tokio::test]
    async fn unsubscribe_prunes_emptied_discriminator() {
        let id = fresh_id();
        let a = event_type_node(id, EventKind::FriendMessage);
        let h1 = Terminal::new("h1", Priority::Normal, true, |_s| async { Ok(()) });
        let graph_a = OpenGraph::leaf(a).apply(h1.clone()).unwrap();

        let root = new_root();
        merge_into_root(&root, &graph_a.entry).unwrap();
        assert_eq!(count_nonterminals(&root), 2);

        let mut remove = std::collections::HashSet::new();
        remove.insert(h1.id());
        unsubscribe_terminals(&root, &remove);

        // the only terminal reachable from the EqualNode is gone, so the
        // EqualNode itself is pruned, leaving only the root.
        assert_eq!(count_nonterminals(&root), 1);
    }
}
