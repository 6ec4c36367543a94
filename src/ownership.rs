// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Ownership tree with cascading, exactly-once destruction.
//!
//! Every resource the proxy hands out (engine context, caller registry,
//! session, shared memory region) is a [`ResourceNode`]. A node owns a release
//! action and an optional set of children. Destroying a node destroys every
//! still-live child first, then runs its own release action.
//!
//! ## Guarantees
//!
//! - A release action runs at most once, no matter how many threads race to
//!   destroy the node or its ancestors.
//! - A child destroyed directly leaves its parent's child set, so a later
//!   cascade from the parent never sees it again.
//! - A destroyed node can never be attached again.
//!
//! ## Locking
//!
//! Each node guards its state with its own mutex. `destroy` never holds two
//! node locks at once and never runs a release action while holding a lock.
//! `attach` locks child then parent; the tree is acyclic, so that order is
//! consistent.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

type ReleaseAction = Box<dyn FnOnce() + Send + 'static>;

/// Ownership tree violations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OwnershipError {
    #[error("{kind} node {id} is already attached or destroyed")]
    AlreadyAttached { kind: &'static str, id: u64 },

    #[error("{kind} node {id} is already destroyed")]
    ParentDestroyed { kind: &'static str, id: u64 },
}

struct NodeState {
    destroyed: bool,
    parent: Option<Weak<ResourceNode>>,
    children: HashMap<u64, Arc<ResourceNode>>,
    release: Option<ReleaseAction>,
}

/// A member of the ownership tree.
pub struct ResourceNode {
    id: u64,
    kind: &'static str,
    state: Mutex<NodeState>,
}

impl ResourceNode {
    /// Create a detached node that runs `release` when destroyed.
    pub fn new<F>(kind: &'static str, release: F) -> Arc<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::build(kind, Some(Box::new(release)))
    }

    /// Create a detached node with no release action of its own.
    pub fn holder(kind: &'static str) -> Arc<Self> {
        Self::build(kind, None)
    }

    fn build(kind: &'static str, release: Option<ReleaseAction>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            state: Mutex::new(NodeState {
                destroyed: false,
                parent: None,
                children: HashMap::new(),
                release,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    fn lock(&self) -> MutexGuard<'_, NodeState> {
        // A panicking release action must not wedge the rest of the tree.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register this node as a child of `parent`.
    ///
    /// # Errors
    /// - `AlreadyAttached` if this node already has a parent or is destroyed.
    /// - `ParentDestroyed` if `parent` has been destroyed.
    pub fn attach(self: &Arc<Self>, parent: &Arc<ResourceNode>) -> Result<(), OwnershipError> {
        let already_attached = OwnershipError::AlreadyAttached {
            kind: self.kind,
            id: self.id,
        };
        if Arc::ptr_eq(self, parent) {
            return Err(already_attached);
        }

        let mut me = self.lock();
        if me.destroyed || me.parent.is_some() {
            return Err(already_attached);
        }

        let mut parent_state = parent.lock();
        if parent_state.destroyed {
            return Err(OwnershipError::ParentDestroyed {
                kind: parent.kind,
                id: parent.id,
            });
        }
        parent_state.children.insert(self.id, Arc::clone(self));
        me.parent = Some(Arc::downgrade(parent));
        Ok(())
    }

    /// Destroy this node and, first, every live child beneath it.
    ///
    /// Calling this on an already destroyed node is a no-op.
    pub fn destroy(&self) {
        let (parent, children, release) = {
            let mut me = self.lock();
            if me.destroyed {
                return;
            }
            me.destroyed = true;
            (
                me.parent.take(),
                std::mem::take(&mut me.children),
                me.release.take(),
            )
        };

        if let Some(parent) = parent.and_then(|weak| weak.upgrade()) {
            parent.lock().children.remove(&self.id);
        }

        for child in children.into_values() {
            if child.is_destroyed() {
                continue;
            }
            child.unlink();
            child.destroy();
        }

        if let Some(release) = release {
            release();
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }

    /// Number of live children currently attached.
    pub fn child_count(&self) -> usize {
        self.lock().children.len()
    }

    /// Drop the parent link so the child's own destroy does not reach back
    /// into a parent that is already tearing it down.
    fn unlink(&self) {
        self.lock().parent = None;
    }
}

impl fmt::Debug for ResourceNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("ResourceNode")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("destroyed", &state.destroyed)
            .field("children", &state.children.len())
            .finish()
    }
}
