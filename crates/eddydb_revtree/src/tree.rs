//! Arena-backed revision trees.

use crate::error::{TreeError, TreeResult};
use crate::raw;
use crate::rev::{RevBody, RevFlags, RevId, Revision};

/// Result of inserting a revision history into a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertOutcome {
    /// Number of revisions actually added.
    pub added: usize,
    /// Index of the inserted revision (or the existing one, if nothing
    /// was added).
    pub index: usize,
    /// True if the insertion created (or deepened) a conflicting branch.
    pub conflict: bool,
}

/// A document's revision tree.
///
/// Revisions live in an arena `Vec`; parent links are indices into it.
/// The tree owns all revision bodies. Sorting for encoding places leaves
/// first, non-deleted before deleted, ties broken by descending revision
/// ID, and rewrites parent indices to match.
#[derive(Debug, Clone, Default)]
pub struct RevTree {
    revs: Vec<Revision>,
}

impl RevTree {
    /// Creates an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes a tree from its on-disk form.
    ///
    /// `cur_seq` is the sequence under which the containing record was
    /// stored; revisions encoded with sequence zero inherit it.
    ///
    /// # Errors
    ///
    /// Fails on any codec error, or if the decoded revisions do not form
    /// a tree with exactly one root.
    pub fn decode(data: &[u8], cur_seq: u64) -> TreeResult<Self> {
        let revs = raw::decode(data, cur_seq)?;
        let tree = Self { revs };
        tree.check_root()?;
        Ok(tree)
    }

    /// Sorts the tree into encoding order and returns the encoded bytes.
    pub fn encode(&mut self) -> Vec<u8> {
        self.sort();
        raw::encode(&self.revs)
    }

    /// Number of revisions in the tree.
    #[must_use]
    pub fn len(&self) -> usize {
        self.revs.len()
    }

    /// True if the tree has no revisions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.revs.is_empty()
    }

    /// Returns the revision at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> &Revision {
        &self.revs[index]
    }

    /// Iterates over all revisions.
    pub fn iter(&self) -> impl Iterator<Item = &Revision> {
        self.revs.iter()
    }

    /// Finds the index of a revision by ID.
    #[must_use]
    pub fn find(&self, rev_id: &RevId) -> Option<usize> {
        self.revs.iter().position(|r| &r.rev_id == rev_id)
    }

    /// Returns the indices of all leaf revisions.
    #[must_use]
    pub fn leaves(&self) -> Vec<usize> {
        self.revs
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_leaf())
            .map(|(i, _)| i)
            .collect()
    }

    /// Returns the index of the current revision: the leaf with the
    /// highest priority (non-deleted first, then highest revision ID).
    #[must_use]
    pub fn current(&self) -> Option<usize> {
        self.revs
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_leaf())
            .min_by(|(_, a), (_, b)| a.priority_cmp(b))
            .map(|(i, _)| i)
    }

    /// True if more than one leaf is not deleted.
    #[must_use]
    pub fn is_conflicted(&self) -> bool {
        self.revs.iter().filter(|r| r.is_active()).count() > 1
    }

    /// Returns the revision history of `index`, newest first, as IDs.
    #[must_use]
    pub fn history_of(&self, index: usize) -> Vec<RevId> {
        let mut history = Vec::new();
        let mut cur = Some(index);
        while let Some(i) = cur {
            history.push(self.revs[i].rev_id.clone());
            cur = self.revs[i].parent.map(usize::from);
        }
        history
    }

    /// Returns the parent index of `index`, if any.
    #[must_use]
    pub fn parent_of(&self, index: usize) -> Option<usize> {
        self.revs[index].parent.map(usize::from)
    }

    /// Assigns a local sequence to the revision at `index`.
    pub fn set_sequence(&mut self, index: usize, sequence: u64) {
        self.revs[index].sequence = sequence;
    }

    /// Largest sequence recorded in the tree.
    #[must_use]
    pub fn max_sequence(&self) -> u64 {
        self.revs.iter().map(|r| r.sequence).max().unwrap_or(0)
    }

    /// Inserts a revision with its history, newest first.
    ///
    /// `history[0]` is the revision being inserted; the rest are its
    /// ancestors. The chain must connect to an existing revision (or the
    /// tree must be empty). If the connection point already has another
    /// child, the insert creates a conflicting branch; this is an error
    /// unless `allow_conflict` is set.
    ///
    /// The superseded leaf keeps its body (`KEEP_BODY`) so that conflict
    /// resolvers can read the common ancestor; older non-leaf bodies are
    /// pruned.
    ///
    /// # Errors
    ///
    /// [`TreeError::AlreadyExists`] if `history[0]` is already present,
    /// [`TreeError::Disconnected`] if the chain does not reach the tree,
    /// [`TreeError::Conflict`] if a branch would be created and
    /// `allow_conflict` is false.
    pub fn insert_history(
        &mut self,
        history: &[RevId],
        body: RevBody,
        deleted: bool,
        has_attachments: bool,
        allow_conflict: bool,
    ) -> TreeResult<InsertOutcome> {
        if history.is_empty() {
            return Err(TreeError::Disconnected);
        }
        if let Some(existing) = self.find(&history[0]) {
            return Err(TreeError::AlreadyExists(
                self.revs[existing].rev_id.as_str().to_owned(),
            ));
        }

        // Find the deepest ancestor that already exists.
        let mut attach: Option<usize> = None;
        let mut new_count = history.len();
        for (i, rev_id) in history.iter().enumerate().skip(1) {
            if let Some(index) = self.find(rev_id) {
                attach = Some(index);
                new_count = i;
                break;
            }
        }
        if attach.is_none() && !self.is_empty() {
            return Err(TreeError::Disconnected);
        }

        let conflict = match attach {
            Some(index) => !self.revs[index].is_leaf(),
            None => false,
        };
        if conflict && !allow_conflict {
            return Err(TreeError::Conflict {
                rev_id: history[0].as_str().to_owned(),
            });
        }

        // The attach point stops being a leaf; retain its body for
        // conflict resolution.
        if let Some(index) = attach {
            if self.revs[index].is_leaf() {
                self.revs[index].flags = self.revs[index]
                    .flags
                    .without(RevFlags::LEAF)
                    .union(RevFlags::KEEP_BODY);
            }
        }

        // Add the missing ancestors oldest-first, then the new revision.
        let mut parent = attach;
        for rev_id in history[..new_count].iter().rev() {
            let mut rev = Revision::new(rev_id.clone());
            rev.parent = parent.map(|p| p as u16);
            rev.flags = RevFlags::NEW;
            parent = Some(self.push(rev));
        }
        let index = parent.expect("at least one revision was added");
        let leaf = &mut self.revs[index];
        leaf.flags = leaf.flags.union(RevFlags::LEAF);
        if deleted {
            leaf.flags = leaf.flags.union(RevFlags::DELETED);
        }
        if has_attachments {
            leaf.flags = leaf.flags.union(RevFlags::HAS_ATTACHMENTS);
        }
        leaf.body = body;

        self.prune_bodies();
        Ok(InsertOutcome {
            added: new_count,
            index,
            conflict,
        })
    }

    /// Sorts revisions into encoding order (leaves first, non-deleted
    /// before deleted, descending revision ID) and rewrites parent
    /// indices to match.
    pub fn sort(&mut self) {
        let mut order: Vec<usize> = (0..self.revs.len()).collect();
        order.sort_by(|&a, &b| self.revs[a].priority_cmp(&self.revs[b]));

        let mut remap = vec![0u16; self.revs.len()];
        for (new_index, &old_index) in order.iter().enumerate() {
            remap[old_index] = new_index as u16;
        }
        let mut sorted = Vec::with_capacity(self.revs.len());
        for &old_index in &order {
            let mut rev = self.revs[old_index].clone();
            rev.parent = rev.parent.map(|p| remap[p as usize]);
            sorted.push(rev);
        }
        self.revs = sorted;
    }

    fn push(&mut self, rev: Revision) -> usize {
        self.revs.push(rev);
        self.revs.len() - 1
    }

    /// Drops bodies of non-leaf revisions that are not flagged to keep
    /// them, and KEEP_BODY flags of revisions no leaf points at.
    fn prune_bodies(&mut self) {
        let leaf_parents: Vec<usize> = self
            .revs
            .iter()
            .filter(|r| r.is_leaf())
            .filter_map(|r| r.parent.map(usize::from))
            .collect();
        for (index, rev) in self.revs.iter_mut().enumerate() {
            if rev.is_leaf() {
                continue;
            }
            if !leaf_parents.contains(&index) {
                rev.flags = rev.flags.without(RevFlags::KEEP_BODY);
            }
            if !rev.flags.contains(RevFlags::KEEP_BODY) {
                rev.body = RevBody::None;
            }
        }
    }

    fn check_root(&self) -> TreeResult<()> {
        if self.revs.is_empty() {
            return Ok(());
        }
        let roots = self.revs.iter().filter(|r| r.parent.is_none()).count();
        if roots != 1 {
            return Err(TreeError::BadRootCount(roots));
        }
        Ok(())
    }
}
