use std::ops::Bound;
use std::sync::Arc;

use super::codecs::{KeyCodec, ValCodec};
use super::page::Page;
use super::tree::BTree;
use crate::types::Result;

/// A cursor for iterating over a range of key-value pairs in a tree.
///
/// The cursor holds one leaf at a time as an immutable snapshot and finds the
/// next leaf by seeking past the last key it returned.
pub struct Cursor<'a, K: KeyCodec, V: ValCodec> {
    tree: &'a BTree<K, V>,
    upper: Bound<K>,
    leaf: Option<Arc<Page<K, V>>>,
    slot_index: usize,
    done: bool,
}

impl<'a, K: KeyCodec, V: ValCodec> Cursor<'a, K, V> {
    pub(crate) fn new(tree: &'a BTree<K, V>, lower: Bound<K>, upper: Bound<K>) -> Result<Self> {
        let mut cursor = Self {
            tree,
            upper,
            leaf: None,
            slot_index: 0,
            done: false,
        };
        cursor.position(lower.as_ref())?;
        Ok(cursor)
    }

    fn position(&mut self, lower: Bound<&K>) -> Result<()> {
        match self.tree.inner.seek(lower)? {
            Some((leaf, idx)) => {
                self.leaf = Some(leaf);
                self.slot_index = idx;
            }
            None => self.finish(),
        }
        Ok(())
    }

    /// Advances the cursor and returns the next key-value pair, if any.
    pub fn next(&mut self) -> Result<Option<(K, V)>> {
        loop {
            if self.done {
                return Ok(None);
            }
            let Some(leaf) = self.leaf.clone() else {
                self.finish();
                return Ok(None);
            };
            if self.slot_index >= leaf.key_count() {
                match leaf.keys().last() {
                    Some(last) => {
                        let last = last.clone();
                        self.position(Bound::Excluded(&last))?;
                    }
                    None => self.finish(),
                }
                continue;
            }
            let key = &leaf.keys()[self.slot_index];
            if self.is_past_upper(key) {
                self.finish();
                return Ok(None);
            }
            let value = leaf.values()[self.slot_index].clone();
            self.slot_index += 1;
            return Ok(Some((key.clone(), value)));
        }
    }

    fn is_past_upper(&self, key: &K) -> bool {
        match &self.upper {
            Bound::Unbounded => false,
            Bound::Included(upper) => key > upper,
            Bound::Excluded(upper) => key >= upper,
        }
    }

    fn finish(&mut self) {
        self.done = true;
        self.leaf = None;
    }
}
