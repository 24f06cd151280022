//! Sequence CRDT for source text.
//!
//! Each character remembers the character it was inserted after (`origin`)
//! and the one that followed it at the time (`right_origin`). Concurrent
//! inserts between the same pair are ordered by id, lower `(clock, client)`
//! first. Deleted characters stay in the sequence as tombstones so a
//! concurrent insert next to them lands in the right place.
//!
//! Visible characters are counted per fixed-size block of the sequence, so
//! index lookups and reading the text skip over runs of tombstones.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use super::{ClientId, CrdtError, CrdtResult, Intent, OpId};

/// Identifier of a single character: the inserting operation plus an offset
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CharId {
    pub op: OpId,
    pub offset: u32,
}

/// Text replica operation payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TextOp {
    Insert {
        origin: Option<CharId>,
        right_origin: Option<CharId>,
        text: String,
    },
    Delete {
        targets: Vec<CharId>,
    },
}

impl TextOp {
    pub(crate) fn with_op_ids(&self, renamed: &HashMap<OpId, OpId>) -> TextOp {
        let rename = |id: &CharId| CharId {
            op: renamed.get(&id.op).cloned().unwrap_or_else(|| id.op.clone()),
            offset: id.offset,
        };
        match self {
            TextOp::Insert {
                origin,
                right_origin,
                text,
            } => TextOp::Insert {
                origin: origin.as_ref().map(rename),
                right_origin: right_origin.as_ref().map(rename),
                text: text.clone(),
            },
            TextOp::Delete { targets } => TextOp::Delete {
                targets: targets.iter().map(rename).collect(),
            },
        }
    }
}

/// What a local text operation changed
#[derive(Debug, Clone, PartialEq)]
pub enum TextRevert {
    Inserted(Vec<CharId>),
    Deleted(Vec<CharId>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Item {
    id: CharId,
    origin: Option<CharId>,
    right_origin: Option<CharId>,
    ch: char,
    /// Clients whose deletes hit this character
    deleted_by: Vec<ClientId>,
}

impl Item {
    fn is_visible(&self) -> bool {
        self.deleted_by.is_empty()
    }
}

/// Items per visibility block
const BLOCK: usize = 64;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "TextItems", into = "TextItems")]
pub struct TextReplica {
    items: Vec<Item>,
    visible: usize,
    /// Visible characters in each `BLOCK`-sized slice of `items`
    blocks: Vec<u32>,
    /// Insert operations already integrated; an insert lands all its characters at once
    inserted: HashSet<OpId>,
}

/// Stored form of a text replica; the counters are rebuilt on load
#[derive(Serialize, Deserialize)]
struct TextItems {
    items: Vec<Item>,
}

impl From<TextItems> for TextReplica {
    fn from(stored: TextItems) -> Self {
        let items = stored.items;
        let visible = items.iter().filter(|item| item.is_visible()).count();
        let blocks = items
            .chunks(BLOCK)
            .map(|chunk| chunk.iter().filter(|item| item.is_visible()).count() as u32)
            .collect();
        let inserted = items.iter().map(|item| item.id.op.clone()).collect();
        Self {
            items,
            visible,
            blocks,
            inserted,
        }
    }
}

impl From<TextReplica> for TextItems {
    fn from(replica: TextReplica) -> Self {
        Self {
            items: replica.items,
        }
    }
}

impl TextReplica {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of visible characters
    pub fn len(&self) -> usize {
        self.visible
    }

    pub fn is_empty(&self) -> bool {
        self.visible == 0
    }

    /// Number of deleted characters still kept as tombstones
    pub fn tombstones(&self) -> usize {
        self.items.len() - self.visible
    }

    /// The visible text
    pub fn text(&self) -> String {
        let mut out = String::with_capacity(self.visible);
        for (block, &count) in self.blocks.iter().enumerate() {
            if count == 0 {
                continue;
            }
            out.extend(
                self.block_items(block)
                    .iter()
                    .filter(|item| item.is_visible())
                    .map(|item| item.ch),
            );
        }
        out
    }

    /// Id of the visible character at `index`, stable across remote edits
    pub fn char_id_at(&self, index: usize) -> Option<&CharId> {
        self.visible_position(index).map(|pos| &self.items[pos].id)
    }

    /// Current visible index of a character, if it is still visible
    pub fn index_of(&self, id: &CharId) -> Option<usize> {
        let pos = self.position(id)?;
        if !self.items[pos].is_visible() {
            return None;
        }
        let block = pos / BLOCK;
        let before: usize = self.blocks[..block].iter().map(|&c| c as usize).sum();
        let within = self.items[block * BLOCK..pos]
            .iter()
            .filter(|item| item.is_visible())
            .count();
        Some(before + within)
    }

    // Searches from the end; typing appends after the most recent characters.
    fn position(&self, id: &CharId) -> Option<usize> {
        self.items.iter().rposition(|item| &item.id == id)
    }

    fn visible_position(&self, index: usize) -> Option<usize> {
        let mut remaining = index;
        for (block, &count) in self.blocks.iter().enumerate() {
            let count = count as usize;
            if remaining >= count {
                remaining -= count;
                continue;
            }
            return self
                .block_items(block)
                .iter()
                .enumerate()
                .filter(|(_, item)| item.is_visible())
                .nth(remaining)
                .map(|(offset, _)| block * BLOCK + offset);
        }
        None
    }

    fn block_items(&self, block: usize) -> &[Item] {
        let start = block * BLOCK;
        let end = (start + BLOCK).min(self.items.len());
        &self.items[start..end]
    }

    /// Shift block counts after an item was inserted at `pos`.
    ///
    /// Every block from `pos` on gains the item that moved in at its start
    /// and loses the one pushed past its end.
    fn note_inserted(&mut self, pos: usize) {
        let len = self.items.len();
        if self.blocks.len() * BLOCK < len {
            self.blocks.push(0);
        }
        let first = pos / BLOCK;
        for block in first..self.blocks.len() {
            let entering = if block == first { pos } else { block * BLOCK };
            if self.items[entering].is_visible() {
                self.blocks[block] += 1;
            }
            let leaving = (block + 1) * BLOCK;
            if leaving < len && self.items[leaving].is_visible() {
                self.blocks[block] -= 1;
            }
        }
    }

    pub(crate) fn prepare(&self, intent: &Intent) -> CrdtResult<TextOp> {
        match intent {
            Intent::InsertText { index, text } => {
                if text.is_empty() {
                    return Err(CrdtError::Validation("cannot insert empty text".into()));
                }
                if *index > self.visible {
                    return Err(CrdtError::InvalidOperation(format!(
                        "insert index {} out of bounds (length {})",
                        index, self.visible
                    )));
                }
                let origin = match index {
                    0 => None,
                    _ => self
                        .visible_position(index - 1)
                        .map(|pos| self.items[pos].id.clone()),
                };
                Ok(self.insert_op(origin, text))
            }
            Intent::InsertAfter { origin, text } => {
                if text.is_empty() {
                    return Err(CrdtError::Validation("cannot insert empty text".into()));
                }
                if let Some(origin) = origin {
                    if self.position(origin).is_none() {
                        return Err(CrdtError::InvalidOperation(format!(
                            "unknown character {}:{}",
                            origin.op, origin.offset
                        )));
                    }
                }
                Ok(self.insert_op(origin.clone(), text))
            }
            Intent::DeleteText { index, len } => {
                if *len == 0 {
                    return Err(CrdtError::Validation("cannot delete an empty range".into()));
                }
                let end = index.checked_add(*len).filter(|end| *end <= self.visible);
                if end.is_none() {
                    return Err(CrdtError::InvalidOperation(format!(
                        "delete range {}+{} out of bounds (length {})",
                        index, len, self.visible
                    )));
                }
                let start = self.visible_position(*index).unwrap_or(self.items.len());
                let targets = self.items[start..]
                    .iter()
                    .filter(|item| item.is_visible())
                    .take(*len)
                    .map(|item| item.id.clone())
                    .collect();
                Ok(TextOp::Delete { targets })
            }
            Intent::DeleteChars { targets } => {
                let live: Vec<CharId> = targets
                    .iter()
                    .filter(|id| {
                        self.position(id)
                            .map_or(false, |pos| self.items[pos].is_visible())
                    })
                    .cloned()
                    .collect();
                if live.is_empty() {
                    return Err(CrdtError::InvalidOperation(
                        "no visible characters to delete".into(),
                    ));
                }
                Ok(TextOp::Delete { targets: live })
            }
            other => Err(CrdtError::InvalidOperation(format!(
                "{:?} intent cannot target a text replica",
                other.kind()
            ))),
        }
    }

    fn insert_op(&self, origin: Option<CharId>, text: &str) -> TextOp {
        let right_origin = match &origin {
            Some(origin) => self
                .position(origin)
                .and_then(|pos| self.items.get(pos + 1))
                .map(|item| item.id.clone()),
            None => self.items.first().map(|item| item.id.clone()),
        };
        TextOp::Insert {
            origin,
            right_origin,
            text: text.to_string(),
        }
    }

    pub(crate) fn apply(&mut self, id: &OpId, op: &TextOp) -> Option<TextRevert> {
        match op {
            TextOp::Insert {
                origin,
                right_origin,
                text,
            } => {
                let mut inserted = Vec::new();
                if !self.inserted.insert(id.clone()) {
                    return Some(TextRevert::Inserted(inserted));
                }
                let mut prev = origin.clone();
                for (offset, ch) in text.chars().enumerate() {
                    let char_id = CharId {
                        op: id.clone(),
                        offset: offset as u32,
                    };
                    self.integrate(Item {
                        id: char_id.clone(),
                        origin: prev.clone(),
                        right_origin: right_origin.clone(),
                        ch,
                        deleted_by: Vec::new(),
                    });
                    self.visible += 1;
                    inserted.push(char_id.clone());
                    prev = Some(char_id);
                }
                Some(TextRevert::Inserted(inserted))
            }
            TextOp::Delete { targets } => {
                let mut deleted = Vec::new();
                for target in targets {
                    let Some(pos) = self.position(target) else {
                        continue;
                    };
                    let item = &mut self.items[pos];
                    if !item.deleted_by.contains(&id.client) {
                        if item.deleted_by.is_empty() {
                            self.visible -= 1;
                            self.blocks[pos / BLOCK] -= 1;
                        }
                        item.deleted_by.push(id.client.clone());
                    }
                    deleted.push(target.clone());
                }
                Some(TextRevert::Deleted(deleted))
            }
        }
    }

    /// Place `item` between its origins, skipping concurrent inserts that sort before it.
    fn integrate(&mut self, item: Item) {
        let start = match &item.origin {
            Some(origin) => self.position(origin).map_or(0, |pos| pos + 1),
            None => 0,
        };
        let end = match &item.right_origin {
            Some(right) => self.position(right).unwrap_or(self.items.len()),
            None => self.items.len(),
        };

        let insert_at = {
            let mut insert_at = start;
            let mut before_origin: HashSet<&CharId> = HashSet::new();
            let mut conflicting: HashSet<&CharId> = HashSet::new();

            for scan in start..end {
                let other = &self.items[scan];
                before_origin.insert(&other.id);
                conflicting.insert(&other.id);

                if other.origin == item.origin {
                    if other.id < item.id {
                        insert_at = scan + 1;
                        conflicting.clear();
                    } else if other.right_origin == item.right_origin {
                        break;
                    }
                } else if let Some(other_origin) = other
                    .origin
                    .as_ref()
                    .filter(|origin| before_origin.contains(origin))
                {
                    if !conflicting.contains(other_origin) {
                        insert_at = scan + 1;
                        conflicting.clear();
                    }
                } else {
                    break;
                }
            }
            insert_at
        };

        self.items.insert(insert_at, item);
        self.note_inserted(insert_at);
    }

    /// Intents that undo a local operation without touching other clients' work.
    ///
    /// Inserted characters are deleted again if still visible. Deleted
    /// characters are re-inserted next to their tombstones unless another
    /// client deleted them too.
    pub(crate) fn revert_intents(&self, revert: &TextRevert, local: &str) -> Vec<Intent> {
        match revert {
            TextRevert::Inserted(ids) => {
                let targets: Vec<CharId> = ids
                    .iter()
                    .filter(|id| {
                        self.position(id)
                            .map_or(false, |pos| self.items[pos].is_visible())
                    })
                    .cloned()
                    .collect();
                if targets.is_empty() {
                    Vec::new()
                } else {
                    vec![Intent::DeleteChars { targets }]
                }
            }
            TextRevert::Deleted(ids) => {
                let wanted: HashSet<&CharId> = ids.iter().collect();
                let mut intents = Vec::new();
                let mut run: Option<(CharId, String)> = None;

                for item in &self.items {
                    if item.is_visible() {
                        if let Some((last, text)) = run.take() {
                            intents.push(Intent::InsertAfter {
                                origin: Some(last),
                                text,
                            });
                        }
                        continue;
                    }
                    let restorable = wanted.contains(&item.id)
                        && item.deleted_by.iter().all(|client| client == local);
                    if !restorable {
                        continue;
                    }
                    match run.as_mut() {
                        Some((last, text)) => {
                            *last = item.id.clone();
                            text.push(item.ch);
                        }
                        None => run = Some((item.id.clone(), item.ch.to_string())),
                    }
                }
                if let Some((last, text)) = run {
                    intents.push(Intent::InsertAfter {
                        origin: Some(last),
                        text,
                    });
                }
                intents
            }
        }
    }

    pub(crate) fn clear_intents(&self) -> Vec<Intent> {
        if self.visible == 0 {
            Vec::new()
        } else {
            vec![Intent::DeleteText {
                index: 0,
                len: self.visible,
            }]
        }
    }
}
