use crate::bam::ReferenceSequence;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Bidirectional mapping between reference sequence names and their 0-based
/// ids, with the declared lengths. Built once from the file header and
/// embedded in persisted indexes.
#[derive(Default, Serialize, Deserialize)]
pub struct SequenceIndex {
    name_to_id: HashMap<String, u32>,
    id_to_entry: Vec<(String, u32)>,
}

impl SequenceIndex {
    pub fn new() -> Self {
        SequenceIndex {
            name_to_id: HashMap::new(),
            id_to_entry: Vec::new(),
        }
    }

    /// Build from a parsed reference dictionary; ids follow header order.
    pub fn from_references(references: &[ReferenceSequence]) -> Self {
        let mut index = Self::new();
        for reference in references {
            index.get_or_insert_id(&reference.name, Some(reference.length));
        }
        index
    }

    pub fn get_or_insert_id(&mut self, name: &str, length: Option<u32>) -> u32 {
        if let Some(&id) = self.name_to_id.get(name) {
            return id;
        }
        let id = self.id_to_entry.len() as u32;
        self.name_to_id.insert(name.to_owned(), id);
        self.id_to_entry.push((name.to_owned(), length.unwrap_or(0)));
        id
    }

    pub fn get_id(&self, name: &str) -> Option<u32> {
        self.name_to_id.get(name).copied()
    }

    pub fn get_name(&self, id: u32) -> Option<&str> {
        self.id_to_entry.get(id as usize).map(|(name, _)| name.as_str())
    }

    pub fn get_len_from_id(&self, id: u32) -> Option<u32> {
        self.id_to_entry.get(id as usize).map(|&(_, len)| len)
    }

    pub fn len(&self) -> usize {
        self.id_to_entry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_entry.is_empty()
    }

    /// Iterate `(id, name, length)` in id order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &str, u32)> {
        self.id_to_entry
            .iter()
            .enumerate()
            .map(|(id, (name, len))| (id as u32, name.as_str(), *len))
    }
}
