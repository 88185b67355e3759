//! Segment ID lists used by the `in_segment_list` / `not_in_segment_list` operators.
//!
//! Lists are append-only files of `+<hashed id>` / `-<hashed id>` lines. The SDK remembers how
//! many bytes of a list it has consumed, and only downloads the tail on the next sync.
use std::collections::{HashMap, HashSet};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// All known ID lists by name.
pub type IdLists = HashMap<String, IdList>;

/// List description as returned by the `get_id_lists` endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdListMetadata {
    /// List name.
    pub name: String,
    /// Size of the remote file in bytes.
    pub size: u64,
    /// Where the file is downloaded from.
    #[serde(default)]
    pub url: Option<String>,
    /// A list with a newer creation time replaces the local copy.
    #[serde(default)]
    pub creation_time: u64,
    /// A different file id means the list was recreated.
    #[serde(rename = "fileID", default)]
    pub file_id: Option<String>,
}

/// A locally accumulated ID list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdList {
    /// List name.
    pub name: String,
    /// Number of bytes of the remote file applied so far.
    pub size: u64,
    /// Creation time of the remote file the ids came from.
    pub creation_time: u64,
    /// Where the remote file is downloaded from.
    pub url: Option<String>,
    /// Identity of the remote file.
    pub file_id: Option<String>,
    /// Hashed ids currently in the list.
    pub ids: HashSet<String>,
}

/// An ID list file contained a line that is neither `+id` nor `-id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("id list content is corrupted")]
pub struct CorruptedIdList;

impl IdList {
    /// An empty list that will be filled from the file described by `metadata`.
    pub fn new(metadata: &IdListMetadata) -> IdList {
        IdList {
            name: metadata.name.clone(),
            size: 0,
            creation_time: metadata.creation_time,
            url: metadata.url.clone(),
            file_id: metadata.file_id.clone(),
            ids: HashSet::new(),
        }
    }

    /// Return `true` if `remote` describes a different file that supersedes this one.
    pub fn is_replaced_by(&self, remote: &IdListMetadata) -> bool {
        self.file_id != remote.file_id && remote.creation_time >= self.creation_time
    }

    /// Apply a chunk of the list file. Every non-empty line must start with `+` or `-`.
    ///
    /// On error the list is left untouched.
    pub fn apply_delta(&mut self, content: &str) -> Result<(), CorruptedIdList> {
        if !content.is_empty() && !matches!(content.as_bytes()[0], b'+' | b'-') {
            return Err(CorruptedIdList);
        }

        let lines = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| match line.as_bytes()[0] {
                b'+' => Ok((true, &line[1..])),
                b'-' => Ok((false, &line[1..])),
                _ => Err(CorruptedIdList),
            })
            .collect::<Result<Vec<_>, _>>()?;

        // Applied in file order: a later removal wins over an earlier addition.
        for (add, id) in lines {
            if add {
                self.ids.insert(id.to_owned());
            } else {
                self.ids.remove(id);
            }
        }

        self.size += content.len() as u64;
        Ok(())
    }

    /// `true` if the list contains an id hashed with `hash_id`.
    pub fn contains_hashed(&self, hashed_id: &str) -> bool {
        self.ids.contains(hashed_id)
    }
}

/// Hash a unit id the way ID list entries are stored: first 8 characters of base64(sha256(id)).
pub fn hash_id(id: &str) -> String {
    let digest = Sha256::digest(id.as_bytes());
    let mut encoded = STANDARD.encode(digest);
    encoded.truncate(8);
    encoded
}

#[cfg(test)]
mod tests {
    use super::{hash_id, CorruptedIdList, IdList, IdListMetadata};

    fn metadata(file_id: &str, creation_time: u64) -> IdListMetadata {
        IdListMetadata {
            name: "list".to_owned(),
            size: 0,
            url: Some("https://example.com/list".to_owned()),
            creation_time,
            file_id: Some(file_id.to_owned()),
        }
    }

    #[test]
    fn applies_additions_and_removals_in_order() {
        let mut list = IdList::new(&metadata("f1", 1));
        list.apply_delta("+a\n+b\n+c\n").unwrap();
        list.apply_delta("-b\n").unwrap();

        assert!(list.contains_hashed("a"));
        assert!(!list.contains_hashed("b"));
        assert!(list.contains_hashed("c"));
        assert_eq!(list.size, 12);
    }

    #[test]
    fn rejects_corrupted_content() {
        let mut list = IdList::new(&metadata("f1", 1));
        list.apply_delta("+a\n").unwrap();

        assert_eq!(list.apply_delta("<html>oops</html>"), Err(CorruptedIdList));
        assert_eq!(list.apply_delta("+b\n?c\n"), Err(CorruptedIdList));
        assert_eq!(list.ids.len(), 1);
        assert_eq!(list.size, 3);
    }

    #[test]
    fn replacement_requires_new_file_and_newer_creation() {
        let list = IdList::new(&metadata("f1", 10));
        assert!(!list.is_replaced_by(&metadata("f1", 20)));
        assert!(list.is_replaced_by(&metadata("f2", 20)));
        assert!(!list.is_replaced_by(&metadata("f2", 5)));
    }

    #[test]
    fn hashed_ids_are_eight_base64_chars() {
        let hashed = hash_id("a-user");
        assert_eq!(hashed.len(), 8);
        assert_eq!(hashed, hash_id("a-user"));
        assert_ne!(hashed, hash_id("b-user"));
    }
}
