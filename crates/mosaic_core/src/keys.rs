//! Engine key layout.
//!
//! ```text
//! document:   0x01 | collection (u32 BE) | revision (u64 BE)
//! counter:    0x02 | collection (u32 BE) | 'c'
//! tree blob:  0x02 | collection (u32 BE) | 't'
//! estimator:  0x02 | collection (u32 BE) | 'e' | index (u64 BE)
//! ```
//!
//! Big-endian encoding keeps documents of a collection contiguous and
//! ordered by revision.

use crate::types::{CollectionId, IndexId, RevisionId};
use mosaic_storage::KeyRange;

const DOCUMENT_PREFIX: u8 = 0x01;
const METADATA_PREFIX: u8 = 0x02;

const COUNTER_TAG: u8 = b'c';
const TREE_TAG: u8 = b't';
const ESTIMATOR_TAG: u8 = b'e';

/// Returns the engine key of a document revision.
#[must_use]
pub fn document_key(collection: CollectionId, revision: RevisionId) -> Vec<u8> {
    let mut key = Vec::with_capacity(13);
    key.push(DOCUMENT_PREFIX);
    key.extend_from_slice(&collection.as_u32().to_be_bytes());
    key.extend_from_slice(&revision.as_u64().to_be_bytes());
    key
}

/// Returns the key range holding every document of `collection`.
#[must_use]
pub fn collection_range(collection: CollectionId) -> KeyRange {
    let mut start = vec![DOCUMENT_PREFIX];
    start.extend_from_slice(&collection.as_u32().to_be_bytes());
    let end = match collection.as_u32().checked_add(1) {
        Some(next) => {
            let mut end = vec![DOCUMENT_PREFIX];
            end.extend_from_slice(&next.to_be_bytes());
            end
        }
        None => vec![DOCUMENT_PREFIX + 1],
    };
    KeyRange::new(start, end)
}

/// Extracts the revision from a document key.
#[must_use]
pub fn revision_from_key(key: &[u8]) -> Option<RevisionId> {
    if key.len() != 13 || key[0] != DOCUMENT_PREFIX {
        return None;
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&key[5..13]);
    Some(RevisionId::new(u64::from_be_bytes(bytes)))
}

fn metadata_key(collection: CollectionId, tag: u8) -> Vec<u8> {
    let mut key = Vec::with_capacity(14);
    key.push(METADATA_PREFIX);
    key.extend_from_slice(&collection.as_u32().to_be_bytes());
    key.push(tag);
    key
}

/// Returns the key of a collection's persisted document counter.
#[must_use]
pub fn counter_key(collection: CollectionId) -> Vec<u8> {
    metadata_key(collection, COUNTER_TAG)
}

/// Returns the key of a collection's persisted revision tree.
#[must_use]
pub fn tree_key(collection: CollectionId) -> Vec<u8> {
    metadata_key(collection, TREE_TAG)
}

/// Returns the key of a persisted index estimator.
#[must_use]
pub fn estimator_key(collection: CollectionId, index: IndexId) -> Vec<u8> {
    let mut key = metadata_key(collection, ESTIMATOR_TAG);
    key.extend_from_slice(&index.0.to_be_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_keys_sort_by_revision() {
        let c = CollectionId::new(3);
        let a = document_key(c, RevisionId::new(1));
        let b = document_key(c, RevisionId::new(256));
        assert!(a < b);
        assert_eq!(revision_from_key(&b), Some(RevisionId::new(256)));
    }

    #[test]
    fn collection_range_covers_only_its_documents() {
        let range = collection_range(CollectionId::new(7));
        assert!(range.contains(&document_key(CollectionId::new(7), RevisionId::new(u64::MAX))));
        assert!(!range.contains(&document_key(CollectionId::new(8), RevisionId::new(0))));
        assert!(!range.contains(&counter_key(CollectionId::new(7))));
    }

    #[test]
    fn last_collection_range_is_bounded() {
        let range = collection_range(CollectionId::new(u32::MAX));
        assert!(range.contains(&document_key(CollectionId::new(u32::MAX), RevisionId::new(9))));
    }

    #[test]
    fn revision_from_metadata_key_is_none() {
        assert_eq!(revision_from_key(&tree_key(CollectionId::new(1))), None);
    }
}
