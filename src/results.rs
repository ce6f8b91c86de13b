//! Hit-collection to identifier-list adaptation.
//!
//! Search callers mostly want primary keys, not document addresses. The
//! adapter loads each hit in collector order, reads its `pk` field, and
//! skips documents that lack one. An absent or empty collection adapts to
//! an empty list, never an error.

use tracing::warn;

use crate::store::{Hits, IndexStore, StoreError};

/// Ordered primary keys for the hits, best first.
pub fn primary_keys(store: &IndexStore, hits: Option<&Hits>) -> Result<Vec<String>, StoreError> {
    let Some(hits) = hits else {
        return Ok(Vec::new());
    };
    let mut keys = Vec::with_capacity(hits.len());
    for hit in hits.iter() {
        let doc = store.get_document(hit.doc)?;
        if doc.pk.is_empty() {
            warn!(segment = hit.doc.segment, doc = hit.doc.doc, "hit without pk skipped");
            continue;
        }
        keys.push(doc.pk);
    }
    Ok(keys)
}
