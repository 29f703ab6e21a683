use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::codec::SegmentCodec;
use crate::container::Container;
use crate::Result;

/// Byte patches keyed by segment id and offset, stored as base64 strings.
///
/// Serialises to `{"<id>": {"<offset>": "<base64>"}}`. Segment 0 addresses
/// the ROM image directly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EditManifest {
    edits: BTreeMap<u32, BTreeMap<usize, String>>,
}

impl EditManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `bytes` to be written at `offset` in segment `id`, replacing
    /// any edit already recorded at the same place.
    pub fn insert(&mut self, id: u32, offset: usize, bytes: &[u8]) {
        self.edits
            .entry(id)
            .or_default()
            .insert(offset, general_purpose::STANDARD.encode(bytes));
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn is_empty(&self) -> bool {
        self.edits.values().all(BTreeMap::is_empty)
    }

    /// Number of individual edits.
    pub fn len(&self) -> usize {
        self.edits.values().map(BTreeMap::len).sum()
    }

    /// Segment ids the manifest touches, in ascending order.
    pub fn segment_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.edits.keys().copied()
    }

    /// Writes every edit into `container`, lowest segment and offset first.
    /// Returns the number of bytes written.
    pub fn apply<C: SegmentCodec>(&self, container: &mut Container<C>) -> Result<usize> {
        let mut written = 0usize;
        for (&id, edits) in &self.edits {
            for (&offset, encoded) in edits {
                let bytes = general_purpose::STANDARD.decode(encoded)?;
                container.write_bytes(id, offset, &bytes)?;
                debug!(id, offset, len = bytes.len(), "applied edit");
                written += bytes.len();
            }
        }
        Ok(written)
    }
}
