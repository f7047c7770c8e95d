use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// An interned stream name plus its numeric id. [`StreamId::UNROUTED`]
/// is the sentinel used for messages that have not (yet, or no longer)
/// been assigned to a stream.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId {
    name: String,
    id: u64,
}

impl StreamId {
    pub fn new(name: impl Into<String>, id: u64) -> Self {
        Self {
            name: name.into(),
            id,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The invalid-stream sentinel, mirroring `core.InvalidStreamID` in
    /// the system this crate re-implements.
    pub fn unrouted() -> Self {
        Self {
            name: String::new(),
            id: 0,
        }
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::unrouted()
    }
}

/// An envelope carrying an opaque payload, a metadata map, and the
/// stream it originated from. Cloning is cheap: payload and metadata
/// values are reference-counted byte buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    payload: Bytes,
    metadata: BTreeMap<String, Bytes>,
    origin: StreamId,
    sequence: u64,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>, origin: StreamId) -> Self {
        Self {
            payload: payload.into(),
            metadata: BTreeMap::new(),
            origin,
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn with_metadata(
        payload: impl Into<Bytes>,
        metadata: BTreeMap<String, Bytes>,
        origin: StreamId,
    ) -> Self {
        Self {
            payload: payload.into(),
            metadata,
            origin,
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn store_payload(&mut self, payload: impl Into<Bytes>) {
        self.payload = payload.into();
    }

    pub fn metadata(&self) -> &BTreeMap<String, Bytes> {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut BTreeMap<String, Bytes> {
        &mut self.metadata
    }

    pub fn origin(&self) -> &StreamId {
        &self.origin
    }

    pub fn set_origin(&mut self, origin: StreamId) {
        self.origin = origin;
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}
