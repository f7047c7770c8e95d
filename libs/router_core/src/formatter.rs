use std::io;

use base64::Engine;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::message::Message;
use crate::wire;

/// A single transformation applied to a message before it is written
/// out or routed onward.
pub trait Formatter: Send + Sync {
    fn apply(&self, msg: &mut Message);
}

/// How [`MetadataCopyFormatter`] combines the source value with any
/// existing value at the destination key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    Replace,
    Append,
    Prepend,
}

/// Copies a message's payload into a metadata key (or a metadata key
/// into the payload), optionally joined with an existing value at the
/// destination. Mirrors the upstream `format.MetadataCopy` plugin:
/// `key` names the metadata slot read from or written to, `apply_to`
/// selects whether the payload or a metadata key is the destination,
/// and `mode`/`separator` control how an existing destination value is
/// combined with the copied one.
pub struct MetadataCopyFormatter {
    pub key: String,
    pub apply_to: Option<String>,
    pub mode: CopyMode,
    pub separator: String,
}

impl MetadataCopyFormatter {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            apply_to: None,
            mode: CopyMode::Replace,
            separator: String::new(),
        }
    }

    fn combine(&self, existing: &[u8], incoming: &[u8]) -> Vec<u8> {
        match self.mode {
            CopyMode::Replace => incoming.to_vec(),
            CopyMode::Append => {
                let mut out = existing.to_vec();
                out.extend_from_slice(self.separator.as_bytes());
                out.extend_from_slice(incoming);
                out
            }
            CopyMode::Prepend => {
                let mut out = incoming.to_vec();
                out.extend_from_slice(self.separator.as_bytes());
                out.extend_from_slice(existing);
                out
            }
        }
    }
}

impl Formatter for MetadataCopyFormatter {
    fn apply(&self, msg: &mut Message) {
        match &self.apply_to {
            None => {
                // No destination key configured: copy the named
                // metadata key onto the payload itself.
                let source = msg.metadata().get(&self.key).cloned();
                if let Some(source) = source {
                    let combined = self.combine(msg.payload(), &source);
                    msg.store_payload(combined);
                }
            }
            Some(dest) => {
                let existing = msg.metadata().get(dest).cloned().unwrap_or_default();
                let combined = self.combine(&existing, msg.payload());
                msg.metadata_mut().insert(dest.clone(), combined.into());
            }
        }
    }
}

/// Adapts a flushed batch of messages into the on-disk segment format:
/// each message runs through the formatter pipeline, is serialized and
/// base64-encoded, and is appended to the active file behind a
/// newline delimiter.
#[derive(Default)]
pub struct WriterAssembly {
    formatters: Vec<Box<dyn Formatter>>,
    file: Option<File>,
}

impl WriterAssembly {
    pub fn new(formatters: Vec<Box<dyn Formatter>>) -> Self {
        Self {
            formatters,
            file: None,
        }
    }

    pub fn set_writer(&mut self, file: Option<File>) {
        self.file = file;
    }

    pub fn has_writer(&self) -> bool {
        self.file.is_some()
    }

    pub async fn write(&mut self, messages: &[Message]) -> Result<(), io::Error> {
        let Some(file) = self.file.as_mut() else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "writer assembly has no active segment file",
            ));
        };

        for original in messages {
            let mut msg = original.clone();
            for formatter in &self.formatters {
                formatter.apply(&mut msg);
            }
            let wire = wire::serialize(&msg);
            let encoded = base64::engine::general_purpose::STANDARD.encode(wire);
            file.write_all(encoded.as_bytes()).await?;
            file.write_all(b"\n").await?;
        }
        file.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::StreamId;
    use bytes::Bytes;
    use std::collections::BTreeMap;

    #[test]
    fn replace_mode_copies_metadata_onto_payload() {
        let mut metadata = BTreeMap::new();
        metadata.insert("foo".to_string(), Bytes::from_static(b"foo"));
        let mut msg = Message::with_metadata(
            Bytes::from_static(b"test"),
            metadata,
            StreamId::unrouted(),
        );

        let formatter = MetadataCopyFormatter::new("foo");
        formatter.apply(&mut msg);

        assert_eq!(msg.payload(), &Bytes::from_static(b"foo"));
    }

    #[test]
    fn apply_to_adds_payload_into_metadata_key() {
        let mut msg = Message::new(Bytes::from_static(b"test"), StreamId::unrouted());
        let mut formatter = MetadataCopyFormatter::new("foo");
        formatter.apply_to = Some("foo".to_string());
        formatter.apply(&mut msg);

        assert_eq!(msg.payload(), &Bytes::from_static(b"test"));
        assert_eq!(msg.metadata().get("foo").unwrap(), &Bytes::from_static(b"test"));
    }

    #[test]
    fn append_mode_joins_with_separator() {
        let mut metadata = BTreeMap::new();
        metadata.insert("foo".to_string(), Bytes::from_static(b"foo"));
        let mut msg = Message::with_metadata(
            Bytes::from_static(b"test"),
            metadata,
            StreamId::unrouted(),
        );

        let mut formatter = MetadataCopyFormatter::new("foo");
        formatter.mode = CopyMode::Append;
        formatter.separator = " ".to_string();
        formatter.apply(&mut msg);

        assert_eq!(msg.payload(), &Bytes::from_static(b"test foo"));
    }
}
