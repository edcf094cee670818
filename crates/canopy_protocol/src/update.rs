//! Decoded stream updates for the reconciliation layer.

use crate::frame::{StreamEvent, UpdatePayload};
use crate::path::Path;
use serde_json::Value;

/// The serialized scalar value stored at a path.
///
/// Blobs hold the JSON text of a leaf value (`"abc"`, `42`, `true`), so
/// values round-trip through the local store without interpretation.
pub type Blob = String;

/// A reconciliation-layer update decoded from one data frame.
///
/// Updates carry no ordering guarantee across reconnects other than
/// "most recent wins" per path, so applying one must be idempotent.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamUpdate {
    /// The path and everything beneath it no longer exist remotely.
    Delete(Path),
    /// The path now holds a scalar value, superseding any subtree.
    SetLeaf(Path, Blob),
    /// The path now holds a subtree, given as relative-path/value pairs.
    /// A `None` value is a deletion of that relative path.
    SetSubtree(Path, Vec<(Path, Option<Blob>)>),
}

impl StreamUpdate {
    /// Decodes a data-bearing payload into an update.
    ///
    /// `root` is the subscribed path-root; the payload's path is relative
    /// to it on the wire.
    #[must_use]
    pub fn decode(root: &Path, payload: &UpdatePayload) -> Self {
        let full = root.join(&payload.path);
        match &payload.data {
            Value::Null => Self::Delete(full),
            Value::Object(_) | Value::Array(_) => Self::SetSubtree(full, flatten(&payload.data)),
            leaf => Self::SetLeaf(full, leaf.to_string()),
        }
    }

    /// Decodes a stream event into an update, if it is data-bearing.
    ///
    /// `put` and `patch` both decode through [`StreamUpdate::decode`];
    /// control events yield `None`.
    #[must_use]
    pub fn from_event(root: &Path, event: &StreamEvent) -> Option<Self> {
        match event {
            StreamEvent::Put(payload) | StreamEvent::Patch(payload) => {
                Some(Self::decode(root, payload))
            }
            _ => None,
        }
    }

    /// Returns the absolute path this update applies to.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Delete(path) | Self::SetLeaf(path, _) | Self::SetSubtree(path, _) => path,
        }
    }
}

/// Flattens a JSON subtree into `(relative_path, leaf)` pairs.
///
/// Array indices become numeric path segments and `null` leaves become
/// deletions. The walk is iterative over an explicit work stack, so
/// adversarially deep input cannot overflow the call stack. Pairs are
/// returned in path order.
fn flatten(value: &Value) -> Vec<(Path, Option<Blob>)> {
    let mut out = Vec::new();
    let mut stack: Vec<(Path, &Value)> = vec![(Path::root(), value)];

    while let Some((prefix, node)) = stack.pop() {
        match node {
            Value::Object(map) => {
                for (key, child) in map {
                    stack.push((prefix.child(key), child));
                }
            }
            Value::Array(items) => {
                for (i, child) in items.iter().enumerate() {
                    stack.push((prefix.child(&i.to_string()), child));
                }
            }
            Value::Null => out.push((prefix, None)),
            leaf => out.push((prefix, Some(leaf.to_string()))),
        }
    }

    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}
