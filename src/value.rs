//! The tagged value vocabulary clients layer over the engine's opaque byte
//! strings.  The engine itself never looks inside a value; failure and skip
//! propagation work by dependent tasks decoding their inputs and completing
//! with `Skipped` when an upstream did not produce a usable value.

use crate::engine::Value;
use anyhow::bail;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildValue {
    /// A successfully produced value.
    Success(Vec<u8>),
    /// A placeholder produced by a virtual input with no content.
    Virtual,
    /// An input that does not exist and has no rule to produce it.
    Missing,
    /// The producing action ran and failed.
    Failed,
    /// The action was not run because an input had failed.
    Skipped,
}

const TAG_SUCCESS: u8 = 0;
const TAG_VIRTUAL: u8 = 1;
const TAG_MISSING: u8 = 2;
const TAG_FAILED: u8 = 3;
const TAG_SKIPPED: u8 = 4;

impl BuildValue {
    /// True for any tag a dependent should treat as "no usable input".
    pub fn is_failure(&self) -> bool {
        matches!(self, BuildValue::Missing | BuildValue::Failed | BuildValue::Skipped)
    }

    pub fn encode(&self) -> Value {
        match self {
            BuildValue::Success(bytes) => {
                let mut out = Vec::with_capacity(1 + bytes.len());
                out.push(TAG_SUCCESS);
                out.extend_from_slice(bytes);
                out
            }
            BuildValue::Virtual => vec![TAG_VIRTUAL],
            BuildValue::Missing => vec![TAG_MISSING],
            BuildValue::Failed => vec![TAG_FAILED],
            BuildValue::Skipped => vec![TAG_SKIPPED],
        }
    }

    pub fn decode(value: &Value) -> anyhow::Result<BuildValue> {
        let (&tag, rest) = match value.split_first() {
            Some(split) => split,
            None => bail!("empty build value"),
        };
        match tag {
            TAG_SUCCESS => Ok(BuildValue::Success(rest.to_vec())),
            TAG_VIRTUAL => Ok(BuildValue::Virtual),
            TAG_MISSING => Ok(BuildValue::Missing),
            TAG_FAILED => Ok(BuildValue::Failed),
            TAG_SKIPPED => Ok(BuildValue::Skipped),
            _ => bail!("unknown build value tag {}", tag),
        }
    }
}
