//! Typed messages crossing the slot boundary.
//!
//! Only two shapes ever go over the wire: a scalar numeric message (used
//! for completion pulses and connection counts) and a string message (used
//! for command lines, JSON payloads and structured query results). Each is
//! independently packed to bytes using the slot [`Encoding`].

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::slot::{pack, unpack, Encoding};
use crate::Result;

/// Bound for anything a `Listener` can decode off a slot.
pub trait SlotMessage: Clone + Send + Serialize + DeserializeOwned + 'static {
    fn to_bytes(&self, encoding: &Encoding) -> Result<Vec<u8>> {
        pack(self, encoding)
    }

    fn from_bytes(bytes: &[u8], encoding: &Encoding) -> Result<Self> {
        unpack(bytes, encoding)
    }
}

/// Scalar numeric message.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct FloatMessage {
    pub value: f64,
}

impl SlotMessage for FloatMessage {}

impl FloatMessage {
    pub fn new(value: f64) -> Self {
        Self { value }
    }
}

/// String-valued message.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct StringMessage {
    pub value: String,
}

impl SlotMessage for StringMessage {}

impl StringMessage {
    pub fn new<S: Into<String>>(value: S) -> Self {
        Self {
            value: value.into(),
        }
    }
}
