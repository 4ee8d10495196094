//! key share type and its transport encoding
//!
//! a share travels as hex of `data ‖ index`: the evaluation index rides in
//! the trailing byte so it can't get separated from the data on paper or
//! over the phone.

use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{Error, Result};

/// one evaluation of the sharing polynomials
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeyShare {
    /// evaluation point, 1..=255
    pub index: u8,
    /// one evaluated byte per secret byte
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

impl KeyShare {
    pub fn new(index: u8, data: Vec<u8>) -> Self {
        Self { index, data }
    }

    /// `data ‖ index`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.data.len() + 1);
        bytes.extend_from_slice(&self.data);
        bytes.push(self.index);
        bytes
    }

    /// parse `data ‖ index`. `position` is the 1-based slot the operator
    /// typed it into, used only for error messages.
    pub fn from_bytes(bytes: &[u8], position: usize) -> Result<Self> {
        if bytes.len() < 2 {
            return Err(Error::ShareDecode {
                position,
                reason: format!("{} bytes is too short for a share", bytes.len()),
            });
        }
        let (data, index) = bytes.split_at(bytes.len() - 1);
        Ok(Self {
            index: index[0],
            data: data.to_vec(),
        })
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// decode from hex, surrounding whitespace is ignored
    pub fn from_hex(s: &str, position: usize) -> Result<Self> {
        let bytes = hex::decode(s.trim()).map_err(|e| Error::ShareDecode {
            position,
            reason: e.to_string(),
        })?;
        Self::from_bytes(&bytes, position)
    }
}

impl fmt::Debug for KeyShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyShare")
            .field("index", &self.index)
            .field("len", &self.data.len())
            .finish()
    }
}

/// hex serialization helper for serde
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
