//! Thin wrapper around `bincode` so the rest of the crate speaks in terms of
//! "encode"/"decode" and doesn't leak the codec choice into every call site.
//! Swapping the codec later means touching only this file.

use serde::{de::DeserializeOwned, Serialize};

use crate::error::BrokenWorker;

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, BrokenWorker> {
    bincode::serialize(value).map_err(BrokenWorker::Codec)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, BrokenWorker> {
    bincode::deserialize(bytes).map_err(BrokenWorker::Codec)
}
