//! Wire encoding for the message model.
//!
//! Transports and durable message files live outside this crate; they get a
//! single canonical encoding here so every embedder frames messages the same
//! way.

use crate::error::Result;
use crate::types::{Entry, HardState, Message};

pub fn serialize_message(msg: &Message) -> Result<Vec<u8>> {
    Ok(bincode::serialize(msg)?)
}

pub fn deserialize_message(data: &[u8]) -> Result<Message> {
    Ok(bincode::deserialize(data)?)
}

pub fn serialize_entry(entry: &Entry) -> Result<Vec<u8>> {
    Ok(bincode::serialize(entry)?)
}

pub fn deserialize_entry(data: &[u8]) -> Result<Entry> {
    Ok(bincode::deserialize(data)?)
}

pub fn serialize_hard_state(hs: &HardState) -> Result<Vec<u8>> {
    Ok(bincode::serialize(hs)?)
}

pub fn deserialize_hard_state(data: &[u8]) -> Result<HardState> {
    Ok(bincode::deserialize(data)?)
}
