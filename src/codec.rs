//! Property-list codec for request and response documents.
//!
//! Requests are always encoded in the binary form. Responses may arrive
//! in either the binary or the XML form; both normalize to the same
//! ordered dictionary model.

use crate::errors::TransportError;
use std::io::Cursor;

pub use plist::{Dictionary, Value};

/// Encode a document as a binary property list.
pub fn encode(document: &Dictionary) -> Result<Vec<u8>, TransportError> {
    let mut buf = Cursor::new(Vec::new());
    Value::Dictionary(document.clone())
        .to_writer_binary(&mut buf)
        .map_err(|err| TransportError::Encode(err.into()))?;
    Ok(buf.into_inner())
}

/// Decode a binary or XML property list into a document.
///
/// The serialization form is auto-detected. A well-formed property list
/// whose top-level value is not a dictionary is rejected, it does not
/// count as a document.
pub fn decode(bytes: &[u8]) -> Result<Dictionary, TransportError> {
    let value = Value::from_reader(Cursor::new(bytes))
        .map_err(|err| TransportError::Decode(err.into()))?;
    match value {
        Value::Dictionary(dict) => Ok(dict),
        other => Err(TransportError::Decode(
            format!("top-level value is {}, not a dictionary", value_kind(&other)).into(),
        )),
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Array(_) => "an array",
        Value::Dictionary(_) => "a dictionary",
        Value::Boolean(_) => "a boolean",
        Value::Data(_) => "data",
        Value::Date(_) => "a date",
        Value::Integer(_) => "an integer",
        Value::Real(_) => "a real",
        Value::String(_) => "a string",
        _ => "a value",
    }
}
