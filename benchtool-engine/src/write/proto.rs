//! Protobuf messages of the Prometheus remote-write protocol and their wire encoding.
//!
//! Only the subset of `prometheus.WriteRequest` needed to push samples is modelled here. Request
//! bodies are encoded with `prost` and compressed using the raw (unframed) snappy format.

use prost::Message;
use thiserror::Error;

/// A remote-write request carrying a batch of series.
#[derive(Clone, PartialEq, Message)]
pub struct WriteRequest {
    #[prost(message, repeated, tag = "1")]
    pub timeseries: Vec<TimeSeries>,
}

/// A single series with its labels and samples.
#[derive(Clone, PartialEq, Message)]
pub struct TimeSeries {
    #[prost(message, repeated, tag = "1")]
    pub labels: Vec<Label>,
    #[prost(message, repeated, tag = "2")]
    pub samples: Vec<Sample>,
}

/// A label name/value pair.
#[derive(Clone, PartialEq, Eq, Hash, Message)]
pub struct Label {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

impl Label {
    /// Creates a new label.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A sample value at a millisecond timestamp.
#[derive(Clone, PartialEq, Message)]
pub struct Sample {
    #[prost(double, tag = "1")]
    pub value: f64,
    #[prost(int64, tag = "2")]
    pub timestamp: i64,
}

/// Errors decoding a remote-write request body.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The body is not valid snappy.
    #[error("invalid snappy payload: {0}")]
    Snappy(#[from] snap::Error),
    /// The decompressed body is not a valid `WriteRequest`.
    #[error("invalid protobuf payload: {0}")]
    Protobuf(#[from] prost::DecodeError),
}

/// Encodes a batch of series into a snappy compressed `WriteRequest`.
pub fn encode(timeseries: Vec<TimeSeries>) -> Result<Vec<u8>, snap::Error> {
    let data = WriteRequest { timeseries }.encode_to_vec();
    snap::raw::Encoder::new().compress_vec(&data)
}

/// Decodes a snappy compressed `WriteRequest`.
pub fn decode(body: &[u8]) -> Result<WriteRequest, DecodeError> {
    let data = snap::raw::Decoder::new().decompress_vec(body)?;
    Ok(WriteRequest::decode(data.as_slice())?)
}
