//! Broker wire format.
//!
//! Requests go out as three frames, `["", serial, zlib(json)]`, the empty
//! frame standing in for the REQ envelope delimiter. The JSON payload is
//! `{serial, host, n, events: [{ts, file, msg, ...tags}]}`.
//!
//! Responses are `["", serial, ack]` where `ack` is `["ACK", processed]`; the
//! older `["ACK", serial, processed]` form is accepted too. A lone `0x02`
//! frame is a ping and is answered with `0x03`.

use crate::pipeline::request::{Request, Serial};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::Serialize;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::io::{self, Write};
use thiserror::Error;

pub const PING: u8 = 0x02;
pub const PONG: u8 = 0x03;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to compress payload: {0}")]
    Compress(#[from] io::Error),

    #[error("malformed response: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, WireError>;

#[derive(Serialize)]
struct WireEvent<'a> {
    ts: f64,
    file: Cow<'a, str>,
    msg: Cow<'a, str>,
    #[serde(flatten)]
    tags: &'a BTreeMap<String, String>,
}

#[derive(Serialize)]
struct WirePayload<'a> {
    serial: String,
    host: &'a str,
    n: usize,
    events: Vec<WireEvent<'a>>,
}

/// What the broker sent back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    Ping,
    Ack { serial: Serial, processed: usize },
}

/// JSON payload for a request, before compression.
pub fn payload_json(request: &Request, host: &str) -> Result<Vec<u8>> {
    let events = request
        .events()
        .iter()
        .map(|event| WireEvent {
            ts: event.timestamp.timestamp_micros() as f64 / 1_000_000.0,
            file: event.path.to_string_lossy(),
            msg: event.message(),
            tags: &event.tags,
        })
        .collect();

    let payload = WirePayload {
        serial: request.serial().to_string(),
        host,
        n: request.len(),
        events,
    };
    Ok(serde_json::to_vec(&payload)?)
}

pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Frames to put on the socket for `request`.
pub fn encode_request(request: &Request, host: &str) -> Result<Vec<Vec<u8>>> {
    let body = compress(&payload_json(request, host)?)?;
    Ok(vec![Vec::new(), request.serial().to_wire(), body])
}

pub fn pong_frames() -> Vec<Vec<u8>> {
    vec![Vec::new(), vec![PONG]]
}

/// Interpret a multipart response from the broker.
pub fn decode_response(frames: &[Vec<u8>]) -> Result<Response> {
    let frames: Vec<&Vec<u8>> = frames.iter().skip_while(|f| f.is_empty()).collect();

    match frames.as_slice() {
        [single] if single.as_slice() == [PING] => Ok(Response::Ping),
        [serial, ack] => {
            let serial = Serial::parse(serial)
                .ok_or_else(|| WireError::Malformed(format!("bad serial {:?}", String::from_utf8_lossy(serial))))?;
            let processed = decode_ack(ack)?;
            Ok(Response::Ack { serial, processed })
        }
        other => Err(WireError::Malformed(format!("unexpected {} frames", other.len()))),
    }
}

fn decode_ack(ack: &[u8]) -> Result<usize> {
    let value: serde_json::Value =
        serde_json::from_slice(ack).map_err(|e| WireError::Malformed(format!("ack is not JSON: {}", e)))?;

    let parts = value
        .as_array()
        .ok_or_else(|| WireError::Malformed("ack is not an array".to_string()))?;

    let count = match parts.as_slice() {
        [tag, count] if tag == "ACK" => count,
        [tag, _serial, count] if tag == "ACK" => count,
        _ => return Err(WireError::Malformed(format!("unexpected ack {}", value))),
    };

    count
        .as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| WireError::Malformed(format!("bad processed count {}", count)))
}
