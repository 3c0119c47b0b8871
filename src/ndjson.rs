//! Newline-delimited JSON framing for streamed response bodies.
//!
//! Chunks may split a line (or a multi-byte UTF-8 sequence) anywhere, so the
//! decoder works on raw bytes and keeps the trailing partial line until the
//! next chunk completes it. Blank lines are skipped; a line that is not valid
//! JSON for the requested type is logged and dropped without affecting the
//! lines around it.
use serde::de::DeserializeOwned;
use tracing::warn;

#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    carry: Vec<u8>,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return every value completed by it, in order.
    pub fn push<T: DeserializeOwned>(&mut self, chunk: &[u8]) -> Vec<T> {
        self.carry.extend_from_slice(chunk);
        let Some(last_newline) = self.carry.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };
        let rest = self.carry.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.carry, rest);
        complete
            .split(|b| *b == b'\n')
            .filter_map(parse_line)
            .collect()
    }

    /// Flush a final line that was not newline-terminated.
    pub fn finish<T: DeserializeOwned>(&mut self) -> Option<T> {
        let tail = std::mem::take(&mut self.carry);
        parse_line(&tail)
    }

    /// Bytes held back waiting for a newline.
    pub fn pending(&self) -> usize {
        self.carry.len()
    }
}

fn parse_line<T: DeserializeOwned>(line: &[u8]) -> Option<T> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_slice(line) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(
                ?err,
                line = %String::from_utf8_lossy(line),
                "skipping malformed stream line"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    const BODY: &[u8] = b"{\"index\":0,\"imageUrl\":\"https://cdn/0.png\"}\n\
\n\
{\"error\":\"nsfw filter\"}\r\n\
{\"type\":\"thumbnail\",\"imageUrl\":\"https://cdn/\xc3\xa9t\xc3\xa9.png\"}\n\
{\"index\":1,\"imageUrl\":\"https://cdn/1.png\"}";

    fn decode_in_chunks(size: usize) -> Vec<Value> {
        let mut decoder = NdjsonDecoder::new();
        let mut out = Vec::new();
        for chunk in BODY.chunks(size) {
            out.extend(decoder.push::<Value>(chunk));
        }
        out.extend(decoder.finish::<Value>());
        out
    }

    #[test]
    fn single_byte_chunks_match_whole_buffer() {
        let whole = decode_in_chunks(BODY.len());
        let bytewise = decode_in_chunks(1);
        assert_eq!(whole.len(), 4);
        assert_eq!(whole, bytewise);
        for size in [2, 3, 7, 16] {
            assert_eq!(decode_in_chunks(size), whole, "chunk size {size}");
        }
    }

    #[test]
    fn multibyte_characters_survive_split_chunks() {
        let values = decode_in_chunks(1);
        assert_eq!(values[2]["imageUrl"], json!("https://cdn/été.png"));
    }

    #[test]
    fn partial_line_is_carried_over() {
        let mut decoder = NdjsonDecoder::new();
        let first: Vec<Value> = decoder.push(b"{\"index\":3,");
        assert!(first.is_empty());
        assert_eq!(decoder.pending(), 11);
        let second: Vec<Value> = decoder.push(b"\"imageUrl\":\"u\"}\n{\"ind");
        assert_eq!(second, vec![json!({"index": 3, "imageUrl": "u"})]);
        assert_eq!(decoder.pending(), 5);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let mut decoder = NdjsonDecoder::new();
        let values: Vec<Value> = decoder.push(b"{oops}\n{\"ok\":true}\n");
        assert_eq!(values, vec![json!({"ok": true})]);
        assert!(decoder.finish::<Value>().is_none());
    }
}
