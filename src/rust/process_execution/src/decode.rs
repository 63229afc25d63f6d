//! Incremental UTF-8 decoding across an unbounded sequence of byte chunks.
//!
//! A multi-byte sequence can land split across two separate reads from a pipe; naively decoding
//! each chunk in isolation would either emit a replacement character for the truncated tail or
//! drop it. `IncrementalDecoder` carries the undecodable tail of one chunk forward into the next.

/// Decodes chunks as they arrive, buffering any trailing incomplete sequence.
#[derive(Debug, Default)]
pub struct IncrementalDecoder {
    pending: Vec<u8>,
}

impl IncrementalDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds `chunk` into the decoder, returning the text it can now produce. Any trailing bytes
    /// that don't yet form a complete UTF-8 sequence are retained for the next call.
    pub fn push(&mut self, chunk: &[u8]) -> String {
        if self.pending.is_empty() {
            self.decode_owned(chunk.to_vec())
        } else {
            self.pending.extend_from_slice(chunk);
            let buf = std::mem::take(&mut self.pending);
            self.decode_owned(buf)
        }
    }

    fn decode_owned(&mut self, buf: Vec<u8>) -> String {
        match std::str::from_utf8(&buf) {
            Ok(text) => text.to_string(),
            Err(e) => {
                let valid_up_to = e.valid_up_to();
                // An `error_len` of `None` means the tail is an incomplete (not invalid)
                // sequence — hold it back for the next chunk. A `Some` error_len means those
                // bytes are genuinely malformed and must be replaced now, not held forever.
                match e.error_len() {
                    None => {
                        let (valid, incomplete) = buf.split_at(valid_up_to);
                        let text = std::str::from_utf8(valid)
                            .expect("valid_up_to guarantees this prefix is valid UTF-8")
                            .to_string();
                        self.pending = incomplete.to_vec();
                        text
                    }
                    Some(_) => String::from_utf8_lossy(&buf).into_owned(),
                }
            }
        }
    }

    /// Flushes any buffered incomplete tail as replacement characters. Call once at stream end;
    /// an incomplete sequence left dangling forever would silently drop those bytes.
    pub fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            let tail = std::mem::take(&mut self.pending);
            Some(String::from_utf8_lossy(&tail).into_owned())
        }
    }
}
