use crate::{PatchError, FRAME_SENTINEL};

const SENTINEL_BYTES: [u8; 3] = [0xEF, 0xBF, 0xBF];

/// Encodes one message as a sentinel-terminated frame. A literal sentinel in
/// the text is written as a JSON unicode escape so it cannot split the frame.
pub fn encode_frame(text: &str) -> Vec<u8> {
    let mut escaped = text.replace(FRAME_SENTINEL, "\\uffff").into_bytes();
    escaped.extend_from_slice(&SENTINEL_BYTES);
    escaped
}

/// Accumulates raw reads and yields complete frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    // Prefix of `buffer` already searched without finding a sentinel.
    scanned: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes waiting for a terminating sentinel.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Pops the next complete frame. Empty segments are skipped, a partial
    /// trailing segment stays buffered.
    pub fn next_frame(&mut self) -> Option<Result<String, PatchError>> {
        loop {
            let Some(found) = self.buffer[self.scanned..]
                .windows(SENTINEL_BYTES.len())
                .position(|window| window == SENTINEL_BYTES)
            else {
                // A sentinel may straddle the next push.
                self.scanned = self.buffer.len().saturating_sub(SENTINEL_BYTES.len() - 1);
                return None;
            };

            let end = self.scanned + found;
            self.scanned = 0;
            let segment: Vec<u8> = self.buffer.drain(..end + SENTINEL_BYTES.len()).take(end).collect();
            if segment.is_empty() {
                continue;
            }

            return Some(String::from_utf8(segment).map_err(|err| {
                PatchError::InvalidArgument(format!("Frame is not valid UTF-8: {err}"))
            }));
        }
    }
}

impl Iterator for FrameDecoder {
    type Item = Result<String, PatchError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_frame()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(decoder: &mut FrameDecoder) -> Vec<String> {
        decoder.map(|frame| frame.expect("valid frame")).collect()
    }

    #[test]
    fn splits_multiple_frames_in_one_read() {
        let mut decoder = FrameDecoder::new();
        let mut bytes = encode_frame(r#"{"id":"1"}"#);
        bytes.extend(encode_frame(r#"{"id":"2"}"#));
        decoder.push(&bytes);

        assert_eq!(frames(&mut decoder), vec![r#"{"id":"1"}"#, r#"{"id":"2"}"#]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn waits_for_partial_frames() {
        let mut decoder = FrameDecoder::new();
        let bytes = encode_frame("héllo");
        let (head, tail) = bytes.split_at(bytes.len() - 2);

        decoder.push(head);
        assert!(decoder.next_frame().is_none());

        decoder.push(tail);
        assert_eq!(frames(&mut decoder), vec!["héllo"]);
    }

    #[test]
    fn large_frame_trickling_in_is_not_rescanned() {
        let text = "x".repeat(100_000);
        let bytes = encode_frame(&text);
        let mut decoder = FrameDecoder::new();

        let mut chunks = bytes.chunks(1);
        for chunk in chunks.by_ref().take(bytes.len() - 1) {
            decoder.push(chunk);
            assert!(decoder.next_frame().is_none());
            assert!(decoder.pending() - decoder.scanned < SENTINEL_BYTES.len());
        }

        decoder.push(chunks.next().expect("last byte"));
        assert_eq!(frames(&mut decoder), vec![text]);
        assert_eq!((decoder.pending(), decoder.scanned), (0, 0));
    }

    #[test]
    fn skips_empty_segments() {
        let mut decoder = FrameDecoder::new();
        let mut bytes = SENTINEL_BYTES.to_vec();
        bytes.extend(SENTINEL_BYTES);
        bytes.extend(encode_frame("x"));
        decoder.push(&bytes);

        assert_eq!(frames(&mut decoder), vec!["x"]);
    }

    #[test]
    fn escapes_embedded_sentinels() {
        let text = serde_json::to_string("a\u{FFFF}b").expect("serialize");
        let bytes = encode_frame(&text);

        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);
        let frame = decoder.next_frame().expect("one frame").expect("valid frame");

        let decoded: String = serde_json::from_str(&frame).expect("valid json");
        assert_eq!(decoded, "a\u{FFFF}b");
    }
}
