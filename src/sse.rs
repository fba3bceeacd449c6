//! Server-Sent Events framing.
//!
//! Network reads split SSE frames at arbitrary points. [`SseReassembler`]
//! buffers until a line is complete and hands back only `data:` payloads.
//! It never looks inside a payload.

const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Default)]
pub struct SseReassembler {
    buffer: String,
    /// Tail of a UTF-8 sequence cut off by a chunk boundary.
    pending: Vec<u8>,
}

impl SseReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a text fragment and return every payload completed by it.
    pub fn add(&mut self, fragment: &str) -> Vec<String> {
        self.buffer.push_str(fragment);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            if let Some(payload) = data_payload(&line) {
                payloads.push(payload);
            }
        }
        payloads
    }

    /// Byte-oriented `add`. Multi-byte characters split across chunks are
    /// held back until the rest of the sequence arrives.
    pub fn add_bytes(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let text = match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                let text = text.to_string();
                self.pending.clear();
                text
            }
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                let rest = self.pending.split_off(valid);
                let text = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending = rest;
                text
            }
            Err(_) => {
                let text = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                text
            }
        };
        self.add(&text)
    }

    /// Drain whatever is left once the connection has closed. Handles
    /// providers that omit the newline after the last frame.
    pub fn flush(&mut self) -> Vec<String> {
        if !self.pending.is_empty() {
            let tail = String::from_utf8_lossy(&self.pending).into_owned();
            self.buffer.push_str(&tail);
            self.pending.clear();
        }
        let rest = std::mem::take(&mut self.buffer);
        rest.lines().filter_map(data_payload).collect()
    }
}

fn data_payload(line: &str) -> Option<String> {
    let line = line.trim_end_matches(['\n', '\r']);
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    let data = line.strip_prefix("data:")?;
    let data = data.strip_prefix(' ').unwrap_or(data);
    if data.trim() == DONE_SENTINEL {
        return None;
    }
    Some(data.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &str = concat!(
        ": keep-alive\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
        "event: ignored\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"lo ☃\"}}]}\r\n\r\n",
        "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":3}}\n\n",
        "data: [DONE]\n\n",
    );

    fn whole() -> Vec<String> {
        let mut sse = SseReassembler::new();
        let mut out = sse.add(STREAM);
        out.extend(sse.flush());
        out
    }

    #[test]
    fn yields_data_payloads_only() {
        let payloads = whole();
        assert_eq!(payloads.len(), 3);
        assert!(payloads[0].starts_with("{\"choices\""));
        assert!(payloads[1].contains('☃'));
        assert!(payloads.iter().all(|p| !p.contains("[DONE]")));
    }

    #[test]
    fn single_byte_chunks_match_whole_input() {
        let mut sse = SseReassembler::new();
        let mut out = Vec::new();
        for b in STREAM.as_bytes() {
            out.extend(sse.add_bytes(std::slice::from_ref(b)));
        }
        out.extend(sse.flush());
        assert_eq!(out, whole());
    }

    #[test]
    fn arbitrary_split_points_match_whole_input() {
        let bytes = STREAM.as_bytes();
        for step in [2, 3, 5, 7, 11, 64] {
            let mut sse = SseReassembler::new();
            let mut out = Vec::new();
            for chunk in bytes.chunks(step) {
                out.extend(sse.add_bytes(chunk));
            }
            out.extend(sse.flush());
            assert_eq!(out, whole(), "chunk size {step}");
        }
    }

    #[test]
    fn incomplete_line_stays_buffered() {
        let mut sse = SseReassembler::new();
        assert!(sse.add("data: {\"a\":").is_empty());
        assert_eq!(sse.add("1}\n"), vec!["{\"a\":1}".to_string()]);
    }

    #[test]
    fn flush_emits_unterminated_final_line() {
        let mut sse = SseReassembler::new();
        assert!(sse.add("data: {\"last\":true}").is_empty());
        assert_eq!(sse.flush(), vec!["{\"last\":true}".to_string()]);
        assert!(sse.flush().is_empty());
    }
}
