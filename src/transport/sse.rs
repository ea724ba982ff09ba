//! Server-sent events framing for streamable HTTP
//!
//! Only `data:` lines matter; each blank-line-delimited event carries one
//! JSON-RPC message. Comments (`:` prefix) and other fields are ignored.

/// Incremental SSE decoder fed with raw body chunks
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    data_lines: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every event payload it completes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();

        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches('\n').trim_end_matches('\r');
            self.accept_line(line, &mut out);
        }

        out
    }

    /// Flush a trailing event not followed by a blank line
    pub fn finish(&mut self) -> Option<String> {
        if !self.buf.is_empty() {
            let rest = std::mem::take(&mut self.buf);
            let rest = String::from_utf8_lossy(&rest).into_owned();
            // A line without terminator never completes an event by itself
            let mut out = Vec::new();
            self.accept_line(rest.trim_end_matches('\r'), &mut out);
        }
        if self.data_lines.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.data_lines).join("\n"))
        }
    }

    fn accept_line(&mut self, line: &str, out: &mut Vec<String>) {
        if line.is_empty() {
            if !self.data_lines.is_empty() {
                out.push(std::mem::take(&mut self.data_lines).join("\n"));
            }
            return;
        }

        if line.starts_with(':') {
            return;
        }

        if let Some(rest) = line.strip_prefix("data:") {
            self.data_lines
                .push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        }
    }
}

/// Decode a complete SSE body
pub fn decode_events(body: &str) -> Vec<String> {
    let mut decoder = SseDecoder::new();
    let mut events = decoder.push(body.as_bytes());
    events.extend(decoder.finish());
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decodes_single_event() {
        let events = decode_events("event: message\ndata: {\"jsonrpc\":\"2.0\"}\n\n");
        assert_eq!(events, vec!["{\"jsonrpc\":\"2.0\"}"]);
    }

    #[test]
    fn test_joins_multiline_data() {
        assert_eq!(decode_events("data: a\ndata: b\n\n"), vec!["a\nb"]);
    }

    #[test]
    fn test_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"a\"").is_empty());
        assert!(decoder.push(b":1}\r\n").is_empty());
        assert_eq!(decoder.push(b"\r\n: keep-alive\n\n"), vec!["{\"a\":1}"]);
    }

    #[test]
    fn test_trailing_event_without_blank_line() {
        assert_eq!(decode_events("data: x"), vec!["x"]);
        assert!(decode_events(": comment only\n\n").is_empty());
    }
}
