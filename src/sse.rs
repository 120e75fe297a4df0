//! Server-Sent Events (text/event-stream) parser.
//!
//! Incremental parser used to consume streaming LLM responses: feed byte
//! chunks in, get parsed events out. Handles LF/CR/CRLF line endings, the
//! leading UTF-8 BOM, comment lines, and multi-line `data:` fields per the
//! SSE specification.

use std::borrow::Cow;

/// A parsed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type (from `event:`, defaults to `message`).
    pub event: Cow<'static, str>,
    /// Event data (from `data:` field(s), joined with newlines).
    pub data: String,
    /// Last event id (from `id:`).
    pub id: Option<String>,
    /// Retry interval hint in milliseconds (from `retry:`).
    pub retry: Option<u64>,
}

impl Default for SseEvent {
    fn default() -> Self {
        Self {
            event: Cow::Borrowed("message"),
            data: String::new(),
            id: None,
            retry: None,
        }
    }
}

/// Incremental SSE parser state.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    current: SseEvent,
    has_data: bool,
    bom_checked: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    fn process_line(line: &str, current: &mut SseEvent, has_data: &mut bool) {
        if line.starts_with(':') {
            return; // comment / keep-alive
        }
        if let Some((field, value)) = line.split_once(':') {
            let value = value.strip_prefix(' ').unwrap_or(value);
            match field {
                "event" => current.event = Cow::Owned(value.to_string()),
                "data" => {
                    current.data.push_str(value);
                    current.data.push('\n');
                    *has_data = true;
                }
                "id" => {
                    if !value.contains('\0') {
                        current.id = Some(value.to_string());
                    }
                }
                "retry" => current.retry = value.parse().ok(),
                _ => {}
            }
        } else {
            // Field with no value.
            match line {
                "event" => current.event = Cow::Borrowed(""),
                "data" => {
                    current.data.push('\n');
                    *has_data = true;
                }
                "id" => current.id = Some(String::new()),
                _ => {}
            }
        }
    }

    fn take_event(current: &mut SseEvent, has_data: &mut bool) -> SseEvent {
        if current.data.ends_with('\n') {
            current.data.pop();
        }
        if current.event.is_empty() {
            current.event = Cow::Borrowed("message");
        }
        *has_data = false;
        std::mem::take(current)
    }

    /// Feed a chunk and return any complete events (delimited by blank lines).
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        if !self.bom_checked && !self.buffer.is_empty() {
            self.bom_checked = true;
            if self.buffer.starts_with('\u{FEFF}') {
                self.buffer.drain(..3);
            }
        }

        let mut events = Vec::new();
        let bytes = self.buffer.as_bytes();
        let mut consumed = 0usize;
        let mut pos = 0usize;

        while let Some(rel) = memchr::memchr2(b'\r', b'\n', &bytes[pos..]) {
            let at = pos + rel;
            let (line_end, next_start) = if bytes[at] == b'\n' {
                (at, at + 1)
            } else if at + 1 < bytes.len() {
                // CR: swallow a following LF if present.
                (at, if bytes[at + 1] == b'\n' { at + 2 } else { at + 1 })
            } else {
                // CR at end of buffer: wait for more data to disambiguate CRLF.
                break;
            };

            let line = &self.buffer[consumed..line_end];
            if line.is_empty() {
                if self.has_data {
                    events.push(Self::take_event(&mut self.current, &mut self.has_data));
                }
            } else {
                Self::process_line(line, &mut self.current, &mut self.has_data);
            }
            consumed = next_start;
            pos = next_start;
        }

        self.buffer.drain(..consumed);
        events
    }

    /// Flush any pending event at end of stream.
    pub fn flush(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            let line = line.trim_end_matches('\r');
            Self::process_line(line, &mut self.current, &mut self.has_data);
        }
        if self.has_data {
            Some(Self::take_event(&mut self.current, &mut self.has_data))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn single_event() {
        let mut parser = SseParser::new();
        let events = parser.feed("event: ping\ndata: {}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "ping");
        assert_eq!(events[0].data, "{}");
    }

    #[test]
    fn default_event_type_is_message() {
        let mut parser = SseParser::new();
        let events = parser.feed("data: hello\n\n");
        assert_eq!(events[0].event, "message");
    }

    #[test]
    fn multi_line_data_joins_with_newlines() {
        let mut parser = SseParser::new();
        let events = parser.feed("data: one\ndata: two\n\n");
        assert_eq!(events[0].data, "one\ntwo");
    }

    #[test]
    fn split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.feed("data: hel").is_empty());
        assert!(parser.feed("lo\n").is_empty());
        let events = parser.feed("\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hello");
    }

    #[test]
    fn crlf_and_cr_line_endings() {
        let mut parser = SseParser::new();
        let events = parser.feed("data: a\r\n\r\ndata: b\r\rdata: c\r\r");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "a");
        assert_eq!(events[1].data, "b");
        // Trailing CR is held back until the next chunk disambiguates CRLF.
        let event = parser.flush().unwrap();
        assert_eq!(event.data, "c");
    }

    #[test]
    fn split_crlf_boundary() {
        let mut parser = SseParser::new();
        assert!(parser.feed("data: a\r").is_empty());
        let events = parser.feed("\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "a");
    }

    #[test]
    fn comment_lines_ignored() {
        let mut parser = SseParser::new();
        let events = parser.feed(": keep-alive\ndata: x\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn bom_stripped() {
        let mut parser = SseParser::new();
        let events = parser.feed("\u{FEFF}data: x\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn flush_emits_pending() {
        let mut parser = SseParser::new();
        assert!(parser.feed("data: tail").is_empty());
        let event = parser.flush().unwrap();
        assert_eq!(event.data, "tail");
        assert!(parser.flush().is_none());
    }

    #[test]
    fn blank_lines_without_data_emit_nothing() {
        let mut parser = SseParser::new();
        assert!(parser.feed("\n\n\nevent: x\n\n").is_empty());
    }

    proptest! {
        /// Chunking must never change the parse result.
        #[test]
        fn chunking_invariance(
            datas in proptest::collection::vec("[a-z]{1,12}", 1..6),
            split in 1usize..20
        ) {
            let mut stream = String::new();
            for data in &datas {
                stream.push_str(&format!("data: {data}\n\n"));
            }

            let mut whole = SseParser::new();
            let expected = whole.feed(&stream);

            let mut chunked = SseParser::new();
            let mut actual = Vec::new();
            let bytes = stream.as_bytes();
            let mut start = 0;
            while start < bytes.len() {
                let end = (start + split).min(bytes.len());
                // Splits are on ASCII here, safe to slice.
                actual.extend(chunked.feed(std::str::from_utf8(&bytes[start..end]).unwrap()));
                start = end;
            }

            prop_assert_eq!(expected, actual);
        }
    }
}
