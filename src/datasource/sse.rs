//! An incremental server-sent-events decoder.
//!
//! Only the parts of the SSE format the flag delivery stream uses are implemented: `event` and
//! `data` fields, comment lines (heartbeats), and blank-line dispatch. `id` and `retry` fields
//! are parsed and ignored.

/// One complete server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub name: String,
    pub data: String,
}

/// Feeds on byte chunks as they arrive from the network and yields complete events.
#[derive(Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event_name: String,
    data: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        SseDecoder::default()
    }

    /// Consume a chunk, returning any events completed by it.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(line) = self.next_line() {
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        events
    }

    // Pops one full line off the buffer, handling LF and CRLF endings. A partial trailing line
    // stays buffered until more data arrives.
    fn next_line(&mut self) -> Option<String> {
        let newline = self.buffer.iter().position(|&b| b == b'\n')?;
        let rest = self.buffer.split_off(newline + 1);
        let mut line = std::mem::replace(&mut self.buffer, rest);
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            // Dispatch boundary.
            if self.event_name.is_empty() && self.data.is_empty() {
                return None;
            }
            let event = SseEvent {
                name: std::mem::take(&mut self.event_name),
                data: std::mem::take(&mut self.data),
            };
            return Some(event);
        }
        if line.starts_with(':') {
            // Comment; the server uses these as heartbeats.
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event_name = value.to_owned(),
            "data" => {
                if !self.data.is_empty() {
                    self.data.push('\n');
                }
                self.data.push_str(value);
            }
            // id and retry are not used by this protocol.
            _ => {}
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &str) -> Vec<SseEvent> {
        SseDecoder::new().decode(input.as_bytes())
    }

    #[test]
    fn single_event() {
        let events = decode_all("event: put\ndata: {\"a\":1}\n\n");
        assert_eq!(
            events,
            vec![SseEvent {
                name: "put".to_owned(),
                data: "{\"a\":1}".to_owned()
            }]
        );
    }

    #[test]
    fn multi_line_data() {
        let events = decode_all("event: put\ndata: line1\ndata: line2\n\n");
        assert_eq!(events[0].data, "line1\nline2");
    }

    #[test]
    fn comments_are_ignored() {
        let events = decode_all(": heartbeat\n\nevent: patch\ndata: {}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "patch");
    }

    #[test]
    fn crlf_line_endings() {
        let events = decode_all("event: delete\r\ndata: {}\r\n\r\n");
        assert_eq!(events[0].name, "delete");
        assert_eq!(events[0].data, "{}");
    }

    #[test]
    fn events_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.decode(b"event: pu").is_empty());
        assert!(decoder.decode(b"t\ndata: {\"flags\"").is_empty());
        let events = decoder.decode(b":{}}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "put");
        assert_eq!(events[0].data, "{\"flags\":{}}");
    }
}
