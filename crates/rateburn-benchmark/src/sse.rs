//! Line framing for `text/event-stream` completion bodies.
//!
//! Network chunks do not respect line boundaries, so bytes are buffered
//! until a full line is available.

const DATA_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// Payload of a `data:` line, prefix and one leading space removed.
    Data(String),
    /// The `[DONE]` terminal sentinel.
    Done,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one network chunk and returns the events from every line it
    /// completed. Non-data lines (comments, `event:`, blanks) are dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.extend_from_slice(chunk);

        let mut events = Vec::new();
        let mut consumed = 0;
        while let Some(pos) = self.buf[consumed..].iter().position(|b| *b == b'\n') {
            let line = &self.buf[consumed..consumed + pos];
            if let Some(event) = parse_line(line) {
                events.push(event);
            }
            consumed += pos + 1;
        }
        self.buf.drain(..consumed);
        events
    }

    /// Flushes a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let line = std::mem::take(&mut self.buf);
        parse_line(&line)
    }
}

fn parse_line(line: &[u8]) -> Option<SseEvent> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim_end_matches('\r');
    let payload = line.strip_prefix(DATA_PREFIX)?;
    let payload = payload.strip_prefix(' ').unwrap_or(payload);

    if payload.trim() == DONE_SENTINEL {
        return Some(SseEvent::Done);
    }
    Some(SseEvent::Data(payload.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_lines() {
        let mut d = SseDecoder::new();
        let events = d.push(b"data: {\"a\":1}\n\ndata: [DONE]\n\n");
        assert_eq!(
            events,
            vec![SseEvent::Data("{\"a\":1}".into()), SseEvent::Done]
        );
    }

    #[test]
    fn test_line_split_across_chunks() {
        let mut d = SseDecoder::new();
        assert!(d.push(b"data: {\"choi").is_empty());
        assert_eq!(
            d.push(b"ces\":[]}\r\n"),
            vec![SseEvent::Data("{\"choices\":[]}".into())]
        );
    }

    #[test]
    fn test_ignores_non_data_lines() {
        let mut d = SseDecoder::new();
        let events = d.push(b": keep-alive\nevent: message\nid: 4\n\n");
        assert!(events.is_empty());
    }

    #[test]
    fn test_finish_flushes_unterminated_line() {
        let mut d = SseDecoder::new();
        assert!(d.push(b"data: [DONE]").is_empty());
        assert_eq!(d.finish(), Some(SseEvent::Done));
        assert_eq!(d.finish(), None);
    }

    #[test]
    fn test_prefix_without_space() {
        let mut d = SseDecoder::new();
        assert_eq!(d.push(b"data:{}\n"), vec![SseEvent::Data("{}".into())]);
    }

    #[test]
    fn test_multibyte_split() {
        let text = "data: {\"content\":\"안녕\"}\n".as_bytes();
        let mut d = SseDecoder::new();
        let (a, b) = text.split_at(text.len() - 5);
        assert!(d.push(a).is_empty());
        assert_eq!(
            d.push(b),
            vec![SseEvent::Data("{\"content\":\"안녕\"}".into())]
        );
    }
}
