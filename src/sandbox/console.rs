//! Bounded, drainable output log for a single sandbox.
//!
//! Both standard streams of the child append here in arrival order. The
//! buffer keeps the newest `limit` characters; older output is discarded
//! chunk by chunk.

use std::collections::VecDeque;

/// Default cap on the number of characters a console retains.
pub const DEFAULT_CONSOLE_LIMIT: usize = 65535;

#[derive(Debug, Clone)]
pub struct ConsoleBuffer {
    /// Chunks with their length in characters.
    chunks: VecDeque<(String, usize)>,
    /// Sum of the chunk lengths.
    total: usize,
    limit: usize,
}

impl ConsoleBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            total: 0,
            limit,
        }
    }

    /// A console that starts out holding a single message.
    pub fn with_message(message: &str, limit: usize) -> Self {
        let mut console = Self::new(limit);
        console.append(message);
        console
    }

    pub fn append(&mut self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        let chars = chunk.chars().count();
        self.total += chars;
        self.chunks.push_back((chunk.to_string(), chars));
        self.enforce_limit();
    }

    /// Return everything accumulated so far and leave the buffer empty.
    pub fn drain(&mut self) -> String {
        if self.is_empty() {
            return String::new();
        }
        let mut content = String::with_capacity(self.chunks.iter().map(|(c, _)| c.len()).sum());
        for (chunk, _) in self.chunks.drain(..) {
            content.push_str(&chunk);
        }
        self.total = 0;
        content
    }

    /// Length in characters.
    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn enforce_limit(&mut self) {
        while self.len() > self.limit {
            let overflow = self.len() - self.limit;
            let Some((first, chars)) = self.chunks.front_mut() else {
                break;
            };

            if *chars <= overflow {
                self.total -= *chars;
                self.chunks.pop_front();
                continue;
            }

            // Cut on a char boundary so the kept tail stays valid UTF-8
            let cut = first
                .char_indices()
                .nth(overflow)
                .map(|(idx, _)| idx)
                .unwrap_or(first.len());
            first.replace_range(..cut, "");
            *chars -= overflow;
            self.total -= overflow;
        }
    }
}

impl Default for ConsoleBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CONSOLE_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_keeps_arrival_order() {
        let mut console = ConsoleBuffer::default();
        console.append("out: one\n");
        console.append("err: two\n");
        console.append("out: three\n");
        assert_eq!(console.len(), 29);
        assert_eq!(console.drain(), "out: one\nerr: two\nout: three\n");
    }

    #[test]
    fn test_drain_resets_buffer() {
        let mut console = ConsoleBuffer::default();
        console.append("hello");
        assert_eq!(console.drain(), "hello");
        assert!(console.is_empty());
        assert_eq!(console.drain(), "");

        console.append("again");
        assert_eq!(console.drain(), "again");
    }

    #[test]
    fn test_with_message() {
        let mut console = ConsoleBuffer::with_message("Failed to start bot:\nboom", 100);
        assert_eq!(console.drain(), "Failed to start bot:\nboom");
    }

    #[test]
    fn test_empty_append_is_ignored() {
        let mut console = ConsoleBuffer::default();
        console.append("");
        assert!(console.is_empty());
        assert_eq!(console.drain(), "");
    }

    #[test]
    fn test_limit_drops_oldest_chunks() {
        let mut console = ConsoleBuffer::new(10);
        console.append("aaaa");
        console.append("bbbb");
        console.append("cccc");
        // 12 chars over a cap of 10: "aaaa" is trimmed to "aa"
        assert_eq!(console.len(), 10);
        assert_eq!(console.drain(), "aabbbbcccc");
    }

    #[test]
    fn test_limit_drops_whole_chunks_before_trimming() {
        let mut console = ConsoleBuffer::new(5);
        console.append("12");
        console.append("345");
        console.append("6789");
        assert_eq!(console.len(), 5);
        assert_eq!(console.drain(), "56789");
    }

    #[test]
    fn test_limit_single_oversized_chunk() {
        let mut console = ConsoleBuffer::new(3);
        console.append("abcdefg");
        assert_eq!(console.drain(), "efg");
    }

    #[test]
    fn test_limit_counts_characters_not_bytes() {
        let mut console = ConsoleBuffer::new(4);
        console.append("héllo wörld");
        assert_eq!(console.len(), 4);
        assert_eq!(console.drain(), "örld");
    }

    #[test]
    fn test_default_limit() {
        let mut console = ConsoleBuffer::default();
        let line = "x".repeat(1000);
        for _ in 0..100 {
            console.append(&line);
        }
        assert_eq!(console.len(), DEFAULT_CONSOLE_LIMIT);
        assert_eq!(console.drain().len(), DEFAULT_CONSOLE_LIMIT);
    }

    #[test]
    fn test_sustained_output_at_the_cap() {
        let mut console = ConsoleBuffer::default();
        for i in 0..200_000 {
            console.append(&format!("line {i:06}\n"));
        }
        assert_eq!(console.len(), DEFAULT_CONSOLE_LIMIT);

        let content = console.drain();
        assert_eq!(content.chars().count(), DEFAULT_CONSOLE_LIMIT);
        assert!(content.ends_with("line 199999\n"));
        assert!(console.is_empty());
    }

    #[test]
    fn test_trimmed_chunk_keeps_its_count() {
        let mut console = ConsoleBuffer::new(6);
        console.append("ééééé");
        console.append("ab");
        assert_eq!(console.len(), 6);
        console.append("c");
        assert_eq!(console.len(), 6);
        assert_eq!(console.drain(), "éééabc");
    }
}
