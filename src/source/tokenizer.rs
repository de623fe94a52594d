/// Splits a byte stream into delimiter-terminated lines.
///
/// Bytes after the last delimiter stay buffered until more data arrives or the
/// caller flushes them.
#[derive(Debug)]
pub struct LineTokenizer {
    delimiter: Vec<u8>,
    buffer: Vec<u8>,
}

impl LineTokenizer {
    pub fn new(delimiter: Vec<u8>) -> Self {
        assert!(!delimiter.is_empty(), "delimiter cannot be empty");
        Self {
            delimiter,
            buffer: Vec::new(),
        }
    }

    pub fn delimiter_len(&self) -> usize {
        self.delimiter.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Feed a chunk and return every line it completes, without delimiters.
    pub fn extract(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        // A delimiter may straddle the previous chunk boundary
        let search_from = self.buffer.len().saturating_sub(self.delimiter.len() - 1);
        self.buffer.extend_from_slice(data);

        let mut lines = Vec::new();
        let mut line_start = 0;
        let mut pos = search_from;
        while let Some(found) = find(&self.buffer[pos..], &self.delimiter) {
            let end = pos + found;
            lines.push(self.buffer[line_start..end].to_vec());
            line_start = end + self.delimiter.len();
            pos = line_start;
        }
        self.buffer.drain(..line_start);
        lines
    }

    /// Take whatever unterminated data is buffered.
    pub fn flush(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() == 1 {
        return haystack.iter().position(|&b| b == needle[0]);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_newline_split() {
        let mut tokenizer = LineTokenizer::new(b"\n".to_vec());
        let lines = tokenizer.extract(b"a\nb\nc\n");
        assert_eq!(lines, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert!(tokenizer.is_empty());
    }

    #[test]
    fn test_partial_line_buffered() {
        let mut tokenizer = LineTokenizer::new(b"\n".to_vec());
        assert_eq!(tokenizer.extract(b"first\nsec"), vec![b"first".to_vec()]);
        assert!(!tokenizer.is_empty());
        assert_eq!(tokenizer.extract(b"ond\n"), vec![b"second".to_vec()]);
        assert!(tokenizer.is_empty());
    }

    #[test]
    fn test_multibyte_delimiter_across_chunks() {
        let mut tokenizer = LineTokenizer::new(b"\r\n".to_vec());
        assert!(tokenizer.extract(b"one\r").is_empty());
        assert_eq!(tokenizer.extract(b"\ntwo\r\n"), vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn test_flush_returns_remainder() {
        let mut tokenizer = LineTokenizer::new(b"\n".to_vec());
        tokenizer.extract(b"done\ntrailing");
        assert_eq!(tokenizer.flush(), b"trailing".to_vec());
        assert!(tokenizer.is_empty());
        assert!(tokenizer.flush().is_empty());
    }

    #[test]
    fn test_empty_lines_kept() {
        let mut tokenizer = LineTokenizer::new(b"\n".to_vec());
        assert_eq!(tokenizer.extract(b"\n\nx\n").len(), 3);
    }
}
