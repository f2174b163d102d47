/// Appended to captured output that hit the size bound.
pub const TRUNCATION_MARKER: &str = "\n[... output truncated ...]";

/// Size-bounded capture of a run's combined stdout/stderr.
///
/// Bytes past the limit are counted but dropped, so the child never
/// blocks on a full pipe.
#[derive(Debug)]
pub struct OutputBuffer {
    data: Vec<u8>,
    limit: usize,
    dropped: u64,
}

impl OutputBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            data: Vec::with_capacity(limit.min(8192)),
            limit,
            dropped: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.data.len());
        let take = room.min(chunk.len());
        self.data.extend_from_slice(&chunk[..take]);
        self.dropped += (chunk.len() - take) as u64;
    }

    pub fn is_truncated(&self) -> bool {
        self.dropped > 0
    }

    /// Lossy UTF-8 text, with [`TRUNCATION_MARKER`] if anything was dropped.
    pub fn render(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.data).into_owned();
        if self.is_truncated() {
            text.push_str(TRUNCATION_MARKER);
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_under_limit_kept_verbatim() {
        let mut buf = OutputBuffer::new(16);
        buf.push(b"hello ");
        buf.push(b"world");
        assert!(!buf.is_truncated());
        assert_eq!(buf.render(), "hello world");
    }

    #[test]
    fn test_over_limit_truncated_with_marker() {
        let mut buf = OutputBuffer::new(8);
        buf.push(b"0123456789");
        buf.push(b"more");
        assert!(buf.is_truncated());
        assert_eq!(buf.render(), format!("01234567{TRUNCATION_MARKER}"));
    }

    #[test]
    fn test_zero_limit() {
        let mut buf = OutputBuffer::new(0);
        buf.push(b"x");
        assert_eq!(buf.render(), TRUNCATION_MARKER);
    }
}
