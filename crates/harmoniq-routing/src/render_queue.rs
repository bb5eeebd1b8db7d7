//! Seekable byte queue with read/write indices and a bounded rewind history.

use std::collections::VecDeque;

use crate::mix::silence_byte;
use crate::sample::SampleSpec;

/// Audio already handed out stays in the queue for up to `max_rewind` bytes
/// so the reader can be moved back. Writing past the end through a seek pads
/// with silence.
#[derive(Debug, Clone)]
pub struct RenderQueue {
    data: VecDeque<u8>,
    base: i64,
    read: i64,
    write: i64,
    max_rewind: usize,
    silence: u8,
    frame_size: usize,
}

impl RenderQueue {
    pub fn new(spec: &SampleSpec, max_rewind: usize) -> Self {
        Self {
            data: VecDeque::new(),
            base: 0,
            read: 0,
            write: 0,
            max_rewind,
            silence: silence_byte(spec.format),
            frame_size: spec.frame_size().max(1),
        }
    }

    pub fn read_index(&self) -> i64 {
        self.read
    }

    pub fn write_index(&self) -> i64 {
        self.write
    }

    /// Bytes between the read and the write index.
    pub fn length(&self) -> usize {
        (self.write - self.read).max(0) as usize
    }

    pub fn is_readable(&self) -> bool {
        self.write > self.read
    }

    pub fn is_empty(&self) -> bool {
        !self.is_readable()
    }

    pub fn max_rewind(&self) -> usize {
        self.max_rewind
    }

    pub fn set_max_rewind(&mut self, max_rewind: usize) {
        self.max_rewind = max_rewind;
        self.trim_history();
    }

    pub fn push(&mut self, bytes: &[u8]) {
        let aligned = bytes.len() - bytes.len() % self.frame_size;
        if aligned == 0 {
            return;
        }
        self.data.extend(&bytes[..aligned]);
        self.write += aligned as i64;
    }

    /// Moves the write index. Forward seeks fill the gap with silence.
    pub fn seek(&mut self, offset: i64) {
        if offset >= 0 {
            let n = offset as usize;
            self.data.extend(std::iter::repeat(self.silence).take(n));
            self.write += offset;
        } else {
            let target = (self.write + offset).max(self.base);
            self.data.truncate((target - self.base) as usize);
            self.write = target;
        }
    }

    /// Readable bytes, at most `max`.
    pub fn peek(&self, max: usize) -> Option<Vec<u8>> {
        if !self.is_readable() || max == 0 {
            return None;
        }
        let start = (self.read - self.base) as usize;
        let end = start + self.length().min(max);
        Some(self.data.range(start..end).copied().collect())
    }

    pub fn drop_bytes(&mut self, nbytes: usize) {
        self.read += nbytes as i64;
        if self.read > self.write {
            let gap = (self.read - self.write) as usize;
            self.data.extend(std::iter::repeat(self.silence).take(gap));
            self.write = self.read;
        }
        self.trim_history();
    }

    /// Moves the read index back by up to `nbytes`, limited by the history.
    /// Returns the amount actually rewound.
    pub fn rewind(&mut self, nbytes: usize) -> usize {
        let available = (self.read - self.base).max(0) as usize;
        let amount = nbytes.min(available);
        self.read -= amount as i64;
        amount
    }

    /// Discards everything that has not been read yet.
    pub fn flush_write(&mut self) {
        let keep = (self.read - self.base).max(0) as usize;
        self.data.truncate(keep);
        self.write = self.read.max(self.base);
    }

    /// Skips everything that has been written.
    pub fn flush_read(&mut self) {
        self.read = self.write;
        self.trim_history();
    }

    /// Replaces the unread part with silence, keeping both indices.
    pub fn silence(&mut self) {
        let start = (self.read - self.base).max(0) as usize;
        for byte in self.data.iter_mut().skip(start) {
            *byte = self.silence;
        }
    }

    fn trim_history(&mut self) {
        let keep_from = self.read - self.max_rewind as i64;
        while self.base < keep_from && !self.data.is_empty() {
            self.data.pop_front();
            self.base += 1;
        }
        if self.data.is_empty() {
            self.base = self.write.min(self.read);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::SampleFormat;

    fn queue(max_rewind: usize) -> RenderQueue {
        RenderQueue::new(&SampleSpec::new(SampleFormat::U8, 8_000, 1), max_rewind)
    }

    #[test]
    fn rewind_is_limited_by_history() {
        let mut q = queue(4);
        q.push(&[1, 2, 3, 4, 5, 6, 7, 8]);
        q.drop_bytes(6);
        assert_eq!(q.length(), 2);
        assert_eq!(q.rewind(10), 4);
        assert_eq!(q.peek(3), Some(vec![3, 4, 5]));
    }

    #[test]
    fn seeks_pad_with_silence_and_truncate() {
        let mut q = queue(0);
        q.seek(3);
        assert_eq!(q.peek(8), Some(vec![0x80; 3]));
        q.push(&[9]);
        q.seek(-2);
        assert_eq!(q.length(), 2);
        assert_eq!(q.peek(8), Some(vec![0x80, 0x80]));
    }

    #[test]
    fn flushes_and_silence() {
        let mut q = queue(16);
        q.push(&[1, 2, 3, 4]);
        q.drop_bytes(1);
        q.silence();
        assert_eq!(q.peek(8), Some(vec![0x80; 3]));
        q.flush_write();
        assert!(!q.is_readable());
        assert_eq!(q.rewind(1), 1);
        assert_eq!(q.peek(1), Some(vec![1]));
        q.push(&[7, 7]);
        q.flush_read();
        assert!(q.is_empty());
    }
}
