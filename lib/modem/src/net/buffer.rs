use crate::net::shared::{ErrorType, NetworkError, NetworkResult};
use std::io;

/// Hard cap on bytes the reassembler may hold between TCP reads.
pub const MAX_BUFFERED: usize = 65_536;
/// Consecutive reads that may end with leftover bytes before the peer is
/// assumed to be stalling a frame on purpose.
pub const MAX_ACCUMULATION_ATTEMPTS: u32 = 10;

/// A FIFO byte queue bridging frame producers and the non-blocking socket.
/// Data is appended at the tail and drained from the head.
pub struct Buffer {
    data: Vec<u8>,
    head: usize,
    capacity: usize,
}

impl Buffer {
    #[inline]
    pub fn new(capacity: usize) -> Buffer {
        Buffer {
            data: Vec::with_capacity(capacity),
            head: 0,
            capacity,
        }
    }

    /// The number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() - self.head
    }

    /// Returns true in case the buffer is empty, false otherwise.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining free capacity in the buffer.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.capacity - self.len()
    }

    /// Slice containing buffered data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        &self.data[self.head..]
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
        self.head = 0;
    }

    /// Appends bytes at the tail. Returns false without writing anything
    /// when the bytes would not fit.
    pub fn push(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.free_capacity() {
            return false;
        }

        self.compact();
        self.data.extend_from_slice(bytes);
        true
    }

    /// Write the contents of the buffer to the supplied writer, advancing
    /// the read offset.
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let orig_len = self.len();

        while self.len() > 0 {
            let count = writer.write(self.read_slice())?;

            if count == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }

            self.consume(count);
        }

        Ok(orig_len)
    }

    #[inline]
    fn consume(&mut self, count: usize) {
        self.head += count;

        if self.head == self.data.len() {
            self.clear();
        }
    }

    #[inline]
    fn compact(&mut self) {
        // Reclaim the consumed prefix once it dominates the allocation.
        if self.head >= self.capacity / 2 {
            self.data.drain(..self.head);
            self.head = 0;
        }
    }
}

/// Holds trailing bytes of a TCP read that did not form a complete frame and
/// presents them together with the next read. Bounded in both size and the
/// number of consecutive reads that fail to complete a frame.
pub struct TcpReassembler {
    buffered: Vec<u8>,
    attempts: u32,
    fresh: bool,
}

impl TcpReassembler {
    #[inline]
    pub fn new() -> TcpReassembler {
        TcpReassembler {
            buffered: Vec::new(),
            attempts: 0,
            fresh: true,
        }
    }

    #[inline]
    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    #[inline]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Combines held bytes with the new chunk and returns the combined view.
    /// At most one `prepare`/`remainder` call pair may run per received TCP
    /// chunk.
    pub fn prepare(&mut self, new_bytes: &[u8]) -> NetworkResult<&[u8]> {
        let combined = self.buffered.len() + new_bytes.len();

        if combined > MAX_BUFFERED {
            return Err(NetworkError::Fatal(ErrorType::BufferOverflow {
                size: combined,
                attempts: self.attempts,
            }));
        }

        self.fresh = self.buffered.is_empty();
        self.buffered.extend_from_slice(new_bytes);

        Ok(&self.buffered)
    }

    /// Retains everything past `n_processed` for the next read.
    pub fn remainder(&mut self, n_processed: usize) -> NetworkResult<()> {
        if n_processed > self.buffered.len() {
            return Err(NetworkError::Fatal(ErrorType::MalformedFrame));
        }

        self.buffered.drain(..n_processed);

        if self.buffered.is_empty() {
            self.attempts = 0;
            return Ok(());
        }

        self.attempts = if self.fresh { 1 } else { self.attempts + 1 };

        if self.attempts > MAX_ACCUMULATION_ATTEMPTS {
            return Err(NetworkError::Fatal(ErrorType::BufferOverflow {
                size: self.buffered.len(),
                attempts: self.attempts,
            }));
        }

        Ok(())
    }

    /// Releases buffered state, reporting the number of bytes discarded.
    pub fn clear(&mut self) -> usize {
        let discarded = self.buffered.len();

        self.buffered.clear();
        self.attempts = 0;
        self.fresh = true;

        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;

    struct MockChannel {
        data: Vec<u8>,
        chunk: usize,
        max_size: usize,
    }

    impl io::Write for MockChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.data.len() >= self.max_size {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = min(self.chunk, buf.len());
            self.data.extend(&buf[..count]);

            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            unimplemented!()
        }
    }

    #[test]
    fn test_push_and_egress_roundtrip() {
        let payload: Vec<_> = (0..1000).map(|item| item as u8).collect();
        let mut buffer = Buffer::new(4096);
        let mut channel = MockChannel {
            data: Vec::new(),
            chunk: 100,
            max_size: 2000,
        };

        assert!(buffer.push(&payload));
        assert_eq!(buffer.len(), payload.len());

        let count = buffer.egress(&mut channel).unwrap();

        assert_eq!(count, payload.len());
        assert!(buffer.is_empty());
        assert_eq!(channel.data, payload);
    }

    #[test]
    fn test_push_rejects_overflow() {
        let mut buffer = Buffer::new(16);

        assert!(buffer.push(&[1; 16]));
        assert!(!buffer.push(&[2; 1]));
        assert_eq!(buffer.len(), 16);
    }

    #[test]
    fn test_egress_partial_on_backpressure() {
        let mut buffer = Buffer::new(4096);
        let mut channel = MockChannel {
            data: Vec::new(),
            chunk: 100,
            max_size: 150,
        };

        buffer.push(&[7; 300]);

        let result = buffer.egress(&mut channel);

        assert_eq!(result.err().unwrap().kind(), io::ErrorKind::WouldBlock);
        assert_eq!(buffer.len(), 100);
        assert_eq!(channel.data.len(), 200);
    }

    #[test]
    fn test_egress_error_on_zero_write() {
        let mut zero_vec = vec![];
        let mut buffer = Buffer::new(64);

        buffer.push(&[1]);

        let result = buffer.egress(&mut zero_vec[..]);

        assert_eq!(result.err().unwrap().kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn test_reassembler_passthrough() {
        let mut reassembler = TcpReassembler::new();

        let combined = reassembler.prepare(&[1, 2, 3]).unwrap().to_vec();
        assert_eq!(combined, vec![1, 2, 3]);

        reassembler.remainder(3).unwrap();
        assert_eq!(reassembler.buffered_len(), 0);
        assert_eq!(reassembler.attempts(), 0);
    }

    #[test]
    fn test_reassembler_concatenates_leftover() {
        let mut reassembler = TcpReassembler::new();

        reassembler.prepare(&[1, 2, 3]).unwrap();
        reassembler.remainder(1).unwrap();

        let combined = reassembler.prepare(&[4, 5]).unwrap().to_vec();
        assert_eq!(combined, vec![2, 3, 4, 5]);
    }

    #[test]
    fn test_reassembler_size_cap() {
        let mut reassembler = TcpReassembler::new();

        reassembler.prepare(&vec![0; MAX_BUFFERED]).unwrap();
        reassembler.remainder(0).unwrap();

        let result = reassembler.prepare(&[0]);

        match result {
            Err(NetworkError::Fatal(ErrorType::BufferOverflow { size, .. })) => {
                assert_eq!(size, MAX_BUFFERED + 1)
            }
            other => panic!("Unexpected result {:?}", other.map(<[u8]>::to_vec)),
        }
    }

    #[test]
    fn test_reassembler_attempt_budget() {
        let mut reassembler = TcpReassembler::new();

        reassembler.prepare(&[0x5A]).unwrap();
        reassembler.remainder(0).unwrap();
        assert_eq!(reassembler.attempts(), 1);

        for _ in 0..MAX_ACCUMULATION_ATTEMPTS - 1 {
            reassembler.prepare(&[]).unwrap();
            reassembler.remainder(0).unwrap();
        }
        assert_eq!(reassembler.attempts(), MAX_ACCUMULATION_ATTEMPTS);

        reassembler.prepare(&[]).unwrap();
        let result = reassembler.remainder(0);

        match result {
            Err(NetworkError::Fatal(ErrorType::BufferOverflow { attempts, .. })) => {
                assert_eq!(attempts, MAX_ACCUMULATION_ATTEMPTS + 1)
            }
            other => panic!("Unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_reassembler_attempts_reset_on_progress() {
        let mut reassembler = TcpReassembler::new();

        reassembler.prepare(&[0x5A, 0x00]).unwrap();
        reassembler.remainder(0).unwrap();
        assert_eq!(reassembler.attempts(), 1);

        reassembler.prepare(&[0x01]).unwrap();
        reassembler.remainder(3).unwrap();
        assert_eq!(reassembler.attempts(), 0);
    }

    #[test]
    fn test_reassembler_rejects_out_of_range() {
        let mut reassembler = TcpReassembler::new();

        reassembler.prepare(&[1, 2]).unwrap();
        let result = reassembler.remainder(3);

        assert_eq!(result, Err(NetworkError::Fatal(ErrorType::MalformedFrame)));
    }

    #[test]
    fn test_reassembler_clear_reports_discarded() {
        let mut reassembler = TcpReassembler::new();

        reassembler.prepare(&[1, 2, 3, 4]).unwrap();
        reassembler.remainder(1).unwrap();

        assert_eq!(reassembler.clear(), 3);
        assert_eq!(reassembler.buffered_len(), 0);
        assert_eq!(reassembler.attempts(), 0);
    }
}
