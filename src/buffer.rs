use std::io;

/// Fixed-capacity FIFO byte buffer backing the control channel receive
/// side. Data is appended at the tail and consumed from the head; stored
/// bytes are compacted to the front before each fill so the free region is
/// always contiguous.
pub struct Buffer {
    data: Box<[u8]>,
    head: usize,
    tail: usize,
}

impl Buffer {
    #[inline]
    pub fn new(capacity: usize) -> Buffer {
        Buffer {
            data: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            tail: 0,
        }
    }

    /// The number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.tail - self.head
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Remaining free capacity in the buffer.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.data.len() - self.len()
    }

    /// Slice containing the buffered data.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data[self.head..self.tail]
    }

    /// Drop `count` bytes from the head.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        assert!(count <= self.len(), "consumed past the buffered data");

        self.head += count;
        if self.head == self.tail {
            self.head = 0;
            self.tail = 0;
        }
    }

    #[inline]
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }

    /// Read once from the supplied reader into the free space and return
    /// the byte count. Zero means the reader reached end-of-file.
    pub fn fill<R: io::Read>(&mut self, mut reader: R) -> io::Result<usize> {
        self.compact();

        if self.tail == self.data.len() {
            return Err(io::Error::new(io::ErrorKind::Other, "buffer overrun"));
        }

        let count = reader.read(&mut self.data[self.tail..])?;
        self.tail += count;

        Ok(count)
    }

    fn compact(&mut self) {
        if self.head > 0 {
            self.data.copy_within(self.head..self.tail, 0);
            self.tail -= self.head;
            self.head = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;

    /// Reader handing out its data in bounded chunks and signalling
    /// would-block once drained.
    struct MockChannel {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
    }

    impl MockChannel {
        fn new(data: Vec<u8>, chunk: usize) -> MockChannel {
            MockChannel { data, cursor: 0, chunk }
        }
    }

    impl io::Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let offset = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..offset].copy_from_slice(&self.data[self.cursor..(self.cursor + offset)]);
            self.cursor += offset;
            Ok(offset)
        }
    }

    #[test]
    fn test_fill_and_consume() {
        let mut channel = MockChannel::new(vec![1, 2, 3, 4, 5], 3);
        let mut buffer = Buffer::new(16);

        assert_eq!(buffer.fill(&mut channel).unwrap(), 3);
        assert_eq!(buffer.fill(&mut channel).unwrap(), 2);
        assert_eq!(buffer.data(), &[1, 2, 3, 4, 5]);

        buffer.consume(2);
        assert_eq!(buffer.data(), &[3, 4, 5]);
        assert_eq!(buffer.len(), 3);

        buffer.consume(3);
        assert!(buffer.is_empty());
        assert_eq!(buffer.free_capacity(), 16);
    }

    #[test]
    fn test_fill_compacts_before_reading() {
        let mut buffer = Buffer::new(8);

        assert_eq!(buffer.fill(&[1u8, 2, 3, 4, 5, 6, 7, 8][..]).unwrap(), 8);
        buffer.consume(6);

        // The two live bytes move to the front, freeing six at the tail.
        assert_eq!(buffer.fill(&[9u8, 10, 11, 12, 13, 14][..]).unwrap(), 6);
        assert_eq!(buffer.data(), &[7, 8, 9, 10, 11, 12, 13, 14]);
    }

    #[test]
    fn test_fill_full_buffer_is_an_error() {
        let mut buffer = Buffer::new(4);

        assert_eq!(buffer.fill(&[1u8, 2, 3, 4][..]).unwrap(), 4);

        let err = buffer.fill(&[5u8][..]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
    }

    #[test]
    fn test_fill_would_block_passes_through() {
        let mut channel = MockChannel::new(vec![1], 1);
        let mut buffer = Buffer::new(4);

        buffer.fill(&mut channel).unwrap();
        let err = buffer.fill(&mut channel).unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_clear_resets_the_buffer() {
        let mut buffer = Buffer::new(4);

        buffer.fill(&[1u8, 2][..]).unwrap();
        buffer.clear();

        assert!(buffer.is_empty());
        assert_eq!(buffer.free_capacity(), 4);
    }

    #[test]
    #[should_panic(expected = "consumed past the buffered data")]
    fn test_consume_past_data_panics() {
        let mut buffer = Buffer::new(4);
        buffer.consume(1);
    }
}
