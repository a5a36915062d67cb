/// Growable byte accumulator for a single connection's inbound stream.
///
/// Unlike the fixed `[u8; 1024]` buffer this is modeled after, frame bodies
/// here range up to [`crate::wire::header::DEFAULT_MAX_PACKET_SIZE`]
/// (100 MB), so the backing store must grow with demand rather than reject
/// writes past a fixed cap.
#[derive(Default)]
pub struct IOBuffer {
    buffer: Vec<u8>,
    /// length of valid content, counted from index 0
    mark: usize,
}

/// Read side starts this large; `expose_writable_part` grows it on demand.
const READ_CHUNK: usize = 64 * 1024;

impl IOBuffer {
    pub fn new() -> Self {
        IOBuffer::default()
    }

    pub fn content(&self) -> &[u8] {
        &self.buffer[..self.mark]
    }

    pub fn len(&self) -> usize {
        self.mark
    }

    pub fn is_empty(&self) -> bool {
        self.mark == 0
    }

    /// A writable slice the transport can `read()` into. Grows the backing
    /// vec if there isn't at least [`READ_CHUNK`] bytes of spare capacity.
    pub fn expose_writable_part(&mut self) -> &mut [u8] {
        if self.buffer.len() - self.mark < READ_CHUNK {
            self.buffer.resize(self.mark + READ_CHUNK, 0);
        }
        &mut self.buffer[self.mark..]
    }

    /// Makes the buffer aware of `size` new bytes written into the slice
    /// previously returned by [`Self::expose_writable_part`].
    pub fn register_added_content(&mut self, size: usize) {
        assert!(self.mark + size <= self.buffer.len());
        self.mark += size;
    }

    /// Drops `size` bytes from the front of the buffer.
    pub fn shift_left(&mut self, size: usize) {
        assert!(size <= self.mark);
        self.buffer.copy_within(size..self.mark, 0);
        self.mark -= size;
        // Release the backing allocation back down once the connection has
        // gone quiet, so one oversized frame doesn't pin multi-megabyte
        // capacity for the lifetime of the connection.
        if self.buffer.len() > 64 * 1024 && self.mark < 64 * 1024 {
            self.buffer.truncate(64 * 1024.max(self.mark));
            self.buffer.shrink_to_fit();
        }
    }

    pub fn append(&mut self, bytes: &[u8]) {
        if self.buffer.len() < self.mark + bytes.len() {
            self.buffer.resize(self.mark + bytes.len(), 0);
        }
        self.buffer[self.mark..self.mark + bytes.len()].copy_from_slice(bytes);
        self.mark += bytes.len();
    }
}
