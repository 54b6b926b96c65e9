use std::fmt;
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::RawFd;

use nix::sys::socket::{recvmsg, sendmsg, MsgFlags};

/// A bounded byte FIFO backed by a fixed ring. Bytes enter through
/// [`recv_from_fd`](Self::recv_from_fd) and leave through
/// [`send_to_fd`](Self::send_to_fd); [`peek`](Self::peek) copies from the
/// front without consuming. The buffer never grows past its configured size.
pub struct Buffer {
    data: Box<[u8]>,
    /// Index of the oldest byte.
    head: usize,
    len: usize,
}

impl Buffer {
    pub fn with_capacity(size: usize) -> Self {
        assert!(size > 0);

        Self {
            data: vec![0; size].into_boxed_slice(),
            head: 0,
            len: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Free space remaining.
    pub fn room(&self) -> usize {
        self.data.len() - self.len
    }

    /// Copy up to `dst.len()` buffered bytes into `dst` without consuming
    /// them. Returns the number of bytes copied.
    pub fn peek(&self, dst: &mut [u8]) -> usize {
        let n = std::cmp::min(dst.len(), self.len);
        let first = std::cmp::min(self.data.len() - self.head, n);

        dst[..first].copy_from_slice(&self.data[self.head..self.head + first]);
        if n > first {
            dst[first..n].copy_from_slice(&self.data[..n - first]);
        }

        n
    }

    /// Receive up to [`room`](Self::room) bytes from `fd` without blocking.
    /// `Ok(0)` is an orderly close by the peer. A full buffer reports
    /// [`EAGAIN`](nix::errno::Errno::EAGAIN) rather than a bogus end-of-file.
    pub fn recv_from_fd(&mut self, fd: RawFd) -> nix::Result<usize> {
        if self.room() == 0 {
            return Err(nix::errno::Errno::EAGAIN);
        }

        let head = self.head;
        let size = self.data.len();
        let room = size - self.len;
        let write_pos = (head + self.len) % size;

        let flags = MsgFlags::MSG_DONTWAIT;
        let n = if write_pos + room <= size {
            let mut iov = [IoSliceMut::new(&mut self.data[write_pos..write_pos + room])];
            recvmsg::<()>(fd, &mut iov, None, flags)?.bytes
        } else {
            // the free region wraps around the end of the ring
            let (front, back) = self.data.split_at_mut(write_pos);
            let mut iov = [IoSliceMut::new(back), IoSliceMut::new(&mut front[..head])];
            recvmsg::<()>(fd, &mut iov, None, flags)?.bytes
        };

        self.len += n;

        Ok(n)
    }

    /// Send up to [`len`](Self::len) bytes to `fd` without blocking and
    /// consume the amount sent. An empty buffer sends nothing and returns
    /// `Ok(0)`.
    pub fn send_to_fd(&mut self, fd: RawFd) -> nix::Result<usize> {
        if self.len == 0 {
            return Ok(0);
        }

        let head = self.head;
        let size = self.data.len();
        let first = std::cmp::min(size - head, self.len);

        // MSG_NOSIGNAL so a dead peer surfaces EPIPE instead of SIGPIPE
        let flags = MsgFlags::MSG_DONTWAIT | MsgFlags::MSG_NOSIGNAL;
        let n = if first == self.len {
            let iov = [IoSlice::new(&self.data[head..head + first])];
            sendmsg::<()>(fd, &iov, &[], flags, None)?
        } else {
            let iov = [
                IoSlice::new(&self.data[head..]),
                IoSlice::new(&self.data[..self.len - first]),
            ];
            sendmsg::<()>(fd, &iov, &[], flags, None)?
        };

        self.head = (self.head + n) % size;
        self.len -= n;
        if self.len == 0 {
            self.head = 0;
        }

        Ok(n)
    }

    /// Copy bytes straight into the ring, for tests that need buffered data
    /// without a socket on the receive side.
    #[cfg(test)]
    pub(crate) fn fill(&mut self, bytes: &[u8]) -> usize {
        let n = std::cmp::min(bytes.len(), self.room());
        let size = self.data.len();

        for (i, b) in bytes[..n].iter().enumerate() {
            self.data[(self.head + self.len + i) % size] = *b;
        }
        self.len += n;

        n
    }

    /// Discard bytes from the front of the ring, for tests that need the head
    /// at a particular offset.
    #[cfg(test)]
    pub(crate) fn consume(&mut self, n: usize) {
        assert!(n <= self.len);
        self.head = (self.head + n) % self.data.len();
        self.len -= n;
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len)
            .field("size", &self.data.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    use nix::errno::Errno;

    use super::*;

    #[test]
    fn test_fill_and_peek() {
        let mut buffer = Buffer::with_capacity(8);

        assert_eq!(buffer.fill(b"abcde"), 5);
        assert_eq!(buffer.len(), 5);
        assert_eq!(buffer.room(), 3);

        let mut dst = [0; 8];
        assert_eq!(buffer.peek(&mut dst), 5);
        assert_eq!(&dst[..5], b"abcde");

        // peeking must not consume
        assert_eq!(buffer.len(), 5);

        // a short destination gets a prefix
        let mut short = [0; 2];
        assert_eq!(buffer.peek(&mut short), 2);
        assert_eq!(&short, b"ab");
    }

    #[test]
    fn test_recv_and_send_roundtrip() {
        let (mut near, far) = UnixStream::pair().unwrap();
        let (mut out_near, out_far) = UnixStream::pair().unwrap();
        let mut buffer = Buffer::with_capacity(64);

        near.write_all(b"hello proxy").unwrap();
        assert_eq!(buffer.recv_from_fd(far.as_raw_fd()), Ok(11));
        assert_eq!(buffer.len(), 11);

        // nothing more to read on a non-blocking socket
        assert_eq!(buffer.recv_from_fd(far.as_raw_fd()), Err(Errno::EAGAIN));

        assert_eq!(buffer.send_to_fd(out_far.as_raw_fd()), Ok(11));
        assert!(buffer.is_empty());

        let mut dst = [0; 11];
        out_near.read_exact(&mut dst).unwrap();
        assert_eq!(&dst, b"hello proxy");
    }

    #[test]
    fn test_io_across_the_ring_seam() {
        let (mut near, far) = UnixStream::pair().unwrap();
        let (mut out_near, out_far) = UnixStream::pair().unwrap();
        let mut buffer = Buffer::with_capacity(8);

        // leave "ef" at offsets 4..6 so the free region wraps
        assert_eq!(buffer.fill(b"abcdef"), 6);
        buffer.consume(4);

        near.write_all(b"ghij").unwrap();
        assert_eq!(buffer.recv_from_fd(far.as_raw_fd()), Ok(4));
        assert_eq!(buffer.len(), 6);

        let mut dst = [0; 8];
        assert_eq!(buffer.peek(&mut dst), 6);
        assert_eq!(&dst[..6], b"efghij");

        // the buffered run now crosses the seam on the way out too
        assert_eq!(buffer.send_to_fd(out_far.as_raw_fd()), Ok(6));
        assert!(buffer.is_empty());

        let mut dst = [0; 6];
        out_near.read_exact(&mut dst).unwrap();
        assert_eq!(&dst, b"efghij");
    }

    #[test]
    fn test_full_buffer_reports_eagain() {
        let (mut near, far) = UnixStream::pair().unwrap();
        let mut buffer = Buffer::with_capacity(4);

        near.write_all(b"abcdef").unwrap();
        assert_eq!(buffer.recv_from_fd(far.as_raw_fd()), Ok(4));
        assert_eq!(buffer.room(), 0);
        assert_eq!(buffer.recv_from_fd(far.as_raw_fd()), Err(Errno::EAGAIN));
    }

    #[test]
    fn test_orderly_close_reads_zero() {
        let (near, far) = UnixStream::pair().unwrap();
        let mut buffer = Buffer::with_capacity(4);

        drop(near);
        assert_eq!(buffer.recv_from_fd(far.as_raw_fd()), Ok(0));
    }

    #[test]
    fn test_send_with_empty_buffer_is_a_no_op() {
        let (_near, far) = UnixStream::pair().unwrap();
        let mut buffer = Buffer::with_capacity(4);

        assert_eq!(buffer.send_to_fd(far.as_raw_fd()), Ok(0));
    }
}
