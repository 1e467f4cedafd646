use std::collections::VecDeque;

use bytes::BytesMut;

/// Ordered queue of raw buffers fed from the transport. `read` hands
/// back exactly `n` bytes, splitting the head buffer without copying
/// when it is large enough and coalescing across buffers otherwise.
pub struct ByteQueue {
    chunks: VecDeque<BytesMut>,
    total: usize,
}

impl ByteQueue {
    pub fn new() -> Self {
        ByteQueue {
            chunks: VecDeque::new(),
            total: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.total
    }

    pub fn push(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.total += data.len();
        self.chunks.push_back(BytesMut::from(data));
    }

    pub fn read(&mut self, n: usize) -> Option<BytesMut> {
        if n == 0 || self.total < n {
            return None;
        }

        let mut out = self.chunks.pop_front()?;
        if out.len() >= n {
            if out.len() > n {
                let rest = out.split_off(n);
                self.chunks.push_front(rest);
            }
            self.total -= n;
            return Some(out);
        }

        out.reserve(n - out.len());
        while out.len() < n {
            let mut chunk = match self.chunks.pop_front() {
                Some(chunk) => chunk,
                None => break,
            };
            let need = n - out.len();
            if chunk.len() > need {
                let rest = chunk.split_off(need);
                self.chunks.push_front(rest);
            }
            out.extend_from_slice(&chunk);
        }
        self.total -= n;
        Some(out)
    }
}
