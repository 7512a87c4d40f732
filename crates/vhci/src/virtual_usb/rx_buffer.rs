//! Receive reassembly buffer
//!
//! Socket reads deliver bytes at arbitrary boundaries: one read may carry
//! half a header, another several messages. The buffer keeps the received
//! chunks without copying them and exposes the unconsumed bytes as one
//! logical stream, so a complete header can be peeked before deciding how
//! much payload to wait for.

use bytes::{Buf, Bytes};
use common::{Error, Result};
use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct ReceiveBuffer {
    chunks: VecDeque<Bytes>,
    size: usize,
}

impl ReceiveBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a received chunk
    pub fn append(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.size += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Unconsumed bytes
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Discard the first `n` bytes
    pub fn release(&mut self, mut n: usize) -> Result<()> {
        if n > self.size {
            return Err(Error::InvalidParameter(format!(
                "release of {} bytes with {} buffered",
                n, self.size
            )));
        }
        self.size -= n;

        while n > 0 {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            if front.len() <= n {
                n -= front.len();
                self.chunks.pop_front();
            } else {
                front.advance(n);
                n = 0;
            }
        }
        Ok(())
    }

    /// Copy `dest.len()` bytes starting at `offset` without consuming them
    pub fn copy_to(&self, dest: &mut [u8], offset: usize) -> Result<()> {
        let end = offset.checked_add(dest.len());
        if end.is_none_or(|end| end > self.size) {
            return Err(Error::InvalidParameter(format!(
                "copy of {} bytes at {} with {} buffered",
                dest.len(),
                offset,
                self.size
            )));
        }

        let mut skip = offset;
        let mut written = 0;
        for chunk in &self.chunks {
            if written == dest.len() {
                break;
            }
            if skip >= chunk.len() {
                skip -= chunk.len();
                continue;
            }
            let available = &chunk[skip..];
            let n = available.len().min(dest.len() - written);
            dest[written..written + n].copy_from_slice(&available[..n]);
            written += n;
            skip = 0;
        }
        Ok(())
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.size = 0;
    }
}
