use crate::prelude::*;
use crate::client::packet::{self, PREFIX};

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

/// Upper bound for a single client frame; a 127-register write multi is well below this.
pub const MAX_FRAME_LEN: usize = 1024;

/// Splits a client byte stream into whole frames using the `frame_len` header.
///
/// Bytes before an `A1 1A` prefix are dropped. A header declaring an
/// impossible length loses its first byte and the search restarts.
#[derive(Default)]
pub struct FrameDecoder {
    skipped: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes discarded while hunting for a prefix.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn skip(&mut self, src: &mut BytesMut, n: usize) {
        src.advance(n);
        self.skipped += n;
    }
}

impl Decoder for FrameDecoder {
    type Item = BytesMut;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            match src.windows(2).position(|w| w == PREFIX) {
                Some(0) => {}
                Some(n) => {
                    trace!("dropping {} bytes before frame prefix", n);
                    self.skip(src, n);
                }
                None => {
                    // a lone trailing 0xA1 may be the start of the next prefix
                    let keep = usize::from(src.last() == Some(&PREFIX[0]));
                    let n = src.len() - keep;
                    if n > 0 {
                        self.skip(src, n);
                    }
                    return Ok(None);
                }
            }

            let len = match packet::declared_len(src) {
                Some(len) => len,
                None => return Ok(None),
            };

            if !(packet::MIN_REQUEST_LEN..=MAX_FRAME_LEN).contains(&len) {
                debug!("implausible client frame length {}, resyncing", len);
                self.skip(src, 1);
                continue;
            }

            if src.len() < len {
                src.reserve(len - src.len());
                return Ok(None);
            }

            return Ok(Some(src.split_to(len)));
        }
    }
}
