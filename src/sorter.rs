//! Reassembly of out-of-order stream frames.

use std::collections::BTreeMap;

use bytes::Buf;

use crate::{
    error::{ErrorKind, TransportError},
    frame::StreamFrame,
};

/// Outcome of a successful [`FrameSorter::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// New bytes, or a new end-of-stream marker, were queued.
    Queued,
    /// Everything the frame carried was already delivered or queued.
    /// Retransmissions land here; not an error.
    Duplicate,
}

/// Ordered merge of out-of-order, possibly overlapping stream frames.
///
/// Frames are keyed by offset and never overlap once stored; the
/// `read_position` cursor is the offset of the next byte the reader
/// expects. [`head`] only exposes a frame once it sits exactly at the
/// cursor, so a gap blocks the reader even when later frames are queued.
///
/// ```
/// # use bytes::Bytes;
/// # use qstream::{FrameSorter, StreamFrame};
/// let mut sorter = FrameSorter::default();
/// sorter.push(StreamFrame::new(5, Bytes::from(" world"), true)).unwrap();
/// assert!(sorter.head().is_none()); // gap at offset 0
/// sorter.push(StreamFrame::new(0, Bytes::from("hello"), false)).unwrap();
/// assert_eq!(sorter.head().unwrap().data.as_ref(), b"hello");
/// ```
///
/// [`head`]: FrameSorter::head
#[derive(Debug, Default)]
pub struct FrameSorter {
    queued: BTreeMap<u64, StreamFrame>,
    read_position: u64,
    final_offset: Option<u64>,
}

impl FrameSorter {
    /// Offset of the next byte the reader expects.
    pub fn read_position(&self) -> u64 {
        self.read_position
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    /// Merge a frame into the queue.
    ///
    /// The prefix already delivered to the reader is dropped; ranges
    /// overlapping queued frames are verified byte-for-byte and absorbed;
    /// uncovered pieces are inserted. A frame contributing nothing new
    /// reports [`PushOutcome::Duplicate`]. Overlapping bytes that differ,
    /// and frames contradicting an established final size, are protocol
    /// errors.
    pub fn push(&mut self, frame: StreamFrame) -> Result<PushOutcome, TransportError> {
        let fin = frame.fin;
        let end = frame.end();
        let mut offset = frame.offset;
        let mut data = frame.data;

        if fin {
            if end < self.read_position {
                return Err(TransportError::new(
                    ErrorKind::FinalSize,
                    format!(
                        "reader already passed offset {end} claimed as the final size"
                    ),
                ));
            }
            if let Some(final_offset) = self.final_offset {
                if final_offset != end {
                    return Err(TransportError::new(
                        ErrorKind::FinalSize,
                        format!("final size changed from {final_offset} to {end}"),
                    ));
                }
            }
            if let Some((_, last)) = self.queued.iter().next_back() {
                if last.end() > end {
                    return Err(TransportError::new(
                        ErrorKind::FinalSize,
                        format!("stream data was already queued beyond the final size {end}"),
                    ));
                }
            }
            self.final_offset = Some(end);
        } else {
            if let Some(final_offset) = self.final_offset {
                if end > final_offset {
                    return Err(TransportError::new(
                        ErrorKind::FinalSize,
                        format!("stream data at {end} exceeds the final size {final_offset}"),
                    ));
                }
            }
            if end <= self.read_position {
                return Ok(PushOutcome::Duplicate);
            }
        }

        // drop the prefix the reader has already consumed
        if offset < self.read_position {
            let consumed = ((self.read_position - offset) as usize).min(data.len());
            data.advance(consumed);
            offset = self.read_position;
        }

        // clip against a queued frame extending over our start
        if let Some((&left_offset, left)) = self.queued.range(..offset).next_back() {
            let left_end = left.end();
            if left_end > offset {
                let overlap = ((left_end - offset) as usize).min(data.len());
                let at = (offset - left_offset) as usize;
                if left.data[at..at + overlap] != data[..overlap] {
                    return Err(conflict(offset));
                }
                data.advance(overlap);
                offset += overlap as u64;
            }
        }

        let mut queued_any = false;
        let mut fin_attached = false;

        // walk rightward: insert uncovered pieces, verify covered ranges
        while !data.is_empty() {
            let cur_end = offset + data.len() as u64;
            let next = self
                .queued
                .range(offset..cur_end)
                .next()
                .map(|(&k, f)| (k, f.clone()));
            match next {
                None => {
                    // the remainder reaches `end`, so the FIN bit rides on it
                    let piece = std::mem::take(&mut data);
                    self.queued.insert(offset, StreamFrame::new(offset, piece, fin));
                    if fin {
                        fin_attached = true;
                        // a stale zero-length marker at `end` is now redundant
                        if self.queued.get(&end).is_some_and(StreamFrame::is_empty) {
                            self.queued.remove(&end);
                        }
                    }
                    queued_any = true;
                }
                Some((next_offset, existing)) => {
                    if next_offset > offset {
                        let piece = data.split_to((next_offset - offset) as usize);
                        self.queued
                            .insert(offset, StreamFrame::new(offset, piece, false));
                        offset = next_offset;
                        queued_any = true;
                    }
                    let overlap = data.len().min(existing.len());
                    if existing.data[..overlap] != data[..overlap] {
                        return Err(conflict(offset));
                    }
                    data.advance(overlap);
                    offset += overlap as u64;
                }
            }
        }

        if fin && !fin_attached {
            // the body (if any) was wholly absorbed; the marker may still be new
            let already_marked = self.queued.get(&end).is_some_and(|f| f.fin)
                || self
                    .queued
                    .range(..end)
                    .next_back()
                    .is_some_and(|(_, f)| f.fin && f.end() == end);
            if !already_marked {
                self.queued.insert(end, StreamFrame::fin_only(end));
                queued_any = true;
            }
        }

        Ok(if queued_any {
            PushOutcome::Queued
        } else {
            PushOutcome::Duplicate
        })
    }

    /// The frame whose offset equals the read position, if queued.
    pub fn head(&self) -> Option<&StreamFrame> {
        let (&offset, frame) = self.queued.first_key_value()?;
        debug_assert!(offset >= self.read_position);
        (offset == self.read_position).then_some(frame)
    }

    /// Remove the head frame, advancing the read position past its bytes.
    /// A FIN-only frame advances by zero.
    pub fn pop(&mut self) -> Option<StreamFrame> {
        let (&offset, _) = self.queued.first_key_value()?;
        if offset != self.read_position {
            return None;
        }
        let frame = self.queued.remove(&offset)?;
        self.read_position += frame.len() as u64;
        Some(frame)
    }

    /// Reseat the cursor. Only valid while the queue is empty and no
    /// reader is active (handshake rewind on the crypto stream).
    pub fn set_read_position(&mut self, offset: u64) {
        debug_assert!(self.queued.is_empty());
        self.read_position = offset;
    }
}

fn conflict(offset: u64) -> TransportError {
    TransportError::new(
        ErrorKind::ProtocolViolation,
        format!("overlapping stream data at offset {offset} does not match the bytes already received"),
    )
}
