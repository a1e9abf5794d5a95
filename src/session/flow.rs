//! The side-tagged exchange log of one session.
//!
//! Inspectors consume the flow rather than the raw sockets: every chunk a
//! session reads is appended under its side before being forwarded, so the
//! log preserves receive order across both directions.

use bytes::{Bytes, BytesMut};

//----------- Side -------------------------------------------------------------

/// One side of a proxied session.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Side {
    /// The client-facing side.
    Left,

    /// The origin-facing side.
    Right,
}

impl Side {
    pub fn flip(self) -> Self {
        match self {
            Self::Left => Self::Right,
            Self::Right => Self::Left,
        }
    }

    pub fn tag(self) -> char {
        match self {
            Self::Left => 'L',
            Self::Right => 'R',
        }
    }

    /// Parse a signature-file side tag.
    pub fn from_tag(tag: char) -> Option<Self> {
        match tag.to_ascii_uppercase() {
            'L' => Some(Self::Left),
            'R' => Some(Self::Right),
            _ => None,
        }
    }
}

//----------- Flow -------------------------------------------------------------

/// The ordered exchange log.
///
/// Consecutive chunks of the same side coalesce into one entry, so the log
/// alternates sides.
#[derive(Debug, Default)]
pub struct Flow {
    chunks: Vec<(Side, BytesMut)>,
}

impl Flow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append data received on `side`.
    pub fn append(&mut self, side: Side, data: &[u8]) {
        match self.chunks.last_mut() {
            Some((last_side, chunk)) if *last_side == side => {
                chunk.extend_from_slice(data);
            }
            _ => {
                self.chunks.push((side, BytesMut::from(data)));
            }
        }
    }

    pub fn chunks(&self) -> &[(Side, BytesMut)] {
        &self.chunks
    }

    /// The most recent exchange entry.
    pub fn last(&self) -> Option<(Side, &[u8])> {
        self.chunks.last().map(|(side, chunk)| (*side, &chunk[..]))
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Total bytes logged for `side`.
    pub fn side_bytes(&self, side: Side) -> usize {
        self.chunks
            .iter()
            .filter(|(s, _)| *s == side)
            .map(|(_, c)| c.len())
            .sum()
    }

    /// Drop the logged payload, keeping nothing.  Used once inspection has
    /// concluded so long-lived sessions do not accumulate history.
    pub fn reset(&mut self) {
        self.chunks.clear();
    }

    /// Freeze the most recent chunk of `side` for hand-off, if any.
    pub fn last_of(&self, side: Side) -> Option<Bytes> {
        self.chunks
            .iter()
            .rev()
            .find(|(s, _)| *s == side)
            .map(|(_, c)| Bytes::copy_from_slice(c))
    }
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consecutive_same_side_chunks_coalesce() {
        let mut flow = Flow::new();
        flow.append(Side::Left, b"GET /");
        flow.append(Side::Left, b" HTTP/1.1");
        flow.append(Side::Right, b"200 OK");
        flow.append(Side::Left, b"more");

        assert_eq!(flow.len(), 3);
        assert_eq!(&flow.chunks()[0].1[..], b"GET / HTTP/1.1");
        assert_eq!(flow.side_bytes(Side::Left), 18);
        assert_eq!(flow.side_bytes(Side::Right), 6);
    }

    #[test]
    fn last_reports_most_recent_entry() {
        let mut flow = Flow::new();
        assert!(flow.last().is_none());
        flow.append(Side::Right, b"hello");
        let (side, data) = flow.last().unwrap();
        assert_eq!(side, Side::Right);
        assert_eq!(data, b"hello");
    }
}
