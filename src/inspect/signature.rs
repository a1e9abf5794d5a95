//! The flow signature engine.
//!
//! A signature is an ordered list of per-side submatchers; it fires once
//! every submatcher has matched a flow exchange of its side, in order.
//! Signatures are grouped into sensors: ordinal 0 is reserved for STARTTLS
//! detection, 1 for base application detection, user groups start at 2.

use std::fmt;
use std::sync::Arc;

use regex::bytes::Regex;

use crate::session::flow::{Flow, Side};

/// The sensor group ordinal reserved for STARTTLS signatures.
pub const SENSOR_STARTTLS: u16 = 0;

/// The sensor group ordinal of the base detection set.
pub const SENSOR_DETECTION: u16 = 1;

//----------- SignatureError ---------------------------------------------------

/// A signature that could not be compiled.
#[derive(Debug)]
pub enum SignatureError {
    /// The regex pattern failed to compile.
    BadPattern(String, regex::Error),

    /// The side tag was not `L` or `R`.
    BadSide(String),
}

impl fmt::Display for SignatureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadPattern(name, err) => {
                write!(f, "signature '{name}': pattern failed to compile: {err}")
            }
            Self::BadSide(name) => write!(f, "signature '{name}': side must be 'L' or 'R'"),
        }
    }
}

impl std::error::Error for SignatureError {}

//----------- FlowMatch --------------------------------------------------------

/// One submatcher of a signature.
#[derive(Clone, Debug)]
pub struct FlowMatch {
    /// The side of the exchange this submatcher applies to.
    pub side: Side,

    /// Byte offset into the exchange where the window starts.
    pub offset: usize,

    /// Length of the scanned window.
    pub max_bytes: usize,

    /// The textual pattern as configured.
    pub pattern: String,

    matcher: Matcher,
}

#[derive(Clone, Debug)]
enum Matcher {
    Regex(Regex),
    Literal(Vec<u8>),
}

impl FlowMatch {
    pub fn regex(
        sig_name: &str,
        side: Side,
        offset: usize,
        max_bytes: usize,
        pattern: &str,
    ) -> Result<Self, SignatureError> {
        let matcher = Regex::new(pattern)
            .map_err(|e| SignatureError::BadPattern(sig_name.into(), e))?;
        Ok(Self {
            side,
            offset,
            max_bytes,
            pattern: pattern.into(),
            matcher: Matcher::Regex(matcher),
        })
    }

    pub fn literal(side: Side, offset: usize, max_bytes: usize, pattern: &str) -> Self {
        Self {
            side,
            offset,
            max_bytes,
            pattern: pattern.into(),
            matcher: Matcher::Literal(pattern.as_bytes().to_vec()),
        }
    }

    /// Whether the configured pattern is a regex.
    pub fn is_regex(&self) -> bool {
        matches!(self.matcher, Matcher::Regex(_))
    }

    /// Test the submatcher against one exchange, returning the matched
    /// byte range relative to the exchange start.
    fn test(&self, data: &[u8]) -> Option<(usize, usize)> {
        let start = self.offset.min(data.len());
        let end = start.saturating_add(self.max_bytes).min(data.len());
        let window = &data[start..end];

        match &self.matcher {
            Matcher::Regex(re) => re
                .find(window)
                .map(|m| (start + m.start(), start + m.end())),
            Matcher::Literal(lit) => {
                if lit.is_empty() || lit.len() > window.len() {
                    return None;
                }
                window
                    .windows(lit.len())
                    .position(|w| w == &lit[..])
                    .map(|p| (start + p, start + p + lit.len()))
            }
        }
    }
}

//----------- Signature --------------------------------------------------------

/// A compiled multi-side signature.
#[derive(Clone, Debug)]
pub struct Signature {
    pub name: Box<str>,
    pub category: Box<str>,
    pub severity: u8,
    pub matches: Vec<FlowMatch>,
}

//----------- Sensor -----------------------------------------------------------

/// A group of signatures scanned together.
#[derive(Clone, Debug, Default)]
pub struct Sensor {
    /// The group ordinal.
    pub group: u16,

    pub signatures: Vec<Arc<Signature>>,
}

impl Sensor {
    pub fn new(group: u16, signatures: Vec<Arc<Signature>>) -> Self {
        Self { group, signatures }
    }
}

//----------- SignatureHit -----------------------------------------------------

/// A positive match reported to the session.
#[derive(Clone, Debug)]
pub struct SignatureHit {
    pub signature: Arc<Signature>,

    /// Index of the flow exchange the final submatcher matched in.
    pub chunk: usize,

    /// Matched byte range within that exchange.
    pub range: (usize, usize),
}

//----------- SensorScan -------------------------------------------------------

/// Per-flow scan state over one sensor.
///
/// Rescanning is strictly incremental: the scan remembers how much of the
/// flow it has consumed (`(exchange count, bytes of the last exchange)`)
/// and only the new tail is evaluated on the next call.
#[derive(Debug)]
pub struct SensorScan {
    sensor: Arc<Sensor>,

    /// Progress per signature: index of the next submatcher to satisfy,
    /// the exchange cursor, and the ranges matched so far.
    progress: Vec<SigProgress>,

    last_scanned_chunks: usize,
    last_chunk_bytes: usize,
}

#[derive(Clone, Debug, Default)]
struct SigProgress {
    next_match: usize,
    chunk_cursor: usize,
    fired: bool,
}

impl SensorScan {
    pub fn new(sensor: Arc<Sensor>) -> Self {
        let progress = vec![SigProgress::default(); sensor.signatures.len()];
        Self {
            sensor,
            progress,
            last_scanned_chunks: 0,
            last_chunk_bytes: 0,
        }
    }

    pub fn sensor(&self) -> &Arc<Sensor> {
        &self.sensor
    }

    /// Whether the flow has grown since the last scan.
    fn has_new_data(&self, flow: &Flow) -> bool {
        flow.len() > self.last_scanned_chunks
            || (flow.len() == self.last_scanned_chunks
                && flow
                    .last()
                    .map(|(_, data)| data.len() > self.last_chunk_bytes)
                    .unwrap_or(false))
    }

    /// Scan the flow tail, returning signatures that newly fired.
    pub fn scan(&mut self, flow: &Flow) -> Vec<SignatureHit> {
        if !self.has_new_data(flow) {
            return Vec::new();
        }

        let mut hits = Vec::new();
        let chunks = flow.chunks();

        for (sig_index, signature) in self.sensor.signatures.iter().enumerate() {
            let progress = &mut self.progress[sig_index];
            if progress.fired || signature.matches.is_empty() {
                continue;
            }

            // Advance through unconsumed exchanges.  An exchange of the
            // wrong side is skipped; a failed test on the last (possibly
            // still growing) exchange is retried on the next scan.
            while progress.next_match < signature.matches.len()
                && progress.chunk_cursor < chunks.len()
            {
                let submatch = &signature.matches[progress.next_match];
                let (side, data) = &chunks[progress.chunk_cursor];

                if *side != submatch.side {
                    progress.chunk_cursor += 1;
                    continue;
                }

                match submatch.test(data) {
                    Some(range) => {
                        progress.next_match += 1;
                        if progress.next_match == signature.matches.len() {
                            progress.fired = true;
                            hits.push(SignatureHit {
                                signature: signature.clone(),
                                chunk: progress.chunk_cursor,
                                range,
                            });
                            break;
                        }
                        progress.chunk_cursor += 1;
                    }
                    None => {
                        let is_last = progress.chunk_cursor + 1 == chunks.len();
                        if is_last {
                            // Wait for more data in this exchange.
                            break;
                        }
                        progress.chunk_cursor += 1;
                    }
                }
            }
        }

        self.last_scanned_chunks = flow.len();
        self.last_chunk_bytes = flow.last().map(|(_, d)| d.len()).unwrap_or(0);

        hits
    }
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn smtp_starttls_sensor() -> Arc<Sensor> {
        let sig = Signature {
            name: "smtp/starttls".into(),
            category: "mail".into(),
            severity: 5,
            matches: vec![
                FlowMatch::regex("smtp/starttls", Side::Right, 0, 64, r"^220 ").unwrap(),
                FlowMatch::literal(Side::Left, 0, 64, "STARTTLS"),
            ],
        };
        Arc::new(Sensor::new(SENSOR_STARTTLS, vec![Arc::new(sig)]))
    }

    #[test]
    fn fires_after_both_sides_matched_in_order() {
        let mut scan = SensorScan::new(smtp_starttls_sensor());
        let mut flow = Flow::new();

        flow.append(Side::Right, b"220 mail.test ESMTP ready\r\n");
        assert!(scan.scan(&flow).is_empty());

        flow.append(Side::Left, b"EHLO client\r\n");
        assert!(scan.scan(&flow).is_empty());

        flow.append(Side::Right, b"250 ok\r\n");
        flow.append(Side::Left, b"STARTTLS\r\n");
        let hits = scan.scan(&flow);
        assert_eq!(hits.len(), 1);
        assert_eq!(&*hits[0].signature.name, "smtp/starttls");
    }

    #[test]
    fn fires_at_most_once() {
        let mut scan = SensorScan::new(smtp_starttls_sensor());
        let mut flow = Flow::new();
        flow.append(Side::Right, b"220 hello\r\n");
        flow.append(Side::Left, b"STARTTLS\r\n");

        assert_eq!(scan.scan(&flow).len(), 1);
        flow.append(Side::Right, b"220 go ahead\r\n");
        assert!(scan.scan(&flow).is_empty());
    }

    #[test]
    fn incremental_rescan_sees_grown_chunk() {
        let sig = Signature {
            name: "http/get".into(),
            category: "www".into(),
            severity: 3,
            matches: vec![
                FlowMatch::regex("http/get", Side::Left, 0, 128, r"^(GET|POST) ").unwrap()
            ],
        };
        let sensor = Arc::new(Sensor::new(SENSOR_DETECTION, vec![Arc::new(sig)]));
        let mut scan = SensorScan::new(sensor);
        let mut flow = Flow::new();

        flow.append(Side::Left, b"GE");
        assert!(scan.scan(&flow).is_empty());
        // No new data: nothing rescanned.
        assert!(scan.scan(&flow).is_empty());

        flow.append(Side::Left, b"T / HTTP/1.1\r\n");
        let hits = scan.scan(&flow);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].range.0, 0);
    }

    #[test]
    fn window_bounds_are_respected() {
        let m = FlowMatch::literal(Side::Left, 4, 4, "AB");
        assert_eq!(m.test(b"xxxxAByy"), Some((4, 6)));
        // The literal starts inside the window but ends beyond it.
        assert_eq!(m.test(b"xxxxxxxAB"), None);
        // Before the window.
        assert_eq!(m.test(b"ABxxxxxx"), None);
    }
}
