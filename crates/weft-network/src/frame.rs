use thiserror::Error;
use weft_utils::swab32_slice;

/// Length prefix: 32-bit unsigned big-endian.
pub const HEADER_SIZE: usize = size_of::<u32>();

/// Default cap on a single frame body.
pub const DEFAULT_MAX_PAYLOAD: usize = 256 * 1024;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame payload must be non-empty")]
    EmptyPayload,
    #[error("declared frame body {declared} exceeds max {max}")]
    Oversize { declared: usize, max: usize },
}

/// Appends `header || payload` to `out`, header big-endian.
///
/// Zero-length frames are legal on the wire (the decoder treats them as
/// idle padding) but are never produced by this core.
pub fn encode_frame(payload: &[u8], out: &mut Vec<u8>) -> Result<(), FrameError> {
    if payload.is_empty() {
        return Err(FrameError::EmptyPayload);
    }
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    Ok(())
}

/// Stateful per-connection reassembler.
///
/// Fed arbitrary byte chunks, emits complete frame bodies in arrival order.
/// Two states:
///   - Idle (`expected == 0`): collecting the 4-byte header. A header that
///     decodes to 0 is keep-alive padding and is skipped without touching
///     the assembly buffer.
///   - Assembling (`expected > 0`): a frame straddled a chunk boundary;
///     body bytes accumulate in the assembly buffer until `expected`.
///
/// Bytes after a complete frame inside one chunk re-enter Idle, so any
/// split pattern of a valid stream decodes to the same frame sequence.
/// The assembly buffer is retained at the largest size seen rather than
/// freed per frame.
///
/// The framer never touches a socket; read errors belong to the owner.
pub struct Framer {
    max_payload: usize,
    header: [u8; HEADER_SIZE],
    have_header: usize,
    assembly: Vec<u8>,
    expected: usize,
    accumulated: usize,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl Framer {
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload,
            header: [0; HEADER_SIZE],
            have_header: 0,
            assembly: Vec::new(),
            expected: 0,
            accumulated: 0,
        }
    }

    #[inline]
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// True when no partial header or body is pending.
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.expected == 0 && self.have_header == 0
    }

    /// Consumes one received chunk, invoking `on_frame` once per completed
    /// frame body.
    ///
    /// An oversize declaration poisons the stream; the caller must close
    /// the connection (the framer state is left unusable on purpose).
    pub fn push<F>(&mut self, mut chunk: &[u8], mut on_frame: F) -> Result<(), FrameError>
    where
        F: FnMut(&[u8]),
    {
        while !chunk.is_empty() {
            if self.expected == 0 {
                let need = HEADER_SIZE - self.have_header;
                let take = need.min(chunk.len());
                self.header[self.have_header..self.have_header + take]
                    .copy_from_slice(&chunk[..take]);
                self.have_header += take;
                chunk = &chunk[take..];
                if self.have_header < HEADER_SIZE {
                    // Header itself straddled the read.
                    return Ok(());
                }
                self.have_header = 0;
                let declared = swab32_slice(&self.header) as usize;
                if declared == 0 {
                    // Idle padding.
                    continue;
                }
                if declared > self.max_payload {
                    return Err(FrameError::Oversize { declared, max: self.max_payload });
                }
                if chunk.len() >= declared {
                    on_frame(&chunk[..declared]);
                    chunk = &chunk[declared..];
                    continue;
                }
                if self.assembly.len() < declared {
                    self.assembly.resize(declared, 0);
                }
                self.assembly[..chunk.len()].copy_from_slice(chunk);
                self.expected = declared;
                self.accumulated = chunk.len();
                chunk = &[];
            } else {
                let need = self.expected - self.accumulated;
                let take = need.min(chunk.len());
                self.assembly[self.accumulated..self.accumulated + take]
                    .copy_from_slice(&chunk[..take]);
                self.accumulated += take;
                chunk = &chunk[take..];
                if self.accumulated == self.expected {
                    on_frame(&self.assembly[..self.expected]);
                    self.expected = 0;
                    self.accumulated = 0;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(framer: &mut Framer, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        framer.push(chunk, |f| out.push(f.to_vec())).unwrap();
        out
    }

    fn encoded(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        encode_frame(payload, &mut out).unwrap();
        out
    }

    #[test]
    fn encode_layout() {
        assert_eq!(encoded(b"hello"), [0, 0, 0, 5, b'h', b'e', b'l', b'l', b'o']);
        assert!(matches!(encode_frame(&[], &mut Vec::new()), Err(FrameError::EmptyPayload)));
    }

    #[test]
    fn whole_frame_roundtrip() {
        let mut framer = Framer::default();
        let frames = collect(&mut framer, &encoded(b"hello"));
        assert_eq!(frames, vec![b"hello".to_vec()]);
        assert!(framer.is_idle());
    }

    #[test]
    fn every_split_pattern() {
        // One frame delivered byte-at-a-time through all-at-once.
        let payload: Vec<u8> = (0..=255).collect();
        let wire = encoded(&payload);
        for step in 1..=wire.len() {
            let mut framer = Framer::default();
            let mut frames = Vec::new();
            for chunk in wire.chunks(step) {
                framer.push(chunk, |f| frames.push(f.to_vec())).unwrap();
            }
            assert_eq!(frames, vec![payload.clone()], "step {step}");
            assert!(framer.is_idle());
        }
    }

    #[test]
    fn concatenated_frames_in_order() {
        let payloads: Vec<Vec<u8>> = vec![b"a".to_vec(), vec![0xAA; 300], b"zz".to_vec()];
        let mut wire = Vec::new();
        for p in &payloads {
            encode_frame(p, &mut wire).unwrap();
        }
        for step in [1, 2, 3, 7, 100, wire.len()] {
            let mut framer = Framer::default();
            let mut frames = Vec::new();
            for chunk in wire.chunks(step) {
                framer.push(chunk, |f| frames.push(f.to_vec())).unwrap();
            }
            assert_eq!(frames, payloads, "step {step}");
        }
    }

    #[test]
    fn short_input_yields_nothing() {
        let mut framer = Framer::default();
        assert!(collect(&mut framer, &[0, 0, 0]).is_empty());
        assert!(!framer.is_idle());
        // Completing the header to a real length then the body delivers.
        assert!(collect(&mut framer, &[1]).is_empty());
        let frames = collect(&mut framer, b"x");
        assert_eq!(frames, vec![b"x".to_vec()]);
    }

    #[test]
    fn zero_length_header_is_idle() {
        let mut framer = Framer::default();
        assert!(collect(&mut framer, &[0, 0, 0, 0]).is_empty());
        assert!(framer.is_idle());
        assert_eq!(framer.assembly.capacity(), 0);
        // Scenario: idle padding then a real frame in the same stream.
        let frames = collect(&mut framer, &[0, 0, 0, 0, 0, 0, 0, 3, 1, 2, 3]);
        assert_eq!(frames, vec![vec![1, 2, 3]]);
    }

    #[test]
    fn straddled_frame_single_delivery() {
        // 300 bytes of 0xAA split 200/104 over the wire.
        let payload = vec![0xAA; 300];
        let wire = encoded(&payload);
        let mut framer = Framer::default();
        assert!(collect(&mut framer, &wire[..200]).is_empty());
        let frames = collect(&mut framer, &wire[200..]);
        assert_eq!(frames, vec![payload]);
        assert!(framer.is_idle());
    }

    #[test]
    fn residue_after_frame_is_not_discarded() {
        // A complete frame plus the head of the next one in a single read.
        let mut wire = encoded(b"first");
        wire.extend_from_slice(&encoded(b"second")[..6]);
        let mut framer = Framer::default();
        let frames = collect(&mut framer, &wire);
        assert_eq!(frames, vec![b"first".to_vec()]);
        let frames = collect(&mut framer, &encoded(b"second")[6..]);
        assert_eq!(frames, vec![b"second".to_vec()]);
    }

    #[test]
    fn oversize_declaration_rejected() {
        let mut framer = Framer::new(16);
        let err = framer.push(&[0, 0, 0, 17], |_| panic!("no frame")).unwrap_err();
        assert!(matches!(err, FrameError::Oversize { declared: 17, max: 16 }));
    }

    #[test]
    fn assembly_buffer_retained_at_max() {
        let mut framer = Framer::default();
        let big = vec![1u8; 1024];
        let wire = encoded(&big);
        collect(&mut framer, &wire[..512]);
        collect(&mut framer, &wire[512..]);
        let cap_after_big = framer.assembly.len();
        let small = encoded(&[2u8; 8]);
        collect(&mut framer, &small[..6]);
        collect(&mut framer, &small[6..]);
        assert_eq!(framer.assembly.len(), cap_after_big);
    }
}
