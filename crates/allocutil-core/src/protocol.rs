//! Replay wire protocol.
//!
//! The driver and the serving subprocess exchange fixed-size records over a
//! byte stream, strictly one request then one response:
//!
//! ```text
//! request  = kind:u32 | pad to pointer width | new_size:usize | old_address:usize
//! response = address:usize
//! ```
//!
//! All fields use native width and endianness; both ends run on the same
//! host. Fields that do not apply to a request kind are sent as zero and
//! ignored by the receiver. The serving side stops on end-of-input, so no
//! operation count is exchanged.

use std::io::{ErrorKind, Read, Write};
use std::mem::size_of;

use thiserror::Error;

use crate::trace::{Address, LiveBlock, OpKind, Trace, TraceOperation};

const WORD: usize = size_of::<usize>();
/// The kind field is a `u32` padded out to pointer alignment.
const KIND_FIELD: usize = if WORD > 4 { WORD } else { 4 };

/// Encoded request size in bytes.
pub const REQUEST_SIZE: usize = KIND_FIELD + 2 * WORD;
/// Encoded response size in bytes.
pub const RESPONSE_SIZE: usize = WORD;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("protocol i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("stream closed before the response to operation {op_index}")]
    UnexpectedEof { op_index: usize },
    #[error("stream closed mid-record after {got} of {expected} bytes")]
    Truncated { got: usize, expected: usize },
    #[error("allocator returned null for {kind:?} of {size} bytes (operation {op_index}, line {line})")]
    NullAddress {
        kind: OpKind,
        size: usize,
        op_index: usize,
        line: usize,
    },
    #[error("unknown request kind {0}")]
    UnknownKind(u32),
}

impl ProtocolError {
    /// Index of the trace operation being replayed when this happened, if known.
    #[must_use]
    pub fn op_index(&self) -> Option<usize> {
        match self {
            Self::UnexpectedEof { op_index } | Self::NullAddress { op_index, .. } => Some(*op_index),
            _ => None,
        }
    }
}

/// Request discriminant as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RequestKind {
    Allocate = 0,
    Free = 1,
    Reallocate = 2,
}

impl TryFrom<u32> for RequestKind {
    type Error = ProtocolError;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(Self::Allocate),
            1 => Ok(Self::Free),
            2 => Ok(Self::Reallocate),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayRequest {
    pub kind: RequestKind,
    pub new_size: usize,
    pub old_address: Address,
}

impl ReplayRequest {
    #[must_use]
    pub const fn allocate(size: usize) -> Self {
        Self {
            kind: RequestKind::Allocate,
            new_size: size,
            old_address: Address::NULL,
        }
    }

    #[must_use]
    pub const fn reallocate(old: Address, size: usize) -> Self {
        Self {
            kind: RequestKind::Reallocate,
            new_size: size,
            old_address: old,
        }
    }

    #[must_use]
    pub const fn free(address: Address) -> Self {
        Self {
            kind: RequestKind::Free,
            new_size: 0,
            old_address: address,
        }
    }

    #[must_use]
    pub fn encode(&self) -> [u8; REQUEST_SIZE] {
        let mut buf = [0u8; REQUEST_SIZE];
        buf[..4].copy_from_slice(&(self.kind as u32).to_ne_bytes());
        buf[KIND_FIELD..KIND_FIELD + WORD].copy_from_slice(&self.new_size.to_ne_bytes());
        buf[KIND_FIELD + WORD..].copy_from_slice(&self.old_address.raw().to_ne_bytes());
        buf
    }

    pub fn decode(buf: &[u8; REQUEST_SIZE]) -> Result<Self, ProtocolError> {
        let kind = RequestKind::try_from(u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]))?;
        Ok(Self {
            kind,
            new_size: read_word(&buf[KIND_FIELD..KIND_FIELD + WORD]),
            old_address: Address::from_raw(read_word(&buf[KIND_FIELD + WORD..])),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayResponse {
    pub address: Address,
}

impl ReplayResponse {
    #[must_use]
    pub fn encode(&self) -> [u8; RESPONSE_SIZE] {
        self.address.raw().to_ne_bytes()
    }

    #[must_use]
    pub fn decode(buf: &[u8; RESPONSE_SIZE]) -> Self {
        Self {
            address: Address::from_raw(usize::from_ne_bytes(*buf)),
        }
    }
}

fn read_word(bytes: &[u8]) -> usize {
    let mut word = [0u8; WORD];
    word.copy_from_slice(bytes);
    usize::from_ne_bytes(word)
}

/// Read one fixed-size record.
///
/// Returns `Ok(None)` on a clean end-of-input at a record boundary.
pub fn read_record<R: Read, const N: usize>(reader: &mut R) -> Result<Option<[u8; N]>, ProtocolError> {
    let mut buf = [0u8; N];
    let mut filled = 0;
    while filled < N {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(ProtocolError::Truncated {
                    got: filled,
                    expected: N,
                });
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Some(buf))
}

// ---------------------------------------------------------------------------
// Serving side
// ---------------------------------------------------------------------------

/// The allocator under test, as seen by the serving loop.
pub trait ReplayAllocator {
    /// Fresh allocation; the null token on failure.
    fn allocate(&mut self, size: usize) -> Address;
    /// Resize `old`, possibly moving it. A zero size frees the block.
    fn reallocate(&mut self, old: Address, size: usize) -> Address;
    fn free(&mut self, address: Address);
}

/// Serve requests in arrival order until the peer closes the stream.
///
/// Returns the number of requests answered.
pub fn serve<S, A>(stream: &mut S, allocator: &mut A) -> Result<u64, ProtocolError>
where
    S: Read + Write,
    A: ReplayAllocator + ?Sized,
{
    let mut served = 0u64;
    while let Some(buf) = read_record::<_, REQUEST_SIZE>(stream)? {
        let req = ReplayRequest::decode(&buf)?;
        let address = match req.kind {
            RequestKind::Allocate => allocator.allocate(req.new_size),
            RequestKind::Reallocate => allocator.reallocate(req.old_address, req.new_size),
            RequestKind::Free => {
                allocator.free(req.old_address);
                Address::NULL
            }
        };
        stream.write_all(&ReplayResponse { address }.encode())?;
        stream.flush()?;
        served += 1;
    }
    Ok(served)
}

// ---------------------------------------------------------------------------
// Driving side
// ---------------------------------------------------------------------------

/// What the driver did for one operation; handed to the step observer.
#[derive(Debug, Clone, Copy)]
pub struct ReplayStep {
    pub op_index: usize,
    pub op: TraceOperation,
    /// Address answered by the subprocess, `None` when nothing was sent.
    pub address: Option<Address>,
    pub live_bytes: usize,
}

/// Live-byte accounting result of one replay.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayOutcome {
    pub peak_live_bytes: usize,
    pub final_live_bytes: usize,
    pub requests_sent: u64,
}

fn exchange<S: Read + Write>(
    stream: &mut S,
    req: ReplayRequest,
    op_index: usize,
) -> Result<Address, ProtocolError> {
    stream.write_all(&req.encode())?;
    stream.flush()?;
    let buf = read_record::<_, RESPONSE_SIZE>(stream)?
        .ok_or(ProtocolError::UnexpectedEof { op_index })?;
    Ok(ReplayResponse::decode(&buf).address)
}

/// Drive every operation of `trace` over `stream`, tracking live bytes.
///
/// The trace's live tables are reset first. The reallocation delta uses the
/// size recorded here, never anything reported by the subprocess.
pub fn replay<S, F>(
    trace: &mut Trace,
    stream: &mut S,
    mut on_step: F,
) -> Result<ReplayOutcome, ProtocolError>
where
    S: Read + Write,
    F: FnMut(&ReplayStep),
{
    trace.reset();
    let mut out = ReplayOutcome::default();
    let mut live = 0usize;

    for op_index in 0..trace.operations().len() {
        let op = trace.operations()[op_index];
        let null_result = |size: usize| ProtocolError::NullAddress {
            kind: op.kind,
            size,
            op_index,
            line: op.line,
        };

        let address = match (op.kind, op.slot()) {
            (OpKind::Free, None) => None,
            (OpKind::Free, Some(slot)) => {
                let block = trace.live_block(slot).unwrap_or_default();
                let sent = if block.address.is_null() {
                    None
                } else {
                    out.requests_sent += 1;
                    Some(exchange(stream, ReplayRequest::free(block.address), op_index)?)
                };
                live = live.saturating_sub(block.size);
                if let Some(entry) = trace.live_mut(slot) {
                    *entry = LiveBlock::default();
                }
                sent
            }
            (OpKind::Allocate, Some(slot)) => {
                let address = exchange(stream, ReplayRequest::allocate(op.size), op_index)?;
                out.requests_sent += 1;
                if address.is_null() && op.size != 0 {
                    return Err(null_result(op.size));
                }
                if let Some(entry) = trace.live_mut(slot) {
                    *entry = LiveBlock {
                        address,
                        size: op.size,
                    };
                }
                live = live.saturating_add(op.size);
                Some(address)
            }
            (OpKind::Reallocate, Some(slot)) => {
                let old = trace.live_block(slot).unwrap_or_default();
                let address = exchange(
                    stream,
                    ReplayRequest::reallocate(old.address, op.size),
                    op_index,
                )?;
                out.requests_sent += 1;
                if address.is_null() && op.size != 0 {
                    return Err(null_result(op.size));
                }
                if let Some(entry) = trace.live_mut(slot) {
                    *entry = LiveBlock {
                        address,
                        size: op.size,
                    };
                }
                live = live.saturating_sub(old.size).saturating_add(op.size);
                Some(address)
            }
            // The loader never produces these; treat them as no-ops.
            (OpKind::Allocate | OpKind::Reallocate, None) => None,
        };

        out.peak_live_bytes = out.peak_live_bytes.max(live);
        on_step(&ReplayStep {
            op_index,
            op,
            address,
            live_bytes: live,
        });
    }

    out.final_live_bytes = live;
    Ok(out)
}
