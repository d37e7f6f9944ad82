//! Variable-length entropy code for policy vectors.
//!
//! Each policy element is quantized to 1/2048 precision and the quantized
//! vector is written as a stream of symbols from three classes:
//!
//! - `V0..V63`: literal low six bits of a quantized element
//! - `Z0..Z15`: a run of `k + 2` consecutive zeros
//! - `X0..X31`: extension of the preceding symbol; after a `V` it adds
//!   `64 * (k + 1)` to the previous value, after a `Z` it appends
//!   `16 * (k + 1)` more zeros, anywhere else it is a decode error

use crate::result::{Netresult, NUM_INTERSECTIONS};
use sente_util::bitstream::BitStream;
use thiserror::Error;

/// Quantization denominator. Policy values are stored as
/// `floor(p * 2048)` in [0, 2047] (2048 for an exact 1.0).
pub const QUANT_LEVELS: u32 = 2048;

const V_BASE: usize = 0;
const Z_BASE: usize = 64;
const X_BASE: usize = 80;

struct EncodeRow {
    /// Code bits identifying the row.
    code: u64,

    /// Bit width of `code`.
    width: usize,

    /// Number of symbols sharing this row; always a power of two.
    count: usize,
}

const ENCODE_TABLE: [EncodeRow; 18] = [
    EncodeRow { code: 0x4, width: 4, count: 1 },   // V0
    EncodeRow { code: 0x0, width: 3, count: 1 },   // V1
    EncodeRow { code: 0xC, width: 4, count: 2 },   // V2..V3
    EncodeRow { code: 0x2, width: 4, count: 4 },   // V4..V7
    EncodeRow { code: 0xA, width: 4, count: 8 },   // V8..V15
    EncodeRow { code: 0x6, width: 4, count: 16 },  // V16..V31
    EncodeRow { code: 0xE, width: 4, count: 32 },  // V32..V63
    EncodeRow { code: 0x1, width: 4, count: 1 },   // Z0
    EncodeRow { code: 0x9, width: 4, count: 1 },   // Z1
    EncodeRow { code: 0x5, width: 4, count: 2 },   // Z2..Z3
    EncodeRow { code: 0xD, width: 4, count: 4 },   // Z4..Z7
    EncodeRow { code: 0x3, width: 4, count: 8 },   // Z8..Z15
    EncodeRow { code: 0xB, width: 4, count: 1 },   // X0
    EncodeRow { code: 0x7, width: 5, count: 1 },   // X1
    EncodeRow { code: 0x17, width: 5, count: 2 },  // X2..X3
    EncodeRow { code: 0xF, width: 5, count: 4 },   // X4..X7
    EncodeRow { code: 0x1F, width: 6, count: 8 },  // X8..X15
    EncodeRow { code: 0x3F, width: 6, count: 16 }, // X16..X31
];

/// Longest `width + log2(count)` in the table; a decoder peeks this many
/// bits and always finds a matching row.
const LOOKAHEAD_BITS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Decoded positions overran the board.
    #[error("decoded policy overruns the board")]
    Overflow,

    /// Extension symbol without a preceding value or zero run.
    #[error("extension symbol follows nothing extendable")]
    StrayExtension,

    /// The bit cursor did not land within the byte-rounding margin of the
    /// stream size.
    #[error("decoded bit count disagrees with the stream size")]
    SizeMismatch,
}

fn quantize(p: f32) -> usize {
    (p * QUANT_LEVELS as f32) as usize
}

fn low_mask(width: usize) -> u64 {
    (1u64 << width) - 1
}

fn push_symbol(stream: &mut BitStream, symbol: usize) {
    let mut base = 0;
    for row in &ENCODE_TABLE {
        if symbol < base + row.count {
            let index = (symbol - base) as u64;
            let bits = row.code | (index << row.width);
            stream.push_bits(row.width + row.count.trailing_zeros() as usize, bits);
            return;
        }
        base += row.count;
    }
    unreachable!("symbol {symbol} outside the encode table");
}

/// Returns the decoded symbol and the number of bits it consumed.
fn read_symbol(stream: &BitStream, cursor: usize) -> (usize, usize) {
    let lookahead = stream.read_bits(cursor, LOOKAHEAD_BITS);
    let mut base = 0;
    for row in &ENCODE_TABLE {
        if lookahead & low_mask(row.width) == row.code {
            let symbol = base + ((lookahead >> row.width) as usize % row.count);
            return (symbol, row.width + row.count.trailing_zeros() as usize);
        }
        base += row.count;
    }
    unreachable!("the prefix table covers every bit pattern");
}

#[derive(Clone, Copy, PartialEq)]
enum PrevSymbol {
    None,
    Value,
    ZeroRun,
}

/// A `Netresult` with the policy vector in coded form. The pass and
/// winrate floats are kept verbatim; the policy loses at most the
/// quantization step.
#[derive(Debug, Clone)]
pub struct CompressedEntry {
    pub policy_pass: f32,
    pub winrate: f32,
    pub compressed_policy: BitStream,
}

impl CompressedEntry {
    pub fn from_netresult(result: &Netresult) -> Self {
        let mut stream = BitStream::new();

        let mut pos = 0;
        while pos < NUM_INTERSECTIONS {
            let q = quantize(result.policy[pos]);
            if q == 0 {
                let mut run = 0;
                while pos < NUM_INTERSECTIONS && quantize(result.policy[pos]) == 0 {
                    pos += 1;
                    run += 1;
                }
                if run == 1 {
                    push_symbol(&mut stream, V_BASE);
                } else {
                    let bias = (run - 2) / 16;
                    let offset = (run - 2) % 16;
                    push_symbol(&mut stream, Z_BASE + offset);
                    if bias != 0 {
                        push_symbol(&mut stream, X_BASE + bias - 1);
                    }
                }
            } else {
                push_symbol(&mut stream, V_BASE + q % 64);
                let bias = q / 64;
                if bias != 0 {
                    push_symbol(&mut stream, X_BASE + bias - 1);
                }
                pos += 1;
            }
        }

        CompressedEntry {
            policy_pass: result.policy_pass,
            winrate: result.winrate,
            compressed_policy: stream,
        }
    }

    /// Rebuild an entry from its serialized policy bytes.
    pub fn from_parts(policy_pass: f32, winrate: f32, policy_bytes: &[u8]) -> Self {
        let mut stream = BitStream::new();
        stream.expand(policy_bytes.len() * 8);
        for &byte in policy_bytes {
            stream.push_bits(8, byte as u64);
        }

        CompressedEntry {
            policy_pass,
            winrate,
            compressed_policy: stream,
        }
    }

    /// Length of the policy stream when rounded up to whole bytes.
    pub fn serialized_len(&self) -> usize {
        self.compressed_policy.size().div_ceil(8)
    }

    /// The policy stream as bytes; a trailing partial byte is zero-padded.
    pub fn policy_bytes(&self) -> Vec<u8> {
        (0..self.compressed_policy.size())
            .step_by(8)
            .map(|bit| self.compressed_policy.read_bits(bit, 8) as u8)
            .collect()
    }

    /// Check that the stream decodes to a full policy vector without
    /// materializing the result.
    pub fn validate(&self) -> Result<(), CodecError> {
        self.decode().map(|_| ())
    }

    pub fn decode(&self) -> Result<Netresult, CodecError> {
        let mut result = Netresult::default();

        let mut cursor = 0;
        let mut pos = 0;
        let mut prev = PrevSymbol::None;

        while pos < NUM_INTERSECTIONS {
            let (symbol, consumed) = read_symbol(&self.compressed_policy, cursor);
            cursor += consumed;

            if symbol < Z_BASE {
                result.policy[pos] = symbol as f32 / QUANT_LEVELS as f32;
                pos += 1;
                prev = PrevSymbol::Value;
            } else if symbol < X_BASE {
                let run = symbol - Z_BASE + 2;
                if pos + run > NUM_INTERSECTIONS {
                    return Err(CodecError::Overflow);
                }
                pos += run;
                prev = PrevSymbol::ZeroRun;
            } else {
                let bias = symbol - X_BASE + 1;
                match prev {
                    PrevSymbol::Value => {
                        result.policy[pos - 1] += bias as f32 * 64.0 / QUANT_LEVELS as f32;
                    }
                    PrevSymbol::ZeroRun => {
                        if pos + bias * 16 > NUM_INTERSECTIONS {
                            return Err(CodecError::Overflow);
                        }
                        pos += bias * 16;
                    }
                    PrevSymbol::None => return Err(CodecError::StrayExtension),
                }
                prev = PrevSymbol::None;
            }
        }

        // Serialization rounds the stream to whole bytes, so the cursor may
        // stop up to 8 bits short of the recorded size.
        let size = self.compressed_policy.size();
        if cursor > size || cursor + 8 < size {
            return Err(CodecError::SizeMismatch);
        }

        result.policy_pass = self.policy_pass;
        result.winrate = self.winrate;
        Ok(result)
    }
}
