//! Binary frames exchanged between the evaluation client and a worker.
//!
//! Everything is little-endian and fixed-size. On connect each side sends
//! its 64-bit weights fingerprint; the client closes the socket when they
//! disagree. A request is one byte per input-plane element; a response is
//! the policy vector followed by the pass probability and the winrate.

use sente_core::result::{Netresult, INPUT_CHANNELS, NUM_INTERSECTIONS};

/// Request frame size: one byte per input-plane element.
pub const FEATURE_BYTES: usize = INPUT_CHANNELS * NUM_INTERSECTIONS;

/// Floats in a response frame: policy, then pass, then winrate.
pub const RESPONSE_FLOATS: usize = NUM_INTERSECTIONS + 2;

/// Response frame size in bytes.
pub const RESPONSE_BYTES: usize = RESPONSE_FLOATS * 4;

/// Handshake frame size in bytes.
pub const HANDSHAKE_BYTES: usize = 8;

pub fn encode_response(result: &Netresult) -> Vec<u8> {
    let mut frame = Vec::with_capacity(RESPONSE_BYTES);
    for p in &result.policy {
        frame.extend_from_slice(&p.to_le_bytes());
    }
    frame.extend_from_slice(&result.policy_pass.to_le_bytes());
    frame.extend_from_slice(&result.winrate.to_le_bytes());
    frame
}

pub fn decode_response(frame: &[u8]) -> Netresult {
    debug_assert_eq!(frame.len(), RESPONSE_BYTES);

    let float_at = |index: usize| {
        let start = index * 4;
        f32::from_le_bytes(frame[start..start + 4].try_into().unwrap())
    };

    let mut result = Netresult::default();
    for (i, p) in result.policy.iter_mut().enumerate() {
        *p = float_at(i);
    }
    result.policy_pass = float_at(NUM_INTERSECTIONS);
    result.winrate = float_at(NUM_INTERSECTIONS + 1);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_round_trip() {
        let mut result = Netresult::default();
        let mut rng = fastrand::Rng::with_seed(5);
        for p in result.policy.iter_mut() {
            *p = rng.f32();
        }
        result.policy_pass = 0.03;
        result.winrate = -0.8;

        let frame = encode_response(&result);
        assert_eq!(frame.len(), RESPONSE_BYTES);
        assert_eq!(decode_response(&frame), result);
    }

    #[test]
    fn test_response_tail_layout() {
        let mut result = Netresult::default();
        result.policy_pass = 0.25;
        result.winrate = 0.75;

        let frame = encode_response(&result);

        // The two floats after the policy block are pass, then winrate.
        let pass_bytes = &frame[NUM_INTERSECTIONS * 4..NUM_INTERSECTIONS * 4 + 4];
        let winrate_bytes = &frame[(NUM_INTERSECTIONS + 1) * 4..];
        assert_eq!(pass_bytes, 0.25f32.to_le_bytes());
        assert_eq!(winrate_bytes, 0.75f32.to_le_bytes());
    }
}
