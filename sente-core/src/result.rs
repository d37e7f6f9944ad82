/// Board edge length.
pub const BOARD_SIZE: usize = 19;

/// Number of board intersections, i.e. the length of a policy vector.
pub const NUM_INTERSECTIONS: usize = BOARD_SIZE * BOARD_SIZE;

/// Input feature planes per position.
pub const INPUT_CHANNELS: usize = 18;

/// Output of one network evaluation. Immutable once produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Netresult {
    /// Per-intersection move probabilities, each in [0, 1].
    pub policy: [f32; NUM_INTERSECTIONS],

    /// Probability of passing.
    pub policy_pass: f32,

    /// Expected outcome in [-1, 1].
    pub winrate: f32,
}

impl Default for Netresult {
    fn default() -> Self {
        Netresult {
            policy: [0.0; NUM_INTERSECTIONS],
            policy_pass: 0.0,
            winrate: 0.0,
        }
    }
}
