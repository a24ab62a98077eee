//! Hinted Handoff Module
//!
//! A replica write that cannot be delivered is not lost: it is recorded as a
//! hint addressed to the unreachable node, held in memory and appended to a
//! per-target file on disk. Once the heartbeat observes the peer again, the
//! coordinator replays its hints with their original versions, letting LWW
//! discard any that have since been superseded.

pub mod hints;

pub use hints::{Hint, HintStore};

#[cfg(test)]
mod tests;
