//! Size Negotiation
//!
//! The DRBD metadata formula and the per-layer usable/allocated size rules.

pub mod drbd_md;
pub mod negotiator;

pub use drbd_md::{MdLayout, MdSizeMode};
pub use negotiator::SizeNegotiator;
