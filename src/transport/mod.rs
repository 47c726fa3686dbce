pub mod catalog;
pub mod channel;
pub mod engine;
pub mod message;
pub mod meta;
pub mod net;
pub mod op;
pub mod queue;
pub mod transporter;

use num_enum::TryFromPrimitive;
use strum::EnumIter;

/// Depth of the kernel/proxy staging FIFOs. Power of two.
pub const NUM_BUFFER_SLOTS: usize = 8;

/// Steps partitioning a per-local-rank shared staging arena per channel.
pub const NUM_SHARED_SLOTS: usize = 16;

pub const NUM_PROTOCOLS: usize = 3;

/// Wire protocols, trading flag overhead for latency. LL and LL128 interleave
/// per-step flags with the payload; SIMPLE signals through the FIFO records
/// alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, TryFromPrimitive)]
#[repr(usize)]
pub enum Protocol {
    Ll = 0,
    Ll128 = 1,
    Simple = 2,
}

/// One LL fifo line: 2x (4B data, 4B flag).
pub const LL_FIFO_LINE_SIZE: usize = 16;

/// LL128 lines are 128 bytes of 16 u64 elements, the last of which carries
/// the per-step flag when the line sits in system memory.
pub const LL128_LINE_SIZE: usize = 128;
pub const LL128_LINE_ELEMS: usize = LL128_LINE_SIZE / std::mem::size_of::<u64>();
pub const LL128_DATA_ELEMS: usize = LL128_LINE_ELEMS - 1;

/// The flag value the kernel writes for step `step`. Non-zero and distinct
/// for consecutive steps occupying the same slot, so stale lines are never
/// mistaken for fresh ones.
#[inline]
pub fn ll_flag(step: u64) -> u32 {
    step as u32
}

pub const DEFAULT_BUFFER_SIZES: [usize; NUM_PROTOCOLS] = [1 << 19, 1 << 20, 1 << 22];

pub const DEFAULT_P2P_CHUNK_SIZE: usize = 1 << 17;
