use std::ffi::c_void;

use super::NUM_BUFFER_SLOTS;

const CACHE_LINE_SIZE: usize = 128;

/// Consumer-side FIFO record: the proxy (on send) or the kernel (on recv)
/// publishes `head`, the count of steps released back to the producer.
#[repr(C, align(4096))]
pub struct SendBufMeta {
    pub head: u64,
    _pad1: [u8; CACHE_LINE_SIZE - std::mem::size_of::<u64>()],
    _ptr_exchange: *mut c_void,
    _reduce_op_arg_exchange: [u64; 2],
    _pad2:
        [u8; CACHE_LINE_SIZE - std::mem::size_of::<*mut c_void>() - 2 * std::mem::size_of::<u64>()],
    _slots_offsets: [i32; NUM_BUFFER_SLOTS],
}

static_assertions::const_assert_eq!(std::mem::size_of::<SendBufMeta>(), 4096);

impl SendBufMeta {
    pub fn new() -> Self {
        SendBufMeta {
            head: 0,
            _pad1: [0; CACHE_LINE_SIZE - std::mem::size_of::<u64>()],
            _ptr_exchange: std::ptr::null_mut(),
            _reduce_op_arg_exchange: [0; 2],
            _pad2: [0; CACHE_LINE_SIZE
                - std::mem::size_of::<*mut c_void>()
                - 2 * std::mem::size_of::<u64>()],
            _slots_offsets: [0; NUM_BUFFER_SLOTS],
        }
    }
}

impl Default for SendBufMeta {
    fn default() -> Self {
        Self::new()
    }
}

/// Producer-side FIFO record. `tail` counts steps handed over; a slot's
/// `slots_sizes` entry carries the byte count placed there (`-1` = empty or
/// consumed); `slots_offsets` carries the byte offset inside a shared arena
/// when buffer fusion is active.
#[repr(C, align(4096))]
pub struct RecvBufMeta {
    pub tail: u64,
    _pad1: [u8; CACHE_LINE_SIZE - std::mem::size_of::<u64>()],
    pub slots_sizes: [i32; NUM_BUFFER_SLOTS],
    pub slots_offsets: [i32; NUM_BUFFER_SLOTS],
    _flush: i32,
}

static_assertions::const_assert_eq!(std::mem::size_of::<RecvBufMeta>(), 4096);

impl RecvBufMeta {
    pub fn new() -> Self {
        RecvBufMeta {
            tail: 0,
            _pad1: [0; CACHE_LINE_SIZE - std::mem::size_of::<u64>()],
            slots_sizes: [0; NUM_BUFFER_SLOTS],
            slots_offsets: [0; NUM_BUFFER_SLOTS],
            _flush: 0,
        }
    }
}

impl Default for RecvBufMeta {
    fn default() -> Self {
        Self::new()
    }
}
