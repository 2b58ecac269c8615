//! Frame-pointer stack walking.
//!
//! Each frame record is two words: `[fp]` holds the caller's frame pointer and
//! `[fp + 8]` the return address. This layout is shared by x86_64 (rbp) and
//! aarch64 (x29).

use crate::binary_image::is_valid_userspace_addr;
use crate::safe_read::MemoryReader;
use crate::stack_trace::StackFrame;

/// Registers captured from a paused thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterState {
    pub pc: u64,
    pub fp: u64,
}

pub fn is_valid_frame_pointer(fp: u64) -> bool {
    fp & 0x7 == 0 && is_valid_userspace_addr(fp)
}

/// Walks the frame-pointer chain starting at `regs`, appending at most
/// `max_depth` frames (minus any already present) to `frames`.
///
/// Never allocates as long as `frames` has enough spare capacity, so it can run
/// while another thread is paused holding the allocator lock. An unreadable
/// frame record ends the walk; the frames gathered so far are kept.
pub fn walk_frame_pointers<R: MemoryReader>(
    reader: &R,
    regs: RegisterState,
    max_depth: usize,
    frames: &mut Vec<StackFrame>,
) {
    let mut pc = regs.pc;
    let mut fp = regs.fp;

    while frames.len() < max_depth && pc != 0 {
        frames.push(StackFrame::new(pc));

        if !is_valid_frame_pointer(fp) {
            break;
        }
        let Some(next_fp) = reader.read_u64(fp) else {
            break;
        };
        let Some(return_address) = reader.read_u64(fp + 8) else {
            break;
        };
        if !is_valid_userspace_addr(return_address) {
            break;
        }
        // The stack grows down, so callers' records sit at higher addresses.
        if next_fp != 0 && next_fp <= fp {
            break;
        }

        pc = return_address;
        fp = next_fp;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safe_read::SafeMemoryReader;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeStack {
        words: HashMap<u64, u64>,
    }

    impl FakeStack {
        // Lays out `depth` chained frame records starting at `base`, returning
        // the innermost frame pointer.
        fn chain(base: u64, depth: usize) -> (Self, u64) {
            let mut stack = Self::default();
            for i in 0..depth as u64 {
                let fp = base + i * 0x40;
                let next = if i + 1 == depth as u64 { 0 } else { fp + 0x40 };
                stack.words.insert(fp, next);
                stack.words.insert(fp + 8, 0x40_0000 + (i + 1) * 0x10);
            }
            (stack, base)
        }
    }

    impl MemoryReader for FakeStack {
        fn read_bytes(&self, addr: u64, dst: &mut [u8]) -> bool {
            if dst.len() != 8 {
                return false;
            }
            match self.words.get(&addr) {
                Some(word) => {
                    dst.copy_from_slice(&word.to_ne_bytes());
                    true
                }
                None => false,
            }
        }
    }

    fn walk<R: MemoryReader>(reader: &R, regs: RegisterState, max_depth: usize) -> Vec<u64> {
        let mut frames = Vec::with_capacity(max_depth);
        walk_frame_pointers(reader, regs, max_depth, &mut frames);
        frames.iter().map(|f| f.instruction_pointer).collect()
    }

    #[test]
    fn test_walks_full_chain() {
        let (stack, fp) = FakeStack::chain(0x7000_0000, 5);
        let pcs = walk(&stack, RegisterState { pc: 0x40_0000, fp }, 128);
        assert_eq!(
            pcs,
            vec![0x40_0000, 0x40_0010, 0x40_0020, 0x40_0030, 0x40_0040, 0x40_0050]
        );
    }

    #[test]
    fn test_respects_max_depth() {
        let (stack, fp) = FakeStack::chain(0x7000_0000, 300);
        for depth in [1, 2, 64, 128] {
            let pcs = walk(&stack, RegisterState { pc: 0x40_0000, fp }, depth);
            assert_eq!(pcs.len(), depth);
        }
    }

    #[test]
    fn test_unreadable_record_truncates() {
        let (mut stack, fp) = FakeStack::chain(0x7000_0000, 10);
        stack.words.remove(&(0x7000_0000 + 3 * 0x40 + 8));
        let pcs = walk(&stack, RegisterState { pc: 0x40_0000, fp }, 128);
        assert_eq!(pcs.len(), 4);
    }

    #[test]
    fn test_rejects_misaligned_and_bogus_frame_pointers() {
        let (stack, _) = FakeStack::chain(0x7000_0000, 3);
        assert_eq!(walk(&stack, RegisterState { pc: 0x40_0000, fp: 0x7000_0004 }, 8).len(), 1);
        assert_eq!(walk(&stack, RegisterState { pc: 0x40_0000, fp: 0 }, 8).len(), 1);
        assert_eq!(walk(&stack, RegisterState { pc: 0, fp: 0x7000_0000 }, 8).len(), 0);
    }

    #[test]
    fn test_stops_on_cycle() {
        let mut stack = FakeStack::default();
        stack.words.insert(0x7000_0040, 0x7000_0000);
        stack.words.insert(0x7000_0048, 0x40_1000);
        stack.words.insert(0x7000_0000, 0x7000_0040);
        stack.words.insert(0x7000_0008, 0x40_2000);
        let pcs = walk(&stack, RegisterState { pc: 0x40_0000, fp: 0x7000_0040 }, 128);
        assert_eq!(pcs, vec![0x40_0000]);
    }

    #[test]
    fn test_walks_real_memory() {
        // Frame records in heap memory, linked in ascending address order.
        let depth = 200usize;
        let mut records = vec![0u64; depth * 2];
        let base = records.as_ptr() as u64;
        for i in 0..depth {
            let next = if i + 1 == depth { 0 } else { base + ((i + 1) * 16) as u64 };
            records[i * 2] = next;
            records[i * 2 + 1] = 0x40_0000 + i as u64;
        }

        let regs = RegisterState { pc: 0x50_0000, fp: base };
        let pcs = walk(&SafeMemoryReader, regs, 128);
        assert_eq!(pcs.len(), 128);
        assert_eq!(pcs[0], 0x50_0000);
        assert_eq!(pcs[1], 0x40_0000);

        let pcs = walk(&SafeMemoryReader, regs, 512);
        assert_eq!(pcs.len(), depth + 1);
    }
}
