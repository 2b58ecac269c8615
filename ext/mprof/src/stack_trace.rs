use crate::binary_image::BinaryImage;

pub const MAX_THREAD_NAME_LEN: usize = 63;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackFrame {
    pub instruction_pointer: u64,
    pub image: BinaryImage,
}

impl StackFrame {
    pub fn new(instruction_pointer: u64) -> Self {
        Self {
            instruction_pointer,
            image: BinaryImage::new(),
        }
    }
}

/// One captured stack of one thread at one tick. Frames are innermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackTrace {
    pub thread_id: u32,
    pub thread_name: Option<String>,
    pub timestamp: u64,
    pub sampling_interval_ns: u64,
    pub frames: Vec<StackFrame>,
}

impl StackTrace {
    /// Frames are preallocated up to `max_depth` so capturing never allocates.
    pub fn new(thread_id: u32, sampling_interval_ns: u64, max_depth: usize) -> Self {
        Self {
            thread_id,
            thread_name: None,
            timestamp: 0,
            sampling_interval_ns,
            frames: Vec::with_capacity(max_depth),
        }
    }

    pub fn frame_count(&self) -> u32 {
        u32::try_from(self.frames.len()).unwrap_or(u32::MAX)
    }

    pub fn set_thread_name(&mut self, name: &str) {
        let mut end = name.len().min(MAX_THREAD_NAME_LEN);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        self.thread_name = Some(name[..end].to_string());
    }

    pub fn instruction_pointers(&self) -> impl Iterator<Item = u64> + '_ {
        self.frames.iter().map(|frame| frame.instruction_pointer)
    }
}
