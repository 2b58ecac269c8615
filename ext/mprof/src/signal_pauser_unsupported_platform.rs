use crate::error::{Error, Result};
use crate::thread_control::ThreadControl;
use crate::unwind::RegisterState;

#[derive(Debug, Default)]
pub struct SignalPauser {}

impl SignalPauser {
    pub fn new() -> Self {
        Self {}
    }
}

impl ThreadControl for SignalPauser {
    fn prepare(&mut self) -> Result<()> {
        Err(Error::Unsupported(
            "thread pausing requires Linux or Android on x86_64 or aarch64",
        ))
    }

    fn release(&mut self) {}

    fn with_paused_thread(&mut self, _tid: u32, _inspect: &mut dyn FnMut(RegisterState)) -> bool {
        false
    }
}
