use std::mem;

use crate::stack_trace::StackTrace;

#[derive(Debug)]
pub struct TraceBuffer {
    capacity: usize,
    traces: Vec<StackTrace>,
}

#[derive(Debug, PartialEq)]
pub enum TraceBufferError {
    Full,
}

impl TraceBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            traces: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, trace: StackTrace) -> Result<(), TraceBufferError> {
        if self.is_full() {
            return Err(TraceBufferError::Full);
        }
        self.traces.push(trace);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.traces.len() >= self.capacity
    }

    /// Takes the buffered traces out in capture order. The buffer holds no
    /// allocation until the batch is recycled.
    pub fn take(&mut self) -> Vec<StackTrace> {
        mem::take(&mut self.traces)
    }

    pub fn recycle(&mut self, mut batch: Vec<StackTrace>) {
        if self.traces.is_empty() {
            batch.clear();
            self.traces = batch;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_buffer() {
        let mut buffer = TraceBuffer::new(2);
        assert!(buffer.is_empty());

        buffer.push(StackTrace::new(1, 10, 0)).unwrap();
        buffer.push(StackTrace::new(2, 10, 0)).unwrap();
        assert!(buffer.is_full());

        let batch = buffer.take();
        assert_eq!(batch.iter().map(|t| t.thread_id).collect::<Vec<_>>(), vec![1, 2]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_trace_buffer_full() {
        let mut buffer = TraceBuffer::new(1);
        buffer.push(StackTrace::new(1, 10, 0)).unwrap();
        assert_eq!(
            buffer.push(StackTrace::new(2, 10, 0)),
            Err(TraceBufferError::Full)
        );
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_trace_buffer_recycle() {
        let mut buffer = TraceBuffer::new(2);
        buffer.push(StackTrace::new(1, 10, 0)).unwrap();
        let batch = buffer.take();
        buffer.recycle(batch);
        assert!(buffer.is_empty());
        buffer.push(StackTrace::new(3, 10, 0)).unwrap();
        assert_eq!(buffer.take()[0].thread_id, 3);
    }

    #[test]
    fn test_trace_buffer_reuses_allocation() {
        let mut buffer = TraceBuffer::new(4);
        buffer.push(StackTrace::new(1, 10, 0)).unwrap();
        let batch = buffer.take();
        let allocation = batch.as_ptr();
        assert!(batch.capacity() >= 4);
        assert_eq!(buffer.traces.capacity(), 0);

        buffer.recycle(batch);
        assert_eq!(buffer.traces.as_ptr(), allocation);
        assert!(buffer.traces.capacity() >= 4);
    }
}
