//! Bounded in-memory ring of recent sandbox stderr lines.
//!
//! Not durable. One ring per session, shared between the channel's stderr
//! pump and the debug endpoint.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

/// Default number of lines retained per session.
pub const DEFAULT_CAPACITY: usize = 500;

#[derive(Clone)]
pub struct LogRing {
    inner: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(64)))),
            capacity,
        }
    }

    /// Append a line, evicting the oldest when full.
    pub fn push(&self, line: String) {
        let mut buf = self.inner.lock();
        if buf.len() == self.capacity {
            buf.pop_front();
        }
        buf.push_back(line);
    }

    /// Snapshot of the current contents, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        self.inner.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl Default for LogRing {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_when_full() {
        let ring = LogRing::new(3);
        for i in 0..5 {
            ring.push(format!("line {i}"));
        }
        assert_eq!(
            ring.snapshot(),
            vec!["line 2".to_string(), "line 3".into(), "line 4".into()]
        );
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn snapshot_is_a_copy() {
        let ring = LogRing::new(3);
        ring.push("a".into());
        let snap = ring.snapshot();
        ring.push("b".into());
        assert_eq!(snap, vec!["a".to_string()]);
        assert_eq!(ring.len(), 2);
    }
}
