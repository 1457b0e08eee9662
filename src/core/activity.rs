use std::collections::VecDeque;

/// Bounded, timestamped log of human-readable controller events.
#[derive(Debug, Clone)]
pub struct ActivityLog {
    entries: VecDeque<String>,
    capacity: usize,
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new(400)
    }
}

impl ActivityLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append `message` as `[HH:MM:SS] message`, dropping the oldest entry
    /// once full.
    pub fn push(&mut self, message: impl AsRef<str>) {
        let stamp = chrono::Local::now().format("%H:%M:%S");
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries
            .push_back(format!("[{stamp}] {}", message.as_ref()));
    }

    /// The last `n` entries, newest first.
    pub fn recent(&self, n: usize) -> Vec<String> {
        self.entries.iter().rev().take(n).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_formats_timestamp() {
        let mut log = ActivityLog::default();
        log.push("hello");
        let entry = &log.recent(1)[0];
        // "[HH:MM:SS] hello"
        assert_eq!(entry.len(), "[00:00:00] hello".len());
        assert!(entry.starts_with('[') && entry.ends_with("] hello"));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut log = ActivityLog::new(3);
        for i in 0..5 {
            log.push(format!("event {i}"));
        }
        let recent = log.recent(10);
        assert_eq!(recent.len(), 3);
        assert!(recent[0].ends_with("event 4"));
        assert!(recent[2].ends_with("event 2"));
    }

    #[test]
    fn test_recent_returns_tail() {
        let mut log = ActivityLog::new(10);
        for i in 0..5 {
            log.push(format!("event {i}"));
        }
        let recent = log.recent(2);
        assert_eq!(recent.len(), 2);
        assert!(recent[0].ends_with("event 4"));
        assert!(recent[1].ends_with("event 3"));
        assert!(ActivityLog::new(4).recent(2).is_empty());
    }
}
