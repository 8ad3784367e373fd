use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A tagged item for the scheduler's generic queue.
///
/// Every handler registered for `kind` sees the same item, so the payload is
/// shared rather than moved.
#[derive(Clone)]
pub struct QueueItem {
    pub kind: String,
    pub posted_at: u64,
    payload: Arc<dyn Any + Send + Sync>,
}

impl QueueItem {
    pub fn new<T: Any + Send + Sync>(kind: impl Into<String>, payload: T) -> Self {
        Self {
            kind: kind.into(),
            posted_at: 0,
            payload: Arc::new(payload),
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }
}

impl fmt::Debug for QueueItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueItem")
            .field("kind", &self.kind)
            .field("posted_at", &self.posted_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downcast_matches_type() {
        let item = QueueItem::new("count", 7u32);
        assert_eq!(item.downcast_ref::<u32>(), Some(&7));
        assert!(item.downcast_ref::<String>().is_none());
    }
}
