use uuid::Uuid;

/// Proposes identifiers for new entities.
///
/// The store still verifies that a proposal was never issued before, so an
/// allocator only has to be "probably unique".
pub trait IdAllocator: Send + Sync {
    fn allocate(&mut self, kind: &str) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UuidAllocator;

impl IdAllocator for UuidAllocator {
    fn allocate(&mut self, _kind: &str) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Monotonic `prefix-000001` style ids. Handy for readable fixtures.
#[derive(Debug, Clone)]
pub struct SequentialAllocator {
    prefix: String,
    next: u64,
}

impl SequentialAllocator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: 1,
        }
    }
}

impl IdAllocator for SequentialAllocator {
    fn allocate(&mut self, _kind: &str) -> String {
        let id = format!("{}-{:06}", self.prefix, self.next);
        self.next = self.next.saturating_add(1);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_allocator() {
        let mut ids = SequentialAllocator::new("e");
        assert_eq!(ids.allocate("user"), "e-000001");
        assert_eq!(ids.allocate("user"), "e-000002");
    }

    #[test]
    fn test_uuid_allocator_distinct() {
        let mut ids = UuidAllocator;
        assert_ne!(ids.allocate("user"), ids.allocate("user"));
    }
}
