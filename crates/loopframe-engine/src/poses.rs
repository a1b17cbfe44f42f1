use std::sync::Arc;

pub use loopframe_contracts::assets::ReferencePose;

/// Read-only, cheaply cloneable list of seed poses shared across runs.
#[derive(Debug, Clone)]
pub struct ReferencePosePool {
    poses: Arc<[ReferencePose]>,
}

impl ReferencePosePool {
    pub fn new(poses: Vec<ReferencePose>) -> Self {
        Self {
            poses: poses.into(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.poses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.poses.is_empty()
    }

    /// Wraps `index` around the pool so batch items cycle through the
    /// poses. An empty pool selects nothing.
    pub fn select(&self, index: usize) -> Option<&ReferencePose> {
        self.slot(index).map(|slot| &self.poses[slot])
    }

    pub fn slot(&self, index: usize) -> Option<usize> {
        if self.poses.is_empty() {
            None
        } else {
            Some(index % self.poses.len())
        }
    }
}

impl Default for ReferencePosePool {
    fn default() -> Self {
        Self::empty()
    }
}
