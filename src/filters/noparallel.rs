//! Serialization filter: caps the stack's thread model at runtime without
//! touching the plugin.

use crate::backend::{Filter, ThreadModel};

/// Declares a stricter thread model than the layers below; everything else
/// passes through.
pub struct NoParallelFilter {
    model: ThreadModel,
}

impl NoParallelFilter {
    /// Cap the stack at `model`.
    pub fn new(model: ThreadModel) -> NoParallelFilter {
        NoParallelFilter { model }
    }
}

impl Filter for NoParallelFilter {
    fn name(&self) -> &'static str {
        "noparallel"
    }

    fn thread_model(&self) -> ThreadModel {
        self.model
    }
}
