mod drift_convergence;
mod pipeline_flow;
mod ring_props;

use crate::shm::{SharedLayout, SharedRegion};

/// Heap-backed layout standing in for the shared pages in unit tests.
pub(crate) struct TestRegion {
    layout: Box<SharedLayout>,
}

impl TestRegion {
    pub(crate) fn new() -> Self {
        // All-zero bytes are valid for every field; init() then sets ring
        // capacities and initial states, same as on freshly mapped pages.
        let mut layout = unsafe { Box::<SharedLayout>::new_zeroed().assume_init() };
        layout.init();
        Self { layout }
    }

    pub(crate) fn region(&mut self) -> SharedRegion {
        unsafe { SharedRegion::from_ptr(&mut *self.layout) }.expect("heap layout is non-null")
    }
}
