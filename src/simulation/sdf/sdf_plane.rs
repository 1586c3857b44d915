use crate::{floating_type_mod::FT, V3};

/// Half-space boundary. The side `dir` points to is free space.
#[derive(Clone, Debug)]
pub struct SdfPlane {
    dir: V3,
    delta: FT,
}

impl SdfPlane {
    /// `dir` does not have to be normalized; `delta` is given along the normalized direction.
    pub fn new(dir: V3, delta: FT) -> SdfPlane {
        Self {
            dir: dir.normalize(),
            delta,
        }
    }

    pub fn probe(&self, x: V3) -> FT {
        self.dir.dot(&x) + self.delta
    }

    pub fn probe_with_normal(&self, x: V3) -> (FT, V3) {
        (self.probe(x), self.dir)
    }
}
