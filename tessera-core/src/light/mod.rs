//! Light propagation.

use std::fmt;

pub mod section_graph;
pub mod threaded;

pub use section_graph::{LightSectionGraph, SectionLightEngine};
pub use threaded::ThreadedLightEngine;

/// The two independent light layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LightLayer {
    /// Light from the sky.
    Sky,
    /// Light from emitting blocks.
    Block,
}

impl fmt::Display for LightLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sky => f.write_str("sky"),
            Self::Block => f.write_str("block"),
        }
    }
}
