//! Binary coverage descriptor reader (C4) and trace writer (C5).

pub mod reader;
pub mod writer;

pub use reader::{CoverageReader, Placement};
pub use writer::CoverageWriter;
