//! Various utilities

pub mod align;
