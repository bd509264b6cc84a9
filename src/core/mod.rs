//! Leaf data structures shared by the buffer layer.

/// Fixed-capacity circular store with drop-oldest support.
pub mod ring;
