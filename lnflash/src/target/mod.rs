//! Chip support.

pub mod ln882h;
