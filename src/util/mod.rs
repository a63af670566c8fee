//! Utility modules

pub mod bitvec;
