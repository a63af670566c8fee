//! Storage layer: the B-tree engine and the pager beneath it

pub mod btree;
pub mod pager;
