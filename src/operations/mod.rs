//! Thin wrappers over common Reddit endpoints

pub mod feeds;
pub mod flair;
pub mod wiki;
