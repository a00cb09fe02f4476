//! A3S Ctr CLI: a thin front-end over the container runtime.

pub mod commands;
pub mod output;
