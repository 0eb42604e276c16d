//! Stratum CLI - build layered images from a build file.

pub mod commands;
pub mod output;
