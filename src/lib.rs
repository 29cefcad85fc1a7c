#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod cli;
pub mod config;
pub mod error;
pub mod host;
pub mod logging;
pub mod runner;
pub mod util;
pub mod vm;
