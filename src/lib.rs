#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod boot;
pub mod cli;
pub mod cloudinit;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod identity;
pub mod image;
pub mod logging;
pub mod orchestrator;
pub mod paths;
pub mod ports;
pub mod qemu;
pub mod runner;
pub mod store;
pub mod supervisor;
pub mod util;
pub mod vm_state;
