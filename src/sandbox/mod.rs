//! Sandboxes: one supervised OS process per bot script.

pub mod console;
pub mod control;
pub mod rpc;
pub mod supervisor;
pub mod workspace;
