//! Asynchronous coprocessor steps (component G, §4.7, §4.8): the x87 FPU
//! and 8089 I/O processor each advance independently of the main x86
//! pipeline, one step per host call, mirroring `exec::step`'s shape.

pub mod x87;
pub mod x89;
