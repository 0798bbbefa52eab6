//! Sandbox runtime core.
//!
//! Host side: the supervisor owns generations, deadlines and the event stream.
//! Context side: the harness, timers and execution context run untrusted code
//! inside an isolation boundary and report back only through messages.

pub mod boundary;
pub mod context;
pub mod harness;
pub mod supervisor;
pub mod timers;
pub mod types;
pub mod worker;
