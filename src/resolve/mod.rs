//! Task Resolver
//!
//! Turns a Task reference and its inputs into the pod a restore job runs.

mod inputs;
mod pod;
mod rules;
mod subst;

pub use inputs::*;
pub use pod::*;
pub use rules::*;
pub use subst::*;
