mod machine;
mod persist;
mod setup;

pub use machine::{NodeStateMachine, SaveHook, OFFLINE_STATE};
pub use setup::{FieldDef, FieldValue, FlagDef, StateMask};
