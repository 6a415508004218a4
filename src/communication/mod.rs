pub mod messages;

pub use messages::{ManualOverride, OverrideAction};
