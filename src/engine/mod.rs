pub mod control_loop;

pub use control_loop::{lock_network, spawn_control_loop, ControlLoop};
