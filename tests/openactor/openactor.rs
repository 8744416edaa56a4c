#[path = "common/mod.rs"]
mod common;

#[path = "runtime/run_linear.rs"]
mod run_linear;
#[path = "runtime/run_branch.rs"]
mod run_branch;
#[path = "runtime/run_devices.rs"]
mod run_devices;
#[path = "runtime/run_state.rs"]
mod run_state;
#[path = "runtime/run_errors.rs"]
mod run_errors;
#[path = "runtime/registry.rs"]
mod registry;

#[path = "control_flow/linearized.rs"]
mod linearized;
#[path = "control_flow/frames.rs"]
mod frames;
