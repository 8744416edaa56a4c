#[doc(hidden)]
pub mod logging;

mod config;
mod control_flow;
mod device;
mod error;
mod graph;
mod macros;
mod ops;
mod runtime;
mod tensor;

pub use config::{
    SchedulerConfig, DUMP_DIR_ENV, RUN_TIMEOUT_ENV, THREADS_ENV, TRACE_EVENTS_ENV,
};
pub use control_flow::{
    linearize, linearize_with, CallFrameArena, CallSiteId, FrameIndex, FuncGraph, FuncId, Instr,
    Label, LinearProgram, LinearizeOptions, Operand, Popped, Program, ProgramBuilder, Slot,
    SlotInfo, StackEvent, StackEventKind, Stmt, ValueType, VarId,
};
pub use device::{
    cpu, CpuContext, DeviceContext, DeviceId, DeviceKind, DeviceTensor, SharedDevice, SimDevice,
};
pub use error::SchedulerError;
pub use graph::{
    describe_graph, describe_node, CallBranch, CallId, CallSite, CompiledGraph, GraphBuilder,
    GraphId, GraphNode, KernelGraph, KernelNode, NodeId, NodeKind, ParameterKind, ValueRef,
};
pub use logging::TRACE_ENV;
pub use ops::{
    host_op, host_op_names, BinaryKind, BinaryOp, CompareKind, CompareOp, CopyOp, OpDescriptor,
    Operation, SideEffect, SlotType,
};
pub use runtime::{
    Actor, ActorId, ActorNode, ActorSet, ActorType, BranchArrow, BranchRecord, ControlArrow,
    DataArrow, DeviceMemory, DeviceTensorStore, ExecutionStrategy, Expect, GroupNode, InputSlot,
    OutputSnapshot, ResultArrow, RunInputs, RunReport, RunSummary, Scheduler, Scope, Stamp,
    StoreKey, Topology, TraceEvent,
};
pub use tensor::{broadcast_shape, format_shape, numel, DType, Tensor, TensorElement, TensorValue};
