//! Control-flow lowering for programs the actor graph cannot express
//! directly: functions called from several sites and recursion.
mod exec;
mod label;
mod linearize;
mod program;
mod stack;

pub use label::{Instr, Label, LinearProgram, Slot, SlotInfo};
pub use linearize::{linearize, linearize_with, LinearizeOptions};
pub use program::{FuncGraph, FuncId, Operand, Program, ProgramBuilder, Stmt, ValueType, VarId};
pub use stack::{CallFrameArena, CallSiteId, FrameIndex, Popped, StackEvent, StackEventKind};
