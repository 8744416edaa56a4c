//! Structured input of the linearizer: functions with parameters,
//! statements and a single output, calling each other freely (including
//! recursively and from several call sites).
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;
use crate::ops::{host_op, Operation};
use crate::tensor::{format_shape, DType, TensorValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FuncId(pub usize);

/// Function-local variable, defined by exactly one statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VarId(pub usize);

/// Static type of a parameter, variable or function output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValueType {
    pub dtype: DType,
    pub shape: Vec<usize>,
    /// Reference to a tensor rather than the tensor itself.
    pub is_ref: bool,
}

impl ValueType {
    pub fn tensor(dtype: DType, shape: Vec<usize>) -> Self {
        Self {
            dtype,
            shape,
            is_ref: false,
        }
    }

    pub fn reference(dtype: DType, shape: Vec<usize>) -> Self {
        Self {
            dtype,
            shape,
            is_ref: true,
        }
    }

    pub fn scalar(dtype: DType) -> Self {
        Self::tensor(dtype, Vec::new())
    }

    /// Whether two values may share one pooled return parameter.
    ///
    /// Dtype and shape must match exactly; a reference is compatible with the
    /// tensor type it refers to. `[]` and `[1]` are different shapes.
    pub fn compatible(&self, other: &ValueType) -> bool {
        self.dtype == other.dtype && self.shape == other.shape
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ref {
            write!(f, "&")?;
        }
        write!(f, "{}{}", self.dtype, format_shape(&self.shape))
    }
}

#[derive(Debug, Clone)]
pub enum Operand {
    Param(usize),
    Var(VarId),
    Const(TensorValue),
}

impl Operand {
    pub fn constant(value: impl Into<TensorValue>) -> Self {
        Operand::Const(value.into())
    }
}

#[derive(Debug, Clone)]
pub enum Stmt {
    Op {
        dst: VarId,
        op: Arc<dyn Operation>,
        args: Vec<Operand>,
    },
    Call {
        dst: VarId,
        callee: FuncId,
        args: Vec<Operand>,
    },
    Switch {
        dst: VarId,
        cond: Operand,
        branches: Vec<(FuncId, Vec<Operand>)>,
    },
}

impl Stmt {
    pub fn dst(&self) -> VarId {
        match self {
            Stmt::Op { dst, .. } | Stmt::Call { dst, .. } | Stmt::Switch { dst, .. } => *dst,
        }
    }

    pub fn operands(&self) -> Vec<&Operand> {
        match self {
            Stmt::Op { args, .. } | Stmt::Call { args, .. } => args.iter().collect(),
            Stmt::Switch { cond, branches, .. } => std::iter::once(cond)
                .chain(branches.iter().flat_map(|(_, args)| args.iter()))
                .collect(),
        }
    }

    pub fn callees(&self) -> Vec<FuncId> {
        match self {
            Stmt::Op { .. } => Vec::new(),
            Stmt::Call { callee, .. } => vec![*callee],
            Stmt::Switch { branches, .. } => branches.iter().map(|(callee, _)| *callee).collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FuncGraph {
    pub id: FuncId,
    pub name: String,
    pub params: Vec<ValueType>,
    pub vars: Vec<ValueType>,
    pub stmts: Vec<Stmt>,
    pub output: Operand,
    pub output_type: ValueType,
}

#[derive(Debug, Clone)]
pub struct Program {
    pub name: String,
    pub funcs: Vec<FuncGraph>,
    pub top: FuncId,
}

impl Program {
    pub fn func(&self, id: FuncId) -> Option<&FuncGraph> {
        self.funcs.get(id.0)
    }
}

#[derive(Debug)]
struct FuncDraft {
    name: String,
    params: Vec<ValueType>,
    vars: Vec<ValueType>,
    stmts: Vec<Stmt>,
    ret: Option<(Operand, ValueType)>,
}

/// Incremental construction of a [`Program`]. Functions are declared first so
/// bodies can call functions declared later.
#[derive(Debug)]
pub struct ProgramBuilder {
    name: String,
    funcs: Vec<FuncDraft>,
}

impl ProgramBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            funcs: Vec::new(),
        }
    }

    pub fn func(&mut self, name: impl Into<String>, params: Vec<ValueType>) -> FuncId {
        self.funcs.push(FuncDraft {
            name: name.into(),
            params,
            vars: Vec::new(),
            stmts: Vec::new(),
            ret: None,
        });
        FuncId(self.funcs.len() - 1)
    }

    fn draft(&mut self, func: FuncId) -> Result<&mut FuncDraft> {
        self.funcs
            .get_mut(func.0)
            .ok_or_else(|| SchedulerError::linearize(format!("unknown function f{}", func.0)))
    }

    fn push(&mut self, func: FuncId, ty: ValueType, stmt: impl FnOnce(VarId) -> Stmt) -> Result<Operand> {
        let draft = self.draft(func)?;
        let dst = VarId(draft.vars.len());
        draft.vars.push(ty);
        draft.stmts.push(stmt(dst));
        Ok(Operand::Var(dst))
    }

    pub fn op(
        &mut self,
        func: FuncId,
        op: Arc<dyn Operation>,
        args: Vec<Operand>,
        ty: ValueType,
    ) -> Result<Operand> {
        self.push(func, ty, |dst| Stmt::Op { dst, op, args })
    }

    /// Statement running one of the shared host kernels.
    pub fn host(&mut self, func: FuncId, kernel: &str, args: Vec<Operand>, ty: ValueType) -> Result<Operand> {
        let op = host_op(kernel)?.op.clone();
        self.op(func, op, args, ty)
    }

    pub fn call(&mut self, func: FuncId, callee: FuncId, args: Vec<Operand>, ty: ValueType) -> Result<Operand> {
        self.push(func, ty, |dst| Stmt::Call { dst, callee, args })
    }

    pub fn switch(
        &mut self,
        func: FuncId,
        cond: Operand,
        branches: Vec<(FuncId, Vec<Operand>)>,
        ty: ValueType,
    ) -> Result<Operand> {
        self.push(func, ty, |dst| Stmt::Switch {
            dst,
            cond,
            branches,
        })
    }

    pub fn ret(&mut self, func: FuncId, output: Operand, ty: ValueType) -> Result<()> {
        self.draft(func)?.ret = Some((output, ty));
        Ok(())
    }

    pub fn build(self, top: FuncId) -> Result<Program> {
        let mut funcs = Vec::with_capacity(self.funcs.len());
        for (index, draft) in self.funcs.into_iter().enumerate() {
            let (output, output_type) = draft.ret.ok_or_else(|| {
                SchedulerError::linearize(format!("function {} has no return value", draft.name))
            })?;
            funcs.push(FuncGraph {
                id: FuncId(index),
                name: draft.name,
                params: draft.params,
                vars: draft.vars,
                stmts: draft.stmts,
                output,
                output_type,
            });
        }
        if top.0 >= funcs.len() {
            return Err(SchedulerError::linearize(format!("unknown top function f{}", top.0)));
        }
        Ok(Program {
            name: self.name,
            funcs,
            top,
        })
    }
}
