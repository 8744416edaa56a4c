//! Flat labeled instruction form produced by the linearizer.
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use super::program::ValueType;
use super::stack::CallSiteId;
use crate::ops::Operation;
use crate::tensor::TensorValue;

/// Register holding one value during interpretation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Slot(pub usize);

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Label(pub usize);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub enum Instr {
    LabelSet(Label),
    LabelGoto(Label),
    /// Jump to `labels[index]` where `index` is the branch index of `cond`.
    LabelSwitch { cond: Slot, labels: Vec<Label> },
    Assign { dst: Slot, src: Slot },
    Const { dst: Slot, value: TensorValue },
    Exec { op: Arc<dyn Operation>, args: Vec<Slot>, dst: Slot },
    StackPush { site: CallSiteId, slot: Slot },
    StackPop { site: CallSiteId, slot: Slot },
    /// End of a function no call site can return from.
    Unreachable { func: String },
    End { output: Slot },
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instr::LabelSet(label) => write!(f, "{}:", label),
            Instr::LabelGoto(label) => write!(f, "goto {}", label),
            Instr::LabelSwitch { cond, labels } => {
                let labels: Vec<String> = labels.iter().map(|label| label.to_string()).collect();
                write!(f, "switch {} [{}]", cond, labels.join(", "))
            }
            Instr::Assign { dst, src } => write!(f, "{} = {}", dst, src),
            Instr::Const { dst, value } => write!(f, "{} = const {}", dst, value.describe()),
            Instr::Exec { op, args, dst } => {
                let args: Vec<String> = args.iter().map(|slot| slot.to_string()).collect();
                write!(f, "{} = {}({})", dst, op.name(), args.join(", "))
            }
            Instr::StackPush { site, slot } => write!(f, "push site{} {}", site.0, slot),
            Instr::StackPop { site, slot } => write!(f, "pop site{} {}", site.0, slot),
            Instr::Unreachable { func } => write!(f, "unreachable {}", func),
            Instr::End { output } => write!(f, "end {}", output),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SlotInfo {
    pub name: String,
    pub ty: Option<ValueType>,
}

/// Linearized program: executable as an [`Operation`] by one kernel actor.
#[derive(Debug, Clone)]
pub struct LinearProgram {
    pub(crate) name: String,
    pub(crate) instrs: Vec<Instr>,
    pub(crate) labels: BTreeMap<Label, usize>,
    pub(crate) slots: Vec<SlotInfo>,
    pub(crate) inputs: Vec<Slot>,
    pub(crate) sites: Vec<String>,
    pub(crate) stack_capacity: usize,
    pub(crate) max_steps: usize,
}

impl LinearProgram {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instrs(&self) -> &[Instr] {
        &self.instrs
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, slot: Slot) -> Option<&SlotInfo> {
        self.slots.get(slot.0)
    }

    pub fn label_count(&self) -> usize {
        self.labels.len()
    }

    pub fn stack_capacity(&self) -> usize {
        self.stack_capacity
    }

    pub fn site_name(&self, site: CallSiteId) -> Option<&str> {
        self.sites.get(site.0).map(String::as_str)
    }

    /// Number of `(push, pop)` instructions for one call site.
    pub fn stack_ops(&self, site: CallSiteId) -> (usize, usize) {
        self.instrs.iter().fold((0, 0), |(push, pop), instr| match instr {
            Instr::StackPush { site: s, .. } if *s == site => (push + 1, pop),
            Instr::StackPop { site: s, .. } if *s == site => (push, pop + 1),
            _ => (push, pop),
        })
    }

    /// Slots whose pooled type is compatible with `ty`.
    pub fn slots_of_type(&self, ty: &ValueType) -> Vec<Slot> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, info)| info.ty.as_ref().map_or(false, |slot_ty| slot_ty.compatible(ty)))
            .map(|(index, _)| Slot(index))
            .collect()
    }

    /// Text listing with labels, jump targets and the slot table.
    pub fn dump(&self) -> String {
        let mut out = format!(
            "linear program {}: {} inputs, {} slots, {} labels, stack capacity {}\n",
            self.name,
            self.inputs.len(),
            self.slots.len(),
            self.labels.len(),
            self.stack_capacity
        );
        for (pc, instr) in self.instrs.iter().enumerate() {
            match instr {
                Instr::LabelSet(_) => out.push_str(&format!("{}\n", instr)),
                _ => out.push_str(&format!("  {:>4}  {}\n", pc, instr)),
            }
        }
        out.push_str("slots:\n");
        for (index, info) in self.slots.iter().enumerate() {
            match &info.ty {
                Some(ty) => out.push_str(&format!("  %{} {} : {}\n", index, info.name, ty)),
                None => out.push_str(&format!("  %{} {}\n", index, info.name)),
            }
        }
        if !self.sites.is_empty() {
            out.push_str("call sites:\n");
            for (index, site) in self.sites.iter().enumerate() {
                out.push_str(&format!("  site{} {}\n", index, site));
            }
        }
        out
    }
}
