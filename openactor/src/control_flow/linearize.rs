//! Lowering of structured programs to labeled jumps.
//!
//! Every called function gets an entry label and every non-tail call site a
//! return label. A function with one return point writes its output straight
//! into the caller's destination; one with several gets a label-index
//! parameter and returns through a `LabelSwitch`, handing its output over in a
//! pooled temp slot. Values live across a recursive call site are saved on
//! the call frame stack before the call and restored right after it.
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use anyhow::Result;

use super::label::{Instr, Label, LinearProgram, Slot, SlotInfo};
use super::program::{FuncId, Operand, Program, Stmt, ValueType};
use super::stack::CallSiteId;
use crate::error::SchedulerError;
use crate::tensor::TensorValue;
use crate::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearizeOptions {
    /// Recursion depth the call frame arena is sized for.
    pub max_call_depth: usize,
    /// Interpreter step bound per execution.
    pub max_steps: usize,
}

impl Default for LinearizeOptions {
    fn default() -> Self {
        Self {
            max_call_depth: 256,
            max_steps: 1_000_000,
        }
    }
}

pub fn linearize(program: &Program) -> Result<LinearProgram> {
    linearize_with(program, LinearizeOptions::default())
}

pub fn linearize_with(program: &Program, options: LinearizeOptions) -> Result<LinearProgram> {
    validate(program)?;
    let mut lowering = Lowering::new(program, options);
    lowering.collect_sites();
    lowering.mark_tails_and_recursion();
    lowering.assign_entries();
    lowering.find_return_points()?;
    let linear = lowering.emit();
    trace!(
        "linearized {}: {} instructions, {} call sites",
        linear.name,
        linear.instrs.len(),
        linear.sites.len()
    );
    Ok(linear)
}

fn validate(program: &Program) -> Result<()> {
    for (index, func) in program.funcs.iter().enumerate() {
        if func.id.0 != index {
            return Err(SchedulerError::linearize(format!(
                "function {} has id f{} at position {}",
                func.name, func.id.0, index
            )));
        }
        let mut defined = vec![false; func.vars.len()];
        let check = |operand: &Operand, defined: &[bool]| -> Result<()> {
            match operand {
                Operand::Param(param) if *param >= func.params.len() => {
                    Err(SchedulerError::linearize(format!(
                        "{} reads parameter {} but takes {}",
                        func.name,
                        param,
                        func.params.len()
                    )))
                }
                Operand::Var(var) if !defined.get(var.0).copied().unwrap_or(false) => Err(
                    SchedulerError::linearize(format!("{} reads undefined v{}", func.name, var.0)),
                ),
                _ => Ok(()),
            }
        };
        for (position, stmt) in func.stmts.iter().enumerate() {
            for operand in stmt.operands() {
                check(operand, &defined)?;
            }
            let dst = stmt.dst();
            if dst.0 >= func.vars.len() || defined[dst.0] {
                return Err(SchedulerError::linearize(format!(
                    "{} statement {} has an invalid destination v{}",
                    func.name, position, dst.0
                )));
            }
            defined[dst.0] = true;
            let branches: Vec<(FuncId, usize)> = match stmt {
                Stmt::Op { .. } => Vec::new(),
                Stmt::Call { callee, args, .. } => vec![(*callee, args.len())],
                Stmt::Switch { branches, .. } => {
                    if branches.is_empty() {
                        return Err(SchedulerError::linearize(format!(
                            "{} statement {} switches over no branches",
                            func.name, position
                        )));
                    }
                    branches.iter().map(|(callee, args)| (*callee, args.len())).collect()
                }
            };
            for (callee, args) in branches {
                let target = program.func(callee).ok_or_else(|| {
                    SchedulerError::linearize(format!("{} calls unknown f{}", func.name, callee.0))
                })?;
                if callee == program.top {
                    return Err(SchedulerError::linearize(format!(
                        "{} calls the top function {}",
                        func.name, target.name
                    )));
                }
                if args != target.params.len() {
                    return Err(SchedulerError::linearize(format!(
                        "call site {}#{} passes {} arguments to {} which takes {}",
                        func.name,
                        position,
                        args,
                        target.name,
                        target.params.len()
                    )));
                }
                if !target.output_type.compatible(&func.vars[dst.0]) {
                    return Err(SchedulerError::linearize(format!(
                        "call site {}#{} expects {} but {} returns {}",
                        func.name, position, func.vars[dst.0], target.name, target.output_type
                    )));
                }
            }
        }
        check(&func.output, &defined)?;
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct SiteInfo {
    id: CallSiteId,
    func: FuncId,
    stmt: usize,
    callees: Vec<FuncId>,
    tail: bool,
    recursive: bool,
    return_label: Option<Label>,
    /// Label-index parameters this site sets before jumping: (returning function, index).
    label_indexes: Vec<(FuncId, usize)>,
}

struct Lowering<'a> {
    program: &'a Program,
    options: LinearizeOptions,
    slots: Vec<SlotInfo>,
    params: Vec<Vec<Slot>>,
    vars: Vec<Vec<Slot>>,
    defs: Vec<Vec<usize>>,
    sites: Vec<SiteInfo>,
    site_at: HashMap<(FuncId, usize), usize>,
    reach: Vec<BTreeSet<FuncId>>,
    entries: BTreeMap<FuncId, Label>,
    return_points: BTreeMap<FuncId, Vec<usize>>,
    label_params: BTreeMap<FuncId, Slot>,
    temps: Vec<(ValueType, Slot)>,
    next_label: usize,
    instrs: Vec<Instr>,
    max_saved: usize,
}

impl<'a> Lowering<'a> {
    fn new(program: &'a Program, options: LinearizeOptions) -> Self {
        let mut lowering = Self {
            program,
            options,
            slots: Vec::new(),
            params: Vec::new(),
            vars: Vec::new(),
            defs: Vec::new(),
            sites: Vec::new(),
            site_at: HashMap::new(),
            reach: Vec::new(),
            entries: BTreeMap::new(),
            return_points: BTreeMap::new(),
            label_params: BTreeMap::new(),
            temps: Vec::new(),
            next_label: 0,
            instrs: Vec::new(),
            max_saved: 0,
        };
        for func in &program.funcs {
            let params = func
                .params
                .iter()
                .enumerate()
                .map(|(index, ty)| lowering.alloc(format!("{}.p{}", func.name, index), Some(ty.clone())))
                .collect();
            let vars = func
                .vars
                .iter()
                .enumerate()
                .map(|(index, ty)| lowering.alloc(format!("{}.v{}", func.name, index), Some(ty.clone())))
                .collect();
            let mut defs = vec![usize::MAX; func.vars.len()];
            for (position, stmt) in func.stmts.iter().enumerate() {
                defs[stmt.dst().0] = position;
            }
            lowering.params.push(params);
            lowering.vars.push(vars);
            lowering.defs.push(defs);
        }
        lowering
    }

    fn alloc(&mut self, name: String, ty: Option<ValueType>) -> Slot {
        self.slots.push(SlotInfo { name, ty });
        Slot(self.slots.len() - 1)
    }

    fn new_label(&mut self) -> Label {
        self.next_label += 1;
        Label(self.next_label - 1)
    }

    fn reaches(&self, from: FuncId, to: FuncId) -> bool {
        self.reach[from.0].contains(&to)
    }

    fn collect_sites(&mut self) {
        let top = self.program.top;
        for func in &self.program.funcs {
            let last = func.stmts.len().saturating_sub(1);
            for (position, stmt) in func.stmts.iter().enumerate() {
                let callees = stmt.callees();
                if callees.is_empty() {
                    continue;
                }
                let returns_result = matches!(func.output, Operand::Var(var) if var == stmt.dst());
                let id = CallSiteId(self.sites.len());
                self.site_at.insert((func.id, position), self.sites.len());
                self.sites.push(SiteInfo {
                    id,
                    func: func.id,
                    stmt: position,
                    callees,
                    tail: func.id != top && position == last && returns_result,
                    recursive: false,
                    return_label: None,
                    label_indexes: Vec::new(),
                });
            }
        }
        let mut edges = vec![BTreeSet::new(); self.program.funcs.len()];
        for site in &self.sites {
            edges[site.func.0].extend(site.callees.iter().copied());
        }
        self.reach = (0..edges.len())
            .map(|start| {
                let mut seen = BTreeSet::new();
                let mut stack: Vec<FuncId> = edges[start].iter().copied().collect();
                while let Some(func) = stack.pop() {
                    if seen.insert(func) {
                        stack.extend(edges[func.0].iter().copied());
                    }
                }
                seen
            })
            .collect();
    }

    /// A function is recursive when it lies on a cycle through a non-tail
    /// call. Tail calls inside recursive functions become ordinary calls,
    /// which may expose further cycles, so iterate to a fixed point.
    fn mark_tails_and_recursion(&mut self) {
        loop {
            let mut recursive = BTreeSet::new();
            for site in self.sites.iter().filter(|site| !site.tail) {
                for &callee in &site.callees {
                    if callee != site.func && !self.reaches(callee, site.func) {
                        continue;
                    }
                    for func in &self.program.funcs {
                        let from_callee = func.id == callee || self.reaches(callee, func.id);
                        let to_caller = func.id == site.func || self.reaches(func.id, site.func);
                        if from_callee && to_caller {
                            recursive.insert(func.id);
                        }
                    }
                }
            }
            let mut changed = false;
            for site in self.sites.iter_mut() {
                if site.tail && recursive.contains(&site.func) {
                    site.tail = false;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        for index in 0..self.sites.len() {
            let site = &self.sites[index];
            let recursive = !site.tail
                && site
                    .callees
                    .iter()
                    .any(|&callee| callee == site.func || self.reaches(callee, site.func));
            self.sites[index].recursive = recursive;
        }
    }

    fn assign_entries(&mut self) {
        let callees: Vec<FuncId> = self
            .sites
            .iter()
            .flat_map(|site| site.callees.iter().copied())
            .collect();
        for callee in callees {
            if !self.entries.contains_key(&callee) {
                let label = self.new_label();
                self.entries.insert(callee, label);
            }
        }
    }

    fn find_return_points(&mut self) -> Result<()> {
        let tail_site_of: HashMap<FuncId, usize> = self
            .sites
            .iter()
            .enumerate()
            .filter(|(_, site)| site.tail)
            .map(|(index, site)| (site.func, index))
            .collect();
        for origin in 0..self.sites.len() {
            if self.sites[origin].tail {
                continue;
            }
            let mut visited = BTreeSet::new();
            let mut queue = VecDeque::from([origin]);
            while let Some(current) = queue.pop_front() {
                for callee in self.sites[current].callees.clone() {
                    if !visited.insert(callee) {
                        continue;
                    }
                    match tail_site_of.get(&callee) {
                        Some(&tail) => queue.push_back(tail),
                        None => self.add_return_point(origin, callee),
                    }
                }
            }
            if self.sites[origin].return_label.is_none() {
                let site = &self.sites[origin];
                let func = &self.program.funcs[site.func.0];
                return Err(SchedulerError::linearize(format!(
                    "call site {}#{} has no reachable return",
                    func.name, site.stmt
                )));
            }
        }
        Ok(())
    }

    fn add_return_point(&mut self, site: usize, callee: FuncId) {
        if self.sites[site].return_label.is_none() {
            let label = self.new_label();
            self.sites[site].return_label = Some(label);
        }
        let points = self.return_points.entry(callee).or_default();
        points.push(site);
        let count = points.len();
        let first = points[0];
        if count == 2 {
            let name = format!("{}.label", self.program.funcs[callee.0].name);
            let slot = self.alloc(name, None);
            self.label_params.insert(callee, slot);
            self.sites[first].label_indexes.push((callee, 0));
        }
        if count >= 2 {
            self.sites[site].label_indexes.push((callee, count - 1));
        }
    }

    fn temp_for(&mut self, ty: &ValueType) -> Slot {
        if let Some((_, slot)) = self.temps.iter().find(|(pooled, _)| pooled.compatible(ty)) {
            return *slot;
        }
        let pooled = ValueType::tensor(ty.dtype, ty.shape.clone());
        let slot = self.alloc(format!("ret.{}", pooled), Some(pooled.clone()));
        self.temps.push((pooled, slot));
        slot
    }

    fn operand(&mut self, func: FuncId, operand: &Operand) -> Slot {
        match operand {
            Operand::Param(index) => self.params[func.0][*index],
            Operand::Var(var) => self.vars[func.0][var.0],
            Operand::Const(value) => {
                let slot = self.alloc("const".to_string(), None);
                self.instrs.push(Instr::Const {
                    dst: slot,
                    value: value.clone(),
                });
                slot
            }
        }
    }

    /// Slots read after statement `position` of `func` that a recursive
    /// invocation could overwrite, in ascending order.
    fn live_after(&self, func: FuncId, position: usize) -> Vec<Slot> {
        let body = &self.program.funcs[func.0];
        let mut live = BTreeSet::new();
        let mut note = |operand: &Operand| match operand {
            Operand::Param(index) => {
                live.insert(self.params[func.0][*index]);
            }
            Operand::Var(var) if self.defs[func.0][var.0] < position => {
                live.insert(self.vars[func.0][var.0]);
            }
            _ => {}
        };
        for stmt in &body.stmts[position + 1..] {
            for operand in stmt.operands() {
                note(operand);
            }
        }
        note(&body.output);
        if let Some(slot) = self.label_params.get(&func) {
            live.insert(*slot);
        }
        live.into_iter().collect()
    }

    fn emit(mut self) -> LinearProgram {
        let program = self.program;
        let top = program.top;
        self.emit_body(top);
        let output = self.operand(top, &program.funcs[top.0].output);
        self.instrs.push(Instr::End { output });
        let called: Vec<(FuncId, Label)> = self.entries.iter().map(|(f, l)| (*f, *l)).collect();
        for (func, entry) in called {
            self.instrs.push(Instr::LabelSet(entry));
            self.emit_body(func);
            self.emit_return(func);
        }
        let labels = self
            .instrs
            .iter()
            .enumerate()
            .filter_map(|(pc, instr)| match instr {
                Instr::LabelSet(label) => Some((*label, pc)),
                _ => None,
            })
            .collect();
        let sites = self
            .sites
            .iter()
            .map(|site| format!("{}#{}", self.program.funcs[site.func.0].name, site.stmt))
            .collect();
        LinearProgram {
            name: self.program.name.clone(),
            instrs: self.instrs,
            labels,
            slots: self.slots,
            inputs: self.params[top.0].clone(),
            sites,
            stack_capacity: self.options.max_call_depth * self.max_saved.max(1),
            max_steps: self.options.max_steps,
        }
    }

    fn emit_body(&mut self, func: FuncId) {
        let program = self.program;
        let body = &program.funcs[func.0];
        for (position, stmt) in body.stmts.iter().enumerate() {
            match stmt {
                Stmt::Op { dst, op, args } => {
                    let args = args.iter().map(|arg| self.operand(func, arg)).collect();
                    let dst = self.vars[func.0][dst.0];
                    self.instrs.push(Instr::Exec {
                        op: op.clone(),
                        args,
                        dst,
                    });
                }
                Stmt::Call { .. } | Stmt::Switch { .. } => {
                    if let Some(&site) = self.site_at.get(&(func, position)) {
                        self.emit_site(site, stmt);
                    }
                }
            }
        }
    }

    fn emit_site(&mut self, index: usize, stmt: &Stmt) {
        let site = self.sites[index].clone();
        let saved = if site.recursive {
            self.live_after(site.func, site.stmt)
        } else {
            Vec::new()
        };
        self.max_saved = self.max_saved.max(saved.len());
        for &slot in &saved {
            self.instrs.push(Instr::StackPush { site: site.id, slot });
        }
        for &(callee, label_index) in &site.label_indexes {
            if let Some(&slot) = self.label_params.get(&callee) {
                self.instrs.push(Instr::Const {
                    dst: slot,
                    value: TensorValue::scalar(label_index as i64),
                });
            }
        }
        match stmt {
            Stmt::Call { callee, args, .. } => {
                self.emit_args(site.func, *callee, args);
                self.instrs.push(Instr::LabelGoto(self.entries[callee]));
            }
            Stmt::Switch { cond, branches, .. } => {
                let cond = self.operand(site.func, cond);
                let locals: Vec<Label> = branches.iter().map(|_| self.new_label()).collect();
                self.instrs.push(Instr::LabelSwitch {
                    cond,
                    labels: locals.clone(),
                });
                for ((callee, args), local) in branches.iter().zip(locals) {
                    self.instrs.push(Instr::LabelSet(local));
                    self.emit_args(site.func, *callee, args);
                    self.instrs.push(Instr::LabelGoto(self.entries[callee]));
                }
            }
            Stmt::Op { .. } => {}
        }
        if site.tail {
            return;
        }
        if let Some(label) = site.return_label {
            self.instrs.push(Instr::LabelSet(label));
        }
        for &slot in saved.iter().rev() {
            self.instrs.push(Instr::StackPop { site: site.id, slot });
        }
        if !site.label_indexes.is_empty() {
            let dst_var = stmt.dst();
            let ty = self.program.funcs[site.func.0].vars[dst_var.0].clone();
            let temp = self.temp_for(&ty);
            let dst = self.vars[site.func.0][dst_var.0];
            self.instrs.push(Instr::Assign { dst, src: temp });
        }
    }

    /// Assign arguments to the callee's parameter slots, staging them first
    /// when a source is also an earlier-written target.
    fn emit_args(&mut self, func: FuncId, callee: FuncId, args: &[Operand]) {
        let sources: Vec<Slot> = args.iter().map(|arg| self.operand(func, arg)).collect();
        let targets = self.params[callee.0].clone();
        let clobbers = sources
            .iter()
            .zip(&targets)
            .any(|(source, target)| source != target && targets.contains(source));
        let sources = if clobbers {
            let name = format!("{}.arg", self.program.funcs[func.0].name);
            sources
                .into_iter()
                .map(|source| {
                    let staged = self.alloc(name.clone(), None);
                    self.instrs.push(Instr::Assign {
                        dst: staged,
                        src: source,
                    });
                    staged
                })
                .collect()
        } else {
            sources
        };
        for (source, target) in sources.into_iter().zip(targets) {
            if source != target {
                self.instrs.push(Instr::Assign {
                    dst: target,
                    src: source,
                });
            }
        }
    }

    fn emit_return(&mut self, func: FuncId) {
        let program = self.program;
        let body = &program.funcs[func.0];
        let points = self.return_points.get(&func).cloned().unwrap_or_default();
        if points.is_empty() {
            let ends_in_tail = body
                .stmts
                .len()
                .checked_sub(1)
                .and_then(|last| self.site_at.get(&(func, last)))
                .map_or(false, |&site| self.sites[site].tail);
            if !ends_in_tail {
                self.instrs.push(Instr::Unreachable {
                    func: body.name.clone(),
                });
            }
            return;
        }
        let output = self.operand(func, &body.output);
        let first = &self.sites[points[0]];
        if points.len() == 1 && first.label_indexes.is_empty() {
            let caller = &program.funcs[first.func.0];
            let stmt = &caller.stmts[first.stmt];
            let dst = self.vars[first.func.0][stmt.dst().0];
            let label = first.return_label;
            self.instrs.push(Instr::Assign { dst, src: output });
            if let Some(label) = label {
                self.instrs.push(Instr::LabelGoto(label));
            }
            return;
        }
        let ty = body.output_type.clone();
        let temp = self.temp_for(&ty);
        self.instrs.push(Instr::Assign {
            dst: temp,
            src: output,
        });
        let labels: Vec<Label> = points
            .iter()
            .filter_map(|&site| self.sites[site].return_label)
            .collect();
        match (labels.as_slice(), self.label_params.get(&func)) {
            ([single], _) => self.instrs.push(Instr::LabelGoto(*single)),
            (_, Some(&cond)) => self.instrs.push(Instr::LabelSwitch { cond, labels }),
            _ => self.instrs.push(Instr::Unreachable {
                func: body.name.clone(),
            }),
        }
    }
}
