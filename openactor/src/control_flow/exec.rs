use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};

use super::label::{Instr, Label, LinearProgram, Slot};
use super::stack::{CallFrameArena, StackEvent, StackEventKind};
use crate::ops::Operation;
use crate::tensor::TensorValue;

struct Registers {
    values: Vec<Option<Arc<TensorValue>>>,
}

impl Registers {
    fn read(&self, slot: Slot) -> Result<&Arc<TensorValue>> {
        self.values
            .get(slot.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| anyhow!("slot {} read before assignment", slot))
    }

    fn write(&mut self, slot: Slot, value: Arc<TensorValue>) -> Result<()> {
        let target = self
            .values
            .get_mut(slot.0)
            .ok_or_else(|| anyhow!("slot {} out of range", slot))?;
        *target = Some(value);
        Ok(())
    }
}

impl LinearProgram {
    pub fn run(&self, inputs: &[TensorValue]) -> Result<TensorValue> {
        let inputs: Vec<&TensorValue> = inputs.iter().collect();
        self.interpret(&inputs, None)
    }

    /// Run and also return every stack push/pop in execution order.
    pub fn run_traced(&self, inputs: &[TensorValue]) -> Result<(TensorValue, Vec<StackEvent>)> {
        let inputs: Vec<&TensorValue> = inputs.iter().collect();
        let mut events = Vec::new();
        let output = self.interpret(&inputs, Some(&mut events))?;
        Ok((output, events))
    }

    fn jump(&self, label: Label) -> Result<usize> {
        self.labels
            .get(&label)
            .copied()
            .ok_or_else(|| anyhow!("jump to undefined label {}", label))
    }

    fn interpret(
        &self,
        inputs: &[&TensorValue],
        mut events: Option<&mut Vec<StackEvent>>,
    ) -> Result<TensorValue> {
        if inputs.len() != self.inputs.len() {
            return Err(anyhow!(
                "{} expects {} inputs, got {}",
                self.name,
                self.inputs.len(),
                inputs.len()
            ));
        }
        let mut registers = Registers {
            values: vec![None; self.slots.len()],
        };
        for (slot, value) in self.inputs.iter().zip(inputs) {
            registers.write(*slot, Arc::new((*value).clone()))?;
        }
        let mut arena = CallFrameArena::new(self.stack_capacity);
        let mut pc = 0;
        let mut steps = 0usize;
        while let Some(instr) = self.instrs.get(pc) {
            steps += 1;
            if steps > self.max_steps {
                return Err(anyhow!("{} exceeded {} steps", self.name, self.max_steps));
            }
            pc += 1;
            match instr {
                Instr::LabelSet(_) => {}
                Instr::LabelGoto(label) => pc = self.jump(*label)?,
                Instr::LabelSwitch { cond, labels } => {
                    let index = registers.read(*cond)?.branch_index()?;
                    let label = labels.get(index).ok_or_else(|| {
                        anyhow!("label index {} out of range for {} targets", index, labels.len())
                    })?;
                    pc = self.jump(*label)?;
                }
                Instr::Assign { dst, src } => {
                    let value = registers.read(*src)?.clone();
                    registers.write(*dst, value)?;
                }
                Instr::Const { dst, value } => registers.write(*dst, Arc::new(value.clone()))?,
                Instr::Exec { op, args, dst } => {
                    let values = args
                        .iter()
                        .map(|slot| registers.read(*slot).map(|value| value.as_ref()))
                        .collect::<Result<Vec<&TensorValue>>>()?;
                    let mut outputs = op
                        .execute(&values)
                        .with_context(|| format!("{} failed inside {}", op.name(), self.name))?;
                    if outputs.is_empty() {
                        return Err(anyhow!("{} produced no output", op.name()));
                    }
                    let output = outputs.swap_remove(0);
                    registers.write(*dst, Arc::new(output))?;
                }
                Instr::StackPush { site, slot } => {
                    let value = registers.read(*slot)?.clone();
                    let (_, tag) = arena.push(*site, *slot, value)?;
                    if let Some(events) = events.as_deref_mut() {
                        events.push(StackEvent {
                            kind: StackEventKind::Push,
                            site: *site,
                            slot: *slot,
                            tag,
                            depth: arena.depth(),
                        });
                    }
                }
                Instr::StackPop { site, slot } => {
                    let popped = arena.pop(*site, *slot)?;
                    if let Some(events) = events.as_deref_mut() {
                        events.push(StackEvent {
                            kind: StackEventKind::Pop,
                            site: *site,
                            slot: *slot,
                            tag: popped.tag,
                            depth: arena.depth(),
                        });
                    }
                    registers.write(*slot, popped.value)?;
                }
                Instr::Unreachable { func } => {
                    return Err(anyhow!("control reached the end of {} with no return", func));
                }
                Instr::End { output } => {
                    if !arena.is_empty() {
                        return Err(anyhow!(
                            "stack imbalance: {} frames left at end of {}",
                            arena.depth(),
                            self.name
                        ));
                    }
                    return Ok(registers.read(*output)?.as_ref().clone());
                }
            }
        }
        Err(anyhow!("{} fell off the end without End", self.name))
    }
}

impl Operation for LinearProgram {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for instr in &self.instrs {
            if let Instr::Exec { op, .. } = instr {
                let key = Arc::as_ptr(op) as *const () as usize;
                if seen.insert(key) {
                    op.prepare()?;
                }
            }
        }
        Ok(())
    }

    fn execute(&self, inputs: &[&TensorValue]) -> Result<Vec<TensorValue>> {
        Ok(vec![self.interpret(inputs, None)?])
    }
}
