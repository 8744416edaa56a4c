use std::sync::Arc;

use anyhow::{anyhow, Context, Result};

use crate::device::DeviceTensor;
use crate::tensor::TensorValue;

use super::super::context::RunContext;
use super::super::report::OutputSnapshot;
use super::{
    Actor, ActorKind, DataSourceActor, Fired, GatherActor, InputSlot, KernelActor, Message, Stamp,
    SwitchActor,
};

fn output(outputs: &[DeviceTensor], index: usize, actor: &str) -> Result<DeviceTensor> {
    outputs
        .get(index)
        .cloned()
        .ok_or_else(|| anyhow!("{} has no output {}", actor, index))
}

impl Actor {
    pub(crate) fn fire(&self, ctx: &Arc<RunContext>, fired: Fired) -> Result<()> {
        crate::trace_actor!("fire {} ({})", self.name, fired.stamp);
        match &self.kind {
            ActorKind::DataPrepare => self.run_data_prepare(ctx, fired.stamp),
            ActorKind::DataSource(source) => self.run_data_source(ctx, source, fired.stamp),
            ActorKind::Kernel(kernel) => self.run_kernel(ctx, kernel, fired),
            ActorKind::Copy(_) => self.run_copy(ctx, fired),
            ActorKind::Switch(switch) => self.run_switch(ctx, switch, fired),
            ActorKind::Gather(gather) => self.run_gather(ctx, gather, fired),
            ActorKind::LoopCount => self.run_loop_count(ctx, fired),
            ActorKind::Output => self.run_output(ctx, fired),
        }
    }

    /// Inputs in slot order: arrow slots from the inbox, store slots read now.
    fn collect_inputs(&self, ctx: &RunContext, fired: &mut Fired) -> Result<Vec<DeviceTensor>> {
        let variant = fired.variant(&self.expect);
        let slots = self
            .inputs
            .get(variant)
            .ok_or_else(|| anyhow!("{} has no input variant {}", self.name, variant))?;
        slots
            .iter()
            .enumerate()
            .map(|(index, slot)| match slot {
                InputSlot::Arrow => fired
                    .data
                    .get_mut(index)
                    .and_then(Option::take)
                    .ok_or_else(|| anyhow!("input {} of {} is missing", index, self.name)),
                InputSlot::Store(key) => ctx.store.fetch(key),
            })
            .collect()
    }

    /// Result arrows first, then data, control and trigger arrows.
    fn send_outputs(&self, ctx: &Arc<RunContext>, stamp: Stamp, outputs: &[DeviceTensor]) -> Result<()> {
        for arrow in &self.arrows.result {
            let tensor = output(outputs, arrow.from_output, &self.name)?;
            ctx.send(
                arrow.to,
                stamp,
                Message::Result {
                    slot: arrow.to_input,
                    tensor,
                },
            );
        }
        for arrow in &self.arrows.data {
            let tensor = output(outputs, arrow.from_output, &self.name)?;
            ctx.send(
                arrow.to,
                stamp,
                Message::Data {
                    slot: arrow.to_input,
                    tensor,
                },
            );
        }
        for arrow in &self.arrows.control {
            ctx.send(arrow.to, stamp, Message::Control);
        }
        for to in &self.arrows.trigger {
            ctx.send(*to, stamp, Message::Trigger);
        }
        Ok(())
    }

    fn run_data_prepare(&self, ctx: &Arc<RunContext>, stamp: Stamp) -> Result<()> {
        ctx.note_prepare();
        for persistent in &ctx.set.persistents {
            if ctx.store.contains(&persistent.key) {
                continue;
            }
            let tensor = persistent
                .device
                .upload(&persistent.value)
                .with_context(|| format!("failed to upload {}", persistent.key))?;
            ctx.memory.record_upload(tensor.device(), tensor.value().nbytes());
            ctx.store.insert(persistent.key.clone(), tensor)?;
        }
        ctx.set.host_queue.push(stamp, Arc::clone(&ctx.inputs))?;
        self.send_outputs(ctx, stamp, &[])
    }

    fn run_data_source(&self, ctx: &Arc<RunContext>, source: &DataSourceActor, stamp: Stamp) -> Result<()> {
        let batch = ctx.set.host_queue.fetch(stamp)?;
        let device = self.device()?;
        let outputs = source
            .positions
            .iter()
            .map(|position| {
                let value = batch
                    .get(*position)
                    .ok_or_else(|| anyhow!("host input {} is missing", position))?;
                let tensor = device.upload(value)?;
                ctx.memory.record_upload(tensor.device(), value.nbytes());
                Ok(tensor)
            })
            .collect::<Result<Vec<_>>>()?;
        self.send_outputs(ctx, stamp, &outputs)
    }

    fn run_kernel(&self, ctx: &Arc<RunContext>, kernel: &KernelActor, mut fired: Fired) -> Result<()> {
        let stamp = fired.stamp;
        let inputs = self.collect_inputs(ctx, &mut fired)?;
        let device = self.device()?;
        for (index, tensor) in inputs.iter().enumerate() {
            if tensor.device() != device.id() {
                return Err(anyhow!(
                    "input {} of op {} resides on {} but the kernel runs on {}",
                    index,
                    kernel.op.id,
                    tensor.device(),
                    device.id()
                ));
            }
        }
        let values: Vec<&TensorValue> = inputs.iter().map(DeviceTensor::value).collect();
        kernel.op.check_inputs(&values)?;
        kernel.prepare_for(&values)?;
        let outputs = kernel
            .op
            .backend
            .execute(&values)
            .with_context(|| format!("op {} failed", kernel.op.id))?;
        kernel.op.check_outputs(&outputs)?;
        let outputs: Vec<DeviceTensor> = outputs
            .into_iter()
            .map(|value| DeviceTensor::new(value, device.id()))
            .collect();
        if let Some(key) = &kernel.write_back {
            let updated = output(&outputs, 0, &self.name)?;
            ctx.store.insert(key.clone(), updated)?;
        }
        self.send_outputs(ctx, stamp, &outputs)
    }

    fn run_copy(&self, ctx: &Arc<RunContext>, mut fired: Fired) -> Result<()> {
        let stamp = fired.stamp;
        let inputs = self.collect_inputs(ctx, &mut fired)?;
        let source = output(&inputs, 0, &self.name)?;
        let device = self.device()?;
        let copied = device.copy(&source)?;
        ctx.memory.record_copy(copied.device(), copied.value().nbytes());
        self.send_outputs(ctx, stamp, &[copied])
    }

    fn run_switch(&self, ctx: &Arc<RunContext>, switch: &SwitchActor, mut fired: Fired) -> Result<()> {
        let stamp = fired.stamp;
        let inputs = self.collect_inputs(ctx, &mut fired)?;
        let branch = if switch.has_cond {
            output(&inputs, 0, &self.name)?
                .value()
                .branch_index()
                .with_context(|| format!("invalid condition for call {}", switch.call_name))?
        } else {
            0
        };
        let group = switch.groups.get(branch).ok_or_else(|| {
            anyhow!(
                "branch index {} out of range for call {} with {} branches",
                branch,
                switch.call_name,
                switch.groups.len()
            )
        })?;
        for arrow in &group.data {
            let tensor = output(&inputs, arrow.from_output, &self.name)?;
            ctx.send(
                arrow.to,
                stamp,
                Message::Data {
                    slot: arrow.to_input,
                    tensor,
                },
            );
        }
        for arrow in &group.control {
            ctx.send(arrow.to, stamp, Message::Control);
        }
        if let Some(gather) = group.gather {
            ctx.send(gather, stamp, Message::Branch(branch));
        }
        Ok(())
    }

    fn run_gather(&self, ctx: &Arc<RunContext>, gather: &GatherActor, mut fired: Fired) -> Result<()> {
        let stamp = fired.stamp;
        let branch = fired.variant(&self.expect);
        let outputs = self.collect_inputs(ctx, &mut fired)?;
        ctx.record_branch(stamp.iteration, &gather.call_name, branch);
        self.send_outputs(ctx, stamp, &outputs)?;
        for arrow in &self.arrows.branch {
            ctx.send(arrow.to, stamp, Message::Branch(branch));
        }
        Ok(())
    }

    /// Store-backed graph outputs are read here, after every actor of this
    /// iteration and before any actor of the next one.
    fn run_loop_count(&self, ctx: &Arc<RunContext>, mut fired: Fired) -> Result<()> {
        let stamp = fired.stamp;
        if ctx.failed() {
            return Ok(());
        }
        let outputs = self.collect_inputs(ctx, &mut fired)?;
        self.send_outputs(ctx, stamp, &outputs)?;
        let next = stamp.iteration + 1;
        if next < ctx.target && !ctx.failed() {
            ctx.send(
                ctx.set.data_prepare,
                Stamp {
                    run: stamp.run,
                    iteration: next,
                },
                Message::Trigger,
            );
        }
        Ok(())
    }

    fn run_output(&self, ctx: &Arc<RunContext>, mut fired: Fired) -> Result<()> {
        let iteration = fired.stamp.iteration;
        let values = self
            .collect_inputs(ctx, &mut fired)?
            .iter()
            .map(|tensor| tensor.value().clone())
            .collect();
        ctx.publish(OutputSnapshot { iteration, values });
        if iteration + 1 >= ctx.target {
            ctx.complete();
        }
        Ok(())
    }
}

impl KernelActor {
    /// `prepare` on the first firing, `resize` whenever input shapes change.
    fn prepare_for(&self, values: &[&TensorValue]) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("state of op {} poisoned", self.op.id))?;
        if !state.prepared {
            self.op
                .backend
                .prepare()
                .with_context(|| format!("op {} failed to prepare", self.op.id))?;
            state.prepared = true;
        }
        let shapes: Vec<Vec<usize>> = values.iter().map(|value| value.shape().to_vec()).collect();
        if state.shapes.as_ref() != Some(&shapes) {
            self.op
                .backend
                .resize(&shapes)
                .with_context(|| format!("op {} failed to resize", self.op.id))?;
            state.shapes = Some(shapes);
        }
        Ok(())
    }
}
