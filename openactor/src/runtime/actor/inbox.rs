use anyhow::{anyhow, Result};

use crate::device::DeviceTensor;

use super::{Actor, Expect, Stamp};

#[derive(Debug, Clone)]
pub(crate) enum Message {
    Data { slot: usize, tensor: DeviceTensor },
    Result { slot: usize, tensor: DeviceTensor },
    Control,
    Branch(usize),
    Trigger,
}

impl Message {
    fn describe(&self) -> String {
        match self {
            Message::Data { slot, .. } => format!("data for slot {}", slot),
            Message::Result { slot, .. } => format!("result for slot {}", slot),
            Message::Control => "control".to_string(),
            Message::Branch(id) => format!("branch {}", id),
            Message::Trigger => "trigger".to_string(),
        }
    }
}

/// Inputs taken out of an inbox when its actor became runnable.
#[derive(Debug)]
pub(crate) struct Fired {
    pub stamp: Stamp,
    pub data: Vec<Option<DeviceTensor>>,
    pub branches: Vec<usize>,
}

impl Fired {
    /// Branch variant whose slots and expectations apply.
    pub fn variant(&self, expect: &Expect) -> usize {
        if expect.by_branch {
            self.branches.first().copied().unwrap_or(0)
        } else {
            0
        }
    }
}

/// Readiness counters of one actor for one stamp.
#[derive(Debug, Default)]
pub(crate) struct Inbox {
    stamp: Option<Stamp>,
    data: Vec<Option<DeviceTensor>>,
    received: usize,
    control: usize,
    branches: Vec<usize>,
    triggered: bool,
    fired: bool,
}

impl Inbox {
    fn reset(&mut self, stamp: Stamp, slots: usize) {
        self.stamp = Some(stamp);
        self.data = vec![None; slots];
        self.received = 0;
        self.control = 0;
        self.branches.clear();
        self.triggered = false;
        self.fired = false;
    }

    fn touched(&self) -> bool {
        self.received > 0 || self.control > 0 || !self.branches.is_empty()
    }

    pub fn progress(&self, run: u64, expect: &Expect) -> Option<String> {
        let stamp = self.stamp?;
        if stamp.run != run || self.fired || !self.touched() {
            return None;
        }
        let variant = match (expect.by_branch, self.branches.first()) {
            (true, Some(branch)) => *branch,
            _ => 0,
        };
        Some(format!(
            "iteration {}: data {}/{}, control {}/{}, branch {}/{}",
            stamp.iteration,
            self.received,
            expect.data.get(variant).copied().unwrap_or(0),
            self.control,
            expect.control.get(variant).copied().unwrap_or(0),
            self.branches.len(),
            expect.branch
        ))
    }
}

impl Actor {
    /// Record one message; returns the taken inputs when this message made
    /// the actor runnable.
    pub(crate) fn deliver(&self, stamp: Stamp, message: Message) -> Result<Option<Fired>> {
        let mut inbox = self
            .inbox
            .lock()
            .map_err(|_| anyhow!("inbox of {} poisoned", self.name))?;
        match inbox.stamp {
            Some(current) if stamp < current => {
                crate::warning!(
                    "{} dropped stale {} ({}, inbox at {})",
                    self.name,
                    message.describe(),
                    stamp,
                    current
                );
                return Ok(None);
            }
            Some(current) if stamp == current => {}
            _ => inbox.reset(stamp, self.slot_count()),
        }
        if inbox.fired {
            return Err(anyhow!(
                "{} received {} after firing in {}",
                self.name,
                message.describe(),
                stamp
            ));
        }
        match message {
            Message::Data { slot, tensor } | Message::Result { slot, tensor } => {
                let entry = inbox.data.get_mut(slot).ok_or_else(|| {
                    anyhow!("{} has no input slot {}", self.name, slot)
                })?;
                if entry.is_some() {
                    return Err(anyhow!(
                        "duplicate write to input slot {} of {} in {}",
                        slot,
                        self.name,
                        stamp
                    ));
                }
                *entry = Some(tensor);
                inbox.received += 1;
            }
            Message::Control => inbox.control += 1,
            Message::Branch(id) => inbox.branches.push(id),
            Message::Trigger => {
                if !self.expect.is_empty() {
                    return Err(anyhow!("{} has inputs and cannot be triggered", self.name));
                }
                inbox.triggered = true;
            }
        }
        if !self.ready(&inbox)? {
            return Ok(None);
        }
        inbox.fired = true;
        Ok(Some(Fired {
            stamp,
            data: std::mem::take(&mut inbox.data),
            branches: std::mem::take(&mut inbox.branches),
        }))
    }

    fn ready(&self, inbox: &Inbox) -> Result<bool> {
        let expect = &self.expect;
        if expect.is_empty() {
            return Ok(inbox.triggered);
        }
        let variant = if expect.by_branch {
            match inbox.branches.first() {
                Some(branch) => *branch,
                None => return Ok(false),
            }
        } else {
            0
        };
        let (data, control) = match (expect.data.get(variant), expect.control.get(variant)) {
            (Some(data), Some(control)) => (*data, *control),
            _ => {
                return Err(anyhow!(
                    "{} received branch {} but has {} branches",
                    self.name,
                    variant,
                    expect.data.len()
                ))
            }
        };
        if inbox.received > data || inbox.control > control || inbox.branches.len() > expect.branch {
            return Err(anyhow!(
                "{} received more messages than expected: data {}/{}, control {}/{}, branch {}/{}",
                self.name,
                inbox.received,
                data,
                inbox.control,
                control,
                inbox.branches.len(),
                expect.branch
            ));
        }
        Ok(inbox.received == data && inbox.control == control && inbox.branches.len() == expect.branch)
    }
}
