//! Per-deployment frame window.
//!
//! A bounded buffer of preprocessed frames in capture order. Capacity equals
//! the number of frames the model consumes per inference. The window is drained
//! in one piece when a batch is dispatched, so consecutive batches never
//! overlap.

use std::collections::VecDeque;

use crate::frame::Frame;

/// What happens when a frame arrives at a full window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Evict the oldest frame to make room.
    #[default]
    DropOldest,
    /// Refuse the new frame.
    Reject,
}

impl std::str::FromStr for OverflowPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop_oldest" | "drop-oldest" => Ok(OverflowPolicy::DropOldest),
            "reject" => Ok(OverflowPolicy::Reject),
            other => Err(anyhow::anyhow!("unknown overflow policy '{}'", other)),
        }
    }
}

#[derive(Debug)]
pub enum PushOutcome {
    Stored,
    /// Stored after evicting the returned frame.
    Evicted(Frame),
    /// Window full under `OverflowPolicy::Reject`.
    Rejected(Frame),
    /// Sequence is not newer than the last accepted frame.
    OutOfOrder(Frame),
}

#[derive(Debug)]
pub struct FrameWindow {
    frames: VecDeque<Frame>,
    capacity: usize,
    overflow: OverflowPolicy,
    last_sequence: Option<u64>,
}

impl FrameWindow {
    pub fn new(capacity: usize, overflow: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
            overflow,
            last_sequence: None,
        }
    }

    pub fn push(&mut self, frame: Frame) -> PushOutcome {
        if let Some(last) = self.last_sequence {
            if frame.sequence <= last {
                return PushOutcome::OutOfOrder(frame);
            }
        }
        if self.frames.len() < self.capacity {
            self.last_sequence = Some(frame.sequence);
            self.frames.push_back(frame);
            return PushOutcome::Stored;
        }
        match self.overflow {
            OverflowPolicy::Reject => PushOutcome::Rejected(frame),
            OverflowPolicy::DropOldest => {
                let evicted = self.frames.pop_front();
                self.last_sequence = Some(frame.sequence);
                self.frames.push_back(frame);
                match evicted {
                    Some(old) => PushOutcome::Evicted(old),
                    None => PushOutcome::Stored,
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.frames.len() >= self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.frames.len()
    }

    /// Remove every frame, oldest first.
    pub fn drain(&mut self) -> Vec<Frame> {
        self.frames.drain(..).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter()
    }
}
