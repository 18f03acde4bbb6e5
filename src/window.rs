use nalgebra::Vector3;
use std::collections::VecDeque;

use crate::config::GapPolicy;
use crate::error::DetectorError;
use crate::types::{Frame, FusedFrame};

/// Frames per detection window (about 7.5 s at 20 Hz)
pub const WINDOW_CAPACITY: usize = 150;

/// Fixed-capacity FIFO of alignment buckets.
///
/// Owned by the engine core and only touched under its lock. Appending past
/// capacity evicts the oldest frame.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    frames: VecDeque<Frame>,
    capacity: usize,
    evicted: u64,
}

impl SlidingWindow {
    pub fn new() -> Self {
        Self::with_capacity(WINDOW_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(capacity + 1),
            capacity,
            evicted: 0,
        }
    }

    /// Append a frame, returning the evicted one if capacity was exceeded
    pub fn push(&mut self, frame: Frame) -> Option<Frame> {
        self.frames.push_back(frame);
        if self.frames.len() > self.capacity {
            self.evicted += 1;
            return self.frames.pop_front();
        }
        None
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.frames.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total frames dropped by FIFO eviction since creation
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    pub fn newest(&self) -> Option<&Frame> {
        self.frames.back()
    }

    pub fn oldest(&self) -> Option<&Frame> {
        self.frames.front()
    }

    pub fn get(&self, index: usize) -> Option<&Frame> {
        self.frames.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Frame> {
        self.frames.get_mut(index)
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Frame> + ExactSizeIterator {
        self.frames.iter()
    }

    /// Drop incomplete frames stamped before `cutoff_ms`. Returns how many went.
    pub fn prune_incomplete(&mut self, cutoff_ms: u64) -> usize {
        let before = self.frames.len();
        self.frames
            .retain(|f| f.is_complete() || f.timestamp_ms >= cutoff_ms);
        before - self.frames.len()
    }

    /// Resolve the buffered frames into an evaluable window.
    ///
    /// Returns `None` when the window is not full, or when `RejectFrame` is in
    /// force and any frame is still missing an axis group.
    pub fn snapshot(&self, policy: GapPolicy) -> Option<Window> {
        if !self.is_full() {
            return None;
        }

        let mut fused = Vec::with_capacity(self.frames.len());
        let mut last_accel = Vector3::zeros();
        let mut last_gyro = Vector3::zeros();

        for frame in &self.frames {
            let (accel, gyro) = match policy {
                GapPolicy::ZeroPad => (
                    frame.accel.unwrap_or_else(Vector3::zeros),
                    frame.gyro.unwrap_or_else(Vector3::zeros),
                ),
                GapPolicy::CarryForward => (
                    frame.accel.unwrap_or(last_accel),
                    frame.gyro.unwrap_or(last_gyro),
                ),
                GapPolicy::RejectFrame => match (frame.accel, frame.gyro) {
                    (Some(a), Some(g)) => (a, g),
                    _ => return None,
                },
            };
            last_accel = accel;
            last_gyro = gyro;
            fused.push(FusedFrame::new(frame.timestamp_ms, accel, gyro, frame.speed_kmh));
        }

        Window::try_from(fused).ok()
    }
}

impl Default for SlidingWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Exactly `WINDOW_CAPACITY` fused frames in timestamp order.
///
/// The only way to build one is `TryFrom<Vec<FusedFrame>>`, so feature
/// extraction never sees a short window.
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    frames: Vec<FusedFrame>,
}

impl Window {
    pub fn frames(&self) -> &[FusedFrame] {
        &self.frames
    }

    pub fn first(&self) -> &FusedFrame {
        &self.frames[0]
    }

    pub fn last(&self) -> &FusedFrame {
        &self.frames[WINDOW_CAPACITY - 1]
    }

    pub fn into_frames(self) -> Vec<FusedFrame> {
        self.frames
    }
}

impl TryFrom<Vec<FusedFrame>> for Window {
    type Error = DetectorError;

    fn try_from(frames: Vec<FusedFrame>) -> Result<Self, Self::Error> {
        if frames.len() != WINDOW_CAPACITY {
            return Err(DetectorError::IncompleteWindow {
                expected: WINDOW_CAPACITY,
                actual: frames.len(),
            });
        }
        Ok(Self { frames })
    }
}
