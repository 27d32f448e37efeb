//! Send Queue
//!
//! Holds what is waiting to be transmitted: a device-requested
//! retransmission, the priority lane for out-of-band commands, and the job
//! lane with its cursor. Decides what the engine transmits next.

use crate::protocol::codec::strip_comment;
use crate::protocol::tracker::InFlightLine;
use gcodestream_core::{EngineError, Instruction, Progress, SessionState};
use std::collections::VecDeque;

/// Which lane a line was drawn from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    /// Out-of-band commands (`send_now`, halt, line number sync)
    Priority,
    /// The active job
    Job,
}

/// The next thing to transmit
#[derive(Debug, Clone, PartialEq)]
pub enum QueuedLine {
    /// An instruction that still needs a sequence number
    Fresh {
        /// Instruction to encode
        instruction: Instruction,
        /// Lane it came from
        lane: Lane,
    },
    /// A line the device asked for again; keeps its sequence number
    Retransmit(InFlightLine),
}

/// Priority lane, job lane and retransmission slot
#[derive(Debug, Default)]
pub struct SendQueue {
    retransmit: Option<InFlightLine>,
    priority: VecDeque<Instruction>,
    job: Vec<Instruction>,
    cursor: usize,
    acknowledged: usize,
}

impl SendQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an out-of-band instruction
    ///
    /// Accepted in every state except `Stopping` and `Errored`.
    pub fn enqueue_priority(
        &mut self,
        instruction: Instruction,
        state: SessionState,
    ) -> Result<(), EngineError> {
        if matches!(state, SessionState::Stopping | SessionState::Errored) {
            return Err(EngineError::invalid_state("send_now", state));
        }
        if strip_comment(instruction.text()).is_empty() {
            return Err(EngineError::violation("instruction has no command text"));
        }

        self.priority.push_back(instruction);
        Ok(())
    }

    /// Put an engine-generated instruction at the head of the priority lane
    pub fn push_front_priority(&mut self, instruction: Instruction) {
        self.priority.push_front(instruction);
    }

    /// Replace the job lane
    ///
    /// Only legal while `Online`. Comment-only and blank lines are dropped so
    /// that the job total counts transmittable lines.
    pub fn load_job<I>(&mut self, instructions: I, state: SessionState) -> Result<usize, EngineError>
    where
        I: IntoIterator<Item = Instruction>,
    {
        match state {
            SessionState::Online => {}
            SessionState::Printing | SessionState::Paused | SessionState::Stopping => {
                return Err(EngineError::JobAlreadyActive)
            }
            other => return Err(EngineError::invalid_state("load_job", other)),
        }

        self.job = instructions
            .into_iter()
            .filter(|instruction| !strip_comment(instruction.text()).is_empty())
            .collect();
        self.cursor = 0;
        self.acknowledged = 0;
        Ok(self.job.len())
    }

    /// Next line to transmit under `state`
    ///
    /// Order: pending retransmission, priority lane, then the job lane only
    /// while `Printing`.
    pub fn next(&mut self, state: SessionState) -> Option<QueuedLine> {
        if !state.can_transmit() {
            return None;
        }

        if let Some(line) = self.retransmit.take() {
            return Some(QueuedLine::Retransmit(line));
        }

        if let Some(instruction) = self.priority.pop_front() {
            return Some(QueuedLine::Fresh {
                instruction,
                lane: Lane::Priority,
            });
        }

        if state == SessionState::Printing {
            if let Some(instruction) = self.job.get(self.cursor).cloned() {
                self.cursor += 1;
                return Some(QueuedLine::Fresh {
                    instruction,
                    lane: Lane::Job,
                });
            }
        }

        None
    }

    /// Put a line back for retransmission ahead of both lanes
    pub fn requeue_front(&mut self, line: InFlightLine) {
        self.retransmit = Some(line);
    }

    /// Record an acknowledged line; only job-lane lines count toward progress
    pub fn mark_acknowledged(&mut self, lane: Lane) {
        if lane == Lane::Job {
            self.acknowledged = (self.acknowledged + 1).min(self.job.len());
        }
    }

    /// `(acknowledged job lines, job total)`
    pub fn progress(&self) -> Progress {
        Progress::new(self.acknowledged, self.job.len())
    }

    /// Every job line has been drawn
    pub fn job_drained(&self) -> bool {
        self.cursor >= self.job.len()
    }

    /// Job lines not yet drawn, in order
    pub fn remaining_job(&self) -> &[Instruction] {
        self.job.get(self.cursor..).unwrap_or(&[])
    }

    /// Nothing waiting in the priority lane or retransmission slot
    pub fn priority_empty(&self) -> bool {
        self.priority.is_empty() && self.retransmit.is_none()
    }

    /// Number of queued priority instructions
    pub fn priority_len(&self) -> usize {
        self.priority.len()
    }

    /// Cancel the job lane and any pending retransmission
    pub fn clear_job(&mut self) {
        self.job.clear();
        self.cursor = 0;
        self.acknowledged = 0;
        self.retransmit = None;
    }

    /// Drop everything (disconnect, fatal error)
    pub fn clear_all(&mut self) {
        self.clear_job();
        self.priority.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::LineCodec;

    fn job(lines: &[&str]) -> Vec<Instruction> {
        lines.iter().map(|l| Instruction::new(*l)).collect()
    }

    fn text(line: Option<QueuedLine>) -> Option<String> {
        match line? {
            QueuedLine::Fresh { instruction, .. } => Some(instruction.text().to_string()),
            QueuedLine::Retransmit(line) => Some(line.wire_line.payload),
        }
    }

    #[test]
    fn test_priority_before_job() {
        let mut q = SendQueue::new();
        q.load_job(job(&["G28", "G1 X10"]), SessionState::Online)
            .unwrap();
        q.enqueue_priority(Instruction::new("M105"), SessionState::Printing)
            .unwrap();

        assert_eq!(text(q.next(SessionState::Printing)).as_deref(), Some("M105"));
        assert_eq!(text(q.next(SessionState::Printing)).as_deref(), Some("G28"));
        assert_eq!(text(q.next(SessionState::Printing)).as_deref(), Some("G1 X10"));
        assert!(q.next(SessionState::Printing).is_none());
    }

    #[test]
    fn test_job_lane_only_while_printing() {
        let mut q = SendQueue::new();
        q.load_job(job(&["G28"]), SessionState::Online).unwrap();

        assert!(q.next(SessionState::Online).is_none());
        assert!(q.next(SessionState::Paused).is_none());
        q.enqueue_priority(Instruction::new("M114"), SessionState::Paused)
            .unwrap();
        assert_eq!(text(q.next(SessionState::Paused)).as_deref(), Some("M114"));
        assert_eq!(q.remaining_job().len(), 1);
    }

    #[test]
    fn test_load_job_state_checks() {
        let mut q = SendQueue::new();
        assert!(matches!(
            q.load_job(job(&["G28"]), SessionState::Printing),
            Err(EngineError::JobAlreadyActive)
        ));
        assert!(matches!(
            q.load_job(job(&["G28"]), SessionState::Paused),
            Err(EngineError::JobAlreadyActive)
        ));
        assert!(matches!(
            q.load_job(job(&["G28"]), SessionState::Disconnected),
            Err(EngineError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_load_job_skips_blank_and_comment_lines() {
        let mut q = SendQueue::new();
        let total = q
            .load_job(job(&["; header", "", "G28", "(move)", "G1 X1"]), SessionState::Online)
            .unwrap();
        assert_eq!(total, 2);
        assert_eq!(q.progress(), Progress::new(0, 2));
    }

    #[test]
    fn test_enqueue_priority_rejections() {
        let mut q = SendQueue::new();
        assert!(matches!(
            q.enqueue_priority(Instruction::new("M105"), SessionState::Stopping),
            Err(EngineError::InvalidState { .. })
        ));
        assert!(matches!(
            q.enqueue_priority(Instruction::new("M105"), SessionState::Errored),
            Err(EngineError::InvalidState { .. })
        ));
        assert!(matches!(
            q.enqueue_priority(Instruction::new("  ; nothing"), SessionState::Online),
            Err(EngineError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn test_retransmit_goes_first() {
        let mut q = SendQueue::new();
        q.enqueue_priority(Instruction::new("M105"), SessionState::Online)
            .unwrap();
        let wire = LineCodec::default().encode(4, &Instruction::new("G1 X5"));
        q.requeue_front(InFlightLine::new(wire.clone(), Lane::Job));

        match q.next(SessionState::Online) {
            Some(QueuedLine::Retransmit(line)) => assert_eq!(line.wire_line, wire),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(text(q.next(SessionState::Online)).as_deref(), Some("M105"));
    }

    #[test]
    fn test_progress_counts_only_job_acks() {
        let mut q = SendQueue::new();
        q.load_job(job(&["G28", "G1 X10", "G1 X20"]), SessionState::Online)
            .unwrap();
        q.next(SessionState::Printing);
        q.mark_acknowledged(Lane::Job);
        q.mark_acknowledged(Lane::Priority);
        assert_eq!(q.progress(), Progress::new(1, 3));
        assert!(!q.job_drained());
    }

    #[test]
    fn test_clear_job_keeps_priority() {
        let mut q = SendQueue::new();
        q.load_job(job(&["G28", "G1 X10"]), SessionState::Online)
            .unwrap();
        q.enqueue_priority(Instruction::new("M105"), SessionState::Printing)
            .unwrap();
        q.clear_job();

        assert!(q.job_drained());
        assert_eq!(q.priority_len(), 1);
        q.clear_all();
        assert!(q.priority_empty());
    }
}
