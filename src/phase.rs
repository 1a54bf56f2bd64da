use std::sync::atomic::{AtomicU8, Ordering};

/// The run's two-phase state machine plus its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Calibrating = 0,
    Running = 1,
    Stopping = 2,
}

impl Phase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Calibrating,
            1 => Self::Running,
            _ => Self::Stopping,
        }
    }
}

/// Single-writer, multi-reader atomic cell. Readers tolerate stale reads
/// by a few packets, which is fine for cadence decisions.
#[derive(Debug)]
pub struct PhaseCell(AtomicU8);

impl PhaseCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(Phase::Calibrating as u8))
    }

    pub fn load(&self) -> Phase {
        Phase::from_u8(self.0.load(Ordering::Relaxed))
    }

    pub fn store(&self, phase: Phase) {
        self.0.store(phase as u8, Ordering::Relaxed);
    }
}

impl Default for PhaseCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_calibrating_and_transitions() {
        let cell = PhaseCell::new();
        assert_eq!(cell.load(), Phase::Calibrating);
        cell.store(Phase::Running);
        assert_eq!(cell.load(), Phase::Running);
        cell.store(Phase::Stopping);
        assert_eq!(cell.load(), Phase::Stopping);
    }
}
