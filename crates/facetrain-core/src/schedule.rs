//! Inverse-time learning rate decay, one counter per parameter group.
//!
//! Formula: `lr(step) = base_lr / (1 + step * decay_rate)`
//!
//! The rate is a pure function of the step counter, so a run can be replayed
//! from a recorded step count. Counters start at 0 and are advanced once per
//! optimization step; batches that were skipped never advance them.

use crate::error::CoreError;

/// Learning rate scheduler trait
pub trait LRScheduler {
    /// Get the current learning rate
    fn get_lr(&self) -> f64;

    /// Advance by one optimization step
    fn step(&mut self);
}

/// The fixed constants of the decay curve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InverseTimeDecay {
    base_lr: f64,
    decay_rate: f64,
}

impl InverseTimeDecay {
    pub fn new(base_lr: f64, decay_rate: f64) -> Result<Self, CoreError> {
        if !base_lr.is_finite() || base_lr <= 0.0 {
            return Err(CoreError::config(format!(
                "base learning rate must be positive, got {base_lr}"
            )));
        }
        if !decay_rate.is_finite() || decay_rate < 0.0 {
            return Err(CoreError::config(format!(
                "learning rate decay must be non-negative, got {decay_rate}"
            )));
        }
        Ok(Self { base_lr, decay_rate })
    }

    pub fn base_lr(&self) -> f64 {
        self.base_lr
    }

    pub fn decay_rate(&self) -> f64 {
        self.decay_rate
    }

    /// Learning rate after `step` optimization steps.
    pub fn lr_at(&self, step: u64) -> f64 {
        self.base_lr / (1.0 + step as f64 * self.decay_rate)
    }
}

/// Step counter of one parameter group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleState {
    step: u64,
}

impl ScheduleState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step_count(&self) -> u64 {
        self.step
    }

    /// Increment the counter and return the new value.
    pub fn advance(&mut self) -> u64 {
        self.step += 1;
        self.step
    }
}

/// Decay curve plus the counter of a single parameter group.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroupSchedule {
    decay: InverseTimeDecay,
    state: ScheduleState,
}

impl GroupSchedule {
    pub fn new(decay: InverseTimeDecay) -> Self {
        Self { decay, state: ScheduleState::new() }
    }

    pub fn state(&self) -> ScheduleState {
        self.state
    }
}

impl LRScheduler for GroupSchedule {
    fn get_lr(&self) -> f64 {
        self.decay.lr_at(self.state.step_count())
    }

    fn step(&mut self) {
        self.state.advance();
    }
}

/// One independent [`GroupSchedule`] per optimizer parameter group.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamGroupSchedules {
    groups: Vec<GroupSchedule>,
}

impl ParamGroupSchedules {
    pub fn new(decay: InverseTimeDecay, groups: usize) -> Self {
        Self {
            groups: vec![GroupSchedule::new(decay); groups],
        }
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn group(&self, index: usize) -> Option<&GroupSchedule> {
        self.groups.get(index)
    }

    pub fn group_mut(&mut self, index: usize) -> Option<&mut GroupSchedule> {
        self.groups.get_mut(index)
    }

    /// Current rate of every group, in group order.
    pub fn learning_rates(&self) -> Vec<f64> {
        self.groups.iter().map(LRScheduler::get_lr).collect()
    }

    /// Advance every group by one step.
    pub fn step_all(&mut self) {
        for group in &mut self.groups {
            group.step();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_decay_is_constant() {
        let mut sched = GroupSchedule::new(InverseTimeDecay::new(0.1, 0.0).unwrap());
        for _ in 0..1000 {
            assert_eq!(sched.get_lr(), 0.1);
            sched.step();
        }
    }

    #[test]
    fn test_exact_formula() {
        let decay = InverseTimeDecay::new(0.1, 1e-4).unwrap();
        let mut sched = GroupSchedule::new(decay);
        for step in 0..50u64 {
            assert_eq!(sched.get_lr(), 0.1 / (1.0 + step as f64 * 1e-4));
            sched.step();
        }
        assert_eq!(sched.state().step_count(), 50);
    }

    #[test]
    fn test_strictly_decreasing() {
        let mut sched = GroupSchedule::new(InverseTimeDecay::new(0.5, 0.01).unwrap());
        let mut prev = sched.get_lr();
        for _ in 0..500 {
            sched.step();
            let lr = sched.get_lr();
            assert!(lr < prev, "{lr} !< {prev}");
            assert!(lr > 0.0);
            prev = lr;
        }
    }

    #[test]
    fn test_first_step_value() {
        let mut sched = GroupSchedule::new(InverseTimeDecay::new(1.0, 0.5).unwrap());
        assert_eq!(sched.get_lr(), 1.0);
        sched.step();
        assert!((sched.get_lr() - 1.0 / 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_groups_are_independent() {
        let decay = InverseTimeDecay::new(0.1, 0.1).unwrap();
        let mut groups = ParamGroupSchedules::new(decay, 2);
        groups.step_all();
        groups.group_mut(1).unwrap().step();

        assert_eq!(groups.group(0).unwrap().state().step_count(), 1);
        assert_eq!(groups.group(1).unwrap().state().step_count(), 2);
        assert_eq!(groups.learning_rates(), vec![decay.lr_at(1), decay.lr_at(2)]);
    }

    #[test]
    fn test_replay_from_step_count() {
        let decay = InverseTimeDecay::new(0.1, 1e-3).unwrap();
        let mut sched = GroupSchedule::new(decay);
        for _ in 0..123 {
            sched.step();
        }
        assert_eq!(sched.get_lr(), decay.lr_at(123));
    }

    #[test]
    fn test_rejects_negative_decay() {
        assert!(InverseTimeDecay::new(0.1, -1e-4).is_err());
        assert!(InverseTimeDecay::new(0.1, f64::NAN).is_err());
        assert!(InverseTimeDecay::new(0.0, 0.0).is_err());
    }
}
