//! Multi-stage bitmask triggers.
//!
//! A trigger is an ordered chain of stages. Each stage is a `(mask, value)`
//! pair and matches a sample when `sample & mask == value`. The chain fires
//! once every stage has matched, in order, on consecutive samples.

use crate::device::{Probe, ProbeKind};
use crate::error::{LabError, Result};

/// Trigger characters a probe accepts.
pub const TRIGGER_TYPES: &str = "01";

/// Widest sample the matcher handles.
pub const MAX_CHANNELS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitState {
    High,
    Low,
    DontCare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TriggerStage {
    pub mask: u16,
    pub value: u16,
}

impl TriggerStage {
    pub fn new(mask: u16, value: u16) -> Self {
        Self {
            mask,
            value: value & mask,
        }
    }

    pub fn matches(&self, sample: u16) -> bool {
        sample & self.mask == self.value
    }

    fn from_bits(bit_states: &[BitState; MAX_CHANNELS]) -> Self {
        let mut mask = 0u16;
        let mut value = 0u16;
        for (i, state) in bit_states.iter().enumerate() {
            if *state != BitState::DontCare {
                mask |= 1 << i;
            }
            if *state == BitState::High {
                value |= 1 << i;
            }
        }
        Self { mask, value }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Trigger {
    stages: Vec<TriggerStage>,
}

impl Trigger {
    /// A stage with an empty mask ends the chain; it and everything after
    /// it are dropped.
    pub fn new(mut stages: Vec<TriggerStage>) -> Self {
        if let Some(end) = stages.iter().position(|s| s.mask == 0) {
            stages.truncate(end);
        }
        Self { stages }
    }

    /// Start building a trigger, one stage at a time.
    pub fn start_capturing_when() -> StageBuilder {
        StageBuilder::new()
    }

    /// Build the trigger described by the probes' trigger strings: character
    /// `n` of a probe's string is that probe's condition in stage `n`.
    ///
    /// Disabled and analog probes are ignored. Returns `None` when no probe
    /// carries a trigger.
    pub fn from_probes(probes: &[Probe], max_stages: usize) -> Result<Option<Self>> {
        let mut stages: Vec<TriggerStage> = Vec::new();
        for probe in probes {
            if !probe.enabled || probe.kind != ProbeKind::Logic {
                continue;
            }
            let Some(trigger) = probe.trigger.as_deref() else {
                continue;
            };
            if probe.index >= MAX_CHANNELS {
                return Err(LabError::argument(format!(
                    "probe {} cannot carry a trigger",
                    probe.index
                )));
            }
            let bit = 1u16 << probe.index;
            for (stage, tc) in trigger.chars().enumerate() {
                if stage >= max_stages {
                    return Err(LabError::argument(format!(
                        "probe {} trigger '{trigger}' has more than {max_stages} stages",
                        probe.index
                    )));
                }
                if stages.len() <= stage {
                    stages.resize(stage + 1, TriggerStage::default());
                }
                match tc {
                    '1' => {
                        stages[stage].mask |= bit;
                        stages[stage].value |= bit;
                    }
                    '0' => stages[stage].mask |= bit,
                    other => {
                        return Err(LabError::argument(format!(
                            "unsupported trigger type '{other}' on probe {}",
                            probe.index
                        )))
                    }
                }
            }
        }
        Ok((!stages.is_empty()).then(|| Self::new(stages)))
    }

    pub fn stages(&self) -> &[TriggerStage] {
        &self.stages
    }

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// Builder for [`Trigger`]. Set the bits of the current stage, then call
/// [`StageBuilder::then`] to open the next one.
#[derive(Debug)]
pub struct StageBuilder {
    bit_states: [BitState; MAX_CHANNELS],
    stages: Vec<TriggerStage>,
    out_of_range: Option<usize>,
}

impl StageBuilder {
    pub fn new() -> Self {
        Self {
            bit_states: [BitState::DontCare; MAX_CHANNELS],
            stages: Vec::new(),
            out_of_range: None,
        }
    }

    pub fn bit(mut self, bit: usize, state: BitState) -> Self {
        match self.bit_states.get_mut(bit) {
            Some(slot) => *slot = state,
            None => {
                self.out_of_range.get_or_insert(bit);
            }
        }
        self
    }

    pub fn high(self, bit: usize) -> Self {
        self.bit(bit, BitState::High)
    }

    pub fn low(self, bit: usize) -> Self {
        self.bit(bit, BitState::Low)
    }

    /// Close the current stage and start the next. A stage with no bits
    /// set is skipped.
    pub fn then(mut self) -> Self {
        if self.bit_states.iter().any(|s| *s != BitState::DontCare) {
            self.stages.push(TriggerStage::from_bits(&self.bit_states));
        }
        self.bit_states = [BitState::DontCare; MAX_CHANNELS];
        self
    }

    pub fn build(mut self) -> Result<Trigger> {
        if let Some(bit) = self.out_of_range {
            return Err(LabError::argument(format!(
                "bit index {bit} out of range, must be below {MAX_CHANNELS}"
            )));
        }
        if self.bit_states.iter().any(|s| *s != BitState::DontCare) {
            self.stages.push(TriggerStage::from_bits(&self.bit_states));
        }
        Ok(Trigger::new(self.stages))
    }
}

impl Default for StageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatcherState {
    /// Waiting for the given stage to match.
    Searching { stage: usize },
    /// Fired. Every later sample is payload.
    Fired,
}

/// Streaming matcher. Keeps its stage across buffers; once fired it stays
/// fired for the rest of the run.
#[derive(Debug, Clone)]
pub struct TriggerMatcher {
    stages: Vec<TriggerStage>,
    state: MatcherState,
    matched: Vec<u16>,
}

impl TriggerMatcher {
    /// Armed at stage 0 for a non-empty trigger, already fired otherwise.
    pub fn new(trigger: Option<&Trigger>) -> Self {
        let stages = trigger.map(|t| t.stages.clone()).unwrap_or_default();
        let state = if stages.is_empty() {
            MatcherState::Fired
        } else {
            MatcherState::Searching { stage: 0 }
        };
        Self {
            stages,
            state,
            matched: Vec::new(),
        }
    }

    pub fn state(&self) -> MatcherState {
        self.state
    }

    pub fn is_fired(&self) -> bool {
        self.state == MatcherState::Fired
    }

    /// Feed one buffer of samples while searching. Returns the offset just
    /// past the sample that completed the chain when the trigger fires in
    /// this buffer, `None` otherwise (and always `None` once fired).
    ///
    /// After a partial match breaks, scanning resumes one sample after the
    /// sample that started it, so overlapping patterns are found. The resume
    /// point never goes back past the start of `samples`.
    pub fn scan(&mut self, samples: &[u16]) -> Option<usize> {
        let MatcherState::Searching { mut stage } = self.state else {
            return None;
        };

        let len = samples.len() as isize;
        let mut i: isize = 0;
        while i < len {
            let sample = samples[i as usize];
            if self.stages[stage].matches(sample) {
                self.matched.truncate(stage);
                self.matched.push(sample);
                stage += 1;
                if stage == self.stages.len() {
                    self.state = MatcherState::Fired;
                    return Some(i as usize + 1);
                }
            } else if stage > 0 {
                i -= stage as isize;
                if i < -1 {
                    i = -1;
                }
                stage = 0;
            }
            i += 1;
        }
        self.state = MatcherState::Searching { stage };
        None
    }

    /// The samples that matched each stage, valid once fired.
    pub fn matched(&self) -> &[u16] {
        &self.matched
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_bit_pattern(values: &[u16]) -> Trigger {
        Trigger::new(values.iter().map(|v| TriggerStage::new(0x01, *v)).collect())
    }

    #[test]
    fn test_overlapping_partial_match_is_found() {
        let trigger = one_bit_pattern(&[0, 0, 0, 1]);
        let mut m = TriggerMatcher::new(Some(&trigger));
        // Fires on index 4, so the payload starts at offset 5.
        assert_eq!(m.scan(&[0, 0, 0, 0, 1]), Some(5));
        assert!(m.is_fired());
        assert_eq!(m.matched(), &[0, 0, 0, 1]);
    }

    #[test]
    fn test_no_trigger_starts_fired() {
        let m = TriggerMatcher::new(None);
        assert!(m.is_fired());
        let m = TriggerMatcher::new(Some(&Trigger::default()));
        assert_eq!(m.state(), MatcherState::Fired);
    }

    #[test]
    fn test_single_stage() {
        let trigger = Trigger::new(vec![TriggerStage::new(0x01, 0x01)]);
        let mut m = TriggerMatcher::new(Some(&trigger));
        let mut buf = vec![0x00u16; 20];
        buf.push(0xff);
        buf.extend([0xaa; 10]);
        assert_eq!(m.scan(&buf), Some(21));
        assert_eq!(m.matched(), &[0xff]);
    }

    #[test]
    fn test_stage_carries_across_buffers() {
        let trigger = one_bit_pattern(&[1, 0, 1]);
        let mut m = TriggerMatcher::new(Some(&trigger));
        assert_eq!(m.scan(&[0, 0, 1]), None);
        assert_eq!(m.state(), MatcherState::Searching { stage: 1 });
        assert_eq!(m.scan(&[0, 1, 1]), Some(2));
        assert_eq!(m.matched(), &[1, 0, 1]);
    }

    #[test]
    fn test_rewind_clamps_to_buffer_start() {
        let trigger = one_bit_pattern(&[1, 1, 0]);
        let mut m = TriggerMatcher::new(Some(&trigger));
        assert_eq!(m.scan(&[0, 1, 1]), None);
        // The partial match began in the previous buffer; the rescan starts
        // at this buffer's first sample.
        assert_eq!(m.scan(&[1, 1, 0]), Some(3));
    }

    #[test]
    fn test_scan_after_fire_is_noop() {
        let trigger = one_bit_pattern(&[1]);
        let mut m = TriggerMatcher::new(Some(&trigger));
        assert_eq!(m.scan(&[1]), Some(1));
        assert_eq!(m.scan(&[1, 1]), None);
    }

    #[test]
    fn test_builder_stages() {
        let trigger = Trigger::start_capturing_when()
            .high(0)
            .low(1)
            .then()
            .high(1)
            .build()
            .unwrap();
        assert_eq!(
            trigger.stages(),
            &[TriggerStage::new(0b11, 0b01), TriggerStage::new(0b10, 0b10)]
        );
    }

    #[test]
    fn test_empty_stage_ends_the_chain() {
        let trigger = Trigger::start_capturing_when().high(0).then().then().low(1).build().unwrap();
        assert_eq!(
            trigger.stages(),
            &[TriggerStage::new(0x01, 0x01), TriggerStage::new(0x02, 0x00)]
        );

        let trigger = Trigger::new(vec![
            TriggerStage::new(0x01, 0x01),
            TriggerStage::new(0, 0),
            TriggerStage::new(0x02, 0x02),
        ]);
        assert_eq!(trigger.num_stages(), 1);

        let mut m = TriggerMatcher::new(Some(&Trigger::new(vec![TriggerStage::new(0, 0)])));
        assert!(m.is_fired());
        assert_eq!(m.scan(&[0, 1]), None);
    }

    #[test]
    fn test_builder_rejects_out_of_range_bit() {
        assert!(Trigger::start_capturing_when().high(16).build().is_err());
    }

    #[test]
    fn test_from_probes() {
        let mut probes = Probe::logic_set(8);
        probes[0].trigger = Some("01".into());
        probes[2].trigger = Some("1".into());
        probes[3].trigger = Some("1".into());
        probes[3].enabled = false;
        let trigger = Trigger::from_probes(&probes, 4).unwrap().unwrap();
        assert_eq!(
            trigger.stages(),
            &[TriggerStage::new(0b101, 0b100), TriggerStage::new(0b001, 0b001)]
        );
        assert!(Trigger::from_probes(&Probe::logic_set(8), 4).unwrap().is_none());
    }

    #[test]
    fn test_from_probes_rejects_bad_input() {
        let mut probes = Probe::logic_set(2);
        probes[0].trigger = Some("0r".into());
        assert!(Trigger::from_probes(&probes, 4).is_err());
        probes[0].trigger = Some("01010".into());
        assert!(Trigger::from_probes(&probes, 4).is_err());
    }
}
