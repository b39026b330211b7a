//! Response-completion detector
//!
//! An endpoint renders its reply incrementally and never says when it is
//! done. The detector infers completion from text stability:
//!
//! ```text
//! Idle ──begin──▶ Observing ──changed──▶ Stabilizing ──held T_stable──▶ Delivered
//!                     │                     │    ▲                          ▲
//!                     │                     └────┘ changed (rearm)          │
//!                     └──────── T_force after first change (forced) ───────┘
//! ```
//!
//! Independently, `T_total` after `begin` the detector makes one last scrape
//! and either delivers that text (`from_timeout`) or reports a timeout.
//!
//! The detector owns no timers and no surface. The agent feeds it
//! [`Observation`]s and wakes it at [`CompletionDetector::next_deadline`],
//! which keeps the algorithm deterministic under test.

use super::Observation;
use crate::config::DetectorConfig;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorPhase {
    Idle,
    /// Prompt written and submitted; passes straight to `Observing`
    Sent,
    Observing,
    Stabilizing,
    Delivered,
}

/// A completed reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub text: String,
    pub forced: bool,
    pub from_timeout: bool,
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectorOutcome {
    Delivered(Delivery),
    /// Nothing usable within the total timeout
    TimedOut,
}

#[derive(Debug)]
pub struct CompletionDetector {
    config: DetectorConfig,
    phase: DetectorPhase,
    /// Candidate text already on the surface at submit; never delivered
    baseline: Option<String>,
    last_seen: Option<String>,
    submitted_at: Option<Instant>,
    stability_deadline: Option<Instant>,
    force_deadline: Option<Instant>,
    sequence: u64,
}

impl CompletionDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            phase: DetectorPhase::Idle,
            baseline: None,
            last_seen: None,
            submitted_at: None,
            stability_deadline: None,
            force_deadline: None,
            sequence: 0,
        }
    }

    pub fn phase(&self) -> DetectorPhase {
        self.phase
    }

    /// Ready to accept a new submission
    pub fn is_idle(&self) -> bool {
        matches!(self.phase, DetectorPhase::Idle | DetectorPhase::Delivered)
    }

    pub fn is_watching(&self) -> bool {
        matches!(
            self.phase,
            DetectorPhase::Observing | DetectorPhase::Stabilizing
        )
    }

    /// Deliveries so far
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Start watching for the reply to a prompt submitted at `now`
    pub fn begin(&mut self, now: Instant, baseline: Option<String>) {
        self.clear();
        self.phase = DetectorPhase::Sent;
        self.baseline = baseline;
        self.submitted_at = Some(now);
        self.phase = DetectorPhase::Observing;
    }

    /// Return to idle, dropping any observation in flight
    pub fn reset(&mut self) {
        self.clear();
        self.phase = DetectorPhase::Idle;
    }

    /// Earliest pending timer, if watching
    pub fn next_deadline(&self) -> Option<Instant> {
        if !self.is_watching() {
            return None;
        }
        let total = self
            .submitted_at
            .map(|at| at + self.config.total_timeout());
        [self.stability_deadline, self.force_deadline, total]
            .into_iter()
            .flatten()
            .min()
    }

    /// Handle a batch of surface mutations
    pub fn on_mutations(&mut self, observation: &Observation, now: Instant) {
        if !self.is_watching() || observation.in_progress {
            return;
        }
        let Some(text) = self.usable(observation.candidate.as_deref()) else {
            return;
        };
        if self.last_seen.as_deref() == Some(text) {
            return;
        }

        tracing::debug!(chars = text.chars().count(), "Reply candidate changed");
        self.last_seen = Some(text.to_string());
        self.phase = DetectorPhase::Stabilizing;
        self.stability_deadline = Some(now + self.config.stability());
        if self.force_deadline.is_none() {
            self.force_deadline = Some(now + self.config.force());
        }
    }

    /// Handle the wake-up at [`next_deadline`](Self::next_deadline)
    pub fn on_timer(&mut self, observation: &Observation, now: Instant) -> Option<DetectorOutcome> {
        if !self.is_watching() {
            return None;
        }

        if self.stability_deadline.is_some_and(|d| now >= d) {
            self.stability_deadline = None;
            let current = if observation.in_progress {
                None
            } else {
                self.usable(observation.candidate.as_deref())
            };
            match current {
                Some(text) if self.last_seen.as_deref() == Some(text) => {
                    let text = text.to_string();
                    return Some(self.deliver(text, false, false));
                }
                // moved since the timer was armed; treat as a fresh mutation
                Some(_) => self.on_mutations(observation, now),
                // still loading or nothing readable; keep waiting on the last text
                None => {
                    if self.last_seen.is_some() {
                        self.stability_deadline = Some(now + self.config.stability());
                    }
                }
            }
        }

        if self.force_deadline.is_some_and(|d| now >= d) {
            self.force_deadline = None;
            let text = self
                .usable(observation.candidate.as_deref())
                .map(str::to_string)
                .or_else(|| self.last_seen.clone());
            if let Some(text) = text {
                tracing::debug!("Force timeout reached, delivering current text");
                return Some(self.deliver(text, true, false));
            }
        }

        let total_deadline = self
            .submitted_at
            .map(|at| at + self.config.total_timeout());
        if total_deadline.is_some_and(|d| now >= d) {
            if let Some(text) = self.usable(observation.candidate.as_deref()) {
                let text = text.to_string();
                tracing::debug!("Total timeout reached, delivering final scrape");
                return Some(self.deliver(text, false, true));
            }
            self.reset();
            return Some(DetectorOutcome::TimedOut);
        }

        None
    }

    /// Candidate text worth considering: long enough and not the reply that
    /// was already on screen before submit
    fn usable<'a>(&self, candidate: Option<&'a str>) -> Option<&'a str> {
        let text = candidate?.trim();
        if text.chars().count() < self.config.min_reply_chars {
            return None;
        }
        if self.baseline.as_deref().map(str::trim) == Some(text) {
            return None;
        }
        Some(text)
    }

    fn deliver(&mut self, text: String, forced: bool, from_timeout: bool) -> DetectorOutcome {
        self.clear();
        self.phase = DetectorPhase::Delivered;
        self.sequence += 1;
        DetectorOutcome::Delivered(Delivery {
            text,
            forced,
            from_timeout,
            sequence: self.sequence,
        })
    }

    fn clear(&mut self) {
        self.baseline = None;
        self.last_seen = None;
        self.submitted_at = None;
        self.stability_deadline = None;
        self.force_deadline = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> DetectorConfig {
        DetectorConfig {
            stability_ms: 1_000,
            force_ms: 5_000,
            total_timeout_ms: 20_000,
            min_reply_chars: 5,
            ..Default::default()
        }
    }

    fn seen(text: &str) -> Observation {
        Observation {
            candidate: Some(text.to_string()),
            in_progress: false,
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    /// Advance to each deadline up to `until`, collecting outcomes
    fn run_timers(
        detector: &mut CompletionDetector,
        observation: &Observation,
        until: Instant,
    ) -> Vec<(Instant, DetectorOutcome)> {
        let mut outcomes = Vec::new();
        while let Some(deadline) = detector.next_deadline() {
            if deadline > until {
                break;
            }
            if let Some(outcome) = detector.on_timer(observation, deadline) {
                outcomes.push((deadline, outcome));
            }
        }
        outcomes
    }

    #[test]
    fn test_stable_reply_delivers_once() {
        let mut detector = CompletionDetector::new(config());
        let t0 = Instant::now();
        detector.begin(t0, None);

        detector.on_mutations(&seen("Hello"), t0 + ms(100));
        detector.on_mutations(&seen("Hello there"), t0 + ms(400));
        detector.on_mutations(&seen("Hello there, friend"), t0 + ms(800));
        assert_eq!(detector.phase(), DetectorPhase::Stabilizing);

        let outcomes = run_timers(&mut detector, &seen("Hello there, friend"), t0 + ms(20_000));
        assert_eq!(outcomes.len(), 1);
        let (at, outcome) = &outcomes[0];
        assert_eq!(*at, t0 + ms(1_800));
        assert_eq!(
            *outcome,
            DetectorOutcome::Delivered(Delivery {
                text: "Hello there, friend".into(),
                forced: false,
                from_timeout: false,
                sequence: 1,
            })
        );
        assert!(detector.is_idle());
        assert!(detector.next_deadline().is_none());
    }

    #[test]
    fn test_continuous_mutation_forces_at_t_force() {
        let mut detector = CompletionDetector::new(config());
        let t0 = Instant::now();
        detector.begin(t0, None);

        let mut outcomes = Vec::new();
        let mut text = String::from("token");
        // a new token every 300ms, forever
        for step in 1..=40u64 {
            let now = t0 + ms(step * 300);
            while let Some(deadline) = detector.next_deadline() {
                if deadline > now {
                    break;
                }
                if let Some(outcome) = detector.on_timer(&seen(&text), deadline) {
                    outcomes.push((deadline, outcome));
                }
            }
            text.push_str(" token");
            detector.on_mutations(&seen(&text), now);
        }

        assert_eq!(outcomes.len(), 1);
        let (at, outcome) = &outcomes[0];
        // first usable change at 300ms arms the force timer
        assert_eq!(*at, t0 + ms(300 + 5_000));
        match outcome {
            DetectorOutcome::Delivered(delivery) => {
                assert!(delivery.forced);
                assert!(!delivery.from_timeout);
                assert!(delivery.text.starts_with("token token"));
            }
            other => panic!("expected delivery, got {:?}", other),
        }
    }

    #[test]
    fn test_fragments_and_in_progress_are_ignored() {
        let mut detector = CompletionDetector::new(config());
        let t0 = Instant::now();
        detector.begin(t0, None);

        detector.on_mutations(&seen("Hi"), t0 + ms(10));
        assert_eq!(detector.phase(), DetectorPhase::Observing);

        detector.on_mutations(
            &Observation {
                candidate: Some("Long enough".into()),
                in_progress: true,
            },
            t0 + ms(20),
        );
        assert_eq!(detector.phase(), DetectorPhase::Observing);
        // only the total timeout is pending
        assert_eq!(detector.next_deadline(), Some(t0 + ms(20_000)));
    }

    #[test]
    fn test_baseline_reply_is_never_delivered() {
        let mut detector = CompletionDetector::new(config());
        let t0 = Instant::now();
        detector.begin(t0, Some("previous answer".into()));

        detector.on_mutations(&seen("previous answer"), t0 + ms(10));
        assert_eq!(detector.phase(), DetectorPhase::Observing);

        let outcomes = run_timers(&mut detector, &seen("previous answer"), t0 + ms(30_000));
        assert_eq!(outcomes, vec![(t0 + ms(20_000), DetectorOutcome::TimedOut)]);
        assert_eq!(detector.phase(), DetectorPhase::Idle);
    }

    #[test]
    fn test_total_timeout_final_scrape() {
        let mut detector = CompletionDetector::new(config());
        let t0 = Instant::now();
        detector.begin(t0, None);

        // the reply shows up but the loading indicator never clears
        let streaming = Observation {
            candidate: Some("late reply text".into()),
            in_progress: true,
        };
        detector.on_mutations(&streaming, t0 + ms(100));

        let outcomes = run_timers(&mut detector, &streaming, t0 + ms(30_000));
        assert_eq!(outcomes.len(), 1);
        match &outcomes[0] {
            (at, DetectorOutcome::Delivered(delivery)) => {
                assert_eq!(*at, t0 + ms(20_000));
                assert_eq!(delivery.text, "late reply text");
                assert!(delivery.from_timeout);
                assert!(!delivery.forced);
            }
            other => panic!("expected final scrape, got {:?}", other),
        }
    }

    #[test]
    fn test_stability_timer_after_change_rearms() {
        let mut detector = CompletionDetector::new(config());
        let t0 = Instant::now();
        detector.begin(t0, None);
        detector.on_mutations(&seen("first draft"), t0);

        // text moved without a mutation batch reaching us
        let outcome = detector.on_timer(&seen("second draft"), t0 + ms(1_000));
        assert!(outcome.is_none());
        assert_eq!(detector.phase(), DetectorPhase::Stabilizing);
        assert_eq!(detector.next_deadline(), Some(t0 + ms(2_000)));
    }

    #[test]
    fn test_stability_timer_while_loading_rearms() {
        let mut detector = CompletionDetector::new(config());
        let t0 = Instant::now();
        detector.begin(t0, None);
        detector.on_mutations(&seen("final answer"), t0);

        let loading = Observation {
            candidate: Some("final answer".into()),
            in_progress: true,
        };
        assert!(detector.on_timer(&loading, t0 + ms(1_000)).is_none());
        assert_eq!(detector.phase(), DetectorPhase::Stabilizing);
        assert_eq!(detector.next_deadline(), Some(t0 + ms(2_000)));

        // indicator clears with the same text; no new mutation is recorded
        detector.on_mutations(&seen("final answer"), t0 + ms(1_200));
        let outcomes = run_timers(&mut detector, &seen("final answer"), t0 + ms(20_000));
        assert_eq!(
            outcomes,
            vec![(
                t0 + ms(2_000),
                DetectorOutcome::Delivered(Delivery {
                    text: "final answer".into(),
                    forced: false,
                    from_timeout: false,
                    sequence: 1,
                })
            )]
        );
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut detector = CompletionDetector::new(config());
        let t0 = Instant::now();
        detector.begin(t0, None);
        detector.on_mutations(&seen("some reply"), t0);

        detector.reset();
        assert_eq!(detector.phase(), DetectorPhase::Idle);
        assert!(detector.next_deadline().is_none());
        assert!(detector.on_timer(&seen("some reply"), t0 + ms(60_000)).is_none());
    }

    #[test]
    fn test_sequence_increments_per_delivery() {
        let mut detector = CompletionDetector::new(config());
        let t0 = Instant::now();

        for (round, text) in ["reply one", "reply two"].iter().enumerate() {
            let start = t0 + ms(round as u64 * 10_000);
            detector.begin(start, None);
            detector.on_mutations(&seen(text), start);
            let outcomes = run_timers(&mut detector, &seen(text), start + ms(5_000));
            match &outcomes[..] {
                [(_, DetectorOutcome::Delivered(d))] => assert_eq!(d.sequence, round as u64 + 1),
                other => panic!("unexpected outcomes {:?}", other),
            }
        }
        assert_eq!(detector.sequence(), 2);
    }
}
