//! Per-intersection signal state machine.
//!
//! Every approach group of an intersection conflicts with every other, so at
//! most one group is ever non-red. Requests from the optimizer and from
//! operators are advisory: they are queued here and only executed when the
//! transition table allows it. Time only moves through [`SignalStateMachine::tick`].

use log::{debug, error, warn};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

use crate::config::TimingConfig;
use crate::data_structures::{IntersectionId, LightState};
use crate::errors::SignalError;
use crate::global_variables::SIGNAL_CHANGE_HISTORY;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalTimings {
    pub min_green: Duration,
    pub max_green: Duration,
    pub yellow: Duration,
}

impl SignalTimings {
    pub fn from_config(timing: &TimingConfig) -> Self {
        Self {
            min_green: timing.min_green(),
            max_green: timing.max_green(),
            yellow: timing.yellow(),
        }
    }
}

/// A request handed to the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SignalCommand {
    /// Make `group` green, yielding the current green group first.
    Grant { group: usize, emergency: bool },
    /// End the current green through yellow.
    Revoke,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PendingGrant {
    pub group: usize,
    pub emergency: bool,
}

/// Why a light changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChangeReason {
    Granted,
    EmergencyGranted,
    MaxGreenReached,
    Revoked,
    YieldingToGrant,
    EmergencyPreemption,
    YellowElapsed,
    ForcedRed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalChange {
    pub group: usize,
    pub from: LightState,
    pub to: LightState,
    pub at_secs: f64,
    pub reason: ChangeReason,
}

pub struct SignalStateMachine {
    intersection: IntersectionId,
    timings: SignalTimings,
    lights: Vec<LightState>,
    active: Option<usize>,
    clock: Duration,
    phase_started_at: Duration,
    consecutive_green_count: u32,
    pending_grant: Option<PendingGrant>,
    revoke_requested: bool,
    last_green_duration: Option<Duration>,
    history: VecDeque<SignalChange>,
}

impl SignalStateMachine {
    /// All groups start red.
    pub fn new(intersection: IntersectionId, group_count: usize, timings: SignalTimings) -> Self {
        Self {
            intersection,
            timings,
            lights: vec![LightState::Red; group_count],
            active: None,
            clock: Duration::ZERO,
            phase_started_at: Duration::ZERO,
            consecutive_green_count: 0,
            pending_grant: None,
            revoke_requested: false,
            last_green_duration: None,
            history: VecDeque::with_capacity(SIGNAL_CHANGE_HISTORY),
        }
    }

    pub fn intersection(&self) -> IntersectionId {
        self.intersection
    }

    pub fn timings(&self) -> SignalTimings {
        self.timings
    }

    /// New timings apply to the running phase as well.
    pub fn set_timings(&mut self, timings: SignalTimings) {
        self.timings = timings;
        self.advance();
    }

    pub fn lights(&self) -> &[LightState] {
        &self.lights
    }

    pub fn light(&self, group: usize) -> Option<LightState> {
        self.lights.get(group).copied()
    }

    pub fn group_count(&self) -> usize {
        self.lights.len()
    }

    /// The one group that is not red, if any.
    pub fn active_group(&self) -> Option<usize> {
        self.active
    }

    /// Light of the active group, `None` when everything is red.
    pub fn active_light(&self) -> Option<LightState> {
        self.active.map(|g| self.lights[g])
    }

    pub fn clock(&self) -> Duration {
        self.clock
    }

    pub fn phase_started_at(&self) -> Duration {
        self.phase_started_at
    }

    pub fn phase_age(&self) -> Duration {
        self.clock.saturating_sub(self.phase_started_at)
    }

    pub fn consecutive_green_count(&self) -> u32 {
        self.consecutive_green_count
    }

    pub fn pending_grant(&self) -> Option<PendingGrant> {
        self.pending_grant
    }

    pub fn last_green_duration(&self) -> Option<Duration> {
        self.last_green_duration
    }

    pub fn history(&self) -> impl Iterator<Item = &SignalChange> {
        self.history.iter()
    }

    pub fn is_all_red(&self) -> bool {
        self.lights.iter().all(|&l| l == LightState::Red)
    }

    /// True while an emergency grant for some group other than `group` waits.
    fn emergency_preempting(&self, group: usize) -> bool {
        matches!(self.pending_grant, Some(p) if p.emergency && p.group != group)
    }

    fn wants_off(&self, group: usize) -> bool {
        self.revoke_requested || matches!(self.pending_grant, Some(p) if p.group != group)
    }

    fn check_group(&self, group: usize) -> Result<LightState, SignalError> {
        self.light(group).ok_or(SignalError::UnknownGroup {
            intersection: self.intersection,
            group,
        })
    }

    /// Applies one transition if the table allows it at the current time.
    ///
    /// | from   | to     | requires                                         |
    /// |--------|--------|--------------------------------------------------|
    /// | Red    | Green  | every other group red                            |
    /// | Green  | Yellow | min green elapsed, or a conflicting emergency grant |
    /// | Yellow | Red    | yellow time elapsed                              |
    pub fn transition(
        &mut self,
        group: usize,
        to: LightState,
        reason: ChangeReason,
    ) -> Result<(), SignalError> {
        let from = self.check_group(group)?;
        let age = self.phase_age();

        match (from, to) {
            (LightState::Red, LightState::Green) => {
                if let Some(active) = self
                    .lights
                    .iter()
                    .enumerate()
                    .position(|(g, &l)| g != group && l != LightState::Red)
                {
                    return Err(SignalError::ConflictingGreen {
                        intersection: self.intersection,
                        group,
                        active,
                    });
                }
            }
            (LightState::Green, LightState::Yellow) => {
                if age < self.timings.min_green && !self.emergency_preempting(group) {
                    return Err(SignalError::MinGreenNotReached {
                        intersection: self.intersection,
                        group,
                        elapsed_secs: age.as_secs_f64(),
                    });
                }
                self.last_green_duration = Some(age);
            }
            (LightState::Yellow, LightState::Red) => {
                if age < self.timings.yellow {
                    return Err(SignalError::YellowNotFinished {
                        intersection: self.intersection,
                        group,
                        elapsed_secs: age.as_secs_f64(),
                    });
                }
            }
            _ => {
                return Err(SignalError::IllegalTransition {
                    intersection: self.intersection,
                    group,
                    from,
                    to,
                });
            }
        }

        self.lights[group] = to;
        self.phase_started_at = self.clock;
        match to {
            LightState::Green => {
                self.active = Some(group);
                self.consecutive_green_count = 1;
            }
            LightState::Yellow => self.active = Some(group),
            LightState::Red => {
                self.active = None;
                self.consecutive_green_count = 0;
            }
        }
        self.record(group, from, to, reason);
        debug!(
            "Intersection {} group {}: {:?} -> {:?} ({:?})",
            self.intersection, group, from, to, reason
        );
        Ok(())
    }

    fn record(&mut self, group: usize, from: LightState, to: LightState, reason: ChangeReason) {
        if self.history.len() == SIGNAL_CHANGE_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(SignalChange {
            group,
            from,
            to,
            at_secs: self.clock.as_secs_f64(),
            reason,
        });
    }

    /// Queues a request. Rejects unknown groups; everything else waits until
    /// the timing rules allow it.
    pub fn submit(&mut self, command: SignalCommand) -> Result<(), SignalError> {
        match command {
            SignalCommand::Grant { group, emergency } => {
                let light = self.check_group(group)?;
                if let Some(pending) = self.pending_grant {
                    if pending.emergency && !emergency && pending.group != group {
                        debug!(
                            "Intersection {}: grant for group {} ignored, emergency grant for group {} pending",
                            self.intersection, group, pending.group
                        );
                        return Ok(());
                    }
                }
                self.revoke_requested = false;
                if light == LightState::Green {
                    // Renewal of the running green.
                    self.pending_grant = None;
                    self.consecutive_green_count = self.consecutive_green_count.saturating_add(1);
                } else {
                    self.pending_grant = Some(PendingGrant { group, emergency });
                }
            }
            SignalCommand::Revoke => {
                self.pending_grant = None;
                self.revoke_requested = self.active_light() == Some(LightState::Green);
            }
        }
        self.advance();
        Ok(())
    }

    /// Drops any queued grant or revoke.
    pub fn clear_pending(&mut self) {
        self.pending_grant = None;
        self.revoke_requested = false;
    }

    /// Drops the queued grant if it targets `group`. Returns whether one was
    /// dropped.
    pub fn cancel_grant_for(&mut self, group: usize) -> bool {
        match self.pending_grant {
            Some(pending) if pending.group == group => {
                self.pending_grant = None;
                debug!(
                    "Intersection {}: queued grant for group {} cancelled",
                    self.intersection, group
                );
                true
            }
            _ => false,
        }
    }

    /// Advances the clock by `dt`, stopping at every timing boundary so a
    /// green never outlives max green and a yellow lasts exactly its time.
    pub fn tick(&mut self, dt: Duration) {
        let mut remaining = dt;
        self.advance();
        while !remaining.is_zero() {
            let step = match self.next_boundary() {
                Some(boundary) if !boundary.is_zero() && boundary < remaining => boundary,
                _ => remaining,
            };
            self.clock += step;
            remaining -= step;
            self.advance();
        }
    }

    /// Time until the next moment at which `advance` could act.
    fn next_boundary(&self) -> Option<Duration> {
        let group = self.active?;
        let age = self.phase_age();
        match self.lights[group] {
            LightState::Green => {
                let to_max = self.timings.max_green.saturating_sub(age);
                if self.wants_off(group) && !self.emergency_preempting(group) {
                    let to_min = self.timings.min_green.saturating_sub(age);
                    if !to_min.is_zero() {
                        return Some(to_min.min(to_max));
                    }
                }
                Some(to_max)
            }
            LightState::Yellow => Some(self.timings.yellow.saturating_sub(age)),
            LightState::Red => None,
        }
    }

    /// Executes every transition that is due at the current clock.
    fn advance(&mut self) {
        loop {
            let step = match self.active.map(|g| (g, self.lights[g])) {
                Some((group, LightState::Green)) => {
                    let age = self.phase_age();
                    let reason = if age >= self.timings.max_green {
                        Some(ChangeReason::MaxGreenReached)
                    } else if self.wants_off(group) {
                        if self.emergency_preempting(group) && age < self.timings.min_green {
                            Some(ChangeReason::EmergencyPreemption)
                        } else if age >= self.timings.min_green {
                            Some(if self.revoke_requested {
                                ChangeReason::Revoked
                            } else {
                                ChangeReason::YieldingToGrant
                            })
                        } else {
                            None
                        }
                    } else {
                        None
                    };
                    match reason {
                        Some(reason) => {
                            let result = self.transition(group, LightState::Yellow, reason);
                            if result.is_ok() {
                                self.revoke_requested = false;
                            }
                            Some(result)
                        }
                        None => None,
                    }
                }
                Some((group, LightState::Yellow)) => {
                    if self.phase_age() >= self.timings.yellow {
                        Some(self.transition(group, LightState::Red, ChangeReason::YellowElapsed))
                    } else {
                        None
                    }
                }
                Some((_, LightState::Red)) => None,
                None => match self.pending_grant.take() {
                    Some(grant) => {
                        let reason = if grant.emergency {
                            ChangeReason::EmergencyGranted
                        } else {
                            ChangeReason::Granted
                        };
                        Some(self.transition(grant.group, LightState::Green, reason))
                    }
                    None => None,
                },
            };

            match step {
                Some(Ok(())) => continue,
                Some(Err(err)) => {
                    error!("Rejected signal transition: {}", err);
                    break;
                }
                None => break,
            }
        }
    }

    /// Forces every group to red at once. Reserved for shutdown and safety
    /// faults; the only path that skips yellow.
    pub fn force_all_red(&mut self) {
        let was_live: Vec<(usize, LightState)> = self
            .lights
            .iter()
            .enumerate()
            .filter(|(_, &l)| l != LightState::Red)
            .map(|(g, &l)| (g, l))
            .collect();
        if let Some((_, LightState::Green)) = was_live.first() {
            self.last_green_duration = Some(self.phase_age());
        }
        for (group, from) in was_live {
            self.lights[group] = LightState::Red;
            self.record(group, from, LightState::Red, ChangeReason::ForcedRed);
        }
        self.active = None;
        self.clear_pending();
        self.consecutive_green_count = 0;
        self.phase_started_at = self.clock;
        warn!("Intersection {}: all approach groups forced to red", self.intersection);
    }

    /// Checks that at most one group is live and that bookkeeping agrees.
    /// On failure the intersection is forced to red before the fault is
    /// returned.
    pub fn verify_safety(&mut self) -> Result<(), SignalError> {
        let live: Vec<usize> = self
            .lights
            .iter()
            .enumerate()
            .filter(|(_, &l)| l != LightState::Red)
            .map(|(g, _)| g)
            .collect();
        let message = match (live.as_slice(), self.active) {
            ([], None) => return Ok(()),
            ([g], Some(a)) if *g == a => return Ok(()),
            ([_], _) | ([], Some(_)) => format!(
                "active group {:?} disagrees with lights {:?}",
                self.active, self.lights
            ),
            (groups, _) => format!("groups {:?} are simultaneously non-red", groups),
        };
        error!(
            "CRITICAL: intersection {} safety fault: {}",
            self.intersection, message
        );
        self.force_all_red();
        Err(SignalError::SafetyFault {
            intersection: self.intersection,
            message,
        })
    }
}

impl std::fmt::Debug for SignalStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalStateMachine")
            .field("intersection", &self.intersection)
            .field("lights", &self.lights)
            .field("phase_age", &self.phase_age())
            .field("pending_grant", &self.pending_grant)
            .field("revoke_requested", &self.revoke_requested)
            .finish()
    }
}

pub(crate) fn log_rejection(err: &SignalError) {
    if err.is_invariant_violation() {
        error!("Signal request rejected: {}", err);
    } else {
        error!("CRITICAL: {}", err);
    }
}
