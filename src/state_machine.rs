//! Temporal seat state machine.
//!
//! Consumes per-seat observations in timestamp order and keeps one
//! `SeatTemporalState` per seat. Each update yields a snapshot, plus an event
//! on status transitions and an alert when an object has occupied the seat
//! without a person for longer than the anomaly threshold.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::observation::{OccupancyState, SeatFrameObservation};

pub const DEFAULT_ANOMALY_THRESHOLD_SECS: f64 = 120.0;
pub const ALERT_TYPE_ANOMALY: &str = "AnomalyOccupied";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SeatStatus {
    #[default]
    Unseated,
    Seated,
    AnomalyOccupied,
}

impl SeatStatus {
    /// Label used in stored events and snapshots.
    pub fn label(&self) -> &'static str {
        match self {
            SeatStatus::Seated => "Seated",
            SeatStatus::Unseated => "Unseated",
            SeatStatus::AnomalyOccupied => "Anomaly",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "Seated" => Some(SeatStatus::Seated),
            "Unseated" => Some(SeatStatus::Unseated),
            "Anomaly" => Some(SeatStatus::AnomalyOccupied),
            _ => None,
        }
    }
}

impl fmt::Display for SeatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// When anomaly alerts fire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertPolicy {
    /// One alert per anomaly episode. Re-armed when a person appears or the
    /// seat goes free.
    #[default]
    OncePerEpisode,
    /// An alert on every observation while the seat stays anomalous.
    EveryFrame,
}

impl FromStr for AlertPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "once_per_episode" | "once" => Ok(AlertPolicy::OncePerEpisode),
            "every_frame" | "every" => Ok(AlertPolicy::EveryFrame),
            other => Err(anyhow!(
                "unknown alert policy '{}' (expected once_per_episode or every_frame)",
                other
            )),
        }
    }
}

/// Mutable per-seat state, owned by the machine.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SeatTemporalState {
    pub current_status: SeatStatus,
    /// Time spent continuously in `current_status`.
    pub status_duration_sec: f64,
    /// Time `OBJECT_ONLY` has persisted without a person.
    pub anomaly_accum_sec: f64,
    pub last_seen_ts_ms: i64,
    /// An alert already fired in the current anomaly episode.
    pub alerted: bool,
    /// Alerts issued so far for this seat.
    pub alert_seq: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SeatEvent {
    pub seat_id: u32,
    pub new_status: SeatStatus,
    pub timestamp_ms: i64,
    /// How long the status that just ended lasted (0 on first observation).
    pub duration_sec: f64,
    /// Clock of the new status at the time of the transition.
    pub status_duration_sec: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SeatAlert {
    pub alert_id: String,
    pub seat_id: u32,
    pub alert_type: String,
    pub description: String,
    pub timestamp_ms: i64,
    pub anomaly_secs: f64,
    pub is_processed: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SeatSnapshot {
    pub timestamp_ms: i64,
    pub seat_id: u32,
    pub status: SeatStatus,
    pub person_count: u32,
}

/// Side effects of one observation.
#[derive(Clone, Debug, PartialEq)]
pub struct SeatUpdate {
    pub event: Option<SeatEvent>,
    pub alert: Option<SeatAlert>,
    pub snapshot: SeatSnapshot,
}

impl SeatUpdate {
    /// Worth persisting: something changed, alerted, or the seat is not free.
    pub fn needs_store(&self) -> bool {
        self.event.is_some() || self.alert.is_some() || self.snapshot.status != SeatStatus::Unseated
    }
}

/// Serializable copy of every seat's state, for resuming long runs.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineCheckpoint {
    pub seats: BTreeMap<u32, SeatTemporalState>,
}

#[derive(Clone, Debug)]
pub struct OccupancyStateMachine {
    states: BTreeMap<u32, SeatTemporalState>,
    anomaly_threshold_secs: f64,
    policy: AlertPolicy,
}

impl Default for OccupancyStateMachine {
    fn default() -> Self {
        Self::new(DEFAULT_ANOMALY_THRESHOLD_SECS, AlertPolicy::default())
    }
}

impl OccupancyStateMachine {
    pub fn new(anomaly_threshold_secs: f64, policy: AlertPolicy) -> Self {
        Self {
            states: BTreeMap::new(),
            anomaly_threshold_secs,
            policy,
        }
    }

    pub fn policy(&self) -> AlertPolicy {
        self.policy
    }

    pub fn state(&self, seat_id: u32) -> Option<&SeatTemporalState> {
        self.states.get(&seat_id)
    }

    pub fn seat_count(&self) -> usize {
        self.states.len()
    }

    /// Apply one observation. Observations for a seat must arrive in
    /// non-decreasing timestamp order; earlier timestamps count as zero elapsed.
    pub fn update(&mut self, obs: &SeatFrameObservation) -> SeatUpdate {
        let first_seen = !self.states.contains_key(&obs.seat_id);
        let state = self.states.entry(obs.seat_id).or_default();
        let time_diff_sec = if first_seen {
            0.0
        } else {
            (obs.timestamp_ms.saturating_sub(state.last_seen_ts_ms) as f64 / 1000.0).max(0.0)
        };

        let mut alert = None;
        let resolved = match obs.occupancy_state {
            OccupancyState::Person => {
                state.anomaly_accum_sec = 0.0;
                state.alerted = false;
                SeatStatus::Seated
            }
            OccupancyState::ObjectOnly => {
                state.anomaly_accum_sec += time_diff_sec;
                if state.anomaly_accum_sec >= self.anomaly_threshold_secs {
                    let fire = match self.policy {
                        AlertPolicy::EveryFrame => true,
                        AlertPolicy::OncePerEpisode => !state.alerted,
                    };
                    if fire {
                        alert = Some(build_alert(obs, state));
                    }
                    SeatStatus::AnomalyOccupied
                } else {
                    SeatStatus::Unseated
                }
            }
            OccupancyState::Free => {
                state.anomaly_accum_sec = 0.0;
                state.alerted = false;
                SeatStatus::Unseated
            }
        };

        let previous_status = state.current_status;
        let previous_duration = state.status_duration_sec;
        let changed = first_seen || resolved != previous_status;
        state.status_duration_sec = if changed {
            time_diff_sec
        } else {
            previous_duration + time_diff_sec
        };

        let event = changed.then(|| SeatEvent {
            seat_id: obs.seat_id,
            new_status: resolved,
            timestamp_ms: obs.timestamp_ms,
            duration_sec: if first_seen { 0.0 } else { previous_duration },
            status_duration_sec: state.status_duration_sec,
        });

        state.current_status = resolved;
        state.last_seen_ts_ms = obs.timestamp_ms;

        if let Some(ev) = &event {
            log::debug!(
                "seat {} -> {} at {} (previous lasted {:.1}s)",
                ev.seat_id,
                ev.new_status,
                ev.timestamp_ms,
                ev.duration_sec
            );
        }

        SeatUpdate {
            event,
            alert,
            snapshot: SeatSnapshot {
                timestamp_ms: obs.timestamp_ms,
                seat_id: obs.seat_id,
                status: resolved,
                person_count: obs.person_count() as u32,
            },
        }
    }

    /// Apply one frame's observations in order.
    pub fn update_frame(&mut self, observations: &[SeatFrameObservation]) -> Vec<SeatUpdate> {
        observations.iter().map(|obs| self.update(obs)).collect()
    }

    pub fn checkpoint(&self) -> MachineCheckpoint {
        MachineCheckpoint {
            seats: self.states.clone(),
        }
    }

    /// Replace all seat state with a checkpoint.
    pub fn restore(&mut self, checkpoint: MachineCheckpoint) {
        self.states = checkpoint.seats;
    }
}

fn build_alert(obs: &SeatFrameObservation, state: &mut SeatTemporalState) -> SeatAlert {
    state.alerted = true;
    state.alert_seq += 1;
    let alert = SeatAlert {
        alert_id: format!("{}_{}_{}", obs.seat_id, obs.timestamp_ms, state.alert_seq),
        seat_id: obs.seat_id,
        alert_type: ALERT_TYPE_ANOMALY.to_string(),
        description: format!(
            "seat {} occupied by objects without a person for {:.0}s",
            obs.seat_id, state.anomaly_accum_sec
        ),
        timestamp_ms: obs.timestamp_ms,
        anomaly_secs: state.anomaly_accum_sec,
        is_processed: false,
    };
    log::warn!("{}", alert.description);
    alert
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(seat_id: u32, t_sec: i64, state: OccupancyState) -> SeatFrameObservation {
        SeatFrameObservation {
            seat_id,
            frame_index: t_sec as u64,
            timestamp_ms: t_sec * 1000,
            person_boxes: Vec::new(),
            object_boxes: Vec::new(),
            has_person: state == OccupancyState::Person,
            has_object: state == OccupancyState::ObjectOnly,
            person_conf_max: 0.0,
            object_conf_max: 0.0,
            foreground_ratio: 0.0,
            occupancy_state: state,
        }
    }

    #[test]
    fn first_observation_emits_event_with_zero_duration() {
        let mut machine = OccupancyStateMachine::default();
        let update = machine.update(&obs(1, 5, OccupancyState::Free));
        let event = update.event.expect("first observation emits an event");
        assert_eq!(event.new_status, SeatStatus::Unseated);
        assert_eq!(event.duration_sec, 0.0);
        assert_eq!(event.status_duration_sec, 0.0);
        assert_eq!(update.snapshot.status, SeatStatus::Unseated);
    }

    #[test]
    fn duration_resets_on_transition() {
        let mut machine = OccupancyStateMachine::default();
        machine.update(&obs(1, 0, OccupancyState::Person));
        let seated = machine.update(&obs(1, 30, OccupancyState::Person));
        assert!(seated.event.is_none());
        assert_eq!(machine.state(1).map(|s| s.status_duration_sec), Some(30.0));

        let left = machine.update(&obs(1, 40, OccupancyState::Free));
        let event = left.event.expect("transition emits an event");
        assert_eq!(event.new_status, SeatStatus::Unseated);
        assert_eq!(event.duration_sec, 30.0);
        assert_eq!(event.status_duration_sec, 10.0);
        assert_eq!(machine.state(1).map(|s| s.status_duration_sec), Some(10.0));
    }

    #[test]
    fn anomaly_fires_when_accumulated_time_reaches_threshold() {
        let mut machine = OccupancyStateMachine::default();
        let statuses: Vec<SeatStatus> = [0, 60, 130]
            .iter()
            .map(|&t| machine.update(&obs(3, t, OccupancyState::ObjectOnly)).snapshot.status)
            .collect();
        assert_eq!(
            statuses,
            vec![SeatStatus::Unseated, SeatStatus::Unseated, SeatStatus::AnomalyOccupied]
        );
        assert_eq!(machine.state(3).map(|s| s.anomaly_accum_sec), Some(130.0));
    }

    #[test]
    fn anomaly_accumulator_is_monotonic_under_object_only() {
        let mut machine = OccupancyStateMachine::default();
        let mut last = 0.0;
        for t in [0, 10, 25, 26, 90, 200] {
            machine.update(&obs(2, t, OccupancyState::ObjectOnly));
            let accum = machine.state(2).map(|s| s.anomaly_accum_sec).unwrap_or(-1.0);
            assert!(accum >= last);
            last = accum;
        }
    }

    #[test]
    fn person_resets_anomaly() {
        let mut machine = OccupancyStateMachine::default();
        machine.update(&obs(1, 0, OccupancyState::ObjectOnly));
        machine.update(&obs(1, 100, OccupancyState::ObjectOnly));
        machine.update(&obs(1, 110, OccupancyState::Person));
        assert_eq!(machine.state(1).map(|s| s.anomaly_accum_sec), Some(0.0));
        let update = machine.update(&obs(1, 200, OccupancyState::ObjectOnly));
        assert_eq!(update.snapshot.status, SeatStatus::Unseated);
        assert!(update.alert.is_none());
    }

    #[test]
    fn out_of_order_timestamp_clamps_to_zero() {
        let mut machine = OccupancyStateMachine::default();
        machine.update(&obs(1, 50, OccupancyState::Person));
        machine.update(&obs(1, 80, OccupancyState::Person));
        machine.update(&obs(1, 60, OccupancyState::Person));
        assert_eq!(machine.state(1).map(|s| s.status_duration_sec), Some(30.0));
        assert_eq!(machine.state(1).map(|s| s.last_seen_ts_ms), Some(60_000));
    }

    #[test]
    fn extreme_timestamps_do_not_overflow() {
        let mut machine = OccupancyStateMachine::default();
        let mut early = obs(1, 0, OccupancyState::Person);
        early.timestamp_ms = i64::MIN;
        let mut late = obs(1, 0, OccupancyState::Person);
        late.timestamp_ms = i64::MAX;
        machine.update(&early);
        machine.update(&late);
        let duration = machine.state(1).map(|s| s.status_duration_sec);
        assert!(duration.is_some_and(|d| d.is_finite() && d > 0.0));
        machine.update(&early);
        assert_eq!(machine.state(1).map(|s| s.last_seen_ts_ms), Some(i64::MIN));
    }

    #[test]
    fn once_per_episode_alerts_once_and_rearms() {
        let mut machine = OccupancyStateMachine::new(120.0, AlertPolicy::OncePerEpisode);
        let alerts: Vec<bool> = [0, 130, 140, 150]
            .iter()
            .map(|&t| machine.update(&obs(9, t, OccupancyState::ObjectOnly)).alert.is_some())
            .collect();
        assert_eq!(alerts, vec![false, true, false, false]);

        machine.update(&obs(9, 160, OccupancyState::Free));
        machine.update(&obs(9, 170, OccupancyState::ObjectOnly));
        let again = machine.update(&obs(9, 300, OccupancyState::ObjectOnly));
        let alert = again.alert.expect("new episode alerts again");
        assert_eq!(alert.alert_id, "9_300000_2");
        assert_eq!(alert.alert_type, ALERT_TYPE_ANOMALY);
        assert!(!alert.is_processed);
    }

    #[test]
    fn every_frame_policy_alerts_while_anomalous() {
        let mut machine = OccupancyStateMachine::new(120.0, AlertPolicy::EveryFrame);
        let updates: Vec<SeatUpdate> = [0, 130, 140]
            .iter()
            .map(|&t| machine.update(&obs(4, t, OccupancyState::ObjectOnly)))
            .collect();
        assert!(updates[0].alert.is_none());
        let ids: Vec<String> = updates[1..]
            .iter()
            .filter_map(|u| u.alert.as_ref().map(|a| a.alert_id.clone()))
            .collect();
        assert_eq!(ids, vec!["4_130000_1", "4_140000_2"]);
        // Only the first anomalous frame is a transition.
        assert!(updates[1].event.is_some());
        assert!(updates[2].event.is_none());
    }

    #[test]
    fn seats_are_independent() {
        let mut machine = OccupancyStateMachine::default();
        machine.update(&obs(1, 0, OccupancyState::Person));
        machine.update(&obs(2, 0, OccupancyState::Free));
        let update = machine.update(&obs(1, 10, OccupancyState::Person));
        assert!(update.event.is_none());
        assert_eq!(machine.seat_count(), 2);
        assert_eq!(machine.state(2).map(|s| s.current_status), Some(SeatStatus::Unseated));
    }

    #[test]
    fn checkpoint_restores_state() -> anyhow::Result<()> {
        let mut machine = OccupancyStateMachine::default();
        machine.update(&obs(1, 0, OccupancyState::ObjectOnly));
        machine.update(&obs(1, 100, OccupancyState::ObjectOnly));
        let json = serde_json::to_string(&machine.checkpoint())?;

        let mut resumed = OccupancyStateMachine::default();
        resumed.restore(serde_json::from_str(&json)?);
        let update = resumed.update(&obs(1, 125, OccupancyState::ObjectOnly));
        assert_eq!(update.snapshot.status, SeatStatus::AnomalyOccupied);
        assert!(update.alert.is_some());
        Ok(())
    }

    #[test]
    fn needs_store_flags_non_free_seats() {
        let mut machine = OccupancyStateMachine::default();
        machine.update(&obs(1, 0, OccupancyState::Free));
        assert!(!machine.update(&obs(1, 1, OccupancyState::Free)).needs_store());
        assert!(machine.update(&obs(1, 2, OccupancyState::Person)).needs_store());
        assert!(machine.update(&obs(1, 3, OccupancyState::Person)).needs_store());
    }

    #[test]
    fn policy_parses_from_config_strings() -> anyhow::Result<()> {
        assert_eq!("once_per_episode".parse::<AlertPolicy>()?, AlertPolicy::OncePerEpisode);
        assert_eq!("every-frame".parse::<AlertPolicy>()?, AlertPolicy::EveryFrame);
        assert!("sometimes".parse::<AlertPolicy>().is_err());
        Ok(())
    }
}
