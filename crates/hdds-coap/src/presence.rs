// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Presence engine.
//
// Server side: one `PresenceState` per engine, announcing resource lifecycle
// changes to presence observers. Subscriber side: pure decisions over a
// transaction's `PresenceStaging`, applied by the engine on each tick and on
// each received announcement.

use crate::client::{PresenceStaging, PRESENCE_STAGES};
use crate::clock::is_due;
use crate::observe::{next_sequence_number, MAX_SEQUENCE_NUMBER, SEQUENCE_NUMBER_OFFSET};
use crate::payload::{PresencePayload, PresenceTrigger};

// ---------------------------------------------------------------------------
// Server side
// ---------------------------------------------------------------------------

/// Lifecycle of the local presence announcer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceStatus {
    Uninitialized,
    Active,
    Inactive,
}

/// Local presence announcer state.
#[derive(Debug, Clone)]
pub struct PresenceState {
    status: PresenceStatus,
    sequence_number: u32,
    ttl_secs: u32,
}

impl Default for PresenceState {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceState {
    pub fn new() -> Self {
        Self {
            status: PresenceStatus::Uninitialized,
            sequence_number: SEQUENCE_NUMBER_OFFSET,
            ttl_secs: 0,
        }
    }

    pub fn status(&self) -> PresenceStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.status == PresenceStatus::Active
    }

    pub fn sequence_number(&self) -> u32 {
        self.sequence_number
    }

    pub fn ttl_secs(&self) -> u32 {
        self.ttl_secs
    }

    /// Mark active with `ttl_secs` clamped to `[default, max]`; zero selects
    /// the default. Returns true on the first start.
    pub fn start(&mut self, ttl_secs: u32, default_ttl: u32, max_ttl: u32) -> bool {
        let first = self.status == PresenceStatus::Uninitialized;
        self.ttl_secs = if ttl_secs == 0 {
            default_ttl
        } else {
            ttl_secs.clamp(default_ttl.min(max_ttl), max_ttl)
        };
        self.status = PresenceStatus::Active;
        first
    }

    /// Mark inactive. Returns false if presence was never started.
    pub fn stop(&mut self) -> bool {
        if self.status == PresenceStatus::Uninitialized {
            return false;
        }
        self.status = PresenceStatus::Inactive;
        true
    }

    /// Advance the global sequence number.
    pub fn bump(&mut self) -> u32 {
        self.sequence_number = next_sequence_number(self.sequence_number);
        self.sequence_number
    }

    /// Announcement for `trigger`. A stopped announcer sends `max_age = 0`.
    pub fn announcement(
        &self,
        trigger: PresenceTrigger,
        resource_type: Option<String>,
    ) -> PresencePayload {
        PresencePayload {
            sequence_number: self.sequence_number,
            max_age: if self.is_active() { self.ttl_secs } else { 0 },
            trigger,
            resource_type,
        }
    }
}

// ---------------------------------------------------------------------------
// Subscriber side
// ---------------------------------------------------------------------------

/// True if `a` is strictly newer than `b` in 24-bit serial arithmetic.
pub fn is_newer_sequence(a: u32, b: u32) -> bool {
    let diff = a.wrapping_sub(b) & MAX_SEQUENCE_NUMBER;
    diff != 0 && diff < (MAX_SEQUENCE_NUMBER + 1) / 2
}

/// How a received announcement affects a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Announcement {
    /// `max_age == 0`: the peer stopped presence.
    Stopped,
    /// Same sequence number: liveness confirmed, nothing changed.
    Refreshed,
    /// Strictly newer sequence number.
    Fresh,
    /// Older sequence number; ignored.
    Stale,
}

/// Classify `payload` against `staging` and update staging accordingly.
pub fn apply_announcement(
    staging: &mut PresenceStaging,
    payload: &PresencePayload,
    now: u32,
) -> Announcement {
    if payload.max_age == 0 {
        staging.disarm();
        staging.last_sequence = Some(payload.sequence_number);
        return Announcement::Stopped;
    }
    let outcome = match staging.last_sequence {
        Some(last) if last == payload.sequence_number => Announcement::Refreshed,
        Some(last) if !is_newer_sequence(payload.sequence_number, last) && staging.armed => {
            return Announcement::Stale;
        }
        _ => Announcement::Fresh,
    };
    staging.arm(now, payload.max_age);
    staging.last_sequence = Some(payload.sequence_number);
    outcome
}

/// Classify an announcement received on a multicast subscription.
///
/// Multicast subscriptions are not staged; they only suppress repeats of
/// the last sequence number seen from each host.
pub fn apply_multicast_announcement(
    staging: &mut PresenceStaging,
    host: &str,
    payload: &PresencePayload,
) -> Announcement {
    if payload.max_age == 0 {
        staging.peers.remove(host);
        return Announcement::Stopped;
    }
    match staging.peers.insert(host.to_string(), payload.sequence_number) {
        Some(last) if last == payload.sequence_number => Announcement::Refreshed,
        _ => Announcement::Fresh,
    }
}

/// What one tick does to a presence subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollAction {
    Idle,
    /// Send a liveness probe; the stage index was advanced.
    Probe,
    /// Every probe went unanswered; report once. The stage index was moved
    /// to the sentinel past the last stage.
    Timeout,
}

/// Advance `staging` for the tick at `now`.
pub fn poll_staging(staging: &mut PresenceStaging, now: u32) -> PollAction {
    if !staging.armed || staging.is_expired() {
        return PollAction::Idle;
    }
    if staging.is_exhausted() {
        staging.stage = PRESENCE_STAGES + 1;
        return PollAction::Timeout;
    }
    match staging.current_deadline() {
        Some(deadline) if is_due(now, deadline) => {
            staging.stage += 1;
            PollAction::Probe
        }
        _ => PollAction::Idle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn announcement(seq: u32, max_age: u32) -> PresencePayload {
        PresencePayload {
            sequence_number: seq,
            max_age,
            trigger: PresenceTrigger::Change,
            resource_type: None,
        }
    }

    #[test]
    fn test_start_clamps_ttl() {
        let mut p = PresenceState::new();
        assert!(p.start(0, 60, 86_400));
        assert_eq!(p.ttl_secs(), 60);
        assert!(!p.start(1_000_000, 60, 86_400));
        assert_eq!(p.ttl_secs(), 86_400);
        p.start(10, 60, 86_400);
        assert_eq!(p.ttl_secs(), 60);
        p.start(120, 60, 86_400);
        assert_eq!(p.ttl_secs(), 120);
    }

    #[test]
    fn test_stop_announces_zero_ttl() {
        let mut p = PresenceState::new();
        assert!(!p.stop());
        p.start(30, 60, 86_400);
        assert_eq!(p.announcement(PresenceTrigger::Create, None).max_age, 60);
        p.stop();
        let a = p.announcement(PresenceTrigger::Delete, None);
        assert_eq!(a.max_age, 0);
        assert_eq!(p.status(), PresenceStatus::Inactive);
    }

    #[test]
    fn test_sequence_comparison_wraps() {
        assert!(is_newer_sequence(6, 5));
        assert!(!is_newer_sequence(5, 5));
        assert!(!is_newer_sequence(5, 6));
        assert!(is_newer_sequence(5, MAX_SEQUENCE_NUMBER - 1));
    }

    #[test]
    fn test_stage_walk_probe_then_single_timeout() {
        let mut staging = PresenceStaging::default();
        assert_eq!(poll_staging(&mut staging, 0), PollAction::Idle);
        assert_eq!(apply_announcement(&mut staging, &announcement(10, 10), 0), Announcement::Fresh);

        assert_eq!(poll_staging(&mut staging, 4_999), PollAction::Idle);
        let mut probes = 0;
        let mut last_stage = staging.stage;
        for now in (5_000..=12_000).step_by(500) {
            match poll_staging(&mut staging, now) {
                PollAction::Probe => probes += 1,
                PollAction::Timeout => {
                    assert_eq!(probes, PRESENCE_STAGES);
                }
                PollAction::Idle => {}
            }
            assert!(staging.stage >= last_stage);
            last_stage = staging.stage;
        }
        assert_eq!(probes, PRESENCE_STAGES);
        assert!(staging.is_expired());
        assert_eq!(poll_staging(&mut staging, u32::MAX), PollAction::Idle);
    }

    #[test]
    fn test_multicast_tracks_hosts_independently() {
        let mut staging = PresenceStaging::default();
        let a = announcement(7, 30);
        let (one, two) = ("10.0.0.1:5683", "10.0.0.2:5683");
        assert_eq!(apply_multicast_announcement(&mut staging, one, &a), Announcement::Fresh);
        assert_eq!(apply_multicast_announcement(&mut staging, one, &a), Announcement::Refreshed);
        assert_eq!(apply_multicast_announcement(&mut staging, two, &a), Announcement::Fresh);
        assert_eq!(
            apply_multicast_announcement(&mut staging, "10.0.0.1:5683", &announcement(7, 0)),
            Announcement::Stopped
        );
        assert!(!staging.armed);
        assert_eq!(staging.peers.len(), 1);
    }

    #[test]
    fn test_only_newer_or_equal_announcement_rearms() {
        let mut staging = PresenceStaging::default();
        apply_announcement(&mut staging, &announcement(20, 10), 0);
        poll_staging(&mut staging, 5_000);
        assert_eq!(staging.stage, 1);

        let stale = apply_announcement(&mut staging, &announcement(19, 10), 6_000);
        assert_eq!(stale, Announcement::Stale);
        assert_eq!(staging.stage, 1);

        let same = apply_announcement(&mut staging, &announcement(20, 10), 6_000);
        assert_eq!(same, Announcement::Refreshed);
        assert_eq!(staging.stage, 0);
        assert_eq!(staging.deadlines[0], 11_000);

        let fresh = apply_announcement(&mut staging, &announcement(21, 10), 7_000);
        assert_eq!(fresh, Announcement::Fresh);
        let stopped = apply_announcement(&mut staging, &announcement(22, 0), 7_000);
        assert_eq!(stopped, Announcement::Stopped);
        assert!(!staging.armed);
    }
}
