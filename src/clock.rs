//! Reference lock and PPS time alignment across boards

use std::{fmt, time::Duration};

use tracing::{debug, info, warn};

use crate::{
    plan::ClockPlan,
    radio::{ClockSource, Radio, TimeSpec},
    Error, Result,
};

/// GPS lock is polled once per second
pub const LOCK_POLL: Duration = Duration::from_secs(1);
/// Time for new clock settings to propagate after alignment
pub const SETTLE: Duration = Duration::from_secs(1);

/// Anything that can suspend the pipeline for a while
pub trait Sleep {
    fn sleep(&mut self, dur: Duration);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockStatus {
    Unknown,
    Locked,
    Unlocked,
}

impl fmt::Display for LockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockStatus::Unknown => write!(f, "unknown"),
            LockStatus::Locked => write!(f, "locked"),
            LockStatus::Unlocked => write!(f, "unlocked"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Unsynced,
    WaitingLock,
    Locked,
    Failed,
    Synced,
}

/// What to do when GPS lock never arrives. Every call site picks one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockPolicy {
    Fatal,
    FallBackToInternal,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BoardClockState {
    pub board: usize,
    pub reference: ClockSource,
    pub time_source: ClockSource,
    pub lock: LockStatus,
    pub last_pps: Option<TimeSpec>,
}

/// Waits for a board's PPS latch to move, polling at a fixed interval
#[derive(Clone, Copy, Debug)]
pub struct EdgeWaiter {
    pub poll: Duration,
    pub max_polls: u32,
}

impl Default for EdgeWaiter {
    fn default() -> Self {
        // Two full PPS periods
        Self {
            poll: Duration::from_millis(50),
            max_polls: 40,
        }
    }
}

impl EdgeWaiter {
    /// Returns the time latched at the new edge
    pub fn await_next_edge<R, S>(&self, radio: &R, sleep: &mut S, board: usize) -> Result<TimeSpec>
    where
        R: Radio + ?Sized,
        S: Sleep + ?Sized,
    {
        let last = radio.time_last_pps(board)?;
        for _ in 0..self.max_polls {
            sleep.sleep(self.poll);
            let pps = radio.time_last_pps(board)?;
            if pps != last {
                return Ok(pps);
            }
        }
        Err(Error::PpsEdgeTimeout {
            board,
            polls: self.max_polls,
        })
    }
}

pub struct ClockSyncManager {
    plan: ClockPlan,
    edge: EdgeWaiter,
    state: SyncState,
    boards: Vec<BoardClockState>,
}

impl ClockSyncManager {
    pub fn new(plan: ClockPlan, num_boards: usize) -> Self {
        let boards = (0..num_boards)
            .map(|board| BoardClockState {
                board,
                reference: plan.reference,
                time_source: plan.time_source,
                lock: LockStatus::Unknown,
                last_pps: None,
            })
            .collect();
        Self {
            plan,
            edge: EdgeWaiter::default(),
            state: SyncState::Unsynced,
            boards,
        }
    }

    pub fn with_edge_waiter(mut self, edge: EdgeWaiter) -> Self {
        self.edge = edge;
        self
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn boards(&self) -> &[BoardClockState] {
        &self.boards
    }

    /// Locked only if every board locked, unknown if lock never came into it
    pub fn lock_status(&self) -> LockStatus {
        if self.boards.iter().any(|b| b.lock == LockStatus::Unlocked) {
            LockStatus::Unlocked
        } else if !self.boards.is_empty() && self.boards.iter().all(|b| b.lock == LockStatus::Locked)
        {
            LockStatus::Locked
        } else {
            LockStatus::Unknown
        }
    }

    fn transition(&mut self, next: SyncState) {
        debug!(from = ?self.state, to = ?next, "Clock sync state");
        self.state = next;
    }

    /// Lock (when a GPSDO is involved) and zero every board's time on a common PPS edge
    pub fn synchronize<R, S>(
        &mut self,
        radio: &mut R,
        sleep: &mut S,
        policy: LockPolicy,
    ) -> Result<LockStatus>
    where
        R: Radio + ?Sized,
        S: Sleep + ?Sized,
    {
        let (reference, time_source) = if self.plan.uses_gps() {
            self.transition(SyncState::WaitingLock);
            info!("Waiting for GPS lock");
            for board in 0..self.boards.len() {
                let locked = self.wait_for_lock(radio, sleep, board);
                self.boards[board].lock = if locked {
                    LockStatus::Locked
                } else {
                    LockStatus::Unlocked
                };
                if !locked {
                    break;
                }
            }
            if self.lock_status() == LockStatus::Locked {
                self.transition(SyncState::Locked);
                info!("GPS LOCKED");
                (self.plan.reference, self.plan.time_source)
            } else {
                self.transition(SyncState::Failed);
                let board = self
                    .boards
                    .iter()
                    .position(|b| b.lock == LockStatus::Unlocked)
                    .unwrap_or(0);
                match policy {
                    LockPolicy::Fatal => {
                        return Err(Error::HardwareLock {
                            board,
                            polls: self.plan.lock_wait,
                        })
                    }
                    LockPolicy::FallBackToInternal => {
                        warn!(board, "NO GPS LOCK, falling back to the internal clock");
                        (ClockSource::Internal, ClockSource::Internal)
                    }
                }
            }
        } else {
            (self.plan.reference, self.plan.time_source)
        };

        for board in 0..self.boards.len() {
            info!(
                "Synchronizing board {board}: {} (clock {reference}, time {time_source})",
                radio.board_name(board)
            );
            radio.set_clock_source(reference, board)?;
            radio.set_time_source(time_source, board)?;
            self.boards[board].reference = reference;
            self.boards[board].time_source = time_source;
        }
        self.align(radio, sleep)?;
        sleep.sleep(SETTLE);
        self.transition(SyncState::Synced);
        Ok(self.lock_status())
    }

    /// Poll `gps_locked` once per second up to the wait budget, then require both
    /// GPS and reference lock. A failed sensor read counts as "not locked".
    fn wait_for_lock<R, S>(&self, radio: &mut R, sleep: &mut S, board: usize) -> bool
    where
        R: Radio + ?Sized,
        S: Sleep + ?Sized,
    {
        for i in 0..self.plan.lock_wait {
            if sensor_bool(radio, "gps_locked", board) {
                break;
            }
            debug!(board, "GPS lock poll {}/{}", i + 1, self.plan.lock_wait);
            sleep.sleep(LOCK_POLL);
        }
        sensor_bool(radio, "gps_locked", board) && sensor_bool(radio, "ref_locked", board)
    }

    /// Reset each board at the edge after the one we just saw. Once the last board
    /// is done, the reset goes out to every board again back to back, so they all
    /// pick the same edge.
    fn align<R, S>(&mut self, radio: &mut R, sleep: &mut S) -> Result<()>
    where
        R: Radio + ?Sized,
        S: Sleep + ?Sized,
    {
        let n = self.boards.len();
        for board in 0..n {
            let edge = self.edge.await_next_edge(radio, sleep, board)?;
            self.boards[board].last_pps = Some(edge);
            radio.set_time_next_pps(TimeSpec::ZERO, board)?;
            if n > 1 && board == n - 1 {
                for b in 0..n {
                    radio.set_time_next_pps(TimeSpec::ZERO, b)?;
                }
            }
        }
        Ok(())
    }
}

fn sensor_bool<R: Radio + ?Sized>(radio: &mut R, name: &str, board: usize) -> bool {
    match radio.mboard_sensor(name, board) {
        Ok(v) => v.to_bool(),
        Err(e) => {
            debug!(board, "Sensor '{name}' unreadable, treating as unlocked: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimConfig, SimRadio};

    fn plan(src: ClockSource, lock_wait: u32) -> ClockPlan {
        ClockPlan {
            reference: src,
            time_source: src,
            lock_wait,
        }
    }

    fn board_seconds(radio: &SimRadio, board: usize) -> f64 {
        radio.time_now(board).unwrap().to_seconds()
    }

    #[test]
    fn test_edge_waiter_sees_boundary() {
        let radio = SimRadio::new(SimConfig::default());
        let mut clock = radio.clock();
        clock.sleep(Duration::from_millis(250));
        let edge = EdgeWaiter::default()
            .await_next_edge(&radio, &mut clock, 0)
            .unwrap();
        assert!(clock.now() >= 1.0 && clock.now() < 1.05 + 1e-9);
        assert_eq!(edge, radio.time_last_pps(0).unwrap());
    }

    #[test]
    fn test_edge_waiter_times_out() {
        let radio = SimRadio::new(SimConfig::default());
        let mut clock = radio.clock();
        let waiter = EdgeWaiter {
            poll: Duration::from_millis(50),
            max_polls: 4,
        };
        assert!(matches!(
            waiter.await_next_edge(&radio, &mut clock, 0),
            Err(Error::PpsEdgeTimeout { board: 0, polls: 4 })
        ));
    }

    #[test]
    fn test_two_boards_share_origin() {
        let mut radio = SimRadio::new(SimConfig {
            boards: 2,
            command_latency: 0.3,
            ..Default::default()
        });
        let mut clock = radio.clock();
        let mut mgr = ClockSyncManager::new(plan(ClockSource::External, 0), 2);
        let status = mgr
            .synchronize(&mut radio, &mut clock, LockPolicy::Fatal)
            .unwrap();
        assert_eq!(status, LockStatus::Unknown);
        assert_eq!(mgr.state(), SyncState::Synced);

        let skew = (board_seconds(&radio, 0) - board_seconds(&radio, 1)).abs();
        assert!(skew <= 1.0, "skew {skew}");
        assert!(skew < 1e-6, "skew {skew}");

        // Board 0, then board 1, then both again
        let order: Vec<usize> = radio.resets().iter().map(|(b, _)| *b).collect();
        assert_eq!(order, vec![0, 1, 0, 1]);
        assert!(mgr.boards().iter().all(|b| b.last_pps.is_some()));
    }

    #[test]
    fn test_gps_lock_after_retries() {
        let mut radio = SimRadio::new(SimConfig {
            gps_lock_after: Some(4),
            sensor_failures: 2,
            ..Default::default()
        });
        let mut clock = radio.clock();
        let mut mgr = ClockSyncManager::new(plan(ClockSource::Gpsdo, 10), 1);
        let status = mgr
            .synchronize(&mut radio, &mut clock, LockPolicy::Fatal)
            .unwrap();
        assert_eq!(status, LockStatus::Locked);
        assert_eq!(
            radio.clock_sources(0),
            Some((ClockSource::Gpsdo, ClockSource::Gpsdo))
        );
    }

    #[test]
    fn test_no_lock_is_fatal_when_asked() {
        let mut radio = SimRadio::new(SimConfig {
            gps_lock_after: None,
            ..Default::default()
        });
        let mut clock = radio.clock();
        let mut mgr = ClockSyncManager::new(plan(ClockSource::Gpsdo, 5), 1);
        assert!(matches!(
            mgr.synchronize(&mut radio, &mut clock, LockPolicy::Fatal),
            Err(Error::HardwareLock { board: 0, polls: 5 })
        ));
        assert_eq!(mgr.state(), SyncState::Failed);
        // Five one-second polls
        assert!(clock.now() >= 5.0);
    }

    #[test]
    fn test_no_lock_falls_back_when_asked() {
        let mut radio = SimRadio::new(SimConfig {
            boards: 2,
            gps_lock_after: None,
            ..Default::default()
        });
        let mut clock = radio.clock();
        let mut mgr =
            ClockSyncManager::new(plan(ClockSource::Gpsdo, 3), 2).with_edge_waiter(EdgeWaiter {
                poll: Duration::from_millis(100),
                max_polls: 20,
            });
        let status = mgr
            .synchronize(&mut radio, &mut clock, LockPolicy::FallBackToInternal)
            .unwrap();
        assert_eq!(status, LockStatus::Unlocked);
        assert_eq!(mgr.state(), SyncState::Synced);
        for b in 0..2 {
            assert_eq!(
                radio.clock_sources(b),
                Some((ClockSource::Internal, ClockSource::Internal))
            );
        }
        assert!((board_seconds(&radio, 0) - board_seconds(&radio, 1)).abs() < 1e-6);
    }
}
