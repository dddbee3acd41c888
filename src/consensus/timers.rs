//! Named handler timers.
//!
//! Each timer is a tokio task that sleeps and then sends a tick to the
//! state driver. A tick carries the generation it was armed with, so a tick
//! that was already queued when its timer got replaced or canceled is
//! recognised as stale.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Resends the current INIT ballot.
    BroadcastInitBallot,
    /// Resends the current ACCEPT ballot.
    BroadcastAcceptBallot,
    /// Prepares the INIT ballot of the next round after a draw.
    PrepareNextRound,
    /// Ballots at the current stagepoint waited too long.
    StuckBallot,
    /// Forces a stuck voteproof.
    StuckResolve,
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimerId::BroadcastInitBallot => "broadcast-init-ballot",
            TimerId::BroadcastAcceptBallot => "broadcast-accept-ballot",
            TimerId::PrepareNextRound => "prepare-next-round",
            TimerId::StuckBallot => "stuck-ballot",
            TimerId::StuckResolve => "stuck-resolve",
        };
        f.write_str(s)
    }
}

/// A timer fire as seen by the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerTick {
    pub id: TimerId,
    pub generation: u64,
}

pub struct Timers {
    timers: HashMap<TimerId, (u64, JoinHandle<()>)>,
    generation: u64,
    ticks: mpsc::Sender<TimerTick>,
}

impl Timers {
    pub fn new(ticks: mpsc::Sender<TimerTick>) -> Self {
        Timers {
            timers: HashMap::new(),
            generation: 0,
            ticks,
        }
    }

    /// Arms `id` to fire after `initial`, then every `interval` when given.
    /// An armed timer with the same id is replaced.
    pub fn start(&mut self, id: TimerId, initial: Duration, interval: Option<Duration>) {
        self.stop(id);

        self.generation += 1;
        let generation = self.generation;
        let ticks = self.ticks.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(initial).await;
            loop {
                trace!(%id, generation, "timer fired");
                if ticks.send(TimerTick { id, generation }).await.is_err() {
                    return;
                }
                match interval {
                    Some(d) => tokio::time::sleep(d).await,
                    None => return,
                }
            }
        });

        self.timers.insert(id, (generation, handle));
        debug!(%id, ?initial, ?interval, "timer started");
    }

    pub fn stop(&mut self, id: TimerId) {
        if let Some((_, handle)) = self.timers.remove(&id) {
            handle.abort();
            trace!(%id, "timer stopped");
        }
    }

    pub fn stop_all(&mut self) {
        for (id, (_, handle)) in self.timers.drain() {
            handle.abort();
            trace!(%id, "timer stopped");
        }
    }

    /// Whether `tick` comes from the timer currently armed under its id.
    pub fn is_current(&self, tick: TimerTick) -> bool {
        self.timers
            .get(&tick.id)
            .is_some_and(|(generation, _)| *generation == tick.generation)
    }

    pub fn is_running(&self, id: TimerId) -> bool {
        self.timers.contains_key(&id)
    }

    pub fn active_count(&self) -> usize {
        self.timers.len()
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next(rx: &mut mpsc::Receiver<TimerTick>, within: u64) -> Option<TimerTick> {
        tokio::time::timeout(Duration::from_millis(within), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn fires_once_without_interval() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timers = Timers::new(tx);
        timers.start(TimerId::PrepareNextRound, Duration::from_millis(10), None);

        let tick = next(&mut rx, 200).await.unwrap();
        assert_eq!(tick.id, TimerId::PrepareNextRound);
        assert!(timers.is_current(tick));
        assert!(next(&mut rx, 50).await.is_none());
    }

    #[tokio::test]
    async fn repeats_with_interval() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timers = Timers::new(tx);
        timers.start(
            TimerId::BroadcastInitBallot,
            Duration::from_millis(5),
            Some(Duration::from_millis(5)),
        );

        for _ in 0..3 {
            assert_eq!(next(&mut rx, 200).await.unwrap().id, TimerId::BroadcastInitBallot);
        }
        timers.stop(TimerId::BroadcastInitBallot);
        assert_eq!(timers.active_count(), 0);
    }

    #[tokio::test]
    async fn replaced_timer_ticks_are_stale() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timers = Timers::new(tx);
        timers.start(TimerId::StuckBallot, Duration::from_millis(1), None);
        let first = next(&mut rx, 200).await.unwrap();

        timers.start(TimerId::StuckBallot, Duration::from_secs(60), None);
        assert!(!timers.is_current(first));
        assert!(timers.is_running(TimerId::StuckBallot));
    }

    #[tokio::test]
    async fn stop_all_silences_timers() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timers = Timers::new(tx);
        timers.start(TimerId::StuckBallot, Duration::from_millis(30), None);
        timers.start(TimerId::StuckResolve, Duration::from_millis(30), None);
        assert_eq!(timers.active_count(), 2);

        timers.stop_all();
        assert_eq!(timers.active_count(), 0);
        assert!(next(&mut rx, 100).await.is_none());
    }
}
