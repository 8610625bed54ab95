use std::time::Duration;
use tokio::{
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::audio::{
    events::{EventBus, EventKind},
    track::TrackLength,
};

const TICK_PERIOD: Duration = Duration::from_secs(1);

/// Reloj de reproducción de una sesión.
///
/// `position = (now - started_at) + seek_offset`, acotado a la duración.
/// Pausar congela el reloj; reanudar desplaza `started_at` lo que duró la pausa.
#[derive(Debug, Clone, Copy)]
pub struct PlaybackClock {
    started_at: Instant,
    seek_offset: Duration,
    paused_at: Option<Instant>,
    length: TrackLength,
}

impl PlaybackClock {
    pub fn start(seek_offset: Duration, length: TrackLength) -> Self {
        Self {
            started_at: Instant::now(),
            seek_offset,
            paused_at: None,
            length,
        }
    }

    pub fn position(&self) -> Duration {
        let now = self.paused_at.unwrap_or_else(Instant::now);
        let position = now.saturating_duration_since(self.started_at) + self.seek_offset;

        match self.length {
            TrackLength::Finite(total) => position.min(total),
            TrackLength::Live => position,
        }
    }

    pub fn length(&self) -> TrackLength {
        self.length
    }

    pub fn is_paused(&self) -> bool {
        self.paused_at.is_some()
    }

    /// Devuelve false si ya estaba en pausa
    pub fn pause(&mut self) -> bool {
        if self.paused_at.is_some() {
            return false;
        }
        self.paused_at = Some(Instant::now());
        true
    }

    /// Devuelve false si no estaba en pausa
    pub fn resume(&mut self) -> bool {
        match self.paused_at.take() {
            Some(paused_at) => {
                self.started_at += paused_at.elapsed();
                true
            }
            None => false,
        }
    }
}

/// Lanza la tarea que publica `ProgressTick` cada segundo hasta que se cancele
pub fn spawn_ticker(clock: PlaybackClock, events: EventBus, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + TICK_PERIOD, TICK_PERIOD);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    events.emit(EventKind::ProgressTick {
                        position: clock.position(),
                        length: clock.length(),
                    });
                }
            }
        }
    })
}
