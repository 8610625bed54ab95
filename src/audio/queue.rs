use rand::seq::SliceRandom;
use serde::Serialize;
use serenity::model::id::UserId;
use std::{collections::HashSet, time::Duration};
use tracing::{debug, info};

use crate::{
    audio::track::Track,
    error::{EngineError, Result},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopMode {
    Off,
    Single,
    All,
}

impl LoopMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_lowercase().as_str() {
            "off" | "none" => Some(LoopMode::Off),
            "single" | "track" | "one" => Some(LoopMode::Single),
            "all" | "queue" => Some(LoopMode::All),
            _ => None,
        }
    }
}

/// Cola ordenada de un guild con puntero a la pista actual.
///
/// Las pistas ya reproducidas se conservan para `get_previous`, hasta
/// `max_size` entradas de historial; solo las pendientes cuentan para el
/// límite. `current` apunta siempre a una entrada válida mientras la cola no
/// esté vacía.
#[derive(Debug)]
pub struct QueueManager {
    tracks: Vec<Track>,
    current: usize,
    loop_mode: LoopMode,
    skip_votes: HashSet<UserId>,
    /// La cola llegó al final sin siguiente pista (estado Draining).
    exhausted: bool,
    max_size: usize,
}

impl QueueManager {
    pub fn new(max_size: usize) -> Self {
        Self {
            tracks: Vec::new(),
            current: 0,
            loop_mode: LoopMode::Off,
            skip_votes: HashSet::new(),
            exhausted: false,
            max_size,
        }
    }

    /// Agrega una pista al final y devuelve su índice
    pub fn add(&mut self, track: Track) -> Result<usize> {
        if self.is_full() {
            return Err(EngineError::QueueFull(self.max_size));
        }

        info!("➕ Agregado a la cola: {}", track.title());
        self.tracks.push(track);
        Ok(self.tracks.len() - 1)
    }

    /// Elimina la pista en `index`. La pista en reproducción no se puede quitar.
    pub fn remove_at(&mut self, index: usize) -> Result<Track> {
        if index >= self.tracks.len() {
            return Err(EngineError::invalid(format!(
                "No hay ninguna pista en la posición {}",
                index
            )));
        }

        if index == self.current && !self.exhausted {
            return Err(EngineError::invalid(
                "No se puede quitar la pista que está sonando; usa skip",
            ));
        }

        let removed = self.tracks.remove(index);

        if index < self.current {
            self.current -= 1;
        }
        if self.current >= self.tracks.len() {
            self.current = self.tracks.len().saturating_sub(1);
        }
        if self.tracks.is_empty() {
            self.exhausted = false;
        }

        debug!("❌ Pista eliminada en posición {}", index);
        Ok(removed)
    }

    /// Mueve una pista; la actual no se mueve
    pub fn move_track(&mut self, from: usize, to: usize) -> bool {
        let len = self.tracks.len();
        if from >= len || to >= len || from == self.current {
            return false;
        }
        if from == to {
            return true;
        }

        let track = self.tracks.remove(from);
        self.tracks.insert(to, track);

        if from < self.current && to >= self.current {
            self.current -= 1;
        } else if from > self.current && to <= self.current {
            self.current += 1;
        }

        debug!("📍 Pista movida de posición {} a {}", from, to);
        true
    }

    /// Fisher–Yates sobre todas las entradas excepto la actual, que no se mueve
    pub fn shuffle(&mut self) -> bool {
        if self.tracks.len() <= 1 {
            return false;
        }

        let current = self.tracks.remove(self.current);
        let mut rng = rand::thread_rng();
        self.tracks.shuffle(&mut rng);
        self.tracks.insert(self.current, current);

        info!("🔀 Cola mezclada");
        true
    }

    /// Vacía la cola conservando solo la pista actual
    pub fn clear(&mut self) -> usize {
        if self.tracks.is_empty() {
            return 0;
        }

        let current = self.tracks.swap_remove(self.current);
        let removed = self.tracks.len();
        self.tracks = vec![current];
        self.current = 0;

        info!("🗑️ Cola limpiada ({} pistas)", removed);
        removed
    }

    /// Avanza según el modo de loop y devuelve la nueva pista actual
    pub fn get_next(&mut self) -> Option<&Track> {
        self.step(self.loop_mode)
    }

    /// Avanza ignorando el loop de canción; se usa tras un fallo
    pub fn advance(&mut self) -> Option<&Track> {
        match self.loop_mode {
            LoopMode::Single => self.step(LoopMode::Off),
            mode => self.step(mode),
        }
    }

    fn step(&mut self, mode: LoopMode) -> Option<&Track> {
        if self.tracks.is_empty() {
            return None;
        }

        let next = match mode {
            LoopMode::Single => Some(self.current),
            LoopMode::All => Some((self.current + 1) % self.tracks.len()),
            LoopMode::Off => Some(self.current + 1).filter(|i| *i < self.tracks.len()),
        };

        match next {
            Some(index) => {
                self.select(index);
                self.tracks.get(self.current)
            }
            None => {
                info!("📭 Cola agotada, no hay siguiente pista");
                self.exhausted = true;
                None
            }
        }
    }

    /// Simétrico a `get_next`
    pub fn get_previous(&mut self) -> Option<&Track> {
        if self.tracks.is_empty() {
            return None;
        }

        let len = self.tracks.len();
        let prev = match self.loop_mode {
            LoopMode::Single => Some(self.current),
            LoopMode::All => Some((self.current + len - 1) % len),
            LoopMode::Off => self.current.checked_sub(1),
        };

        let index = prev?;
        self.select(index);
        self.tracks.get(self.current)
    }

    /// Pista con la que reanudar tras Idle o Draining
    pub fn resume(&mut self) -> Option<&Track> {
        if self.exhausted {
            let index = self.current + 1;
            if index >= self.tracks.len() {
                return None;
            }
            self.select(index);
        } else {
            self.skip_votes.clear();
        }
        self.tracks.get(self.current)
    }

    /// Loop de cola: mueve la pista actual al final como copia nueva y
    /// devuelve la siguiente. La longitud de la cola no cambia.
    pub fn requeue_current(&mut self) -> Option<&Track> {
        if self.tracks.is_empty() {
            return None;
        }

        let last = self.tracks.len() - 1;
        let finished = self.tracks.remove(self.current).fresh_copy();
        info!("🔁 Pista reencolada por loop de cola: {}", finished.title());
        self.tracks.push(finished);

        let next = if self.current < last { self.current } else { 0 };
        self.select(next);
        self.tracks.get(self.current)
    }

    pub fn current(&self) -> Option<&Track> {
        self.tracks.get(self.current)
    }

    pub fn current_mut(&mut self) -> Option<&mut Track> {
        self.tracks.get_mut(self.current)
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Entradas que aún quedan por sonar, incluida la actual
    pub fn pending(&self) -> usize {
        let played = if self.exhausted {
            self.current + 1
        } else {
            self.current
        };
        self.tracks.len().saturating_sub(played)
    }

    pub fn is_full(&self) -> bool {
        self.pending() >= self.max_size
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    pub fn set_loop_mode(&mut self, mode: LoopMode) {
        self.loop_mode = mode;
        match mode {
            LoopMode::Off => info!("➡️ Repetición desactivada"),
            LoopMode::Single => info!("🔂 Repetir canción activado"),
            LoopMode::All => info!("🔁 Repetir cola activado"),
        }
    }

    /// Registra un voto; devuelve el total actual
    pub fn record_vote(&mut self, user: UserId) -> usize {
        self.skip_votes.insert(user);
        self.skip_votes.len()
    }

    pub fn skip_votes(&self) -> usize {
        self.skip_votes.len()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            tracks: self.tracks.clone(),
            current_index: (!self.tracks.is_empty()).then_some(self.current),
            loop_mode: self.loop_mode,
            skip_votes: self.skip_votes.len(),
            total_duration: self.tracks.iter().filter_map(Track::duration).sum(),
        }
    }

    fn select(&mut self, index: usize) {
        self.current = index;
        self.exhausted = false;
        self.skip_votes.clear();
        self.trim_history();
    }

    fn trim_history(&mut self) {
        let excess = self.current.saturating_sub(self.max_size);
        if excess > 0 {
            self.tracks.drain(..excess);
            self.current -= excess;
            debug!("🧹 {} pistas antiguas retiradas del historial", excess);
        }
    }
}

/// Vista inmutable de la cola para la capa de presentación
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub tracks: Vec<Track>,
    pub current_index: Option<usize>,
    pub loop_mode: LoopMode,
    pub skip_votes: usize,
    pub total_duration: Duration,
}

impl QueueSnapshot {
    /// Pistas pendientes tras la actual
    pub fn upcoming(&self) -> &[Track] {
        match self.current_index {
            Some(i) if i + 1 < self.tracks.len() => &self.tracks[i + 1..],
            _ => &[],
        }
    }
}
