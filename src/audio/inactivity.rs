use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Motivo por el que corre el temporizador
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InactivityReason {
    /// La cola se agotó
    QueueDrained,
    /// No quedan oyentes en el canal de voz
    ChannelEmpty,
}

#[derive(Debug)]
struct ActiveTimer {
    id: u64,
    reason: InactivityReason,
    token: CancellationToken,
}

/// Temporizador de desconexión por inactividad de un guild.
///
/// Cada arranque recibe un id; las expiraciones de un temporizador ya
/// cancelado o reemplazado se descartan en [`InactivityMonitor::expire`].
#[derive(Debug)]
pub struct InactivityMonitor {
    idle_timeout: Duration,
    alone_timeout: Duration,
    active: Option<ActiveTimer>,
    next_id: u64,
}

impl InactivityMonitor {
    pub fn new(idle_timeout: Duration, alone_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            alone_timeout,
            active: None,
            next_id: 0,
        }
    }

    /// Arranca (o reinicia) el temporizador. Al expirar envía `wrap(id)` por `tx`.
    pub fn start<M, F>(
        &mut self,
        reason: InactivityReason,
        parent: &CancellationToken,
        tx: mpsc::Sender<M>,
        wrap: F,
    ) -> u64
    where
        M: Send + 'static,
        F: FnOnce(u64) -> M + Send + 'static,
    {
        self.cancel();

        self.next_id += 1;
        let id = self.next_id;
        let token = parent.child_token();
        let delay = match reason {
            InactivityReason::QueueDrained => self.idle_timeout,
            InactivityReason::ChannelEmpty => self.alone_timeout,
        };

        let task_token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = task_token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(wrap(id)).await;
                }
            }
        });

        info!(
            "⏳ Temporizador de inactividad #{} ({:?}): {}",
            id,
            reason,
            humantime::format_duration(delay)
        );
        self.active = Some(ActiveTimer { id, reason, token });
        id
    }

    /// Cancela cualquier temporizador activo
    pub fn cancel(&mut self) -> bool {
        match self.active.take() {
            Some(timer) => {
                timer.token.cancel();
                debug!("⏹️ Temporizador de inactividad #{} cancelado", timer.id);
                true
            }
            None => false,
        }
    }

    /// Cancela solo si el temporizador activo corre por `reason`
    pub fn cancel_if(&mut self, reason: InactivityReason) -> bool {
        if self.reason() == Some(reason) {
            self.cancel()
        } else {
            false
        }
    }

    /// Consume una expiración; `None` si el id ya no es el vigente
    pub fn expire(&mut self, id: u64) -> Option<InactivityReason> {
        if self.active.as_ref().is_some_and(|t| t.id == id) {
            return self.active.take().map(|t| t.reason);
        }
        debug!("Expiración obsoleta #{} descartada", id);
        None
    }

    pub fn reason(&self) -> Option<InactivityReason> {
        self.active.as_ref().map(|t| t.reason)
    }

    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }
}
