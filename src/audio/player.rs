use futures::future::OptionFuture;
use serenity::model::id::{GuildId, UserId};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    audio::{
        effects::{self, EffectSettings, EffectSpec, QualityPreset},
        events::{EventBus, EventKind, PlayerSnapshot, PlayerState, TrackEndReason},
        handle::{required_votes, AddedTrack, GuildHandle, Intent, Reply, SkipOutcome},
        inactivity::{InactivityMonitor, InactivityReason},
        progress::{spawn_ticker, PlaybackClock},
        queue::{LoopMode, QueueManager},
        registry::{EngineDeps, EngineMap},
        track::{format_time, Track, TrackLength},
        transcoder::{ExitOutcome, TranscodeProcess, Transcoder},
        voice::VoiceConnection,
    },
    config::EngineConfig,
    error::{EngineError, ErrorKind, Result},
    sources::{ResolveError, ResolvedTrack, TrackResolver},
};

/// Sesión de reproducción activa: una por guild como máximo
struct Session {
    track: Track,
    process: Box<dyn TranscodeProcess>,
    clock: PlaybackClock,
    /// Ya se reintentó una vez tras un localizador caducado
    expiry_retried: bool,
}

/// Cómo arrancar la pista actual
#[derive(Debug, Clone, Copy)]
struct StartRequest {
    offset: Option<Duration>,
    /// Publicar `TrackStarted` (no en seek ni cambios de efecto)
    announce: bool,
    expiry_retried: bool,
}

impl StartRequest {
    fn new_track() -> Self {
        Self {
            offset: None,
            announce: true,
            expiry_retried: false,
        }
    }

    fn restart(offset: Option<Duration>) -> Self {
        Self {
            offset,
            announce: false,
            expiry_retried: false,
        }
    }
}

enum StartResult {
    Started,
    /// Esperando a que se refresque el localizador
    Pending,
    Failed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitCause {
    Leave,
    VoiceLost,
    Idle(InactivityReason),
    Shutdown,
}

/// Actor que posee la cola y la sesión de un guild.
///
/// Todas las mutaciones pasan por su bandeja de entrada y se procesan en
/// orden. El bucle solo espera a tres cosas: la bandeja, la salida del
/// transcodificador activo y su token de cancelación.
pub(crate) struct PlaybackController {
    guild_id: GuildId,
    instance: u64,
    config: EngineConfig,
    resolver: Arc<dyn TrackResolver>,
    transcoder: Arc<dyn Transcoder>,
    voice: Arc<dyn VoiceConnection>,
    events: EventBus,
    engines: EngineMap,
    inbox: mpsc::Receiver<Intent>,
    inbox_tx: mpsc::WeakSender<Intent>,
    token: CancellationToken,

    queue: QueueManager,
    state: PlayerState,
    session: Option<Session>,
    pending: Option<StartRequest>,
    load_generation: u64,
    ticker: Option<CancellationToken>,
    inactivity: InactivityMonitor,
    volume: f32,
    effect: EffectSettings,
    preset: QualityPreset,
    /// `None` hasta que la capa del bot informe por primera vez
    listeners: Option<usize>,
    exit: Option<ExitCause>,
    leave_reply: Option<Reply<()>>,
}

impl PlaybackController {
    /// Lanza el actor de un guild y devuelve su handle y su token
    pub(crate) fn spawn(
        guild_id: GuildId,
        instance: u64,
        deps: &EngineDeps,
        voice: Arc<dyn VoiceConnection>,
        engines: EngineMap,
    ) -> (GuildHandle, CancellationToken) {
        let config = deps.config.clone();
        let (tx, inbox) = mpsc::channel(config.inbox_capacity);
        let token = CancellationToken::new();

        let controller = Self {
            guild_id,
            instance,
            resolver: deps.resolver.clone(),
            transcoder: deps.transcoder.clone(),
            voice,
            events: EventBus::new(guild_id, deps.events.clone()),
            engines,
            inbox,
            inbox_tx: tx.downgrade(),
            token: token.clone(),
            queue: QueueManager::new(config.max_queue_size),
            state: PlayerState::Idle,
            session: None,
            pending: None,
            load_generation: 0,
            ticker: None,
            inactivity: InactivityMonitor::new(config.idle_timeout, config.alone_timeout),
            volume: config.default_volume,
            effect: EffectSettings::default(),
            preset: QualityPreset::default(),
            listeners: None,
            exit: None,
            leave_reply: None,
            config,
        };

        tokio::spawn(controller.run());
        (GuildHandle::new(guild_id, tx), token)
    }

    async fn run(mut self) {
        info!("🎶 Reproductor iniciado para guild {}", self.guild_id);

        loop {
            let exit = OptionFuture::from(self.session.as_mut().map(|s| s.process.wait()));

            tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    self.exit.get_or_insert(ExitCause::Shutdown);
                }
                Some(outcome) = exit => self.on_process_exit(outcome).await,
                intent = self.inbox.recv() => match intent {
                    Some(intent) => self.handle(intent).await,
                    None => {
                        self.exit.get_or_insert(ExitCause::Shutdown);
                    }
                },
            }

            if let Some(cause) = self.exit.take() {
                self.teardown(cause).await;
                break;
            }
        }

        info!("🛑 Reproductor finalizado para guild {}", self.guild_id);
    }

    async fn handle(&mut self, intent: Intent) {
        match intent {
            Intent::AddTrack {
                query,
                requester,
                reply,
            } => self.begin_resolution(query, requester, reply),
            Intent::Resolved {
                query,
                requester,
                result,
                reply,
            } => self.on_resolved(query, requester, result, reply).await,
            Intent::Refreshed { generation, result } => self.on_refreshed(generation, result).await,
            Intent::RemoveTrack { index, reply } => {
                let result = self.queue.remove_at(index);
                if result.is_ok() {
                    self.queue_changed();
                }
                let _ = reply.send(result);
            }
            Intent::MoveTrack { from, to, reply } => {
                let result = if self.queue.move_track(from, to) {
                    self.queue_changed();
                    Ok(())
                } else {
                    Err(EngineError::invalid(format!(
                        "No se puede mover la pista {} a la posición {}",
                        from, to
                    )))
                };
                let _ = reply.send(result);
            }
            Intent::Clear { reply } => {
                let removed = self.queue.clear();
                self.queue_changed();
                let _ = reply.send(Ok(removed));
            }
            Intent::Shuffle { reply } => {
                let shuffled = self.queue.shuffle();
                if shuffled {
                    self.queue_changed();
                }
                let _ = reply.send(Ok(shuffled));
            }
            Intent::SetLoop { mode, reply } => {
                self.queue.set_loop_mode(mode);
                self.queue_changed();
                let _ = reply.send(Ok(()));
            }
            Intent::Skip {
                user,
                forced,
                reply,
            } => {
                let result = self.skip(user, forced).await;
                let _ = reply.send(result);
            }
            Intent::Previous { reply } => {
                let result = self.previous().await;
                let _ = reply.send(result);
            }
            Intent::Pause { reply } => {
                let _ = reply.send(self.pause());
            }
            Intent::Resume { reply } => {
                let result = self.resume().await;
                let _ = reply.send(result);
            }
            Intent::Seek { position, reply } => {
                let result = self.seek(position).await;
                let _ = reply.send(result);
            }
            Intent::SetEffect {
                name,
                intensity,
                reply,
            } => {
                let result = self.set_effect(&name, intensity).await;
                let _ = reply.send(result);
            }
            Intent::SetPreset { preset, reply } => {
                self.preset = preset;
                info!("🎚️ Preset de calidad: {}", preset.as_str());
                self.restart_if_active().await;
                let _ = reply.send(Ok(()));
            }
            Intent::SetVolume { volume, reply } => {
                let _ = reply.send(Ok(self.set_volume(volume)));
            }
            Intent::ListenersChanged { count, reply } => {
                self.on_listeners(count);
                let _ = reply.send(Ok(()));
            }
            Intent::VoiceLost { reply } => {
                error!("🔌 Conexión de voz perdida en guild {}", self.guild_id);
                self.emit_error(ErrorKind::VoiceConnectionLost, EngineError::VoiceConnectionLost.to_string());
                self.exit = Some(ExitCause::VoiceLost);
                let _ = reply.send(Ok(()));
            }
            Intent::Snapshot { reply } => {
                let _ = reply.send(Ok(self.snapshot()));
            }
            Intent::Leave { reply } => {
                self.exit = Some(ExitCause::Leave);
                self.leave_reply = Some(reply);
            }
            Intent::InactivityExpired { timer_id } => {
                if let Some(reason) = self.inactivity.expire(timer_id) {
                    info!("💤 Desconectando por inactividad ({:?})", reason);
                    self.exit = Some(ExitCause::Idle(reason));
                }
            }
        }
    }

    // ---- Resolución ----

    fn begin_resolution(&mut self, query: String, requester: UserId, reply: Reply<AddedTrack>) {
        if self.queue.is_full() {
            let _ = reply.send(Err(EngineError::QueueFull(self.config.max_queue_size)));
            return;
        }
        let Some(tx) = self.inbox_tx.upgrade() else {
            return;
        };

        let resolver = self.resolver.clone();
        let limit = self.config.resolve_timeout;
        let token = self.token.child_token();

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                result = resolve_with_timeout(resolver.as_ref(), &query, limit) => {
                    let _ = tx
                        .send(Intent::Resolved { query, requester, result, reply })
                        .await;
                }
            }
        });
    }

    async fn on_resolved(
        &mut self,
        query: String,
        requester: UserId,
        result: std::result::Result<ResolvedTrack, ResolveError>,
        reply: Reply<AddedTrack>,
    ) {
        let resolved = match result {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!("❌ No se pudo resolver '{}': {}", query, e);
                let _ = reply.send(Err(e.into()));
                return;
            }
        };

        let track = Track::from_resolved(resolved, &query, requester);
        match self.queue.add(track.clone()) {
            Err(e) => {
                let _ = reply.send(Err(e));
            }
            Ok(position) => {
                let _ = reply.send(Ok(AddedTrack { track, position }));
                self.queue_changed();
                self.on_activity();

                if matches!(self.state, PlayerState::Idle | PlayerState::Draining)
                    && self.queue.resume().is_some()
                {
                    self.play_current(StartRequest::new_track()).await;
                }
            }
        }
    }

    fn spawn_refresh(&mut self, query: String, request: StartRequest) {
        let Some(tx) = self.inbox_tx.upgrade() else {
            return;
        };
        let generation = self.load_generation;
        self.pending = Some(request);
        debug!("🔄 Refrescando localizador de {} (gen {})", query, generation);

        let resolver = self.resolver.clone();
        let limit = self.config.resolve_timeout;
        let token = self.token.child_token();

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                result = resolve_with_timeout(resolver.as_ref(), &query, limit) => {
                    let _ = tx.send(Intent::Refreshed { generation, result }).await;
                }
            }
        });
    }

    async fn on_refreshed(
        &mut self,
        generation: u64,
        result: std::result::Result<ResolvedTrack, ResolveError>,
    ) {
        if generation != self.load_generation {
            debug!("Resultado de refresco obsoleto (gen {}) descartado", generation);
            return;
        }
        let Some(request) = self.pending.take() else {
            return;
        };

        match result {
            Ok(resolved) => {
                if let Some(track) = self.queue.current_mut() {
                    track.refresh_locator(resolved);
                }
                if let StartResult::Failed = self.launch(request).await {
                    self.advance_after_failure().await;
                }
            }
            Err(e) => {
                warn!("❌ No se pudo refrescar el localizador: {}", e);
                if let Some(track) = self.queue.current().cloned() {
                    self.track_failed(track, ErrorKind::Resolution, e.to_string());
                }
                self.advance_after_failure().await;
            }
        }
    }

    // ---- Arranque de pistas ----

    /// Arranca la pista actual; si falla avanza hasta encontrar una que suene
    async fn play_current(&mut self, mut request: StartRequest) {
        loop {
            match self.try_start(request).await {
                StartResult::Started | StartResult::Pending | StartResult::Aborted => return,
                StartResult::Failed => {
                    if self.queue.advance().is_none() {
                        self.enter_draining();
                        return;
                    }
                    request = StartRequest::new_track();
                }
            }
        }
    }

    async fn try_start(&mut self, request: StartRequest) -> StartResult {
        let Some(track) = self.queue.current() else {
            self.set_state(PlayerState::Idle);
            return StartResult::Aborted;
        };
        let needs_refresh = track.needs_refresh(self.config.locator_ttl);
        let query = track.query().to_string();

        self.load_generation += 1;
        self.pending = None;
        self.set_state(PlayerState::Loading);

        if needs_refresh {
            self.spawn_refresh(query, request);
            return StartResult::Pending;
        }
        self.launch(request).await
    }

    /// Lanza el transcodificador y conecta su salida al canal de voz
    async fn launch(&mut self, request: StartRequest) -> StartResult {
        let Some(track) = self.queue.current().cloned() else {
            return StartResult::Aborted;
        };
        let offset = request.offset.filter(|_| !track.is_live());

        let args = match effects::get_options(
            self.effect,
            self.preset,
            track.platform(),
            track.is_live(),
            offset,
        ) {
            Ok(args) => args,
            Err(e) => {
                self.track_failed(track, ErrorKind::TranscodeSpawn, e.to_string());
                return StartResult::Failed;
            }
        };

        let spawned = match self.transcoder.spawn(track.stream_url(), &args).await {
            Ok(spawned) => Ok(spawned),
            Err(e) => {
                warn!("⚠️ Falló el transcodificador ({}), reintentando", e);
                self.transcoder.spawn(track.stream_url(), &args).await
            }
        };
        let (pcm, mut process) = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                error!("❌ Transcodificador no disponible para {}: {}", track.title(), e);
                self.track_failed(track, ErrorKind::TranscodeSpawn, e.to_string());
                return StartResult::Failed;
            }
        };

        if let Err(e) = self.voice.play(pcm, self.volume).await {
            error!("❌ No se pudo reproducir en el canal de voz: {}", e);
            process.terminate(self.config.stop_grace).await;
            let _ = process.wait().await;
            self.emit_error(ErrorKind::VoiceConnectionLost, e.to_string());
            self.exit = Some(ExitCause::VoiceLost);
            return StartResult::Aborted;
        }

        let clock = PlaybackClock::start(offset.unwrap_or_default(), track.length());
        match track.length() {
            TrackLength::Finite(total) => info!(
                "🎵 Reproduciendo: {} [{} / {}]",
                track.title(),
                format_time(clock.position()),
                format_time(total)
            ),
            TrackLength::Live => info!("🔴 Reproduciendo en directo: {}", track.title()),
        }

        self.session = Some(Session {
            track: track.clone(),
            process,
            clock,
            expiry_retried: request.expiry_retried,
        });
        self.set_state(PlayerState::Playing);
        self.start_ticker(clock);

        if request.announce {
            self.events.emit(EventKind::TrackStarted {
                track,
                position: self.queue.current_index() + 1,
                total: self.queue.len(),
            });
        }
        StartResult::Started
    }

    // ---- Final de pista ----

    async fn on_process_exit(&mut self, outcome: ExitOutcome) {
        self.cancel_ticker();
        let Some(session) = self.session.take() else {
            return;
        };
        self.voice.stop();

        match outcome {
            ExitOutcome::Finished => {
                info!("✅ Terminó: {}", session.track.title());
                self.finish_current(TrackEndReason::Finished).await;
            }
            ExitOutcome::Terminated => self.finish_current(TrackEndReason::Stopped).await,
            ExitOutcome::Expired if !session.expiry_retried => {
                warn!("⌛ Stream caducado, resolviendo de nuevo: {}", session.track.title());
                let offset = (!session.track.is_live()).then(|| session.clock.position());
                if let Some(track) = self.queue.current_mut() {
                    track.mark_stale();
                }
                self.play_current(StartRequest {
                    offset,
                    announce: false,
                    expiry_retried: true,
                })
                .await;
            }
            ExitOutcome::Expired => {
                self.track_failed(
                    session.track,
                    ErrorKind::StreamExpired,
                    EngineError::StreamExpired.to_string(),
                );
                self.advance_after_failure().await;
            }
            ExitOutcome::Failed(stderr) => {
                error!("❌ ffmpeg falló con {}: {}", session.track.title(), stderr);
                let message = stderr
                    .lines()
                    .last()
                    .unwrap_or("el transcodificador terminó con error")
                    .to_string();
                self.track_failed(session.track, ErrorKind::Playback, message);
                self.advance_after_failure().await;
            }
        }
    }

    /// Mismo camino para el final natural y para el salto
    async fn finish_current(&mut self, reason: TrackEndReason) {
        let Some(track) = self.queue.current().cloned() else {
            self.enter_draining();
            return;
        };
        self.events.emit(EventKind::TrackEnded { track, reason });

        match self.queue.loop_mode() {
            LoopMode::Single => {
                if let Some(current) = self.queue.current_mut() {
                    current.mark_stale();
                }
                self.queue.get_next();
                self.play_current(StartRequest::new_track()).await;
            }
            LoopMode::All => {
                self.queue.requeue_current();
                self.queue_changed();
                self.play_current(StartRequest::new_track()).await;
            }
            LoopMode::Off => self.play_next().await,
        }
    }

    async fn play_next(&mut self) {
        if self.queue.get_next().is_some() {
            self.queue_changed();
            self.play_current(StartRequest::new_track()).await;
        } else {
            self.queue_changed();
            self.enter_draining();
        }
    }

    async fn advance_after_failure(&mut self) {
        if self.queue.advance().is_some() {
            self.play_current(StartRequest::new_track()).await;
        } else {
            self.enter_draining();
        }
    }

    fn track_failed(&mut self, track: Track, kind: ErrorKind, message: String) {
        self.emit_error(kind, message);
        self.events.emit(EventKind::TrackEnded {
            track,
            reason: TrackEndReason::Error,
        });
    }

    fn enter_draining(&mut self) {
        self.cancel_ticker();
        self.set_state(PlayerState::Draining);
        if self.inactivity.reason() != Some(InactivityReason::ChannelEmpty) {
            self.start_inactivity(InactivityReason::QueueDrained);
        }
    }

    /// Detiene el transcodificador activo y espera a que salga
    async fn stop_session(&mut self) -> Option<Session> {
        self.cancel_ticker();
        self.load_generation += 1;
        self.pending = None;

        let mut session = self.session.take()?;
        self.voice.stop();
        session.process.terminate(self.config.stop_grace).await;
        let outcome = session.process.wait().await;
        debug!("Proceso anterior terminó: {:?}", outcome);
        Some(session)
    }

    // ---- Comandos ----

    async fn skip(&mut self, user: UserId, forced: bool) -> Result<SkipOutcome> {
        if !matches!(
            self.state,
            PlayerState::Playing | PlayerState::Paused | PlayerState::Loading
        ) {
            return Err(EngineError::invalid("No hay nada reproduciéndose"));
        }
        let Some(current) = self.queue.current() else {
            return Err(EngineError::invalid("No hay nada reproduciéndose"));
        };
        let is_requester = current.requested_by() == user;
        let title = current.title().to_string();

        if !forced && !is_requester {
            let votes = self.queue.record_vote(user);
            let required = required_votes(self.listeners.unwrap_or(0));
            if votes < required {
                info!("🗳️ Voto para saltar: {}/{}", votes, required);
                return Ok(SkipOutcome::Voted { votes, required });
            }
        }

        info!("⏭️ Saltando: {}", title);
        self.stop_session().await;
        self.finish_current(TrackEndReason::Skipped).await;
        Ok(SkipOutcome::Skipped)
    }

    async fn previous(&mut self) -> Result<Track> {
        let track = self
            .queue
            .get_previous()
            .cloned()
            .ok_or_else(|| EngineError::invalid("No hay pista anterior"))?;

        if let Some(session) = self.stop_session().await {
            self.events.emit(EventKind::TrackEnded {
                track: session.track,
                reason: TrackEndReason::Skipped,
            });
        }
        info!("⏮️ Volviendo a: {}", track.title());
        self.queue_changed();
        self.play_current(StartRequest::new_track()).await;
        Ok(track)
    }

    fn pause(&mut self) -> Result<()> {
        match self.state {
            PlayerState::Paused => Ok(()),
            PlayerState::Playing => {
                let Some(session) = self.session.as_mut() else {
                    return Err(EngineError::invalid("No hay nada reproduciéndose"));
                };
                self.voice
                    .pause()
                    .map_err(|e| EngineError::Playback(e.to_string()))?;
                session.clock.pause();
                self.cancel_ticker();
                self.set_state(PlayerState::Paused);
                info!("⏸️ Reproducción pausada");
                Ok(())
            }
            _ => Err(EngineError::invalid("No hay nada reproduciéndose")),
        }
    }

    async fn resume(&mut self) -> Result<()> {
        match self.state {
            PlayerState::Playing => Ok(()),
            PlayerState::Paused => {
                let Some(session) = self.session.as_mut() else {
                    return Err(EngineError::invalid("No hay nada en pausa"));
                };
                self.voice
                    .resume()
                    .map_err(|e| EngineError::Playback(e.to_string()))?;
                session.clock.resume();
                let clock = session.clock;
                self.on_activity();
                self.set_state(PlayerState::Playing);
                self.start_ticker(clock);
                info!("▶️ Reproducción reanudada");
                Ok(())
            }
            PlayerState::Idle | PlayerState::Draining => {
                if self.queue.resume().is_none() {
                    return Err(EngineError::invalid("No hay nada para reanudar"));
                }
                self.on_activity();
                self.play_current(StartRequest::new_track()).await;
                Ok(())
            }
            _ => Err(EngineError::invalid("El reproductor está cargando")),
        }
    }

    async fn seek(&mut self, position: Duration) -> Result<()> {
        if !matches!(self.state, PlayerState::Playing | PlayerState::Paused) {
            return Err(EngineError::invalid("No hay nada reproduciéndose"));
        }
        let Some(session) = self.session.as_ref() else {
            return Err(EngineError::invalid("No hay nada reproduciéndose"));
        };

        match session.track.length() {
            TrackLength::Live => Err(EngineError::invalid(
                "No se puede adelantar en una transmisión en directo",
            )),
            TrackLength::Finite(total) if position >= total => Err(EngineError::invalid(format!(
                "La posición {} supera la duración {}",
                format_time(position),
                format_time(total)
            ))),
            TrackLength::Finite(_) => {
                info!("⏩ Saltando a {}", format_time(position));
                self.restart_at(Some(position)).await;
                Ok(())
            }
        }
    }

    async fn set_effect(&mut self, name: &str, intensity: Option<f64>) -> Result<EffectSettings> {
        let spec = EffectSpec::lookup(name)
            .ok_or_else(|| EngineError::invalid(format!("Efecto desconocido: {}", name)))?;
        let settings = spec.settings(intensity)?;

        self.effect = settings;
        info!("🎛️ Efecto aplicado: {} ({})", spec.label, settings.intensity);
        self.restart_if_active().await;
        Ok(settings)
    }

    fn set_volume(&mut self, volume: f32) -> f32 {
        let volume = volume.clamp(0.0, 2.0);
        self.volume = volume;
        if self.session.is_some() {
            if let Err(e) = self.voice.set_volume(volume) {
                warn!("⚠️ No se pudo ajustar el volumen: {}", e);
            }
        }
        info!("🔊 Volumen ajustado a {}%", (volume * 100.0) as u32);
        volume
    }

    fn on_listeners(&mut self, count: usize) {
        debug!("👥 Oyentes en guild {}: {:?} -> {}", self.guild_id, self.listeners, count);
        self.listeners = Some(count);

        if count == 0 {
            let active = matches!(
                self.state,
                PlayerState::Playing | PlayerState::Paused | PlayerState::Loading
            );
            if active && !self.inactivity.is_running() {
                self.start_inactivity(InactivityReason::ChannelEmpty);
            }
        } else {
            self.inactivity.cancel_if(InactivityReason::ChannelEmpty);
        }
    }

    /// Vuelve a haber algo que reproducir: cae el temporizador de cola vacía,
    /// pero sin oyentes sigue corriendo (o arranca) el de canal vacío
    fn on_activity(&mut self) {
        self.inactivity.cancel_if(InactivityReason::QueueDrained);
        if self.listeners == Some(0) && !self.inactivity.is_running() {
            self.start_inactivity(InactivityReason::ChannelEmpty);
        }
    }

    /// Reinicia la pista actual en la posición actual (efectos, presets)
    async fn restart_if_active(&mut self) {
        if matches!(self.state, PlayerState::Playing | PlayerState::Paused) {
            let offset = self
                .session
                .as_ref()
                .filter(|s| !s.track.is_live())
                .map(|s| s.clock.position());
            self.restart_at(offset).await;
        }
    }

    async fn restart_at(&mut self, offset: Option<Duration>) {
        self.stop_session().await;
        self.play_current(StartRequest::restart(offset)).await;
    }

    fn snapshot(&self) -> PlayerSnapshot {
        let active = matches!(
            self.state,
            PlayerState::Playing | PlayerState::Paused | PlayerState::Loading
        );

        PlayerSnapshot {
            state: self.state,
            current: active.then(|| self.queue.current().cloned()).flatten(),
            position: self.session.as_ref().map(|s| s.clock.position()),
            queue: self.queue.snapshot(),
            volume: self.volume,
            effect: self.effect,
            preset: self.preset,
            listeners: self.listeners.unwrap_or(0),
        }
    }

    // ---- Tareas hijas y eventos ----

    fn start_ticker(&mut self, clock: PlaybackClock) {
        self.cancel_ticker();
        let token = self.token.child_token();
        spawn_ticker(clock, self.events.clone(), token.clone());
        self.ticker = Some(token);
    }

    fn cancel_ticker(&mut self) {
        if let Some(token) = self.ticker.take() {
            token.cancel();
        }
    }

    fn start_inactivity(&mut self, reason: InactivityReason) {
        let Some(tx) = self.inbox_tx.upgrade() else {
            return;
        };
        self.inactivity
            .start(reason, &self.token, tx, |timer_id| Intent::InactivityExpired {
                timer_id,
            });
    }

    fn set_state(&mut self, state: PlayerState) {
        if self.state != state {
            debug!("Estado {:?} -> {:?} (guild {})", self.state, state, self.guild_id);
            self.state = state;
            self.events.emit(EventKind::StateChanged { state });
        }
    }

    fn queue_changed(&self) {
        self.events.emit(EventKind::QueueChanged {
            snapshot: self.queue.snapshot(),
        });
    }

    fn emit_error(&self, kind: ErrorKind, message: String) {
        self.events.emit(EventKind::ErrorOccurred { kind, message });
    }

    /// Transcodificador, ticker, temporizador, token y registro, en ese orden
    async fn teardown(&mut self, cause: ExitCause) {
        info!("👋 Cerrando reproductor de guild {} ({:?})", self.guild_id, cause);

        if let Some(mut session) = self.session.take() {
            session.process.terminate(self.config.stop_grace).await;
            let _ = session.process.wait().await;
            self.events.emit(EventKind::TrackEnded {
                track: session.track,
                reason: TrackEndReason::Stopped,
            });
        }
        self.cancel_ticker();
        self.inactivity.cancel();

        self.voice.stop();
        self.voice.disconnect().await;

        self.token.cancel();
        self.inbox.close();
        self.set_state(PlayerState::Destroyed);

        let instance = self.instance;
        self.engines
            .remove_if(&self.guild_id, |_, entry| entry.instance == instance);

        if let ExitCause::Idle(_) = cause {
            self.events.emit(EventKind::IdleDisconnect);
        }
        if let Some(reply) = self.leave_reply.take() {
            let _ = reply.send(Ok(()));
        }
    }
}

async fn resolve_with_timeout(
    resolver: &dyn TrackResolver,
    query: &str,
    limit: Duration,
) -> std::result::Result<ResolvedTrack, ResolveError> {
    match tokio::time::timeout(limit, resolver.resolve(query)).await {
        Ok(result) => result,
        Err(_) => Err(ResolveError::Failed(format!(
            "timeout tras {}",
            humantime::format_duration(limit)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::{
            effects::FfmpegArgs,
            events::EngineEvent,
            registry::GuildEngineRegistry,
            track::Platform,
            transcoder::{PcmStream, TranscodeError},
            voice::VoiceError,
        },
        sources::MockTrackResolver,
    };
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::time::sleep;

    const GUILD: GuildId = GuildId::new(7);
    const ALICE: UserId = UserId::new(1);
    const BOB: UserId = UserId::new(2);
    const CAROL: UserId = UserId::new(3);

    // ---- Dobles de prueba ----

    struct FakeProcess {
        exit: mpsc::UnboundedReceiver<ExitOutcome>,
        done: Option<ExitOutcome>,
        terminated: Arc<AtomicBool>,
    }

    #[async_trait]
    impl TranscodeProcess for FakeProcess {
        async fn wait(&mut self) -> ExitOutcome {
            if let Some(outcome) = &self.done {
                return outcome.clone();
            }
            match self.exit.recv().await {
                Some(outcome) => {
                    self.done = Some(outcome.clone());
                    outcome
                }
                None => std::future::pending().await,
            }
        }

        async fn terminate(&mut self, _grace: Duration) {
            self.terminated.store(true, Ordering::SeqCst);
            if self.done.is_none() {
                self.done = Some(ExitOutcome::Terminated);
            }
        }
    }

    struct Spawned {
        input: String,
        args: FfmpegArgs,
        exit: mpsc::UnboundedSender<ExitOutcome>,
        terminated: Arc<AtomicBool>,
    }

    #[derive(Default)]
    struct FakeTranscoder {
        spawned: Mutex<Vec<Spawned>>,
        failures: AtomicUsize,
    }

    impl FakeTranscoder {
        fn count(&self) -> usize {
            self.spawned.lock().len()
        }

        fn end(&self, index: usize, outcome: ExitOutcome) {
            self.spawned.lock()[index].exit.send(outcome).unwrap();
        }

        fn fail_next(&self, n: usize) {
            self.failures.store(n, Ordering::SeqCst);
        }

        fn input(&self, index: usize) -> String {
            self.spawned.lock()[index].input.clone()
        }

        fn last_args(&self) -> FfmpegArgs {
            self.spawned.lock().last().unwrap().args.clone()
        }

        fn terminated(&self, index: usize) -> bool {
            self.spawned.lock()[index].terminated.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transcoder for FakeTranscoder {
        async fn spawn(
            &self,
            input: &str,
            args: &FfmpegArgs,
        ) -> std::result::Result<(PcmStream, Box<dyn TranscodeProcess>), TranscodeError> {
            let pending = self.failures.load(Ordering::SeqCst);
            if pending > 0 {
                self.failures.store(pending - 1, Ordering::SeqCst);
                return Err(TranscodeError::Spawn {
                    binary: "ffmpeg".into(),
                    reason: "not found".into(),
                });
            }

            let (tx, rx) = mpsc::unbounded_channel();
            let terminated = Arc::new(AtomicBool::new(false));
            self.spawned.lock().push(Spawned {
                input: input.to_string(),
                args: args.clone(),
                exit: tx,
                terminated: terminated.clone(),
            });

            let pcm: PcmStream = Box::new(tokio::io::empty());
            let process: Box<dyn TranscodeProcess> = Box::new(FakeProcess {
                exit: rx,
                done: None,
                terminated,
            });
            Ok((pcm, process))
        }
    }

    #[derive(Default)]
    struct FakeVoice {
        calls: Mutex<Vec<String>>,
        /// El driver ya soltó la pista: los controles fallan
        detached: AtomicBool,
    }

    impl FakeVoice {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().push(call.into());
        }

        fn control(&self, call: &str) -> std::result::Result<(), VoiceError> {
            if self.detached.load(Ordering::SeqCst) {
                return Err(VoiceError::Driver("track ended".into()));
            }
            self.record(call);
            Ok(())
        }
    }

    #[async_trait]
    impl VoiceConnection for FakeVoice {
        async fn play(&self, _pcm: PcmStream, volume: f32) -> std::result::Result<(), VoiceError> {
            self.record(format!("play@{}", volume));
            Ok(())
        }

        fn stop(&self) {
            self.record("stop");
        }

        fn pause(&self) -> std::result::Result<(), VoiceError> {
            self.control("pause")
        }

        fn resume(&self) -> std::result::Result<(), VoiceError> {
            self.control("resume")
        }

        fn set_volume(&self, volume: f32) -> std::result::Result<(), VoiceError> {
            self.record(format!("volume@{}", volume));
            Ok(())
        }

        async fn disconnect(&self) {
            self.record("disconnect");
        }
    }

    /// Resolver lento: 1s para búsquedas, 10s para refrescar localizadores
    struct SlowResolver;

    #[async_trait]
    impl TrackResolver for SlowResolver {
        async fn resolve(&self, query: &str) -> std::result::Result<ResolvedTrack, ResolveError> {
            let delay = if query.starts_with("https://") { 10 } else { 1 };
            sleep(Duration::from_secs(delay)).await;
            Ok(resolved(query))
        }
    }

    fn resolved(query: &str) -> ResolvedTrack {
        let name = query.rsplit('/').next().unwrap_or(query).to_string();
        let live = name.starts_with("live");
        ResolvedTrack {
            id: name.clone(),
            title: name.clone(),
            direct_url: format!("https://cdn.test/{}", name),
            duration: (!live).then(|| Duration::from_secs(200)),
            is_live: live,
            platform: Platform::Other,
            uploader: None,
            thumbnail: None,
            webpage_url: Some(format!("https://site.test/{}", name)),
        }
    }

    fn mock_resolver() -> MockTrackResolver {
        let mut resolver = MockTrackResolver::new();
        resolver.expect_resolve().returning(|query| {
            if query.contains("missing") {
                Err(ResolveError::NotFound(query.to_string()))
            } else if query == "https://site.test/flaky" {
                Err(ResolveError::Unplayable("Private video".into()))
            } else {
                Ok(resolved(query))
            }
        });
        resolver
    }

    struct Harness {
        registry: GuildEngineRegistry,
        handle: GuildHandle,
        events: flume::Receiver<EngineEvent>,
        transcoder: Arc<FakeTranscoder>,
        voice: Arc<FakeVoice>,
    }

    fn harness_with(resolver: Arc<dyn TrackResolver>, config: EngineConfig) -> Harness {
        let (tx, rx) = flume::unbounded();
        let transcoder = Arc::new(FakeTranscoder::default());
        let voice = Arc::new(FakeVoice::default());

        let registry = GuildEngineRegistry::new(EngineDeps {
            resolver,
            transcoder: transcoder.clone(),
            events: tx,
            config,
        });
        let handle = registry.get_or_spawn(GUILD, voice.clone());

        Harness {
            registry,
            handle,
            events: rx,
            transcoder,
            voice,
        }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(mock_resolver()), EngineConfig::default())
    }

    async fn settle() {
        sleep(Duration::from_millis(50)).await;
    }

    impl Harness {
        fn drain(&self) -> Vec<EventKind> {
            self.events.drain().map(|e| e.kind).collect()
        }

        async fn add(&self, query: &str) -> AddedTrack {
            self.handle.add_track(query, ALICE).await.unwrap()
        }

        async fn current_title(&self) -> Option<String> {
            let snapshot = self.handle.snapshot().await.unwrap();
            snapshot.current.map(|t| t.title().to_string())
        }
    }

    fn states(events: &[EventKind]) -> Vec<PlayerState> {
        events
            .iter()
            .filter_map(|e| match e {
                EventKind::StateChanged { state } => Some(*state),
                _ => None,
            })
            .collect()
    }

    fn started(events: &[EventKind]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                EventKind::TrackStarted { track, .. } => Some(track.title().to_string()),
                _ => None,
            })
            .collect()
    }

    fn ended(events: &[EventKind]) -> Vec<(String, TrackEndReason)> {
        events
            .iter()
            .filter_map(|e| match e {
                EventKind::TrackEnded { track, reason } => Some((track.title().to_string(), *reason)),
                _ => None,
            })
            .collect()
    }

    fn errors(events: &[EventKind]) -> Vec<ErrorKind> {
        events
            .iter()
            .filter_map(|e| match e {
                EventKind::ErrorOccurred { kind, .. } => Some(*kind),
                _ => None,
            })
            .collect()
    }

    fn seek_arg(args: &FfmpegArgs) -> Option<f64> {
        let i = args.pre_args.iter().position(|a| a == "-ss")?;
        args.pre_args.get(i + 1)?.parse().ok()
    }

    // ---- Ciclo de vida ----

    #[tokio::test(start_paused = true)]
    async fn first_track_goes_idle_loading_playing() {
        let h = harness();

        let added = h.add("A").await;
        assert_eq!(added.position, 0);
        settle().await;

        let events = h.drain();
        assert_eq!(states(&events), vec![PlayerState::Loading, PlayerState::Playing]);
        assert_eq!(started(&events), vec!["A"]);
        assert_eq!(h.transcoder.count(), 1);
        assert_eq!(h.transcoder.input(0), "https://cdn.test/A");
        assert_eq!(h.voice.calls(), vec!["play@0.5"]);
    }

    #[tokio::test(start_paused = true)]
    async fn second_track_waits_in_queue() {
        let h = harness();
        h.add("A").await;
        let added = h.add("B").await;
        settle().await;

        assert_eq!(added.position, 1);
        assert_eq!(started(&h.drain()), vec!["A"]);
        assert_eq!(h.current_title().await.as_deref(), Some("A"));
    }

    #[tokio::test(start_paused = true)]
    async fn unresolvable_query_is_rejected_without_state_change() {
        let h = harness();

        let result = h.handle.add_track("missing song", ALICE).await;
        assert!(matches!(
            result,
            Err(EngineError::Resolution(ResolveError::NotFound(_)))
        ));

        let snapshot = h.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, PlayerState::Idle);
        assert!(snapshot.queue.tracks.is_empty());
        assert_eq!(h.transcoder.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn natural_end_advances_then_drains() {
        let h = harness();
        h.add("A").await;
        h.add("B").await;
        settle().await;
        h.drain();

        h.transcoder.end(0, ExitOutcome::Finished);
        settle().await;
        let events = h.drain();
        assert_eq!(ended(&events), vec![("A".to_string(), TrackEndReason::Finished)]);
        assert_eq!(started(&events), vec!["B"]);

        h.transcoder.end(1, ExitOutcome::Finished);
        settle().await;
        let events = h.drain();
        assert_eq!(states(&events), vec![PlayerState::Draining]);
        assert!(h.registry.contains(GUILD));
    }

    #[tokio::test(start_paused = true)]
    async fn adding_while_draining_plays_the_new_track() {
        let h = harness();
        h.add("A").await;
        settle().await;
        h.transcoder.end(0, ExitOutcome::Finished);
        settle().await;
        h.drain();

        h.add("B").await;
        settle().await;
        let events = h.drain();
        assert_eq!(states(&events), vec![PlayerState::Loading, PlayerState::Playing]);
        assert_eq!(started(&events), vec!["B"]);

        // El temporizador de la cola vacía quedó cancelado
        sleep(Duration::from_secs(300)).await;
        assert!(h.registry.contains(GUILD));
        assert!(!h.drain().iter().any(|e| matches!(e, EventKind::IdleDisconnect)));
    }

    // ---- Skip y votos ----

    #[tokio::test(start_paused = true)]
    async fn forced_skip_ends_current_then_starts_next() {
        let h = harness();
        h.add("A").await;
        h.add("B").await;
        settle().await;
        h.drain();

        let outcome = h.handle.skip_vote(BOB, true).await.unwrap();
        assert_eq!(outcome, SkipOutcome::Skipped);

        let events = h.drain();
        let ended_at = events
            .iter()
            .position(|e| matches!(e, EventKind::TrackEnded { reason: TrackEndReason::Skipped, track } if track.title() == "A"))
            .unwrap();
        let started_at = events
            .iter()
            .position(|e| matches!(e, EventKind::TrackStarted { track, .. } if track.title() == "B"))
            .unwrap();
        assert!(ended_at < started_at);
        assert!(h.transcoder.terminated(0));
        assert_eq!(h.transcoder.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn two_of_three_listeners_skip() {
        let h = harness();
        h.add("A").await;
        h.add("B").await;
        h.handle.listeners_changed(3).await.unwrap();
        settle().await;

        let first = h.handle.skip_vote(BOB, false).await.unwrap();
        assert_eq!(first, SkipOutcome::Voted { votes: 1, required: 2 });

        // Votar dos veces no cuenta doble
        let again = h.handle.skip_vote(BOB, false).await.unwrap();
        assert_eq!(again, SkipOutcome::Voted { votes: 1, required: 2 });
        assert_eq!(h.current_title().await.as_deref(), Some("A"));

        let second = h.handle.skip_vote(CAROL, false).await.unwrap();
        assert_eq!(second, SkipOutcome::Skipped);
        settle().await;
        assert_eq!(h.current_title().await.as_deref(), Some("B"));
        assert_eq!(h.handle.snapshot().await.unwrap().queue.skip_votes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn requester_skips_own_track_without_votes() {
        let h = harness();
        h.add("A").await;
        h.add("B").await;
        h.handle.listeners_changed(5).await.unwrap();
        settle().await;

        let outcome = h.handle.skip_vote(ALICE, false).await.unwrap();
        assert_eq!(outcome, SkipOutcome::Skipped);
    }

    #[tokio::test(start_paused = true)]
    async fn skip_with_nothing_playing_is_invalid() {
        let h = harness();
        assert!(matches!(
            h.handle.skip_vote(BOB, true).await,
            Err(EngineError::InvalidCommand(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn previous_replays_earlier_track() {
        let h = harness();
        h.add("A").await;
        h.add("B").await;
        settle().await;
        h.handle.skip_vote(ALICE, true).await.unwrap();
        h.drain();

        let track = h.handle.previous().await.unwrap();
        assert_eq!(track.title(), "A");
        let events = h.drain();
        assert_eq!(ended(&events), vec![("B".to_string(), TrackEndReason::Skipped)]);
        assert_eq!(started(&events), vec!["A"]);
    }

    // ---- Loops ----

    #[tokio::test(start_paused = true)]
    async fn loop_single_restarts_same_track_with_fresh_votes() {
        let h = harness();
        h.add("A").await;
        h.add("B").await;
        h.handle.set_loop_mode(LoopMode::Single).await.unwrap();
        h.handle.listeners_changed(3).await.unwrap();
        settle().await;
        h.handle.skip_vote(BOB, false).await.unwrap();
        h.drain();

        h.transcoder.end(0, ExitOutcome::Finished);
        settle().await;

        let snapshot = h.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.current.unwrap().title(), "A");
        assert_eq!(snapshot.queue.skip_votes, 0);
        assert_eq!(h.transcoder.count(), 2);
        assert_eq!(started(&h.drain()), vec!["A"]);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_all_requeues_finished_track() {
        let h = harness();
        h.add("A").await;
        h.add("B").await;
        h.handle.set_loop_mode(LoopMode::All).await.unwrap();
        settle().await;

        h.transcoder.end(0, ExitOutcome::Finished);
        settle().await;

        let snapshot = h.handle.snapshot().await.unwrap();
        let titles: Vec<_> = snapshot.queue.tracks.iter().map(|t| t.title().to_string()).collect();
        assert_eq!(titles, vec!["B", "A"]);
        assert_eq!(snapshot.current.unwrap().title(), "B");
        assert!(snapshot.queue.tracks[1].needs_refresh(Duration::from_secs(3600)));
    }

    #[tokio::test(start_paused = true)]
    async fn loop_all_keeps_queue_length_constant() {
        let h = harness();
        h.add("A").await;
        h.add("B").await;
        h.handle.set_loop_mode(LoopMode::All).await.unwrap();
        settle().await;
        h.drain();

        for i in 0..6 {
            h.transcoder.end(i, ExitOutcome::Finished);
            settle().await;
        }

        let events = h.drain();
        assert_eq!(started(&events), vec!["B", "A", "B", "A", "B", "A"]);
        let snapshot = h.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.queue.tracks.len(), 2);
        assert_eq!(snapshot.current.unwrap().title(), "A");
        assert_eq!(h.transcoder.count(), 7);
    }

    // ---- Cola ----

    #[tokio::test(start_paused = true)]
    async fn removing_current_is_rejected_but_next_is_not() {
        let h = harness();
        h.add("A").await;
        h.add("B").await;
        settle().await;

        assert!(matches!(
            h.handle.remove_track(0).await,
            Err(EngineError::InvalidCommand(_))
        ));
        let removed = h.handle.remove_track(1).await.unwrap();
        assert_eq!(removed.title(), "B");
        assert_eq!(h.handle.snapshot().await.unwrap().queue.tracks.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_commands_keep_current_track() {
        let h = harness();
        for q in ["A", "B", "C", "D"] {
            h.add(q).await;
        }
        settle().await;

        assert!(h.handle.shuffle().await.unwrap());
        h.handle.move_track(3, 1).await.unwrap();
        assert!(h.handle.move_track(0, 2).await.is_err());
        assert_eq!(h.handle.clear().await.unwrap(), 3);

        let snapshot = h.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.queue.tracks.len(), 1);
        assert_eq!(snapshot.current.unwrap().title(), "A");
        assert_eq!(h.transcoder.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_rejects_new_tracks() {
        let config = EngineConfig {
            max_queue_size: 1,
            ..EngineConfig::default()
        };
        let h = harness_with(Arc::new(mock_resolver()), config);
        h.add("A").await;

        assert_eq!(
            h.handle.add_track("B", ALICE).await.unwrap_err(),
            EngineError::QueueFull(1)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn played_tracks_free_room_in_a_full_queue() {
        let config = EngineConfig {
            max_queue_size: 2,
            ..EngineConfig::default()
        };
        let h = harness_with(Arc::new(mock_resolver()), config);
        h.add("A").await;
        h.add("B").await;
        settle().await;
        assert_eq!(
            h.handle.add_track("C", ALICE).await.unwrap_err(),
            EngineError::QueueFull(2)
        );

        h.transcoder.end(0, ExitOutcome::Finished);
        settle().await;
        h.transcoder.end(1, ExitOutcome::Finished);
        settle().await;
        h.drain();

        let added = h.add("C").await;
        assert_eq!(added.track.title(), "C");
        settle().await;
        assert_eq!(started(&h.drain()), vec!["C"]);
        assert_eq!(h.current_title().await.as_deref(), Some("C"));
    }

    // ---- Pausa, seek y efectos ----

    #[tokio::test(start_paused = true)]
    async fn double_pause_freezes_position_once() {
        let h = harness();
        h.add("A").await;
        settle().await;
        sleep(Duration::from_secs(10)).await;

        h.handle.pause().await.unwrap();
        h.handle.pause().await.unwrap();
        let paused = h.handle.snapshot().await.unwrap();
        assert_eq!(paused.state, PlayerState::Paused);
        let frozen = paused.position.unwrap();

        sleep(Duration::from_secs(30)).await;
        assert_eq!(h.handle.snapshot().await.unwrap().position, Some(frozen));

        h.handle.resume().await.unwrap();
        sleep(Duration::from_secs(5)).await;
        let position = h.handle.snapshot().await.unwrap().position.unwrap();
        assert!(position.abs_diff(frozen + Duration::from_secs(5)) <= Duration::from_secs(1));
        assert_eq!(
            h.voice.calls().iter().filter(|c| *c == "pause").count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn progress_ticks_stop_while_paused() {
        let h = harness();
        h.add("A").await;
        settle().await;
        sleep(Duration::from_millis(3500)).await;
        h.handle.pause().await.unwrap();
        let ticks = h
            .drain()
            .iter()
            .filter(|e| matches!(e, EventKind::ProgressTick { .. }))
            .count();
        assert_eq!(ticks, 3);

        sleep(Duration::from_secs(10)).await;
        assert!(!h.drain().iter().any(|e| matches!(e, EventKind::ProgressTick { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn seek_restarts_at_offset_without_announcing() {
        let h = harness();
        h.add("A").await;
        settle().await;

        h.handle.seek(Duration::from_secs(90)).await.unwrap();
        let position = h.handle.snapshot().await.unwrap().position.unwrap();
        assert!(position.abs_diff(Duration::from_secs(90)) <= Duration::from_secs(1));

        assert_eq!(h.transcoder.count(), 2);
        assert!(h.transcoder.terminated(0));
        assert_eq!(seek_arg(&h.transcoder.last_args()), Some(90.0));
        assert_eq!(started(&h.drain()), vec!["A"]);
    }

    #[tokio::test(start_paused = true)]
    async fn seek_is_rejected_past_end_and_on_live() {
        let h = harness();
        h.add("A").await;
        settle().await;
        assert!(matches!(
            h.handle.seek(Duration::from_secs(200)).await,
            Err(EngineError::InvalidCommand(_))
        ));

        let live = harness();
        live.add("live-radio").await;
        settle().await;
        assert!(matches!(
            live.handle.seek(Duration::from_secs(5)).await,
            Err(EngineError::InvalidCommand(_))
        ));
        assert_eq!(live.transcoder.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn effect_change_restarts_at_current_position() {
        let h = harness();
        h.add("A").await;
        settle().await;
        sleep(Duration::from_secs(20)).await;

        let settings = h.handle.set_effect("nightcore", Some(1.3)).await.unwrap();
        assert_eq!(settings.name, "nightcore");
        assert_eq!(h.transcoder.count(), 2);

        let args = h.transcoder.last_args();
        assert!(args.filter_args.iter().any(|a| a.contains("asetrate=57330")));
        let offset = seek_arg(&args).unwrap();
        assert!((offset - 20.0).abs() <= 1.0);
        assert_eq!(started(&h.drain()), vec!["A"]);

        assert!(matches!(
            h.handle.set_effect("bassboost", Some(99.0)).await,
            Err(EngineError::InvalidCommand(_))
        ));
        assert_eq!(h.transcoder.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn live_effect_change_restarts_without_offset() {
        let h = harness();
        h.add("live-radio").await;
        settle().await;
        sleep(Duration::from_secs(20)).await;

        h.handle.set_quality_preset(QualityPreset::Voice).await.unwrap();
        assert_eq!(h.transcoder.count(), 2);
        assert_eq!(seek_arg(&h.transcoder.last_args()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn volume_is_clamped_and_applied() {
        let h = harness();
        h.add("A").await;
        settle().await;

        assert_eq!(h.handle.set_volume(5.0).await.unwrap(), 2.0);
        assert!(h.voice.calls().contains(&"volume@2".to_string()));
        assert_eq!(h.handle.snapshot().await.unwrap().volume, 2.0);
    }

    // ---- Fallos ----

    #[tokio::test(start_paused = true)]
    async fn spawn_failure_is_retried_once() {
        let h = harness();
        h.transcoder.fail_next(1);
        h.add("A").await;
        settle().await;

        let events = h.drain();
        assert_eq!(started(&events), vec!["A"]);
        assert!(errors(&events).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_spawn_failure_skips_track() {
        let h = harness();
        h.transcoder.fail_next(2);
        h.add("A").await;
        settle().await;

        let events = h.drain();
        assert_eq!(errors(&events), vec![ErrorKind::TranscodeSpawn]);
        assert_eq!(ended(&events), vec![("A".to_string(), TrackEndReason::Error)]);
        assert_eq!(states(&events).last(), Some(&PlayerState::Draining));

        h.add("B").await;
        settle().await;
        assert_eq!(started(&h.drain()), vec!["B"]);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_failure_skips_even_in_single_loop() {
        let h = harness();
        h.add("flaky").await;
        h.add("B").await;
        h.handle.set_loop_mode(LoopMode::Single).await.unwrap();
        settle().await;
        h.drain();

        h.transcoder.end(0, ExitOutcome::Finished);
        settle().await;

        let events = h.drain();
        assert_eq!(errors(&events), vec![ErrorKind::Resolution]);
        assert_eq!(started(&events), vec!["B"]);
        assert_eq!(h.current_title().await.as_deref(), Some("B"));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_stream_is_refreshed_once_at_current_position() {
        let h = harness();
        h.add("A").await;
        settle().await;
        sleep(Duration::from_secs(30)).await;
        h.drain();

        h.transcoder.end(0, ExitOutcome::Expired);
        settle().await;
        assert_eq!(h.transcoder.count(), 2);
        let offset = seek_arg(&h.transcoder.last_args()).unwrap();
        assert!((offset - 30.0).abs() <= 1.0);
        let events = h.drain();
        assert!(started(&events).is_empty());
        assert!(errors(&events).is_empty());

        // Segunda caducidad en el mismo arranque: se salta
        h.transcoder.end(1, ExitOutcome::Expired);
        settle().await;
        let events = h.drain();
        assert_eq!(errors(&events), vec![ErrorKind::StreamExpired]);
        assert_eq!(ended(&events), vec![("A".to_string(), TrackEndReason::Error)]);
    }

    #[tokio::test(start_paused = true)]
    async fn transcoder_failure_mid_track_skips() {
        let h = harness();
        h.add("A").await;
        h.add("B").await;
        settle().await;
        h.drain();

        h.transcoder
            .end(0, ExitOutcome::Failed("Invalid data found".into()));
        settle().await;

        let events = h.drain();
        assert_eq!(errors(&events), vec![ErrorKind::Playback]);
        assert_eq!(started(&events), vec!["B"]);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_refresh_result_is_discarded_after_skip() {
        let config = EngineConfig {
            locator_ttl: Duration::ZERO,
            ..EngineConfig::default()
        };
        let h = harness_with(Arc::new(SlowResolver), config);

        // t=1: A encolada, refresco en curso hasta t=11
        h.add("A").await;
        // t=2: B encolada
        h.add("B").await;
        h.handle.skip_vote(ALICE, true).await.unwrap();

        sleep(Duration::from_secs(15)).await;
        let events = h.drain();
        assert_eq!(ended(&events), vec![("A".to_string(), TrackEndReason::Skipped)]);
        assert_eq!(started(&events), vec!["B"]);
        assert_eq!(h.transcoder.count(), 1);
        assert_eq!(h.transcoder.input(0), "https://cdn.test/B");
    }

    // ---- Desmontaje ----

    #[tokio::test(start_paused = true)]
    async fn drained_queue_disconnects_after_idle_timeout() {
        let h = harness();
        h.add("A").await;
        settle().await;
        h.transcoder.end(0, ExitOutcome::Finished);
        h.handle.listeners_changed(0).await.unwrap();
        settle().await;

        sleep(Duration::from_secs(179)).await;
        assert!(h.registry.contains(GUILD));

        sleep(Duration::from_secs(2)).await;
        let events = h.drain();
        let disconnects = events
            .iter()
            .filter(|e| matches!(e, EventKind::IdleDisconnect))
            .count();
        assert_eq!(disconnects, 1);
        assert!(!h.registry.contains(GUILD));
        assert!(h.voice.calls().contains(&"disconnect".to_string()));
        assert_eq!(h.handle.snapshot().await.unwrap_err(), EngineError::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_channel_disconnects_unless_someone_returns() {
        let h = harness();
        h.add("A").await;
        settle().await;

        h.handle.listeners_changed(0).await.unwrap();
        sleep(Duration::from_secs(30)).await;
        h.handle.listeners_changed(1).await.unwrap();
        sleep(Duration::from_secs(60)).await;
        assert!(h.registry.contains(GUILD));

        h.handle.listeners_changed(0).await.unwrap();
        sleep(Duration::from_secs(61)).await;
        assert!(!h.registry.contains(GUILD));
        assert!(h.transcoder.terminated(0));
        assert!(h.drain().iter().any(|e| matches!(e, EventKind::IdleDisconnect)));
    }

    #[tokio::test(start_paused = true)]
    async fn adding_a_track_keeps_the_empty_channel_timer() {
        let h = harness();
        h.add("A").await;
        settle().await;

        h.handle.listeners_changed(0).await.unwrap();
        sleep(Duration::from_secs(10)).await;
        h.add("B").await;

        sleep(Duration::from_secs(51)).await;
        assert!(!h.registry.contains(GUILD));
        assert!(h.drain().iter().any(|e| matches!(e, EventKind::IdleDisconnect)));
    }

    #[tokio::test(start_paused = true)]
    async fn playing_again_with_nobody_listening_arms_empty_channel_timer() {
        let h = harness();
        h.add("A").await;
        settle().await;
        h.transcoder.end(0, ExitOutcome::Finished);
        settle().await;
        h.handle.listeners_changed(0).await.unwrap();

        h.add("B").await;
        settle().await;
        assert_eq!(h.current_title().await.as_deref(), Some("B"));

        sleep(Duration::from_secs(59)).await;
        assert!(h.registry.contains(GUILD));
        sleep(Duration::from_secs(2)).await;
        assert!(!h.registry.contains(GUILD));
        assert!(h.transcoder.terminated(1));
    }

    #[tokio::test(start_paused = true)]
    async fn track_control_failure_is_reported_without_teardown() {
        let h = harness();
        h.add("A").await;
        settle().await;

        h.voice.detached.store(true, Ordering::SeqCst);
        assert!(matches!(
            h.handle.pause().await,
            Err(EngineError::Playback(_))
        ));

        assert!(h.registry.contains(GUILD));
        let snapshot = h.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, PlayerState::Playing);
        assert!(!h.voice.calls().contains(&"disconnect".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn leave_tears_everything_down() {
        let h = harness();
        h.add("A").await;
        settle().await;
        h.drain();

        h.handle.leave().await.unwrap();

        assert!(!h.registry.contains(GUILD));
        assert!(h.transcoder.terminated(0));
        assert!(h.handle.is_closed());
        let events = h.drain();
        assert_eq!(ended(&events), vec![("A".to_string(), TrackEndReason::Stopped)]);
        assert_eq!(states(&events), vec![PlayerState::Destroyed]);
        assert!(!events.iter().any(|e| matches!(e, EventKind::IdleDisconnect)));

        // Un nuevo comando crea un reproductor nuevo
        let voice: Arc<dyn VoiceConnection> = h.voice.clone();
        let fresh = h.registry.get_or_spawn(GUILD, voice);
        assert!(!fresh.is_closed());
        assert_eq!(
            fresh.snapshot().await.unwrap().state,
            PlayerState::Idle
        );
    }

    #[tokio::test(start_paused = true)]
    async fn voice_loss_reports_and_tears_down() {
        let h = harness();
        h.add("A").await;
        settle().await;
        h.drain();

        h.handle.voice_lost().await.unwrap();
        h.handle.closed().await;

        assert!(!h.registry.contains(GUILD));
        let events = h.drain();
        assert_eq!(errors(&events), vec![ErrorKind::VoiceConnectionLost]);
        assert!(!events.iter().any(|e| matches!(e, EventKind::IdleDisconnect)));
        assert_eq!(h.handle.pause().await, Err(EngineError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn registry_shutdown_stops_all_engines() {
        let h = harness();
        h.add("A").await;
        settle().await;

        h.registry.shutdown().await;
        assert!(h.registry.is_empty());
        assert!(h.transcoder.terminated(0));
    }
}
