//! Host-facing docent service
//!
//! Owns the model slot and the single inference session and exposes the
//! operations a UI bridge calls: load a model, open a session, prime the
//! artwork prefix, answer questions with streaming, close. All state sits in
//! one owned struct behind a mutex; the busy flag turns concurrent or
//! reentrant generation into [`Error::SessionBusy`] instead of a queue.

use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{DocentConfig, SessionConfig};
use crate::error::{Error, Result};
use crate::runtime::generator::{FinishReason, GenerationOutcome, GenerationRequest, StreamingGenerator};
use crate::runtime::reference::ReferenceLoader;
use crate::runtime::session::{InferenceSession, PrefixCacheState, SessionStatus};
use crate::runtime::streaming::TokenSink;
use crate::runtime::telemetry::{GenerationStats, Stopwatch, TelemetryRecorder, TelemetrySnapshot};
use crate::runtime::template::{format_fixed_prefix, ArtworkMetadata};
use crate::runtime::{ModelHandle, ModelInfo, ModelLoader};

struct ServiceState {
    session: InferenceSession,
    generator: StreamingGenerator,
}

/// Single-session docent runtime.
///
/// Read accessors (`status`, `prefix_cache`, `model_info`, `telemetry`) never
/// wait for a running generation and may be called from inside a sink.
pub struct DocentService {
    config: DocentConfig,
    loader: Arc<dyn ModelLoader>,
    model: Mutex<Option<ModelHandle>>,
    state: Mutex<ServiceState>,
    telemetry: Mutex<TelemetryRecorder>,
    busy: AtomicBool,
    close_requested: AtomicBool,
    active: Mutex<Option<ActiveGeneration>>,
}

/// What other callers may observe about the running generation.
struct ActiveGeneration {
    cancel: CancellationToken,
    prefix: PrefixCacheState,
}

/// Clears the busy flag on every exit path of `generate`, then carries out
/// a close requested meanwhile. Must outlive the `state` lock it may take.
struct BusyGuard<'a> {
    service: &'a DocentService,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        *self.service.active.lock() = None;
        self.service.busy.store(false, Ordering::SeqCst);
        if self.service.close_requested.swap(false, Ordering::SeqCst) {
            debug!("Carrying out deferred close");
            self.service.state.lock().session.close();
        }
    }
}

/// Counts fragments the host accepted, for failure telemetry.
struct CountingSink<'a> {
    inner: &'a mut dyn TokenSink,
    emitted: usize,
}

impl TokenSink for CountingSink<'_> {
    fn on_token(&mut self, fragment: &str) -> anyhow::Result<()> {
        self.inner.on_token(fragment)?;
        self.emitted += 1;
        Ok(())
    }

    fn on_complete(&mut self, reason: &FinishReason) {
        self.inner.on_complete(reason)
    }
}

impl DocentService {
    pub fn new(config: DocentConfig, loader: Arc<dyn ModelLoader>) -> Self {
        let generator = StreamingGenerator::new(config.generation.clone());
        Self {
            config,
            loader,
            model: Mutex::new(None),
            state: Mutex::new(ServiceState {
                session: InferenceSession::new(),
                generator,
            }),
            telemetry: Mutex::new(TelemetryRecorder::new()),
            busy: AtomicBool::new(false),
            close_requested: AtomicBool::new(false),
            active: Mutex::new(None),
        }
    }

    /// Service backed by the JSON reference model loader.
    pub fn with_reference_loader(config: DocentConfig) -> Self {
        let loader = Arc::new(ReferenceLoader::new(config.model.max_model_bytes));
        Self::new(config, loader)
    }

    pub fn config(&self) -> &DocentConfig {
        &self.config
    }

    fn ensure_idle(&self) -> Result<()> {
        if self.busy.load(Ordering::Acquire) {
            return Err(Error::SessionBusy);
        }
        Ok(())
    }

    /// Load a model, replacing the current one only on success.
    ///
    /// An open session is closed, so the prefix cache has to be primed again
    /// after the next `init_session`.
    pub fn load_model(&self, path: &Path) -> Result<ModelInfo> {
        self.ensure_idle()?;
        let handle = match ModelHandle::load(self.loader.as_ref(), path) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Model load failed, keeping previous model: {}", e);
                return Err(e);
            }
        };
        let info = handle.info().clone();

        let mut state = self.state.lock();
        if state.session.status() != SessionStatus::Uninitialized {
            info!("New model loaded, invalidating open session");
            state.session.close();
        }
        *self.model.lock() = Some(handle);
        Ok(info)
    }

    pub fn model_info(&self) -> Option<ModelInfo> {
        self.model.lock().as_ref().map(|m| m.info().clone())
    }

    /// Open the session with the configured sizes, or `config` when given.
    ///
    /// A no-op while a generation is running: the session is live by then.
    pub fn init_session(&self, config: Option<&SessionConfig>) -> Result<()> {
        if self.busy.load(Ordering::Acquire) {
            debug!("Session is generating, ignoring init");
            return Ok(());
        }
        let session_config = config.unwrap_or(&self.config.session);
        let model = self
            .model
            .lock()
            .clone()
            .ok_or_else(|| Error::invalid_state("no model loaded"))?;
        self.state
            .lock()
            .session
            .init(&model, session_config, &self.config.sampling)
    }

    /// Evaluate the artwork system turn into the context once.
    pub fn prime_fixed_prefix(&self, metadata: &ArtworkMetadata) -> Result<PrefixCacheState> {
        self.ensure_idle()?;
        let text = format_fixed_prefix(metadata);
        self.state.lock().session.prime_fixed_prefix(&text)
    }

    /// Replace the cached prefix with a different artwork.
    pub fn switch_artwork(&self, metadata: &ArtworkMetadata) -> Result<PrefixCacheState> {
        self.ensure_idle()?;
        let text = format_fixed_prefix(metadata);
        let mut state = self.state.lock();
        state.session.invalidate_prefix()?;
        state.session.prime_fixed_prefix(&text)
    }

    /// Answer one question, streaming fragments into `sink`.
    pub fn generate(
        &self,
        question: &str,
        sink: &mut dyn TokenSink,
        cancel: Option<&CancellationToken>,
    ) -> Result<GenerationOutcome> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::SessionBusy);
        }
        let _busy = BusyGuard { service: self };

        let mut state = self.state.lock();
        let ServiceState { session, generator } = &mut *state;

        let token = cancel.map(|c| c.child_token()).unwrap_or_default();
        *self.active.lock() = Some(ActiveGeneration {
            cancel: token.clone(),
            prefix: session.prefix_cache(),
        });
        if self.close_requested.load(Ordering::SeqCst) {
            token.cancel();
        }

        let watch = Stopwatch::start();
        let mut counting = CountingSink { inner: sink, emitted: 0 };
        let request = GenerationRequest::new(question);
        let result = generator.generate(session, &request, &mut counting, Some(&token));
        match &result {
            Ok(outcome) => self.telemetry.lock().record(&outcome.stats),
            Err(e) => {
                warn!("Generation failed ({}): {}", e.kind(), e);
                self.telemetry.lock().record_failure(&watch.finish(counting.emitted));
            }
        }
        result
    }

    /// Stop the running generation, if any, after its current token.
    pub fn cancel_generation(&self) {
        if let Some(active) = self.active.lock().as_ref() {
            active.cancel.cancel();
        }
    }

    /// Release the session. Never fails.
    ///
    /// While a generation is running the close is deferred: the generation is
    /// cancelled and the session closes as soon as it returns.
    pub fn close_session(&self) {
        // flag first: a generation finishing after the busy check below
        // still sees the request when it clears `busy`
        self.close_requested.store(true, Ordering::SeqCst);
        if self.busy.load(Ordering::SeqCst) {
            self.cancel_generation();
            return;
        }
        self.close_requested.store(false, Ordering::SeqCst);
        self.state.lock().session.close();
    }

    pub fn status(&self) -> SessionStatus {
        if self.busy.load(Ordering::Acquire) {
            return SessionStatus::Generating;
        }
        self.state.lock().session.status()
    }

    pub fn prefix_cache(&self) -> PrefixCacheState {
        if let Some(active) = self.active.lock().as_ref() {
            return active.prefix;
        }
        self.state.lock().session.prefix_cache()
    }

    pub fn last_stats(&self) -> Option<GenerationStats> {
        self.telemetry().last
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.telemetry.lock().snapshot()
    }
}
