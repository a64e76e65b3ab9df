//! Develop session
//!
//! One open image: its history stack, the live parameters of every module
//! instance, and two pipes (preview and full) with their state machines.
//!
//! Pipe states move `Dirty → Running → Valid`. Every pipe carries its own
//! timestamp, bumped whenever that pipe is invalidated. A render that sees
//! its pipe's timestamp move restarts from the top, and one that sees the
//! session closed ends `Invalid` without publishing anything.

use super::history::{HistoryHash, HistoryItem, HistoryStack};
use super::module::ModuleRegistry;
use super::pixelpipe::{ChangeFlags, NodeSpec, Pipe, PipeKind, RenderedImage, Roi, SourceImage};
use super::undo::UndoStack;
use crate::cache::{Access, AcquireMode, MipLevel};
use crate::context::Context;
use crate::error::{EngineError, Result};
use crate::jobs::JobKey;
use crate::state::{ImageFlags, WriteMode};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeStatus {
    Dirty,
    Running,
    Valid,
    Invalid,
}

/// Non-fatal problems found while loading a history.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Diagnostic {
    #[error("module `{0}` is not installed; its history items are skipped")]
    ModuleMissing(String),

    #[error("module `{module}` cannot migrate parameters from version {from} to {to}; history item dropped")]
    MigrationFailed { module: String, from: u32, to: u32 },

    #[error("module `{module}` expects {expected} parameter bytes, got {actual}; history item dropped")]
    InvalidParams {
        module: String,
        expected: usize,
        actual: usize,
    },
}

/// Live state of one module instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleState {
    pub params: Vec<u8>,
    pub enabled: bool,
    pub blend_params: Vec<u8>,
    pub blend_version: u32,
    pub multi_name: String,
}

impl ModuleState {
    fn from_item(item: &HistoryItem) -> Self {
        ModuleState {
            params: item.params.clone(),
            enabled: item.enabled,
            blend_params: item.blend_params.clone(),
            blend_version: item.blend_version,
            multi_name: item.multi_name.clone(),
        }
    }

    fn matches(&self, item: &HistoryItem) -> bool {
        self.params == item.params
            && self.enabled == item.enabled
            && self.blend_params == item.blend_params
            && self.blend_version == item.blend_version
    }
}

type InstanceId = (String, u32);

struct HistoryState {
    stack: HistoryStack,
    live: HashMap<InstanceId, ModuleState>,
    undo: UndoStack,
}

impl HistoryState {
    /// Live parameters are a pure function of the active items: the last
    /// item of each instance wins, everything else is at its defaults.
    fn rebuild_live(&mut self) {
        self.live = self
            .stack
            .active()
            .iter()
            .map(|item| ((item.operation.clone(), item.multi_priority), ModuleState::from_item(item)))
            .collect();
    }
}

struct PipeSlot {
    pipe: Mutex<Pipe>,
    status: Mutex<PipeStatus>,
    changed: AtomicU32,
    timestamp: AtomicU64,
    output: Mutex<Option<Arc<RenderedImage>>>,
}

impl PipeSlot {
    fn new(kind: PipeKind) -> Self {
        PipeSlot {
            pipe: Mutex::new(Pipe::new(kind)),
            status: Mutex::new(PipeStatus::Dirty),
            changed: AtomicU32::new(ChangeFlags::REMOVE.0),
            timestamp: AtomicU64::new(0),
            output: Mutex::new(None),
        }
    }
}

pub struct Develop {
    ctx: Arc<Context>,
    image_id: u32,
    session: u64,
    history: Mutex<HistoryState>,
    preview: PipeSlot,
    full: PipeSlot,
    region: Mutex<Roi>,
    closed: AtomicBool,
    diagnostics: Mutex<Vec<Diagnostic>>,
}

impl Develop {
    /// Open a session and load the image's history from the catalog.
    pub fn open(ctx: Arc<Context>, image_id: u32) -> Result<Arc<Develop>> {
        ctx.images().read(image_id)?;
        let undo_depth = ctx.config().undo_depth;
        let develop = Arc::new(Develop {
            ctx,
            image_id,
            session: NEXT_SESSION.fetch_add(1, Ordering::Relaxed),
            history: Mutex::new(HistoryState {
                stack: HistoryStack::new(),
                live: HashMap::new(),
                undo: UndoStack::new(undo_depth),
            }),
            preview: PipeSlot::new(PipeKind::Preview),
            full: PipeSlot::new(PipeKind::Full),
            region: Mutex::new(Roi::FULL),
            closed: AtomicBool::new(false),
            diagnostics: Mutex::new(Vec::new()),
        });
        develop.read_history()?;
        tracing::info!("📷 Opened image {} for development", image_id);
        Ok(develop)
    }

    pub fn image_id(&self) -> u32 {
        self.image_id
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    fn slot(&self, kind: PipeKind) -> &PipeSlot {
        match kind {
            PipeKind::Preview => &self.preview,
            PipeKind::Full => &self.full,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    fn registry(&self) -> &ModuleRegistry {
        self.ctx.modules()
    }

    /// Current live state of a module instance; defaults when the history
    /// does not mention it. `None` for unknown modules.
    pub fn module_state(&self, operation: &str, multi_priority: u32) -> Option<ModuleState> {
        let module = self.registry().get(operation)?;
        let history = self.history.lock();
        let state = history
            .live
            .get(&(operation.to_string(), multi_priority))
            .cloned()
            .unwrap_or_else(|| ModuleState {
                params: module.default_params(),
                enabled: module.default_enabled(),
                blend_params: Vec::new(),
                blend_version: 0,
                multi_name: String::new(),
            });
        Some(state)
    }

    /// Change the live parameters of a module instance. Nothing is recorded
    /// until `add_history_item`.
    pub fn set_module_params(&self, operation: &str, multi_priority: u32, params: Vec<u8>) -> Result<()> {
        self.ensure_open()?;
        let module = self
            .registry()
            .get(operation)
            .ok_or_else(|| EngineError::ModuleMissing(operation.to_string()))?;
        if params.len() != module.params_size() {
            return Err(EngineError::ParamsSize {
                module: operation.to_string(),
                expected: module.params_size(),
                actual: params.len(),
            });
        }
        let mut state = self
            .module_state(operation, multi_priority)
            .ok_or_else(|| EngineError::ModuleMissing(operation.to_string()))?;
        state.params = params;
        self.history
            .lock()
            .live
            .insert((operation.to_string(), multi_priority), state);
        Ok(())
    }

    /// Record the live state of a module instance in the history.
    ///
    /// When the active top item is the same instance with the same enabled
    /// state, it is updated in place; otherwise redo items are discarded
    /// and a new item is appended. Unchanged state records nothing.
    pub fn add_history_item(&self, operation: &str, multi_priority: u32, enable: Option<bool>) -> Result<()> {
        self.ensure_open()?;
        let module = self
            .registry()
            .get(operation)
            .ok_or_else(|| EngineError::ModuleMissing(operation.to_string()))?;
        let mut state = self
            .module_state(operation, multi_priority)
            .ok_or_else(|| EngineError::ModuleMissing(operation.to_string()))?;
        if let Some(enabled) = enable {
            state.enabled = enabled;
        }

        let flags = {
            let mut history = self.history.lock();
            let before = history.stack.clone();
            history.live.insert((operation.to_string(), multi_priority), state.clone());

            let top = history
                .stack
                .top()
                .filter(|top| top.is_instance(operation, multi_priority))
                .map(|top| (state.matches(top), top.enabled == state.enabled));
            let flags = match top {
                Some((true, _)) if history.stack.end() == history.stack.len() => ChangeFlags::UNCHANGED,
                Some((_, true)) => {
                    history.stack.truncate();
                    if let Some(top) = history.stack.top_mut() {
                        top.params = state.params;
                        top.blend_params = state.blend_params;
                        top.blend_version = state.blend_version;
                        top.module_version = module.version();
                    }
                    ChangeFlags::TOP_CHANGED
                }
                _ => {
                    let was_active = history
                        .stack
                        .last_for(operation, multi_priority)
                        .map(|item| item.enabled)
                        .unwrap_or(false);
                    history.stack.push(HistoryItem {
                        num: 0,
                        operation: operation.to_string(),
                        module_version: module.version(),
                        enabled: state.enabled,
                        params: state.params,
                        blend_params: state.blend_params,
                        blend_version: state.blend_version,
                        multi_priority,
                        multi_name: state.multi_name,
                    });
                    if was_active == state.enabled {
                        ChangeFlags::SYNCH
                    } else {
                        ChangeFlags::SYNCH | ChangeFlags::REMOVE
                    }
                }
            };
            let after = history.stack.clone();
            history.undo.record(before, after);
            flags
        };

        if !flags.is_empty() {
            tracing::debug!("📊 History of image {} now ends with `{}`", self.image_id, operation);
            self.invalidate(flags);
        }
        Ok(())
    }

    /// Move the end of the active history to `count` and reset every
    /// module instance to the state that position implies.
    pub fn pop_history_items(&self, count: usize) -> Result<()> {
        self.ensure_open()?;
        {
            let mut history = self.history.lock();
            let before = history.stack.clone();
            history.stack.set_end(count);
            history.rebuild_live();
            let after = history.stack.clone();
            history.undo.record(before, after);
        }
        self.invalidate(ChangeFlags::SYNCH | ChangeFlags::REMOVE);
        Ok(())
    }

    /// Restore the history before the last edit. Returns false when there
    /// is nothing to undo.
    pub fn undo(&self) -> bool {
        self.restore(|undo| undo.undo())
    }

    pub fn redo(&self) -> bool {
        self.restore(|undo| undo.redo())
    }

    fn restore(&self, step: impl FnOnce(&mut UndoStack) -> Option<HistoryStack>) -> bool {
        if self.ensure_open().is_err() {
            return false;
        }
        {
            let mut history = self.history.lock();
            let Some(stack) = step(&mut history.undo) else {
                return false;
            };
            history.stack = stack;
            history.rebuild_live();
        }
        self.invalidate(ChangeFlags::SYNCH | ChangeFlags::REMOVE);
        true
    }

    pub fn can_undo(&self) -> bool {
        self.history.lock().undo.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.lock().undo.can_redo()
    }

    pub fn history(&self) -> HistoryStack {
        self.history.lock().stack.clone()
    }

    pub fn history_items_as_string(&self) -> String {
        self.history.lock().stack.items_as_string()
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.lock().clone()
    }

    /// Store the history in the catalog and drop the now stale thumbnails.
    pub fn write_history(&self) -> Result<()> {
        let (items, end, hash) = {
            let history = self.history.lock();
            (history.stack.items().to_vec(), history.stack.end(), history.stack.hash())
        };
        let catalog = self.ctx.catalog();
        catalog.replace_history(self.image_id, &items, end as u32)?;

        let mut hashes = catalog.history_hash(self.image_id)?.unwrap_or_default();
        hashes.current = hash;
        catalog.set_history_hash(self.image_id, &hashes)?;

        self.ctx.images().update(self.image_id, WriteMode::Relaxed, |record| {
            record.history_end = end as u32;
            record.change_timestamp = Some(Utc::now());
        })?;
        self.ctx.mipmaps().invalidate(self.image_id);
        tracing::debug!("📥 Wrote {} history items for image {}", items.len(), self.image_id);
        Ok(())
    }

    /// Load the history from the catalog, applying auto-presets the first
    /// time the image is opened. Replaces the undo stack.
    pub fn read_history(&self) -> Result<()> {
        self.ensure_open()?;
        let catalog = self.ctx.catalog();
        let record = self.ctx.images().read(self.image_id)?;
        let mut stack = HistoryStack::from_items(catalog.history(self.image_id)?, record.history_end as usize);

        if !record.flags.contains(ImageFlags::AUTO_PRESETS_APPLIED) {
            let basic = stack.hash();
            let presets = catalog.auto_presets(&record)?;
            for preset in &presets {
                stack.push(preset.to_history_item());
            }
            if !presets.is_empty() {
                catalog.replace_history(self.image_id, stack.items(), stack.end() as u32)?;
                tracing::info!("📥 Applied {} auto-presets to image {}", presets.len(), self.image_id);
            }
            let end = stack.end() as u32;
            self.ctx.images().update(self.image_id, WriteMode::Safe, |record| {
                record.flags.set(ImageFlags::AUTO_PRESETS_APPLIED, true);
                record.history_end = end;
                if end > 0 {
                    record.change_timestamp = Some(Utc::now());
                }
            })?;
            let auto = stack.hash();
            catalog.set_history_hash(
                self.image_id,
                &HistoryHash {
                    basic: Some(basic),
                    auto: Some(auto),
                    current: auto,
                },
            )?;
        }

        let (stack, diagnostics) = prepare_history(self.registry(), &stack);
        for diagnostic in &diagnostics {
            tracing::warn!("⚠️  Image {}: {}", self.image_id, diagnostic);
        }
        {
            let mut history = self.history.lock();
            history.stack = stack;
            history.rebuild_live();
            history.undo.clear();
        }
        *self.diagnostics.lock() = diagnostics;
        self.invalidate(ChangeFlags::SYNCH | ChangeFlags::REMOVE);
        Ok(())
    }

    /// Forget the image's history: catalog rows, auto-preset flag and
    /// thumbnails.
    pub fn delete_history(&self) -> Result<()> {
        self.ensure_open()?;
        self.ctx.catalog().delete_history(self.image_id)?;
        self.ctx.images().update(self.image_id, WriteMode::Safe, |record| {
            record.flags.set(ImageFlags::AUTO_PRESETS_APPLIED, false);
            record.history_end = 0;
            record.change_timestamp = Some(Utc::now());
        })?;
        {
            let mut history = self.history.lock();
            history.stack = HistoryStack::new();
            history.rebuild_live();
            history.undo.clear();
        }
        self.ctx.mipmaps().invalidate(self.image_id);
        self.invalidate(ChangeFlags::SYNCH | ChangeFlags::REMOVE);
        tracing::info!("🧹 Deleted history of image {}", self.image_id);
        Ok(())
    }

    /// Keep only the newest active item per module instance, then write
    /// the result.
    pub fn compress_history(&self) -> Result<()> {
        self.ensure_open()?;
        {
            let mut history = self.history.lock();
            let before = history.stack.clone();
            history.stack.compress();
            history.rebuild_live();
            let after = history.stack.clone();
            history.undo.record(before, after);
        }
        self.write_history()?;
        self.invalidate(ChangeFlags::SYNCH | ChangeFlags::REMOVE);
        Ok(())
    }

    /// Mark both pipes dirty with `flags`.
    pub fn invalidate(&self, flags: ChangeFlags) {
        self.invalidate_pipe(PipeKind::Preview, flags);
        self.invalidate_pipe(PipeKind::Full, flags);
    }

    fn invalidate_pipe(&self, kind: PipeKind, flags: ChangeFlags) {
        let slot = self.slot(kind);
        slot.changed.fetch_or(flags.0, Ordering::SeqCst);
        slot.timestamp.fetch_add(1, Ordering::SeqCst);
        let mut status = slot.status.lock();
        if *status != PipeStatus::Invalid {
            *status = PipeStatus::Dirty;
        }
    }

    /// Region of the full pipe, normalized to the processed image.
    pub fn set_zoom(&self, region: Roi) {
        *self.region.lock() = region;
        self.invalidate_pipe(PipeKind::Full, ChangeFlags::ZOOMED);
    }

    pub fn status(&self, kind: PipeKind) -> PipeStatus {
        *self.slot(kind).status.lock()
    }

    /// Last published render of a pipe.
    pub fn output(&self, kind: PipeKind) -> Option<Arc<RenderedImage>> {
        self.slot(kind).output.lock().clone()
    }

    /// Queue a background render. Returns false when one is already queued.
    pub fn schedule(self: &Arc<Self>, kind: PipeKind) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let weak = Arc::downgrade(self);
        self.ctx
            .jobs()
            .submit(Some(JobKey::Pipe { session: self.session, kind }), move || {
                if let Some(develop) = weak.upgrade() {
                    develop.process(kind);
                }
            })
    }

    /// Render a pipe on the calling thread, restarting whenever the
    /// history changes mid-run. Returns the final status.
    pub fn process(&self, kind: PipeKind) -> PipeStatus {
        let slot = self.slot(kind);
        let mut pipe = slot.pipe.lock();
        let level = match kind {
            PipeKind::Preview => MipLevel::Preview,
            PipeKind::Full => MipLevel::Full,
        };

        loop {
            if self.closed.load(Ordering::SeqCst) {
                *slot.status.lock() = PipeStatus::Invalid;
                return PipeStatus::Invalid;
            }
            let started = slot.timestamp.load(Ordering::SeqCst);
            *slot.status.lock() = PipeStatus::Running;

            let flags = ChangeFlags(slot.changed.swap(0, Ordering::SeqCst));
            if !flags.is_empty() || !pipe.is_synced() {
                let specs = NodeSpec::from_history(self.registry(), &self.history.lock().stack);
                pipe.synch(specs, flags);
            }
            if kind == PipeKind::Full {
                pipe.set_region(*self.region.lock());
            }

            let handle = self
                .ctx
                .mipmaps()
                .acquire(self.image_id, level, AcquireMode::Blocking, Access::Read);
            let record = match self.ctx.images().read(self.image_id) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!("⚠️  Image {} vanished during processing: {}", self.image_id, e);
                    *slot.status.lock() = PipeStatus::Invalid;
                    return PipeStatus::Invalid;
                }
            };
            let Some(buffer) = handle.buffer() else {
                *slot.status.lock() = PipeStatus::Invalid;
                return PipeStatus::Invalid;
            };
            let source = SourceImage::new(&record, level, buffer);
            let stale = || {
                self.closed.load(Ordering::SeqCst) || slot.timestamp.load(Ordering::SeqCst) != started
            };
            let rendered = pipe.process(&source, stale);
            drop(handle);

            if let Some(rendered) = rendered {
                let mut status = slot.status.lock();
                if !stale() {
                    *slot.output.lock() = Some(Arc::new(rendered));
                    *status = PipeStatus::Valid;
                    tracing::debug!("✅ {:?} pipe of image {} is up to date", kind, self.image_id);
                    return PipeStatus::Valid;
                }
            }
            if self.closed.load(Ordering::SeqCst) {
                *slot.status.lock() = PipeStatus::Invalid;
                return PipeStatus::Invalid;
            }
            *slot.status.lock() = PipeStatus::Dirty;
            tracing::debug!("{:?} pipe of image {} changed during render, restarting", kind, self.image_id);
        }
    }

    /// End the session. In-flight renders are abandoned.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for kind in [PipeKind::Preview, PipeKind::Full] {
            let slot = self.slot(kind);
            slot.timestamp.fetch_add(1, Ordering::SeqCst);
            *slot.status.lock() = PipeStatus::Invalid;
        }
        tracing::debug!("📷 Closed develop session of image {}", self.image_id);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Bring stored items up to the installed module versions. Items of
/// missing modules are kept but reported; items that cannot be migrated
/// or carry malformed parameters are dropped and reported.
pub(crate) fn prepare_history(registry: &ModuleRegistry, history: &HistoryStack) -> (HistoryStack, Vec<Diagnostic>) {
    let mut diagnostics = Vec::new();
    let mut missing = HashSet::new();
    let mut kept = Vec::with_capacity(history.len());
    let mut end = 0;

    for (index, item) in history.items().iter().enumerate() {
        let Some(module) = registry.get(&item.operation) else {
            if missing.insert(item.operation.clone()) {
                diagnostics.push(Diagnostic::ModuleMissing(item.operation.clone()));
            }
            if index < history.end() {
                end += 1;
            }
            kept.push(item.clone());
            continue;
        };

        let mut item = item.clone();
        if item.module_version != module.version() {
            let migrated = if item.module_version < module.version() {
                module.migrate(item.module_version, &item.params)
            } else {
                None
            };
            match migrated {
                Some(params) => {
                    tracing::debug!(
                        "Migrated `{}` parameters from version {} to {}",
                        item.operation,
                        item.module_version,
                        module.version()
                    );
                    item.params = params;
                    item.module_version = module.version();
                }
                None => {
                    diagnostics.push(Diagnostic::MigrationFailed {
                        module: item.operation.clone(),
                        from: item.module_version,
                        to: module.version(),
                    });
                    continue;
                }
            }
        }
        if item.params.len() != module.params_size() {
            diagnostics.push(Diagnostic::InvalidParams {
                module: item.operation.clone(),
                expected: module.params_size(),
                actual: item.params.len(),
            });
            continue;
        }

        if index < history.end() {
            end += 1;
        }
        kept.push(item);
    }

    (HistoryStack::from_items(kept, end), diagnostics)
}
