//! Non-destructive development
//!
//! - history.rs: the replayable edit list of one image
//! - module.rs / modules/: processing module interface and built-ins
//! - blend.rs: blending a module's output over its input
//! - pixelpipe.rs: executes the module chain on a source buffer
//! - session.rs: the develop orchestrator (two pipes, history, undo)
//! - undo.rs: undo/redo records of history snapshots
//! - export.rs: one-shot rendering of a history

pub mod blend;
pub mod export;
pub mod history;
pub mod module;
pub mod modules;
pub mod pixelpipe;
pub mod session;
pub mod undo;

pub use history::{HistoryHash, HistoryItem, HistoryStack, HistoryStatus};
pub use module::{ModuleRegistry, ProcessingModule, RgbaBuffer};
pub use pixelpipe::{ChangeFlags, PipeKind, RenderedImage, Roi};
pub use session::{Develop, Diagnostic, ModuleState, PipeStatus};
