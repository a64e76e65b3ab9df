//! Built-in processing modules
//!
//! Each module's math follows the real-time shader it replaced: exposure
//! and tone work in linear light, and the display transfer is applied only
//! at the end of the pipe.

pub mod colorbalance;
pub mod crop;
pub mod exposure;
pub mod levels;
pub mod shadhi;
pub mod temperature;

use super::module::ProcessingModule;
use std::sync::Arc;

pub fn builtin() -> Vec<Arc<dyn ProcessingModule>> {
    vec![
        Arc::new(exposure::Exposure),
        Arc::new(temperature::Temperature),
        Arc::new(shadhi::ShadowsHighlights),
        Arc::new(levels::Levels),
        Arc::new(colorbalance::ColorBalance),
        Arc::new(crop::Crop),
    ]
}
