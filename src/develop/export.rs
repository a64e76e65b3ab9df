//! One-shot rendering of a history
//!
//! Used for slow-path thumbnails and the command line exporter. Runs its
//! own bounded pipe, so it never touches an interactive session's state.

use super::history::HistoryStack;
use super::pixelpipe::{ChangeFlags, NodeSpec, Pipe, RenderedImage, SourceImage};
use super::session::prepare_history;
use crate::cache::{Access, AcquireMode, MipLevel, PREVIEW_MAX_SIZE};
use crate::context::Context;
use crate::error::{EngineError, Result};
use crate::raw::downsample::fit_within;

/// Render `history` for `image_id` so the result fits `max_width x max_height`.
///
/// The preview buffer is used as source when the image size is known and
/// the target is no larger than the preview; otherwise the full buffer.
pub fn render(ctx: &Context, image_id: u32, max_width: u32, max_height: u32, history: &HistoryStack) -> Result<RenderedImage> {
    let record = ctx.images().read(image_id)?;
    let (history, diagnostics) = prepare_history(ctx.modules(), history);
    for diagnostic in &diagnostics {
        tracing::warn!("⚠️  Export of image {}: {}", image_id, diagnostic);
    }

    let level = if record.width > 0 && record.height > 0 {
        let (w, h) = record.oriented_size();
        let (pw, ph) = fit_within(w, h, PREVIEW_MAX_SIZE, PREVIEW_MAX_SIZE);
        if max_width <= pw && max_height <= ph {
            MipLevel::Preview
        } else {
            MipLevel::Full
        }
    } else {
        MipLevel::Full
    };

    let handle = ctx.mipmaps().acquire(image_id, level, AcquireMode::Blocking, Access::Read);
    let decode_error = || EngineError::Decode {
        path: record.path.clone(),
        reason: "source could not be decoded".into(),
    };
    let buffer = handle.buffer().filter(|b| b.is_populated() && !b.is_dead()).ok_or_else(decode_error)?;

    // Decoding may have filled in white balance, matrix and orientation.
    let record = ctx.images().read(image_id)?;
    let source = SourceImage::new(&record, level, buffer);
    let mut pipe = Pipe::with_bounds(max_width, max_height);
    pipe.synch(NodeSpec::from_history(ctx.modules(), &history), ChangeFlags::REMOVE);

    let rendered = pipe.process(&source, || false).ok_or(EngineError::Closed)?;
    tracing::debug!(
        "📸 Exported image {} at {}x{} from {}",
        image_id,
        rendered.width,
        rendered.height,
        level
    );
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::develop::module::encode_params;
    use crate::develop::modules::crop::CropParams;
    use crate::develop::modules::exposure::ExposureParams;
    use crate::develop::history::tests::item;
    use crate::testing::TestEnv;

    #[test]
    fn test_render_fits_bounds() {
        let env = TestEnv::new("export-bounds");
        let id = env.import_png("wide.png", 600, 400, [120, 120, 120]);

        let rendered = render(&env.ctx, id, 100, 100, &HistoryStack::new()).unwrap();
        assert_eq!((rendered.width, rendered.height), (100, 67));
        assert_eq!(rendered.pixels.len(), 100 * 67 * 4);
    }

    #[test]
    fn test_render_applies_history() {
        let env = TestEnv::new("export-history");
        let id = env.import_png("grey.png", 200, 100, [100, 100, 100]);

        let plain = render(&env.ctx, id, 200, 100, &HistoryStack::new()).unwrap();

        let mut history = HistoryStack::new();
        history.push(item("crop", true, &encode_params(&CropParams { cx: 0.0, cy: 0.0, cw: 0.5, ch: 1.0 })));
        let mut exposure = item("exposure", true, &encode_params(&ExposureParams { exposure: 1.0, black: 0.0 }));
        exposure.module_version = 2;
        history.push(exposure);

        let edited = render(&env.ctx, id, 200, 100, &history).unwrap();
        assert_eq!((edited.width, edited.height), (100, 100));
        assert!(edited.pixel(50, 50)[0] > plain.pixel(50, 50)[0]);
    }

    #[test]
    fn test_render_missing_source_fails() {
        let env = TestEnv::new("export-missing");
        let id = env.library.import_image(&env.dir.join("gone.png")).unwrap();
        let result = render(&env.ctx, id, 64, 64, &HistoryStack::new());
        assert!(matches!(result, Err(EngineError::Decode { .. })));
    }
}
