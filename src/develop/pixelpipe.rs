//! Pixelpipe
//!
//! Executes the module chain of a history against a cached source buffer:
//!
//! 1. Input stage: demosaic (mosaic sources), white balance, camera matrix,
//!    orientation, scaling to the pipe's bounds
//! 2. One node per enabled module instance, in history order
//! 3. Output stage: region crop, sRGB transfer, 8-bit RGBA
//!
//! Every intermediate result is keyed by a running hash of the input and
//! the parameters of all nodes up to it, so an unchanged prefix of the
//! chain is reused on the next run.

use super::blend::{blend, BlendParams};
use super::history::HistoryStack;
use super::module::{ModuleRegistry, ProcessingModule, RgbaBuffer};
use crate::cache::{MipBuffer, MipLevel, PixelData, PixelFormat, PREVIEW_MAX_SIZE};
use crate::color;
use crate::raw::demosaic::demosaic_bilinear;
use crate::raw::downsample::{orient, resize_rgba_f32};
use crate::raw::{CfaPattern, Orientation};
use crate::state::ImageRecord;
use image::RgbaImage;
use siphasher::sip::SipHasher13;
use std::hash::Hasher;
use std::ops::BitOr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipeKind {
    /// Whole image at preview resolution
    Preview,
    /// Native resolution, limited to the zoom region
    Full,
}

/// What changed since a pipe was last synchronized with the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChangeFlags(pub u32);

impl ChangeFlags {
    pub const UNCHANGED: ChangeFlags = ChangeFlags(0);
    /// Only the parameters of the top history item changed
    pub const TOP_CHANGED: ChangeFlags = ChangeFlags(1 << 0);
    /// Parameters anywhere in the history changed
    pub const SYNCH: ChangeFlags = ChangeFlags(1 << 1);
    /// Nodes were added or removed
    pub const REMOVE: ChangeFlags = ChangeFlags(1 << 2);
    /// The region of interest changed
    pub const ZOOMED: ChangeFlags = ChangeFlags(1 << 3);

    pub fn contains(self, other: ChangeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for ChangeFlags {
    type Output = ChangeFlags;

    fn bitor(self, rhs: ChangeFlags) -> ChangeFlags {
        ChangeFlags(self.0 | rhs.0)
    }
}

/// Normalized region of the processed image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Roi {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Roi {
    pub const FULL: Roi = Roi {
        x: 0.0,
        y: 0.0,
        width: 1.0,
        height: 1.0,
    };

    /// Pixel rectangle `(x, y, width, height)`, never empty.
    pub fn rect(&self, width: usize, height: usize) -> (usize, usize, usize, usize) {
        let x = ((self.x.clamp(0.0, 1.0) * width as f32) as usize).min(width.saturating_sub(1));
        let y = ((self.y.clamp(0.0, 1.0) * height as f32) as usize).min(height.saturating_sub(1));
        let w = ((self.width.clamp(0.0, 1.0) * width as f32).round() as usize).clamp(1, (width - x).max(1));
        let h = ((self.height.clamp(0.0, 1.0) * height as f32).round() as usize).clamp(1, (height - y).max(1));
        (x, y, w, h)
    }
}

impl Default for Roi {
    fn default() -> Self {
        Roi::FULL
    }
}

/// One node of the chain: a resolved, enabled history item.
#[derive(Clone)]
pub struct NodeSpec {
    pub num: u32,
    pub operation: String,
    pub multi_priority: u32,
    pub module: Arc<dyn ProcessingModule>,
    pub params: Vec<u8>,
    pub blend: Option<BlendParams>,
}

impl NodeSpec {
    /// Nodes for the active history: the winning item of every module
    /// instance, enabled and installed, in ascending `num`.
    pub fn from_history(registry: &ModuleRegistry, history: &HistoryStack) -> Vec<NodeSpec> {
        let mut specs = Vec::new();
        for item in history.resolve() {
            if !item.enabled {
                continue;
            }
            let Some(module) = registry.get(&item.operation) else {
                tracing::debug!("Skipping history item {}: module `{}` not installed", item.num, item.operation);
                continue;
            };
            if item.params.len() != module.params_size() {
                tracing::warn!(
                    "⚠️  Skipping history item {}: `{}` expects {} parameter bytes, got {}",
                    item.num,
                    item.operation,
                    module.params_size(),
                    item.params.len()
                );
                continue;
            }
            specs.push(NodeSpec {
                num: item.num,
                operation: item.operation.clone(),
                multi_priority: item.multi_priority,
                module,
                params: item.params.clone(),
                blend: BlendParams::from_stored(&item.blend_params, item.blend_version),
            });
        }
        specs
    }

    fn same_instance(&self, other: &NodeSpec) -> bool {
        self.operation == other.operation && self.multi_priority == other.multi_priority
    }

    fn running_hash(&self, upstream: u64) -> u64 {
        let mut hasher = SipHasher13::new();
        hasher.write_u64(upstream);
        hasher.write(self.operation.as_bytes());
        hasher.write_u32(self.multi_priority);
        hasher.write_u32(self.module.version());
        hasher.write(&self.params);
        if let Some(blend) = &self.blend {
            hasher.write(&blend.to_bytes());
        }
        hasher.finish()
    }
}

/// A cached source buffer plus what is needed to develop it.
pub struct SourceImage<'a> {
    pub image_id: u32,
    pub level: MipLevel,
    pub buffer: &'a MipBuffer,
    pub cfa: CfaPattern,
    pub wb_coeffs: [f32; 4],
    pub color_matrix: [f32; 9],
    pub orientation: Orientation,
}

impl<'a> SourceImage<'a> {
    pub fn new(record: &ImageRecord, level: MipLevel, buffer: &'a MipBuffer) -> Self {
        if buffer.is_dead() {
            // The placeholder is display-ready; do not color-correct it.
            return SourceImage {
                image_id: record.id,
                level,
                buffer,
                cfa: CfaPattern::RGGB,
                wb_coeffs: [1.0; 4],
                color_matrix: color::IDENTITY,
                orientation: Orientation::NORMAL,
            };
        }
        SourceImage {
            image_id: record.id,
            level,
            buffer,
            cfa: record.cfa.unwrap_or(CfaPattern::RGGB),
            wb_coeffs: record.wb_coeffs,
            color_matrix: record.color_matrix,
            orientation: record.orientation,
        }
    }

    fn identity(&self, target: (usize, usize)) -> u64 {
        let desc = &self.buffer.desc;
        let mut hasher = SipHasher13::new();
        hasher.write_u32(self.image_id);
        hasher.write_u32(self.level.index());
        hasher.write_u32(desc.width);
        hasher.write_u32(desc.height);
        hasher.write_u32(desc.iscale.to_bits());
        hasher.write_u8(desc.format as u8);
        hasher.write_u8(self.buffer.is_dead() as u8);
        hasher.write(&self.cfa.0);
        for v in self.wb_coeffs.iter().chain(self.color_matrix.iter()) {
            hasher.write_u32(v.to_bits());
        }
        hasher.write_u16(self.orientation.0);
        hasher.write_usize(target.0);
        hasher.write_usize(target.1);
        hasher.finish()
    }
}

/// Display-ready 8-bit output of a pipe run.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedImage {
    pub width: u32,
    pub height: u32,
    /// sRGB RGBA8
    pub pixels: Vec<u8>,
    /// Size of the processed image before the region crop
    pub processed_width: u32,
    pub processed_height: u32,
}

impl RenderedImage {
    pub fn into_rgba_image(self) -> Option<RgbaImage> {
        RgbaImage::from_raw(self.width, self.height, self.pixels)
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let i = ((y * self.width + x) * 4) as usize;
        [self.pixels[i], self.pixels[i + 1], self.pixels[i + 2], self.pixels[i + 3]]
    }
}

struct PipeNode {
    spec: NodeSpec,
    cached: Option<(u64, Arc<RgbaBuffer>)>,
}

pub struct Pipe {
    kind: PipeKind,
    nodes: Vec<PipeNode>,
    input: Option<(u64, Arc<RgbaBuffer>)>,
    bounds: Option<(u32, u32)>,
    region: Roi,
    cache_nodes: bool,
    synced: bool,
    processed_size: (usize, usize),
}

impl Pipe {
    /// Interactive pipe: the preview pipe is bounded to the preview size
    /// and keeps intermediates; the full pipe only keeps its input.
    pub fn new(kind: PipeKind) -> Self {
        let bounds = match kind {
            PipeKind::Preview => Some((PREVIEW_MAX_SIZE, PREVIEW_MAX_SIZE)),
            PipeKind::Full => None,
        };
        Pipe {
            kind,
            nodes: Vec::new(),
            input: None,
            bounds,
            region: Roi::FULL,
            cache_nodes: kind == PipeKind::Preview,
            synced: false,
            processed_size: (0, 0),
        }
    }

    /// One-shot pipe whose processed output fits `max_width x max_height`.
    pub fn with_bounds(max_width: u32, max_height: u32) -> Self {
        Pipe {
            bounds: Some((max_width.max(1), max_height.max(1))),
            cache_nodes: false,
            ..Pipe::new(PipeKind::Full)
        }
    }

    pub fn kind(&self) -> PipeKind {
        self.kind
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn set_region(&mut self, region: Roi) {
        self.region = region;
    }

    pub fn operations(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.spec.operation.as_str()).collect()
    }

    pub fn processed_size(&self) -> (usize, usize) {
        self.processed_size
    }

    /// Bring the node list in line with `specs`.
    pub fn synch(&mut self, specs: Vec<NodeSpec>, flags: ChangeFlags) {
        let top_only = flags == ChangeFlags::TOP_CHANGED
            && self.synced
            && specs.len() == self.nodes.len()
            && specs
                .iter()
                .zip(&self.nodes)
                .all(|(spec, node)| spec.same_instance(&node.spec));
        if top_only {
            if let (Some(spec), Some(node)) = (specs.into_iter().last(), self.nodes.last_mut()) {
                node.spec = spec;
            }
        } else {
            // Cached intermediates stay; their hashes tell whether they still apply.
            let mut old: Vec<Option<(u64, Arc<RgbaBuffer>)>> = self.nodes.drain(..).map(|n| n.cached).collect();
            old.resize(specs.len(), None);
            self.nodes = specs
                .into_iter()
                .zip(old)
                .map(|(spec, cached)| PipeNode { spec, cached })
                .collect();
        }
        self.synced = true;
    }

    /// Run the chain. Returns `None` as soon as `abort` reports true; it is
    /// checked between stages only.
    pub fn process(&mut self, source: &SourceImage<'_>, abort: impl Fn() -> bool) -> Option<RenderedImage> {
        let (mut key, mut current) = self.input_stage(source);
        if abort() {
            return None;
        }

        let cache_nodes = self.cache_nodes;
        for node in &mut self.nodes {
            key = node.spec.running_hash(key);
            if let Some((cached_key, buffer)) = &node.cached {
                if *cached_key == key {
                    current = Arc::clone(buffer);
                    continue;
                }
            }

            let mut output = (*current).clone();
            if let Err(e) = node.spec.module.apply(&node.spec.params, &mut output) {
                tracing::warn!("⚠️  Module `{}` failed, passing input through: {}", node.spec.operation, e);
                output = (*current).clone();
            }
            if let Some(params) = &node.spec.blend {
                blend(&current, &mut output, params);
            }
            let output = Arc::new(output);
            node.cached = cache_nodes.then(|| (key, Arc::clone(&output)));
            current = output;

            if abort() {
                return None;
            }
        }

        self.processed_size = (current.width, current.height);
        Some(output_stage(&current, self.region))
    }

    /// Size the input must be scaled to so the processed image fits the bounds.
    fn target_size(&self, width: usize, height: usize) -> (usize, usize) {
        let Some((max_w, max_h)) = self.bounds else {
            return (width, height);
        };
        let (pw, ph) = self.nodes.iter().fold((width, height), |(w, h), node| {
            node.spec.module.modify_dimensions(&node.spec.params, w, h)
        });
        let scale = (max_w as f64 / pw.max(1) as f64)
            .min(max_h as f64 / ph.max(1) as f64)
            .min(1.0);
        (
            ((width as f64 * scale).round() as usize).max(1),
            ((height as f64 * scale).round() as usize).max(1),
        )
    }

    fn input_stage(&mut self, source: &SourceImage<'_>) -> (u64, Arc<RgbaBuffer>) {
        let buffer = source.buffer;
        let (sw, sh) = (buffer.width() as usize, buffer.height() as usize);
        let (ow, oh) = if source.orientation.swaps_dimensions() { (sh, sw) } else { (sw, sh) };
        let target = self.target_size(ow, oh);
        let key = source.identity(target);

        if let Some((cached_key, input)) = &self.input {
            if *cached_key == key {
                return (key, Arc::clone(input));
            }
        }

        let wb = source.wb_coeffs;
        let mut rgba = match (&buffer.pixels, buffer.desc.format) {
            (PixelData::Float(mosaic), PixelFormat::MosaicF32) => demosaic_bilinear(mosaic, sw, sh, source.cfa, wb),
            (PixelData::Float(pixels), _) => {
                let mut pixels = pixels.clone();
                for px in pixels.chunks_exact_mut(4) {
                    for c in 0..3 {
                        px[c] *= wb[c];
                    }
                }
                pixels
            }
            (PixelData::Rgba8(pixels), _) => pixels
                .iter()
                .enumerate()
                .map(|(i, v)| {
                    let v = *v as f32 / 255.0;
                    if i % 4 == 3 {
                        v
                    } else {
                        color::srgb_to_linear(v)
                    }
                })
                .collect(),
            (PixelData::Empty, _) => vec![0.0; sw * sh * 4],
        };

        if !color::is_identity_matrix(&source.color_matrix) {
            for px in rgba.chunks_exact_mut(4) {
                let out = color::apply_matrix(&source.color_matrix, [px[0], px[1], px[2]]);
                px[..3].copy_from_slice(&out);
            }
        }

        let (oriented, w, h) = orient(&rgba, sw, sh, 4, source.orientation);
        let data = if (w, h) == target {
            oriented
        } else {
            resize_rgba_f32(&oriented, w, h, target.0, target.1)
        };

        let input = Arc::new(RgbaBuffer::new(target.0, target.1, data));
        self.input = Some((key, Arc::clone(&input)));
        (key, input)
    }
}

fn to_u8(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn output_stage(buffer: &RgbaBuffer, region: Roi) -> RenderedImage {
    if buffer.width == 0 || buffer.height == 0 {
        return RenderedImage {
            width: 0,
            height: 0,
            pixels: Vec::new(),
            processed_width: 0,
            processed_height: 0,
        };
    }
    let (x0, y0, w, h) = region.rect(buffer.width, buffer.height);
    let mut pixels = Vec::with_capacity(w * h * 4);
    for y in y0..y0 + h {
        for x in x0..x0 + w {
            let [r, g, b, a] = buffer.pixel(x, y);
            pixels.extend_from_slice(&[
                to_u8(color::linear_to_srgb(r.max(0.0))),
                to_u8(color::linear_to_srgb(g.max(0.0))),
                to_u8(color::linear_to_srgb(b.max(0.0))),
                to_u8(a),
            ]);
        }
    }
    RenderedImage {
        width: w as u32,
        height: h as u32,
        pixels,
        processed_width: buffer.width as u32,
        processed_height: buffer.height as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::develop::history::tests::item;
    use crate::develop::module::{encode_params, ModuleRegistry};
    use crate::develop::modules::crop::CropParams;
    use crate::develop::modules::exposure::ExposureParams;
    use crate::error::Result;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Adds its single f32 parameter and counts how often it ran.
    struct Counting {
        runs: Arc<AtomicUsize>,
    }

    impl ProcessingModule for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }
        fn version(&self) -> u32 {
            1
        }
        fn params_size(&self) -> usize {
            4
        }
        fn default_params(&self) -> Vec<u8> {
            0.0f32.to_ne_bytes().to_vec()
        }
        fn apply(&self, params: &[u8], buffer: &mut RgbaBuffer) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let add: f32 = crate::develop::module::decode_params(self.name(), params)?;
            for px in buffer.pixels_mut() {
                px[0] += add;
            }
            Ok(())
        }
    }

    fn counting_spec(runs: &Arc<AtomicUsize>, priority: u32, add: f32) -> NodeSpec {
        NodeSpec {
            num: priority,
            operation: "counting".into(),
            multi_priority: priority,
            module: Arc::new(Counting { runs: Arc::clone(runs) }),
            params: add.to_ne_bytes().to_vec(),
            blend: None,
        }
    }

    fn record() -> ImageRecord {
        ImageRecord::new(1, PathBuf::from("/tmp/test.png"))
    }

    fn float_buffer(width: u32, height: u32, rgba: [f32; 4]) -> MipBuffer {
        let mut buffer = MipBuffer::default();
        let data = RgbaBuffer::filled(width as usize, height as usize, rgba).data;
        buffer.set_float(width, height, PixelFormat::RgbaF32, data);
        buffer
    }

    #[test]
    fn test_nodes_follow_winning_items() {
        let registry = ModuleRegistry::builtin();
        let mut history = HistoryStack::new();
        let crop = encode_params(&CropParams::default());
        let exp = |ev: f32| encode_params(&ExposureParams { exposure: ev, black: 0.0 });
        let with_version = |mut i: crate::develop::HistoryItem, v: u32| {
            i.module_version = v;
            i
        };
        history.push(item("crop", true, &crop));
        history.push(with_version(item("exposure", true, &exp(1.0)), 2));
        history.push(with_version(item("exposure", false, &exp(1.0)), 2));
        history.push(with_version(item("exposure", true, &exp(2.0)), 2));
        history.push(item("lens", true, &[]));

        let specs = NodeSpec::from_history(&registry, &history);
        let ops: Vec<&str> = specs.iter().map(|s| s.operation.as_str()).collect();
        assert_eq!(ops, vec!["crop", "exposure"]);
        assert_eq!(specs[1].num, 3);
        assert_eq!(specs[1].params, exp(2.0));
    }

    #[test]
    fn test_process_applies_chain_in_order() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut pipe = Pipe::new(PipeKind::Full);
        pipe.synch(
            vec![counting_spec(&runs, 0, 0.25), counting_spec(&runs, 1, 0.25)],
            ChangeFlags::REMOVE,
        );
        let buffer = float_buffer(4, 2, [0.0, 0.0, 0.0, 1.0]);
        let source = SourceImage::new(&record(), MipLevel::Full, &buffer);

        let out = pipe.process(&source, || false).unwrap();
        assert_eq!((out.width, out.height), (4, 2));
        // 0.5 linear in sRGB
        assert_eq!(out.pixel(0, 0), [188, 0, 0, 255]);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_top_change_reuses_prefix() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut pipe = Pipe::new(PipeKind::Preview);
        pipe.synch(
            vec![counting_spec(&runs, 0, 0.1), counting_spec(&runs, 1, 0.1)],
            ChangeFlags::REMOVE,
        );
        let buffer = float_buffer(8, 8, [0.2, 0.2, 0.2, 1.0]);
        let source = SourceImage::new(&record(), MipLevel::Preview, &buffer);
        pipe.process(&source, || false).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        pipe.synch(
            vec![counting_spec(&runs, 0, 0.1), counting_spec(&runs, 1, 0.3)],
            ChangeFlags::TOP_CHANGED,
        );
        pipe.process(&source, || false).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        // Nothing changed: everything comes from the node cache
        pipe.process(&source, || false).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_abort_between_nodes() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut pipe = Pipe::new(PipeKind::Full);
        pipe.synch(
            vec![counting_spec(&runs, 0, 0.1), counting_spec(&runs, 1, 0.1)],
            ChangeFlags::REMOVE,
        );
        let buffer = float_buffer(2, 2, [0.2, 0.2, 0.2, 1.0]);
        let source = SourceImage::new(&record(), MipLevel::Full, &buffer);
        let checks = AtomicUsize::new(0);
        let out = pipe.process(&source, || checks.fetch_add(1, Ordering::SeqCst) >= 1);
        assert!(out.is_none());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_mosaic_input_is_demosaiced_and_oriented() {
        let mut rec = record();
        rec.cfa = Some(CfaPattern::RGGB);
        rec.orientation = Orientation::ROTATE_90;
        let mut buffer = MipBuffer::default();
        buffer.set_float(6, 4, PixelFormat::MosaicF32, vec![0.5; 24]);
        let source = SourceImage::new(&rec, MipLevel::Full, &buffer);

        let mut pipe = Pipe::new(PipeKind::Full);
        pipe.synch(Vec::new(), ChangeFlags::REMOVE);
        let out = pipe.process(&source, || false).unwrap();
        assert_eq!((out.width, out.height), (4, 6));
        let px = out.pixel(1, 1);
        assert_eq!(px[0], px[1]);
        assert_eq!(px[1], px[2]);
    }

    #[test]
    fn test_bounds_account_for_crop() {
        let registry = ModuleRegistry::builtin();
        let crop = registry.get("crop").unwrap();
        let spec = NodeSpec {
            num: 0,
            operation: "crop".into(),
            multi_priority: 0,
            module: crop,
            params: encode_params(&CropParams { cx: 0.0, cy: 0.0, cw: 0.5, ch: 1.0 }),
            blend: None,
        };
        let mut pipe = Pipe::with_bounds(100, 100);
        pipe.synch(vec![spec], ChangeFlags::REMOVE);
        let buffer = float_buffer(400, 200, [0.5, 0.5, 0.5, 1.0]);
        let source = SourceImage::new(&record(), MipLevel::Full, &buffer);

        let out = pipe.process(&source, || false).unwrap();
        assert_eq!((out.width, out.height), (100, 100));
        assert_eq!(pipe.processed_size(), (100, 100));
    }

    #[test]
    fn test_region_crop() {
        let mut pipe = Pipe::new(PipeKind::Full);
        pipe.synch(Vec::new(), ChangeFlags::REMOVE);
        pipe.set_region(Roi { x: 0.5, y: 0.0, width: 0.5, height: 0.5 });
        let buffer = float_buffer(10, 10, [1.0, 1.0, 1.0, 1.0]);
        let source = SourceImage::new(&record(), MipLevel::Full, &buffer);
        let out = pipe.process(&source, || false).unwrap();
        assert_eq!((out.width, out.height), (5, 5));
        assert_eq!((out.processed_width, out.processed_height), (10, 10));
    }

    #[test]
    fn test_change_flags() {
        let flags = ChangeFlags::SYNCH | ChangeFlags::REMOVE;
        assert!(flags.contains(ChangeFlags::SYNCH));
        assert!(!flags.contains(ChangeFlags::ZOOMED));
        assert!(ChangeFlags::UNCHANGED.is_empty());
    }
}
