//! Annotation renderer: boxes, labels and captions drawn onto a copy of a frame.

use std::sync::OnceLock;

use ab_glyph::{FontRef, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;

use crate::detect::{BoundingBox, Detection};
use crate::frame::Frame;

pub const RED: Rgb<u8> = Rgb([255, 0, 0]);
pub const BLUE: Rgb<u8> = Rgb([0, 0, 255]);
pub const GREEN: Rgb<u8> = Rgb([0, 255, 0]);
const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
const BLACK: Rgb<u8> = Rgb([0, 0, 0]);

const BOX_THICKNESS: u32 = 2;
const LABEL_SCALE: f32 = 14.0;
const LABEL_PAD: u32 = 2;

static FONT_BYTES: &[u8] = include_bytes!("../assets/DejaVuSansMono.ttf");

fn label_font() -> Option<&'static FontRef<'static>> {
    static FONT: OnceLock<Option<FontRef<'static>>> = OnceLock::new();
    FONT.get_or_init(|| match FontRef::try_from_slice(FONT_BYTES) {
        Ok(font) => Some(font),
        Err(err) => {
            log::warn!("label font unusable, drawing boxes only: {}", err);
            None
        }
    })
    .as_ref()
}

/// Box colour for a class: threats red, people blue, everything else green.
pub fn class_colour(class_name: &str) -> Rgb<u8> {
    let class = class_name.to_lowercase();
    if ["weapon", "knife", "gun"].iter().any(|k| class.contains(k)) {
        RED
    } else if class.contains("person") {
        BLUE
    } else {
        GREEN
    }
}

/// Text drawn above a detection box.
pub fn label_text(detection: &Detection) -> String {
    format!("{} {:.2}", detection.class_name, detection.confidence)
}

/// Pixel corners of `bbox` clamped onto a `width` x `height` canvas.
/// Non-finite coordinates land on the nearest edge (NaN on 0).
fn clamp_to_canvas(bbox: &BoundingBox, width: u32, height: u32) -> (u32, u32, u32, u32) {
    let max_x = width.saturating_sub(1) as f32;
    let max_y = height.saturating_sub(1) as f32;
    let x = |v: f32| v.max(0.0).min(max_x) as u32;
    let y = |v: f32| v.max(0.0).min(max_y) as u32;
    let (x1, x2) = (x(bbox.x1), x(bbox.x2));
    let (y1, y2) = (y(bbox.y1), y(bbox.y2));
    (x1.min(x2), y1.min(y2), x1.max(x2), y1.max(y2))
}

/// Filled box behind `text` at (`x`, `y`), then the text itself.
fn draw_label(canvas: &mut RgbImage, x: u32, y: u32, text: &str, fill: Rgb<u8>, ink: Rgb<u8>) {
    let Some(font) = label_font() else {
        return;
    };
    let scale = PxScale::from(LABEL_SCALE);
    let (text_w, text_h) = text_size(scale, font, text);
    let rect = Rect::at(x as i32, y as i32).of_size(
        text_w.saturating_add(2 * LABEL_PAD).max(1),
        text_h.saturating_add(2 * LABEL_PAD).max(1),
    );
    draw_filled_rect_mut(canvas, rect, fill);
    draw_text_mut(
        canvas,
        ink,
        x.saturating_add(LABEL_PAD) as i32,
        y.saturating_add(LABEL_PAD) as i32,
        scale,
        font,
        text,
    );
}

fn label_height(text: &str) -> u32 {
    label_font()
        .map(|font| text_size(PxScale::from(LABEL_SCALE), font, text).1)
        .unwrap_or(0)
        .saturating_add(2 * LABEL_PAD)
}

/// Draw one rectangle and label per detection onto a copy of `frame`.
pub fn annotate(frame: &Frame, detections: &[Detection]) -> Frame {
    let mut canvas = frame.image().clone();
    let (width, height) = canvas.dimensions();
    if width == 0 || height == 0 {
        return Frame::captured(canvas, frame.captured_at());
    }
    for det in detections {
        let colour = class_colour(&det.class_name);
        let (x1, y1, x2, y2) = clamp_to_canvas(&det.bbox, width, height);
        for t in 0..BOX_THICKNESS {
            let (w, h) = ((x2 - x1 + 1).saturating_sub(2 * t), (y2 - y1 + 1).saturating_sub(2 * t));
            if w == 0 || h == 0 {
                break;
            }
            let rect = Rect::at((x1 + t) as i32, (y1 + t) as i32).of_size(w, h);
            draw_hollow_rect_mut(&mut canvas, rect, colour);
        }

        let text = label_text(det);
        let label_h = label_height(&text);
        let label_y = y1.checked_sub(label_h).unwrap_or(y1);
        draw_label(&mut canvas, x1, label_y, &text, colour, WHITE);
    }
    Frame::captured(canvas, frame.captured_at())
}

/// Copy of `frame` with `text` in the top-left corner.
pub fn overlay_caption(frame: &Frame, text: &str) -> Frame {
    let mut canvas = frame.image().clone();
    if canvas.width() > 0 && canvas.height() > 0 {
        draw_label(&mut canvas, 8, 8, text, BLACK, GREEN);
    }
    Frame::captured(canvas, frame.captured_at())
}
