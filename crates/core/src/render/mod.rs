use base64::{engine::general_purpose::STANDARD, Engine as _};
use tiny_skia::{
    Color, FilterQuality, GradientStop, LinearGradient, Paint, Pixmap, PixmapPaint, Point, Rect,
    SpreadMode, Transform,
};

use crate::{config::StageConfig, scene::Pose, Result, StageError};

const PLACEHOLDER_SIZE: f32 = 100.0;
const BACKGROUND_STOPS: [(f32, [u8; 3]); 3] = [
    (0.0, [0x1a, 0x4b, 0x1a]),
    (0.5, [0x2d, 0x5a, 0x2d]),
    (1.0, [0x0d, 0x2d, 0x0d]),
];

/// The stage render surface.
///
/// Elements are positioned in virtual coordinates and scaled per axis to the
/// pixel size of the surface. The surface is only written inside a frame and
/// read between frames, so a snapshot never sees a partial frame.
pub struct Renderer {
    surface: Pixmap,
    scale_x: f32,
    scale_y: f32,
}

impl Renderer {
    pub fn new(stage: &StageConfig) -> Result<Self> {
        let surface = Pixmap::new(stage.output_width, stage.output_height).ok_or_else(|| {
            StageError::render(format!(
                "cannot allocate a {}x{} surface",
                stage.output_width, stage.output_height
            ))
        })?;
        Ok(Self {
            surface,
            scale_x: stage.output_width as f32 / stage.virtual_width.max(1.0),
            scale_y: stage.output_height as f32 / stage.virtual_height.max(1.0),
        })
    }

    /// Clears the surface to the forest background.
    pub fn begin_frame(&mut self) {
        let height = self.surface.height() as f32;
        let stops = BACKGROUND_STOPS
            .iter()
            .map(|(position, [r, g, b])| {
                GradientStop::new(*position, Color::from_rgba8(*r, *g, *b, 255))
            })
            .collect();
        let shader = LinearGradient::new(
            Point::from_xy(0.0, 0.0),
            Point::from_xy(0.0, height),
            stops,
            SpreadMode::Pad,
            Transform::identity(),
        );

        match shader {
            Some(shader) => {
                let paint = Paint {
                    shader,
                    ..Paint::default()
                };
                let area = Rect::from_xywh(0.0, 0.0, self.surface.width() as f32, height);
                if let Some(area) = area {
                    self.surface
                        .fill_rect(area, &paint, Transform::identity(), None);
                }
            }
            None => {
                let [r, g, b] = BACKGROUND_STOPS[1].1;
                self.surface.fill(Color::from_rgba8(r, g, b, 255));
            }
        }
    }

    /// Draws one element centred on its position. Without a decoded image a
    /// coloured placeholder square derived from the id is drawn instead.
    pub fn draw_element(&mut self, id: &str, pose: &Pose, image: Option<&Pixmap>) {
        let opacity = pose.opacity.clamp(0.0, 1.0) as f32;
        if opacity <= 0.0 {
            return;
        }
        let transform = Transform::from_scale(self.scale_x, self.scale_y)
            .pre_translate(pose.x as f32, pose.y as f32)
            .pre_rotate(pose.rotation.to_degrees() as f32)
            .pre_scale(pose.scale as f32, pose.scale as f32);

        match image {
            Some(image) => {
                let paint = PixmapPaint {
                    opacity,
                    quality: FilterQuality::Bilinear,
                    ..PixmapPaint::default()
                };
                let x = -(image.width() as i32) / 2;
                let y = -(image.height() as i32) / 2;
                self.surface
                    .draw_pixmap(x, y, image.as_ref(), &paint, transform, None);
            }
            None => {
                let [r, g, b] = placeholder_rgb(id);
                let mut paint = Paint::default();
                paint.set_color(Color::from_rgba8(r, g, b, (opacity * 255.0).round() as u8));
                paint.anti_alias = true;
                let half = PLACEHOLDER_SIZE / 2.0;
                if let Some(square) =
                    Rect::from_xywh(-half, -half, PLACEHOLDER_SIZE, PLACEHOLDER_SIZE)
                {
                    self.surface.fill_rect(square, &paint, transform, None);
                }
            }
        }
    }

    pub fn surface(&self) -> &Pixmap {
        &self.surface
    }

    pub fn snapshot_png(&self) -> Result<Vec<u8>> {
        self.surface
            .encode_png()
            .map_err(|err| StageError::render(err.to_string()))
    }

    /// PNG snapshot of the current frame as a `data:` URL.
    pub fn snapshot_data_url(&self) -> Result<String> {
        let png = self.snapshot_png()?;
        Ok(format!("data:image/png;base64,{}", STANDARD.encode(png)))
    }
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer")
            .field("width", &self.surface.width())
            .field("height", &self.surface.height())
            .finish()
    }
}

/// Placeholder colour: hue from the first character of the id, 70%
/// saturation, 60% lightness.
pub fn placeholder_rgb(id: &str) -> [u8; 3] {
    let code = id.chars().next().map_or(0, u32::from);
    let hue = (u64::from(code) * 137 % 360) as f64;
    hsl_to_rgb(hue, 0.7, 0.6)
}

fn hsl_to_rgb(hue: f64, saturation: f64, lightness: f64) -> [u8; 3] {
    let chroma = (1.0 - (2.0 * lightness - 1.0).abs()) * saturation;
    let sector = hue.rem_euclid(360.0) / 60.0;
    let x = chroma * (1.0 - (sector % 2.0 - 1.0).abs());
    let (r, g, b) = match sector as u32 {
        0 => (chroma, x, 0.0),
        1 => (x, chroma, 0.0),
        2 => (0.0, chroma, x),
        3 => (0.0, x, chroma),
        4 => (x, 0.0, chroma),
        _ => (chroma, 0.0, x),
    };
    let m = lightness - chroma / 2.0;
    let channel = |v: f64| ((v + m) * 255.0).round().clamp(0.0, 255.0) as u8;
    [channel(r), channel(g), channel(b)]
}
