//! PNG chart rendering.
//!
//! Charts are drawn straight onto an RGB canvas: light grid, axes, the data
//! series and an optional dotted red regression line. The encoded PNG is
//! returned as a `data:image/png;base64,` URI and kept under
//! [`MAX_PLOT_BYTES`] by shrinking the canvas when needed.

use std::io::Cursor;

use base64::Engine;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use thiserror::Error;

use super::plan::PlotKind;

/// Largest encoded PNG a plot may produce.
pub const MAX_PLOT_BYTES: usize = 100_000;

const DEFAULT_WIDTH: u32 = 800;
const DEFAULT_HEIGHT: u32 = 600;
const MIN_WIDTH: u32 = 200;
const GRID_DIVISIONS: u32 = 5;

const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
const GRID: Rgb<u8> = Rgb([225, 225, 225]);
const AXIS: Rgb<u8> = Rgb([40, 40, 40]);
const SERIES: Rgb<u8> = Rgb([31, 119, 180]);
const REGRESSION: Rgb<u8> = Rgb([214, 39, 40]);

/// Errors rendering a chart.
#[derive(Debug, Error)]
pub enum PlotError {
    #[error("no numeric points to plot")]
    NoData,
    #[error("regression needs at least two distinct x values")]
    RegressionUndefined,
    #[error("PNG encoding failed: {0}")]
    Encode(#[from] image::ImageError),
    #[error("plot is {0} bytes even at minimum size (limit is 100000 bytes)")]
    TooLarge(usize),
}

/// Least-squares fit `y = slope * x + intercept`.
pub fn least_squares(points: &[(f64, f64)]) -> Option<(f64, f64)> {
    let n = points.len() as f64;
    if points.len() < 2 {
        return None;
    }
    let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;
    let sxx: f64 = points.iter().map(|p| (p.0 - mean_x).powi(2)).sum();
    if sxx <= f64::EPSILON {
        return None;
    }
    let sxy: f64 = points
        .iter()
        .map(|p| (p.0 - mean_x) * (p.1 - mean_y))
        .sum();
    let slope = sxy / sxx;
    Some((slope, mean_y - slope * mean_x))
}

/// Render a chart and return it as a PNG data URI.
pub fn render_plot(
    kind: PlotKind,
    points: &[(f64, f64)],
    regression: bool,
) -> Result<String, PlotError> {
    let mut points: Vec<(f64, f64)> = points
        .iter()
        .copied()
        .filter(|(x, y)| x.is_finite() && y.is_finite())
        .collect();
    if points.is_empty() {
        return Err(PlotError::NoData);
    }
    if kind == PlotKind::Line {
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
    }

    let fit = if regression {
        Some(least_squares(&points).ok_or(PlotError::RegressionUndefined)?)
    } else {
        None
    };

    let png = encode_within(MAX_PLOT_BYTES, |width, height| {
        render_png(kind, &points, fit, width, height)
    })?;
    Ok(format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(&png)
    ))
}

/// Render at the default size, halving both sides until the PNG fits in
/// `limit` bytes or the width would drop below [`MIN_WIDTH`].
fn encode_within(
    limit: usize,
    mut render: impl FnMut(u32, u32) -> Result<Vec<u8>, PlotError>,
) -> Result<Vec<u8>, PlotError> {
    let (mut width, mut height) = (DEFAULT_WIDTH, DEFAULT_HEIGHT);
    loop {
        let png = render(width, height)?;
        if png.len() <= limit {
            return Ok(png);
        }
        if width / 2 < MIN_WIDTH {
            return Err(PlotError::TooLarge(png.len()));
        }
        width /= 2;
        height /= 2;
    }
}

fn render_png(
    kind: PlotKind,
    points: &[(f64, f64)],
    fit: Option<(f64, f64)>,
    width: u32,
    height: u32,
) -> Result<Vec<u8>, PlotError> {
    let frame = Frame::fit(kind, points, width, height);
    let mut canvas = Canvas::new(width, height);

    for i in 0..=GRID_DIVISIONS {
        let gx = frame.left + (frame.right - frame.left) * i as f64 / GRID_DIVISIONS as f64;
        let gy = frame.top + (frame.bottom - frame.top) * i as f64 / GRID_DIVISIONS as f64;
        canvas.line((gx, frame.top), (gx, frame.bottom), GRID, 1, false);
        canvas.line((frame.left, gy), (frame.right, gy), GRID, 1, false);
        canvas.line((gx, frame.bottom), (gx, frame.bottom + 5.0), AXIS, 1, false);
        canvas.line((frame.left - 5.0, gy), (frame.left, gy), AXIS, 1, false);
    }

    match kind {
        PlotKind::Scatter => {
            for &(x, y) in points {
                canvas.disc(frame.px(x, y), 4.0, SERIES);
            }
        }
        PlotKind::Line => {
            for pair in points.windows(2) {
                let (a, b) = (pair[0], pair[1]);
                canvas.line(frame.px(a.0, a.1), frame.px(b.0, b.1), SERIES, 2, false);
            }
            for &(x, y) in points {
                canvas.disc(frame.px(x, y), 2.5, SERIES);
            }
        }
        PlotKind::Bar => {
            let half = frame.bar_half_width(points);
            let (_, base) = frame.px(frame.x_min, 0.0);
            for &(x, y) in points {
                let (cx, top) = frame.px(x, y);
                canvas.rect(cx - half, top.min(base), cx + half, top.max(base), SERIES);
            }
        }
    }

    if let Some((slope, intercept)) = fit {
        let start = frame.px(frame.x_min, slope * frame.x_min + intercept);
        let end = frame.px(frame.x_max, slope * frame.x_max + intercept);
        canvas.line(start, end, REGRESSION, 2, true);
    }

    canvas.line((frame.left, frame.bottom), (frame.right, frame.bottom), AXIS, 2, false);
    canvas.line((frame.left, frame.top), (frame.left, frame.bottom), AXIS, 2, false);

    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(canvas.img)
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
    Ok(buf)
}

/// Mapping from data coordinates to pixel coordinates.
struct Frame {
    left: f64,
    right: f64,
    top: f64,
    bottom: f64,
    x_min: f64,
    x_max: f64,
    y_min: f64,
    y_max: f64,
}

impl Frame {
    fn fit(kind: PlotKind, points: &[(f64, f64)], width: u32, height: u32) -> Self {
        let (mut x_min, mut x_max) = bounds(points.iter().map(|p| p.0));
        let (mut y_min, mut y_max) = bounds(points.iter().map(|p| p.1));

        if kind == PlotKind::Bar {
            y_min = y_min.min(0.0);
            y_max = y_max.max(0.0);
            x_min -= 0.5;
            x_max += 0.5;
        }
        let (x_min, x_max) = pad(x_min, x_max);
        let (y_min, y_max) = pad(y_min, y_max);

        let margin_x = (width as f64 * 0.08).max(12.0);
        let margin_y = (height as f64 * 0.08).max(12.0);
        Self {
            left: margin_x,
            right: width as f64 - margin_x / 2.0,
            top: margin_y / 2.0,
            bottom: height as f64 - margin_y,
            x_min,
            x_max,
            y_min,
            y_max,
        }
    }

    fn px(&self, x: f64, y: f64) -> (f64, f64) {
        let fx = (x - self.x_min) / (self.x_max - self.x_min);
        let fy = (y - self.y_min) / (self.y_max - self.y_min);
        (
            self.left + fx * (self.right - self.left),
            self.bottom - fy * (self.bottom - self.top),
        )
    }

    /// Half the bar width in pixels: 70% of the tightest x spacing.
    fn bar_half_width(&self, points: &[(f64, f64)]) -> f64 {
        let mut xs: Vec<f64> = points.iter().map(|p| p.0).collect();
        xs.sort_by(f64::total_cmp);
        xs.dedup();
        let spacing = xs
            .windows(2)
            .map(|w| w[1] - w[0])
            .fold(f64::INFINITY, f64::min);
        let spacing = if spacing.is_finite() { spacing } else { 1.0 };
        let px_per_unit = (self.right - self.left) / (self.x_max - self.x_min);
        (spacing * px_per_unit * 0.35).max(1.0)
    }
}

fn bounds(values: impl Iterator<Item = f64>) -> (f64, f64) {
    values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    })
}

/// Add 5% headroom; widen degenerate ranges to one unit each side.
fn pad(min: f64, max: f64) -> (f64, f64) {
    if (max - min).abs() <= f64::EPSILON {
        return (min - 1.0, max + 1.0);
    }
    let pad = (max - min) * 0.05;
    (min - pad, max + pad)
}

struct Canvas {
    img: RgbImage,
}

impl Canvas {
    fn new(width: u32, height: u32) -> Self {
        Self {
            img: RgbImage::from_pixel(width, height, WHITE),
        }
    }

    fn put(&mut self, x: i64, y: i64, color: Rgb<u8>) {
        if x >= 0 && y >= 0 && (x as u32) < self.img.width() && (y as u32) < self.img.height() {
            self.img.put_pixel(x as u32, y as u32, color);
        }
    }

    /// Bresenham line; `dotted` skips alternate 6-pixel runs.
    fn line(
        &mut self,
        from: (f64, f64),
        to: (f64, f64),
        color: Rgb<u8>,
        thickness: i64,
        dotted: bool,
    ) {
        let (mut x0, mut y0) = (from.0.round() as i64, from.1.round() as i64);
        let (x1, y1) = (to.0.round() as i64, to.1.round() as i64);
        let dx = (x1 - x0).abs();
        let dy = -(y1 - y0).abs();
        let sx = if x0 < x1 { 1 } else { -1 };
        let sy = if y0 < y1 { 1 } else { -1 };
        let mut err = dx + dy;
        let mut step = 0u64;

        loop {
            if !dotted || (step / 6) % 2 == 0 {
                for t in 0..thickness {
                    let offset = t - thickness / 2;
                    if dx >= -dy {
                        self.put(x0, y0 + offset, color);
                    } else {
                        self.put(x0 + offset, y0, color);
                    }
                }
            }
            if x0 == x1 && y0 == y1 {
                break;
            }
            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                x0 += sx;
            }
            if e2 <= dx {
                err += dx;
                y0 += sy;
            }
            step += 1;
        }
    }

    fn disc(&mut self, center: (f64, f64), radius: f64, color: Rgb<u8>) {
        let r = radius.ceil() as i64;
        let (cx, cy) = (center.0.round() as i64, center.1.round() as i64);
        for dy in -r..=r {
            for dx in -r..=r {
                if ((dx * dx + dy * dy) as f64) <= radius * radius {
                    self.put(cx + dx, cy + dy, color);
                }
            }
        }
    }

    fn rect(&mut self, x0: f64, y0: f64, x1: f64, y1: f64, color: Rgb<u8>) {
        for y in y0.round() as i64..=y1.round() as i64 {
            for x in x0.round() as i64..=x1.round() as i64 {
                self.put(x, y, color);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(uri: &str) -> DynamicImage {
        let b64 = uri.strip_prefix("data:image/png;base64,").unwrap();
        let bytes = base64::engine::general_purpose::STANDARD.decode(b64).unwrap();
        assert!(bytes.len() <= MAX_PLOT_BYTES);
        image::load_from_memory_with_format(&bytes, ImageFormat::Png).unwrap()
    }

    #[test]
    fn test_least_squares() {
        let (slope, intercept) = least_squares(&[(0.0, 1.0), (1.0, 3.0), (2.0, 5.0)]).unwrap();
        assert!((slope - 2.0).abs() < 1e-9);
        assert!((intercept - 1.0).abs() < 1e-9);
        assert!(least_squares(&[(1.0, 1.0), (1.0, 2.0)]).is_none());
        assert!(least_squares(&[(1.0, 1.0)]).is_none());
    }

    #[test]
    fn test_scatter_with_regression_has_red_pixels() {
        let points: Vec<(f64, f64)> = (1..=20).map(|i| (i as f64, (i * 3 % 7) as f64)).collect();
        let uri = render_plot(PlotKind::Scatter, &points, true).unwrap();
        let img = decode(&uri).to_rgb8();
        assert_eq!(img.dimensions(), (DEFAULT_WIDTH, DEFAULT_HEIGHT));
        assert!(img.pixels().any(|p| *p == REGRESSION));
        assert!(img.pixels().any(|p| *p == SERIES));
    }

    #[test]
    fn test_bar_and_line_render() {
        let points = [(0.0, 3.0), (1.0, -2.0), (2.0, 5.0)];
        for kind in [PlotKind::Bar, PlotKind::Line] {
            let uri = render_plot(kind, &points, false).unwrap();
            assert!(decode(&uri).to_rgb8().pixels().any(|p| *p == SERIES));
        }
    }

    fn noisy_points(n: u64) -> Vec<(f64, f64)> {
        (0..n)
            .map(|i| ((i * 7919 % 1000) as f64, (i * 104_729 % 997) as f64))
            .collect()
    }

    #[test]
    fn test_oversized_plot_shrinks() {
        let points = noisy_points(3000);
        let render = |w, h| render_png(PlotKind::Scatter, &points, None, w, h);
        let full = render(DEFAULT_WIDTH, DEFAULT_HEIGHT).unwrap();
        let half = render(DEFAULT_WIDTH / 2, DEFAULT_HEIGHT / 2).unwrap();
        assert!(half.len() < full.len());

        let png = encode_within(half.len(), render).unwrap();
        let img = image::load_from_memory_with_format(&png, ImageFormat::Png).unwrap();
        assert_eq!(img.to_rgb8().dimensions(), (DEFAULT_WIDTH / 2, DEFAULT_HEIGHT / 2));
    }

    #[test]
    fn test_plot_too_large_at_minimum_size() {
        let points = noisy_points(3000);
        let mut sizes = Vec::new();
        let result = encode_within(64, |w, h| {
            sizes.push(w);
            render_png(PlotKind::Scatter, &points, None, w, h)
        });
        assert!(matches!(result, Err(PlotError::TooLarge(n)) if n > 64));
        assert_eq!(sizes, vec![800, 400, 200]);
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            render_plot(PlotKind::Scatter, &[(f64::NAN, 1.0)], false),
            Err(PlotError::NoData)
        ));
        assert!(matches!(
            render_plot(PlotKind::Scatter, &[(2.0, 1.0), (2.0, 3.0)], true),
            Err(PlotError::RegressionUndefined)
        ));
    }
}
