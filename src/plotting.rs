// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Residual-plot artefacts for the dispersion solution.
//!
//! One page, four panels: detected line positions over a grey rendering of
//! the pinhole frame, the post-fit predicted positions over the same frame,
//! the (r_x, r_y) scatter, and a histogram of the combined residual.

use std::path::Path;

use log::info;
use ndarray::Array2;
use plotters::prelude::*;
use thiserror::Error;

use crate::context::{Frame, PinholeMode};
use crate::fitter::FitSolution;

#[derive(Error, Debug)]
pub enum PlotError {
    #[error("Error when plotting: {0}")]
    Draw(String),
}

const PAGE_WIDTH: u32 = 1200;
const PAGE_HEIGHT: u32 = 1600;

/// Render the four-panel residual QC page.
pub fn plot_fit_residuals(
    frame: &Frame,
    solution: &FitSolution,
    mode: PinholeMode,
    path: &Path,
) -> Result<(), PlotError> {
    let root = BitMapBackend::new(path, (PAGE_WIDTH, PAGE_HEIGHT)).into_drawing_area();
    root.fill(&WHITE).map_err(to_plot_error)?;

    let title = format!(
        "residuals of global dispersion solution fitting - {} pinhole\nmean res: {:.2} pix, res stdev: {:.2}",
        mode,
        solution.stats.xy_mean,
        solution.stats.xy_std,
    );
    let root = root
        .titled(&title, ("sans-serif", 22))
        .map_err(to_plot_error)?;

    let (top, rest) = root.split_vertically(480);
    let (mid, bottom) = rest.split_vertically(480);
    let (bottom_left, bottom_right) = bottom.split_horizontally(600);

    scatter_over_frame(
        &top,
        frame,
        "observed arc-line positions (post-clipping)",
        solution
            .surviving
            .observed_x
            .iter()
            .zip(solution.surviving.observed_y.iter())
            .map(|(&x, &y)| (x, y)),
        &RED,
    )?;
    scatter_over_frame(
        &mid,
        frame,
        "global dispersion solution",
        solution
            .fit_x
            .iter()
            .zip(solution.fit_y.iter())
            .map(|(&x, &y)| (x, y)),
        &BLUE,
    )?;
    residual_scatter(&bottom_left, solution)?;
    residual_histogram(&bottom_right, solution)?;

    root.present().map_err(to_plot_error)?;
    info!("Residual plot written to {}", path.display());
    Ok(())
}

fn to_plot_error<E: std::fmt::Display>(e: E) -> PlotError {
    PlotError::Draw(e.to_string())
}

/// Grey blocks approximating the frame, under a point series.
fn scatter_over_frame<DB: DrawingBackend, I: Iterator<Item = (f64, f64)>>(
    area: &DrawingArea<DB, plotters::coord::Shift>,
    frame: &Frame,
    title: &str,
    points: I,
    colour: &RGBColor,
) -> Result<(), PlotError> {
    let (height, width) = frame.shape();
    let mut chart = ChartBuilder::on(area)
        .caption(title, ("sans-serif", 16))
        .margin(10)
        .x_label_area_size(30)
        .y_label_area_size(40)
        .build_cartesian_2d(0.0..width as f64, 0.0..height as f64)
        .map_err(to_plot_error)?;
    chart
        .configure_mesh()
        .disable_mesh()
        .draw()
        .map_err(to_plot_error)?;

    // Downsample the frame into grey tiles; a full-resolution backdrop
    // buys nothing at this output size.
    let blocks = 160_usize;
    let bx = (width / blocks).max(1);
    let by = (height / blocks).max(1);
    let (lo, hi) = display_range(&frame.data);
    let span = (hi - lo).max(1e-12);
    let mut tiles = vec![];
    for ty in (0..height).step_by(by) {
        for tx in (0..width).step_by(bx) {
            let mut sum = 0.0;
            let mut n = 0;
            for y in ty..(ty + by).min(height) {
                for x in tx..(tx + bx).min(width) {
                    sum += frame.data[[y, x]];
                    n += 1;
                }
            }
            let level = ((sum / n as f64 - lo) / span).clamp(0.0, 1.0);
            let grey = 255 - (level * 128.0) as u8;
            tiles.push(Rectangle::new(
                [
                    (tx as f64, ty as f64),
                    ((tx + bx) as f64, (ty + by) as f64),
                ],
                RGBColor(grey, grey, grey).filled(),
            ));
        }
    }
    chart.draw_series(tiles).map_err(to_plot_error)?;
    chart
        .draw_series(points.map(|(x, y)| Circle::new((x, y), 2, colour.filled())))
        .map_err(to_plot_error)?;
    Ok(())
}

/// Display stretch bounds, clipped against hot pixels.
fn display_range(data: &Array2<f64>) -> (f64, f64) {
    let stats = crate::math::sigma_clipped_stats(
        &data.iter().copied().collect::<Vec<f64>>(),
        3.0,
    );
    (stats.median - stats.std, stats.median + 3.0 * stats.std)
}

fn residual_scatter<DB: DrawingBackend>(
    area: &DrawingArea<DB, plotters::coord::Shift>,
    solution: &FitSolution,
) -> Result<(), PlotError> {
    let limit = solution
        .residual_x
        .iter()
        .chain(solution.residual_y.iter())
        .fold(0.0_f64, |acc, r| acc.max(r.abs()))
        .max(1e-6)
        * 1.1;

    let mut chart = ChartBuilder::on(area)
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(50)
        .build_cartesian_2d(-limit..limit, -limit..limit)
        .map_err(to_plot_error)?;
    chart
        .configure_mesh()
        .x_desc("x residual")
        .y_desc("y residual")
        .draw()
        .map_err(to_plot_error)?;
    chart
        .draw_series(
            solution
                .residual_x
                .iter()
                .zip(solution.residual_y.iter())
                .map(|(&rx, &ry)| Circle::new((rx, ry), 2, BLUE.mix(0.4).filled())),
        )
        .map_err(to_plot_error)?;
    Ok(())
}

fn residual_histogram<DB: DrawingBackend>(
    area: &DrawingArea<DB, plotters::coord::Shift>,
    solution: &FitSolution,
) -> Result<(), PlotError> {
    let max = solution
        .residual_xy
        .iter()
        .fold(0.0_f64, |acc, r| acc.max(*r))
        .max(1e-6);
    let nbins = 24_usize;
    let bin_width = max / nbins as f64;
    let mut counts = vec![0_usize; nbins];
    for r in &solution.residual_xy {
        let bin = ((r / bin_width) as usize).min(nbins - 1);
        counts[bin] += 1;
    }
    let peak = counts.iter().copied().max().unwrap_or(1).max(1);

    let mut chart = ChartBuilder::on(area)
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(50)
        .build_cartesian_2d(0.0..max, 0_usize..peak + peak / 10 + 1)
        .map_err(to_plot_error)?;
    chart
        .configure_mesh()
        .x_desc("xy residual")
        .draw()
        .map_err(to_plot_error)?;
    chart
        .draw_series(counts.iter().enumerate().map(|(i, &count)| {
            Rectangle::new(
                [
                    (i as f64 * bin_width, 0),
                    ((i + 1) as f64 * bin_width, count),
                ],
                BLUE.mix(0.6).filled(),
            )
        }))
        .map_err(to_plot_error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use ndarray::Array2;

    use super::*;
    use crate::catalogue::LineTable;
    use crate::centroid::DetectedLines;
    use crate::fitter::{fit_dispersion_polynomials, ClipConfig};
    use crate::context::FrameHeader;

    #[test]
    fn residual_page_renders_to_disk() {
        // A tiny synthetic solution; the plot only needs consistent arrays.
        let mut order = vec![];
        let mut wavelength = vec![];
        let mut slit_position = vec![];
        let mut observed_x = vec![];
        let mut observed_y = vec![];
        for i in 0..60_usize {
            order.push(10 + (i % 3) as i32);
            wavelength.push(500.0 + i as f64);
            slit_position.push(0.0);
            observed_x.push(10.0 + (i % 20) as f64 * 3.0);
            observed_y.push(15.0 + (i / 20) as f64 * 20.0);
        }
        let lines = DetectedLines {
            lines: LineTable {
                detector_x: observed_x.clone(),
                detector_y: observed_y.clone(),
                slit_index: vec![0; 60],
                order,
                wavelength,
                slit_position,
            },
            observed_x,
            observed_y,
        };
        let solution = fit_dispersion_polynomials(
            &lines,
            1,
            1,
            0,
            &ClipConfig {
                sigma: 5.0,
                max_iters: 2,
            },
        )
        .unwrap();

        let frame = Frame {
            data: Array2::from_shape_fn((64, 64), |(y, x)| ((x + y) % 13) as f64),
            err: Array2::zeros((64, 64)),
            mask: Array2::from_elem((64, 64), false),
            header: FrameHeader::new(),
        };

        let tmp_dir = tempfile::tempdir().unwrap();
        let path = tmp_dir.path().join("night1_DISP_MAP_RESIDUALS.png");
        plot_fit_residuals(&frame, &solution, PinholeMode::Single, &path).unwrap();
        assert!(path.exists());
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }
}
