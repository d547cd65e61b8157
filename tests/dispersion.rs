// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! End-to-end dispersion-solution runs on synthetic pinhole frames.

use std::path::Path;

use fitsio::images::{ImageDescription, ImageType};
use fitsio::tables::{ColumnDataType, ColumnDescription};
use fitsio::FitsFile;
use ndarray::Array2;

use dispersol::poly::{ChebyBasis, Domain, SpectralRows};
use dispersol::{
    solve_dispersion, DetectorProfile, DispersionMap, Frame, PinholeMode, QcValue, RecipeConfig,
    SolveRequest,
};

const DETECTOR: usize = 160;

/// The synthetic instrument truth: x tracks wavelength, y tracks order and
/// slit position.
fn truth_map() -> DispersionMap {
    let basis = ChebyBasis {
        order_deg: 1,
        wavelength_deg: 1,
        slit_deg: 1,
        order_domain: Domain {
            min: 10.0,
            max: 12.0,
        },
        wavelength_domain: Domain {
            min: 500.0,
            max: 560.0,
        },
        slit_domain: Domain {
            min: -2.0,
            max: 2.0,
        },
    };
    // Coefficient order for degrees (1, 1, 1):
    // c000 c001 c010 c011 c100 c101 c110 c111.
    DispersionMap {
        xcoeffs: vec![80.0, 0.0, 50.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        ycoeffs: vec![80.0, 20.0, 0.0, 0.0, 45.0, 0.0, 0.0, 0.0],
        basis,
    }
}

/// Catalogue rows: 3 orders x 6 wavelengths x 3 slit positions.
struct SyntheticLines {
    order: Vec<i32>,
    wavelength: Vec<f64>,
    slit_index: Vec<i32>,
    slit_position: Vec<f64>,
    truth_x: Vec<f64>,
    truth_y: Vec<f64>,
}

fn synthetic_lines() -> SyntheticLines {
    let mut order = vec![];
    let mut wavelength = vec![];
    let mut slit_index = vec![];
    let mut slit_position = vec![];
    for m in 10..=12_i32 {
        for w in 0..6 {
            for k in 0..3_i32 {
                order.push(m);
                wavelength.push(505.0 + f64::from(w) * 10.0);
                slit_index.push(k);
                slit_position.push(f64::from(k) * 2.0 - 2.0);
            }
        }
    }
    let rows = SpectralRows::new(&order, &wavelength, &slit_position).unwrap();
    let (truth_x, truth_y) = truth_map().evaluate(&rows).unwrap();
    SyntheticLines {
        order,
        wavelength,
        slit_index,
        slit_position,
        truth_x,
        truth_y,
    }
}

/// Write the predicted-line catalogue with the given detector guesses.
fn write_catalogue(path: &Path, lines: &SyntheticLines, guess_x: &[f64], guess_y: &[f64]) {
    let mut fits = FitsFile::create(path).open().unwrap();
    let descriptions = vec![
        ColumnDescription::new("order")
            .with_type(ColumnDataType::Int)
            .create()
            .unwrap(),
        ColumnDescription::new("wavelength")
            .with_type(ColumnDataType::Double)
            .create()
            .unwrap(),
        ColumnDescription::new("slit_index")
            .with_type(ColumnDataType::Int)
            .create()
            .unwrap(),
        ColumnDescription::new("slit_position")
            .with_type(ColumnDataType::Double)
            .create()
            .unwrap(),
        ColumnDescription::new("detector_x")
            .with_type(ColumnDataType::Double)
            .create()
            .unwrap(),
        ColumnDescription::new("detector_y")
            .with_type(ColumnDataType::Double)
            .create()
            .unwrap(),
    ];
    let hdu = fits.create_table("LINES", &descriptions).unwrap();
    hdu.write_col(&mut fits, "order", &lines.order).unwrap();
    hdu.write_col(&mut fits, "wavelength", &lines.wavelength)
        .unwrap();
    hdu.write_col(&mut fits, "slit_index", &lines.slit_index)
        .unwrap();
    hdu.write_col(&mut fits, "slit_position", &lines.slit_position)
        .unwrap();
    hdu.write_col(&mut fits, "detector_x", guess_x).unwrap();
    hdu.write_col(&mut fits, "detector_y", guess_y).unwrap();
}

/// Write the spectral-format table for the three synthetic orders.
fn write_spectral_format(path: &Path) {
    let mut fits = FitsFile::create(path).open().unwrap();
    let descriptions = vec![
        ColumnDescription::new("ORDER")
            .with_type(ColumnDataType::Int)
            .create()
            .unwrap(),
        ColumnDescription::new("WLMIN")
            .with_type(ColumnDataType::Double)
            .create()
            .unwrap(),
        ColumnDescription::new("WLMAX")
            .with_type(ColumnDataType::Double)
            .create()
            .unwrap(),
    ];
    let hdu = fits.create_table("SPECTRAL_FORMAT", &descriptions).unwrap();
    hdu.write_col(&mut fits, "ORDER", &[10_i32, 11, 12]).unwrap();
    hdu.write_col(&mut fits, "WLMIN", &[505.0, 505.0, 505.0])
        .unwrap();
    hdu.write_col(&mut fits, "WLMAX", &[555.0, 555.0, 555.0])
        .unwrap();
}

/// Write a pinhole frame with Gaussian spots at the given positions.
fn write_frame(path: &Path, technique: &str, spots: &[(f64, f64)]) {
    let mut data = Array2::from_shape_fn((DETECTOR, DETECTOR), |(y, x)| {
        10.0 + 0.5 * ((x * 7 + y * 13) % 11) as f64 / 11.0
    });
    for &(sx, sy) in spots {
        for y in 0..DETECTOR {
            for x in 0..DETECTOR {
                let dx = x as f64 - sx;
                let dy = y as f64 - sy;
                data[[y, x]] += 300.0 * (-(dx * dx + dy * dy) / (2.0 * 0.85 * 0.85)).exp();
            }
        }
    }

    let description = ImageDescription {
        data_type: ImageType::Double,
        dimensions: &[DETECTOR, DETECTOR],
    };
    let mut fits = FitsFile::create(path)
        .with_custom_primary(&description)
        .open()
        .unwrap();
    let hdu = fits.primary_hdu().unwrap();
    let flat: Vec<f64> = data.iter().copied().collect();
    hdu.write_image(&mut fits, &flat).unwrap();
    hdu.write_key(&mut fits, "INSTRUME", "SOXS").unwrap();
    hdu.write_key(&mut fits, "DATE-OBS", "2021-03-12T04:55:10")
        .unwrap();
    hdu.write_key(&mut fits, "ESO SEQ ARM", "UVB").unwrap();
    hdu.write_key(&mut fits, "ESO DPR TECH", technique).unwrap();
    hdu.write_key(&mut fits, "ESO DPR CATG", "CALIB").unwrap();
    hdu.write_key(&mut fits, "ESO DPR TYPE", "LAMP,WAVE").unwrap();
}

fn profile(dir: &Path, catalogue: &Path) -> DetectorProfile {
    let format_path = dir.join("spectral_format.fits");
    write_spectral_format(&format_path);

    serde_yaml::from_str::<DetectorProfile>(&format!(
        "\
arm: UVB
science_pixels:
  rows: {{start: 0, end: {DETECTOR}}}
  columns: {{start: 0, end: {DETECTOR}}}
slit_length: 4.0
mid_slit_index: 1
dispersion_axis: x
predicted_lines:
  single:
    1x1: {}
  multi:
    1x1: {}
spectral_format: {}
",
        catalogue.display(),
        catalogue.display(),
        format_path.display()
    ))
    .unwrap()
}

fn config() -> RecipeConfig {
    RecipeConfig {
        order_deg: 1,
        wavelength_deg: 1,
        slit_deg: 1,
        pixel_window_size: 15,
        ..Default::default()
    }
}

/// Spots of a single-pinhole exposure: only the mid-slit trace.
fn single_spots(lines: &SyntheticLines) -> Vec<(f64, f64)> {
    lines
        .slit_index
        .iter()
        .zip(lines.truth_x.iter().zip(lines.truth_y.iter()))
        .filter(|(&k, _)| k == 1)
        .map(|(_, (&x, &y))| (x, y))
        .collect()
}

#[test]
fn single_pinhole_run_produces_a_map() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let dir = tmp_dir.path();

    let lines = synthetic_lines();
    let catalogue_path = dir.join("catalogue.fits");
    write_catalogue(&catalogue_path, &lines, &lines.truth_x, &lines.truth_y);
    let frame_path = dir.join("frame.fits");
    write_frame(&frame_path, "ECHELLE,PINHOLE", &single_spots(&lines));

    let frame = Frame::from_fits(&frame_path).unwrap();
    let profile = profile(dir, &catalogue_path);
    let config = config();
    let products = solve_dispersion(&SolveRequest {
        frame: &frame,
        profile: &profile,
        config: &config,
        prior_map_path: None,
        output_dir: dir,
        prefix: "night1",
    })
    .unwrap();

    assert!(products.map_path.ends_with("night1_DISP_MAP.fits"));
    assert!(products.map_path.exists());
    assert!(products.raster_path.is_none());
    assert_eq!(products.map.pinhole_mode(), PinholeMode::Single);
    assert!(products.stats.xy_std < 0.3);

    // 18 mid-slit lines were on offer.
    let nline = products.qc.iter().find(|r| r.name == "NLINE").unwrap();
    assert_eq!(nline.value, QcValue::Int(18));

    // The written map reads back identical.
    let read_back = dispersol::read_map(&products.map_path).unwrap();
    assert_eq!(read_back.xcoeffs, products.map.xcoeffs);
    assert_eq!(read_back.basis.slit_deg, 0);
}

#[test]
fn multi_pinhole_run_with_prior_builds_rasters() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let dir = tmp_dir.path();

    let lines = synthetic_lines();
    let catalogue_path = dir.join("catalogue.fits");
    write_catalogue(&catalogue_path, &lines, &lines.truth_x, &lines.truth_y);
    let profile = profile(dir, &catalogue_path);
    let config = config();

    // First the single-pinhole run that supplies the prior.
    let single_frame_path = dir.join("single.fits");
    write_frame(&single_frame_path, "ECHELLE,PINHOLE", &single_spots(&lines));
    let single_frame = Frame::from_fits(&single_frame_path).unwrap();
    let prior = solve_dispersion(&SolveRequest {
        frame: &single_frame,
        profile: &profile,
        config: &config,
        prior_map_path: None,
        output_dir: dir,
        prefix: "night1",
    })
    .unwrap();

    // The multi frame: every pinhole of every line.
    let spots: Vec<(f64, f64)> = lines
        .truth_x
        .iter()
        .zip(lines.truth_y.iter())
        .map(|(&x, &y)| (x, y))
        .collect();
    let multi_frame_path = dir.join("multi.fits");
    write_frame(&multi_frame_path, "ECHELLE,MULTI-PINHOLE", &spots);
    let multi_frame = Frame::from_fits(&multi_frame_path).unwrap();

    let products = solve_dispersion(&SolveRequest {
        frame: &multi_frame,
        profile: &profile,
        config: &config,
        prior_map_path: Some(&prior.map_path),
        output_dir: dir,
        prefix: "night1",
    })
    .unwrap();

    assert!(products.map_path.ends_with("night1_2D_MAP.fits"));
    assert_eq!(products.map.pinhole_mode(), PinholeMode::Multi);
    let raster_path = products.raster_path.as_ref().unwrap();
    assert!(raster_path.ends_with("night1_MAP_IMAGE.fits"));
    assert!(raster_path.exists());

    // The fitted map agrees with the truth across the catalogue.
    let rows = SpectralRows::new(&lines.order, &lines.wavelength, &lines.slit_position)
        .unwrap();
    let (fit_x, fit_y) = products.map.evaluate(&rows).unwrap();
    for i in 0..lines.order.len() {
        assert!((fit_x[i] - lines.truth_x[i]).abs() < 0.5);
        assert!((fit_y[i] - lines.truth_y[i]).abs() < 0.5);
    }

    // Raster NaN support is consistent across the three planes and the
    // assigned pixels invert the fitted map.
    let mut fits = FitsFile::open(raster_path).unwrap();
    let wavelength: Vec<f64> = fits.primary_hdu().unwrap().read_image(&mut fits).unwrap();
    let slit: Vec<f64> = fits.hdu("SLIT").unwrap().read_image(&mut fits).unwrap();
    let order: Vec<f64> = fits.hdu("ORDER").unwrap().read_image(&mut fits).unwrap();
    let assigned = wavelength.iter().filter(|w| w.is_finite()).count();
    assert!(assigned > 500, "only {assigned} raster pixels assigned");
    for i in 0..wavelength.len() {
        assert_eq!(wavelength[i].is_nan(), slit[i].is_nan());
        assert_eq!(wavelength[i].is_nan(), order[i].is_nan());
    }
    let threshold = config.displacement_threshold;
    for i in (0..wavelength.len()).step_by(97) {
        if wavelength[i].is_nan() {
            continue;
        }
        let (py, px) = (i / DETECTOR, i % DETECTOR);
        let orders = vec![order[i] as i32];
        let wl = vec![wavelength[i]];
        let sl = vec![slit[i]];
        let rows = SpectralRows::new(&orders, &wl, &sl).unwrap();
        let (fx, fy) = products.map.evaluate(&rows).unwrap();
        let displacement =
            (fx[0] - (px as f64 + 0.5)).hypot(fy[0] - (py as f64 + 0.5));
        assert!(
            displacement <= threshold + 1e-9,
            "pixel ({px}, {py}): displacement {displacement}"
        );
    }
}

#[test]
fn shifted_catalogue_with_prior_matches_unshifted_baseline() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let dir = tmp_dir.path();

    let lines = synthetic_lines();
    let config = config();

    // Baseline: guesses sit exactly on the truth.
    let baseline_catalogue = dir.join("catalogue_baseline.fits");
    write_catalogue(&baseline_catalogue, &lines, &lines.truth_x, &lines.truth_y);
    let baseline_profile = profile(dir, &baseline_catalogue);

    let multi_frame_path = dir.join("multi.fits");
    let spots: Vec<(f64, f64)> = lines
        .truth_x
        .iter()
        .zip(lines.truth_y.iter())
        .map(|(&x, &y)| (x, y))
        .collect();
    write_frame(&multi_frame_path, "ECHELLE,MULTI-PINHOLE", &spots);
    let multi_frame = Frame::from_fits(&multi_frame_path).unwrap();

    let baseline = solve_dispersion(&SolveRequest {
        frame: &multi_frame,
        profile: &baseline_profile,
        config: &config,
        prior_map_path: None,
        output_dir: dir,
        prefix: "baseline",
    })
    .unwrap();

    // The prior comes from a single-pinhole run against the same truth.
    let single_frame_path = dir.join("single.fits");
    write_frame(&single_frame_path, "ECHELLE,PINHOLE", &single_spots(&lines));
    let single_frame = Frame::from_fits(&single_frame_path).unwrap();
    let prior = solve_dispersion(&SolveRequest {
        frame: &single_frame,
        profile: &baseline_profile,
        config: &config,
        prior_map_path: None,
        output_dir: dir,
        prefix: "prior",
    })
    .unwrap();

    // Offset every catalogue guess by +3.7 px in x; the shift estimator has
    // to absorb it.
    let shifted_x: Vec<f64> = lines.truth_x.iter().map(|x| x + 3.7).collect();
    let shifted_catalogue = dir.join("catalogue_shifted.fits");
    write_catalogue(&shifted_catalogue, &lines, &shifted_x, &lines.truth_y);
    let shifted_profile = profile(dir, &shifted_catalogue);

    let shifted = solve_dispersion(&SolveRequest {
        frame: &multi_frame,
        profile: &shifted_profile,
        config: &config,
        prior_map_path: Some(&prior.map_path),
        output_dir: dir,
        prefix: "shifted",
    })
    .unwrap();

    for (a, b) in baseline
        .map
        .xcoeffs
        .iter()
        .zip(shifted.map.xcoeffs.iter())
    {
        assert!((a - b).abs() < 1e-6, "x coefficients diverge: {a} vs {b}");
    }
    for (a, b) in baseline
        .map
        .ycoeffs
        .iter()
        .zip(shifted.map.ycoeffs.iter())
    {
        assert!((a - b).abs() < 1e-6, "y coefficients diverge: {a} vs {b}");
    }
}

#[test]
fn blank_frame_raises_no_detections() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let dir = tmp_dir.path();

    let lines = synthetic_lines();
    let catalogue_path = dir.join("catalogue.fits");
    write_catalogue(&catalogue_path, &lines, &lines.truth_x, &lines.truth_y);
    let frame_path = dir.join("blank.fits");
    write_frame(&frame_path, "ECHELLE,PINHOLE", &[]);

    let frame = Frame::from_fits(&frame_path).unwrap();
    let profile = profile(dir, &catalogue_path);
    let config = config();
    match solve_dispersion(&SolveRequest {
        frame: &frame,
        profile: &profile,
        config: &config,
        prior_map_path: None,
        output_dir: dir,
        prefix: "blank",
    }) {
        Err(dispersol::DispersolError::NoDetections(_)) => (),
        other => panic!("expected NoDetections, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn wrong_technique_is_invalid_input() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let dir = tmp_dir.path();

    let lines = synthetic_lines();
    let catalogue_path = dir.join("catalogue.fits");
    write_catalogue(&catalogue_path, &lines, &lines.truth_x, &lines.truth_y);
    let frame_path = dir.join("image.fits");
    write_frame(&frame_path, "IMAGE", &[]);

    let frame = Frame::from_fits(&frame_path).unwrap();
    let profile = profile(dir, &catalogue_path);
    let config = config();
    match solve_dispersion(&SolveRequest {
        frame: &frame,
        profile: &profile,
        config: &config,
        prior_map_path: None,
        output_dir: dir,
        prefix: "bad",
    }) {
        Err(dispersol::DispersolError::InvalidInput(_)) => (),
        other => panic!("expected InvalidInput, got {:?}", other.map(|_| ())),
    }
}
