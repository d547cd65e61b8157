// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};

use fitsio::tables::{ColumnDataType, ColumnDescription};
use fitsio::FitsFile;

use super::*;

/// Write a small catalogue: 3 orders x 4 wavelengths x 12 slit positions,
/// with mixed-case column names as found in the wild.
fn write_catalogue(dir: &Path) -> PathBuf {
    let path = dir.join("predicted_lines.fits");
    let mut fits = FitsFile::create(&path).open().unwrap();

    let mut orders = vec![];
    let mut wavelengths = vec![];
    let mut slit_indexes = vec![];
    let mut slit_positions = vec![];
    let mut xs = vec![];
    let mut ys = vec![];
    for order in 10..13_i32 {
        for w in 0..4 {
            for k in 0..12_i32 {
                orders.push(order);
                wavelengths.push(500.0 + f64::from(order) * 30.0 + f64::from(w) * 5.0);
                slit_indexes.push(k);
                slit_positions.push(f64::from(k) - 5.5);
                xs.push(100.0 + f64::from(w) * 10.0);
                ys.push(200.0 + f64::from(order) * 50.0 + f64::from(k));
            }
        }
    }

    let descriptions = vec![
        ColumnDescription::new("Order")
            .with_type(ColumnDataType::Int)
            .create()
            .unwrap(),
        ColumnDescription::new("Wavelength")
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
    hdu.write_col(&mut fits, "Order", &orders).unwrap();
    hdu.write_col(&mut fits, "Wavelength", &wavelengths).unwrap();
    hdu.write_col(&mut fits, "slit_index", &slit_indexes).unwrap();
    hdu.write_col(&mut fits, "slit_position", &slit_positions)
        .unwrap();
    hdu.write_col(&mut fits, "detector_x", &xs).unwrap();
    hdu.write_col(&mut fits, "detector_y", &ys).unwrap();
    path
}

#[test]
fn multi_mode_keeps_every_row() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let path = write_catalogue(tmp_dir.path());

    let table = read_predicted_lines(&path, PinholeMode::Multi, 5).unwrap();
    assert_eq!(table.len(), 3 * 4 * 12);
    // Column lengths always agree.
    assert_eq!(table.wavelength.len(), table.len());
    assert_eq!(table.detector_y.len(), table.len());
}

#[test]
fn single_mode_keeps_only_mid_slit_rows() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let path = write_catalogue(tmp_dir.path());

    let table = read_predicted_lines(&path, PinholeMode::Single, 5).unwrap();
    assert_eq!(table.len(), 3 * 4);
    assert!(table.slit_index.iter().all(|&k| k == 5));
    // The mid pinhole sits just off slit centre in this catalogue.
    assert!(table.slit_position.iter().all(|&s| (s + 0.5).abs() < 1e-12));
}

#[test]
fn missing_mid_slit_rows_is_an_error() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let path = write_catalogue(tmp_dir.path());

    match read_predicted_lines(&path, PinholeMode::Single, 99) {
        Err(CatalogueError::NoMidSlitLines {
            mid_slit_index: 99, ..
        }) => (),
        other => panic!("expected NoMidSlitLines, got {:?}", other),
    }
}

#[test]
fn missing_column_is_reported_by_name() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let path = tmp_dir.path().join("bad.fits");
    {
        let mut fits = FitsFile::create(&path).open().unwrap();
        let descriptions = vec![ColumnDescription::new("order")
            .with_type(ColumnDataType::Int)
            .create()
            .unwrap()];
        let hdu = fits.create_table("LINES", &descriptions).unwrap();
        hdu.write_col(&mut fits, "order", &[10_i32, 11]).unwrap();
    }

    match read_predicted_lines(&path, PinholeMode::Multi, 5) {
        Err(CatalogueError::MissingColumn { column, .. }) => {
            assert_eq!(column, "wavelength");
        }
        other => panic!("expected MissingColumn, got {:?}", other),
    }
}

#[test]
fn retain_filters_all_columns_in_step() {
    let mut table = LineTable {
        order: vec![1, 2, 3, 4],
        wavelength: vec![10.0, 20.0, 30.0, 40.0],
        slit_index: vec![0, 1, 2, 3],
        slit_position: vec![0.1, 0.2, 0.3, 0.4],
        detector_x: vec![1.0, 2.0, 3.0, 4.0],
        detector_y: vec![5.0, 6.0, 7.0, 8.0],
    };
    table.retain(&[true, false, true, false]);
    assert_eq!(table.order, vec![1, 3]);
    assert_eq!(table.wavelength, vec![10.0, 30.0]);
    assert_eq!(table.slit_index, vec![0, 2]);
    assert_eq!(table.detector_y, vec![5.0, 7.0]);
}
