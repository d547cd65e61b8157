// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Dispatching per-order raster work across worker threads.
//!
//! Each order is an independent work unit: a pure function of the order
//! range, the (shared, immutable) dispersion map and the config. Workers
//! send their results back tagged with the order index and the driver
//! reassembles them in ascending order, so the output is bitwise identical
//! however the workers are scheduled. A worker that exceeds the wall-clock
//! deadline, or dies, aborts the whole run; there is no partial recovery.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, RecvTimeoutError};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};

use super::{rasterise_order, OrderRaster, RasterConfig, RasterError, RasterGeometry, RasterMaps};
use crate::context::{OrderRange, PinholeMode};
use crate::poly::PolyError;
use crate::solutions::DispersionMap;

/// Rasterise every order of a multi-pinhole dispersion map in parallel and
/// assemble the detector-sized inverse images.
pub fn build_raster_maps(
    map: &DispersionMap,
    orders: &[OrderRange],
    geom: &RasterGeometry,
    config: &RasterConfig,
    timeout: Duration,
) -> Result<RasterMaps, RasterError> {
    // A single-pinhole map carries no slit information; inverting it into a
    // slit image would be meaningless.
    if map.pinhole_mode() == PinholeMode::Single {
        return Err(RasterError::SinglePinholeMap);
    }
    if orders.is_empty() {
        return Ok(RasterMaps::assemble(vec![], geom.width, geom.height));
    }

    info!(
        "Rasterising {} orders across worker threads (timeout {} s/order)",
        orders.len(),
        timeout.as_secs()
    );
    let bar = ProgressBar::new(orders.len() as u64).with_style(
        ProgressStyle::with_template(
            "{msg:17}: [{wide_bar:.blue}] {pos:2}/{len:2} orders ({elapsed_precise})",
        )
        .unwrap()
        .progress_chars("=> "),
    );
    bar.set_message("Rasterising");

    // Workers share the map, geometry and config read-only; each owns its
    // order's grids outright.
    let map = Arc::new(map.clone());
    let geom = Arc::new(geom.clone());
    let config = Arc::new(config.clone());
    let (tx, rx) = unbounded::<(usize, Result<OrderRaster, PolyError>)>();

    for (index, &range) in orders.iter().enumerate() {
        let map = Arc::clone(&map);
        let geom = Arc::clone(&geom);
        let config = Arc::clone(&config);
        let tx = tx.clone();
        thread::spawn(move || {
            debug!("worker starting order {}", range.order);
            let result = rasterise_order(range, &map, &geom, &config);
            // A send failure means the driver already gave up (timeout);
            // nothing useful left to do in that case.
            let _ = tx.send((index, result));
        });
    }
    drop(tx);

    // Workers all start together, so one deadline bounds the slowest unit.
    let deadline = Instant::now() + timeout;
    let mut results: Vec<Option<OrderRaster>> = (0..orders.len()).map(|_| None).collect();
    let mut received = 0_usize;
    while received < orders.len() {
        match rx.recv_deadline(deadline) {
            Ok((index, Ok(order_raster))) => {
                results[index] = Some(order_raster);
                received += 1;
                bar.inc(1);
            }
            Ok((_, Err(e))) => {
                bar.abandon();
                return Err(RasterError::Poly(e));
            }
            Err(RecvTimeoutError::Timeout) => {
                bar.abandon();
                let order = first_missing(&results, orders);
                return Err(RasterError::OrderTimeout {
                    order,
                    timeout_secs: timeout.as_secs(),
                });
            }
            Err(RecvTimeoutError::Disconnected) => {
                bar.abandon();
                let order = first_missing(&results, orders);
                return Err(RasterError::WorkerFailure { order });
            }
        }
    }
    bar.finish_with_message("Rasterising done");

    let results: Vec<OrderRaster> = results.into_iter().flatten().collect();
    let maps = RasterMaps::assemble(results, geom.width, geom.height);
    info!(
        "Raster maps assembled: {} pixels constrained",
        maps.assigned_count()
    );
    Ok(maps)
}

fn first_missing(results: &[Option<OrderRaster>], orders: &[OrderRange]) -> i32 {
    results
        .iter()
        .position(|r| r.is_none())
        .map(|i| orders[i].order)
        .unwrap_or_else(|| orders[0].order)
}
