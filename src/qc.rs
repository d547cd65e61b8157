// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Quality-control and product bookkeeping.
//!
//! QC records accumulate in an append-only sink in source-code order; the
//! caller owns the sink and decides what to do with it after the run.
//! Records flagged `to_header` additionally land in product headers as
//! `ESO QC <NAME>` keys.

use std::fmt;
use std::path::PathBuf;

use chrono::Utc;

use crate::context::HeaderValue;

/// A measured QC value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QcValue {
    Int(i64),
    Float(f64),
}

impl QcValue {
    pub(crate) fn to_header_value(self) -> HeaderValue {
        match self {
            QcValue::Int(i) => HeaderValue::Int(i),
            QcValue::Float(f) => HeaderValue::Float(f),
        }
    }
}

impl fmt::Display for QcValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            QcValue::Int(i) => write!(f, "{i}"),
            QcValue::Float(v) => write!(f, "{v:.6}"),
        }
    }
}

/// One measured quality metric.
#[derive(Debug, Clone)]
pub struct QcRecord {
    pub recipe: String,
    pub name: String,
    pub value: QcValue,
    pub unit: Option<String>,
    pub comment: String,
    pub obs_date_utc: String,
    pub reduction_date_utc: String,
    /// Propagate this metric into product headers.
    pub to_header: bool,
}

/// One written product artefact.
#[derive(Debug, Clone)]
pub struct ProductRecord {
    pub recipe: String,
    pub label: String,
    pub file_name: String,
    pub file_type: String,
    pub description: String,
    pub file_path: PathBuf,
    pub obs_date_utc: String,
    pub reduction_date_utc: String,
}

/// An append-only QC record stream for one recipe invocation.
#[derive(Debug, Clone)]
pub struct QcSink {
    recipe: String,
    obs_date_utc: String,
    records: Vec<QcRecord>,
    products: Vec<ProductRecord>,
}

impl QcSink {
    pub fn new(recipe: &str, obs_date_utc: &str) -> QcSink {
        QcSink {
            recipe: recipe.to_string(),
            obs_date_utc: obs_date_utc.to_string(),
            records: vec![],
            products: vec![],
        }
    }

    fn utc_now() -> String {
        Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string()
    }

    /// Append a metric.
    pub fn push(
        &mut self,
        name: &str,
        value: QcValue,
        unit: Option<&str>,
        comment: &str,
        to_header: bool,
    ) {
        self.records.push(QcRecord {
            recipe: self.recipe.clone(),
            name: name.to_string(),
            value,
            unit: unit.map(|u| u.to_string()),
            comment: comment.to_string(),
            obs_date_utc: self.obs_date_utc.clone(),
            reduction_date_utc: Self::utc_now(),
            to_header,
        });
    }

    /// Append a product artefact record.
    pub fn push_product(&mut self, label: &str, file_path: PathBuf, file_type: &str, desc: &str) {
        let file_name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.products.push(ProductRecord {
            recipe: self.recipe.clone(),
            label: label.to_string(),
            file_name,
            file_type: file_type.to_string(),
            description: desc.to_string(),
            file_path,
            obs_date_utc: self.obs_date_utc.clone(),
            reduction_date_utc: Self::utc_now(),
        });
    }

    pub fn records(&self) -> &[QcRecord] {
        &self.records
    }

    pub fn products(&self) -> &[ProductRecord] {
        &self.products
    }

    /// Consume the sink, returning the accumulated records and products.
    pub fn into_parts(self) -> (Vec<QcRecord>, Vec<ProductRecord>) {
        (self.records, self.products)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_keep_insertion_order() {
        let mut sink = QcSink::new("disp-solution", "2021-03-12T04:55:10");
        sink.push("NLINE", QcValue::Int(940), Some("lines"), "lines found", true);
        sink.push("PLINE", QcValue::Float(0.94), None, "fraction found", true);
        sink.push("XRESMIN", QcValue::Float(0.001), Some("pixels"), "min |rx|", false);

        let names: Vec<&str> = sink.records().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["NLINE", "PLINE", "XRESMIN"]);
        assert!(sink.records()[0].to_header);
        assert!(!sink.records()[2].to_header);
        assert_eq!(sink.records()[1].obs_date_utc, "2021-03-12T04:55:10");
    }

    #[test]
    fn product_records_carry_file_names() {
        let mut sink = QcSink::new("disp-solution", "2021-03-12T04:55:10");
        sink.push_product(
            "DISP_MAP",
            PathBuf::from("/out/night1_DISP_MAP.fits"),
            "FITS",
            "UVB dispersion map",
        );
        assert_eq!(sink.products().len(), 1);
        assert_eq!(sink.products()[0].file_name, "night1_DISP_MAP.fits");
    }

    #[test]
    fn qc_values_format_for_reports() {
        assert_eq!(QcValue::Int(12).to_string(), "12");
        assert_eq!(QcValue::Float(0.25).to_string(), "0.250000");
    }
}
