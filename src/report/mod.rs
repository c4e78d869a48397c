// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-item results and the batch report.
//!
//! Workers record results concurrently through [`ResultAggregator`]; the
//! finished [`Report`] is ordered and immutable.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::errors::PulpError;
use crate::types::Category;

// =============================================================================
// ITEM RESULTS
// =============================================================================

/// Outcome of one upload or download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemResult {
    /// File name or URL the item was known by
    pub id: String,
    pub category: Category,
    pub success: bool,
    /// Remote href (uploads) or local path (downloads)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    /// Hex SHA-256 of the bytes moved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Stable tag from [`PulpError::kind`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ItemResult {
    pub fn succeeded(id: impl Into<String>, category: Category) -> Self {
        Self {
            id: id.into(),
            category,
            success: true,
            reference: None,
            arch: None,
            checksum: None,
            error_kind: None,
            error: None,
        }
    }

    pub fn failed(id: impl Into<String>, category: Category, err: &PulpError) -> Self {
        Self {
            success: false,
            error_kind: Some(err.kind().to_string()),
            error: Some(err.to_string()),
            ..Self::succeeded(id, category)
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_arch(mut self, arch: impl Into<String>) -> Self {
        self.arch = Some(arch.into());
        self
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }
}

/// Non-fatal failure while publishing results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultWriteWarning {
    /// What was being written (a path, or "pulp_results.json")
    pub target: String,
    pub message: String,
}

// =============================================================================
// REPORT
// =============================================================================

/// Finished batch report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    /// True when every item succeeded
    pub success: bool,
    /// Always rpms, logs, sbom, files in that order
    pub categories: IndexMap<Category, Vec<ItemResult>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<ResultWriteWarning>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results_url: Option<String>,
}

impl Report {
    pub fn category(&self, category: Category) -> &[ItemResult] {
        self.categories.get(&category).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn items(&self) -> impl Iterator<Item = &ItemResult> {
        self.categories.values().flatten()
    }

    pub fn failures(&self) -> impl Iterator<Item = &ItemResult> {
        self.items().filter(|item| !item.success)
    }

    pub fn len(&self) -> usize {
        self.categories.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add_warning(&mut self, target: impl Into<String>, message: impl Into<String>) {
        let warning = ResultWriteWarning {
            target: target.into(),
            message: message.into(),
        };
        tracing::warn!("Could not write {}: {}", warning.target, warning.message);
        self.warnings.push(warning);
    }

    /// One-line summary for terminal output.
    pub fn summary(&self) -> String {
        let parts: Vec<String> = self
            .categories
            .iter()
            .filter(|(_, items)| !items.is_empty())
            .map(|(cat, items)| {
                let ok = items.iter().filter(|i| i.success).count();
                format!("{} {}/{}", cat.as_str(), ok, items.len())
            })
            .collect();
        if parts.is_empty() {
            "no items".to_string()
        } else {
            parts.join(", ")
        }
    }
}

// =============================================================================
// AGGREGATOR
// =============================================================================

/// Collects results from concurrent workers keyed by submission sequence.
#[derive(Debug, Default)]
pub struct ResultAggregator {
    results: Mutex<BTreeMap<usize, ItemResult>>,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the result for item `seq`. Returns false (and keeps the first
    /// result) when `seq` was already recorded.
    pub fn record(&self, seq: usize, result: ItemResult) -> bool {
        let mut results = resilient_lock(&self.results);
        if results.contains_key(&seq) {
            tracing::warn!("Duplicate result for item {} ({}) ignored", seq, result.id);
            return false;
        }
        results.insert(seq, result);
        true
    }

    pub fn is_recorded(&self, seq: usize) -> bool {
        resilient_lock(&self.results).contains_key(&seq)
    }

    pub fn len(&self) -> usize {
        resilient_lock(&self.results).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build the ordered report from everything recorded so far.
    pub fn finalize(&self) -> Report {
        let results = resilient_lock(&self.results);
        let mut categories: IndexMap<Category, Vec<ItemResult>> =
            Category::ALL.iter().map(|c| (*c, Vec::new())).collect();

        // BTreeMap iteration is already in seq order.
        for result in results.values() {
            if let Some(items) = categories.get_mut(&result.category) {
                items.push(result.clone());
            }
        }

        let success = results.values().all(|r| r.success);
        Report {
            success,
            categories,
            warnings: Vec::new(),
            results_url: None,
        }
    }
}

/// Acquire a mutex, recovering the data if a worker panicked while holding it.
pub(crate) fn resilient_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "report",
                event = "LOCK_POISONED",
                "Result lock was poisoned by a panicking worker. Recovering recorded results."
            );
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn ok(id: &str, category: Category) -> ItemResult {
        ItemResult::succeeded(id, category)
    }

    #[test]
    fn test_finalize_orders_categories_and_items() {
        let agg = ResultAggregator::new();
        agg.record(3, ok("c.log", Category::Logs));
        agg.record(1, ok("b.rpm", Category::Rpms));
        agg.record(0, ok("a.rpm", Category::Rpms));
        agg.record(2, ok("sbom.json", Category::Sbom));

        let report = agg.finalize();
        let keys: Vec<Category> = report.categories.keys().copied().collect();
        assert_eq!(keys, Category::ALL.to_vec());

        let rpms: Vec<&str> = report.category(Category::Rpms).iter().map(|r| r.id.as_str()).collect();
        assert_eq!(rpms, vec!["a.rpm", "b.rpm"]);
        assert!(report.category(Category::Files).is_empty());
        assert!(report.success);
        assert_eq!(report.len(), 4);
    }

    #[test]
    fn test_single_failure_fails_report() {
        let agg = ResultAggregator::new();
        agg.record(0, ok("a.rpm", Category::Rpms));
        let err = PulpError::IntegrityMismatch {
            name: "b.log".into(),
            expected: "aa".into(),
            actual: "bb".into(),
        };
        agg.record(1, ItemResult::failed("b.log", Category::Logs, &err));

        let report = agg.finalize();
        assert!(!report.success);
        let failures: Vec<_> = report.failures().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].error_kind.as_deref(), Some("integrity_mismatch"));
    }

    #[test]
    fn test_duplicate_seq_is_ignored() {
        let agg = ResultAggregator::new();
        assert!(agg.record(0, ok("first", Category::Files)));
        assert!(!agg.record(0, ok("second", Category::Files)));
        let report = agg.finalize();
        assert_eq!(report.len(), 1);
        assert_eq!(report.category(Category::Files)[0].id, "first");
    }

    #[test]
    fn test_report_json_shape() {
        let agg = ResultAggregator::new();
        agg.record(0, ok("a.rpm", Category::Rpms).with_arch("x86_64"));
        let json = serde_json::to_value(agg.finalize()).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["categories"]["rpms"][0]["arch"], "x86_64");
        assert!(json["categories"]["files"].as_array().unwrap().is_empty());
        assert!(json.get("warnings").is_none());
    }

    #[test]
    fn test_empty_batch_is_successful() {
        let report = ResultAggregator::new().finalize();
        assert!(report.success);
        assert!(report.is_empty());
        assert_eq!(report.summary(), "no items");
    }

    #[test]
    fn test_recovers_from_poisoned_lock() {
        let agg = Arc::new(ResultAggregator::new());
        agg.record(0, ok("a.rpm", Category::Rpms));

        let clone = Arc::clone(&agg);
        let handle = thread::spawn(move || {
            let _guard = clone.results.lock().unwrap();
            panic!("intentional panic to poison lock");
        });
        let _ = handle.join();

        assert!(agg.record(1, ok("b.rpm", Category::Rpms)));
        assert_eq!(agg.finalize().len(), 2);
    }
}
