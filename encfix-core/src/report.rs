use serde::Serialize;

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnfixableCause {
    /// Every candidate in the search plan failed verification.
    SearchExhausted,
    /// Declared and embedded versions agree, yet the content does not verify.
    ContentCorrupt,
    MalformedContent { reason: String },
    /// Storage trouble unrelated to the version; the search was abandoned.
    OracleIo { reason: String },
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RepairOutcome {
    AlreadyOk,
    Fixed { final_version: u32 },
    Unfixable { restored_version: u32, cause: UnfixableCause },
    Skipped { reason: String },
}

impl RepairOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, RepairOutcome::Unfixable { .. })
    }
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ReportEntry {
    pub path: String,
    #[serde(flatten)]
    pub outcome: RepairOutcome,
}

#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReportSummary {
    pub ok: usize,
    pub fixed: usize,
    pub unfixable: usize,
    pub skipped: usize,
}

/// Per-file outcomes of one invocation, in traversal order.
#[derive(Serialize, Clone, Debug)]
pub struct RepairReport {
    pub generated_utc: String,
    entries: Vec<ReportEntry>,
    /// Filter paths that did not resolve for some user in an all-users run.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    unresolved: Vec<String>,
}

impl Default for RepairReport {
    fn default() -> Self {
        Self::new()
    }
}

impl RepairReport {
    pub fn new() -> Self {
        Self {
            generated_utc: chrono::Utc::now().to_rfc3339(),
            entries: Vec::new(),
            unresolved: Vec::new(),
        }
    }

    pub fn push(&mut self, path: impl Into<String>, outcome: RepairOutcome) {
        self.entries.push(ReportEntry { path: path.into(), outcome });
    }

    pub fn mark_unresolved(&mut self, logical_path: impl Into<String>) {
        self.unresolved.push(logical_path.into());
    }

    pub fn unresolved(&self) -> &[String] {
        &self.unresolved
    }

    pub fn entries(&self) -> &[ReportEntry] {
        &self.entries
    }

    pub fn outcome_of(&self, path: &str) -> Option<&RepairOutcome> {
        self.entries.iter().find(|e| e.path == path).map(|e| &e.outcome)
    }

    pub fn summary(&self) -> ReportSummary {
        let mut s = ReportSummary::default();
        for e in &self.entries {
            match e.outcome {
                RepairOutcome::AlreadyOk => s.ok += 1,
                RepairOutcome::Fixed { .. } => s.fixed += 1,
                RepairOutcome::Unfixable { .. } => s.unfixable += 1,
                RepairOutcome::Skipped { .. } => s.skipped += 1,
            }
        }
        s
    }

    /// True when no visited file ended unfixable and every filter resolved.
    pub fn is_success(&self) -> bool {
        self.unresolved.is_empty() && !self.entries.iter().any(|e| e.outcome.is_failure())
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        #[derive(Serialize)]
        struct Doc<'a> {
            #[serde(flatten)]
            report: &'a RepairReport,
            summary: ReportSummary,
        }
        serde_json::to_string_pretty(&Doc { report: self, summary: self.summary() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unfixable_fails_the_run() {
        let mut r = RepairReport::new();
        r.push("/u/files/a", RepairOutcome::AlreadyOk);
        r.push("/u/files/b", RepairOutcome::Skipped { reason: "gone".into() });
        assert!(r.is_success());
        r.push(
            "/u/files/c",
            RepairOutcome::Unfixable {
                restored_version: 4,
                cause: UnfixableCause::SearchExhausted,
            },
        );
        assert!(!r.is_success());
        assert_eq!(r.summary(), ReportSummary { ok: 1, fixed: 0, unfixable: 1, skipped: 1 });
    }

    #[test]
    fn unresolved_filter_fails_the_run() {
        let mut r = RepairReport::new();
        r.push("/u/files/a", RepairOutcome::AlreadyOk);
        r.mark_unresolved("/v/files/missing");
        assert!(!r.is_success());
        assert_eq!(r.unresolved(), ["/v/files/missing".to_string()]);
    }

    #[test]
    fn json_shape_is_flat_per_entry() {
        let mut r = RepairReport::new();
        r.push("/u/files/a", RepairOutcome::Fixed { final_version: 5 });
        let v: serde_json::Value = serde_json::from_str(&r.to_json_pretty().unwrap()).unwrap();
        assert_eq!(v["entries"][0]["path"], "/u/files/a");
        assert_eq!(v["entries"][0]["outcome"], "fixed");
        assert_eq!(v["entries"][0]["final_version"], 5);
        assert_eq!(v["summary"]["fixed"], 1);
    }
}
