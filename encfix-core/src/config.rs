use crate::path_safety::PathPolicy;

/// Bounds on the candidate search for one file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SearchLimits {
    /// Upper bound on candidates tried per file, across both directions.
    pub max_candidates: u32,
}

impl Default for SearchLimits {
    fn default() -> Self {
        Self { max_candidates: 4096 }
    }
}

/// Everything a repair run needs besides its collaborators.
#[derive(Clone, Debug)]
pub struct RepairConfig {
    pub path_policy: PathPolicy,
    pub limits: SearchLimits,
    /// Periodic progress lines on stderr.
    pub progress: bool,
    pub locale: String,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            path_policy: PathPolicy::default(),
            limits: SearchLimits::default(),
            progress: false,
            locale: "en-GB".to_string(),
        }
    }
}
