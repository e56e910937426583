//! Backup URL failover
//!
//! A channel has a primary URL and up to three backup URLs. When the active
//! source fails, the chain advances to the next backup; the index is never
//! rewound, so an in-place reconnect keeps using the source that worked last.

/// Ordered list of candidate upstream URLs with the persisted backup index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverChain {
    primary: String,
    backups: Vec<String>,
    /// 0 = primary, n = backup n
    index: usize,
}

impl FailoverChain {
    /// Create a chain; empty backup slots are skipped and at most
    /// `max_backups` are kept
    pub fn new(primary: impl Into<String>, backups: &[String], max_backups: usize) -> Self {
        let backups = backups
            .iter()
            .map(|url| url.trim())
            .filter(|url| !url.is_empty())
            .take(max_backups)
            .map(str::to_string)
            .collect();

        Self {
            primary: primary.into(),
            backups,
            index: 0,
        }
    }

    /// URL currently in use
    pub fn current(&self) -> &str {
        match self.index {
            0 => &self.primary,
            n => &self.backups[n - 1],
        }
    }

    /// Current backup index (0 while on the primary)
    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of configured backups
    pub fn backup_count(&self) -> usize {
        self.backups.len()
    }

    /// Whether another backup remains to be tried
    pub fn has_next(&self) -> bool {
        self.index < self.backups.len()
    }

    /// Switch to the next backup
    ///
    /// Returns the new index and URL, or `None` once all backups are used up.
    pub fn advance(&mut self) -> Option<(usize, &str)> {
        if !self.has_next() {
            return None;
        }
        self.index += 1;
        Some((self.index, self.current()))
    }
}
