use std::time::Duration;

use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct SnmConfig {
    /// Cadence at which a workspace with `sync` enabled re-applies
    /// inheritance from its parent.
    /// Env: SNM_SYNC_INTERVAL_SECS
    #[envconfig(from = "SNM_SYNC_INTERVAL_SECS", default = "30")]
    pub sync_interval_secs: u64,

    /// Fixed delay before retrying after a quota shortage.
    /// Env: SNM_SHORTAGE_RETRY_SECS
    #[envconfig(from = "SNM_SHORTAGE_RETRY_SECS", default = "60")]
    pub shortage_retry_secs: u64,

    /// Delay applied when a transient API error forces a requeue.
    /// Env: SNM_ERROR_RETRY_SECS
    #[envconfig(from = "SNM_ERROR_RETRY_SECS", default = "60")]
    pub error_retry_secs: u64,

    /// Delay before re-running a reconcile that regressed to the
    /// in-progress marker (partial inheritance failure).
    /// Env: SNM_RECONCILIATION_RETRY_SECS
    #[envconfig(from = "SNM_RECONCILIATION_RETRY_SECS", default = "15")]
    pub reconciliation_retry_secs: u64,

    /// Cadence at which an established object without `sync` is
    /// re-validated; the only kind the controller watches is its own,
    /// so drift in collaborator objects surfaces on this schedule.
    /// Env: SNM_REVALIDATE_INTERVAL_SECS
    #[envconfig(from = "SNM_REVALIDATE_INTERVAL_SECS", default = "300")]
    pub revalidate_interval_secs: u64,
}

impl SnmConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn shortage_retry(&self) -> Duration {
        Duration::from_secs(self.shortage_retry_secs)
    }

    pub fn error_retry(&self) -> Duration {
        Duration::from_secs(self.error_retry_secs)
    }

    pub fn reconciliation_retry(&self) -> Duration {
        Duration::from_secs(self.reconciliation_retry_secs)
    }

    pub fn revalidate_interval(&self) -> Duration {
        Duration::from_secs(self.revalidate_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_reflect_fields() {
        let cfg = SnmConfig {
            sync_interval_secs: 30,
            shortage_retry_secs: 60,
            error_retry_secs: 60,
            reconciliation_retry_secs: 15,
            revalidate_interval_secs: 300,
        };
        assert_eq!(cfg.sync_interval(), Duration::from_secs(30));
        assert_eq!(cfg.shortage_retry(), Duration::from_secs(60));
        assert_eq!(cfg.error_retry(), Duration::from_secs(60));
        assert_eq!(cfg.reconciliation_retry(), Duration::from_secs(15));
        assert_eq!(cfg.revalidate_interval(), Duration::from_secs(300));
    }
}
