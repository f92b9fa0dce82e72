use uuid::Uuid;

/// Consecutive rate-limit responses tolerated before the enrichment
/// circuit breaker opens for the remainder of the run.
pub const PHONE_FAILURE_LIMIT: u32 = 3;

/// Run-scoped mutable state threaded through one scan cycle. Created
/// fresh at cycle start, so every counter resets at a well-defined
/// lifecycle point instead of living in ambient globals.
#[derive(Debug)]
pub struct CycleContext {
    pub run_id: Uuid,
    phone_failures: u32,
}

impl CycleContext {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            phone_failures: 0,
        }
    }

    pub fn breaker_open(&self) -> bool {
        self.phone_failures >= PHONE_FAILURE_LIMIT
    }

    pub fn record_rate_limit(&mut self) {
        self.phone_failures += 1;
    }

    /// A successful lookup closes the streak.
    pub fn reset_phone_failures(&mut self) {
        self.phone_failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_opens_at_the_limit_and_success_closes_it() {
        let mut ctx = CycleContext::new(Uuid::new_v4());
        assert!(!ctx.breaker_open());

        for _ in 0..PHONE_FAILURE_LIMIT {
            ctx.record_rate_limit();
        }
        assert!(ctx.breaker_open());

        ctx.reset_phone_failures();
        assert!(!ctx.breaker_open());
    }
}
