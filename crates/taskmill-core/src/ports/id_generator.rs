//! IdGenerator port - task id generation.

use crate::domain::TaskId;
use crate::ports::Clock;
use ulid::Ulid;

/// Generates ids for tasks submitted without one.
pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;
}

/// ULID based generator.
///
/// The timestamp part comes from the clock, so a `FixedClock` yields ids with a
/// deterministic time component.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_task_id(&self) -> TaskId {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        let ulid = Ulid::from_parts(timestamp_ms, rand::random());
        TaskId::from_ulid(ulid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ids::TASK_ID_PREFIX;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn ulid_generator_generates_unique_ids() {
        let id_gen = UlidGenerator::new(SystemClock);

        let id1 = id_gen.generate_task_id();
        let id2 = id_gen.generate_task_id();

        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with(TASK_ID_PREFIX));
    }

    #[test]
    fn ulid_generator_with_fixed_clock_shares_timestamp() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(FixedClock::new(fixed_time));

        let id1 = id_gen.generate_task_id();
        let id2 = id_gen.generate_task_id();
        assert_ne!(id1, id2);

        let parse = |id: &TaskId| {
            Ulid::from_string(&id.as_str()[TASK_ID_PREFIX.len()..])
                .unwrap()
                .timestamp_ms()
        };
        assert_eq!(parse(&id1), fixed_time.timestamp_millis() as u64);
        assert_eq!(parse(&id1), parse(&id2));
    }
}
