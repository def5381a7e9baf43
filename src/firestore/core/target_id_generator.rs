/// Hands out target ids from one of two disjoint sequences: even ids for
/// targets persisted in the target cache, odd ids for the sync engine's
/// limbo resolution targets.
#[derive(Clone, Debug)]
pub struct TargetIdGenerator {
    next_id: i32,
}

const TARGET_CACHE_GENERATOR: i32 = 0;
const SYNC_ENGINE_GENERATOR: i32 = 1;

impl TargetIdGenerator {
    fn new(generator_id: i32, seed: i32) -> Self {
        // Align to the generator's parity, strictly after the seed.
        let mut next_id = (seed & !1) | generator_id;
        if next_id <= seed {
            next_id += 2;
        }
        Self { next_id }
    }

    /// Even ids greater than `highest_target_id`.
    pub fn for_target_cache(highest_target_id: i32) -> Self {
        Self::new(TARGET_CACHE_GENERATOR, highest_target_id)
    }

    /// Odd ids starting at 1.
    pub fn for_sync_engine() -> Self {
        Self::new(SYNC_ENGINE_GENERATOR, 0)
    }

    pub fn next(&mut self) -> i32 {
        let id = self.next_id;
        self.next_id += 2;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequences_do_not_overlap() {
        let mut cache = TargetIdGenerator::for_target_cache(0);
        assert_eq!((cache.next(), cache.next()), (2, 4));
        let mut cache = TargetIdGenerator::for_target_cache(7);
        assert_eq!(cache.next(), 8);
        let mut limbo = TargetIdGenerator::for_sync_engine();
        assert_eq!((limbo.next(), limbo.next()), (1, 3));
    }
}
