// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::rand::{
    rngs::SmallRng,
    RngCore,
    SeedableRng,
};
use ::std::{
    collections::HashMap,
    hash::Hash,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Pre-allocated capacity for the id table.
const DEFAULT_SIZE: usize = 1024;

/// Seed for the random number generator used to allocate external ids.
/// This value was chosen arbitrarily.
const ID_MAP_SEED: u64 = 42;

/// Bound on the number of attempts to find an unused external id.
const MAX_RETRIES_ID_ALLOC: usize = 500;

//======================================================================================================================
// Structures
//======================================================================================================================

/// A map that hands out randomized external ids for internal slot indices, so
/// that callers cannot guess or forge a neighbouring id. The id types must be
/// basic types that can be converted back and forth between u64.
pub struct IdMap<E: Eq + Hash + From<u64> + Into<u64> + Copy, I: From<u64> + Into<u64> + Copy> {
    /// Map between external and internal ids.
    ids: HashMap<E, I>,
    /// Small random number generator for external ids.
    rng: SmallRng,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl<E: Eq + Hash + From<u64> + Into<u64> + Copy, I: From<u64> + Into<u64> + Copy> IdMap<E, I> {
    /// Retrieve the internal id mapped to this external id, if one exists.
    pub fn get(&self, external_id: &E) -> Option<I> {
        self.ids.get(external_id).copied()
    }

    /// Remove a mapping. If the mapping exists, return the internal id that
    /// was mapped to the external id.
    pub fn remove(&mut self, external_id: &E) -> Option<I> {
        self.ids.remove(external_id)
    }

    /// Allocate a fresh external id and map it to the given internal id. If a
    /// generated id is in use, keep generating up to a bounded number of tries.
    pub fn insert_with_new_id(&mut self, internal_id: I) -> E {
        for _ in 0..MAX_RETRIES_ID_ALLOC {
            let external_id: E = E::from(self.rng.next_u64());
            if !self.ids.contains_key(&external_id) {
                self.ids.insert(external_id, internal_id);
                return external_id;
            }
        }
        panic!("could not allocate an unused external id");
    }

    /// Number of live mappings.
    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.ids.len()
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl<E: Eq + Hash + From<u64> + Into<u64> + Copy, I: From<u64> + Into<u64> + Copy> Default for IdMap<E, I> {
    fn default() -> Self {
        Self {
            ids: HashMap::<E, I>::with_capacity(DEFAULT_SIZE),
            rng: SmallRng::seed_from_u64(ID_MAP_SEED),
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::IdMap;
    use ::anyhow::Result;

    #[derive(Clone, Copy, Hash, PartialEq, Eq, Debug)]
    struct ExternalId(u64);

    impl From<u64> for ExternalId {
        fn from(value: u64) -> Self {
            Self(value)
        }
    }

    impl From<ExternalId> for u64 {
        fn from(value: ExternalId) -> Self {
            value.0
        }
    }

    #[test]
    fn insert_allocates_distinct_ids() -> Result<()> {
        let mut map: IdMap<ExternalId, u64> = IdMap::default();
        let first: ExternalId = map.insert_with_new_id(1);
        let second: ExternalId = map.insert_with_new_id(2);
        crate::ensure_neq!(first, second);
        crate::ensure_eq!(map.get(&first), Some(1));
        crate::ensure_eq!(map.get(&second), Some(2));
        Ok(())
    }

    #[test]
    fn remove_forgets_the_mapping() -> Result<()> {
        let mut map: IdMap<ExternalId, u64> = IdMap::default();
        let id: ExternalId = map.insert_with_new_id(7);
        crate::ensure_eq!(map.remove(&id), Some(7));
        crate::ensure_eq!(map.get(&id), None);
        crate::ensure_eq!(map.len(), 0);
        Ok(())
    }
}
