//! Incremental hash contexts.
//!
//! A hash context walks a small state machine: it opens running, absorbs any
//! number of updates, and finalizes exactly once. After finalization the
//! digest can be re-read but no further data is accepted. A context can also
//! be seeded directly with a precomputed digest, which moves it straight to
//! the finalized phase; that is how externally hashed data enters the
//! signing paths.
//!
//! Duplicating a running context forks the underlying digest state. The two
//! contexts share nothing afterwards and are closed independently.

use crate::error::CryptoError;
use crate::handle::{HashHandle, Resource};
use crate::provider::{DigestState, DIGEST_LEN};
use crate::session::SessionContext;

enum Phase {
    Running(Box<dyn DigestState>),
    Finalized([u8; DIGEST_LEN]),
}

pub(crate) struct HashContext {
    phase: Phase,
}

impl HashContext {
    pub(crate) fn open(state: Box<dyn DigestState>) -> Self {
        HashContext {
            phase: Phase::Running(state),
        }
    }

    pub(crate) fn update(&mut self, data: &[u8]) -> Result<(), CryptoError> {
        match &mut self.phase {
            Phase::Running(state) => {
                state.update(data);
                Ok(())
            }
            Phase::Finalized(_) => Err(CryptoError::WrongState("hash context is finalized")),
        }
    }

    pub(crate) fn finalize(&mut self) -> [u8; DIGEST_LEN] {
        if let Phase::Running(state) = &mut self.phase {
            let state = std::mem::replace(state, NullDigest::boxed());
            self.phase = Phase::Finalized(state.finalize());
        }
        match self.phase {
            Phase::Finalized(digest) => digest,
            Phase::Running(_) => unreachable!(),
        }
    }

    pub(crate) fn set(&mut self, digest: [u8; DIGEST_LEN]) {
        self.phase = Phase::Finalized(digest);
    }

    pub(crate) fn duplicate(&self) -> HashContext {
        HashContext {
            phase: match &self.phase {
                Phase::Running(state) => Phase::Running(state.boxed_clone()),
                Phase::Finalized(digest) => Phase::Finalized(*digest),
            },
        }
    }
}

// Placeholder swapped in while a running state is consumed by finalize.
struct NullDigest;

impl NullDigest {
    fn boxed() -> Box<dyn DigestState> {
        Box::new(NullDigest)
    }
}

impl DigestState for NullDigest {
    fn update(&mut self, _data: &[u8]) {}

    fn finalize(self: Box<Self>) -> [u8; DIGEST_LEN] {
        [0u8; DIGEST_LEN]
    }

    fn boxed_clone(&self) -> Box<dyn DigestState> {
        NullDigest::boxed()
    }
}

impl SessionContext {
    /// Open a fresh hash context.
    pub fn hash_open(&mut self) -> HashHandle {
        let state = self.provider.digest_begin();
        HashHandle(self.table.insert(Resource::Hash(HashContext::open(state))))
    }

    /// Absorb more data. `WrongState` once the context is finalized.
    pub fn hash_update(&mut self, handle: HashHandle, data: &[u8]) -> Result<(), CryptoError> {
        self.table.hash_mut(handle)?.update(data)
    }

    /// Finalize and return the digest. Repeated calls return the same
    /// digest.
    pub fn hash_finalize(&mut self, handle: HashHandle) -> Result<[u8; DIGEST_LEN], CryptoError> {
        Ok(self.table.hash_mut(handle)?.finalize())
    }

    /// Overwrite the context with a precomputed digest, moving it to the
    /// finalized phase.
    pub fn hash_set(
        &mut self,
        handle: HashHandle,
        digest: [u8; DIGEST_LEN],
    ) -> Result<(), CryptoError> {
        self.table.hash_mut(handle)?.set(digest);
        Ok(())
    }

    /// Fork a context mid-stream.
    pub fn hash_duplicate(&mut self, handle: HashHandle) -> Result<HashHandle, CryptoError> {
        let copy = self.table.hash(handle)?.duplicate();
        Ok(HashHandle(self.table.insert(Resource::Hash(copy))))
    }

    /// Release a hash context. Double close fails with `BadHandle`.
    pub fn hash_close(&mut self, handle: HashHandle) -> Result<(), CryptoError> {
        self.table.take_hash(handle).map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{CryptoProvider, SoftwareProvider};
    use crate::session::test_session;

    #[test]
    fn incremental_matches_one_shot() {
        let mut session = test_session();
        let h = session.hash_open();
        session.hash_update(h, b"chunk one ").unwrap();
        session.hash_update(h, b"chunk two").unwrap();
        let digest = session.hash_finalize(h).unwrap();
        assert_eq!(digest, SoftwareProvider::new().hash(b"chunk one chunk two"));
    }

    #[test]
    fn finalize_is_repeatable_but_update_is_not() {
        let mut session = test_session();
        let h = session.hash_open();
        session.hash_update(h, b"data").unwrap();
        let first = session.hash_finalize(h).unwrap();
        let second = session.hash_finalize(h).unwrap();
        assert_eq!(first, second);
        match session.hash_update(h, b"more") {
            Err(CryptoError::WrongState(_)) => (),
            _ => panic!("Update after finalize should fail with WrongState"),
        }
    }

    #[test]
    fn empty_finalize() {
        let mut session = test_session();
        let h = session.hash_open();
        let digest = session.hash_finalize(h).unwrap();
        assert_eq!(digest, SoftwareProvider::new().hash(b""));
    }

    #[test]
    fn set_overrides() {
        let mut session = test_session();
        let h = session.hash_open();
        session.hash_update(h, b"ignored").unwrap();
        let forced = [0x42u8; DIGEST_LEN];
        session.hash_set(h, forced).unwrap();
        assert_eq!(session.hash_finalize(h).unwrap(), forced);
        assert!(session.hash_update(h, b"x").is_err());
    }

    #[test]
    fn duplicate_diverges() {
        let mut session = test_session();
        let h = session.hash_open();
        session.hash_update(h, b"common prefix ").unwrap();
        let fork = session.hash_duplicate(h).unwrap();
        session.hash_update(h, b"left").unwrap();
        session.hash_update(fork, b"right").unwrap();

        let p = SoftwareProvider::new();
        assert_eq!(session.hash_finalize(h).unwrap(), p.hash(b"common prefix left"));
        assert_eq!(session.hash_finalize(fork).unwrap(), p.hash(b"common prefix right"));
    }

    #[test]
    fn close_is_final() {
        let mut session = test_session();
        let h = session.hash_open();
        session.hash_close(h).unwrap();
        assert!(matches!(session.hash_close(h), Err(CryptoError::BadHandle)));
        assert!(matches!(
            session.hash_update(h, b"x"),
            Err(CryptoError::BadHandle)
        ));
    }
}
