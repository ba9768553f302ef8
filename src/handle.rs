//! Generation-tagged resource handles.
//!
//! Every session-scoped resource (key pair, public-key directory, hash
//! context, network key, streaming operation context) lives in a slot arena
//! owned by its [`SessionContext`](crate::SessionContext). A handle is an
//! index plus a generation counter; releasing a slot bumps the generation,
//! so a stale handle can never reach another resource that later reuses the
//! slot. Resolving checks both the generation and the resource kind, giving
//! the two distinct failures required of the API: an unknown/closed handle
//! and a live handle of the wrong kind.

use crate::{
    directory::DirectoryState,
    error::CryptoError,
    hash::HashContext,
    keystore::KeyPairState,
    netkey::NetKeyState,
    ops::{CheckOp, DecryptOp, EncryptOp, SignOp},
    tls::TlsContext,
};

/// The kind of resource a handle refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    KeyPair,
    Directory,
    Hash,
    NetKey,
    SignOp,
    CheckOp,
    EncryptOp,
    DecryptOp,
    Tls,
}

pub(crate) enum Resource {
    KeyPair(KeyPairState),
    Directory(DirectoryState),
    Hash(HashContext),
    NetKey(NetKeyState),
    SignOp(SignOp),
    CheckOp(CheckOp),
    EncryptOp(EncryptOp),
    DecryptOp(DecryptOp),
    Tls(TlsContext),
}

impl Resource {
    fn kind(&self) -> ResourceKind {
        match self {
            Resource::KeyPair(_) => ResourceKind::KeyPair,
            Resource::Directory(_) => ResourceKind::Directory,
            Resource::Hash(_) => ResourceKind::Hash,
            Resource::NetKey(_) => ResourceKind::NetKey,
            Resource::SignOp(_) => ResourceKind::SignOp,
            Resource::CheckOp(_) => ResourceKind::CheckOp,
            Resource::EncryptOp(_) => ResourceKind::EncryptOp,
            Resource::DecryptOp(_) => ResourceKind::DecryptOp,
            Resource::Tls(_) => ResourceKind::Tls,
        }
    }
}

/// Untyped handle value: slot index plus the generation it was minted with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawHandle {
    index: u32,
    generation: u32,
}

macro_rules! typed_handle {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        pub struct $name(pub(crate) RawHandle);
    };
}

typed_handle!(
    /// Handle to a loaded or generated key pair.
    KeyPairHandle
);
typed_handle!(
    /// Handle to an open public-key directory.
    DirHandle
);
typed_handle!(
    /// Handle to an incremental hash context.
    HashHandle
);
typed_handle!(
    /// Handle to a derived or loaded network key.
    NetKeyHandle
);
typed_handle!(
    /// Handle to a streaming sign operation.
    SignOpHandle
);
typed_handle!(
    /// Handle to a streaming check operation.
    CheckOpHandle
);
typed_handle!(
    /// Handle to a streaming encrypt operation.
    EncryptOpHandle
);
typed_handle!(
    /// Handle to a streaming decrypt operation.
    DecryptOpHandle
);
typed_handle!(
    /// Handle to a TLS-like session context.
    TlsHandle
);

struct Slot {
    generation: u32,
    resource: Option<Resource>,
}

/// Slot arena for all resources owned by one session.
pub(crate) struct HandleTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl HandleTable {
    pub fn new() -> Self {
        HandleTable {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn insert(&mut self, resource: Resource) -> RawHandle {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                debug_assert!(slot.resource.is_none());
                slot.resource = Some(resource);
                RawHandle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    resource: Some(resource),
                });
                RawHandle {
                    index,
                    generation: 0,
                }
            }
        }
    }

    pub fn get(&self, handle: RawHandle, kind: ResourceKind) -> Result<&Resource, CryptoError> {
        let slot = self
            .slots
            .get(handle.index as usize)
            .ok_or(CryptoError::BadHandle)?;
        if slot.generation != handle.generation {
            return Err(CryptoError::BadHandle);
        }
        let resource = slot.resource.as_ref().ok_or(CryptoError::BadHandle)?;
        if resource.kind() != kind {
            return Err(CryptoError::HandleType {
                expected: kind,
                actual: resource.kind(),
            });
        }
        Ok(resource)
    }

    pub fn get_mut(
        &mut self,
        handle: RawHandle,
        kind: ResourceKind,
    ) -> Result<&mut Resource, CryptoError> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .ok_or(CryptoError::BadHandle)?;
        if slot.generation != handle.generation {
            return Err(CryptoError::BadHandle);
        }
        let resource = slot.resource.as_mut().ok_or(CryptoError::BadHandle)?;
        if resource.kind() != kind {
            return Err(CryptoError::HandleType {
                expected: kind,
                actual: resource.kind(),
            });
        }
        Ok(resource)
    }

    /// Remove a resource, invalidating the handle. A second remove of the
    /// same handle sees the bumped generation and fails with `BadHandle`.
    pub fn remove(
        &mut self,
        handle: RawHandle,
        kind: ResourceKind,
    ) -> Result<Resource, CryptoError> {
        // Kind check first, so a mismatched handle isn't consumed.
        self.get(handle, kind)?;
        let slot = &mut self.slots[handle.index as usize];
        let resource = slot.resource.take().ok_or(CryptoError::BadHandle)?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        Ok(resource)
    }
}

macro_rules! resource_accessor {
    ($get:ident, $get_mut:ident, $take:ident, $variant:ident, $state:ty, $handle:ty) => {
        impl HandleTable {
            pub(crate) fn $get(&self, handle: $handle) -> Result<&$state, CryptoError> {
                match self.get(handle.0, ResourceKind::$variant)? {
                    Resource::$variant(state) => Ok(state),
                    _ => Err(CryptoError::BadHandle),
                }
            }

            #[allow(dead_code)]
            pub(crate) fn $get_mut(&mut self, handle: $handle) -> Result<&mut $state, CryptoError> {
                match self.get_mut(handle.0, ResourceKind::$variant)? {
                    Resource::$variant(state) => Ok(state),
                    _ => Err(CryptoError::BadHandle),
                }
            }

            pub(crate) fn $take(&mut self, handle: $handle) -> Result<$state, CryptoError> {
                match self.remove(handle.0, ResourceKind::$variant)? {
                    Resource::$variant(state) => Ok(state),
                    _ => Err(CryptoError::BadHandle),
                }
            }
        }
    };
}

resource_accessor!(key_pair, key_pair_mut, take_key_pair, KeyPair, KeyPairState, KeyPairHandle);
resource_accessor!(directory, directory_mut, take_directory, Directory, DirectoryState, DirHandle);
resource_accessor!(hash, hash_mut, take_hash, Hash, HashContext, HashHandle);
resource_accessor!(net_key, net_key_mut, take_net_key, NetKey, NetKeyState, NetKeyHandle);
resource_accessor!(sign_op, sign_op_mut, take_sign_op, SignOp, SignOp, SignOpHandle);
resource_accessor!(check_op, check_op_mut, take_check_op, CheckOp, CheckOp, CheckOpHandle);
resource_accessor!(encrypt_op, encrypt_op_mut, take_encrypt_op, EncryptOp, EncryptOp, EncryptOpHandle);
resource_accessor!(decrypt_op, decrypt_op_mut, take_decrypt_op, DecryptOp, DecryptOp, DecryptOpHandle);
resource_accessor!(tls, tls_mut, take_tls, Tls, TlsContext, TlsHandle);
