//! Public-key directories.
//!
//! A directory is an ordered list of `(user id, public-key block, comment)`
//! entries, unique by user id. It is the trust store for signature checking
//! and handshake certificate validation. Serialized form:
//!
//! ```text
//! +-------+-------+----------------------------------------+-----+
//! | Magic | Count |              Entries...                | CRC |
//! | PKD1  | u32   | uid(32) + block(256) + len(u16) + text | u16 |
//! +-------+-------+----------------------------------------+-----+
//! ```
//!
//! Each directory handle carries one enumeration cursor. A point lookup
//! (`dir_find`) invalidates the cursor; the hazard surfaces as `WrongState`
//! on the next `dir_find_next` rather than silently skipping entries.

use std::fs;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};

use crate::container::crc16;
use crate::error::CryptoError;
use crate::handle::{DirHandle, Resource};
use crate::keystore::{check_user_id, PublicKeyBlock, MAX_USER_ID_LEN, PUBLIC_KEY_BLOCK_LEN};
use crate::session::SessionContext;

const DIR_MAGIC: &[u8; 4] = b"PKD1";

/// One directory entry, returned by lookups and enumeration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub user_id: String,
    pub block: PublicKeyBlock,
    pub comment: String,
}

pub(crate) struct DirectoryState {
    entries: Vec<DirectoryEntry>,
    writable: bool,
    cursor: usize,
    cursor_live: bool,
}

impl DirectoryState {
    fn new(writable: bool) -> Self {
        DirectoryState {
            entries: Vec::new(),
            writable,
            cursor: 0,
            cursor_live: false,
        }
    }

    pub(crate) fn lookup(&self, user_id: &str) -> Option<&DirectoryEntry> {
        self.entries.iter().find(|e| e.user_id == user_id)
    }

    fn decode(session: &SessionContext, raw: &[u8], writable: bool) -> Result<Self, CryptoError> {
        if raw.len() < 4 + 4 + 2 {
            return Err(CryptoError::BadFormat("directory too short"));
        }
        let (body, crc_bytes) = raw.split_at(raw.len() - 2);
        let expected = LittleEndian::read_u16(crc_bytes);
        let actual = crc16(body);
        if expected != actual {
            return Err(CryptoError::BadCrc { expected, actual });
        }
        if &body[..4] != DIR_MAGIC {
            return Err(CryptoError::BadFormat("directory magic"));
        }
        let count = LittleEndian::read_u32(&body[4..8]) as usize;

        let mut state = DirectoryState::new(writable);
        let mut at = 8;
        for _ in 0..count {
            if body.len() < at + MAX_USER_ID_LEN + PUBLIC_KEY_BLOCK_LEN + 2 {
                return Err(CryptoError::BadFormat("directory entry truncated"));
            }
            let uid_field = &body[at..at + MAX_USER_ID_LEN];
            at += MAX_USER_ID_LEN;
            let uid_len = uid_field.iter().position(|&b| b == 0).unwrap_or(MAX_USER_ID_LEN);
            let user_id = std::str::from_utf8(&uid_field[..uid_len])
                .map_err(|_| CryptoError::BadUser)?
                .to_string();
            check_user_id(&user_id)?;

            let block = PublicKeyBlock::decode(
                session.provider.as_ref(),
                &body[at..at + PUBLIC_KEY_BLOCK_LEN],
            )?;
            at += PUBLIC_KEY_BLOCK_LEN;

            let comment_len = LittleEndian::read_u16(&body[at..at + 2]) as usize;
            at += 2;
            if body.len() < at + comment_len {
                return Err(CryptoError::BadFormat("directory comment truncated"));
            }
            let comment = std::str::from_utf8(&body[at..at + comment_len])
                .map_err(|_| CryptoError::BadFormat("directory comment encoding"))?
                .to_string();
            at += comment_len;

            state.entries.push(DirectoryEntry {
                user_id,
                block,
                comment,
            });
        }
        if at != body.len() {
            return Err(CryptoError::BadFormat("directory trailing bytes"));
        }
        Ok(state)
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.entries.len() * 320 + 2);
        out.extend_from_slice(DIR_MAGIC);
        let mut count = [0u8; 4];
        LittleEndian::write_u32(&mut count, self.entries.len() as u32);
        out.extend_from_slice(&count);
        for entry in &self.entries {
            let mut uid_field = [0u8; MAX_USER_ID_LEN];
            uid_field[..entry.user_id.len()].copy_from_slice(entry.user_id.as_bytes());
            out.extend_from_slice(&uid_field);
            out.extend_from_slice(entry.block.as_bytes());
            let mut len = [0u8; 2];
            LittleEndian::write_u16(&mut len, entry.comment.len() as u16);
            out.extend_from_slice(&len);
            out.extend_from_slice(entry.comment.as_bytes());
        }
        let crc = crc16(&out);
        let mut trailer = [0u8; 2];
        LittleEndian::write_u16(&mut trailer, crc);
        out.extend_from_slice(&trailer);
        out
    }
}

impl SessionContext {
    /// Open an empty directory.
    pub fn open_directory(&mut self, writable: bool) -> DirHandle {
        DirHandle(self.table.insert(Resource::Directory(DirectoryState::new(writable))))
    }

    /// Open a directory from its serialized form.
    pub fn open_directory_from(
        &mut self,
        raw: &[u8],
        writable: bool,
    ) -> Result<DirHandle, CryptoError> {
        let state = DirectoryState::decode(self, raw, writable)?;
        Ok(DirHandle(self.table.insert(Resource::Directory(state))))
    }

    /// Open a directory from a file.
    pub fn open_directory_file(
        &mut self,
        path: &Path,
        writable: bool,
    ) -> Result<DirHandle, CryptoError> {
        let raw = fs::read(path)?;
        self.open_directory_from(&raw, writable)
    }

    /// Look up an entry by user id. Fails with `NoKey` if absent. Any
    /// enumeration cursor on this directory is invalidated.
    pub fn dir_find(
        &mut self,
        dir: DirHandle,
        user_id: &str,
    ) -> Result<DirectoryEntry, CryptoError> {
        let state = self.table.directory_mut(dir)?;
        state.cursor_live = false;
        state.lookup(user_id).cloned().ok_or(CryptoError::NoKey)
    }

    /// Add an entry, replacing in place if the user id is already present.
    pub fn dir_add(
        &mut self,
        dir: DirHandle,
        user_id: &str,
        block: PublicKeyBlock,
        comment: &str,
    ) -> Result<(), CryptoError> {
        check_user_id(user_id)?;
        if comment.len() > u16::MAX as usize {
            return Err(CryptoError::BadLength {
                step: "directory comment",
                expected: u16::MAX as usize,
                actual: comment.len(),
            });
        }
        let state = self.table.directory_mut(dir)?;
        if !state.writable {
            return Err(CryptoError::WrongState("directory is read-only"));
        }
        let entry = DirectoryEntry {
            user_id: user_id.to_string(),
            block,
            comment: comment.to_string(),
        };
        match state.entries.iter_mut().find(|e| e.user_id == user_id) {
            Some(existing) => *existing = entry,
            None => state.entries.push(entry),
        }
        Ok(())
    }

    /// Remove an entry by user id. Fails with `NoKey` if absent.
    pub fn dir_remove(&mut self, dir: DirHandle, user_id: &str) -> Result<(), CryptoError> {
        let state = self.table.directory_mut(dir)?;
        if !state.writable {
            return Err(CryptoError::WrongState("directory is read-only"));
        }
        let at = state
            .entries
            .iter()
            .position(|e| e.user_id == user_id)
            .ok_or(CryptoError::NoKey)?;
        state.entries.remove(at);
        state.cursor_live = false;
        Ok(())
    }

    /// Serialize a directory.
    pub fn dir_save(&self, dir: DirHandle) -> Result<Vec<u8>, CryptoError> {
        Ok(self.table.directory(dir)?.encode())
    }

    /// Serialize a directory to a file.
    pub fn dir_save_file(&self, dir: DirHandle, path: &Path) -> Result<(), CryptoError> {
        let raw = self.dir_save(dir)?;
        fs::write(path, raw)?;
        Ok(())
    }

    /// Start enumerating; returns the first entry, or `None` on an empty
    /// directory.
    pub fn dir_find_first(&mut self, dir: DirHandle) -> Result<Option<DirectoryEntry>, CryptoError> {
        let state = self.table.directory_mut(dir)?;
        state.cursor = 0;
        state.cursor_live = true;
        let entry = state.entries.first().cloned();
        if entry.is_some() {
            state.cursor = 1;
        }
        Ok(entry)
    }

    /// Next entry of an enumeration. `WrongState` if no enumeration is in
    /// progress, including after a `dir_find` interleaved with one.
    pub fn dir_find_next(&mut self, dir: DirHandle) -> Result<Option<DirectoryEntry>, CryptoError> {
        let state = self.table.directory_mut(dir)?;
        if !state.cursor_live {
            return Err(CryptoError::WrongState(
                "no directory enumeration in progress",
            ));
        }
        let entry = state.entries.get(state.cursor).cloned();
        if entry.is_some() {
            state.cursor += 1;
        }
        Ok(entry)
    }

    /// Release a directory handle. Unsaved changes are discarded.
    pub fn close_directory(&mut self, dir: DirHandle) -> Result<(), CryptoError> {
        self.table.take_directory(dir).map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::KeySlot;
    use crate::session::test_session;
    use crate::SessionContext;

    fn block_for(session: &mut SessionContext, id: &str) -> PublicKeyBlock {
        let (h, _) = session.generate_key_pair("pw", Some(id), KeySlot::Primary).unwrap();
        let block = session.public_key_block(h).unwrap();
        session.close_key_pair(h).unwrap();
        block
    }

    #[test]
    fn add_find_remove() {
        let mut session = test_session();
        let dir = session.open_directory(true);
        let block = block_for(&mut session, "alice");
        session.dir_add(dir, "alice", block.clone(), "ops team").unwrap();

        let entry = session.dir_find(dir, "alice").unwrap();
        assert_eq!(entry.block, block);
        assert_eq!(entry.comment, "ops team");

        assert!(matches!(session.dir_find(dir, "bob"), Err(CryptoError::NoKey)));

        session.dir_remove(dir, "alice").unwrap();
        assert!(matches!(session.dir_find(dir, "alice"), Err(CryptoError::NoKey)));
        assert!(matches!(session.dir_remove(dir, "alice"), Err(CryptoError::NoKey)));
    }

    #[test]
    fn replace_keeps_size() {
        let mut session = test_session();
        let dir = session.open_directory(true);
        let first = block_for(&mut session, "alice");
        let second = block_for(&mut session, "alice");
        session.dir_add(dir, "alice", first, "old").unwrap();
        let before = session.dir_save(dir).unwrap().len();
        session.dir_add(dir, "alice", second.clone(), "new").unwrap();
        let after = session.dir_save(dir).unwrap().len();
        assert_eq!(before, after);
        let entry = session.dir_find(dir, "alice").unwrap();
        assert_eq!(entry.block, second);
        assert_eq!(entry.comment, "new");
    }

    #[test]
    fn read_only_rejects_writes() {
        let mut session = test_session();
        let dir = session.open_directory(false);
        let block = block_for(&mut session, "alice");
        assert!(matches!(
            session.dir_add(dir, "alice", block, ""),
            Err(CryptoError::WrongState(_))
        ));
        assert!(matches!(
            session.dir_remove(dir, "alice"),
            Err(CryptoError::WrongState(_))
        ));
    }

    #[test]
    fn save_and_reload() {
        let mut session = test_session();
        let dir = session.open_directory(true);
        for id in ["alice", "bob", "carol"] {
            let block = block_for(&mut session, id);
            session.dir_add(dir, id, block, id).unwrap();
        }
        let raw = session.dir_save(dir).unwrap();

        let dir2 = session.open_directory_from(&raw, false).unwrap();
        for id in ["alice", "bob", "carol"] {
            let a = session.dir_find(dir, id).unwrap();
            let b = session.dir_find(dir2, id).unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn corrupted_save_is_rejected() {
        let mut session = test_session();
        let dir = session.open_directory(true);
        let block = block_for(&mut session, "alice");
        session.dir_add(dir, "alice", block, "").unwrap();
        let mut raw = session.dir_save(dir).unwrap();
        raw[10] ^= 0x01;
        assert!(matches!(
            session.open_directory_from(&raw, false),
            Err(CryptoError::BadCrc { .. })
        ));
    }

    #[test]
    fn enumeration_in_order() {
        let mut session = test_session();
        let dir = session.open_directory(true);
        for id in ["alice", "bob", "carol"] {
            let block = block_for(&mut session, id);
            session.dir_add(dir, id, block, "").unwrap();
        }
        let mut seen = Vec::new();
        let mut entry = session.dir_find_first(dir).unwrap();
        while let Some(e) = entry {
            seen.push(e.user_id);
            entry = session.dir_find_next(dir).unwrap();
        }
        assert_eq!(seen, ["alice", "bob", "carol"]);
    }

    #[test]
    fn find_invalidates_cursor() {
        let mut session = test_session();
        let dir = session.open_directory(true);
        for id in ["alice", "bob"] {
            let block = block_for(&mut session, id);
            session.dir_add(dir, id, block, "").unwrap();
        }
        session.dir_find_first(dir).unwrap();
        session.dir_find(dir, "bob").unwrap();
        assert!(matches!(
            session.dir_find_next(dir),
            Err(CryptoError::WrongState(_))
        ));
        // A fresh find_first recovers.
        assert!(session.dir_find_first(dir).unwrap().is_some());
        assert!(session.dir_find_next(dir).unwrap().is_some());
    }

    #[test]
    fn next_without_first() {
        let mut session = test_session();
        let dir = session.open_directory(true);
        assert!(matches!(
            session.dir_find_next(dir),
            Err(CryptoError::WrongState(_))
        ));
    }

    #[test]
    fn file_round_trip() {
        let mut session = test_session();
        let dir = session.open_directory(true);
        let block = block_for(&mut session, "alice");
        session.dir_add(dir, "alice", block, "file test").unwrap();

        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("keys.pkd");
        session.dir_save_file(dir, &path).unwrap();
        let dir2 = session.open_directory_file(&path, false).unwrap();
        assert_eq!(
            session.dir_find(dir2, "alice").unwrap().comment,
            "file test"
        );
    }
}
