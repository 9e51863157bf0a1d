//! Process-local open-file table.

use crate::{AccessMode, FileHandle};
use sfs_error::{Result, SfsError};
use sfs_types::InodeNumber;

/// State behind one [`FileHandle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OpenFile {
    pub ino: InodeNumber,
    /// Slot generation at open; a mismatch means the file was unlinked.
    pub generation: u8,
    pub name: String,
    pub offset: u64,
    pub mode: AccessMode,
}

/// Slot table; handle numbers are slot indices, reused lowest first.
#[derive(Debug, Default)]
pub(crate) struct OpenFileTable {
    slots: Vec<Option<OpenFile>>,
}

impl OpenFileTable {
    pub fn insert(&mut self, file: OpenFile) -> Result<FileHandle> {
        let index = match self.slots.iter().position(Option::is_none) {
            Some(index) => {
                self.slots[index] = Some(file);
                index
            }
            None => {
                self.slots.push(Some(file));
                self.slots.len() - 1
            }
        };
        u32::try_from(index)
            .map(FileHandle)
            .map_err(|_| SfsError::Format("open-file table overflow".to_owned()))
    }

    pub fn get(&self, handle: FileHandle) -> Result<&OpenFile> {
        self.slots
            .get(handle.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(SfsError::UnknownDescriptor(handle.0))
    }

    pub fn get_mut(&mut self, handle: FileHandle) -> Result<&mut OpenFile> {
        self.slots
            .get_mut(handle.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(SfsError::UnknownDescriptor(handle.0))
    }

    pub fn remove(&mut self, handle: FileHandle) -> Result<OpenFile> {
        let file = self
            .slots
            .get_mut(handle.0 as usize)
            .and_then(Option::take)
            .ok_or(SfsError::UnknownDescriptor(handle.0))?;
        while matches!(self.slots.last(), Some(None)) {
            self.slots.pop();
        }
        Ok(file)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}
