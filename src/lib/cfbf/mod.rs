/*
olestore library & toolset
Copyright (C) 2018 Steve Muller <steve.muller@outlook.com>

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU General Public License for more details.

You should have received a copy of the GNU General Public License
along with this program.  If not, see <http://www.gnu.org/licenses/>.
*/

// Also see: [MS-CFB]: Compound File Binary File Format specifications, https://msdn.microsoft.com/en-us/library/dd942138.aspx

mod alloc;
mod dir;
mod header;
mod storage;
mod stream;

pub use self::storage::StorageStats;
pub use self::stream::Stream;

use std::error;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, Write};
use std::io::Error;
use std::path::Path;

use self::storage::StorageIO;
use super::io::Debug;

/// Why a container could not be opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenError {
	/// The host file could not be opened or created.
	OpenFailed,
	/// The magic bytes did not match; this is not an OLE container.
	NotOle,
	/// The magic bytes matched but the header is internally inconsistent.
	BadOle,
}

impl fmt::Display for OpenError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match *self {
			OpenError::OpenFailed => write!(f, "the host file could not be opened or created"),
			OpenError::NotOle => write!(f, "not an OLE container (magic mismatch)"),
			OpenError::BadOle => write!(f, "damaged OLE container (inconsistent header)"),
		}
	}
}

impl error::Error for OpenError {}

/// A structured-storage container: a small file system within a single host
/// file, offering storages (folders) and streams (files) addressed by paths
/// such as "/ObjectPool/_1020961869".
///
/// A container is owned by a single caller; streams opened from it borrow it
/// for as long as they live.
pub struct Storage<TFile> {
	io: StorageIO<TFile>,
}

impl Storage<File> {
	/// Opens (or, with `create`, sets up) a container in the file at `path`.
	pub fn open<P: AsRef<Path>>(
		path: P,
		write_access: bool,
		create: bool,
		debug: Debug,
	) -> Result<Storage<File>, OpenError> {
		if create {
			let file = OpenOptions::new()
				.read(true)
				.write(true)
				.create(true)
				.truncate(true)
				.open(path)
				.map_err(|_| OpenError::OpenFailed)?;
			Ok(Storage::create_in(file, debug))
		} else if write_access {
			let file = OpenOptions::new()
				.read(true)
				.write(true)
				.open(path)
				.map_err(|_| OpenError::OpenFailed)?;
			Storage::open_in_rw(file, debug)
		} else {
			let file = File::open(path).map_err(|_| OpenError::OpenFailed)?;
			Storage::open_in(file, debug)
		}
	}
}

impl<TFile> Storage<TFile> {
	/// Whether this container accepts modifications.
	pub fn is_writeable(&self) -> bool {
		self.io.writeable
	}

	/// Returns whether a stream or storage exists at the given path.
	pub fn exists(&self, path: &str) -> bool {
		self.io.dirtree.entry_index(path).is_some()
	}

	/// Returns whether the given path names a storage.
	pub fn is_directory(&self, path: &str) -> bool {
		match self.io.dirtree.entry_index(path) {
			Some(index) => self.io.dirtree.entry(index).map(|entry| entry.dir).unwrap_or(false),
			None => false,
		}
	}

	/// Lists the names of the children of the storage at the given path, in
	/// sibling order (shorter names first, ties lexicographic).
	pub fn entries(&self, path: &str) -> Vec<String> {
		let mut result = Vec::new();
		if let Some(index) = self.io.dirtree.entry_index(path) {
			let is_dir = self.io.dirtree.entry(index).map(|entry| entry.dir).unwrap_or(false);
			if is_dir {
				for child in self.io.dirtree.children(index) {
					if let Some(entry) = self.io.dirtree.entry(child) {
						result.push(entry.name.clone());
					}
				}
			}
		}
		result
	}

	/// Occupancy counters, mostly useful for diagnostics and tests.
	pub fn stats(&self) -> StorageStats {
		self.io.stats()
	}

	/// Creates a storage (and any missing intermediate storages) at the
	/// given path. Returns false on a read-only container.
	pub fn create_storage(&mut self, path: &str) -> bool {
		if path == "/" {
			return false;
		}
		match self.io.dir_entry_ex(path, true, 0, true) {
			Some(index) => self.io.dirtree.entry(index).map(|entry| entry.dir).unwrap_or(false),
			None => false,
		}
	}

	/// Opens the stream at the given path, creating it (and any missing
	/// parent storages) when `create` is set. A newly created stream starts
	/// out with `stream_size` as its announced size but no sectors; writing
	/// fills it in. Returns `None` for storages and for paths that are
	/// absent and may not be created.
	pub fn stream<'a>(
		&'a mut self,
		path: &str,
		create: bool,
		stream_size: u32,
	) -> Option<Stream<'a, TFile>> {
		let index = self.io.dir_entry(path, create, stream_size)?;
		let is_dir = self.io.dirtree.entry(index).map(|entry| entry.dir).unwrap_or(true);
		if is_dir {
			return None;
		}
		Some(Stream::new(&mut self.io, index, String::from(path)))
	}

	/// Closes the container and hands back the underlying transport. Pending
	/// changes are *not* flushed; call [`flush`](Storage::flush) first.
	pub fn close(self) -> TFile {
		self.io.into_inner()
	}
}

impl<TFile: Read + Seek> Storage<TFile> {
	/// Opens an existing container over the given transport, read-only.
	pub fn open_in(file: TFile, debug: Debug) -> Result<Storage<TFile>, OpenError> {
		StorageIO::open(file, false, debug).map(|io| Storage { io })
	}
}

impl<TFile: Read + Write + Seek> Storage<TFile> {
	/// Opens an existing container over the given transport with write access.
	pub fn open_in_rw(file: TFile, debug: Debug) -> Result<Storage<TFile>, OpenError> {
		StorageIO::open(file, true, debug).map(|io| Storage { io })
	}

	/// Sets up a fresh container over the given (empty) transport. Nothing
	/// is written until the first flush.
	pub fn create_in(file: TFile, debug: Debug) -> Storage<TFile> {
		Storage { io: StorageIO::create(file, debug) }
	}

	/// Writes all pending changes through to the host file.
	pub fn flush(&mut self) -> Result<(), Error> {
		self.io.flush()
	}

	/// Deletes the stream or storage at the given path; storages are removed
	/// with everything below them. Returns whether anything was deleted.
	pub fn delete_by_name(&mut self, path: &str) -> bool {
		self.io.delete_by_name(path)
	}
}
