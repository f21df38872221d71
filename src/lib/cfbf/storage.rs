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

use std::cmp::min;
use std::io;
use std::io::{Read, Seek, SeekFrom, Write};
use std::mem;

use byteorder::{ByteOrder, LittleEndian};

use super::alloc::AllocTable;
use super::dir::{DirTree, ENTRY_SIZE};
use super::header::{Header, MAGIC};
use super::OpenError;
use super::super::io::Debug;

/// Occupancy counters for a container, as reported by `Storage::stats`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StorageStats {
	pub entries: u32,
	pub unused_entries: u32,
	pub big_blocks: u32,
	pub unused_big_blocks: u32,
	pub small_blocks: u32,
	pub unused_small_blocks: u32,
}

/// The container state and its host-file I/O: header, directory, both
/// allocation tables, the small-pool backing chain and the meta-FAT
/// bookkeeping, plus the transport the sectors are read from and written to.
pub struct StorageIO<TFile> {
	pub file: TFile,
	pub filesize: u64,
	pub writeable: bool,
	pub header: Header,
	pub dirtree: DirTree,
	pub bbat: AllocTable,
	pub sbat: AllocTable,
	/// Big sectors backing the small-block pool.
	pub sb_blocks: Vec<u32>,
	/// Sectors holding the meta FAT (doubly indirect FAT-sector indices).
	mbat_blocks: Vec<u32>,
	/// The FAT-sector indices beyond the 109 inline header slots.
	mbat_data: Vec<u32>,
	mbat_dirty: bool,
	pub debug: Debug,
}

impl<TFile> StorageIO<TFile> {
	fn with_file(file: TFile, writeable: bool, debug: Debug) -> StorageIO<TFile> {
		let header = Header::new();
		let big = header.big_block_size();
		let small = header.small_block_size();
		StorageIO {
			file,
			filesize: 0,
			writeable,
			header,
			dirtree: DirTree::new(big),
			bbat: AllocTable::new(big),
			sbat: AllocTable::new(small),
			sb_blocks: Vec::new(),
			mbat_blocks: Vec::new(),
			mbat_data: Vec::new(),
			mbat_dirty: false,
			debug,
		}
	}

	pub fn into_inner(self) -> TFile {
		self.file
	}

	pub fn stats(&self) -> StorageStats {
		StorageStats {
			entries: self.dirtree.entry_count(),
			unused_entries: self.dirtree.unused_entry_count(),
			big_blocks: self.bbat.count(),
			unused_big_blocks: self.bbat.unused_count(),
			small_blocks: self.sbat.count(),
			unused_small_blocks: self.sbat.unused_count(),
		}
	}

	/// Claims a free big sector, appends it to `chain` and links it in on the
	/// FAT, growing the FAT's own backing (and the meta FAT) when the new
	/// sector index exceeds the current FAT coverage.
	pub fn extend_file(&mut self, chain: &mut Vec<u32>) -> u32 {
		let big = self.bbat.block_size;
		let new_block = self.bbat.unused();
		self.bbat.set(new_block, AllocTable::EOF);
		let bbidx = new_block / (big / 4);
		while bbidx >= self.header.num_bat {
			self.add_bbat_block();
		}
		self.bbat.mark_as_dirty(new_block, big);
		if let Some(&last) = chain.last() {
			self.bbat.set(last, new_block);
			self.bbat.mark_as_dirty(last, big);
		}
		chain.push(new_block);
		new_block
	}

	/// Like `extend_file`, but for the small-pool backing chain the container
	/// itself owns.
	pub fn extend_small_pool(&mut self) -> u32 {
		let mut chain = mem::replace(&mut self.sb_blocks, Vec::new());
		let new_block = self.extend_file(&mut chain);
		self.sb_blocks = chain;
		new_block
	}

	/// Dedicates one more sector to the FAT. The first 109 FAT sectors are
	/// indexed from the header; all further ones go through the meta FAT,
	/// which grows by a sector of its own whenever its tail fills up.
	pub fn add_bbat_block(&mut self) {
		let big = self.bbat.block_size;
		let new_block = self.bbat.unused();
		self.bbat.set(new_block, AllocTable::BAT);
		self.bbat.mark_as_dirty(new_block, big);

		if self.header.num_bat < 109 {
			self.header.bb_blocks[self.header.num_bat as usize] = new_block;
		} else {
			self.mbat_dirty = true;
			self.mbat_data.push(new_block);
			let meta_idx = self.header.num_bat - 109;
			let per_block = big / 4 - 1; // one slot is the link to the next meta sector
			let idx_block = meta_idx / per_block;
			if idx_block as usize == self.mbat_blocks.len() {
				let new_meta = self.bbat.unused();
				self.bbat.set(new_meta, AllocTable::META_BAT);
				self.bbat.mark_as_dirty(new_meta, big);
				self.mbat_blocks.push(new_meta);
				if self.header.num_mbat == 0 {
					self.header.mbat_start = new_meta;
				}
				self.header.num_mbat += 1;
			}
		}
		self.header.num_bat += 1;
		self.header.dirty = true;
		self.debug.logln(2, format!("[add_bbat_block] FAT now spans {} sectors.", self.header.num_bat));
	}

	/// The current list of FAT sector indices, composed from the header's
	/// inline slots and the in-memory meta-FAT data. Used at flush time;
	/// loading walks the meta-FAT sectors instead.
	fn get_bbat_blocks(&self) -> Vec<u32> {
		let num_bat = self.header.num_bat as usize;
		let mut blocks = Vec::with_capacity(num_bat);
		for i in 0..min(num_bat, 109) {
			blocks.push(self.header.bb_blocks[i]);
		}
		for &block in &self.mbat_data {
			if blocks.len() >= num_bat {
				break;
			}
			blocks.push(block);
		}
		blocks
	}

	/// Resolves a path to a directory-entry index. With `create`, missing
	/// components are created on the way: storages for the inner components,
	/// and a final entry whose kind the caller picks via `final_dir` (the
	/// stream case announces its intended size so the entry starts out with
	/// it). Returns `None` when the path is absent and cannot or may not be
	/// created.
	pub fn dir_entry_ex(
		&mut self,
		path: &str,
		create: bool,
		stream_size: u32,
		final_dir: bool,
	) -> Option<u32> {
		if path.is_empty() {
			return None;
		}
		if path == "/" {
			return Some(0);
		}
		let big = self.bbat.block_size;
		let components = DirTree::split_path(path);
		let n_components = components.len();
		let mut index = 0;
		for (depth, component) in components.iter().enumerate() {
			let (child, _closest) = self.dirtree.find_child(index, component);
			if child > 0 {
				index = child;
				continue;
			}
			if !create || !self.writeable {
				return None;
			}
			let is_dir = depth + 1 < n_components || final_dir;
			let new_index =
				self.dirtree.create_entry(index, component, is_dir, stream_size, big);
			self.debug.logln(2, format!("[dir_entry] Created entry #{} for '{}'.", new_index, component));

			// make sure the directory chain covers the new entry slot
			let bbidx = new_index / (big / ENTRY_SIZE);
			let mut blocks = self.bbat.follow(self.header.dirent_start);
			while (blocks.len() as u32) <= bbidx {
				self.extend_file(&mut blocks);
			}

			index = new_index;
		}
		Some(index)
	}

	pub fn dir_entry(&mut self, path: &str, create: bool, stream_size: u32) -> Option<u32> {
		self.dir_entry_ex(path, create, stream_size, false)
	}
}

impl<TFile: Read + Seek> StorageIO<TFile> {
	/// Opens an existing container over the given transport.
	pub fn open(file: TFile, writeable: bool, debug: Debug) -> Result<StorageIO<TFile>, OpenError> {
		let mut io = StorageIO::with_file(file, writeable, debug);
		io.load()?;
		Ok(io)
	}

	fn load(&mut self) -> Result<(), OpenError> {
		self.debug.logln(1, format!("[load] Reading container header (512 bytes) ..."));
		self.filesize = self
			.file
			.seek(SeekFrom::End(0))
			.map_err(|_| OpenError::OpenFailed)?;

		let mut buffer = [0u8; 512];
		self.file.seek(SeekFrom::Start(0)).map_err(|_| OpenError::OpenFailed)?;
		self.file.read_exact(&mut buffer).map_err(|_| OpenError::NotOle)?;
		self.header.load(&buffer);

		if self.header.id != MAGIC {
			return Err(OpenError::NotOle);
		}
		if !self.header.valid() {
			return Err(OpenError::BadOle);
		}
		// a FAT larger than the file could possibly hold means a damaged header
		if self.header.num_bat as u64 > self.filesize / 4 {
			return Err(OpenError::BadOle);
		}

		self.bbat.block_size = self.header.big_block_size();
		self.sbat.block_size = self.header.small_block_size();
		let big = self.bbat.block_size as usize;

		// load the big FAT through the header slots and the meta-FAT walk
		let blocks = self.get_bbat_blocks_loading().map_err(|_| OpenError::BadOle)?;
		let buflen = blocks.len() * big;
		if buflen > 0 {
			let buffer = self.load_big_blocks(&blocks, buflen).map_err(|_| OpenError::BadOle)?;
			self.bbat.load(&buffer);
		}
		self.debug.logln(1, format!("[load] FAT spans {} sectors, {} entries.", blocks.len(), self.bbat.count()));

		// load the small FAT
		let blocks = self.bbat.follow(self.header.sbat_start);
		let buflen = blocks.len() * big;
		if buflen > 0 {
			let buffer = self.load_big_blocks(&blocks, buflen).map_err(|_| OpenError::BadOle)?;
			self.sbat.load(&buffer);
		}

		// load the directory
		let blocks = self.bbat.follow(self.header.dirent_start);
		let buflen = blocks.len() * big;
		let buffer = self.load_big_blocks(&blocks, buflen).map_err(|_| OpenError::BadOle)?;
		self.dirtree.load(&buffer);
		self.dirtree.take_dirty_blocks();
		if self.dirtree.entry_count() == 0 {
			return Err(OpenError::BadOle);
		}
		self.debug.logln(1, format!("[load] Directory holds {} entries.", self.dirtree.entry_count()));

		// the root entry's start field doubles as the small-pool chain head
		let sb_start = self.dirtree.entry(0).map(|root| root.start).unwrap_or(DirTree::END);
		self.sb_blocks = self.bbat.follow(sb_start);

		Ok(())
	}

	/// The FAT sector list as found on disk: up to 109 indices from the
	/// header, the remainder gathered by walking the meta-FAT sectors, each
	/// holding `bigSize/4 - 1` indices plus a link to the next meta sector.
	fn get_bbat_blocks_loading(&mut self) -> io::Result<Vec<u32>> {
		let num_bat = self.header.num_bat as usize;
		let big = self.bbat.block_size as usize;
		let mut blocks = Vec::with_capacity(num_bat);
		for i in 0..min(num_bat, 109) {
			blocks.push(self.header.bb_blocks[i]);
		}
		self.mbat_blocks.clear();
		self.mbat_data.clear();
		if num_bat > 109 && self.header.num_mbat > 0 {
			let per_sector = big / 4 - 1;
			let mut sector = self.header.mbat_start;
			for _ in 0..self.header.num_mbat {
				if blocks.len() >= num_bat {
					break;
				}
				if sector >= AllocTable::META_BAT {
					break;
				}
				self.debug.logln(3, format!("[load] Reading meta-FAT sector #{} ...", sector));
				self.mbat_blocks.push(sector);
				let buffer = self.load_big_block(sector)?;
				if buffer.len() < big {
					break;
				}
				for s in 0..per_sector {
					if blocks.len() >= num_bat {
						break;
					}
					let value = LittleEndian::read_u32(&buffer[s * 4..]);
					blocks.push(value);
					self.mbat_data.push(value);
				}
				sector = LittleEndian::read_u32(&buffer[big - 4..]);
			}
		}
		Ok(blocks)
	}

	pub fn load_big_block(&mut self, block: u32) -> io::Result<Vec<u8>> {
		let maxlen = self.bbat.block_size as usize;
		self.load_big_blocks(&[block], maxlen)
	}

	/// Reads the given big sectors back to back, up to `maxlen` bytes,
	/// stopping early where the host file ends.
	pub fn load_big_blocks(&mut self, blocks: &[u32], maxlen: usize) -> io::Result<Vec<u8>> {
		let big = self.bbat.block_size as u64;
		let mut data = vec![0u8; maxlen];
		let mut bytes = 0;
		for &block in blocks {
			if bytes >= maxlen {
				break;
			}
			let pos = big * (block as u64 + 1);
			if pos >= self.filesize {
				break;
			}
			let mut p = min(big as usize, maxlen - bytes);
			if pos + p as u64 > self.filesize {
				p = (self.filesize - pos) as usize;
			}
			self.file.seek(SeekFrom::Start(pos))?;
			self.file.read_exact(&mut data[bytes..bytes + p])?;
			bytes += p;
		}
		data.truncate(bytes);
		Ok(data)
	}

	pub fn load_small_block(&mut self, block: u32) -> io::Result<Vec<u8>> {
		let maxlen = self.sbat.block_size as usize;
		self.load_small_blocks(&[block], maxlen)
	}

	/// Reads the given small sectors by locating each inside the small-pool
	/// backing chain and copying its bytes out of the containing big sector.
	pub fn load_small_blocks(&mut self, blocks: &[u32], maxlen: usize) -> io::Result<Vec<u8>> {
		let big = self.bbat.block_size as usize;
		let small = self.sbat.block_size as usize;
		let mut data = vec![0u8; maxlen];
		let mut bytes = 0;
		for &block in blocks {
			if bytes >= maxlen {
				break;
			}
			let pos = block as usize * small;
			let bbindex = pos / big;
			if bbindex >= self.sb_blocks.len() {
				break;
			}
			let sb_block = self.sb_blocks[bbindex];
			let buffer = self.load_big_block(sb_block)?;
			let offset = pos % big;
			let mut p = min(maxlen - bytes, big - offset);
			p = min(p, small);
			// the backing sector may be cut short by the end of the host file
			let end = min(offset + p, buffer.len());
			if offset < end {
				data[bytes..bytes + (end - offset)].copy_from_slice(&buffer[offset..end]);
			}
			bytes += p;
		}
		data.truncate(bytes);
		Ok(data)
	}
}

impl<TFile: Read + Write + Seek> StorageIO<TFile> {
	/// Sets up a fresh container over the given (empty) transport. Nothing is
	/// written until the first flush.
	pub fn create(file: TFile, debug: Debug) -> StorageIO<TFile> {
		let mut io = StorageIO::with_file(file, true, debug);
		io.init();
		io
	}

	/// The fixed layout of a fresh container: the FAT lives at sector 0, the
	/// directory at sector 1, the small FAT at sector 2 and the small pool
	/// starts at sector 3.
	fn init(&mut self) {
		let big = self.bbat.block_size;
		self.header.bb_blocks[0] = 0;
		self.header.dirent_start = 1;
		self.header.sbat_start = 2;
		self.header.num_bat = 1;
		self.header.num_sbat = 1;
		self.header.dirty = true;
		for block in 0..4 {
			self.bbat.set(block, AllocTable::EOF);
			self.bbat.mark_as_dirty(block, big);
		}
		self.sb_blocks = self.bbat.follow(3);
		self.mbat_dirty = false;
	}

	/// Writes all pending changes to the host file, in an order that keeps a
	/// partially written container no worse than its pre-flush state: header
	/// first, then the FATs, then the directory, then the meta FAT.
	pub fn flush(&mut self) -> io::Result<()> {
		self.debug.logln(1, format!("[flush] Committing container state ..."));
		if self.header.dirty {
			let mut buffer = [0u8; 512];
			self.header.save(&mut buffer);
			self.file.seek(SeekFrom::Start(0))?;
			self.file.write_all(&buffer)?;
			if self.filesize < 512 {
				self.filesize = 512;
			}
		}
		if self.bbat.is_dirty() {
			self.flush_bbat()?;
		}
		if self.sbat.is_dirty() {
			self.flush_sbat()?;
		}
		if self.dirtree.is_dirty() {
			self.flush_dirtree()?;
		}
		if self.mbat_dirty && !self.mbat_blocks.is_empty() {
			self.flush_mbat()?;
		}
		self.file.flush()?;
		Ok(())
	}

	fn flush_bbat(&mut self) -> io::Result<()> {
		let blocks = self.get_bbat_blocks();
		let table = self.bbat.save();
		let dirty = self.bbat.take_dirty_blocks();
		self.write_dirty_table_blocks(&blocks, &table, &dirty, 0xFF)
	}

	fn flush_sbat(&mut self) -> io::Result<()> {
		let blocks = self.bbat.follow(self.header.sbat_start);
		let table = self.sbat.save();
		let dirty = self.sbat.take_dirty_blocks();
		self.write_dirty_table_blocks(&blocks, &table, &dirty, 0xFF)
	}

	fn flush_dirtree(&mut self) -> io::Result<()> {
		let blocks = self.bbat.follow(self.header.dirent_start);
		let mut table = self.dirtree.save();
		// entry 0 doubles as the descriptor of the small-pool backing chain
		let sb_start = if self.sb_blocks.is_empty() {
			DirTree::END
		} else {
			self.sb_blocks[0]
		};
		let sb_size = self.sb_blocks.len() as u32 * self.bbat.block_size;
		LittleEndian::write_u32(&mut table[0x74..], sb_start);
		LittleEndian::write_u32(&mut table[0x78..], sb_size);
		let dirty = self.dirtree.take_dirty_blocks();
		self.write_dirty_table_blocks(&blocks, &table, &dirty, 0x00)
	}

	/// Writes those backing sectors of a serialized table whose index appears
	/// in the dirty set, padding a short tail with the given filler byte.
	fn write_dirty_table_blocks(
		&mut self,
		blocks: &[u32],
		table: &[u8],
		dirty: &[u32],
		filler: u8,
	) -> io::Result<()> {
		let big = self.bbat.block_size as usize;
		for (idx, &block) in blocks.iter().enumerate() {
			if !dirty.contains(&(idx as u32)) {
				continue;
			}
			let mut sector = vec![filler; big];
			let start = idx * big;
			if start < table.len() {
				let end = min(table.len(), start + big);
				sector[..end - start].copy_from_slice(&table[start..end]);
			}
			self.debug.logln(3, format!("[flush] Writing table sector #{} ...", block));
			self.save_big_block(block, 0, &sector)?;
		}
		Ok(())
	}

	/// Serializes the meta FAT: each sector carries its share of `mbat_data`
	/// plus a trailing link to the next meta sector (`EOF` in the last one).
	fn flush_mbat(&mut self) -> io::Result<()> {
		let big = self.bbat.block_size as usize;
		let per_block = big / 4 - 1;
		let mut buffer = vec![0xFFu8; big * self.mbat_blocks.len()];
		for (i, &value) in self.mbat_data.iter().enumerate() {
			let pos = (i / per_block) * big + (i % per_block) * 4;
			LittleEndian::write_u32(&mut buffer[pos..], value);
		}
		for idx in 0..self.mbat_blocks.len() {
			let link = if idx + 1 == self.mbat_blocks.len() {
				AllocTable::EOF
			} else {
				self.mbat_blocks[idx + 1]
			};
			LittleEndian::write_u32(&mut buffer[idx * big + big - 4..], link);
		}
		let blocks = self.mbat_blocks.clone();
		self.save_big_blocks(&blocks, 0, &buffer)?;
		self.mbat_dirty = false;
		Ok(())
	}

	pub fn save_big_block(&mut self, block: u32, offset: u32, data: &[u8]) -> io::Result<usize> {
		self.save_big_blocks(&[block], offset, data)
	}

	/// Writes `data` into the given big sectors back to back, starting at
	/// `offset` within the first sector.
	pub fn save_big_blocks(&mut self, blocks: &[u32], offset: u32, data: &[u8]) -> io::Result<usize> {
		let big = self.bbat.block_size;
		let mut offset = offset;
		let mut bytes = 0;
		for &block in blocks {
			if bytes >= data.len() {
				break;
			}
			let pos = big as u64 * (block as u64 + 1) + offset as u64;
			let to_write = min((big - offset) as usize, data.len() - bytes);
			self.file.seek(SeekFrom::Start(pos))?;
			self.file.write_all(&data[bytes..bytes + to_write])?;
			bytes += to_write;
			offset = 0;
			if self.filesize < pos + to_write as u64 {
				self.filesize = pos + to_write as u64;
			}
		}
		Ok(bytes)
	}

	/// Writes `data` into the given small sectors, starting at
	/// `blocks[start_at]` plus `offset`, continuing into the following blocks
	/// from offset zero. Each small sector is located inside the small-pool
	/// backing chain first.
	pub fn save_small_blocks(
		&mut self,
		blocks: &[u32],
		offset: u32,
		data: &[u8],
		start_at: usize,
	) -> io::Result<usize> {
		let big = self.bbat.block_size;
		let small = self.sbat.block_size;
		let mut offset = offset;
		let mut bytes = 0;
		for i in start_at..blocks.len() {
			if bytes >= data.len() {
				break;
			}
			let block = blocks[i];
			let pos = block * small;
			let bbindex = (pos / big) as usize;
			if bbindex >= self.sb_blocks.len() {
				break;
			}
			let offset2 = pos % big;
			let to_write = min((small - offset) as usize, data.len() - bytes);
			let sb_block = self.sb_blocks[bbindex];
			self.save_big_block(sb_block, offset2 + offset, &data[bytes..bytes + to_write])?;
			bytes += to_write;
			offset = 0;
		}
		Ok(bytes)
	}

	/// Deletes the entry at the given path, recursively for storages, and
	/// frees the stream sectors back to their FAT. The change is flushed
	/// right away. Returns whether anything was deleted.
	pub fn delete_by_name(&mut self, full_name: &str) -> bool {
		if full_name.is_empty() || !self.writeable {
			return false;
		}
		let index = match self.dirtree.entry_index(full_name) {
			Some(index) => index,
			None => return false,
		};
		if index == 0 {
			// the root storage cannot be deleted
			return false;
		}
		self.debug.logln(2, format!("[delete_by_name] Deleting '{}' (entry #{}) ...", full_name, index));
		let is_dir = self.dirtree.entry(index).map(|entry| entry.dir).unwrap_or(false);
		let deleted = if is_dir {
			self.delete_node(index, full_name)
		} else {
			self.delete_leaf(index, full_name)
		};
		if deleted && self.flush().is_err() {
			return false;
		}
		deleted
	}

	/// Deletes a storage: all descendants first, depth first, then the
	/// storage's own entry.
	fn delete_node(&mut self, index: u32, full_name: &str) -> bool {
		let mut local_name = String::from(full_name);
		if !local_name.ends_with('/') {
			local_name.push('/');
		}
		loop {
			let child = match self.dirtree.entry(index) {
				Some(entry) => entry.child,
				None => break,
			};
			if child == 0 || child >= self.dirtree.entry_count() {
				break;
			}
			let (child_name, child_is_dir) = {
				let entry = self.dirtree.entry(child).unwrap();
				(entry.name.clone(), entry.dir)
			};
			let child_full_name = format!("{}{}", local_name, child_name);
			let deleted = if child_is_dir {
				self.delete_node(child, &child_full_name)
			} else {
				self.delete_leaf(child, &child_full_name)
			};
			if !deleted {
				return false;
			}
		}
		let big = self.bbat.block_size;
		self.dirtree.delete_entry(index, full_name, big);
		true
	}

	/// Deletes a stream: its sector chain goes back to `Avail` in whichever
	/// FAT holds it, then the entry is unlinked.
	fn delete_leaf(&mut self, index: u32, full_name: &str) -> bool {
		let big = self.bbat.block_size;
		let (start, size) = match self.dirtree.entry(index) {
			Some(entry) => (entry.start, entry.size),
			None => return false,
		};
		if size >= self.header.threshold {
			let blocks = self.bbat.follow(start);
			for &block in &blocks {
				self.bbat.set(block, AllocTable::AVAIL);
				self.bbat.mark_as_dirty(block, big);
			}
		} else {
			let blocks = self.sbat.follow(start);
			for &block in &blocks {
				self.sbat.set(block, AllocTable::AVAIL);
				self.sbat.mark_as_dirty(block, big);
			}
		}
		self.dirtree.delete_entry(index, full_name, big);
		true
	}
}
