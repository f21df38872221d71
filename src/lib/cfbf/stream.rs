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
use std::io::{Read, Seek, Write};

use super::alloc::AllocTable;
use super::dir::DirTree;
use super::storage::StorageIO;

/// A presumably reasonable size for the read cache.
const CACHE_SIZE: u32 = 4096;

/// A cursor over one stream of the container. Whether the bytes come from
/// big sectors or from the small pool is decided by the stream size relative
/// to the threshold, and can change under a resize.
///
/// The stream holds the *index* of its directory entry, never a reference:
/// creating other entries may reallocate the entries vector.
pub struct Stream<'a, TFile: 'a> {
	io: &'a mut StorageIO<TFile>,
	entry_idx: u32,
	full_name: String,
	pos: u32,
	blocks: Vec<u32>,
	eof: bool,
	fail: bool,
	// read cache, aligned on CACHE_SIZE boundaries; empty when invalid
	cache_pos: u32,
	cache_data: Vec<u8>,
}

impl<'a, TFile: 'a> Stream<'a, TFile> {
	pub fn new(io: &'a mut StorageIO<TFile>, entry_idx: u32, full_name: String) -> Stream<'a, TFile> {
		let blocks = match io.dirtree.entry(entry_idx) {
			Some(entry) => {
				if entry.size >= io.header.threshold {
					io.bbat.follow(entry.start)
				} else {
					io.sbat.follow(entry.start)
				}
			}
			None => Vec::new(),
		};
		Stream {
			io,
			entry_idx,
			full_name,
			pos: 0,
			blocks,
			eof: false,
			fail: false,
			cache_pos: 0,
			cache_data: Vec::new(),
		}
	}

	pub fn full_name(&self) -> &str {
		&self.full_name
	}

	pub fn size(&self) -> u32 {
		self.io.dirtree.entry(self.entry_idx).map(|entry| entry.size).unwrap_or(0)
	}

	pub fn seek(&mut self, pos: u32) {
		self.pos = pos;
		self.eof = false;
	}

	pub fn tell(&self) -> u32 {
		self.pos
	}

	/// True once a read was cut short at the end of the stream.
	pub fn eof(&self) -> bool {
		self.eof
	}

	/// True once an operation failed on the host file.
	pub fn fail(&self) -> bool {
		self.fail
	}
}

impl<'a, TFile: 'a + Read + Seek> Stream<'a, TFile> {
	/// Reads up to `data.len()` bytes at `pos` without moving the cursor.
	/// Returns the number of bytes read, which is clamped to the stream size;
	/// a chain shorter than the stream claims yields a short read.
	pub fn read_at(&mut self, pos: u32, data: &mut [u8]) -> usize {
		if data.is_empty() {
			return 0;
		}
		let size = self.size();
		let threshold = self.io.header.threshold;
		let maxlen = min(data.len() as u32, size.saturating_sub(pos)) as usize;
		if maxlen == 0 {
			return 0;
		}
		let mut total = 0;
		if size < threshold {
			let small = self.io.sbat.block_size;
			let mut index = (pos / small) as usize;
			if index >= self.blocks.len() {
				return 0;
			}
			let mut offset = pos % small;
			while total < maxlen {
				if index >= self.blocks.len() {
					break;
				}
				let buffer = match self.io.load_small_block(self.blocks[index]) {
					Ok(buffer) => buffer,
					Err(_) => {
						self.fail = true;
						break;
					}
				};
				let count = min((small - offset) as usize, maxlen - total);
				let end = min(offset as usize + count, buffer.len());
				if (offset as usize) < end {
					let copied = end - offset as usize;
					data[total..total + copied].copy_from_slice(&buffer[offset as usize..end]);
				}
				total += count;
				offset = 0;
				index += 1;
			}
		} else {
			let big = self.io.bbat.block_size;
			let mut index = (pos / big) as usize;
			if index >= self.blocks.len() {
				return 0;
			}
			let mut offset = pos % big;
			while total < maxlen {
				if index >= self.blocks.len() {
					break;
				}
				let buffer = match self.io.load_big_block(self.blocks[index]) {
					Ok(buffer) => buffer,
					Err(_) => {
						self.fail = true;
						break;
					}
				};
				let count = min((big - offset) as usize, maxlen - total);
				let end = min(offset as usize + count, buffer.len());
				if (offset as usize) < end {
					let copied = end - offset as usize;
					data[total..total + copied].copy_from_slice(&buffer[offset as usize..end]);
				}
				total += count;
				offset = 0;
				index += 1;
			}
		}
		total
	}

	/// Reads from the cursor position and advances it. Sets the `eof` flag
	/// when fewer bytes come back than were asked for.
	pub fn read(&mut self, data: &mut [u8]) -> usize {
		let pos = self.pos;
		let bytes = self.read_at(pos, data);
		self.pos += bytes as u32;
		if bytes < data.len() {
			self.eof = true;
		}
		bytes
	}

	/// Reads a single byte at the cursor, through the read cache.
	pub fn getch(&mut self) -> Option<u8> {
		if self.pos >= self.size() {
			self.eof = true;
			return None;
		}
		let cache_end = self.cache_pos + self.cache_data.len() as u32;
		if self.cache_data.is_empty() || self.pos < self.cache_pos || self.pos >= cache_end {
			self.update_cache();
		}
		if self.cache_data.is_empty() {
			return None;
		}
		let byte = self.cache_data[(self.pos - self.cache_pos) as usize];
		self.pos += 1;
		Some(byte)
	}

	fn update_cache(&mut self) {
		let size = self.size();
		self.cache_pos = self.pos - (self.pos % CACHE_SIZE);
		let mut bytes = CACHE_SIZE;
		if self.cache_pos + bytes > size {
			bytes = size - self.cache_pos;
		}
		let mut buffer = vec![0u8; bytes as usize];
		let pos = self.cache_pos;
		let count = self.read_at(pos, &mut buffer);
		buffer.truncate(count);
		self.cache_data = buffer;
	}
}

impl<'a, TFile: 'a + Read + Write + Seek> Stream<'a, TFile> {
	/// Resizes the stream. When the new size crosses the small/big threshold
	/// the surviving bytes migrate to the other pool: they are read out
	/// through the old chain, the old sectors are freed, and the bytes are
	/// written back so that allocation happens in the new pool. The cursor is
	/// clamped to the new size.
	pub fn set_size(&mut self, new_size: u32) {
		if !self.io.writeable {
			return;
		}
		let threshold = self.io.header.threshold;
		let old_size = self.size();
		let crossed_over = new_size >= threshold && old_size < threshold;
		let crossed_under = new_size < threshold && old_size >= threshold;
		let big = self.io.bbat.block_size;
		if crossed_over || crossed_under {
			// the old chain is still intact here, so the surviving bytes can
			// be read out before the sectors are freed
			let keep = min(new_size, old_size);
			let save_pos = self.pos;
			let mut buffer = vec![0u8; keep as usize];
			if keep > 0 {
				self.seek(0);
				self.read(&mut buffer);
			}
			if crossed_over {
				for &block in &self.blocks {
					self.io.sbat.set(block, AllocTable::AVAIL);
					self.io.sbat.mark_as_dirty(block, big);
				}
			} else {
				for &block in &self.blocks {
					self.io.bbat.set(block, AllocTable::AVAIL);
					self.io.bbat.mark_as_dirty(block, big);
				}
			}
			self.blocks.clear();
			if let Some(entry) = self.io.dirtree.entry_mut(self.entry_idx) {
				entry.start = DirTree::END;
				entry.size = new_size;
			}
			self.io.dirtree.mark_as_dirty(self.entry_idx, big);
			if keep > 0 {
				self.write_at(0, &buffer);
			}
			self.eof = false;
			self.pos = min(save_pos, new_size);
			self.cache_data.clear();
		} else if old_size != new_size {
			if let Some(entry) = self.io.dirtree.entry_mut(self.entry_idx) {
				entry.size = new_size;
			}
			self.io.dirtree.mark_as_dirty(self.entry_idx, big);
			self.cache_data.clear();
		}
	}

	/// Writes `data` at `pos`, growing the stream (and its sector chain) as
	/// needed. Returns the number of bytes written; 0 on a read-only
	/// container. The cursor advances by the length of `data`.
	pub fn write_at(&mut self, pos: u32, data: &[u8]) -> usize {
		if data.is_empty() || !self.io.writeable {
			return 0;
		}
		let len = data.len() as u32;
		if pos + len > self.size() {
			// may migrate the stream to the other pool
			self.set_size(pos + len);
		}
		let threshold = self.io.header.threshold;
		let size = self.size();
		let big = self.io.bbat.block_size;
		let mut total = 0;
		if size < threshold {
			let small = self.io.sbat.block_size;
			let last_index = (pos + len - 1) / small;
			while (last_index as usize) >= self.blocks.len() {
				self.extend_small_chain();
			}
			let offset = pos % small;
			let index = (pos / small) as usize;
			total = match self.io.save_small_blocks(&self.blocks, offset, data, index) {
				Ok(bytes) => bytes,
				Err(_) => {
					self.fail = true;
					0
				}
			};
		} else {
			let last_index = (pos + len - 1) / big;
			while (last_index as usize) >= self.blocks.len() {
				self.io.extend_file(&mut self.blocks);
			}
			let mut offset = pos % big;
			let mut index = (pos / big) as usize;
			let mut remainder = data.len();
			while remainder > 0 {
				if index >= self.blocks.len() {
					break;
				}
				let count = min((big - offset) as usize, remainder);
				if let Err(_) = self.io.save_big_block(self.blocks[index], offset, &data[total..total + count]) {
					self.fail = true;
					break;
				}
				total += count;
				remainder -= count;
				index += 1;
				offset = 0;
			}
		}
		if !self.blocks.is_empty() {
			let first = self.blocks[0];
			let start_changed = self
				.io
				.dirtree
				.entry(self.entry_idx)
				.map(|entry| entry.start != first)
				.unwrap_or(false);
			if start_changed {
				if let Some(entry) = self.io.dirtree.entry_mut(self.entry_idx) {
					entry.start = first;
				}
				self.io.dirtree.mark_as_dirty(self.entry_idx, big);
			}
		}
		self.pos += len;
		self.cache_data.clear();
		total
	}

	/// Writes at the cursor position.
	pub fn write(&mut self, data: &[u8]) -> usize {
		let pos = self.pos;
		self.write_at(pos, data)
	}

	/// Claims one more small sector for this stream's chain, growing the
	/// small FAT's own backing chain and the small-pool backing chain
	/// whenever the new sector falls outside what they cover.
	fn extend_small_chain(&mut self) {
		let big = self.io.bbat.block_size;
		let small = self.io.sbat.block_size;
		let nblock = self.io.sbat.unused();
		if let Some(&last) = self.blocks.last() {
			self.io.sbat.set(last, nblock);
			self.io.sbat.mark_as_dirty(last, big);
		}
		self.io.sbat.set(nblock, AllocTable::EOF);
		self.io.sbat.mark_as_dirty(nblock, big);
		self.blocks.push(nblock);

		let fat_idx = nblock / (big / 4);
		while fat_idx >= self.io.header.num_sbat {
			let mut sbat_blocks = self.io.bbat.follow(self.io.header.sbat_start);
			let was_empty = sbat_blocks.is_empty();
			self.io.extend_file(&mut sbat_blocks);
			if was_empty {
				self.io.header.sbat_start = sbat_blocks[0];
			}
			self.io.header.num_sbat += 1;
			self.io.header.dirty = true;
		}

		let sidx = nblock * small / big;
		while (sidx as usize) >= self.io.sb_blocks.len() {
			self.io.extend_small_pool();
		}
	}

	/// Flushes the whole container, not just this stream.
	pub fn flush(&mut self) {
		if self.io.flush().is_err() {
			self.fail = true;
		}
	}
}
