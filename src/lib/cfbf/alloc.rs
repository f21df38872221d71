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

use std::mem;

use byteorder::{ByteOrder, LittleEndian};

/// A sector allocation table: one 32-bit entry per sector, holding either the
/// index of the next sector in the chain or one of the sentinel values below.
/// The same structure backs both the big FAT and the small FAT; they differ
/// only in the sector size they describe.
pub struct AllocTable {
	/// Size of the sectors this table describes.
	pub block_size: u32,
	data: Vec<u32>,
	/// Indices of table-backing sectors whose slots changed since the last flush.
	dirty_blocks: Vec<u32>,
	/// False only while the table has grown without anything being freed,
	/// in which case the first free slot is known to be at the end.
	maybe_fragmented: bool,
}

impl AllocTable {
	/// The sector is free.
	pub const AVAIL: u32 = 0xFFFF_FFFF;
	/// The sector ends its chain.
	pub const EOF: u32 = 0xFFFF_FFFE;
	/// The sector holds a part of the FAT itself.
	pub const BAT: u32 = 0xFFFF_FFFD;
	/// The sector holds a part of the meta FAT (DIFAT).
	pub const META_BAT: u32 = 0xFFFF_FFFC;

	pub fn new(block_size: u32) -> AllocTable {
		let mut table = AllocTable {
			block_size,
			data: Vec::new(),
			dirty_blocks: Vec::new(),
			maybe_fragmented: true,
		};
		table.resize(128);
		table
	}

	pub fn count(&self) -> u32 {
		self.data.len() as u32
	}

	pub fn unused_count(&self) -> u32 {
		self.data.iter().filter(|&&value| value == Self::AVAIL).count() as u32
	}

	pub fn resize(&mut self, newsize: u32) {
		self.data.resize(newsize as usize, Self::AVAIL);
	}

	/// Returns the entry at the given index, or `AVAIL` if the index lies
	/// outside the table. Callers walking chains must bound their indices via
	/// [`follow`](AllocTable::follow).
	pub fn get(&self, index: u32) -> u32 {
		self.data.get(index as usize).cloned().unwrap_or(Self::AVAIL)
	}

	pub fn set(&mut self, index: u32, value: u32) {
		if index >= self.count() {
			self.resize(index + 1);
		}
		self.data[index as usize] = value;
		if value == Self::AVAIL {
			self.maybe_fragmented = true;
		}
	}

	/// Links `chain[i]` to `chain[i + 1]` and terminates the last sector with `EOF`.
	pub fn set_chain(&mut self, chain: &[u32]) {
		if chain.is_empty() {
			return;
		}
		for i in 0..chain.len() - 1 {
			self.set(chain[i], chain[i + 1]);
		}
		self.set(chain[chain.len() - 1], Self::EOF);
	}

	/// Walks the chain starting at `start` and returns the visited sectors in
	/// order. The walk stops at any sentinel, at any out-of-range index, and
	/// after at most `count()` steps; damaged tables thus yield a truncated
	/// chain rather than an error.
	pub fn follow(&self, start: u32) -> Vec<u32> {
		let count = self.count();
		let mut chain = Vec::new();
		if start >= count {
			return chain;
		}
		let mut p = start;
		while p < count && (chain.len() as u32) < count {
			chain.push(p);
			let next = self.data[p as usize];
			if next >= count {
				break;
			}
			p = next;
		}
		chain
	}

	/// Returns the index of a free sector: the first `AVAIL` slot if the table
	/// may be fragmented, otherwise a fresh slot appended at the end. Callers
	/// claim the slot by setting it (usually to `EOF`) right away.
	pub fn unused(&mut self) -> u32 {
		if self.maybe_fragmented {
			for (index, &value) in self.data.iter().enumerate() {
				if value == Self::AVAIL {
					return index as u32;
				}
			}
		}
		let block = self.count();
		self.resize(block + 1);
		self.maybe_fragmented = false;
		block
	}

	pub fn load(&mut self, buffer: &[u8]) {
		self.resize((buffer.len() / 4) as u32);
		for i in 0..self.count() {
			let value = LittleEndian::read_u32(&buffer[i as usize * 4..]);
			self.set(i, value);
		}
	}

	/// Serializes the full table, one little-endian `u32` per slot.
	pub fn save(&self) -> Vec<u8> {
		let mut buffer = vec![0u8; self.data.len() * 4];
		for (i, &value) in self.data.iter().enumerate() {
			LittleEndian::write_u32(&mut buffer[i * 4..], value);
		}
		buffer
	}

	pub fn is_dirty(&self) -> bool {
		!self.dirty_blocks.is_empty()
	}

	/// Records that the table-backing sector containing slot `data_index`
	/// needs to be written back.
	pub fn mark_as_dirty(&mut self, data_index: u32, big_block_size: u32) {
		let dbidx = data_index / (big_block_size / 4);
		if !self.dirty_blocks.contains(&dbidx) {
			self.dirty_blocks.push(dbidx);
		}
	}

	pub fn take_dirty_blocks(&mut self) -> Vec<u32> {
		mem::replace(&mut self.dirty_blocks, Vec::new())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn set_grows_the_table() {
		let mut table = AllocTable::new(512);
		assert_eq!(table.count(), 128);
		table.set(200, AllocTable::EOF);
		assert_eq!(table.count(), 201);
		assert_eq!(table.get(200), AllocTable::EOF);
		assert_eq!(table.get(199), AllocTable::AVAIL);
		assert_eq!(table.get(5000), AllocTable::AVAIL);
	}

	#[test]
	fn follow_walks_a_chain_to_eof() {
		let mut table = AllocTable::new(512);
		table.set_chain(&[3, 7, 4, 20]);
		assert_eq!(table.follow(3), vec![3, 7, 4, 20]);
		assert_eq!(table.get(20), AllocTable::EOF);
		assert_eq!(table.follow(20), vec![20]);
	}

	#[test]
	fn follow_stops_on_sentinels_and_out_of_range() {
		let mut table = AllocTable::new(512);
		table.set(0, AllocTable::BAT);
		table.set(1, AllocTable::META_BAT);
		table.set(2, 100000); // points outside the table
		assert_eq!(table.follow(0), vec![0]);
		assert_eq!(table.follow(1), vec![1]);
		assert_eq!(table.follow(2), vec![2]);
		assert_eq!(table.follow(100000), Vec::<u32>::new());
		assert_eq!(table.follow(AllocTable::EOF), Vec::<u32>::new());
	}

	#[test]
	fn follow_terminates_on_cyclic_tables() {
		let mut table = AllocTable::new(512);
		table.set(5, 6);
		table.set(6, 5);
		let chain = table.follow(5);
		assert!(chain.len() as u32 <= table.count());
	}

	#[test]
	fn unused_is_first_fit_after_a_free() {
		let mut table = AllocTable::new(512);
		// claim the whole initial table
		for i in 0..128 {
			let block = table.unused();
			table.set(block, AllocTable::EOF);
			assert_eq!(block, i);
		}
		// the table is full now, so allocation appends
		let block = table.unused();
		table.set(block, AllocTable::EOF);
		assert_eq!(block, 128);
		// freeing re-enables the scan
		table.set(40, AllocTable::AVAIL);
		table.set(90, AllocTable::AVAIL);
		assert_eq!(table.unused(), 40);
	}

	#[test]
	fn save_load_round_trip() {
		let mut table = AllocTable::new(512);
		table.set_chain(&[0, 1, 2]);
		table.set(3, AllocTable::BAT);
		let buffer = table.save();
		assert_eq!(buffer.len(), 128 * 4);

		let mut reloaded = AllocTable::new(512);
		reloaded.load(&buffer);
		assert_eq!(reloaded.count(), 128);
		assert_eq!(reloaded.follow(0), vec![0, 1, 2]);
		assert_eq!(reloaded.get(3), AllocTable::BAT);
		assert_eq!(reloaded.get(4), AllocTable::AVAIL);
	}

	#[test]
	fn dirty_blocks_group_by_backing_sector() {
		let mut table = AllocTable::new(512);
		table.mark_as_dirty(0, 512);
		table.mark_as_dirty(127, 512); // same 128-entry sector
		table.mark_as_dirty(128, 512); // next sector
		assert!(table.is_dirty());
		assert_eq!(table.take_dirty_blocks(), vec![0, 1]);
		assert!(!table.is_dirty());
	}
}
