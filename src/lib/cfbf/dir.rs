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

use std::cmp::Ordering;

use byteorder::{ByteOrder, LittleEndian};

use super::alloc::AllocTable;

/// Size of a serialized directory entry in bytes.
pub const ENTRY_SIZE: u32 = 128;

/// A directory entry: either a storage (folder), a stream (file), or the
/// root storage at index 0.
#[derive(Clone)]
pub struct DirEntry {
	/// False if the entry slot is not in use (it will be skipped and may be recycled).
	pub valid: bool,
	/// The entry name. Names are stored on disk as UTF-16 of which only the
	/// low byte of each code unit is retained, so this is effectively Latin-1.
	pub name: String,
	/// True if this entry is a storage.
	pub dir: bool,
	/// Stream length in bytes (not valid for storages).
	pub size: u32,
	/// First sector of the stream chain.
	pub start: u32,
	/// Left sibling in this storage's sibling tree.
	pub prev: u32,
	/// Right sibling in this storage's sibling tree.
	pub next: u32,
	/// First child, for storages.
	pub child: u32,
}

impl DirEntry {
	fn unallocated() -> DirEntry {
		DirEntry {
			valid: false,
			name: String::new(),
			dir: false,
			size: 0,
			start: 0,
			prev: 0,
			next: 0,
			child: 0,
		}
	}

	/// Sibling ordering: a shorter name sorts before a longer name, and names
	/// of equal length compare lexicographically. This is the container
	/// format's ordering and is *not* plain lexical order.
	pub fn compare_name(&self, name2: &str) -> Ordering {
		let len1 = self.name.chars().count();
		let len2 = name2.chars().count();
		len1.cmp(&len2).then_with(|| self.name.as_str().cmp(name2))
	}
}

/// Keeps each code unit's low byte only, the way names are persisted.
/// Storing names pre-folded keeps the in-memory sibling ordering identical
/// to the on-disk one.
fn fold_name(name: &str) -> String {
	name.encode_utf16().map(|unit| (unit & 0xFF) as u8 as char).collect()
}

/// The directory: a flat vector of entries, of which entry 0 is always the
/// root storage, plus per-storage sibling trees threaded through the
/// `prev`/`next`/`child` indices.
///
/// Everything here holds entry *indices* rather than references: the entries
/// vector reallocates when it grows, so references would not stay valid.
pub struct DirTree {
	entries: Vec<DirEntry>,
	dirty_blocks: Vec<u32>,
}

impl DirTree {
	/// Marks an absent sibling or child.
	pub const END: u32 = 0xFFFF_FFFF;

	pub fn new(big_block_size: u32) -> DirTree {
		let mut tree = DirTree {
			entries: Vec::new(),
			dirty_blocks: Vec::new(),
		};
		tree.clear(big_block_size);
		tree
	}

	/// Resets the directory to only the root entry.
	pub fn clear(&mut self, big_block_size: u32) {
		self.entries.clear();
		self.entries.push(DirEntry {
			valid: true,
			name: String::from("Root Entry"),
			dir: true,
			size: 0,
			start: Self::END,
			prev: Self::END,
			next: Self::END,
			child: Self::END,
		});
		self.dirty_blocks.clear();
		self.mark_as_dirty(0, big_block_size);
	}

	pub fn entry_count(&self) -> u32 {
		self.entries.len() as u32
	}

	pub fn unused_entry_count(&self) -> u32 {
		self.entries.iter().filter(|entry| !entry.valid).count() as u32
	}

	pub fn entry(&self, index: u32) -> Option<&DirEntry> {
		self.entries.get(index as usize)
	}

	pub fn entry_mut(&mut self, index: u32) -> Option<&mut DirEntry> {
		self.entries.get_mut(index as usize)
	}

	/// Splits a path such as "/ObjectPool/_1020961869" into its components.
	pub fn split_path(path: &str) -> Vec<&str> {
		path.split('/').filter(|component| !component.is_empty()).collect()
	}

	/// Resolves a full path to an entry index, without creating anything.
	pub fn entry_index(&self, path: &str) -> Option<u32> {
		if path.is_empty() {
			return None;
		}
		if path == "/" {
			return Some(0);
		}
		let mut index = 0;
		for component in Self::split_path(path) {
			let (child, _closest) = self.find_child(index, component);
			if child == 0 {
				return None;
			}
			index = child;
		}
		Some(index)
	}

	/// Searches the sibling tree of storage `index` for `name`. Returns the
	/// matching entry index (or 0 if absent) and the node where the ordered
	/// search ended, which is where an insertion would attach. The name is
	/// folded the way stored names are, so lookups agree with creation.
	pub fn find_child(&self, index: u32, name: &str) -> (u32, u32) {
		let name = fold_name(name);
		let mut closest = Self::END;
		let count = self.entry_count();
		if let Some(parent) = self.entry(index) {
			if parent.valid && parent.child < count {
				let found = self.find_sibling(parent.child, &name, &mut closest);
				return (found, closest);
			}
		}
		(0, closest)
	}

	fn find_sibling(&self, index: u32, name: &str, closest: &mut u32) -> u32 {
		let count = self.entry_count();
		let entry = match self.entry(index) {
			Some(entry) if entry.valid => entry,
			_ => return 0,
		};
		match entry.compare_name(name) {
			Ordering::Equal => index,
			Ordering::Greater => {
				if entry.prev > 0 && entry.prev < count {
					return self.find_sibling(entry.prev, name, closest);
				}
				*closest = index;
				0
			}
			Ordering::Less => {
				if entry.next > 0 && entry.next < count {
					return self.find_sibling(entry.next, name, closest);
				}
				*closest = index;
				0
			}
		}
	}

	/// Returns the children of storage `index`, in sibling order.
	pub fn children(&self, index: u32) -> Vec<u32> {
		let mut result = Vec::new();
		if let Some(entry) = self.entry(index) {
			if entry.valid && entry.child < self.entry_count() {
				self.collect_siblings(&mut result, entry.child);
			}
		}
		result
	}

	fn collect_siblings(&self, result: &mut Vec<u32>, index: u32) {
		let count = self.entry_count();
		let entry = match self.entry(index) {
			Some(entry) => entry,
			None => return,
		};
		if entry.prev < count {
			self.collect_siblings(result, entry.prev);
		}
		result.push(index);
		if entry.next < count {
			self.collect_siblings(result, entry.next);
		}
	}

	/// Returns the index of the first unused entry slot, appending a new slot
	/// when every existing one is in use. Slots of deleted entries get
	/// recycled here; the vector is never compacted.
	pub fn unused(&mut self) -> u32 {
		for (index, entry) in self.entries.iter().enumerate() {
			if !entry.valid {
				return index as u32;
			}
		}
		self.entries.push(DirEntry::unallocated());
		self.entry_count() - 1
	}

	/// Creates a new entry named `name` under storage `parent` and links it
	/// into the sibling tree at the position the ordered search yields.
	/// Returns the new entry's index. The caller is responsible for making
	/// sure the directory chain on disk covers the new index.
	pub fn create_entry(
		&mut self,
		parent: u32,
		name: &str,
		dir: bool,
		stream_size: u32,
		big_block_size: u32,
	) -> u32 {
		let (_, closest) = self.find_child(parent, name);
		let index = self.unused();
		{
			let entry = &mut self.entries[index as usize];
			entry.valid = true;
			entry.name = fold_name(name);
			entry.dir = dir;
			entry.size = if dir { 0 } else { stream_size };
			entry.start = AllocTable::EOF;
			entry.child = Self::END;
		}
		if closest == Self::END {
			// the storage had no children yet; attach directly below the parent
			let parent_child = self.entries[parent as usize].child;
			self.entries[index as usize].prev = Self::END;
			self.entries[index as usize].next = parent_child;
			self.entries[parent as usize].child = index;
			self.mark_as_dirty(parent, big_block_size);
		} else {
			let new_name = self.entries[index as usize].name.clone();
			if self.entries[closest as usize].compare_name(&new_name) == Ordering::Less {
				let closest_next = self.entries[closest as usize].next;
				self.entries[index as usize].prev = closest_next;
				self.entries[index as usize].next = Self::END;
				self.entries[closest as usize].next = index;
			} else {
				let closest_prev = self.entries[closest as usize].prev;
				self.entries[index as usize].next = closest_prev;
				self.entries[index as usize].prev = Self::END;
				self.entries[closest as usize].prev = index;
			}
			self.mark_as_dirty(closest, big_block_size);
		}
		self.mark_as_dirty(index, big_block_size);
		index
	}

	/// Finds the parent of entry `in_idx` (resolved from its full name) and,
	/// unless the entry hangs directly below the parent, the sibling whose
	/// `prev` or `next` points at it. Both are 0 when resolution fails.
	pub fn find_parent_and_sib(&self, in_idx: u32, in_full_name: &str) -> (u32, u32) {
		if in_idx == 0
			|| in_idx >= self.entry_count()
			|| in_full_name == "/"
			|| in_full_name.is_empty()
		{
			return (0, 0);
		}
		let mut local_name = String::from(in_full_name);
		if !local_name.starts_with('/') {
			local_name.insert(0, '/');
		}
		if local_name.ends_with('/') {
			local_name.pop();
		}
		let last_slash = match local_name.rfind('/') {
			Some(position) => position,
			None => return (0, 0),
		};
		let parent_name = if last_slash == 0 { "/" } else { &local_name[..last_slash] };
		let parent_idx = match self.entry_index(parent_name) {
			Some(index) => index,
			None => return (0, 0),
		};
		if self.entries[parent_idx as usize].child == in_idx {
			return (parent_idx, 0); // no sibling points at in_idx
		}
		(parent_idx, self.find_sib(in_idx, self.entries[parent_idx as usize].child))
	}

	/// Descends the sibling tree from `sib_idx` looking for the node that
	/// points at `in_idx`. `sib_idx` must be the parent storage's child.
	pub fn find_sib(&self, in_idx: u32, sib_idx: u32) -> u32 {
		let target_name = match self.entry(in_idx) {
			Some(entry) => entry.name.clone(),
			None => return 0,
		};
		self.find_sib_by_name(in_idx, sib_idx, &target_name)
	}

	fn find_sib_by_name(&self, in_idx: u32, sib_idx: u32, target_name: &str) -> u32 {
		let sib = match self.entry(sib_idx) {
			Some(entry) if entry.valid => entry,
			_ => return 0,
		};
		if sib.next == in_idx || sib.prev == in_idx {
			return sib_idx;
		}
		if sib.compare_name(target_name) == Ordering::Greater {
			self.find_sib_by_name(in_idx, sib.prev, target_name)
		} else {
			self.find_sib_by_name(in_idx, sib.next, target_name)
		}
	}

	/// Unlinks entry `in_idx` from its sibling tree, re-attaching a
	/// replacement subtree so the remaining siblings stay reachable and
	/// ordered, and marks the slot invalid for reuse. The stream chain is
	/// not touched here; freeing sectors is the container's job.
	pub fn delete_entry(&mut self, in_idx: u32, in_full_name: &str, big_block_size: u32) {
		let n_entries = self.entry_count();
		if in_idx == 0 || in_idx >= n_entries {
			return;
		}
		let (parent_idx, sib_idx) = self.find_parent_and_sib(in_idx, in_full_name);
		let del_prev = self.entries[in_idx as usize].prev;
		let del_next = self.entries[in_idx as usize].next;
		let repl_idx;
		if del_next == 0 || del_next >= n_entries {
			repl_idx = del_prev;
		} else {
			let next_prev = self.entries[del_next as usize].prev;
			if next_prev == 0 || next_prev >= n_entries {
				repl_idx = del_next;
				self.entries[del_next as usize].prev = del_prev;
				self.mark_as_dirty(del_next, big_block_size);
			} else {
				// the successor has a left subtree; splice out its smallest node
				let mut sml_idx = del_next;
				let mut smlr_idx;
				loop {
					smlr_idx = self.entries[sml_idx as usize].prev;
					let below = self.entries[smlr_idx as usize].prev;
					if below == 0 || below >= n_entries {
						break;
					}
					sml_idx = smlr_idx;
				}
				repl_idx = self.entries[sml_idx as usize].prev;
				let smlr_next = self.entries[smlr_idx as usize].next;
				self.entries[sml_idx as usize].prev = smlr_next;
				self.entries[smlr_idx as usize].prev = del_prev;
				self.entries[smlr_idx as usize].next = del_next;
				self.mark_as_dirty(sml_idx, big_block_size);
				self.mark_as_dirty(smlr_idx, big_block_size);
			}
		}
		if sib_idx != 0 {
			if self.entries[sib_idx as usize].next == in_idx {
				self.entries[sib_idx as usize].next = repl_idx;
			} else {
				self.entries[sib_idx as usize].prev = repl_idx;
			}
			self.mark_as_dirty(sib_idx, big_block_size);
		} else {
			self.entries[parent_idx as usize].child = repl_idx;
			self.mark_as_dirty(parent_idx, big_block_size);
		}
		self.entries[in_idx as usize].valid = false;
		self.mark_as_dirty(in_idx, big_block_size);
	}

	pub fn load(&mut self, buffer: &[u8]) {
		self.entries.clear();
		for i in 0..buffer.len() / ENTRY_SIZE as usize {
			let p = i * ENTRY_SIZE as usize;

			// the name is stored as UTF-16; only the low bytes are kept
			let mut name_len = LittleEndian::read_u16(&buffer[p + 0x40..]) as usize;
			if name_len > 64 {
				name_len = 64;
			}
			let mut name = String::new();
			let mut j = 0;
			while j < name_len && buffer[p + j] != 0 {
				name.push(buffer[p + j] as char);
				j += 2;
			}
			// some writers prefix names with an unprintable tag character
			if !name.is_empty() && buffer[p] < 0x20 {
				name.remove(0);
			}

			// 2 = stream, 1 = storage, 5 = root
			let entry_type = buffer[p + 0x42];

			let mut entry = DirEntry {
				valid: entry_type != 0,
				name,
				dir: entry_type != 2,
				size: LittleEndian::read_u32(&buffer[p + 0x78..]),
				start: LittleEndian::read_u32(&buffer[p + 0x74..]),
				prev: LittleEndian::read_u32(&buffer[p + 0x44..]),
				next: LittleEndian::read_u32(&buffer[p + 0x48..]),
				child: LittleEndian::read_u32(&buffer[p + 0x4C..]),
			};

			if entry_type != 1 && entry_type != 2 && entry_type != 5 {
				entry.valid = false;
			}
			if name_len < 1 {
				entry.valid = false;
			}

			self.entries.push(entry);
		}
	}

	/// Space required to save this directory.
	pub fn size(&self) -> u32 {
		self.entry_count() * ENTRY_SIZE
	}

	/// Serializes all entries at 128 bytes each. The root keeps its fixed
	/// name and type; its `start`/`size` fields are written as placeholders
	/// here and patched by the container at flush time to describe the
	/// small-pool backing chain.
	pub fn save(&self) -> Vec<u8> {
		let mut buffer = vec![0u8; self.size() as usize];

		// root is fixed as "Root Entry"
		let root_name = "Root Entry";
		for (j, character) in root_name.chars().enumerate() {
			buffer[j * 2] = character as u8;
		}
		LittleEndian::write_u16(&mut buffer[0x40..], root_name.len() as u16 * 2 + 2);
		buffer[0x42] = 5;
		buffer[0x43] = 1;
		LittleEndian::write_u32(&mut buffer[0x44..], Self::END);
		LittleEndian::write_u32(&mut buffer[0x48..], Self::END);
		LittleEndian::write_u32(&mut buffer[0x4C..], self.entries[0].child);
		LittleEndian::write_u32(&mut buffer[0x74..], Self::END);
		LittleEndian::write_u32(&mut buffer[0x78..], 0);

		for i in 1..self.entries.len() {
			let entry = &self.entries[i];
			let p = i * ENTRY_SIZE as usize;

			// at most 31 characters fit the 64-byte name field
			let mut chars = 0;
			for (j, character) in entry.name.chars().take(31).enumerate() {
				buffer[p + j * 2] = (character as u32 & 0xFF) as u8;
				chars = j + 1;
			}
			LittleEndian::write_u16(&mut buffer[p + 0x40..], chars as u16 * 2 + 2);

			buffer[p + 0x42] = if !entry.valid {
				0
			} else if entry.dir {
				1
			} else {
				2
			};
			buffer[p + 0x43] = 1; // always black
			LittleEndian::write_u32(&mut buffer[p + 0x44..], entry.prev);
			LittleEndian::write_u32(&mut buffer[p + 0x48..], entry.next);
			LittleEndian::write_u32(&mut buffer[p + 0x4C..], entry.child);
			if entry.dir {
				LittleEndian::write_u32(&mut buffer[p + 0x74..], Self::END);
				LittleEndian::write_u32(&mut buffer[p + 0x78..], 0);
			} else {
				LittleEndian::write_u32(&mut buffer[p + 0x74..], entry.start);
				LittleEndian::write_u32(&mut buffer[p + 0x78..], entry.size);
			}
		}

		buffer
	}

	pub fn is_dirty(&self) -> bool {
		!self.dirty_blocks.is_empty()
	}

	/// Records that the directory sector containing entry `data_index` needs
	/// to be written back.
	pub fn mark_as_dirty(&mut self, data_index: u32, big_block_size: u32) {
		let dbidx = data_index / (big_block_size / ENTRY_SIZE);
		if !self.dirty_blocks.contains(&dbidx) {
			self.dirty_blocks.push(dbidx);
		}
	}

	pub fn take_dirty_blocks(&mut self) -> Vec<u32> {
		::std::mem::replace(&mut self.dirty_blocks, Vec::new())
	}
}

#[cfg(test)]
mod tests {
	use std::cmp::Ordering;

	use super::*;

	fn entry_named(name: &str) -> DirEntry {
		let mut entry = DirEntry::unallocated();
		entry.name = String::from(name);
		entry
	}

	fn child_names(tree: &DirTree, index: u32) -> Vec<String> {
		tree.children(index)
			.iter()
			.map(|&child| tree.entry(child).unwrap().name.clone())
			.collect()
	}

	#[test]
	fn names_order_by_length_before_content() {
		assert_eq!(entry_named("c").compare_name("bb"), Ordering::Less);
		assert_eq!(entry_named("aaa").compare_name("bb"), Ordering::Greater);
		assert_eq!(entry_named("abc").compare_name("abd"), Ordering::Less);
		assert_eq!(entry_named("abc").compare_name("abc"), Ordering::Equal);
		// byte-lex order would put "aaa" first; length-major order must not
		assert_eq!(entry_named("aaa").compare_name("c"), Ordering::Greater);
	}

	#[test]
	fn siblings_come_back_in_order() {
		let mut tree = DirTree::new(512);
		for name in &["aaa", "bb", "c", "dddd"] {
			tree.create_entry(0, name, false, 0, 512);
		}
		assert_eq!(child_names(&tree, 0), vec!["c", "bb", "aaa", "dddd"]);
	}

	#[test]
	fn lookup_finds_nested_entries() {
		let mut tree = DirTree::new(512);
		let a = tree.create_entry(0, "A", true, 0, 512);
		let b = tree.create_entry(a, "B", true, 0, 512);
		let c = tree.create_entry(b, "C", false, 5, 512);
		assert_eq!(tree.entry_index("/"), Some(0));
		assert_eq!(tree.entry_index("/A"), Some(a));
		assert_eq!(tree.entry_index("/A/B"), Some(b));
		assert_eq!(tree.entry_index("/A/B/C"), Some(c));
		assert_eq!(tree.entry_index("A/B/C"), Some(c));
		assert_eq!(tree.entry_index("/A/X"), None);
		assert_eq!(tree.entry_index(""), None);
	}

	#[test]
	fn deleted_slots_are_recycled() {
		let mut tree = DirTree::new(512);
		let x = tree.create_entry(0, "x", false, 10, 512);
		tree.delete_entry(x, "/x", 512);
		assert!(!tree.entry(x).unwrap().valid);
		let y = tree.create_entry(0, "y", false, 10, 512);
		assert_eq!(y, x);
		assert_eq!(tree.entry_count(), 2);
	}

	#[test]
	fn delete_with_no_right_sibling_promotes_the_left() {
		let mut tree = DirTree::new(512);
		for name in &["dd", "bb", "cc", "aa"] {
			tree.create_entry(0, name, false, 0, 512);
		}
		assert_eq!(child_names(&tree, 0), vec!["aa", "bb", "cc", "dd"]);
		let dd = tree.entry_index("/dd").unwrap();
		tree.delete_entry(dd, "/dd", 512);
		assert_eq!(child_names(&tree, 0), vec!["aa", "bb", "cc"]);
	}

	#[test]
	fn delete_promotes_the_successor() {
		let mut tree = DirTree::new(512);
		for name in &["aaa", "bb", "c", "dddd"] {
			tree.create_entry(0, name, false, 0, 512);
		}
		let bb = tree.entry_index("/bb").unwrap();
		tree.delete_entry(bb, "/bb", 512);
		assert_eq!(child_names(&tree, 0), vec!["c", "aaa", "dddd"]);
		let aaa = tree.entry_index("/aaa").unwrap();
		tree.delete_entry(aaa, "/aaa", 512);
		assert_eq!(child_names(&tree, 0), vec!["c", "dddd"]);
	}

	#[test]
	fn delete_splices_a_deep_successor_subtree() {
		let mut tree = DirTree::new(512);
		// this insertion order hangs a left subtree below the successor
		for name in &["aa", "cc", "bb", "ee", "dd"] {
			tree.create_entry(0, name, false, 0, 512);
		}
		assert_eq!(child_names(&tree, 0), vec!["aa", "bb", "cc", "dd", "ee"]);
		let aa = tree.entry_index("/aa").unwrap();
		tree.delete_entry(aa, "/aa", 512);
		assert_eq!(child_names(&tree, 0), vec!["bb", "cc", "dd", "ee"]);
		for name in &["bb", "cc", "dd", "ee"] {
			assert!(tree.entry_index(&format!("/{}", name)).is_some());
		}
	}

	#[test]
	fn save_load_round_trip() {
		let mut tree = DirTree::new(512);
		let a = tree.create_entry(0, "A", true, 0, 512);
		tree.create_entry(a, "file", false, 77, 512);
		{
			let file = tree.entry_index("/A/file").unwrap();
			tree.entry_mut(file).unwrap().start = 42;
		}

		let buffer = tree.save();
		assert_eq!(buffer.len(), 3 * 128);
		// root is pinned by name and type
		assert_eq!(buffer[0], b'R');
		assert_eq!(buffer[0x42], 5);
		assert_eq!(LittleEndian::read_u16(&buffer[0x40..]), 22);

		let mut reloaded = DirTree::new(512);
		reloaded.load(&buffer);
		assert_eq!(reloaded.entry_count(), 3);
		assert_eq!(reloaded.entry(0).unwrap().name, "Root Entry");
		assert!(reloaded.entry(0).unwrap().dir);
		let file = reloaded.entry_index("/A/file").unwrap();
		assert_eq!(reloaded.entry(file).unwrap().size, 77);
		assert_eq!(reloaded.entry(file).unwrap().start, 42);
		assert!(!reloaded.entry(file).unwrap().dir);
	}

	#[test]
	fn long_names_are_cut_to_31_characters() {
		let mut tree = DirTree::new(512);
		let long_name: String = ::std::iter::repeat('x').take(40).collect();
		tree.create_entry(0, &long_name, false, 0, 512);

		let buffer = tree.save();
		assert_eq!(LittleEndian::read_u16(&buffer[128 + 0x40..]), 31 * 2 + 2);

		let mut reloaded = DirTree::new(512);
		reloaded.load(&buffer);
		assert_eq!(reloaded.entry(1).unwrap().name.chars().count(), 31);
	}

	#[test]
	fn names_keep_only_the_low_utf16_byte() {
		let mut tree = DirTree::new(512);
		// U+0101 and U+0001 share the same low byte
		tree.create_entry(0, "\u{0101}bc", false, 0, 512);
		assert_eq!(tree.entry(1).unwrap().name, "\u{0001}bc");
		// a lookup with the original spelling folds the same way
		assert_eq!(tree.entry_index("/\u{0101}bc"), Some(1));
	}
}
