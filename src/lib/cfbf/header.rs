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

use byteorder::{ByteOrder, LittleEndian};

use super::alloc::AllocTable;

/// The magic bytes identifying a CFBF container.
pub const MAGIC: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

/// The fixed 512-byte prologue of a container file: magic identifier,
/// sector size exponents, the start sectors of the management chains, and
/// the first 109 FAT sector locations.
pub struct Header {
	/// Signature, or magic identifier.
	pub id: [u8; 8],
	/// Size of big sectors in power-of-two; typically 9 indicating 512-byte sectors.
	pub b_shift: u16,
	/// Size of small sectors in power-of-two; typically 6 indicating 64-byte sectors.
	pub s_shift: u16,
	/// Number of sectors allocated for the big FAT.
	pub num_bat: u32,
	/// First sector of the directory chain.
	pub dirent_start: u32,
	/// Maximum size for a small stream; must be 4096 bytes.
	pub threshold: u32,
	/// First sector of the small FAT chain.
	pub sbat_start: u32,
	/// Number of sectors allocated for the small FAT.
	pub num_sbat: u32,
	/// First sector of the meta FAT (DIFAT) chain.
	pub mbat_start: u32,
	/// Number of sectors allocated for the meta FAT.
	pub num_mbat: u32,
	/// The locations of the first 109 FAT sectors, stored inline.
	pub bb_blocks: [u32; 109],
	/// Needs to be written.
	pub dirty: bool,
}

impl Header {
	pub fn new() -> Header {
		Header {
			id: MAGIC,
			b_shift: 9,
			s_shift: 6,
			num_bat: 0,
			dirent_start: 0,
			threshold: 4096,
			sbat_start: 0,
			num_sbat: 0,
			mbat_start: AllocTable::EOF,
			num_mbat: 0,
			bb_blocks: [AllocTable::AVAIL; 109],
			dirty: true,
		}
	}

	pub fn big_block_size(&self) -> u32 {
		1 << self.b_shift
	}

	pub fn small_block_size(&self) -> u32 {
		1 << self.s_shift
	}

	/// Internal consistency check for a freshly loaded header.
	pub fn valid(&self) -> bool {
		if self.threshold != 4096 {
			return false;
		}
		if self.num_bat == 0 {
			return false;
		}
		if self.num_bat < 109 && self.num_mbat != 0 {
			return false;
		}
		if self.s_shift > self.b_shift {
			return false;
		}
		if self.b_shift <= 6 {
			return false;
		}
		if self.b_shift >= 31 {
			return false;
		}
		true
	}

	pub fn load(&mut self, buffer: &[u8; 512]) {
		self.id.copy_from_slice(&buffer[0..8]);
		self.b_shift = LittleEndian::read_u16(&buffer[0x1E..]);
		self.s_shift = LittleEndian::read_u16(&buffer[0x20..]);
		self.num_bat = LittleEndian::read_u32(&buffer[0x2C..]);
		self.dirent_start = LittleEndian::read_u32(&buffer[0x30..]);
		self.threshold = LittleEndian::read_u32(&buffer[0x38..]);
		self.sbat_start = LittleEndian::read_u32(&buffer[0x3C..]);
		self.num_sbat = LittleEndian::read_u32(&buffer[0x40..]);
		self.mbat_start = LittleEndian::read_u32(&buffer[0x44..]);
		self.num_mbat = LittleEndian::read_u32(&buffer[0x48..]);
		for i in 0..109 {
			self.bb_blocks[i] = LittleEndian::read_u32(&buffer[0x4C + i * 4..]);
		}
		self.dirty = false;
	}

	pub fn save(&mut self, buffer: &mut [u8; 512]) {
		for byte in buffer.iter_mut() {
			*byte = 0;
		}
		buffer[0..8].copy_from_slice(&MAGIC);
		LittleEndian::write_u16(&mut buffer[0x18..], 0xFFFE); // byte-order marker
		LittleEndian::write_u16(&mut buffer[0x1A..], 0x003E); // minor version
		LittleEndian::write_u16(&mut buffer[0x1C..], 3); // major version
		LittleEndian::write_u16(&mut buffer[0x1E..], self.b_shift);
		LittleEndian::write_u16(&mut buffer[0x20..], self.s_shift);
		LittleEndian::write_u32(&mut buffer[0x2C..], self.num_bat);
		LittleEndian::write_u32(&mut buffer[0x30..], self.dirent_start);
		LittleEndian::write_u32(&mut buffer[0x38..], self.threshold);
		LittleEndian::write_u32(&mut buffer[0x3C..], self.sbat_start);
		LittleEndian::write_u32(&mut buffer[0x40..], self.num_sbat);
		LittleEndian::write_u32(&mut buffer[0x44..], self.mbat_start);
		LittleEndian::write_u32(&mut buffer[0x48..], self.num_mbat);
		for i in 0..109 {
			LittleEndian::write_u32(&mut buffer[0x4C + i * 4..], self.bb_blocks[i]);
		}
		self.dirty = false;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn save_load_round_trip() {
		let mut header = Header::new();
		header.num_bat = 1;
		header.dirent_start = 1;
		header.sbat_start = 2;
		header.num_sbat = 1;
		header.bb_blocks[0] = 0;

		let mut buffer = [0u8; 512];
		header.save(&mut buffer);
		assert!(!header.dirty);

		assert_eq!(&buffer[0..8], &MAGIC);
		assert_eq!(LittleEndian::read_u16(&buffer[0x18..]), 0xFFFE);
		assert_eq!(LittleEndian::read_u16(&buffer[0x1A..]), 0x003E);
		assert_eq!(LittleEndian::read_u16(&buffer[0x1C..]), 3);
		assert_eq!(LittleEndian::read_u32(&buffer[0x38..]), 4096);

		let mut reloaded = Header::new();
		reloaded.load(&buffer);
		assert_eq!(reloaded.b_shift, 9);
		assert_eq!(reloaded.s_shift, 6);
		assert_eq!(reloaded.num_bat, 1);
		assert_eq!(reloaded.dirent_start, 1);
		assert_eq!(reloaded.sbat_start, 2);
		assert_eq!(reloaded.num_sbat, 1);
		assert_eq!(reloaded.mbat_start, AllocTable::EOF);
		assert_eq!(reloaded.bb_blocks[0], 0);
		assert_eq!(reloaded.bb_blocks[1], AllocTable::AVAIL);
		assert!(reloaded.valid());
	}

	#[test]
	fn rejects_inconsistent_headers() {
		let mut header = Header::new();
		header.num_bat = 1;

		header.threshold = 512;
		assert!(!header.valid());
		header.threshold = 4096;
		assert!(header.valid());

		header.num_bat = 0;
		assert!(!header.valid());
		header.num_bat = 1;

		header.s_shift = 10;
		assert!(!header.valid());
		header.s_shift = 6;

		header.b_shift = 6;
		assert!(!header.valid());
		header.b_shift = 31;
		assert!(!header.valid());
		header.b_shift = 9;

		header.num_mbat = 1;
		assert!(!header.valid());
	}
}
