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

use std::io::{Read, Seek, SeekFrom, Write};
use std::io::Error;
use std::io::Stderr;

/// Wraps a non-seekable input (such as STDIN) by reading it to the end up front.
/// Container files are addressed by sector and thus require a seekable transport.
pub struct SeekableRead {
	data: Vec<u8>,
	index: u64,
}

impl SeekableRead {
	pub fn new(mut read: impl Read) -> Result<SeekableRead, Error> {
		let mut data: Vec<u8> = Vec::new();
		read.read_to_end(&mut data)?;
		Ok(SeekableRead { data, index: 0 })
	}
}

impl Read for SeekableRead {
	fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
		if self.index >= self.data.len() as u64 {
			return Ok(0);
		}
		let bytes = (&self.data[self.index as usize..]).read(buf)?;
		self.index += bytes as u64;
		Ok(bytes)
	}
}

impl Seek for SeekableRead {
	fn seek(&mut self, pos: SeekFrom) -> Result<u64, Error> {
		match pos {
			SeekFrom::Start(i) => self.index = i,
			SeekFrom::Current(i) => self.index = (self.index as i64 + i) as u64,
			SeekFrom::End(i) => self.index = (self.data.len() as i64 + i) as u64,
		}
		Ok(self.index)
	}
}

/// A leveled logger for debug output on standard error (STDERR).
/// Level 0 is silent; levels 1 to 3 print increasingly chatty messages
/// (1 = container operations, 2 = object operations, 3 = sector operations).
pub struct Debug {
	output: Stderr,
	level: i8,
}

impl Debug {
	pub fn new(output: Stderr, level: i8) -> Debug {
		Debug { output, level }
	}

	/// Returns whether a message of the given level would be printed.
	/// Use this to avoid formatting messages that would be discarded anyway.
	pub fn enabled(&self, level: i8) -> bool {
		self.level >= level
	}

	pub fn log(&mut self, level: i8, string: String) {
		if self.level >= level {
			self.output.write_all(string.as_bytes()).unwrap();
		}
	}

	pub fn logln(&mut self, level: i8, string: String) {
		if self.level >= level {
			self.output.write_all(string.as_bytes()).unwrap();
			self.output.write_all(&[0x0A]).unwrap();
		}
	}
}
