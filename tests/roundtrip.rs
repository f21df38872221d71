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

extern crate byteorder;
extern crate olestore;

use std::io::Cursor;
use std::io::stderr;

use byteorder::{ByteOrder, LittleEndian};
use olestore::cfbf::{OpenError, Storage};
use olestore::io::Debug;

fn quiet() -> Debug {
	Debug::new(stderr(), 0)
}

fn pattern(len: usize) -> Vec<u8> {
	(0..len).map(|i| (i % 251) as u8).collect()
}

/// Creates a container holding one patterned stream per path and returns the
/// serialized container bytes.
fn build_container(streams: &[(&str, usize)]) -> Vec<u8> {
	let mut storage = Storage::create_in(Cursor::new(Vec::new()), quiet());
	for &(path, len) in streams {
		let data = pattern(len);
		let written = {
			let mut stream = storage.stream(path, true, len as u32).unwrap();
			stream.write_at(0, &data)
		};
		assert_eq!(written, len, "short write for {}", path);
	}
	storage.flush().unwrap();
	storage.close().into_inner()
}

fn read_stream(storage: &mut Storage<Cursor<Vec<u8>>>, path: &str) -> Vec<u8> {
	let mut stream = storage.stream(path, false, 0).unwrap();
	let len = stream.size() as usize;
	let mut data = vec![0u8; len];
	let bytes = stream.read(&mut data);
	assert_eq!(bytes, len, "short read for {}", path);
	data
}

#[test]
fn bytes_survive_a_round_trip() {
	// sizes on both sides of sector and threshold boundaries; 4095, 4096 and
	// 4097 exercise the small/big pool decision
	for &len in &[1usize, 11, 63, 64, 65, 500, 4095, 4096, 4097, 20000] {
		let bytes = build_container(&[("/data", len)]);
		let mut storage = Storage::open_in(Cursor::new(bytes), quiet()).unwrap();
		assert_eq!(read_stream(&mut storage, "/data"), pattern(len), "length {}", len);
	}
}

#[test]
fn several_streams_do_not_disturb_each_other() {
	let streams: &[(&str, usize)] = &[
		("/small", 100),
		("/medium", 4000),
		("/big", 10000),
		("/dir/inner", 777),
	];
	let bytes = build_container(streams);
	let mut storage = Storage::open_in(Cursor::new(bytes), quiet()).unwrap();
	for &(path, len) in streams {
		assert_eq!(read_stream(&mut storage, path), pattern(len), "stream {}", path);
	}
}

#[test]
fn growing_a_stream_across_the_threshold_migrates_it() {
	let mut storage = Storage::create_in(Cursor::new(Vec::new()), quiet());
	let data = pattern(4097);
	{
		let mut stream = storage.stream("/data", true, 0).unwrap();
		// stays in the small pool first
		assert_eq!(stream.write_at(0, &data[..4095]), 4095);
		assert_eq!(stream.size(), 4095);
		// two more bytes push it over the threshold
		assert_eq!(stream.write_at(4095, &data[4095..]), 2);
		assert_eq!(stream.size(), 4097);
	}
	storage.flush().unwrap();

	let bytes = storage.close().into_inner();
	let mut reopened = Storage::open_in(Cursor::new(bytes), quiet()).unwrap();
	assert_eq!(read_stream(&mut reopened, "/data"), data);
}

#[test]
fn shrinking_a_stream_across_the_threshold_migrates_it_back() {
	let mut storage = Storage::create_in(Cursor::new(Vec::new()), quiet());
	let data = pattern(8192);
	{
		let mut stream = storage.stream("/data", true, data.len() as u32).unwrap();
		assert_eq!(stream.write_at(0, &data), data.len());
		stream.set_size(100);
		assert_eq!(stream.size(), 100);
	}
	storage.flush().unwrap();

	let bytes = storage.close().into_inner();
	let mut reopened = Storage::open_in(Cursor::new(bytes), quiet()).unwrap();
	assert_eq!(read_stream(&mut reopened, "/data"), &pattern(8192)[..100]);
}

#[test]
fn create_then_delete_restores_the_allocation_state() {
	let mut storage = Storage::create_in(Cursor::new(Vec::new()), quiet());
	{
		let data = pattern(1000);
		let mut stream = storage.stream("/x", true, 1000).unwrap();
		stream.write_at(0, &data);
	}
	storage.flush().unwrap();
	let with_x = storage.stats();

	assert!(storage.delete_by_name("/x"));
	assert!(!storage.exists("/x"));

	{
		let data = pattern(1000);
		let mut stream = storage.stream("/y", true, 1000).unwrap();
		stream.write_at(0, &data);
	}
	storage.flush().unwrap();
	let with_y = storage.stats();

	// the allocator is first-fit on freed sectors, so /y reuses what /x
	// occupied and the occupancy counters come out identical
	assert_eq!(with_x, with_y);

	let mut reopened = Storage::open_in(Cursor::new(storage.close().into_inner()), quiet()).unwrap();
	assert_eq!(read_stream(&mut reopened, "/y"), pattern(1000));
}

#[test]
fn creation_order_does_not_change_the_name_sets() {
	let order1 = build_container(&[("/aaa", 10), ("/bb", 20), ("/c", 30), ("/dddd", 40)]);
	let order2 = build_container(&[("/dddd", 40), ("/c", 30), ("/bb", 20), ("/aaa", 10)]);

	let storage1 = Storage::open_in(Cursor::new(order1), quiet()).unwrap();
	let storage2 = Storage::open_in(Cursor::new(order2), quiet()).unwrap();

	// both listings come back in sibling order, so they are equal as lists
	assert_eq!(storage1.entries("/"), storage2.entries("/"));
	assert_eq!(storage1.entries("/"), vec!["c", "bb", "aaa", "dddd"]);

	let mut storage1 = storage1;
	let mut storage2 = storage2;
	for &(path, len) in &[("/aaa", 10usize), ("/bb", 20), ("/c", 30), ("/dddd", 40)] {
		assert_eq!(read_stream(&mut storage1, path), pattern(len));
		assert_eq!(read_stream(&mut storage2, path), pattern(len));
	}
}

#[test]
fn many_small_streams_grow_the_small_fat() {
	// 40 streams of 500 bytes occupy 320 small sectors, which is more than
	// one sector's worth of small-FAT entries
	let streams: Vec<(String, usize)> = (0..40).map(|i| (format!("/s{:02}", i), 500)).collect();
	let mut storage = Storage::create_in(Cursor::new(Vec::new()), quiet());
	for &(ref path, len) in &streams {
		let data = pattern(len);
		let written = {
			let mut stream = storage.stream(path, true, len as u32).unwrap();
			stream.write_at(0, &data)
		};
		assert_eq!(written, len, "short write for {}", path);
	}
	storage.flush().unwrap();
	assert!(storage.stats().small_blocks >= 320);

	let bytes = storage.close().into_inner();
	assert!(LittleEndian::read_u32(&bytes[0x40..]) >= 2); // num_sbat
	let mut reopened = Storage::open_in(Cursor::new(bytes), quiet()).unwrap();
	assert_eq!(reopened.entries("/").len(), 40);
	for &(ref path, len) in &streams {
		assert_eq!(read_stream(&mut reopened, path), pattern(len), "stream {}", path);
	}
}

#[test]
fn deleting_a_storage_removes_the_whole_subtree() {
	let bytes = build_container(&[("/A/B/one", 100), ("/A/B/two", 5000), ("/A/three", 10), ("/keep", 7)]);
	let mut storage = Storage::open_in_rw(Cursor::new(bytes), quiet()).unwrap();

	assert!(storage.delete_by_name("/A"));
	assert!(!storage.exists("/A"));
	assert!(!storage.exists("/A/B"));
	assert!(!storage.exists("/A/B/one"));
	assert!(storage.exists("/keep"));
	assert_eq!(storage.entries("/"), vec!["keep"]);

	let mut reopened = Storage::open_in(Cursor::new(storage.close().into_inner()), quiet()).unwrap();
	assert!(!reopened.exists("/A/B/two"));
	assert_eq!(read_stream(&mut reopened, "/keep"), pattern(7));
}

#[test]
fn read_only_containers_reject_modification() {
	let bytes = build_container(&[("/data", 100)]);
	let mut storage = Storage::open_in(Cursor::new(bytes), quiet()).unwrap();
	assert!(!storage.is_writeable());

	// creation resolves to nothing, deletion reports failure
	assert!(storage.stream("/new", true, 10).is_none());
	assert!(!storage.exists("/new"));
	assert!(!storage.delete_by_name("/data"));
	assert!(storage.exists("/data"));

	// writing through an opened stream is silently ignored
	let mut stream = storage.stream("/data", false, 0).unwrap();
	assert_eq!(stream.write_at(0, b"xxxx"), 0);
	stream.set_size(1);
	assert_eq!(stream.size(), 100);
}

#[test]
fn streams_track_cursor_eof_and_fail_state() {
	let bytes = build_container(&[("/data", 100)]);
	let mut storage = Storage::open_in(Cursor::new(bytes), quiet()).unwrap();
	let mut stream = storage.stream("/data", false, 0).unwrap();
	assert_eq!(stream.full_name(), "/data");

	let mut buffer = [0u8; 60];
	assert_eq!(stream.read(&mut buffer), 60);
	assert_eq!(stream.tell(), 60);
	assert!(!stream.eof());

	// the second read is cut short at the end of the stream
	assert_eq!(stream.read(&mut buffer), 40);
	assert_eq!(stream.tell(), 100);
	assert!(stream.eof());
	assert!(!stream.fail());

	stream.seek(10);
	assert!(!stream.eof());
	assert_eq!(stream.read(&mut buffer[..10]), 10);
	assert_eq!(&buffer[..10], &pattern(100)[10..20]);
}

#[test]
fn getch_agrees_with_read() {
	let bytes = build_container(&[("/data", 5000)]);
	let mut storage = Storage::open_in(Cursor::new(bytes), quiet()).unwrap();
	let expected = pattern(5000);
	let mut stream = storage.stream("/data", false, 0).unwrap();
	for i in 0..5000 {
		assert_eq!(stream.getch(), Some(expected[i]), "byte {}", i);
	}
	assert_eq!(stream.getch(), None);
	assert!(stream.eof());
}

#[test]
fn empty_and_garbage_transports_are_rejected() {
	assert_eq!(
		Storage::open_in(Cursor::new(Vec::new()), quiet()).err(),
		Some(OpenError::NotOle)
	);
	let garbage = vec![0x42u8; 2048];
	assert_eq!(
		Storage::open_in(Cursor::new(garbage), quiet()).err(),
		Some(OpenError::NotOle)
	);
}

#[test]
fn corrupted_headers_are_rejected_as_bad_ole() {
	let mut bytes = build_container(&[("/data", 100)]);
	// break the threshold field
	bytes[0x38] = 0;
	bytes[0x39] = 1;
	assert_eq!(
		Storage::open_in(Cursor::new(bytes), quiet()).err(),
		Some(OpenError::BadOle)
	);
}

#[test]
fn truncated_chains_yield_short_reads_not_errors() {
	let bytes = build_container(&[("/data", 10000)]);
	// cut the host file short, behind the header and the management sectors
	let mut truncated = bytes;
	truncated.truncate(4096);
	let mut storage = Storage::open_in(Cursor::new(truncated), quiet()).unwrap();
	let mut stream = storage.stream("/data", false, 0).unwrap();
	let mut buffer = vec![0u8; 10000];
	let bytes_read = stream.read(&mut buffer);
	assert!(bytes_read <= 10000);
	assert!(stream.eof() || bytes_read == 10000);
}
