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

extern crate clap;
extern crate olestore;

use std::io::{Read, Seek, Write, stdin, stdout, stderr};
use std::io::{Error, ErrorKind};
use std::fs::File;
use clap::{Arg, App, AppSettings, SubCommand, ArgMatches};
use olestore::cfbf::Storage;
use olestore::io::SeekableRead;
use olestore::io::Debug;

trait ReadSeek: Read + Seek { }
impl<T> ReadSeek for T where T: Read + Seek { }

fn main() {
	let matches = App::new("oledump")
		.version("1.0")
		.author("Steve Muller <steve.muller@outlook.com>")
		.about("This utility reads an OLE structured storage container (also known as Compound File Binary File Format, COM file, or CFBF file) and lists or dumps the contained streams.")
		.setting(AppSettings::SubcommandRequired)
		.arg(Arg::with_name("verbose")
			.short("v")
			.help("Increases the debug verbosity. This will print a lot of debug messages to standard error (STDERR). Can be used up to 3 times.")
			.multiple(true)
			.takes_value(false))
		.subcommand(SubCommand::with_name("list")
			.about("Lists all streams and storages contained in the container. Each output line is a full path; storages end with a slash.")
			.arg(Arg::with_name("input")
				.value_name("FILE")
				.help("A file holding an OLE structured storage container. If omitted, the container will be read from STDIN instead.")
				.short("i")
				.long("input")
				.required(false))
		)
		.subcommand(SubCommand::with_name("dump")
			.about("Dumps a stream from the container.")
			.arg(Arg::with_name("path")
				.value_name("PATH")
				.help("The full path of the stream that shall be dumped, e.g. '/Dir1/MyStream'.")
				.short("p")
				.long("path")
				.required(true))
			.arg(Arg::with_name("output")
				.value_name("FILE")
				.help("The file where the stream shall be written to. If this parameter is not specified (or has the value '-'), the stream will be written to STDOUT instead.")
				.short("o")
				.long("output")
				.required(false))
			.arg(Arg::with_name("input")
				.value_name("FILE")
				.help("A file holding an OLE structured storage container. If omitted, the container will be read from STDIN instead.")
				.short("i")
				.long("input")
				.required(false))
		)
	.get_matches();

	let verbose = matches.occurrences_of("verbose") as i8;

	if let Err(e) = dispatch(matches, verbose) {
		eprintln!("ERROR: {}", e);
		std::process::exit(1);
	}
}

fn open_input(inputfile: &str, verbose: i8) -> Result<Storage<Box<ReadSeek>>, Error> {
	let input: Box<ReadSeek> = match inputfile {
		"" | "-" => Box::new(SeekableRead::new(stdin())?),
		_ => Box::new(File::open(inputfile)?)
	};
	Storage::open_in(input, Debug::new(stderr(), verbose))
		.map_err(|e| Error::new(ErrorKind::InvalidData, format!("{}", e)))
}

fn dispatch(matches: ArgMatches, verbose: i8) -> Result<(), Error> {
	match matches.subcommand() {
		("list", Some(submatches)) => dispatch_list(submatches, verbose),
		("dump", Some(submatches)) => dispatch_dump(submatches, verbose),
		_ => panic!("Unrecognised subcommand"),
	}
}

fn dispatch_list(matches: &ArgMatches, verbose: i8) -> Result<(), Error> {
	let inputfile = matches.value_of("input").unwrap_or("");
	let storage = open_input(inputfile, verbose)?;
	println!("/");
	list_recursive(&storage, "");
	Ok(())
}

fn list_recursive<TFile>(storage: &Storage<TFile>, pathprefix: &str) {
	let lookup = if pathprefix.is_empty() { "/" } else { pathprefix };
	for name in storage.entries(lookup) {
		let path = format!("{}/{}", pathprefix, name);
		if storage.is_directory(&path) {
			println!("{}/", path);
			list_recursive(storage, &path);
		} else {
			println!("{}", path);
		}
	}
}

fn dispatch_dump(matches: &ArgMatches, verbose: i8) -> Result<(), Error> {
	let inputfile = matches.value_of("input").unwrap_or("");
	let outputfile = matches.value_of("output").unwrap_or("");
	let path = matches.value_of("path").unwrap();

	let mut storage = open_input(inputfile, verbose)?;
	let mut output: Box<Write> = match outputfile {
		"" | "-" => Box::new(stdout()),
		_ => Box::new(File::create(outputfile)?)
	};

	let mut stream = match storage.stream(path, false, 0) {
		Some(stream) => stream,
		None => return Err(Error::new(ErrorKind::NotFound, format!("No such stream: {}", path))),
	};

	let mut buffer = [0; 512];
	loop {
		let bytes = stream.read(&mut buffer);
		if bytes == 0 {
			break;
		}
		output.write_all(&buffer[0..bytes])?;
	}
	if stream.fail() {
		return Err(Error::new(ErrorKind::Other, "I/O error while reading the stream"));
	}
	Ok(())
}
