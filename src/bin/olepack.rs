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

use std::io::{Read, stdin, stderr};
use std::io::{Error, ErrorKind};
use std::fs::File;
use clap::{Arg, App, AppSettings, SubCommand, ArgMatches};
use olestore::cfbf::Storage;
use olestore::io::Debug;

fn main() {
	let matches = App::new("olepack")
		.version("1.0")
		.author("Steve Muller <steve.muller@outlook.com>")
		.about("This utility modifies an OLE structured storage container (also known as Compound File Binary File Format, COM file, or Structured Storage file): it creates containers and inserts, removes, or organises the contained streams.")
		.setting(AppSettings::SubcommandRequired)
		.arg(Arg::with_name("verbose")
			.short("v")
			.help("Increases the debug verbosity. This will print a lot of debug messages to standard error (STDERR). Can be used up to 3 times.")
			.multiple(true)
			.takes_value(false))
		.subcommand(SubCommand::with_name("new")
			.about("Creates a new, empty container file. An existing file is overwritten.")
			.arg(Arg::with_name("container")
				.value_name("FILE")
				.help("The container file to create.")
				.required(true))
		)
		.subcommand(SubCommand::with_name("put")
			.about("Stores a file as a stream in the container. Missing parent storages are created along the way.")
			.arg(Arg::with_name("container")
				.value_name("FILE")
				.help("The container file to modify.")
				.required(true))
			.arg(Arg::with_name("path")
				.value_name("PATH")
				.help("The full path of the stream inside the container, e.g. '/Dir1/MyStream'.")
				.short("p")
				.long("path")
				.required(true))
			.arg(Arg::with_name("input")
				.value_name("FILE")
				.help("The file whose contents shall be stored. If this parameter is not specified (or has the value '-'), the contents are read from STDIN instead.")
				.short("i")
				.long("input")
				.required(false))
		)
		.subcommand(SubCommand::with_name("mkdir")
			.about("Creates a storage (and any missing parent storages) in the container.")
			.arg(Arg::with_name("container")
				.value_name("FILE")
				.help("The container file to modify.")
				.required(true))
			.arg(Arg::with_name("path")
				.value_name("PATH")
				.help("The full path of the storage inside the container, e.g. '/Dir1/Dir2'.")
				.short("p")
				.long("path")
				.required(true))
		)
		.subcommand(SubCommand::with_name("rm")
			.about("Removes a stream or storage from the container. Storages are removed recursively.")
			.arg(Arg::with_name("container")
				.value_name("FILE")
				.help("The container file to modify.")
				.required(true))
			.arg(Arg::with_name("path")
				.value_name("PATH")
				.help("The full path of the stream or storage inside the container.")
				.short("p")
				.long("path")
				.required(true))
		)
	.get_matches();

	let verbose = matches.occurrences_of("verbose") as i8;

	if let Err(e) = dispatch(matches, verbose) {
		eprintln!("ERROR: {}", e);
		std::process::exit(1);
	}
}

fn dispatch(matches: ArgMatches, verbose: i8) -> Result<(), Error> {
	match matches.subcommand() {
		("new", Some(submatches)) => dispatch_new(submatches, verbose),
		("put", Some(submatches)) => dispatch_put(submatches, verbose),
		("mkdir", Some(submatches)) => dispatch_mkdir(submatches, verbose),
		("rm", Some(submatches)) => dispatch_rm(submatches, verbose),
		_ => panic!("Unrecognised subcommand"),
	}
}

fn open_container(containerfile: &str, create: bool, verbose: i8) -> Result<Storage<File>, Error> {
	Storage::open(containerfile, true, create, Debug::new(stderr(), verbose))
		.map_err(|e| Error::new(ErrorKind::InvalidData, format!("{}", e)))
}

fn dispatch_new(matches: &ArgMatches, verbose: i8) -> Result<(), Error> {
	let containerfile = matches.value_of("container").unwrap();
	let mut storage = open_container(containerfile, true, verbose)?;
	storage.flush()?;
	Ok(())
}

fn dispatch_put(matches: &ArgMatches, verbose: i8) -> Result<(), Error> {
	let containerfile = matches.value_of("container").unwrap();
	let inputfile = matches.value_of("input").unwrap_or("");
	let path = matches.value_of("path").unwrap();

	let mut contents: Vec<u8> = Vec::new();
	match inputfile {
		"" | "-" => { stdin().read_to_end(&mut contents)?; },
		_ => { File::open(inputfile)?.read_to_end(&mut contents)?; },
	};

	let mut storage = open_container(containerfile, false, verbose)?;
	{
		let mut stream = match storage.stream(path, true, contents.len() as u32) {
			Some(stream) => stream,
			None => return Err(Error::new(ErrorKind::InvalidInput, format!("Cannot create stream: {}", path))),
		};
		// an existing stream may be longer than the new contents
		stream.set_size(contents.len() as u32);
		let written = stream.write_at(0, &contents);
		if written < contents.len() || stream.fail() {
			return Err(Error::new(ErrorKind::Other, format!("Short write: {} of {} bytes", written, contents.len())));
		}
	}
	storage.flush()?;
	Ok(())
}

fn dispatch_mkdir(matches: &ArgMatches, verbose: i8) -> Result<(), Error> {
	let containerfile = matches.value_of("container").unwrap();
	let path = matches.value_of("path").unwrap();

	let mut storage = open_container(containerfile, false, verbose)?;
	if !storage.create_storage(path) {
		return Err(Error::new(ErrorKind::InvalidInput, format!("Cannot create storage: {}", path)));
	}
	storage.flush()?;
	Ok(())
}

fn dispatch_rm(matches: &ArgMatches, verbose: i8) -> Result<(), Error> {
	let containerfile = matches.value_of("container").unwrap();
	let path = matches.value_of("path").unwrap();

	let mut storage = open_container(containerfile, false, verbose)?;
	if !storage.delete_by_name(path) {
		return Err(Error::new(ErrorKind::NotFound, format!("No such stream or storage: {}", path)));
	}
	Ok(())
}
