//! Reading and writing directory records as LDIF ([RFC 2849]).
//!
//! [`LdifDirectory`] presents an LDIF stream as a [`Directory`] whose only
//! working operations are opening a file and reading its records in order.
//! Content records are supported, as are `add`, `delete` and `modify` change
//! records. Not supported are controls, `moddn`/`modrdn` changes, URL values
//! and attribute options.
//!
//! [RFC 2849]: https://www.rfc-editor.org/rfc/rfc2849.html
use std::{io::Write, path::Path};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tracing::debug;

use crate::{
	directory::{Directory, Scope},
	error::Error,
	record::{AttrValue, ChangeType, DirRecord, ModOp, Modification},
};

/// Width of the first line of a folded value; continuation lines carry one
/// column less after their leading space.
const LINE_WIDTH: usize = 80;

/// Input stream type used by [`LdifDirectory`].
type BoxedInput = Box<dyn AsyncRead + Send + Unpin>;

/// Where the parser is within the current record.
#[derive(Debug)]
enum State {
	/// Expecting an optional version, then the dn.
	NeedDn,
	/// After the dn: a changetype, control, or the first attribute.
	HadDn,
	/// Attribute values of a content or add record.
	Content,
	/// A delete record, which carries nothing but its dn.
	Delete,
	/// A moddn or modrdn record.
	ModDn,
	/// Expecting `add:`, `replace:` or `delete:` of a modify record.
	Modify,
	/// Collecting values of one change of a modify record.
	ModSpec(Modification),
}

/// Reads LDIF records from a stream, one at a time.
#[derive(Debug)]
pub struct LdifReader<R> {
	/// The underlying lines.
	lines: Lines<BufReader<R>>,
	/// A line read ahead while looking for continuations, with its number.
	next_line: Option<(usize, String)>,
	/// Number of the line being parsed.
	line: usize,
	/// Number of physical lines read.
	read: usize,
	/// Set at end of input, or after an error.
	eof: bool,
	/// The version header, if one was seen.
	version: Option<String>,
}

impl<R: AsyncRead + Unpin> LdifReader<R> {
	/// Read LDIF from `reader`.
	pub fn new(reader: R) -> Self {
		Self {
			lines: BufReader::new(reader).lines(),
			next_line: None,
			line: 0,
			read: 0,
			eof: false,
			version: None,
		}
	}

	/// Number of the line being parsed.
	#[must_use]
	pub fn line(&self) -> usize {
		self.line
	}

	/// Whether the end of the input was reached.
	#[must_use]
	pub fn is_eof(&self) -> bool {
		self.eof && self.next_line.is_none()
	}

	/// Read the next record. Returns `None` at the end of the input.
	///
	/// After an error the remainder of the input is skipped.
	pub async fn read_record(&mut self) -> Result<Option<DirRecord>, Error> {
		let result = self.parse_record().await;
		if result.is_err() {
			self.skip();
		}
		result
	}

	/// Parse lines up to the blank line terminating a record.
	async fn parse_record(&mut self) -> Result<Option<DirRecord>, Error> {
		let mut record = DirRecord::default();
		let mut state = State::NeedDn;
		let mut some_data = false;

		while let Some(line) = self.read_full_line().await? {
			if line.is_empty() {
				if some_data {
					break;
				}
				continue;
			}
			if line.starts_with('#') {
				continue;
			}
			if line == "-" {
				state = match state {
					State::ModSpec(change) => {
						record.mods.push(change);
						State::Modify
					}
					_ => return Err(self.invalid("Unexpected change separator")),
				};
				continue;
			}

			let (attr, value) = self.split_line(&line)?;
			if attr == "version" && matches!(state, State::NeedDn) {
				self.set_version(&value)?;
				continue;
			}
			state = self.add_attr_value(&mut record, state, &attr, value)?;
			some_data = true;
		}

		if matches!(state, State::ModSpec(_)) {
			return Err(self.invalid("Unterminated change"));
		}
		Ok(some_data.then_some(record))
	}

	/// Handle one `<name>: <value>` line according to the current state.
	fn add_attr_value(
		&self,
		record: &mut DirRecord,
		state: State,
		attr: &str,
		value: AttrValue,
	) -> Result<State, Error> {
		match state {
			State::NeedDn if attr == "dn" => {
				record.dn = self.text(value)?;
				Ok(State::HadDn)
			}
			State::NeedDn => Err(self.invalid("Expected dn")),
			State::HadDn if attr == "control" => Err(self.invalid("controls unimplemented")),
			State::HadDn if attr == "changetype" => {
				record.is_content = false;
				let kind = self.text(value)?;
				let (change_type, state) = match kind.to_ascii_lowercase().as_str() {
					"add" => (ChangeType::Add, State::Content),
					"delete" => (ChangeType::Delete, State::Delete),
					"modify" => (ChangeType::Modify, State::Modify),
					"modrdn" | "moddn" => (ChangeType::ModDn, State::ModDn),
					_ => return Err(self.invalid(&format!("invalid changetype {kind}"))),
				};
				record.change_type = Some(change_type);
				Ok(state)
			}
			State::HadDn | State::Content => {
				record.add_value(attr, value);
				Ok(State::Content)
			}
			State::Delete => Err(self.invalid("Should have no values for delete")),
			State::ModDn => Err(self.invalid("changetype: mod(r)dn unimplemented")),
			State::Modify => {
				let AttrValue::Text(name) = value else {
					return Err(self.invalid("Invalid LDIF mod-spec"));
				};
				let op = match attr {
					"add" => ModOp::Add,
					"replace" => ModOp::Replace,
					"delete" => ModOp::Remove,
					_ => return Err(self.invalid("Invalid LDIF mod-spec changetype")),
				};
				Ok(State::ModSpec(Modification { op, attr: name, values: Vec::new() }))
			}
			State::ModSpec(mut change) => {
				if !change.attr.eq_ignore_ascii_case(attr) {
					return Err(self.invalid("Invalid LDIF mod-spec: attribute name mismatch"));
				}
				change.values.push(value);
				Ok(State::ModSpec(change))
			}
		}
	}

	/// Record the version header. Only version 1 exists.
	fn set_version(&mut self, value: &AttrValue) -> Result<(), Error> {
		if self.version.is_some() {
			return Err(self.invalid("Repeated version record"));
		}
		if value.as_str() != Some("1") {
			return Err(self.invalid("Invalid LDIF version"));
		}
		self.version = Some("1".to_owned());
		Ok(())
	}

	/// Split a line into its lower cased attribute name and value.
	fn split_line(&self, line: &str) -> Result<(String, AttrValue), Error> {
		let Some((attr, rest)) = line.split_once(':').filter(|(attr, _)| !attr.is_empty()) else {
			return Err(self.invalid("Expected attribute"));
		};
		let attr = attr.to_ascii_lowercase();
		let value = if let Some(encoded) = rest.strip_prefix(':') {
			let bytes = STANDARD
				.decode(encoded.trim())
				.map_err(|err| self.invalid(&format!("Invalid base64 value: {err}")))?;
			match String::from_utf8(bytes) {
				Ok(text) => AttrValue::Text(text),
				Err(err) => AttrValue::Binary(err.into_bytes()),
			}
		} else if rest.starts_with('<') {
			return Err(self.invalid("url value unimplemented"));
		} else {
			AttrValue::Text(rest.trim_start_matches(' ').to_owned())
		};
		Ok((attr, value))
	}

	/// Require a textual value.
	fn text(&self, value: AttrValue) -> Result<String, Error> {
		match value {
			AttrValue::Text(text) => Ok(text),
			AttrValue::Binary(_) => Err(self.invalid("Value is not valid UTF-8")),
		}
	}

	/// Read a logical line, joining folded continuation lines.
	async fn read_full_line(&mut self) -> Result<Option<String>, Error> {
		let (number, mut line) = match self.next_line.take() {
			Some(next) => next,
			None => match self.read_line().await? {
				Some(line) => (self.read, line),
				None => return Ok(None),
			},
		};
		self.line = number;
		if line.starts_with(' ') {
			return Err(self.invalid("Invalid LDIF data"));
		}

		loop {
			match self.read_line().await? {
				Some(next) if !line.is_empty() && next.starts_with(' ') => {
					line.push_str(&next[1..]);
				}
				next => {
					self.next_line = next.map(|next| (self.read, next));
					break;
				}
			}
		}
		Ok(Some(line))
	}

	/// Read a physical line, without its terminator.
	async fn read_line(&mut self) -> Result<Option<String>, Error> {
		if self.eof {
			return Ok(None);
		}
		match self.lines.next_line().await? {
			Some(mut line) => {
				self.read += 1;
				if line.ends_with('\r') {
					line.pop();
				}
				Ok(Some(line))
			}
			None => {
				self.eof = true;
				Ok(None)
			}
		}
	}

	/// Discard the rest of the input.
	fn skip(&mut self) {
		self.eof = true;
		self.next_line = None;
	}

	/// An error for the current position.
	fn invalid(&self, message: &str) -> Error {
		Error::Ldif { line: self.line, message: message.to_owned() }
	}
}

/// A [`Directory`] reading records from an LDIF stream.
///
/// [`Directory::search`] opens the file named by its base, ignoring filter
/// and scope. Writing operations are not supported.
#[derive(Default)]
pub struct LdifDirectory {
	/// The stream being read.
	input: Option<LdifReader<BoxedInput>>,
}

impl std::fmt::Debug for LdifDirectory {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("LdifDirectory")
			.field("open", &self.input.is_some())
			.field("line", &self.input.as_ref().map(LdifReader::line))
			.finish()
	}
}

impl LdifDirectory {
	/// A directory without input. Records become available after a search.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// A directory reading records from `reader`.
	pub fn from_reader(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
		Self { input: Some(LdifReader::new(Box::new(reader))) }
	}

	/// A directory reading records from the file at `path`.
	pub async fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
		Ok(Self::from_reader(tokio::fs::File::open(path).await?))
	}
}

#[async_trait]
impl Directory for LdifDirectory {
	async fn reinit(&mut self) -> Result<(), Error> {
		Ok(())
	}

	async fn search(
		&mut self,
		base: &str,
		_filter: Option<&str>,
		_scope: Scope,
	) -> Result<bool, Error> {
		debug!(path = base, "Ldif: About to open");
		self.input = None;
		let file = tokio::fs::File::open(base).await?;
		self.input = Some(LdifReader::new(Box::new(file)));
		Ok(true)
	}

	async fn next_record(&mut self) -> Result<Option<DirRecord>, Error> {
		let input = self.input.as_mut().ok_or(Error::NoOpenSearch)?;
		let next = input.read_record().await;
		if !matches!(next, Ok(Some(_))) {
			self.input = None;
		}
		next
	}

	async fn create(&mut self, _record: &DirRecord) -> Result<bool, Error> {
		Err(Error::Unsupported("ldif create not implemented"))
	}

	async fn replace_values(
		&mut self,
		_dn: &str,
		_attr: &str,
		_values: Vec<AttrValue>,
	) -> Result<(), Error> {
		Err(Error::Unsupported("ldif replace not implemented"))
	}

	async fn replace_value(
		&mut self,
		_dn: &str,
		_attr: &str,
		_old: AttrValue,
		_new: AttrValue,
	) -> Result<(), Error> {
		Err(Error::Unsupported("ldif replace not implemented"))
	}

	async fn modify(&mut self, _dn: &str, _mods: &[Modification]) -> Result<(), Error> {
		Err(Error::Unsupported("ldif modify not implemented"))
	}

	async fn destroy(&mut self, _dn: &str) -> Result<(), Error> {
		Err(Error::Unsupported("Cannot delete an ldif stream record"))
	}

	async fn close(&mut self) {
		self.input = None;
	}
}

/// Write a record as LDIF, terminated by a blank line.
///
/// Values which are not safe strings are base64 encoded, and long lines are
/// folded.
pub fn write_record<W: Write>(out: &mut W, record: &DirRecord) -> Result<(), Error> {
	if record.dn.is_empty() {
		return Err(Error::Invalid("Unable to get dn".to_owned()));
	}
	write_value(out, "dn", record.dn.as_bytes())?;

	let change_type = if record.is_content { None } else { record.change_type };
	if let Some(change_type) = change_type {
		writeln!(out, "changetype: {}", change_type.as_str())?;
	}

	match change_type {
		None | Some(ChangeType::Add) => {
			for attr in record.attrs() {
				for value in &attr.values {
					write_value(out, &attr.name, value.as_bytes())?;
				}
			}
		}
		Some(ChangeType::Modify) => {
			for change in &record.mods {
				let op = match change.op {
					ModOp::Add => "add",
					ModOp::Replace => "replace",
					ModOp::Remove => "delete",
				};
				writeln!(out, "{op}: {}", change.attr)?;
				for value in &change.values {
					write_value(out, &change.attr, value.as_bytes())?;
				}
				writeln!(out, "-")?;
			}
		}
		Some(ChangeType::Delete | ChangeType::ModDn) => {}
	}

	writeln!(out)?;
	Ok(())
}

/// Write `name: value`, or `name:: base64` for unsafe values, folded.
fn write_value<W: Write>(out: &mut W, name: &str, value: &[u8]) -> Result<(), Error> {
	let line = match std::str::from_utf8(value) {
		Ok(text) if is_safe_string(text) => format!("{name}: {text}"),
		_ => format!("{name}:: {}", STANDARD.encode(value)),
	};

	let mut rest = line.as_str();
	let mut width = LINE_WIDTH;
	let mut first = true;
	while !rest.is_empty() || first {
		let mut split = width.min(rest.len());
		while !rest.is_char_boundary(split) {
			split -= 1;
		}
		let (segment, tail) = rest.split_at(split);
		if first {
			writeln!(out, "{segment}")?;
		} else {
			writeln!(out, " {segment}")?;
		}
		rest = tail;
		width = LINE_WIDTH - 1;
		first = false;
	}
	Ok(())
}

/// Whether a value can be written without encoding: printable ASCII, not
/// starting with a space, colon or `<`, and not ending with a space.
fn is_safe_string(value: &str) -> bool {
	let bytes = value.as_bytes();
	if matches!(bytes.first(), Some(b' ' | b':' | b'<')) || bytes.last() == Some(&b' ') {
		return false;
	}
	bytes.iter().all(|byte| (0x20..0x7f).contains(byte))
}
