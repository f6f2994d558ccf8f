//! Error codes

/// Errors that can occur when using this library
#[derive(thiserror::Error, Debug)]
pub enum Error {
	/// Connection properties or settings were missing or malformed.
	#[error("Invalid configuration: {0}")]
	Config(String),
	/// The directory could not be reached, or binding to it failed.
	#[error("Connection failed: {0}")]
	Connection(String),
	/// A directory operation failed. Carries the message reported by the
	/// backend.
	#[error("Directory error: {0}")]
	Directory(String),
	/// [`Directory::next_record`](crate::Directory::next_record) was called
	/// without an open search.
	#[error("No open search")]
	NoOpenSearch,
	/// The backend does not implement the requested operation.
	#[error("Unsupported operation: {0}")]
	Unsupported(&'static str),
	/// The contents of an attribute did not conform to the expected syntax.
	#[error("Malformed data: {0}")]
	Invalid(String),
	/// LDIF input could not be parsed.
	#[error("Invalid LDIF data at line {line}: {message}")]
	Ldif {
		/// Number of the last line read.
		line: usize,
		/// Description of the problem.
		message: String,
	},
	/// Reading a file failed.
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

impl From<ldap3::LdapError> for Error {
	fn from(err: ldap3::LdapError) -> Self {
		Error::Directory(err.to_string())
	}
}
