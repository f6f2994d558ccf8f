//! The backend independent directory interface.
use async_trait::async_trait;

use crate::{
	error::Error,
	record::{AttrValue, DirRecord, Modification},
};

/// Maximum number of records a single search produces. Further results are
/// dropped rather than reported as an error.
pub const DEFAULT_SIZE_LIMIT: usize = 1000;

/// Filter used when a search is issued without one.
pub const DEFAULT_FILTER: &str = "(objectClass=*)";

/// Breadth of a directory search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
	/// Only the entry named by the base.
	Base,
	/// The immediate children of the base.
	OneLevel,
	/// The base and all of its descendants.
	Subtree,
}

impl From<Scope> for ldap3::Scope {
	fn from(scope: Scope) -> Self {
		match scope {
			Scope::Base => ldap3::Scope::Base,
			Scope::OneLevel => ldap3::Scope::OneLevel,
			Scope::Subtree => ldap3::Scope::Subtree,
		}
	}
}

/// Access to a directory: searching, reading results one record at a time,
/// and creating, changing or removing entries.
///
/// A directory holds at most one open search. Issuing a new search discards
/// the previous one, and results are read forward only via
/// [`Directory::next_record`]. An empty result is not an error: `search`
/// returns `false` instead.
///
/// Implementations are not synchronised; share one between tasks only behind
/// external locking.
#[async_trait]
pub trait Directory: Send {
	/// (Re)establish the connection to the backend with the settings supplied
	/// at construction. Allows reuse after [`Directory::close`].
	async fn reinit(&mut self) -> Result<(), Error>;

	/// Search below `base` with the given scope. `None` as filter matches all
	/// entries.
	///
	/// Returns `true` if at least one entry matched, in which case the records
	/// can be read with [`Directory::next_record`].
	async fn search(
		&mut self,
		base: &str,
		filter: Option<&str>,
		scope: Scope,
	) -> Result<bool, Error>;

	/// Search the whole subtree below `base`.
	async fn search_sub(&mut self, base: &str, filter: Option<&str>) -> Result<bool, Error> {
		self.search(base, filter, Scope::Subtree).await
	}

	/// Search only the entry named by `base`.
	async fn search_base(&mut self, base: &str, filter: Option<&str>) -> Result<bool, Error> {
		self.search(base, filter, Scope::Base).await
	}

	/// Search the immediate children of `base`.
	async fn search_one(&mut self, base: &str, filter: Option<&str>) -> Result<bool, Error> {
		self.search(base, filter, Scope::OneLevel).await
	}

	/// Read the next record of the open search. Returns `None` once the
	/// results are exhausted, which also closes the search; calling again
	/// without a new search fails with [`Error::NoOpenSearch`].
	async fn next_record(&mut self) -> Result<Option<DirRecord>, Error>;

	/// A new, empty record for `dn`. Nothing is written until
	/// [`Directory::create`] is called with it.
	fn new_record(&self, dn: &str) -> DirRecord {
		DirRecord::new(dn)
	}

	/// Add the record to the directory. Returns `false` if an entry with the
	/// same DN already exists.
	async fn create(&mut self, record: &DirRecord) -> Result<bool, Error>;

	/// Replace an attribute with one holding only `value`.
	async fn replace(&mut self, dn: &str, attr: &str, value: AttrValue) -> Result<(), Error> {
		self.replace_values(dn, attr, vec![value]).await
	}

	/// Replace an attribute with one holding only `values`.
	async fn replace_values(
		&mut self,
		dn: &str,
		attr: &str,
		values: Vec<AttrValue>,
	) -> Result<(), Error>;

	/// Replace a single value of an attribute with another.
	async fn replace_value(
		&mut self,
		dn: &str,
		attr: &str,
		old: AttrValue,
		new: AttrValue,
	) -> Result<(), Error>;

	/// Apply the changes, in order, to a single entry.
	async fn modify(&mut self, dn: &str, mods: &[Modification]) -> Result<(), Error>;

	/// Remove an entry. Entries with children cannot be removed.
	async fn destroy(&mut self, dn: &str) -> Result<(), Error>;

	/// Release the backend. Calling it more than once is harmless.
	async fn close(&mut self);
}

#[cfg(test)]
mod tests {
	use super::Scope;

	#[test]
	fn scope_maps_to_ldap() {
		assert!(matches!(ldap3::Scope::from(Scope::Base), ldap3::Scope::Base));
		assert!(matches!(ldap3::Scope::from(Scope::OneLevel), ldap3::Scope::OneLevel));
		assert!(matches!(ldap3::Scope::from(Scope::Subtree), ldap3::Scope::Subtree));
	}
}
