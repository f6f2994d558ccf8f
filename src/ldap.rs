//! Directory backend talking to an LDAP server

use async_trait::async_trait;
use ldap3::{
	adapters::{Adapter, EntriesOnly},
	LdapConnAsync, LdapResult, SearchEntry, SearchOptions, SearchStream,
};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{
	config::{Authentication, DirectoryConfig, Properties},
	directory::{Directory, Scope, DEFAULT_FILTER},
	error::Error,
	record::{AttrValue, DirRecord, Modification},
};

/// Result code for a successful operation
const RC_SUCCESS: u32 = 0;
/// Result code of a search truncated by the size limit
const RC_SIZE_LIMIT_EXCEEDED: u32 = 4;
/// Result code when the search base does not exist
const RC_NO_SUCH_OBJECT: u32 = 32;
/// Result code when adding an entry whose DN is taken
const RC_ENTRY_ALREADY_EXISTS: u32 = 68;

/// A [`Directory`] backed by an LDAP server.
///
/// The connection is established by [`LdapDirectory::connect`] or
/// [`Directory::reinit`], and released by [`Directory::close`].
pub struct LdapDirectory {
	/// Connection settings, kept for reconnecting.
	config: DirectoryConfig,
	/// Handle of the bound connection.
	ldap: Option<ldap3::Ldap>,
	/// The task driving the connection.
	driver: Option<JoinHandle<()>>,
	/// The open search, if any.
	cursor: Option<Cursor>,
}

impl std::fmt::Debug for LdapDirectory {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("LdapDirectory")
			.field("url", &self.config.url.as_str())
			.field("principal", &self.config.principal)
			.field("connected", &self.ldap.is_some())
			.field("cursor", &self.cursor)
			.finish()
	}
}

impl LdapDirectory {
	/// Create a directory for the given configuration without connecting.
	#[must_use]
	pub fn new(config: DirectoryConfig) -> Self {
		Self { config, ldap: None, driver: None, cursor: None }
	}

	/// Create a directory and connect to it.
	pub async fn connect(config: DirectoryConfig) -> Result<Self, Error> {
		let mut directory = Self::new(config);
		directory.reinit().await?;
		Ok(directory)
	}

	/// Create a directory from a property set and connect to it. See
	/// [`DirectoryConfig::from_properties`] for the accepted keys.
	pub async fn from_properties(
		props: &Properties,
		principal: Option<&str>,
		password: Option<&str>,
	) -> Result<Self, Error> {
		Self::connect(DirectoryConfig::from_properties(props, principal, password)?).await
	}

	/// The configuration in use.
	#[must_use]
	pub fn config(&self) -> &DirectoryConfig {
		&self.config
	}

	/// The effective connection settings as a property set.
	#[must_use]
	pub fn environment(&self) -> Properties {
		self.config.to_properties()
	}

	/// Whether a connection is currently held.
	#[must_use]
	pub fn is_connected(&self) -> bool {
		self.ldap.is_some()
	}

	/// The connection handle, prepared with the configured operation timeout.
	fn handle(&mut self) -> Result<&mut ldap3::Ldap, Error> {
		let timeout = self.config.connection.operation_timeout;
		let ldap = self
			.ldap
			.as_mut()
			.ok_or_else(|| Error::Connection("Not connected".to_owned()))?;
		if let Some(timeout) = timeout {
			ldap.with_timeout(timeout);
		}
		Ok(ldap)
	}

	/// Drop the open search, telling the server to stop sending results.
	async fn discard_cursor(&mut self) {
		if let Some(mut cursor) = self.cursor.take() {
			cursor.abandon().await;
		}
	}
}

#[async_trait]
impl Directory for LdapDirectory {
	async fn reinit(&mut self) -> Result<(), Error> {
		self.close().await;

		debug!(url = %self.config.url, "Directory: get new connection");
		let settings = self.config.connection.to_settings().await?;
		let (conn, mut ldap) = LdapConnAsync::from_url_with_settings(settings, &self.config.url)
			.await
			.map_err(|err| Error::Connection(err.to_string()))?;
		self.driver = Some(tokio::spawn(async move {
			if let Err(err) = conn.drive().await {
				warn!("Ldap connection error {err}");
			}
		}));

		if self.config.authentication == Authentication::Simple {
			if let (Some(principal), Some(credentials)) =
				(&self.config.principal, &self.config.credentials)
			{
				ldap.simple_bind(principal, credentials)
					.await
					.and_then(LdapResult::success)
					.map_err(|err| Error::Connection(err.to_string()))?;
			}
		}
		self.ldap = Some(ldap);

		debug!(url = %self.config.url, "Directory: init OK");
		Ok(())
	}

	async fn search(
		&mut self,
		base: &str,
		filter: Option<&str>,
		scope: Scope,
	) -> Result<bool, Error> {
		let filter = filter.unwrap_or(DEFAULT_FILTER);
		debug!(base, filter, ?scope, "About to search");

		self.discard_cursor().await;

		let limit = self.config.size_limit;
		let ldap = self.handle()?;
		ldap.with_search_options(
			SearchOptions::new().sizelimit(i32::try_from(limit).unwrap_or(i32::MAX)),
		);
		let adapters: Vec<Box<dyn Adapter<_, _>>> = vec![Box::new(EntriesOnly::new())];
		let mut stream = ldap
			.streaming_search_with(adapters, base, scope.into(), filter, vec!["*".to_owned()])
			.await?;

		let Some(first) = stream.next().await? else {
			search_done(stream.finish().await)?;
			debug!(base, "Search found no entries");
			return Ok(false);
		};

		let mut cursor =
			Cursor { base: base.to_owned(), stream, pending: None, produced: 0, limit };
		cursor.pending = Some(cursor.record(first));
		self.cursor = Some(cursor);
		Ok(true)
	}

	async fn next_record(&mut self) -> Result<Option<DirRecord>, Error> {
		let cursor = self.cursor.as_mut().ok_or(Error::NoOpenSearch)?;
		let next = cursor.next().await;
		if !matches!(next, Ok(Some(_))) {
			self.cursor = None;
		}
		next
	}

	async fn create(&mut self, record: &DirRecord) -> Result<bool, Error> {
		let ldap = self.handle()?;
		let result = ldap.add(&record.dn, record.to_ldap_attrs()).await?;
		if result.rc == RC_ENTRY_ALREADY_EXISTS {
			debug!(dn = %record.dn, "Entry already exists");
			return Ok(false);
		}
		result.success()?;
		Ok(true)
	}

	async fn replace_values(
		&mut self,
		dn: &str,
		attr: &str,
		values: Vec<AttrValue>,
	) -> Result<(), Error> {
		self.modify(dn, &[Modification::replace(attr, values)]).await
	}

	async fn replace_value(
		&mut self,
		_dn: &str,
		_attr: &str,
		_old: AttrValue,
		_new: AttrValue,
	) -> Result<(), Error> {
		Err(Error::Unsupported("ldap replace(old, new) not implemented"))
	}

	async fn modify(&mut self, dn: &str, mods: &[Modification]) -> Result<(), Error> {
		let mods: Vec<_> = mods.iter().map(Modification::to_ldap).collect();
		self.handle()?.modify(dn, mods).await?.success()?;
		Ok(())
	}

	async fn destroy(&mut self, dn: &str) -> Result<(), Error> {
		self.handle()?.delete(dn).await?.success()?;
		Ok(())
	}

	async fn close(&mut self) {
		self.discard_cursor().await;
		if let Some(mut ldap) = self.ldap.take() {
			if let Err(err) = ldap.unbind().await {
				warn!("Unbinding failed: {err}");
			}
		}
		if let Some(driver) = self.driver.take() {
			if let Err(err) = driver.await {
				warn!("Failed to join background task: {err}");
			}
		}
	}
}

/// Check the final result of a search. Truncation by the size limit and a
/// missing base both end the search without error.
fn search_done(result: LdapResult) -> Result<(), Error> {
	match result.rc {
		RC_SUCCESS | RC_SIZE_LIMIT_EXCEEDED | RC_NO_SUCH_OBJECT => Ok(()),
		_ => {
			result.success()?;
			Ok(())
		}
	}
}

/// State of an open search.
struct Cursor {
	/// Base DN of the search.
	base: String,
	/// Results still to be read from the server.
	stream: SearchStream<'static, String, Vec<String>>,
	/// A record read ahead of the caller.
	pending: Option<DirRecord>,
	/// Records handed out so far.
	produced: usize,
	/// Maximum number of records to hand out, 0 for no limit.
	limit: usize,
}

impl std::fmt::Debug for Cursor {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Cursor")
			.field("base", &self.base)
			.field("produced", &self.produced)
			.field("limit", &self.limit)
			.finish_non_exhaustive()
	}
}

impl Cursor {
	/// Produce the next record, `None` when done.
	async fn next(&mut self) -> Result<Option<DirRecord>, Error> {
		if let Some(record) = self.pending.take() {
			self.produced += 1;
			return Ok(Some(record));
		}
		if self.limit != 0 && self.produced >= self.limit {
			self.abandon().await;
			return Ok(None);
		}
		match self.stream.next().await? {
			Some(entry) => {
				self.produced += 1;
				Ok(Some(self.record(entry)))
			}
			None => {
				search_done(self.stream.finish().await)?;
				Ok(None)
			}
		}
	}

	/// Turn a search result into a record named relative to the search base.
	fn record(&self, entry: ldap3::ResultEntry) -> DirRecord {
		let mut record = DirRecord::from(SearchEntry::construct(entry));
		record.name = Some(relative_name(&record.dn, &self.base).to_owned());
		record
	}

	/// Ask the server to stop the search.
	async fn abandon(&mut self) {
		let ldap = self.stream.ldap_handle();
		let id = ldap.last_id();
		if let Err(err) = ldap.abandon(id).await {
			debug!("Abandoning search failed: {err}");
		}
	}
}

/// The part of `dn` below `base`. Empty for the base itself; DNs outside of
/// the base are returned unchanged.
fn relative_name<'a>(dn: &'a str, base: &str) -> &'a str {
	if base.is_empty() {
		return dn;
	}
	if dn.eq_ignore_ascii_case(base) {
		return "";
	}
	let Some(split) = dn.len().checked_sub(base.len()) else {
		return dn;
	};
	match (dn.get(..split), dn.get(split..)) {
		(Some(head), Some(tail)) if tail.eq_ignore_ascii_case(base) => {
			match head.trim_end().strip_suffix(',') {
				Some(name) => name.trim_end(),
				None => dn,
			}
		}
		_ => dn,
	}
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use url::Url;

	use super::{relative_name, LdapDirectory};
	use crate::{config::DirectoryConfig, directory::Directory, error::Error};

	fn unconnected() -> LdapDirectory {
		LdapDirectory::new(DirectoryConfig::new(Url::parse("ldap://127.0.0.1:1").unwrap()))
	}

	#[test]
	fn relative_names() {
		let base = "ou=users,dc=example,dc=org";
		assert_eq!(relative_name("cn=user01,ou=users,dc=example,dc=org", base), "cn=user01");
		assert_eq!(relative_name("cn=a,ou=b, OU=Users,DC=example,DC=org", base), "cn=a,ou=b");
		assert_eq!(relative_name("ou=users,dc=example,dc=org", base), "");
		assert_eq!(relative_name("cn=x,dc=other", base), "cn=x,dc=other");
		let outside = "cn=x,xou=users,dc=example,dc=org";
		assert_eq!(relative_name(outside, base), outside);
		assert_eq!(relative_name("cn=x", ""), "cn=x");
	}

	#[tokio::test]
	async fn single_value_replace_is_unsupported() {
		let mut directory = unconnected();
		let result = directory
			.replace_value("cn=foo,dc=example,dc=org", "mail", "old".into(), "new".into())
			.await;
		assert!(matches!(result, Err(Error::Unsupported(_))));
	}

	#[tokio::test]
	async fn next_record_without_search() {
		let mut directory = unconnected();
		assert!(matches!(directory.next_record().await, Err(Error::NoOpenSearch)));
	}

	#[tokio::test]
	async fn operations_need_a_connection() {
		let mut directory = unconnected();
		assert!(!directory.is_connected());
		assert!(matches!(
			directory.search_sub("dc=example,dc=org", None).await,
			Err(Error::Connection(_))
		));
		assert!(matches!(directory.destroy("cn=foo").await, Err(Error::Connection(_))));

		// closing twice is harmless
		directory.close().await;
		directory.close().await;
	}

	#[tokio::test]
	async fn unreachable_server() {
		let mut directory = unconnected();
		assert!(matches!(directory.reinit().await, Err(Error::Connection(_))));
		assert!(!directory.is_connected());
	}
}
