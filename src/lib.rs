//! Search and maintain directory entries through a backend agnostic
//! interface, plus a couple of object pools.
//!
//! The [`Directory`] trait describes a directory session: a search is issued
//! with a base, a filter and a [`Scope`], after which the matching entries are
//! read one [`DirRecord`] at a time. Entries can also be created, modified
//! and removed. Two backends exist:
//!
//! * [`LdapDirectory`] talks to an LDAP server using the `ldap3` crate.
//! * [`LdifDirectory`] reads records from an LDIF stream, and is read only.
//!
//! For a general primer on LDAP, the [introduction] in the `ldap3` crate is
//! an excellent resource.
//!
//! [introduction]: https://github.com/inejge/ldap3/blob/master/LDAP-primer.md
//!
//! # Getting started
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use ldap_directory::{Directory, DirectoryConfig, LdapDirectory, Modification};
//! use url::Url;
//!
//! // Configuration can also be deserialized with serde, or built from a flat
//! // property set with `DirectoryConfig::from_properties`.
//! let mut config = DirectoryConfig::new(Url::parse("ldap://localhost")?);
//! config.principal = Some("cn=admin,dc=example,dc=org".to_owned());
//! config.credentials = Some("verysecret".to_owned());
//!
//! let mut directory = LdapDirectory::connect(config).await?;
//! if directory.search_one("ou=people,dc=example,dc=org", Some("(objectClass=person)")).await? {
//!     while let Some(record) = directory.next_record().await? {
//!         println!("{}: {:?}", record.dn, record.attr_first("cn"));
//!     }
//! }
//!
//! let record = directory
//!     .new_record("cn=user01,ou=people,dc=example,dc=org")
//!     .with_value("objectClass", "inetOrgPerson")
//!     .with_value("cn", "user01")
//!     .with_value("sn", "User");
//! if !directory.create(&record).await? {
//!     println!("user01 already exists");
//! }
//! directory
//!     .modify(
//!         &record.dn,
//!         &[Modification::replace("displayName", vec!["User One".into()])],
//!     )
//!     .await?;
//! directory.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Pools
//! [`ValuePool`] shares one instance among equal immutable values, and
//! [`FixedPool`] recycles objects that are expensive to construct. See the
//! [`pool`] module.
//!
//! # Limitations
//! * A directory session supports one open search at a time and is not
//!   synchronised; use one session per task.
//! * [`LdapDirectory`] does not implement replacing a single attribute value
//!   ([`Directory::replace_value`]).
//! * Searches are capped at [`DEFAULT_SIZE_LIMIT`] records unless configured
//!   otherwise. Paged results are not used.
//! * [secrecy](https://docs.rs/secrecy) is not used for storing the bind
//!   password, it probably should be

pub mod config;
pub mod directory;
pub mod error;
pub mod ldap;
pub mod ldif;
pub mod pool;
pub mod record;

pub use ldap3;

pub use crate::{
	config::{Authentication, ConnectionConfig, DirectoryConfig, Properties, TLSConfig},
	directory::{Directory, Scope, DEFAULT_FILTER, DEFAULT_SIZE_LIMIT},
	error::Error,
	ldap::LdapDirectory,
	ldif::{write_record, LdifDirectory, LdifReader},
	pool::{Factory, FixedPool, RebalanceConfig, ValuePool},
	record::{AttrValue, Attribute, ChangeType, DirRecord, ModOp, Modification},
};
