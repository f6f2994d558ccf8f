//! Directory records and the helpers for reading data out of them.
use std::collections::HashSet;

use ldap3::{Mod, SearchEntry};
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::error::Error;

/// Format of the Generalized Time syntax
/// `( 1.3.6.1.4.1.1466.115.121.1.24 DESC 'Generalized Time' )` described in
/// RFC4517 section 3.1.13, as used by operational attributes such as
/// `modifyTimestamp`.
pub const TIME_FORMAT: &[time::format_description::FormatItem] =
	time::macros::format_description!("[year][month][day][hour][minute][second]Z");

/// A single attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AttrValue {
	/// A textual value.
	Text(String),
	/// An opaque binary value, e.g. `objectGUID` or `jpegPhoto`.
	Binary(Vec<u8>),
}

impl AttrValue {
	/// The raw bytes of the value.
	#[must_use]
	pub fn as_bytes(&self) -> &[u8] {
		match self {
			AttrValue::Text(text) => text.as_bytes(),
			AttrValue::Binary(bytes) => bytes,
		}
	}

	/// The value as text. `None` for binary values which are not valid UTF-8.
	#[must_use]
	pub fn as_str(&self) -> Option<&str> {
		match self {
			AttrValue::Text(text) => Some(text),
			AttrValue::Binary(bytes) => std::str::from_utf8(bytes).ok(),
		}
	}
}

impl From<&str> for AttrValue {
	fn from(value: &str) -> Self {
		AttrValue::Text(value.to_owned())
	}
}

impl From<String> for AttrValue {
	fn from(value: String) -> Self {
		AttrValue::Text(value)
	}
}

impl From<Vec<u8>> for AttrValue {
	fn from(value: Vec<u8>) -> Self {
		AttrValue::Binary(value)
	}
}

impl From<&[u8]> for AttrValue {
	fn from(value: &[u8]) -> Self {
		AttrValue::Binary(value.to_vec())
	}
}

/// A named attribute and its values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
	/// The attribute name, as first supplied.
	pub name: String,
	/// Values in insertion order.
	pub values: Vec<AttrValue>,
}

impl Attribute {
	/// Create an attribute without values.
	#[must_use]
	pub fn new(name: impl Into<String>) -> Self {
		Self { name: name.into(), values: Vec::new() }
	}

	/// Whether this attribute is called `name`, ignoring ASCII case.
	#[must_use]
	pub fn is_named(&self, name: &str) -> bool {
		self.name.eq_ignore_ascii_case(name)
	}

	/// Values as a set of byte strings, the shape `ldap3` expects.
	fn value_set(&self) -> HashSet<Vec<u8>> {
		values_to_set(&self.values)
	}
}

/// Convert attribute values to the set of byte strings `ldap3` works with.
fn values_to_set(values: &[AttrValue]) -> HashSet<Vec<u8>> {
	values.iter().map(|value| value.as_bytes().to_vec()).collect()
}

/// The kind of change an LDIF change record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
	/// Add the entry.
	Add,
	/// Delete the entry.
	Delete,
	/// Modify attributes of the entry.
	Modify,
	/// Rename or move the entry.
	ModDn,
}

impl ChangeType {
	/// The keyword used for this change type in LDIF.
	#[must_use]
	pub fn as_str(self) -> &'static str {
		match self {
			ChangeType::Add => "add",
			ChangeType::Delete => "delete",
			ChangeType::Modify => "modify",
			ChangeType::ModDn => "moddn",
		}
	}
}

/// Operation applied to an attribute by a [`Modification`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModOp {
	/// Add the values to the attribute.
	Add,
	/// Replace all values of the attribute.
	Replace,
	/// Remove the given values, or the whole attribute when no values are
	/// given.
	Remove,
}

/// One change to the attributes of an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Modification {
	/// What to do.
	pub op: ModOp,
	/// The attribute to change.
	pub attr: String,
	/// Values to add, replace with or remove.
	pub values: Vec<AttrValue>,
}

impl Modification {
	/// Add `values` to `attr`.
	#[must_use]
	pub fn add(attr: impl Into<String>, values: Vec<AttrValue>) -> Self {
		Self { op: ModOp::Add, attr: attr.into(), values }
	}

	/// Replace all values of `attr` with `values`.
	#[must_use]
	pub fn replace(attr: impl Into<String>, values: Vec<AttrValue>) -> Self {
		Self { op: ModOp::Replace, attr: attr.into(), values }
	}

	/// Remove `values` from `attr`. An empty list removes the attribute.
	#[must_use]
	pub fn remove(attr: impl Into<String>, values: Vec<AttrValue>) -> Self {
		Self { op: ModOp::Remove, attr: attr.into(), values }
	}

	/// Convert into the modification type of `ldap3`.
	pub(crate) fn to_ldap(&self) -> Mod<Vec<u8>> {
		let attr = self.attr.as_bytes().to_vec();
		let values = values_to_set(&self.values);
		match self.op {
			ModOp::Add => Mod::Add(attr, values),
			ModOp::Replace => Mod::Replace(attr, values),
			ModOp::Remove => Mod::Delete(attr, values),
		}
	}
}

/// One entry of a directory: a distinguished name plus a bag of attributes.
///
/// Attribute names are unique within a record, ignoring ASCII case. Records
/// read from LDIF may also describe a change rather than content, see
/// [`DirRecord::is_content`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirRecord {
	/// The distinguished name of the entry.
	pub dn: String,
	/// The name of the entry relative to the base of the search which
	/// produced it.
	pub name: Option<String>,
	/// `false` for LDIF change records.
	pub is_content: bool,
	/// The kind of change for change records.
	pub change_type: Option<ChangeType>,
	/// Attribute changes of a modify record.
	pub mods: Vec<Modification>,
	/// Attributes in insertion order.
	attrs: Vec<Attribute>,
}

impl Default for DirRecord {
	fn default() -> Self {
		Self::new(String::new())
	}
}

impl DirRecord {
	/// Create an empty content record for `dn`.
	#[must_use]
	pub fn new(dn: impl Into<String>) -> Self {
		Self {
			dn: dn.into(),
			name: None,
			is_content: true,
			change_type: None,
			mods: Vec::new(),
			attrs: Vec::new(),
		}
	}

	/// Builder style variant of [`DirRecord::add_value`].
	#[must_use]
	pub fn with_value(mut self, attr: &str, value: impl Into<AttrValue>) -> Self {
		self.add_value(attr, value);
		self
	}

	/// Get an attribute by name, ignoring ASCII case.
	#[must_use]
	pub fn attr(&self, name: &str) -> Option<&Attribute> {
		self.attrs.iter().find(|attr| attr.is_named(name))
	}

	/// Iterate over all attributes.
	pub fn attrs(&self) -> impl Iterator<Item = &Attribute> {
		self.attrs.iter()
	}

	/// Whether the record has no attributes.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.attrs.is_empty()
	}

	/// Append a value to an attribute, creating the attribute if needed.
	pub fn add_value(&mut self, attr: &str, value: impl Into<AttrValue>) {
		self.entry(attr).values.push(value.into());
	}

	/// Append several values to an attribute, creating the attribute if
	/// needed.
	pub fn add_values<I, V>(&mut self, attr: &str, values: I)
	where
		I: IntoIterator<Item = V>,
		V: Into<AttrValue>,
	{
		self.entry(attr).values.extend(values.into_iter().map(Into::into));
	}

	/// Set the values of an attribute, dropping any previous ones.
	pub fn set_attr(&mut self, attr: &str, values: Vec<AttrValue>) {
		self.entry(attr).values = values;
	}

	/// Remove an attribute, returning it if it was present.
	pub fn remove_attr(&mut self, name: &str) -> Option<Attribute> {
		let index = self.attrs.iter().position(|attr| attr.is_named(name))?;
		Some(self.attrs.remove(index))
	}

	/// Drop all attributes and change information, keeping the DN.
	pub fn clear(&mut self) {
		self.attrs.clear();
		self.mods.clear();
		self.change_type = None;
		self.is_content = true;
		self.name = None;
	}

	/// Whether the attribute holds the given value.
	#[must_use]
	pub fn contains_value(&self, attr: &str, value: &AttrValue) -> bool {
		self.attr(attr).is_some_and(|attr| {
			attr.values.iter().any(|candidate| candidate.as_bytes() == value.as_bytes())
		})
	}

	/// Get the first value of an attribute. Will return `None` if the
	/// attribute value is not valid UTF-8.
	#[must_use]
	pub fn attr_first(&self, attr: &str) -> Option<&str> {
		self.attr(attr)?.values.first()?.as_str()
	}

	/// Get the first value of an attribute, in binary form
	#[must_use]
	pub fn bin_attr_first(&self, attr: &str) -> Option<&[u8]> {
		self.attr(attr)?.values.first().map(AttrValue::as_bytes)
	}

	/// Get the first value of an attribute, interpreted as a boolean.
	#[must_use]
	pub fn bool_first(&self, attr: &str) -> Option<Result<bool, Error>> {
		match self.attr_first(attr) {
			Some("TRUE") => Some(Ok(true)),
			Some("FALSE") => Some(Ok(false)),
			Some(_) => Some(Err(Error::Invalid(attr.to_owned()))),
			None => None,
		}
	}

	/// Get the first value of an attribute, interpreted as a Generalized Time.
	#[must_use]
	pub fn time_first(&self, attr: &str) -> Option<Result<OffsetDateTime, Error>> {
		let value = self.attr_first(attr)?;
		Some(
			PrimitiveDateTime::parse(value, &TIME_FORMAT)
				.map(PrimitiveDateTime::assume_utc)
				.map_err(|_| Error::Invalid(attr.to_owned())),
		)
	}

	/// Attributes in the form `ldap3` expects for an add request.
	pub(crate) fn to_ldap_attrs(&self) -> Vec<(Vec<u8>, HashSet<Vec<u8>>)> {
		self.attrs.iter().map(|attr| (attr.name.as_bytes().to_vec(), attr.value_set())).collect()
	}

	/// Find the attribute slot for `name`, appending a new one if absent.
	fn entry(&mut self, name: &str) -> &mut Attribute {
		let index = match self.attrs.iter().position(|attr| attr.is_named(name)) {
			Some(index) => index,
			None => {
				self.attrs.push(Attribute::new(name));
				self.attrs.len() - 1
			}
		};
		&mut self.attrs[index]
	}
}

impl From<SearchEntry> for DirRecord {
	fn from(entry: SearchEntry) -> Self {
		let mut record = DirRecord::new(entry.dn);
		for (name, values) in entry.attrs {
			record.add_values(&name, values);
		}
		for (name, values) in entry.bin_attrs {
			record.add_values(&name, values);
		}
		record
	}
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use std::collections::HashMap;

	use ldap3::{Mod, SearchEntry};

	use super::{AttrValue, DirRecord, Modification};

	#[test]
	fn attr_first() {
		let entry = SearchEntry {
			dn: String::from("dontcare"),
			attrs: [(
				String::from("name"),
				vec![String::from("Foo Bar"), String::from("Bar McBaz")],
			)]
			.into_iter()
			.collect(),
			bin_attrs: HashMap::default(),
		};
		let record = DirRecord::from(entry);
		assert_eq!(
			record.attr_first("attribute_does_not_exist"),
			None,
			"Undefined attributes should return None"
		);
		assert_eq!(record.attr_first("name"), Some("Foo Bar"), "Should return the first value");
		assert_ne!(record.attr_first("name"), Some("Bar McBaz"), "Should return the correct value");
	}

	#[test]
	fn names_are_case_insensitive() {
		let mut record = DirRecord::new("cn=foo,dc=example,dc=org")
			.with_value("objectClass", "top")
			.with_value("objectclass", "person");
		assert_eq!(record.attrs().count(), 1, "Names differing in case are one attribute");
		assert_eq!(record.attr("OBJECTCLASS").unwrap().values.len(), 2);
		assert_eq!(record.attr("objectClass").unwrap().name, "objectClass");

		assert!(record.contains_value("objectclass", &AttrValue::from("person")));
		assert!(record.remove_attr("ObjectClass").is_some());
		assert!(record.is_empty());
	}

	#[test]
	fn binary_attributes() {
		let entry = SearchEntry {
			dn: String::from("cn=foo"),
			attrs: HashMap::new(),
			bin_attrs: [(String::from("objectGUID"), vec![vec![0xff, 0x00, 0x12]])]
				.into_iter()
				.collect(),
		};
		let record = DirRecord::from(entry);
		assert_eq!(record.bin_attr_first("objectguid"), Some(&[0xff, 0x00, 0x12][..]));
		assert_eq!(record.attr_first("objectGUID"), None, "Invalid UTF-8 is not text");
	}

	#[test]
	fn bool_and_time() {
		let record = DirRecord::new("cn=foo")
			.with_value("enabled", "TRUE")
			.with_value("admin", "yes")
			.with_value("modifyTimestamp", "20130516200520Z");
		assert!(record.bool_first("enabled").unwrap().unwrap());
		assert!(record.bool_first("admin").unwrap().is_err());
		assert!(record.bool_first("missing").is_none());

		let time = record.time_first("modifyTimestamp").unwrap().unwrap();
		assert_eq!(time.year(), 2013);
		assert_eq!(time.second(), 20);
	}

	#[test]
	fn modification_to_ldap() {
		let replace = Modification::replace("mail", vec!["a@example.org".into()]);
		assert!(matches!(
			replace.to_ldap(),
			Mod::Replace(attr, values) if attr == b"mail" && values.len() == 1
		));

		let remove = Modification::remove("mail", Vec::new());
		assert!(matches!(remove.to_ldap(), Mod::Delete(_, values) if values.is_empty()));
	}

	#[test]
	fn add_attrs_keep_order() {
		let record = DirRecord::new("cn=foo")
			.with_value("objectClass", "inetOrgPerson")
			.with_value("sn", "Foo")
			.with_value("cn", "foo");
		let names: Vec<_> = record
			.to_ldap_attrs()
			.into_iter()
			.map(|(name, _)| String::from_utf8(name).unwrap())
			.collect();
		assert_eq!(names, ["objectClass", "sn", "cn"]);
	}
}
