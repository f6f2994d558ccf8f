//! Config for the directory backends.
//!
//! A [`DirectoryConfig`] can be deserialized with serde, or assembled from a
//! flat set of string properties with [`DirectoryConfig::from_properties`].
//! Absent properties fall back to the defaults listed on the key constants.
use std::{collections::BTreeMap, path::PathBuf, str::FromStr, sync::Arc, time::Duration};

use ldap3::LdapConnSettings;
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{directory::DEFAULT_SIZE_LIMIT, error::Error};

/// A flat, string keyed property set.
pub type Properties = BTreeMap<String, String>;

/// URL of the directory server. Default `ldap://localhost`.
pub const PROVIDER_URL: &str = "provider.url";
/// Backend to use. Default `ldap`, which is the only networked backend.
pub const CONTEXT_FACTORY: &str = "context.factory";
/// Authentication mode, `simple` or `none`. Default `simple`.
pub const SECURITY_AUTHENTICATION: &str = "security.authentication";
/// DN to bind as.
pub const SECURITY_PRINCIPAL: &str = "security.principal";
/// Password to bind with.
pub const SECURITY_CREDENTIALS: &str = "security.credentials";
/// Connect timeout in seconds. Default 5.
pub const CONNECTION_TIMEOUT: &str = "connection.timeout";
/// Per operation timeout in seconds. Unlimited by default.
pub const OPERATION_TIMEOUT: &str = "operation.timeout";
/// Maximum number of records a search produces. Default 1000.
pub const SEARCH_SIZE_LIMIT: &str = "search.sizelimit";
/// Use StartTLS, `true` or `false`. Default `false`.
pub const TLS_STARTTLS: &str = "tls.starttls";
/// Skip certificate verification, `true` or `false`. Default `false`.
pub const TLS_NO_VERIFY: &str = "tls.no_verify";
/// Path of PEM encoded root certificates.
pub const TLS_ROOT_CERTIFICATES: &str = "tls.root_certificates";
/// Path of a PEM encoded PKCS8 client key.
pub const TLS_CLIENT_KEY: &str = "tls.client_key";
/// Path of a PEM encoded client certificate.
pub const TLS_CLIENT_CERTIFICATE: &str = "tls.client_certificate";

/// Default server URL.
pub const DEFAULT_URL: &str = "ldap://localhost";
/// The backend name accepted for [`CONTEXT_FACTORY`].
pub const LDAP_FACTORY: &str = "ldap";

/// Directory configuration.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct DirectoryConfig {
	/// The URL to connect to the server with. Supports ldap, ldaps, and ldapi
	/// schemes
	pub url: Url,
	/// How to bind to the server
	#[serde(default)]
	pub authentication: Authentication,
	/// The DN to bind as
	#[serde(default)]
	pub principal: Option<String>,
	/// The password to bind with
	#[serde(default)]
	pub credentials: Option<String>,
	/// Connection settings.
	#[serde(default)]
	pub connection: ConnectionConfig,
	/// Maximum number of records a single search produces
	#[serde(default = "default_size_limit")]
	pub size_limit: usize,
}

/// Serde default for [`DirectoryConfig::size_limit`].
fn default_size_limit() -> usize {
	DEFAULT_SIZE_LIMIT
}

/// How to authenticate against the directory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Authentication {
	/// Simple bind with the principal and credentials
	#[default]
	Simple,
	/// Anonymous access
	None,
}

impl Authentication {
	/// The property value naming this mode.
	#[must_use]
	pub fn as_str(self) -> &'static str {
		match self {
			Authentication::Simple => "simple",
			Authentication::None => "none",
		}
	}
}

impl FromStr for Authentication {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"simple" => Ok(Authentication::Simple),
			"none" => Ok(Authentication::None),
			other => Err(Error::Config(format!("Unsupported authentication mode {other}"))),
		}
	}
}

/// Configuration for how to connect to the directory server
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionConfig {
	/// Timeout to establish a connection in seconds.
	pub timeout: u64,

	/// Operation timeout. For searches this applies per reply.
	pub operation_timeout: Option<Duration>,

	/// TLS config
	pub tls: TLSConfig,
}

impl Default for ConnectionConfig {
	fn default() -> Self {
		Self { timeout: 5, operation_timeout: None, tls: TLSConfig::default() }
	}
}

/// TLS Configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TLSConfig {
	/// Use StartTLS extended operation for establishing a secure connection,
	/// rather than TLS on a dedicated port.
	pub starttls: bool,

	/// Disable verification of TLS certificates
	pub no_tls_verify: bool,

	/// TLS root certificates path
	pub root_certificates_path: Option<PathBuf>,

	/// Path of the TLS client key to use for the connection
	pub client_key_path: Option<PathBuf>,

	/// Path of the TLS client certificate to use for the connection
	pub client_certificate_path: Option<PathBuf>,
}

impl DirectoryConfig {
	/// A configuration for `url` with all other settings at their defaults.
	#[must_use]
	pub fn new(url: Url) -> Self {
		Self {
			url,
			authentication: Authentication::default(),
			principal: None,
			credentials: None,
			connection: ConnectionConfig::default(),
			size_limit: DEFAULT_SIZE_LIMIT,
		}
	}

	/// Build a configuration from a property set. An explicitly given
	/// principal and password take precedence over the properties and select
	/// simple authentication.
	pub fn from_properties(
		props: &Properties,
		principal: Option<&str>,
		password: Option<&str>,
	) -> Result<Self, Error> {
		let factory = props.get(CONTEXT_FACTORY).map_or(LDAP_FACTORY, String::as_str);
		if !factory.eq_ignore_ascii_case(LDAP_FACTORY) {
			return Err(Error::Config(format!("Unknown context factory {factory}")));
		}

		let url = props.get(PROVIDER_URL).map_or(DEFAULT_URL, String::as_str);
		let url = Url::parse(url)
			.map_err(|err| Error::Config(format!("Invalid provider URL {url}: {err}")))?;

		let mut config = Self::new(url);
		config.authentication = prop(props, SECURITY_AUTHENTICATION)?.unwrap_or_default();
		config.principal = props.get(SECURITY_PRINCIPAL).cloned();
		config.credentials = props.get(SECURITY_CREDENTIALS).cloned();
		if let (Some(principal), Some(password)) = (principal, password) {
			config.authentication = Authentication::Simple;
			config.principal = Some(principal.to_owned());
			config.credentials = Some(password.to_owned());
		}

		if let Some(timeout) = prop(props, CONNECTION_TIMEOUT)? {
			config.connection.timeout = timeout;
		}
		config.connection.operation_timeout =
			prop::<u64>(props, OPERATION_TIMEOUT)?.map(Duration::from_secs);
		if let Some(limit) = prop(props, SEARCH_SIZE_LIMIT)? {
			config.size_limit = limit;
		}

		let tls = &mut config.connection.tls;
		tls.starttls = prop(props, TLS_STARTTLS)?.unwrap_or(false);
		tls.no_tls_verify = prop(props, TLS_NO_VERIFY)?.unwrap_or(false);
		tls.root_certificates_path = props.get(TLS_ROOT_CERTIFICATES).map(PathBuf::from);
		tls.client_key_path = props.get(TLS_CLIENT_KEY).map(PathBuf::from);
		tls.client_certificate_path = props.get(TLS_CLIENT_CERTIFICATE).map(PathBuf::from);

		Ok(config)
	}

	/// The effective settings as a property set. Credentials are left out.
	#[must_use]
	pub fn to_properties(&self) -> Properties {
		let mut props = Properties::new();
		let mut set = |key: &str, value: String| {
			props.insert(key.to_owned(), value);
		};
		set(CONTEXT_FACTORY, LDAP_FACTORY.to_owned());
		set(PROVIDER_URL, self.url.to_string());
		set(SECURITY_AUTHENTICATION, self.authentication.as_str().to_owned());
		if let Some(principal) = &self.principal {
			set(SECURITY_PRINCIPAL, principal.clone());
		}
		set(CONNECTION_TIMEOUT, self.connection.timeout.to_string());
		if let Some(timeout) = self.connection.operation_timeout {
			set(OPERATION_TIMEOUT, timeout.as_secs().to_string());
		}
		set(SEARCH_SIZE_LIMIT, self.size_limit.to_string());

		let tls = &self.connection.tls;
		set(TLS_STARTTLS, tls.starttls.to_string());
		set(TLS_NO_VERIFY, tls.no_tls_verify.to_string());
		let paths = [
			(TLS_ROOT_CERTIFICATES, &tls.root_certificates_path),
			(TLS_CLIENT_KEY, &tls.client_key_path),
			(TLS_CLIENT_CERTIFICATE, &tls.client_certificate_path),
		];
		for (key, path) in paths {
			if let Some(path) = path {
				set(key, path.display().to_string());
			}
		}
		props
	}
}

/// Parse an optional property.
fn prop<T: FromStr>(props: &Properties, key: &str) -> Result<Option<T>, Error> {
	props
		.get(key)
		.map(|value| {
			value
				.trim()
				.parse()
				.map_err(|_| Error::Config(format!("Invalid value {value} for {key}")))
		})
		.transpose()
}

impl ConnectionConfig {
	/// Create a [`LdapConnSettings`] based on this [`ConnectionConfig`]
	pub(crate) async fn to_settings(&self) -> Result<LdapConnSettings, Error> {
		let mut settings = LdapConnSettings::new();

		settings = settings.set_conn_timeout(Duration::from_secs(self.timeout));
		settings = settings.set_starttls(self.tls.starttls);
		settings = settings.set_no_tls_verify(self.tls.no_tls_verify);

		if let Some(path) = &self.tls.root_certificates_path {
			let mut roots = RootCertStore::empty();
			let pem = tokio::fs::read(path).await?;
			let certs = rustls_pemfile::certs(&mut pem.as_slice())?;
			let (added, _) = roots.add_parsable_certificates(&certs);
			if added == 0 {
				return Err(Error::Invalid("Could not read root certificate".to_owned()));
			}
			let builder =
				ClientConfig::builder().with_safe_defaults().with_root_certificates(roots);

			let config = match (&self.tls.client_key_path, &self.tls.client_certificate_path) {
				(Some(key_path), Some(cert_path)) => {
					let pem = tokio::fs::read(cert_path).await?;
					let chain = rustls_pemfile::certs(&mut pem.as_slice())?
						.into_iter()
						.map(Certificate)
						.collect();
					let key = rustls_pemfile::pkcs8_private_keys(
						&mut tokio::fs::read(key_path).await?.as_slice(),
					)?
					.into_iter()
					.next()
					.ok_or_else(|| Error::Invalid("Could not read client key".to_owned()))?;
					builder.with_client_auth_cert(chain, PrivateKey(key)).map_err(|_| {
						Error::Invalid("Could not read client certificates".to_owned())
					})?
				}
				(None, None) => builder.with_no_client_auth(),
				_ => Err(Error::Invalid(
					"Both a client certificate and key file in PKCS8 format must be specified"
						.to_owned(),
				))?,
			};
			settings = settings.set_config(Arc::new(config));
		}
		Ok(settings)
	}
}
