use std::error::Error;

use ldap3::LdapConnAsync;
use ldap_directory::{Authentication, DirectoryConfig, LdapDirectory};
use url::Url;

pub const ROOT: &str = "dc=example,dc=org";
pub const URL: &str = "ldap://localhost:1389";

pub fn ou_dn(ou: &str) -> String {
	format!("ou={ou},{ROOT}")
}

pub fn user_dn(ou: &str, cn: &str) -> String {
	format!("cn={cn},ou={ou},{ROOT}")
}

pub fn admin_config() -> DirectoryConfig {
	let mut config = DirectoryConfig::new(Url::parse(URL).unwrap());
	config.authentication = Authentication::Simple;
	config.principal = Some(format!("cn=admin,{ROOT}"));
	config.credentials = Some("adminpassword".to_owned());
	config
}

pub async fn directory() -> Result<LdapDirectory, Box<dyn Error>> {
	Ok(LdapDirectory::connect(admin_config()).await?)
}

pub async fn ldap_connect() -> Result<ldap3::Ldap, Box<dyn Error>> {
	let (conn, mut ldap) = LdapConnAsync::new(URL).await?;
	let _handle = tokio::spawn(async move {
		if let Err(err) = conn.drive().await {
			panic!("Ldap connection error {err}");
		}
	});
	ldap.simple_bind(&format!("cn=admin,{ROOT}"), "adminpassword").await?;
	Ok(ldap)
}

pub async fn ldap_add_organizational_unit(
	ldap: &mut ldap3::Ldap,
	ou: &str,
) -> Result<(), Box<dyn Error>> {
	ldap.add(&ou_dn(ou), vec![("objectClass", ["organizationalUnit"].into())]).await?.success()?;
	Ok(())
}

/// Remove an organizational unit together with any users below it.
pub async fn ldap_delete_organizational_unit(
	ldap: &mut ldap3::Ldap,
	ou: &str,
) -> Result<(), Box<dyn Error>> {
	let (entries, _res) = ldap
		.search(&ou_dn(ou), ldap3::Scope::OneLevel, "(objectClass=*)", vec!["1.1"])
		.await?
		.success()?;
	for entry in entries {
		let entry = ldap3::SearchEntry::construct(entry);
		ldap.delete(&entry.dn).await?.success()?;
	}
	ldap.delete(&ou_dn(ou)).await?.success()?;
	Ok(())
}

pub async fn ldap_add_user(
	ldap: &mut ldap3::Ldap,
	ou: &str,
	cn: &str,
	sn: &str,
) -> Result<(), Box<dyn Error>> {
	ldap.add(
		&user_dn(ou, cn),
		vec![("objectClass", ["inetOrgPerson"].into()), ("sn", [sn].into())],
	)
	.await?
	.success()?;
	Ok(())
}

/// Create a fresh organizational unit holding `count` users named
/// `user01`, `user02`, ...
pub async fn setup_users(ou: &str, count: usize) -> Result<ldap3::Ldap, Box<dyn Error>> {
	let mut ldap = ldap_connect().await?;
	let _ = ldap_delete_organizational_unit(&mut ldap, ou).await;
	ldap_add_organizational_unit(&mut ldap, ou).await?;
	for i in 1..=count {
		ldap_add_user(&mut ldap, ou, &format!("user{i:02}"), &format!("User{i}")).await?;
	}
	Ok(ldap)
}
