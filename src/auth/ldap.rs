//! Directory (LDAP) authentication

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use ldap3::{LdapConnAsync, LdapConnSettings, Scope, SearchEntry};
use tracing::debug;

use crate::settings::LdapSettings;
use crate::store::ExternalUser;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const ATTRIBUTES: [&str; 4] = ["mail", "displayName", "cn", "memberOf"];

/// Directory failures. All of them end a login as "invalid credentials";
/// the variant only reaches the log.
#[derive(Debug, thiserror::Error)]
pub enum LdapError {
    /// Settings are incomplete or insecure
    #[error("LDAP misconfigured: {0}")]
    Config(String),
    /// Transport failure
    #[error("LDAP connection failed: {0}")]
    Connect(#[from] ldap3::LdapError),
    /// Service account bind rejected
    #[error("LDAP service bind rejected")]
    ServiceBind,
    /// Search did not return exactly one entry
    #[error("LDAP search returned {0} entries")]
    EntryCount(usize),
    /// User bind rejected
    #[error("LDAP user bind rejected")]
    UserBind,
}

/// Something that can check a username/password against a directory
#[async_trait]
pub trait Directory: Send + Sync {
    /// Profile of the user when the password binds
    async fn authenticate(
        &self,
        settings: &LdapSettings,
        username: &str,
        password: &str,
    ) -> Result<ExternalUser, LdapError>;
}

/// Escape a value for use inside an LDAP search filter (RFC 4515)
#[must_use]
pub fn ldap_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\5c"),
            '*' => out.push_str("\\2a"),
            '(' => out.push_str("\\28"),
            ')' => out.push_str("\\29"),
            '\0' => out.push_str("\\00"),
            c => out.push(c),
        }
    }
    out
}

/// Search filter for `username`
#[must_use]
pub fn user_filter(template: &str, username: &str) -> String {
    let template = if template.trim().is_empty() {
        "(uid={username})"
    } else {
        template
    };
    template.replace("{username}", &ldap_escape(username))
}

/// Value of the first `cn=` component of a DN
#[must_use]
pub fn first_cn(dn: &str) -> Option<String> {
    dn.split(',')
        .map(str::trim)
        .find_map(|rdn| {
            let (attr, value) = rdn.split_once('=')?;
            attr.trim().eq_ignore_ascii_case("cn").then(|| value.trim().to_string())
        })
        .filter(|v| !v.is_empty())
}

/// Build a profile from search-entry attributes
#[must_use]
pub fn profile_from_attrs(username: &str, attrs: &HashMap<String, Vec<String>>) -> ExternalUser {
    let first = |name: &str| {
        attrs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.first())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let groups = attrs
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("memberOf"))
        .map(|(_, dns)| dns.iter().filter_map(|dn| first_cn(dn)).collect())
        .unwrap_or_default();

    ExternalUser {
        username: username.to_string(),
        email: first("mail"),
        display_name: first("displayName")
            .or_else(|| first("cn"))
            .unwrap_or_else(|| username.to_string()),
        groups,
    }
}

/// Directory reached over ldaps:// or StartTLS
#[derive(Debug, Default)]
pub struct LdapDirectory;

#[async_trait]
impl Directory for LdapDirectory {
    async fn authenticate(
        &self,
        settings: &LdapSettings,
        username: &str,
        password: &str,
    ) -> Result<ExternalUser, LdapError> {
        let url = settings.url.trim();
        let implicit_tls = url.starts_with("ldaps://");
        if !implicit_tls && !settings.starttls {
            return Err(LdapError::Config(
                "plaintext LDAP refused; use ldaps:// or enable StartTLS".into(),
            ));
        }
        if password.is_empty() {
            // An empty password would be an unauthenticated bind
            return Err(LdapError::UserBind);
        }

        let conn_settings = LdapConnSettings::new()
            .set_conn_timeout(CONNECT_TIMEOUT)
            .set_starttls(!implicit_tls);
        let (conn, mut ldap) = LdapConnAsync::with_settings(conn_settings, url).await?;
        ldap3::drive!(conn);

        if !settings.bind_dn.is_empty() {
            ldap.simple_bind(&settings.bind_dn, &settings.bind_password)
                .await?
                .success()
                .map_err(|_| LdapError::ServiceBind)?;
        }

        let filter = user_filter(&settings.user_filter, username);
        debug!(%filter, base = %settings.base_dn, "LDAP search");
        let (entries, _) = ldap
            .search(&settings.base_dn, Scope::Subtree, &filter, ATTRIBUTES.to_vec())
            .await?
            .success()?;
        if entries.len() != 1 {
            let _ = ldap.unbind().await;
            return Err(LdapError::EntryCount(entries.len()));
        }
        let Some(raw) = entries.into_iter().next() else {
            return Err(LdapError::EntryCount(0));
        };
        let entry = SearchEntry::construct(raw);

        let bound = ldap.simple_bind(&entry.dn, password).await?.success();
        let _ = ldap.unbind().await;
        bound.map_err(|_| LdapError::UserBind)?;

        Ok(profile_from_attrs(username, &entry.attrs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_filter_metacharacters() {
        assert_eq!(ldap_escape("a*b(c)d\\e\0"), "a\\2ab\\28c\\29d\\5ce\\00");
        assert_eq!(
            user_filter("(&(objectClass=person)(uid={username}))", "*)(uid=*"),
            "(&(objectClass=person)(uid=\\2a\\29\\28uid=\\2a))"
        );
        assert_eq!(user_filter("", "bob"), "(uid=bob)");
    }

    #[test]
    fn groups_reduce_to_first_cn() {
        assert_eq!(first_cn("cn=admins,ou=groups,dc=example,dc=com"), Some("admins".into()));
        assert_eq!(first_cn("ou=x, CN=Media Users ,dc=lan"), Some("Media Users".into()));
        assert_eq!(first_cn("ou=groups,dc=lan"), None);
    }

    #[test]
    fn profile_prefers_display_name_then_cn() {
        let mut attrs = HashMap::new();
        attrs.insert("mail".to_string(), vec!["bob@lan".to_string()]);
        attrs.insert("cn".to_string(), vec!["Bob B".to_string()]);
        attrs.insert(
            "memberOf".to_string(),
            vec!["cn=admin,ou=groups,dc=lan".to_string(), "cn=media,ou=groups,dc=lan".to_string()],
        );
        let profile = profile_from_attrs("bob", &attrs);
        assert_eq!(profile.email.as_deref(), Some("bob@lan"));
        assert_eq!(profile.display_name, "Bob B");
        assert_eq!(profile.groups, vec!["admin", "media"]);

        attrs.insert("displayName".to_string(), vec!["Robert".to_string()]);
        assert_eq!(profile_from_attrs("bob", &attrs).display_name, "Robert");
    }

    #[tokio::test]
    async fn plaintext_ldap_is_refused() {
        let settings = LdapSettings {
            enabled: true,
            url: "ldap://dir.lan".into(),
            starttls: false,
            ..LdapSettings::default()
        };
        let err = LdapDirectory.authenticate(&settings, "bob", "pw").await.unwrap_err();
        assert!(matches!(err, LdapError::Config(_)));
    }
}
