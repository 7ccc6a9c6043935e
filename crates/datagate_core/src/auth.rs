//! Clients, scopes and bearer tokens.
//!
//! A scope names an action on a node: `{prefix}{node}_{action}`, where the
//! node path has `/` and `.` replaced by `_` and everything is lowercased.
//! Long scopes are cut to the configured maximum and suffixed with eight hex
//! digits of their SHA-256 digest, so distinct long scopes stay distinct.
//!
//! Access rules:
//!
//! - reads of `public` nodes need no scope;
//! - `protected` nodes need the global action scope or the model scope;
//! - `private` properties need the property scope.
//!
//! Bearer tokens are `base64(claims).base64(hmac_sha256(claims))` with
//! claims `{client, scopes, exp}`.

use crate::config::Config;
use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::manifest::{Manifest, Model, Property};
use crate::types::{Access, Action};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

const HASH_SUFFIX_LEN: usize = 8;

/// Builds the scope string for an action on a node path.
#[must_use]
pub fn scope_name(prefix: &str, max_len: usize, node: &str, action: Action) -> String {
    let node = node.replace(['/', '.'], "_");
    let scope = if node.is_empty() {
        format!("{prefix}{}", action.as_str())
    } else {
        format!("{prefix}{node}_{}", action.as_str())
    }
    .to_lowercase();
    if scope.len() <= max_len {
        return scope;
    }
    let digest = Sha256::digest(scope.as_bytes());
    let hash: String = digest
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<String>()
        .chars()
        .take(HASH_SUFFIX_LEN)
        .collect();
    let mut cut = max_len.saturating_sub(HASH_SUFFIX_LEN + 1);
    while !scope.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}_{hash}", &scope[..cut])
}

/// An authenticated client and its granted scopes.
#[derive(Debug, Clone, PartialEq)]
pub struct Caller {
    /// Client name.
    pub client: String,
    /// Granted scopes.
    pub scopes: BTreeSet<String>,
    prefix: String,
    max_len: usize,
}

impl Caller {
    /// Creates a caller with scope naming taken from `config`.
    pub fn new(
        client: impl Into<String>,
        scopes: impl IntoIterator<Item = String>,
        config: &Config,
    ) -> Self {
        Self {
            client: client.into(),
            scopes: scopes.into_iter().collect(),
            prefix: config.scope_prefix().to_string(),
            max_len: config.scope_max_length(),
        }
    }

    /// Scope string for an action on a node path.
    #[must_use]
    pub fn scope(&self, node: &str, action: Action) -> String {
        scope_name(&self.prefix, self.max_len, node, action)
    }

    /// Scopes any of which grants `action` on `model` (and `prop`).
    #[must_use]
    pub fn accepted_scopes(
        &self,
        model: &Model,
        prop: Option<&Property>,
        action: Action,
    ) -> Vec<String> {
        let access = prop.map_or(model.access, |p| p.access);
        match (access, prop) {
            (Access::Private, Some(p)) => {
                vec![self.scope(&format!("{}/{}", model.name, p.place), action)]
            }
            _ => vec![self.scope("", action), self.scope(&model.name, action)],
        }
    }

    /// Whether the caller may perform `action` on `model` (and `prop`).
    #[must_use]
    pub fn can(&self, model: &Model, prop: Option<&Property>, action: Action) -> bool {
        let access = prop.map_or(model.access, |p| p.access);
        if access == Access::Public && !action.is_write() {
            return true;
        }
        self.accepted_scopes(model, prop, action)
            .iter()
            .any(|s| self.scopes.contains(s))
    }

    /// Like [`can`](Self::can), but fails with `InsufficientScope`.
    ///
    /// # Errors
    ///
    /// Returns `InsufficientScope` listing the accepted scopes.
    pub fn authorize(
        &self,
        model: &Model,
        prop: Option<&Property>,
        action: Action,
    ) -> CoreResult<()> {
        if self.can(model, prop, action) {
            return Ok(());
        }
        let scopes = self.accepted_scopes(model, prop, action);
        let mut err = ErrorKind::InsufficientScope
            .err()
            .model(&model.name)
            .with("scopes", scopes);
        if let Some(p) = prop {
            err = err.property(&p.place);
        }
        Err(err.into())
    }

    /// Checks access to a property of the model that owns it.
    ///
    /// # Errors
    ///
    /// Returns `InsufficientScope`.
    pub fn authorize_property(
        &self,
        manifest: &Manifest,
        prop: &Property,
        action: Action,
    ) -> CoreResult<()> {
        self.authorize(manifest.model(prop.model), Some(prop), action)
    }

    /// Scope that allows writing `_id` and `_revision` directly.
    #[must_use]
    pub fn meta_scope(&self) -> String {
        format!("{}set_meta_fields", self.prefix).to_lowercase()
    }

    /// Whether the caller holds [`meta_scope`](Self::meta_scope).
    #[must_use]
    pub fn can_set_meta_fields(&self) -> bool {
        self.scopes.contains(&self.meta_scope())
    }
}

/// Claims carried by a bearer token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Client name.
    pub client: String,
    /// Granted scopes.
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Expiry as a Unix timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

/// Signs claims into a bearer token.
///
/// # Errors
///
/// Returns an internal error if the claims cannot be encoded.
pub fn issue_token(claims: &Claims, key: &str) -> CoreResult<String> {
    let body = serde_json::to_vec(claims)?;
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|e| CoreError::internal(e.to_string()))?;
    mac.update(&body);
    let signature = mac.finalize().into_bytes();
    Ok(format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(&body),
        URL_SAFE_NO_PAD.encode(signature)
    ))
}

fn invalid_token() -> CoreError {
    ErrorKind::InvalidToken.err().into()
}

/// Turns `Authorization` headers into callers.
#[derive(Debug, Clone)]
pub struct Authenticator {
    config: Config,
}

impl Authenticator {
    /// Creates an authenticator over a configuration.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// A caller for a configured client with its configured scopes.
    #[must_use]
    pub fn client(&self, name: &str) -> Caller {
        Caller::new(name, self.config.client_scopes(name), &self.config)
    }

    /// Authenticates a request.
    ///
    /// Without a header the default client is used, if configured.
    ///
    /// # Errors
    ///
    /// `MissingAuthorization`, `UnsupportedTokenType` or `InvalidToken`.
    pub fn authenticate(&self, header: Option<&str>) -> CoreResult<Caller> {
        let Some(header) = header.map(str::trim).filter(|h| !h.is_empty()) else {
            return match self.config.default_auth_client() {
                Some(client) => Ok(self.client(client)),
                None => Err(ErrorKind::MissingAuthorization.err().into()),
            };
        };
        let (scheme, token) = header.split_once(' ').unwrap_or((header, ""));
        if !scheme.eq_ignore_ascii_case("bearer") {
            return Err(ErrorKind::UnsupportedTokenType
                .err()
                .with("given", scheme)
                .into());
        }
        let claims = self.verify(token.trim())?;
        debug!(client = %claims.client, "token accepted");
        Ok(Caller::new(claims.client, claims.scopes, &self.config))
    }

    /// Validates a token's signature and expiry.
    ///
    /// # Errors
    ///
    /// Returns `InvalidToken`.
    pub fn verify(&self, token: &str) -> CoreResult<Claims> {
        let key = self
            .config
            .token_validation_key()
            .ok_or_else(invalid_token)?;
        let (body, signature) = token.split_once('.').ok_or_else(invalid_token)?;
        let body = URL_SAFE_NO_PAD.decode(body).map_err(|_| invalid_token())?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| invalid_token())?;
        let mut mac = HmacSha256::new_from_slice(key.as_bytes())
            .map_err(|e| CoreError::internal(e.to_string()))?;
        mac.update(&body);
        mac.verify_slice(&signature).map_err(|_| invalid_token())?;
        let claims: Claims = serde_json::from_slice(&body).map_err(|_| invalid_token())?;
        if claims
            .exp
            .is_some_and(|exp| exp <= chrono::Utc::now().timestamp())
        {
            return Err(invalid_token());
        }
        Ok(claims)
    }

    /// Authenticates a client with HTTP basic credentials checked against
    /// `clients.{name}.secret`.
    ///
    /// # Errors
    ///
    /// `BasicAuthRequired` when the header is missing or not basic,
    /// `InvalidToken` for bad credentials.
    pub fn basic_client(&self, header: Option<&str>) -> CoreResult<Caller> {
        let encoded = header
            .and_then(|h| h.trim().split_once(' '))
            .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("basic"))
            .map(|(_, rest)| rest.trim())
            .ok_or_else(|| CoreError::from(ErrorKind::BasicAuthRequired.err()))?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .ok_or_else(invalid_token)?;
        let (name, secret) = decoded.split_once(':').ok_or_else(invalid_token)?;
        let expected = self
            .config
            .get_str(&format!("clients.{name}.secret"))
            .ok_or_else(invalid_token)?;
        if Sha256::digest(secret.as_bytes()) != Sha256::digest(expected.as_bytes()) {
            return Err(invalid_token());
        }
        Ok(self.client(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::load::load_yaml_str;

    fn config() -> Config {
        Config::new()
            .set("token_validation_key", "s3cret")
            .set("clients.reader.scopes", "datagate_getall datagate_getone")
            .set("clients.reader.secret", "pw")
    }

    fn manifest() -> Manifest {
        load_yaml_str(
            r"
type: model
name: example/Report
access: protected
properties:
  status: {type: string}
  note: {type: string, access: private}
---
type: model
name: Open
access: public
properties:
  title: {type: string}
",
        )
        .unwrap()
    }

    #[test]
    fn scope_names() {
        assert_eq!(
            scope_name("datagate_", 60, "example/Report", Action::Getall),
            "datagate_example_report_getall"
        );
        assert_eq!(scope_name("datagate_", 60, "", Action::Wipe), "datagate_wipe");
        let long = scope_name("datagate_", 30, "example/with/a/very/long/model/Name", Action::Getall);
        assert_eq!(long.len(), 30);
        assert_ne!(
            long,
            scope_name("datagate_", 30, "example/with/a/very/long/model/Other", Action::Getall)
        );
    }

    #[test]
    fn access_levels() {
        let m = manifest();
        let cfg = config();
        let report = m.model_by_name("example/Report").unwrap();
        let open = m.model_by_name("Open").unwrap();
        let note = m.find_property(report.id, "note").unwrap();

        let nobody = Caller::new("anon", Vec::new(), &cfg);
        assert!(nobody.can(open, None, Action::Getall));
        assert!(!nobody.can(open, None, Action::Insert));
        assert!(!nobody.can(report, None, Action::Getall));

        let reader = Authenticator::new(&cfg).client("reader");
        assert!(reader.can(report, None, Action::Getall));
        assert!(!reader.can(report, Some(note), Action::Getall));
        let err = reader.authorize(report, Some(note), Action::Getall).unwrap_err();
        assert_eq!(err.code(), "InsufficientScope");
        assert_eq!(err.status(), 403);
        assert_eq!(
            err.context()["scopes"],
            serde_json::json!(["datagate_example_report_note_getall"])
        );
    }

    #[test]
    fn tokens() {
        let cfg = config();
        let auth = Authenticator::new(&cfg);
        let claims = Claims {
            client: "app".into(),
            scopes: vec!["datagate_insert".into()],
            exp: None,
        };
        let token = issue_token(&claims, "s3cret").unwrap();
        let caller = auth.authenticate(Some(&format!("Bearer {token}"))).unwrap();
        assert_eq!(caller.client, "app");
        assert!(caller.scopes.contains("datagate_insert"));

        let forged = issue_token(&claims, "other").unwrap();
        assert_eq!(
            auth.authenticate(Some(&format!("Bearer {forged}"))).unwrap_err().code(),
            "InvalidToken"
        );
        let expired = issue_token(
            &Claims {
                exp: Some(1),
                ..claims
            },
            "s3cret",
        )
        .unwrap();
        assert_eq!(auth.verify(&expired).unwrap_err().code(), "InvalidToken");
        assert_eq!(
            auth.authenticate(Some("Digest abc")).unwrap_err().code(),
            "UnsupportedTokenType"
        );
        assert_eq!(auth.authenticate(None).unwrap_err().code(), "MissingAuthorization");
    }

    #[test]
    fn default_and_basic_clients() {
        let cfg = config().set("default_auth_client", "reader");
        let auth = Authenticator::new(&cfg);
        assert_eq!(auth.authenticate(None).unwrap().client, "reader");

        let header = format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode("reader:pw")
        );
        assert_eq!(auth.basic_client(Some(&header)).unwrap().client, "reader");
        assert_eq!(
            auth.basic_client(Some("Bearer x")).unwrap_err().code(),
            "BasicAuthRequired"
        );
        let wrong = format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode("reader:nope")
        );
        assert_eq!(auth.basic_client(Some(&wrong)).unwrap_err().code(), "InvalidToken");
    }
}
