//! Bearer-token authentication with two fixed scopes.

use crate::config::GatewaySection;
use crate::error::{GatewayError, GatewayResult};
use crate::types::Scope;
use sha3::{Digest, Sha3_256};
use subtle::ConstantTimeEq;

/// Validates presented tokens against the admin and workspace tokens.
///
/// Tokens are fixed for the lifetime of the process.
#[derive(Clone)]
pub struct TokenAuth {
    admin: String,
    workspace: String,
}

impl TokenAuth {
    pub fn new(admin: impl Into<String>, workspace: impl Into<String>) -> Self {
        Self {
            admin: admin.into(),
            workspace: workspace.into(),
        }
    }

    pub fn from_config(gateway: &GatewaySection) -> Self {
        Self::new(&gateway.admin_token, &gateway.workspace_token)
    }

    /// Resolve `presented` to a scope.
    ///
    /// Both comparisons always run, so the timing does not reveal which
    /// token (if any) matched.
    pub fn validate(&self, presented: Option<&str>) -> GatewayResult<Scope> {
        let Some(presented) = presented.filter(|t| !t.is_empty()) else {
            return Err(GatewayError::Unauthorized);
        };
        let is_admin: bool = presented.as_bytes().ct_eq(self.admin.as_bytes()).into();
        let is_workspace: bool = presented
            .as_bytes()
            .ct_eq(self.workspace.as_bytes())
            .into();

        match (is_admin, is_workspace) {
            (true, _) => Ok(Scope::Admin),
            (false, true) => Ok(Scope::Workspace),
            (false, false) => Err(GatewayError::Unauthorized),
        }
    }
}

/// Extract the token from an `Authorization: Bearer <token>` value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|t| !t.is_empty())
}

/// Short SHA3-256 fingerprint safe to put in logs.
pub fn fingerprint(token: &str) -> String {
    let digest = Sha3_256::digest(token.as_bytes());
    hex::encode(&digest[..4])
}
