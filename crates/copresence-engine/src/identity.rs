//! Caller identity and display assignment.
//!
//! Authenticated callers bring their own id and label from the
//! [`IdentityResolver`]. Everyone else gets the room's next anonymous
//! number; that numbering lives in the room coordinator, not here.

use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use async_trait::async_trait;
use copresence_core::{SessionToken, ViewerId};
use copresence_settings::AuthSettings;

/// Cursor colors handed out at join.
pub const PALETTE: [&str; 12] = [
    "#e6194b", "#3cb44b", "#4363d8", "#f58231", "#911eb4", "#42d4f4", "#f032e6", "#469990",
    "#9a6324", "#800000", "#808000", "#000075",
];

/// What the transport knows about the caller.
#[derive(Clone, Debug, Default)]
pub struct CallerContext {
    /// Bearer token, if one was presented.
    pub bearer: Option<String>,
    /// Token from an earlier session, for reconnect.
    pub resume_token: Option<SessionToken>,
    /// Peer address, for logs only.
    pub remote_addr: Option<String>,
}

impl CallerContext {
    /// Context with no credentials.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Context carrying a bearer token.
    pub fn with_bearer(token: impl Into<String>) -> Self {
        Self {
            bearer: Some(token.into()),
            ..Self::default()
        }
    }

    /// Attach a resume token.
    #[must_use]
    pub fn resuming(mut self, token: SessionToken) -> Self {
        self.resume_token = Some(token);
        self
    }
}

/// Outcome of identity resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResolvedIdentity {
    /// A known account.
    Authenticated {
        /// Stable account id.
        stable_id: ViewerId,
        /// Display label.
        display_label: String,
    },
    /// No usable credentials.
    Anonymous,
}

/// Turns a caller context into an identity.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Resolve the caller. Failure to authenticate is `Anonymous`, not an error.
    async fn resolve_identity(&self, ctx: &CallerContext) -> ResolvedIdentity;
}

/// Treats every caller as anonymous.
#[derive(Clone, Copy, Debug, Default)]
pub struct AnonymousResolver;

#[async_trait]
impl IdentityResolver for AnonymousResolver {
    async fn resolve_identity(&self, _ctx: &CallerContext) -> ResolvedIdentity {
        ResolvedIdentity::Anonymous
    }
}

/// Looks bearer tokens up in a fixed table.
#[derive(Clone, Debug, Default)]
pub struct StaticTokenResolver {
    tokens: BTreeMap<String, (ViewerId, String)>,
}

impl StaticTokenResolver {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one token.
    #[must_use]
    pub fn with_token(
        mut self,
        token: impl Into<String>,
        id: impl Into<ViewerId>,
        label: impl Into<String>,
    ) -> Self {
        let _ = self.tokens.insert(token.into(), (id.into(), label.into()));
        self
    }
}

impl From<&AuthSettings> for StaticTokenResolver {
    fn from(auth: &AuthSettings) -> Self {
        auth.tokens
            .iter()
            .fold(Self::new(), |resolver, (token, ident)| {
                resolver.with_token(token.clone(), ident.id.as_str(), ident.label.clone())
            })
    }
}

#[async_trait]
impl IdentityResolver for StaticTokenResolver {
    async fn resolve_identity(&self, ctx: &CallerContext) -> ResolvedIdentity {
        let Some(token) = ctx.bearer.as_deref() else {
            return ResolvedIdentity::Anonymous;
        };
        match self.tokens.get(token) {
            Some((id, label)) => ResolvedIdentity::Authenticated {
                stable_id: id.clone(),
                display_label: label.clone(),
            },
            None => {
                tracing::debug!(remote = ?ctx.remote_addr, "unknown bearer token, joining anonymously");
                ResolvedIdentity::Anonymous
            }
        }
    }
}

/// Label for the `n`th anonymous viewer of a room.
pub fn anonymous_label(n: u64) -> String {
    format!("Anonymous User {n}")
}

/// Color for an anonymous viewer: walks the palette in join order.
pub fn anonymous_color(n: u64) -> &'static str {
    let len = PALETTE.len() as u64;
    #[allow(clippy::cast_possible_truncation)]
    let idx = (n.saturating_sub(1) % len) as usize;
    PALETTE[idx]
}

/// Color for an authenticated viewer: stable for a given id.
pub fn account_color(viewer_id: &ViewerId) -> &'static str {
    let mut hasher = DefaultHasher::new();
    viewer_id.hash(&mut hasher);
    #[allow(clippy::cast_possible_truncation)]
    let idx = (hasher.finish() % PALETTE.len() as u64) as usize;
    PALETTE[idx]
}
