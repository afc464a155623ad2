//! Static bearer-token identities.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One authenticated identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticIdentity {
    /// Stable account id, used as the viewer id.
    pub id: String,
    /// Display label.
    pub label: String,
}

/// Bearer tokens accepted by the built-in identity resolver.
///
/// Callers presenting no token, or an unknown one, join anonymously.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// Token → identity.
    pub tokens: BTreeMap<String, StaticIdentity>,
}
