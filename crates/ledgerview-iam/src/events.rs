//! Typed payloads of the IAM events the read models consume.
//!
//! The discriminant is the `(aggregate type, event type)` pair from the
//! event metadata, never the JSON itself. Policy and IdP events exist on
//! both the `org` and the `instance` aggregate with the aggregate type as
//! event type prefix (`org.policy.label.added`, `instance.idp.removed`);
//! they decode to the same variant and reducers tell them apart by the
//! aggregate type.

use chrono::{DateTime, Utc};
use ledgerview_core::crypto::CryptoValue;
use ledgerview_core::event::{
    decode_json, BaseEvent, DataParseError, INSTANCE_AGGREGATE, INSTANCE_REMOVED, ORG_AGGREGATE,
    ORG_REMOVED,
};
use ledgerview_core::EventData;
use serde::Deserialize;

pub const USER_AGGREGATE: &str = "user";
pub const AUTH_REQUEST_AGGREGATE: &str = "auth_request";
pub const KEY_PAIR_AGGREGATE: &str = "key_pair";

pub const ORG_MEMBER_ADDED: &str = "org.member.added";
pub const ORG_MEMBER_CHANGED: &str = "org.member.changed";
pub const ORG_MEMBER_REMOVED: &str = "org.member.removed";
pub const ORG_MEMBER_CASCADE_REMOVED: &str = "org.member.cascade.removed";
pub const USER_REMOVED: &str = "user.removed";

pub const AUTH_REQUEST_ADDED: &str = "auth_request.added";
pub const AUTH_REQUEST_SUCCEEDED: &str = "auth_request.succeeded";
pub const AUTH_REQUEST_FAILED: &str = "auth_request.failed";

pub const ORG_LABEL_POLICY_ADDED: &str = "org.policy.label.added";
pub const INSTANCE_LABEL_POLICY_ADDED: &str = "instance.policy.label.added";
pub const ORG_LABEL_POLICY_CHANGED: &str = "org.policy.label.changed";
pub const INSTANCE_LABEL_POLICY_CHANGED: &str = "instance.policy.label.changed";
pub const ORG_LABEL_POLICY_ACTIVATED: &str = "org.policy.label.activated";
pub const INSTANCE_LABEL_POLICY_ACTIVATED: &str = "instance.policy.label.activated";
pub const ORG_LABEL_POLICY_REMOVED: &str = "org.policy.label.removed";
pub const ORG_LABEL_POLICY_ASSETS_REMOVED: &str = "org.policy.label.assets.removed";
pub const INSTANCE_LABEL_POLICY_ASSETS_REMOVED: &str = "instance.policy.label.assets.removed";

pub const ORG_OIDC_IDP_ADDED: &str = "org.idp.oidc.added";
pub const INSTANCE_OIDC_IDP_ADDED: &str = "instance.idp.oidc.added";
pub const ORG_OIDC_IDP_CHANGED: &str = "org.idp.oidc.changed";
pub const INSTANCE_OIDC_IDP_CHANGED: &str = "instance.idp.oidc.changed";
pub const ORG_IDP_REMOVED: &str = "org.idp.removed";
pub const INSTANCE_IDP_REMOVED: &str = "instance.idp.removed";

pub const KEY_PAIR_ADDED: &str = "key_pair.added";
pub const KEY_PAIR_CERTIFICATE_ADDED: &str = "key_pair.certificate.added";

/// Every event the IAM projections understand.
#[derive(Debug, Clone, PartialEq)]
pub enum IamEvent {
    OrgMemberAdded(MemberAdded),
    OrgMemberChanged(MemberChanged),
    OrgMemberRemoved(MemberRemoved),
    OrgMemberCascadeRemoved(MemberRemoved),
    UserRemoved,
    AuthRequestAdded(AuthRequestAdded),
    AuthRequestSucceeded,
    AuthRequestFailed(AuthRequestFailed),
    LabelPolicyAdded(LabelPolicyAdded),
    LabelPolicyChanged(LabelPolicyChanged),
    LabelPolicyActivated,
    LabelPolicyRemoved,
    LabelPolicyAssetAdded(LabelAsset, AssetStored),
    LabelPolicyAssetRemoved(LabelAsset),
    LabelPolicyAssetsRemoved,
    OidcIdpAdded(OidcIdpAdded),
    OidcIdpChanged(OidcIdpChanged),
    IdpRemoved(IdpRemoved),
    KeyPairAdded(KeyPairAdded),
    CertificateAdded(CertificateAdded),
    OrgRemoved,
    InstanceRemoved,
}

impl EventData for IamEvent {
    fn decode(base: &BaseEvent, payload: &[u8]) -> Result<Self, DataParseError> {
        let aggregate = base.aggregate_type().as_str();
        let event_type = base.event_type.as_str();
        match (aggregate, event_type) {
            (ORG_AGGREGATE, ORG_MEMBER_ADDED) => {
                return decode_json(base, payload).map(Self::OrgMemberAdded);
            }
            (ORG_AGGREGATE, ORG_MEMBER_CHANGED) => {
                return decode_json(base, payload).map(Self::OrgMemberChanged);
            }
            (ORG_AGGREGATE, ORG_MEMBER_REMOVED) => {
                return decode_json(base, payload).map(Self::OrgMemberRemoved);
            }
            (ORG_AGGREGATE, ORG_MEMBER_CASCADE_REMOVED) => {
                return decode_json(base, payload).map(Self::OrgMemberCascadeRemoved);
            }
            (ORG_AGGREGATE, ORG_REMOVED) => return Ok(Self::OrgRemoved),
            (INSTANCE_AGGREGATE, INSTANCE_REMOVED) => return Ok(Self::InstanceRemoved),
            (USER_AGGREGATE, USER_REMOVED) => return Ok(Self::UserRemoved),
            (AUTH_REQUEST_AGGREGATE, AUTH_REQUEST_ADDED) => {
                return decode_json(base, payload).map(Self::AuthRequestAdded);
            }
            (AUTH_REQUEST_AGGREGATE, AUTH_REQUEST_SUCCEEDED) => {
                return Ok(Self::AuthRequestSucceeded);
            }
            (AUTH_REQUEST_AGGREGATE, AUTH_REQUEST_FAILED) => {
                return decode_json(base, payload).map(Self::AuthRequestFailed);
            }
            (KEY_PAIR_AGGREGATE, KEY_PAIR_ADDED) => {
                return decode_json(base, payload).map(Self::KeyPairAdded);
            }
            (KEY_PAIR_AGGREGATE, KEY_PAIR_CERTIFICATE_ADDED) => {
                return decode_json(base, payload).map(Self::CertificateAdded);
            }
            _ => {}
        }
        match scoped_subject(aggregate, event_type) {
            Some(subject) => decode_scoped(base, subject, payload),
            None => Err(DataParseError::unknown(base)),
        }
    }
}

/// `policy.label.added` for `org.policy.label.added` on an `org` aggregate.
fn scoped_subject<'a>(aggregate: &str, event_type: &'a str) -> Option<&'a str> {
    if aggregate != ORG_AGGREGATE && aggregate != INSTANCE_AGGREGATE {
        return None;
    }
    event_type.strip_prefix(aggregate)?.strip_prefix('.')
}

fn decode_scoped(base: &BaseEvent, subject: &str, payload: &[u8]) -> Result<IamEvent, DataParseError> {
    match subject {
        "policy.label.added" => decode_json(base, payload).map(IamEvent::LabelPolicyAdded),
        "policy.label.changed" => decode_json(base, payload).map(IamEvent::LabelPolicyChanged),
        "policy.label.activated" => Ok(IamEvent::LabelPolicyActivated),
        "policy.label.removed" => Ok(IamEvent::LabelPolicyRemoved),
        "policy.label.assets.removed" => Ok(IamEvent::LabelPolicyAssetsRemoved),
        "idp.oidc.added" => decode_json(base, payload).map(IamEvent::OidcIdpAdded),
        "idp.oidc.changed" => decode_json(base, payload).map(IamEvent::OidcIdpChanged),
        "idp.removed" => decode_json(base, payload).map(IamEvent::IdpRemoved),
        other => {
            let asset = other
                .strip_prefix("policy.label.")
                .and_then(LabelAsset::parse_event)
                .ok_or_else(|| DataParseError::unknown(base))?;
            match asset {
                (asset, true) => {
                    decode_json(base, payload).map(|stored| IamEvent::LabelPolicyAssetAdded(asset, stored))
                }
                (asset, false) => Ok(IamEvent::LabelPolicyAssetRemoved(asset)),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Org members
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberAdded {
    pub user_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberChanged {
    pub user_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberRemoved {
    pub user_id: String,
}

// ---------------------------------------------------------------------------
// Auth requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AuthRequestAdded {
    pub login_client: String,
    pub client_id: String,
    #[serde(default)]
    pub redirect_uri: String,
    #[serde(default)]
    pub scope: Vec<String>,
    /// Prompt discriminants as sent by the client.
    #[serde(default)]
    pub prompt: Vec<i64>,
    #[serde(default)]
    pub ui_locales: Vec<String>,
    /// Seconds.
    pub max_age: Option<i64>,
    pub login_hint: Option<String>,
    pub hint_user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct AuthRequestFailed {
    pub reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Label policies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LabelPolicyAdded {
    pub primary_color: String,
    pub background_color: String,
    pub warn_color: String,
    pub font_color: String,
    pub primary_color_dark: String,
    pub background_color_dark: String,
    pub warn_color_dark: String,
    pub font_color_dark: String,
    pub hide_login_name_suffix: bool,
    pub error_msg_popup: bool,
    pub disable_watermark: bool,
}

/// Only the fields present in the payload changed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LabelPolicyChanged {
    pub primary_color: Option<String>,
    pub background_color: Option<String>,
    pub warn_color: Option<String>,
    pub font_color: Option<String>,
    pub primary_color_dark: Option<String>,
    pub background_color_dark: Option<String>,
    pub warn_color_dark: Option<String>,
    pub font_color_dark: Option<String>,
    pub hide_login_name_suffix: Option<bool>,
    pub error_msg_popup: Option<bool>,
    pub disable_watermark: Option<bool>,
}

/// Uploaded files of a label policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelAsset {
    Logo,
    LogoDark,
    Icon,
    IconDark,
    Font,
}

impl LabelAsset {
    pub const ALL: [Self; 5] = [Self::Logo, Self::LogoDark, Self::Icon, Self::IconDark, Self::Font];

    /// Event subject below `policy.label.`, e.g. `logo.dark`.
    #[must_use]
    pub const fn subject(self) -> &'static str {
        match self {
            Self::Logo => "logo",
            Self::LogoDark => "logo.dark",
            Self::Icon => "icon",
            Self::IconDark => "icon.dark",
            Self::Font => "font",
        }
    }

    /// `<aggregate>.policy.label.<subject>.<added|removed>`.
    #[must_use]
    pub fn event_type(self, aggregate: &str, added: bool) -> String {
        let verb = if added { "added" } else { "removed" };
        format!("{aggregate}.policy.label.{}.{verb}", self.subject())
    }

    /// Parse `logo.dark.added` into `(LogoDark, true)`.
    fn parse_event(rest: &str) -> Option<(Self, bool)> {
        let (subject, added) = if let Some(subject) = rest.strip_suffix(".added") {
            (subject, true)
        } else {
            (rest.strip_suffix(".removed")?, false)
        };
        Self::ALL
            .into_iter()
            .find(|asset| asset.subject() == subject)
            .map(|asset| (asset, added))
    }
}

/// Location of an uploaded asset in the asset store.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetStored {
    pub store_key: String,
}

// ---------------------------------------------------------------------------
// Identity providers
// ---------------------------------------------------------------------------

/// Linking and provisioning behaviour shared by all IdP types.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IdpOptions {
    pub is_creation_allowed: bool,
    pub is_linking_allowed: bool,
    pub is_auto_creation: bool,
    pub is_auto_update: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IdpOptionChanges {
    pub is_creation_allowed: Option<bool>,
    pub is_linking_allowed: Option<bool>,
    pub is_auto_creation: Option<bool>,
    pub is_auto_update: Option<bool>,
}

impl IdpOptionChanges {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.is_creation_allowed.is_none()
            && self.is_linking_allowed.is_none()
            && self.is_auto_creation.is_none()
            && self.is_auto_update.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OidcIdpAdded {
    /// IdP id; the aggregate is the owning org or instance.
    pub id: String,
    pub name: String,
    pub issuer: String,
    pub client_id: String,
    pub client_secret: Option<CryptoValue>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default, rename = "idTokenMapping")]
    pub is_id_token_mapping: bool,
    #[serde(flatten)]
    pub options: IdpOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OidcIdpChanged {
    pub id: String,
    pub name: Option<String>,
    pub issuer: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<CryptoValue>,
    pub scopes: Option<Vec<String>>,
    #[serde(rename = "idTokenMapping")]
    pub is_id_token_mapping: Option<bool>,
    #[serde(flatten)]
    pub options: IdpOptionChanges,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IdpRemoved {
    pub id: String,
}

// ---------------------------------------------------------------------------
// Signing keys
// ---------------------------------------------------------------------------

/// An encrypted key half with its expiry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExpiringKey {
    pub key: CryptoValue,
    pub expiry: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPairAdded {
    /// Key usage discriminant, 0 for token signing.
    #[serde(default)]
    pub usage: i64,
    pub algorithm: String,
    pub private_key: ExpiringKey,
    pub public_key: ExpiringKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CertificateAdded {
    pub certificate: ExpiringKey,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::base;

    fn decode(aggregate: &str, event_type: &str, payload: &str) -> Result<IamEvent, DataParseError> {
        IamEvent::decode(&base(aggregate, event_type, 1), payload.as_bytes())
    }

    #[test]
    fn decodes_direct_pairs() {
        let event = decode("org", ORG_MEMBER_ADDED, r#"{"userId":"u1","roles":["ORG_OWNER"]}"#).unwrap();
        assert_eq!(
            event,
            IamEvent::OrgMemberAdded(MemberAdded {
                user_id: "u1".into(),
                roles: vec!["ORG_OWNER".into()],
            })
        );
        assert_eq!(decode("instance", INSTANCE_REMOVED, "").unwrap(), IamEvent::InstanceRemoved);
        assert_eq!(decode("user", USER_REMOVED, "").unwrap(), IamEvent::UserRemoved);
    }

    #[test]
    fn scoped_events_decode_for_both_aggregates() {
        for (aggregate, event_type) in [("org", ORG_IDP_REMOVED), ("instance", INSTANCE_IDP_REMOVED)] {
            let event = decode(aggregate, event_type, r#"{"id":"idp-1"}"#).unwrap();
            assert_eq!(event, IamEvent::IdpRemoved(IdpRemoved { id: "idp-1".into() }));
        }
    }

    #[test]
    fn scoped_prefix_must_match_aggregate() {
        let err = decode("org", INSTANCE_IDP_REMOVED, r#"{"id":"idp-1"}"#).unwrap_err();
        assert!(matches!(err, DataParseError::Unknown { .. }));
    }

    #[test]
    fn asset_events_carry_their_asset() {
        let event = decode("org", "org.policy.label.logo.dark.added", r#"{"storeKey":"k"}"#).unwrap();
        assert_eq!(
            event,
            IamEvent::LabelPolicyAssetAdded(LabelAsset::LogoDark, AssetStored { store_key: "k".into() })
        );
        let event = decode("instance", "instance.policy.label.font.removed", "").unwrap();
        assert_eq!(event, IamEvent::LabelPolicyAssetRemoved(LabelAsset::Font));
        assert!(decode("org", "org.policy.label.banner.added", "{}").is_err());
    }

    #[test]
    fn label_policy_changed_keeps_absent_fields_unset() {
        let event = decode("org", ORG_LABEL_POLICY_CHANGED, r##"{"primaryColor":"#fff"}"##).unwrap();
        let IamEvent::LabelPolicyChanged(changed) = event else {
            panic!("unexpected {event:?}");
        };
        assert_eq!(changed.primary_color.as_deref(), Some("#fff"));
        assert_eq!(changed.hide_login_name_suffix, None);
    }

    #[test]
    fn oidc_added_reads_flattened_options() {
        let event = decode(
            "org",
            ORG_OIDC_IDP_ADDED,
            r#"{"id":"idp","name":"n","issuer":"https://issuer","clientId":"c",
                "scopes":["openid"],"idTokenMapping":true,"isLinkingAllowed":true}"#,
        )
        .unwrap();
        let IamEvent::OidcIdpAdded(added) = event else {
            panic!("unexpected {event:?}");
        };
        assert!(added.is_id_token_mapping);
        assert!(added.options.is_linking_allowed);
        assert!(!added.options.is_creation_allowed);
        assert!(added.client_secret.is_none());
    }

    #[test]
    fn unknown_pair_is_rejected() {
        let err = decode("project", "project.added", "{}").unwrap_err();
        assert!(matches!(err, DataParseError::Unknown { .. }));
    }

    #[test]
    fn missing_required_field_is_a_payload_error() {
        let err = decode("auth_request", AUTH_REQUEST_ADDED, r#"{"client_id":"c"}"#).unwrap_err();
        assert!(matches!(err, DataParseError::Payload { .. }));
    }
}
