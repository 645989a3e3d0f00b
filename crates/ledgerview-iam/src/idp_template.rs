//! Identity provider templates of organizations and instances.
//!
//! The main table holds what every provider type shares; type-specific
//! settings live in suffixed side tables keyed by the same `(instance_id,
//! id)` and removed with their main row. Only OIDC is modelled.

use ledgerview_core::db::schema::{
    Check, ColumnType, ForeignKey, Index, PrimaryKey, SchemaColumn, Table,
};
use ledgerview_core::event::{INSTANCE_AGGREGATE, ORG_AGGREGATE, ORG_REMOVED};
use ledgerview_core::statement::{
    add_create_statement, add_update_statement, new_delete_statement, new_multi_statement,
    new_update_statement, Column, Condition, Value,
};
use ledgerview_core::{AggregateReducer, Event, EventReducer, Projection, ProjectionError, Statement};

use crate::events::{
    IamEvent, INSTANCE_IDP_REMOVED, INSTANCE_OIDC_IDP_ADDED, INSTANCE_OIDC_IDP_CHANGED,
    ORG_IDP_REMOVED, ORG_OIDC_IDP_ADDED, ORG_OIDC_IDP_CHANGED,
};
use crate::{is_org_owned, json_value, wrong_event};

pub const IDP_TEMPLATE_TABLE: &str = "projections.idp_templates4";
pub const IDP_TEMPLATE_OIDC_SUFFIX: &str = "oidc";

pub const ID_COL: &str = "id";
pub const CREATION_DATE_COL: &str = "creation_date";
pub const CHANGE_DATE_COL: &str = "change_date";
pub const SEQUENCE_COL: &str = "sequence";
pub const RESOURCE_OWNER_COL: &str = "resource_owner";
pub const INSTANCE_ID_COL: &str = "instance_id";
pub const STATE_COL: &str = "state";
pub const NAME_COL: &str = "name";
pub const OWNER_TYPE_COL: &str = "owner_type";
pub const TYPE_COL: &str = "type";
pub const OWNER_REMOVED_COL: &str = "owner_removed";
pub const IS_CREATION_ALLOWED_COL: &str = "is_creation_allowed";
pub const IS_LINKING_ALLOWED_COL: &str = "is_linking_allowed";
pub const IS_AUTO_CREATION_COL: &str = "is_auto_creation";
pub const IS_AUTO_UPDATE_COL: &str = "is_auto_update";

pub const OIDC_IDP_ID_COL: &str = "idp_id";
pub const OIDC_INSTANCE_ID_COL: &str = "instance_id";
pub const OIDC_ISSUER_COL: &str = "issuer";
pub const OIDC_CLIENT_ID_COL: &str = "client_id";
pub const OIDC_CLIENT_SECRET_COL: &str = "client_secret";
pub const OIDC_SCOPES_COL: &str = "scopes";
pub const OIDC_ID_TOKEN_MAPPING_COL: &str = "id_token_mapping";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdpState {
    Active = 1,
}

/// Who configured the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdpOwnerType {
    System = 0,
    Org = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdpType {
    Oidc = 1,
}

macro_rules! enum_value {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Self::Int(value as i64)
                }
            }
        )*
    };
}

enum_value!(IdpState, IdpOwnerType, IdpType);

#[derive(Debug, Default, Clone, Copy)]
pub struct IdpTemplateProjection;

impl Projection<IamEvent> for IdpTemplateProjection {
    fn name(&self) -> &str {
        IDP_TEMPLATE_TABLE
    }

    fn reducers(&self) -> Vec<AggregateReducer<IamEvent>> {
        vec![
            AggregateReducer::new(
                ORG_AGGREGATE,
                vec![
                    EventReducer::new(ORG_OIDC_IDP_ADDED, reduce_oidc_added),
                    EventReducer::new(ORG_OIDC_IDP_CHANGED, reduce_oidc_changed),
                    EventReducer::new(ORG_IDP_REMOVED, reduce_removed),
                    EventReducer::new(ORG_REMOVED, reduce_owner_removed),
                ],
            ),
            AggregateReducer::new(
                INSTANCE_AGGREGATE,
                vec![
                    EventReducer::new(INSTANCE_OIDC_IDP_ADDED, reduce_oidc_added),
                    EventReducer::new(INSTANCE_OIDC_IDP_CHANGED, reduce_oidc_changed),
                    EventReducer::new(INSTANCE_IDP_REMOVED, reduce_removed),
                ],
            ),
            AggregateReducer::instance_removed(INSTANCE_ID_COL),
        ]
    }

    fn check(&self) -> Option<Check> {
        let flag = |name: &str| SchemaColumn::new(name, ColumnType::Bool).default("0");
        Some(Check::multi_table(
            Table::new(
                vec![
                    SchemaColumn::new(ID_COL, ColumnType::Text),
                    SchemaColumn::new(CREATION_DATE_COL, ColumnType::Timestamp),
                    SchemaColumn::new(CHANGE_DATE_COL, ColumnType::Timestamp),
                    SchemaColumn::new(SEQUENCE_COL, ColumnType::Int64),
                    SchemaColumn::new(RESOURCE_OWNER_COL, ColumnType::Text),
                    SchemaColumn::new(INSTANCE_ID_COL, ColumnType::Text),
                    SchemaColumn::new(STATE_COL, ColumnType::Enum),
                    SchemaColumn::new(NAME_COL, ColumnType::Text).nullable(),
                    SchemaColumn::new(OWNER_TYPE_COL, ColumnType::Enum),
                    SchemaColumn::new(TYPE_COL, ColumnType::Enum),
                    flag(OWNER_REMOVED_COL),
                    flag(IS_CREATION_ALLOWED_COL),
                    flag(IS_LINKING_ALLOWED_COL),
                    flag(IS_AUTO_CREATION_COL),
                    flag(IS_AUTO_UPDATE_COL),
                ],
                PrimaryKey::new(&[INSTANCE_ID_COL, ID_COL]),
            )
            .with_index(Index::new("owner", &[RESOURCE_OWNER_COL]))
            .with_index(Index::new("owner_removed", &[OWNER_REMOVED_COL])),
            vec![Table::suffixed(
                vec![
                    SchemaColumn::new(OIDC_IDP_ID_COL, ColumnType::Text),
                    SchemaColumn::new(OIDC_INSTANCE_ID_COL, ColumnType::Text),
                    SchemaColumn::new(OIDC_ISSUER_COL, ColumnType::Text),
                    SchemaColumn::new(OIDC_CLIENT_ID_COL, ColumnType::Text),
                    SchemaColumn::new(OIDC_CLIENT_SECRET_COL, ColumnType::Json).nullable(),
                    SchemaColumn::new(OIDC_SCOPES_COL, ColumnType::TextArray).nullable(),
                    flag(OIDC_ID_TOKEN_MAPPING_COL),
                ],
                PrimaryKey::new(&[OIDC_INSTANCE_ID_COL, OIDC_IDP_ID_COL]),
                IDP_TEMPLATE_OIDC_SUFFIX,
            )
            .with_foreign_key(ForeignKey::of_public_keys())],
        ))
    }
}

fn reduce_oidc_added(event: &Event<IamEvent>) -> Result<Statement, ProjectionError> {
    let IamEvent::OidcIdpAdded(idp) = &event.data else {
        return Err(wrong_event(event, &[ORG_OIDC_IDP_ADDED, INSTANCE_OIDC_IDP_ADDED]));
    };
    let owner_type = if is_org_owned(&event.base) {
        IdpOwnerType::Org
    } else {
        IdpOwnerType::System
    };
    let client_secret = match &idp.client_secret {
        Some(secret) => json_value(event, secret)?,
        None => Value::Null,
    };
    Ok(new_multi_statement(
        event,
        vec![
            add_create_statement(vec![
                Column::new(ID_COL, idp.id.as_str()),
                Column::new(CREATION_DATE_COL, event.base.creation_date),
                Column::new(CHANGE_DATE_COL, event.base.creation_date),
                Column::new(SEQUENCE_COL, event.base.sequence),
                Column::new(RESOURCE_OWNER_COL, event.base.resource_owner()),
                Column::new(INSTANCE_ID_COL, event.base.instance_id()),
                Column::new(STATE_COL, IdpState::Active),
                Column::new(NAME_COL, idp.name.as_str()),
                Column::new(OWNER_TYPE_COL, owner_type),
                Column::new(TYPE_COL, IdpType::Oidc),
                Column::new(IS_CREATION_ALLOWED_COL, idp.options.is_creation_allowed),
                Column::new(IS_LINKING_ALLOWED_COL, idp.options.is_linking_allowed),
                Column::new(IS_AUTO_CREATION_COL, idp.options.is_auto_creation),
                Column::new(IS_AUTO_UPDATE_COL, idp.options.is_auto_update),
            ]),
            add_create_statement(vec![
                Column::new(OIDC_IDP_ID_COL, idp.id.as_str()),
                Column::new(OIDC_INSTANCE_ID_COL, event.base.instance_id()),
                Column::new(OIDC_ISSUER_COL, idp.issuer.as_str()),
                Column::new(OIDC_CLIENT_ID_COL, idp.client_id.as_str()),
                Column::new(OIDC_CLIENT_SECRET_COL, client_secret),
                Column::new(OIDC_SCOPES_COL, idp.scopes.clone()),
                Column::new(OIDC_ID_TOKEN_MAPPING_COL, idp.is_id_token_mapping),
            ])
            .with_table_suffix(IDP_TEMPLATE_OIDC_SUFFIX),
        ],
    ))
}

/// The main row always records the change; the OIDC row only when one of
/// its fields changed.
fn reduce_oidc_changed(event: &Event<IamEvent>) -> Result<Statement, ProjectionError> {
    let IamEvent::OidcIdpChanged(idp) = &event.data else {
        return Err(wrong_event(event, &[ORG_OIDC_IDP_CHANGED, INSTANCE_OIDC_IDP_CHANGED]));
    };

    let mut main = Vec::new();
    if let Some(name) = &idp.name {
        main.push(Column::new(NAME_COL, name.as_str()));
    }
    let options = [
        (IS_CREATION_ALLOWED_COL, idp.options.is_creation_allowed),
        (IS_LINKING_ALLOWED_COL, idp.options.is_linking_allowed),
        (IS_AUTO_CREATION_COL, idp.options.is_auto_creation),
        (IS_AUTO_UPDATE_COL, idp.options.is_auto_update),
    ];
    main.extend(
        options
            .into_iter()
            .filter_map(|(name, value)| value.map(|v| Column::new(name, v))),
    );
    main.push(Column::new(CHANGE_DATE_COL, event.base.creation_date));
    main.push(Column::new(SEQUENCE_COL, event.base.sequence));

    let mut oidc = Vec::new();
    if let Some(client_id) = &idp.client_id {
        oidc.push(Column::new(OIDC_CLIENT_ID_COL, client_id.as_str()));
    }
    if let Some(secret) = &idp.client_secret {
        oidc.push(Column::new(OIDC_CLIENT_SECRET_COL, json_value(event, secret)?));
    }
    if let Some(issuer) = &idp.issuer {
        oidc.push(Column::new(OIDC_ISSUER_COL, issuer.as_str()));
    }
    if let Some(scopes) = &idp.scopes {
        oidc.push(Column::new(OIDC_SCOPES_COL, scopes.clone()));
    }
    if let Some(mapping) = idp.is_id_token_mapping {
        oidc.push(Column::new(OIDC_ID_TOKEN_MAPPING_COL, mapping));
    }

    let mut subs = vec![add_update_statement(
        main,
        vec![
            Condition::equals(ID_COL, idp.id.as_str()),
            Condition::equals(INSTANCE_ID_COL, event.base.instance_id()),
        ],
    )];
    if !oidc.is_empty() {
        subs.push(
            add_update_statement(
                oidc,
                vec![
                    Condition::equals(OIDC_IDP_ID_COL, idp.id.as_str()),
                    Condition::equals(OIDC_INSTANCE_ID_COL, event.base.instance_id()),
                ],
            )
            .with_table_suffix(IDP_TEMPLATE_OIDC_SUFFIX),
        );
    }
    Ok(new_multi_statement(event, subs))
}

fn reduce_removed(event: &Event<IamEvent>) -> Result<Statement, ProjectionError> {
    let IamEvent::IdpRemoved(idp) = &event.data else {
        return Err(wrong_event(event, &[ORG_IDP_REMOVED, INSTANCE_IDP_REMOVED]));
    };
    Ok(new_delete_statement(
        event,
        vec![
            Condition::equals(ID_COL, idp.id.as_str()),
            Condition::equals(INSTANCE_ID_COL, event.base.instance_id()),
        ],
    ))
}

/// Providers of a removed organization stay queryable but are flagged.
fn reduce_owner_removed(event: &Event<IamEvent>) -> Result<Statement, ProjectionError> {
    if event.data != IamEvent::OrgRemoved {
        return Err(wrong_event(event, &[ORG_REMOVED]));
    }
    Ok(new_update_statement(
        event,
        vec![
            Column::new(CHANGE_DATE_COL, event.base.creation_date),
            Column::new(SEQUENCE_COL, event.base.sequence),
            Column::new(OWNER_REMOVED_COL, true),
        ],
        vec![
            Condition::equals(INSTANCE_ID_COL, event.base.instance_id()),
            Condition::equals(RESOURCE_OWNER_COL, event.base.aggregate_id()),
        ],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{IdpOptionChanges, IdpOptions, IdpRemoved, OidcIdpAdded, OidcIdpChanged};
    use crate::testing::{event, recorded};
    use ledgerview_core::crypto::CryptoValue;
    use ledgerview_core::statement::Recorder;

    fn secret() -> CryptoValue {
        CryptoValue {
            algorithm: "aes".into(),
            key_id: "key-1".into(),
            crypted: b"secret".to_vec(),
        }
    }

    fn oidc_added(aggregate: &str, event_type: &str) -> Event<IamEvent> {
        event(
            aggregate,
            event_type,
            15,
            IamEvent::OidcIdpAdded(OidcIdpAdded {
                id: "idp-id".into(),
                name: "corporate-sso".into(),
                issuer: "https://issuer".into(),
                client_id: "client_id".into(),
                client_secret: Some(secret()),
                scopes: vec!["profile".into()],
                is_id_token_mapping: true,
                options: IdpOptions {
                    is_creation_allowed: true,
                    is_linking_allowed: true,
                    is_auto_creation: false,
                    is_auto_update: true,
                },
            }),
        )
    }

    fn changed(data: OidcIdpChanged) -> Event<IamEvent> {
        event("org", ORG_OIDC_IDP_CHANGED, 16, IamEvent::OidcIdpChanged(data))
    }

    fn no_changes() -> OidcIdpChanged {
        OidcIdpChanged {
            id: "idp-id".into(),
            name: None,
            issuer: None,
            client_id: None,
            client_secret: None,
            scopes: None,
            is_id_token_mapping: None,
            options: IdpOptionChanges::default(),
        }
    }

    #[test]
    fn oidc_added_writes_main_and_side_table_in_order() {
        let bogus = event("org", ORG_OIDC_IDP_ADDED, 15, IamEvent::OrgRemoved);
        assert!(matches!(
            reduce_oidc_added(&bogus).unwrap_err(),
            ProjectionError::InvalidArgument { .. }
        ));

        let calls = recorded(
            &reduce_oidc_added(&oidc_added("org", ORG_OIDC_IDP_ADDED)).unwrap(),
            IDP_TEMPLATE_TABLE,
        );
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[0].sql,
            "INSERT INTO projections.idp_templates4 (id, creation_date, change_date, sequence, \
             resource_owner, instance_id, state, name, owner_type, type, is_creation_allowed, \
             is_linking_allowed, is_auto_creation, is_auto_update) VALUES (?1, ?2, ?3, ?4, ?5, ?6, \
             ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
        );
        assert_eq!(calls[0].args[0], Value::from("idp-id"));
        assert_eq!(calls[0].args[6], Value::Int(1));
        // ro-id differs from instance-id: organization owned
        assert_eq!(calls[0].args[8], Value::Int(1));
        assert_eq!(calls[0].args[9], Value::Int(1));
        assert_eq!(
            calls[1].sql,
            "INSERT INTO projections.idp_templates4_oidc (idp_id, instance_id, issuer, client_id, \
             client_secret, scopes, id_token_mapping) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
        );
        assert_eq!(
            calls[1].args[4],
            Value::Json(serde_json::json!({
                "algorithm": "aes",
                "key_id": "key-1",
                "crypted": b"secret".to_vec(),
            }))
        );
        assert_eq!(calls[1].args[5], Value::TextArray(vec!["profile".into()]));
    }

    #[test]
    fn instance_owned_provider_is_system_type() {
        let mut added = oidc_added("instance", INSTANCE_OIDC_IDP_ADDED);
        added.base.aggregate.resource_owner = added.base.aggregate.instance_id.clone();
        let calls = recorded(&reduce_oidc_added(&added).unwrap(), IDP_TEMPLATE_TABLE);
        assert_eq!(calls[0].args[8], Value::Int(0));
    }

    #[test]
    fn side_table_insert_is_skipped_when_main_insert_fails() {
        let stmt = reduce_oidc_added(&oidc_added("org", ORG_OIDC_IDP_ADDED)).unwrap();
        let recorder = Recorder::failing_at(1);
        assert!(stmt.execute(&recorder, IDP_TEMPLATE_TABLE).is_err());
        assert_eq!(recorder.calls().len(), 1);
    }

    #[test]
    fn changed_without_oidc_fields_touches_main_row_only() {
        let bogus = changed(no_changes());
        let bogus = Event {
            data: IamEvent::OrgRemoved,
            ..bogus
        };
        assert!(reduce_oidc_changed(&bogus).is_err());

        let calls = recorded(
            &reduce_oidc_changed(&changed(OidcIdpChanged {
                name: Some("renamed".into()),
                ..no_changes()
            }))
            .unwrap(),
            IDP_TEMPLATE_TABLE,
        );
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].sql,
            "UPDATE projections.idp_templates4 SET (name, change_date, sequence) = (?1, ?2, ?3) \
             WHERE (id = ?4) AND (instance_id = ?5)"
        );
    }

    #[test]
    fn changed_oidc_fields_update_side_table() {
        let calls = recorded(
            &reduce_oidc_changed(&changed(OidcIdpChanged {
                issuer: Some("https://new-issuer".into()),
                is_id_token_mapping: Some(false),
                options: IdpOptionChanges {
                    is_auto_update: Some(false),
                    ..IdpOptionChanges::default()
                },
                ..no_changes()
            }))
            .unwrap(),
            IDP_TEMPLATE_TABLE,
        );
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[0].sql,
            "UPDATE projections.idp_templates4 SET (is_auto_update, change_date, sequence) = \
             (?1, ?2, ?3) WHERE (id = ?4) AND (instance_id = ?5)"
        );
        assert_eq!(
            calls[1].sql,
            "UPDATE projections.idp_templates4_oidc SET (issuer, id_token_mapping) = (?1, ?2) \
             WHERE (idp_id = ?3) AND (instance_id = ?4)"
        );
    }

    #[test]
    fn removed_deletes_main_row_by_idp_id() {
        let bogus = event("instance", INSTANCE_IDP_REMOVED, 17, IamEvent::InstanceRemoved);
        assert!(reduce_removed(&bogus).is_err());

        let removed = event(
            "instance",
            INSTANCE_IDP_REMOVED,
            17,
            IamEvent::IdpRemoved(IdpRemoved { id: "idp-id".into() }),
        );
        let calls = recorded(&reduce_removed(&removed).unwrap(), IDP_TEMPLATE_TABLE);
        assert_eq!(
            calls[0].sql,
            "DELETE FROM projections.idp_templates4 WHERE (id = ?1) AND (instance_id = ?2)"
        );
        assert_eq!(calls[0].args[0], Value::from("idp-id"));
    }

    #[test]
    fn owner_removal_flags_rows() {
        let bogus = event("org", ORG_REMOVED, 18, IamEvent::InstanceRemoved);
        assert!(reduce_owner_removed(&bogus).is_err());

        let removed = event("org", ORG_REMOVED, 18, IamEvent::OrgRemoved);
        let calls = recorded(&reduce_owner_removed(&removed).unwrap(), IDP_TEMPLATE_TABLE);
        assert_eq!(
            calls[0].sql,
            "UPDATE projections.idp_templates4 SET (change_date, sequence, owner_removed) = \
             (?1, ?2, ?3) WHERE (instance_id = ?4) AND (resource_owner = ?5)"
        );
        assert_eq!(calls[0].args[2], Value::Bool(true));
        assert_eq!(calls[0].args[4], Value::from("agg-id"));
    }
}
