//! Pending OIDC auth requests. A row lives from `auth_request.added` until
//! the request succeeds or fails.

use ledgerview_core::db::schema::{Check, ColumnType, PrimaryKey, SchemaColumn, Table};
use ledgerview_core::statement::{new_create_statement, new_delete_statement, Column, Condition};
use ledgerview_core::{AggregateReducer, Event, EventReducer, Projection, ProjectionError, Statement};

use crate::events::{
    IamEvent, AUTH_REQUEST_ADDED, AUTH_REQUEST_AGGREGATE, AUTH_REQUEST_FAILED,
    AUTH_REQUEST_SUCCEEDED,
};
use crate::wrong_event;

pub const AUTH_REQUEST_TABLE: &str = "projections.auth_requests";

pub const ID_COL: &str = "id";
pub const CREATION_DATE_COL: &str = "creation_date";
pub const CHANGE_DATE_COL: &str = "change_date";
pub const RESOURCE_OWNER_COL: &str = "resource_owner";
pub const INSTANCE_ID_COL: &str = "instance_id";
pub const SEQUENCE_COL: &str = "sequence";
pub const LOGIN_CLIENT_COL: &str = "login_client";
pub const CLIENT_ID_COL: &str = "client_id";
pub const REDIRECT_URI_COL: &str = "redirect_uri";
pub const SCOPE_COL: &str = "scope";
pub const PROMPT_COL: &str = "prompt";
pub const UI_LOCALES_COL: &str = "ui_locales";
pub const MAX_AGE_COL: &str = "max_age";
pub const LOGIN_HINT_COL: &str = "login_hint";
pub const HINT_USER_ID_COL: &str = "hint_user_id";

#[derive(Debug, Default, Clone, Copy)]
pub struct AuthRequestProjection;

impl Projection<IamEvent> for AuthRequestProjection {
    fn name(&self) -> &str {
        AUTH_REQUEST_TABLE
    }

    fn reducers(&self) -> Vec<AggregateReducer<IamEvent>> {
        vec![
            AggregateReducer::new(
                AUTH_REQUEST_AGGREGATE,
                vec![
                    EventReducer::new(AUTH_REQUEST_ADDED, reduce_added),
                    EventReducer::new(AUTH_REQUEST_SUCCEEDED, reduce_ended),
                    EventReducer::new(AUTH_REQUEST_FAILED, reduce_ended),
                ],
            ),
            AggregateReducer::instance_removed(INSTANCE_ID_COL),
        ]
    }

    fn check(&self) -> Option<Check> {
        Some(Check::table(Table::new(
            vec![
                SchemaColumn::new(ID_COL, ColumnType::Text),
                SchemaColumn::new(CREATION_DATE_COL, ColumnType::Timestamp),
                SchemaColumn::new(CHANGE_DATE_COL, ColumnType::Timestamp),
                SchemaColumn::new(RESOURCE_OWNER_COL, ColumnType::Text),
                SchemaColumn::new(INSTANCE_ID_COL, ColumnType::Text),
                SchemaColumn::new(SEQUENCE_COL, ColumnType::Int64),
                SchemaColumn::new(LOGIN_CLIENT_COL, ColumnType::Text),
                SchemaColumn::new(CLIENT_ID_COL, ColumnType::Text),
                SchemaColumn::new(REDIRECT_URI_COL, ColumnType::Text),
                SchemaColumn::new(SCOPE_COL, ColumnType::TextArray),
                SchemaColumn::new(PROMPT_COL, ColumnType::Json).nullable(),
                SchemaColumn::new(UI_LOCALES_COL, ColumnType::TextArray).nullable(),
                SchemaColumn::new(MAX_AGE_COL, ColumnType::Int64).nullable(),
                SchemaColumn::new(LOGIN_HINT_COL, ColumnType::Text).nullable(),
                SchemaColumn::new(HINT_USER_ID_COL, ColumnType::Text).nullable(),
            ],
            PrimaryKey::new(&[INSTANCE_ID_COL, ID_COL]),
        )))
    }
}

fn reduce_added(event: &Event<IamEvent>) -> Result<Statement, ProjectionError> {
    let IamEvent::AuthRequestAdded(request) = &event.data else {
        return Err(wrong_event(event, &[AUTH_REQUEST_ADDED]));
    };
    Ok(new_create_statement(
        event,
        vec![
            Column::new(ID_COL, event.base.aggregate_id()),
            Column::new(CREATION_DATE_COL, event.base.creation_date),
            Column::new(CHANGE_DATE_COL, event.base.creation_date),
            Column::new(RESOURCE_OWNER_COL, event.base.resource_owner()),
            Column::new(INSTANCE_ID_COL, event.base.instance_id()),
            Column::new(SEQUENCE_COL, event.base.sequence),
            Column::new(LOGIN_CLIENT_COL, request.login_client.as_str()),
            Column::new(CLIENT_ID_COL, request.client_id.as_str()),
            Column::new(REDIRECT_URI_COL, request.redirect_uri.as_str()),
            Column::new(SCOPE_COL, request.scope.clone()),
            Column::new(PROMPT_COL, request.prompt.clone()),
            Column::new(UI_LOCALES_COL, request.ui_locales.clone()),
            Column::new(MAX_AGE_COL, request.max_age),
            Column::new(LOGIN_HINT_COL, request.login_hint.clone()),
            Column::new(HINT_USER_ID_COL, request.hint_user_id.clone()),
        ],
    ))
}

fn reduce_ended(event: &Event<IamEvent>) -> Result<Statement, ProjectionError> {
    if !matches!(
        event.data,
        IamEvent::AuthRequestSucceeded | IamEvent::AuthRequestFailed(_)
    ) {
        return Err(wrong_event(event, &[AUTH_REQUEST_SUCCEEDED, AUTH_REQUEST_FAILED]));
    }
    Ok(new_delete_statement(
        event,
        vec![
            Condition::equals(ID_COL, event.base.aggregate_id()),
            Condition::equals(INSTANCE_ID_COL, event.base.instance_id()),
        ],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{AuthRequestAdded, AuthRequestFailed};
    use crate::testing::{event, recorded};
    use ledgerview_core::statement::Value;

    fn added_request() -> AuthRequestAdded {
        AuthRequestAdded {
            login_client: "loginClient".into(),
            client_id: "clientId".into(),
            redirect_uri: "https://app/callback".into(),
            scope: vec!["openid".into()],
            prompt: vec![0],
            ui_locales: Vec::new(),
            max_age: None,
            login_hint: None,
            hint_user_id: None,
        }
    }

    #[test]
    fn added_inserts_fifteen_columns() {
        let bogus = event("auth_request", AUTH_REQUEST_ADDED, 15, IamEvent::AuthRequestSucceeded);
        assert!(matches!(
            reduce_added(&bogus).unwrap_err(),
            ProjectionError::InvalidArgument { .. }
        ));

        let added = event(
            "auth_request",
            AUTH_REQUEST_ADDED,
            15,
            IamEvent::AuthRequestAdded(added_request()),
        );
        let calls = recorded(&reduce_added(&added).unwrap(), AUTH_REQUEST_TABLE);
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].sql,
            "INSERT INTO projections.auth_requests (id, creation_date, change_date, resource_owner, \
             instance_id, sequence, login_client, client_id, redirect_uri, scope, prompt, \
             ui_locales, max_age, login_hint, hint_user_id) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, \
             ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
        );
        assert_eq!(
            calls[0].args,
            vec![
                Value::from("agg-id"),
                Value::Timestamp(added.base.creation_date),
                Value::Timestamp(added.base.creation_date),
                Value::from("ro-id"),
                Value::from("instance-id"),
                Value::Int(15),
                Value::from("loginClient"),
                Value::from("clientId"),
                Value::from("https://app/callback"),
                Value::TextArray(vec!["openid".into()]),
                Value::IntArray(vec![0]),
                Value::TextArray(Vec::new()),
                Value::Null,
                Value::Null,
                Value::Null,
            ]
        );
    }

    #[test]
    fn success_and_failure_delete_the_request() {
        for (event_type, data) in [
            (AUTH_REQUEST_SUCCEEDED, IamEvent::AuthRequestSucceeded),
            (AUTH_REQUEST_FAILED, IamEvent::AuthRequestFailed(AuthRequestFailed::default())),
        ] {
            let calls = recorded(
                &reduce_ended(&event("auth_request", event_type, 16, data)).unwrap(),
                AUTH_REQUEST_TABLE,
            );
            assert_eq!(
                calls[0].sql,
                "DELETE FROM projections.auth_requests WHERE (id = ?1) AND (instance_id = ?2)"
            );
        }
        let bogus = event("auth_request", AUTH_REQUEST_FAILED, 16, IamEvent::UserRemoved);
        assert!(reduce_ended(&bogus).is_err());
    }
}
