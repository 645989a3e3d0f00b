//! Members of an organization and their roles.

use ledgerview_core::db::schema::{Check, ColumnType, Index, PrimaryKey, SchemaColumn, Table};
use ledgerview_core::event::ORG_AGGREGATE;
use ledgerview_core::statement::{
    new_create_statement, new_delete_statement, new_update_statement, Column, Condition,
};
use ledgerview_core::{AggregateReducer, Event, EventReducer, Projection, ProjectionError, Statement};

use crate::events::{
    IamEvent, ORG_MEMBER_ADDED, ORG_MEMBER_CASCADE_REMOVED, ORG_MEMBER_CHANGED,
    ORG_MEMBER_REMOVED, USER_AGGREGATE, USER_REMOVED,
};
use crate::wrong_event;

pub const ORG_MEMBER_TABLE: &str = "projections.org_members2";

pub const USER_ID_COL: &str = "user_id";
pub const ROLES_COL: &str = "roles";
pub const CREATION_DATE_COL: &str = "creation_date";
pub const CHANGE_DATE_COL: &str = "change_date";
pub const SEQUENCE_COL: &str = "sequence";
pub const RESOURCE_OWNER_COL: &str = "resource_owner";
pub const INSTANCE_ID_COL: &str = "instance_id";
pub const ORG_ID_COL: &str = "org_id";

#[derive(Debug, Default, Clone, Copy)]
pub struct OrgMemberProjection;

impl Projection<IamEvent> for OrgMemberProjection {
    fn name(&self) -> &str {
        ORG_MEMBER_TABLE
    }

    fn reducers(&self) -> Vec<AggregateReducer<IamEvent>> {
        vec![
            AggregateReducer::new(
                ORG_AGGREGATE,
                vec![
                    EventReducer::new(ORG_MEMBER_ADDED, reduce_added),
                    EventReducer::new(ORG_MEMBER_CHANGED, reduce_changed),
                    EventReducer::new(ORG_MEMBER_REMOVED, reduce_removed),
                    EventReducer::new(ORG_MEMBER_CASCADE_REMOVED, reduce_removed),
                ],
            ),
            AggregateReducer::new(
                USER_AGGREGATE,
                vec![EventReducer::new(USER_REMOVED, reduce_user_removed)],
            ),
            AggregateReducer::org_removed(INSTANCE_ID_COL, ORG_ID_COL),
            AggregateReducer::instance_removed(INSTANCE_ID_COL),
        ]
    }

    fn check(&self) -> Option<Check> {
        Some(Check::table(
            Table::new(
                vec![
                    SchemaColumn::new(USER_ID_COL, ColumnType::Text),
                    SchemaColumn::new(ROLES_COL, ColumnType::TextArray).default("'[]'"),
                    SchemaColumn::new(CREATION_DATE_COL, ColumnType::Timestamp),
                    SchemaColumn::new(CHANGE_DATE_COL, ColumnType::Timestamp),
                    SchemaColumn::new(SEQUENCE_COL, ColumnType::Int64),
                    SchemaColumn::new(RESOURCE_OWNER_COL, ColumnType::Text),
                    SchemaColumn::new(INSTANCE_ID_COL, ColumnType::Text),
                    SchemaColumn::new(ORG_ID_COL, ColumnType::Text),
                ],
                PrimaryKey::new(&[INSTANCE_ID_COL, ORG_ID_COL, USER_ID_COL]),
            )
            .with_index(Index::new("user", &[INSTANCE_ID_COL, USER_ID_COL])),
        ))
    }
}

fn reduce_added(event: &Event<IamEvent>) -> Result<Statement, ProjectionError> {
    let IamEvent::OrgMemberAdded(member) = &event.data else {
        return Err(wrong_event(event, &[ORG_MEMBER_ADDED]));
    };
    Ok(new_create_statement(
        event,
        vec![
            Column::new(USER_ID_COL, member.user_id.as_str()),
            Column::new(ROLES_COL, member.roles.clone()),
            Column::new(CREATION_DATE_COL, event.base.creation_date),
            Column::new(CHANGE_DATE_COL, event.base.creation_date),
            Column::new(SEQUENCE_COL, event.base.sequence),
            Column::new(RESOURCE_OWNER_COL, event.base.resource_owner()),
            Column::new(INSTANCE_ID_COL, event.base.instance_id()),
            Column::new(ORG_ID_COL, event.base.aggregate_id()),
        ],
    ))
}

fn member_key(event: &Event<IamEvent>, user_id: &str) -> Vec<Condition> {
    vec![
        Condition::equals(INSTANCE_ID_COL, event.base.instance_id()),
        Condition::equals(ORG_ID_COL, event.base.aggregate_id()),
        Condition::equals(USER_ID_COL, user_id),
    ]
}

fn reduce_changed(event: &Event<IamEvent>) -> Result<Statement, ProjectionError> {
    let IamEvent::OrgMemberChanged(member) = &event.data else {
        return Err(wrong_event(event, &[ORG_MEMBER_CHANGED]));
    };
    Ok(new_update_statement(
        event,
        vec![
            Column::new(ROLES_COL, member.roles.clone()),
            Column::new(CHANGE_DATE_COL, event.base.creation_date),
            Column::new(SEQUENCE_COL, event.base.sequence),
        ],
        member_key(event, &member.user_id),
    ))
}

fn reduce_removed(event: &Event<IamEvent>) -> Result<Statement, ProjectionError> {
    let (IamEvent::OrgMemberRemoved(member) | IamEvent::OrgMemberCascadeRemoved(member)) = &event.data
    else {
        return Err(wrong_event(event, &[ORG_MEMBER_REMOVED, ORG_MEMBER_CASCADE_REMOVED]));
    };
    Ok(new_delete_statement(event, member_key(event, &member.user_id)))
}

/// A deleted user loses every membership in its tenant.
fn reduce_user_removed(event: &Event<IamEvent>) -> Result<Statement, ProjectionError> {
    if event.data != IamEvent::UserRemoved {
        return Err(wrong_event(event, &[USER_REMOVED]));
    }
    Ok(new_delete_statement(
        event,
        vec![
            Condition::equals(INSTANCE_ID_COL, event.base.instance_id()),
            Condition::equals(USER_ID_COL, event.base.aggregate_id()),
        ],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{MemberAdded, MemberChanged, MemberRemoved};
    use crate::testing::{event, recorded};
    use ledgerview_core::statement::Value;

    fn added() -> Event<IamEvent> {
        event(
            "org",
            ORG_MEMBER_ADDED,
            15,
            IamEvent::OrgMemberAdded(MemberAdded {
                user_id: "user-id".into(),
                roles: vec!["role".into()],
            }),
        )
    }

    #[test]
    fn added_inserts_member_in_fixed_column_order() {
        let bogus = event("org", ORG_MEMBER_ADDED, 15, IamEvent::UserRemoved);
        let err = reduce_added(&bogus).unwrap_err();
        assert!(matches!(err, ProjectionError::InvalidArgument { .. }));

        let stmt = reduce_added(&added()).unwrap();
        let calls = recorded(&stmt, ORG_MEMBER_TABLE);
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].sql,
            "INSERT INTO projections.org_members2 (user_id, roles, creation_date, change_date, \
             sequence, resource_owner, instance_id, org_id) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
        );
        let created = added().base.creation_date;
        assert_eq!(
            calls[0].args,
            vec![
                Value::from("user-id"),
                Value::TextArray(vec!["role".into()]),
                Value::Timestamp(created),
                Value::Timestamp(created),
                Value::Int(15),
                Value::from("ro-id"),
                Value::from("instance-id"),
                Value::from("agg-id"),
            ]
        );
    }

    #[test]
    fn added_is_deterministic() {
        let first = reduce_added(&added()).unwrap().render(ORG_MEMBER_TABLE).unwrap();
        let second = reduce_added(&added()).unwrap().render(ORG_MEMBER_TABLE).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn changed_updates_roles_of_one_member() {
        let bogus = event("org", ORG_MEMBER_CHANGED, 16, IamEvent::UserRemoved);
        assert!(reduce_changed(&bogus).is_err());

        let changed = event(
            "org",
            ORG_MEMBER_CHANGED,
            16,
            IamEvent::OrgMemberChanged(MemberChanged {
                user_id: "user-id".into(),
                roles: vec!["owner".into(), "viewer".into()],
            }),
        );
        let calls = recorded(&reduce_changed(&changed).unwrap(), ORG_MEMBER_TABLE);
        assert_eq!(
            calls[0].sql,
            "UPDATE projections.org_members2 SET (roles, change_date, sequence) = (?1, ?2, ?3) \
             WHERE (instance_id = ?4) AND (org_id = ?5) AND (user_id = ?6)"
        );
        assert_eq!(calls[0].args[0], Value::TextArray(vec!["owner".into(), "viewer".into()]));
        assert_eq!(calls[0].args[5], Value::from("user-id"));
    }

    #[test]
    fn removed_and_cascade_removed_delete_the_member() {
        for data in [
            IamEvent::OrgMemberRemoved(MemberRemoved { user_id: "user-id".into() }),
            IamEvent::OrgMemberCascadeRemoved(MemberRemoved { user_id: "user-id".into() }),
        ] {
            let calls = recorded(
                &reduce_removed(&event("org", ORG_MEMBER_REMOVED, 17, data)).unwrap(),
                ORG_MEMBER_TABLE,
            );
            assert_eq!(
                calls[0].sql,
                "DELETE FROM projections.org_members2 \
                 WHERE (instance_id = ?1) AND (org_id = ?2) AND (user_id = ?3)"
            );
        }
        let bogus = event("org", ORG_MEMBER_REMOVED, 17, IamEvent::OrgRemoved);
        assert!(reduce_removed(&bogus).is_err());
    }

    #[test]
    fn user_removed_drops_all_memberships_of_the_user() {
        let bogus = event("user", USER_REMOVED, 3, IamEvent::OrgRemoved);
        assert!(matches!(
            reduce_user_removed(&bogus).unwrap_err(),
            ProjectionError::InvalidArgument { .. }
        ));

        let removed = event("user", USER_REMOVED, 3, IamEvent::UserRemoved);
        let calls = recorded(&reduce_user_removed(&removed).unwrap(), ORG_MEMBER_TABLE);
        assert_eq!(
            calls[0].sql,
            "DELETE FROM projections.org_members2 WHERE (instance_id = ?1) AND (user_id = ?2)"
        );
        assert_eq!(calls[0].args, vec![Value::from("instance-id"), Value::from("agg-id")]);
    }

    #[test]
    fn org_removal_is_scoped_by_org_id() {
        let table = ledgerview_core::reducer::RoutingTable::new(OrgMemberProjection.reducers());
        let removed = event("org", "org.removed", 9, IamEvent::OrgRemoved);
        let stmt = table.reduce(&removed).unwrap().unwrap();
        let calls = recorded(&stmt, ORG_MEMBER_TABLE);
        assert_eq!(
            calls[0].sql,
            "DELETE FROM projections.org_members2 WHERE (instance_id = ?1) AND (org_id = ?2)"
        );
    }
}
