//! Branding of the login UI per organization, with the instance policy as
//! default.
//!
//! Every policy has a preview row that changes and asset uploads edit.
//! Activation copies the preview into a separate active row, so the live
//! branding stays readable while the next one is prepared.

use ledgerview_core::db::schema::{Check, ColumnType, Index, PrimaryKey, SchemaColumn, Table};
use ledgerview_core::event::{INSTANCE_AGGREGATE, ORG_AGGREGATE};
use ledgerview_core::statement::{
    new_copy_statement, new_delete_statement, new_no_op_statement, new_update_statement,
    new_upsert_statement, Column, Condition, Value,
};
use ledgerview_core::{AggregateReducer, Event, EventReducer, Projection, ProjectionError, Statement};

use crate::events::{
    IamEvent, LabelAsset, INSTANCE_LABEL_POLICY_ACTIVATED, INSTANCE_LABEL_POLICY_ADDED,
    INSTANCE_LABEL_POLICY_ASSETS_REMOVED, INSTANCE_LABEL_POLICY_CHANGED,
    ORG_LABEL_POLICY_ACTIVATED, ORG_LABEL_POLICY_ADDED, ORG_LABEL_POLICY_ASSETS_REMOVED,
    ORG_LABEL_POLICY_CHANGED, ORG_LABEL_POLICY_REMOVED,
};
use crate::wrong_event;

pub const LABEL_POLICY_TABLE: &str = "projections.label_policies3";

pub const ID_COL: &str = "id";
pub const INSTANCE_ID_COL: &str = "instance_id";
pub const CREATION_DATE_COL: &str = "creation_date";
pub const CHANGE_DATE_COL: &str = "change_date";
pub const SEQUENCE_COL: &str = "sequence";
pub const STATE_COL: &str = "state";
pub const IS_DEFAULT_COL: &str = "is_default";
pub const RESOURCE_OWNER_COL: &str = "resource_owner";
pub const HIDE_LOGIN_NAME_SUFFIX_COL: &str = "hide_login_name_suffix";
pub const WATERMARK_DISABLED_COL: &str = "watermark_disabled";
pub const SHOULD_ERROR_POPUP_COL: &str = "should_error_popup";
pub const FONT_URL_COL: &str = "font_url";

pub const LIGHT_PRIMARY_COLOR_COL: &str = "light_primary_color";
pub const LIGHT_BACKGROUND_COLOR_COL: &str = "light_background_color";
pub const LIGHT_WARN_COLOR_COL: &str = "light_warn_color";
pub const LIGHT_FONT_COLOR_COL: &str = "light_font_color";
pub const LIGHT_LOGO_URL_COL: &str = "light_logo_url";
pub const LIGHT_ICON_URL_COL: &str = "light_icon_url";

pub const DARK_PRIMARY_COLOR_COL: &str = "dark_primary_color";
pub const DARK_BACKGROUND_COLOR_COL: &str = "dark_background_color";
pub const DARK_WARN_COLOR_COL: &str = "dark_warn_color";
pub const DARK_FONT_COLOR_COL: &str = "dark_font_color";
pub const DARK_LOGO_URL_COL: &str = "dark_logo_url";
pub const DARK_ICON_URL_COL: &str = "dark_icon_url";

/// Stored in [`STATE_COL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelPolicyState {
    Active = 1,
    Preview = 3,
}

impl From<LabelPolicyState> for Value {
    fn from(state: LabelPolicyState) -> Self {
        Self::Int(state as i64)
    }
}

/// Carried from the preview row into the active one on activation.
const ACTIVATION_COPIED: [&str; 21] = [
    ID_COL,
    INSTANCE_ID_COL,
    CREATION_DATE_COL,
    IS_DEFAULT_COL,
    RESOURCE_OWNER_COL,
    HIDE_LOGIN_NAME_SUFFIX_COL,
    WATERMARK_DISABLED_COL,
    SHOULD_ERROR_POPUP_COL,
    FONT_URL_COL,
    LIGHT_PRIMARY_COLOR_COL,
    LIGHT_BACKGROUND_COLOR_COL,
    LIGHT_WARN_COLOR_COL,
    LIGHT_FONT_COLOR_COL,
    LIGHT_LOGO_URL_COL,
    LIGHT_ICON_URL_COL,
    DARK_PRIMARY_COLOR_COL,
    DARK_BACKGROUND_COLOR_COL,
    DARK_WARN_COLOR_COL,
    DARK_FONT_COLOR_COL,
    DARK_LOGO_URL_COL,
    DARK_ICON_URL_COL,
];

const POLICY_KEY: [&str; 3] = [INSTANCE_ID_COL, ID_COL, STATE_COL];

const fn asset_column(asset: LabelAsset) -> &'static str {
    match asset {
        LabelAsset::Logo => LIGHT_LOGO_URL_COL,
        LabelAsset::LogoDark => DARK_LOGO_URL_COL,
        LabelAsset::Icon => LIGHT_ICON_URL_COL,
        LabelAsset::IconDark => DARK_ICON_URL_COL,
        LabelAsset::Font => FONT_URL_COL,
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LabelPolicyProjection;

impl Projection<IamEvent> for LabelPolicyProjection {
    fn name(&self) -> &str {
        LABEL_POLICY_TABLE
    }

    fn reducers(&self) -> Vec<AggregateReducer<IamEvent>> {
        let mut org = vec![
            EventReducer::new(ORG_LABEL_POLICY_ADDED, reduce_added),
            EventReducer::new(ORG_LABEL_POLICY_CHANGED, reduce_changed),
            EventReducer::new(ORG_LABEL_POLICY_ACTIVATED, reduce_activated),
            EventReducer::new(ORG_LABEL_POLICY_REMOVED, reduce_removed),
            EventReducer::new(ORG_LABEL_POLICY_ASSETS_REMOVED, reduce_assets_removed),
        ];
        let mut instance = vec![
            EventReducer::new(INSTANCE_LABEL_POLICY_ADDED, reduce_added),
            EventReducer::new(INSTANCE_LABEL_POLICY_CHANGED, reduce_changed),
            EventReducer::new(INSTANCE_LABEL_POLICY_ACTIVATED, reduce_activated),
            EventReducer::new(INSTANCE_LABEL_POLICY_ASSETS_REMOVED, reduce_assets_removed),
        ];
        for asset in LabelAsset::ALL {
            for added in [true, false] {
                org.push(EventReducer::new(asset.event_type(ORG_AGGREGATE, added), reduce_asset));
                instance.push(EventReducer::new(
                    asset.event_type(INSTANCE_AGGREGATE, added),
                    reduce_asset,
                ));
            }
        }
        vec![
            AggregateReducer::new(ORG_AGGREGATE, org),
            AggregateReducer::new(INSTANCE_AGGREGATE, instance),
            AggregateReducer::org_removed(INSTANCE_ID_COL, RESOURCE_OWNER_COL),
            AggregateReducer::instance_removed(INSTANCE_ID_COL),
        ]
    }

    fn check(&self) -> Option<Check> {
        let text = |name: &str| SchemaColumn::new(name, ColumnType::Text).nullable();
        let flag = |name: &str| SchemaColumn::new(name, ColumnType::Bool).default("0");
        Some(Check::table(
            Table::new(
                vec![
                    SchemaColumn::new(ID_COL, ColumnType::Text),
                    SchemaColumn::new(INSTANCE_ID_COL, ColumnType::Text),
                    SchemaColumn::new(CREATION_DATE_COL, ColumnType::Timestamp),
                    SchemaColumn::new(CHANGE_DATE_COL, ColumnType::Timestamp),
                    SchemaColumn::new(SEQUENCE_COL, ColumnType::Int64),
                    SchemaColumn::new(STATE_COL, ColumnType::Enum),
                    flag(IS_DEFAULT_COL),
                    SchemaColumn::new(RESOURCE_OWNER_COL, ColumnType::Text),
                    flag(HIDE_LOGIN_NAME_SUFFIX_COL),
                    flag(WATERMARK_DISABLED_COL),
                    flag(SHOULD_ERROR_POPUP_COL),
                    text(FONT_URL_COL),
                    text(LIGHT_PRIMARY_COLOR_COL),
                    text(LIGHT_BACKGROUND_COLOR_COL),
                    text(LIGHT_WARN_COLOR_COL),
                    text(LIGHT_FONT_COLOR_COL),
                    text(LIGHT_LOGO_URL_COL),
                    text(LIGHT_ICON_URL_COL),
                    text(DARK_PRIMARY_COLOR_COL),
                    text(DARK_BACKGROUND_COLOR_COL),
                    text(DARK_WARN_COLOR_COL),
                    text(DARK_FONT_COLOR_COL),
                    text(DARK_LOGO_URL_COL),
                    text(DARK_ICON_URL_COL),
                ],
                PrimaryKey::new(&POLICY_KEY),
            )
            .with_index(Index::new("owner", &[RESOURCE_OWNER_COL])),
        ))
    }
}

/// Both rows of the policy.
fn policy_key(event: &Event<IamEvent>) -> Vec<Condition> {
    vec![
        Condition::equals(ID_COL, event.base.aggregate_id()),
        Condition::equals(INSTANCE_ID_COL, event.base.instance_id()),
    ]
}

fn preview_key(event: &Event<IamEvent>) -> Vec<Condition> {
    let mut key = policy_key(event);
    key.push(Condition::equals(STATE_COL, LabelPolicyState::Preview));
    key
}

/// Re-adding a policy overwrites the previous preview but keeps its
/// creation date.
fn reduce_added(event: &Event<IamEvent>) -> Result<Statement, ProjectionError> {
    let IamEvent::LabelPolicyAdded(policy) = &event.data else {
        return Err(wrong_event(event, &[ORG_LABEL_POLICY_ADDED, INSTANCE_LABEL_POLICY_ADDED]));
    };
    let is_default = event.base.aggregate_type() == INSTANCE_AGGREGATE;
    Ok(new_upsert_statement(
        event,
        &POLICY_KEY,
        vec![
            Column::new(INSTANCE_ID_COL, event.base.instance_id()),
            Column::new(ID_COL, event.base.aggregate_id()),
            Column::insert_only(CREATION_DATE_COL, event.base.creation_date),
            Column::new(CHANGE_DATE_COL, event.base.creation_date),
            Column::new(SEQUENCE_COL, event.base.sequence),
            Column::new(STATE_COL, LabelPolicyState::Preview),
            Column::new(IS_DEFAULT_COL, is_default),
            Column::new(RESOURCE_OWNER_COL, event.base.resource_owner()),
            Column::new(LIGHT_PRIMARY_COLOR_COL, policy.primary_color.as_str()),
            Column::new(LIGHT_BACKGROUND_COLOR_COL, policy.background_color.as_str()),
            Column::new(LIGHT_WARN_COLOR_COL, policy.warn_color.as_str()),
            Column::new(LIGHT_FONT_COLOR_COL, policy.font_color.as_str()),
            Column::new(DARK_PRIMARY_COLOR_COL, policy.primary_color_dark.as_str()),
            Column::new(DARK_BACKGROUND_COLOR_COL, policy.background_color_dark.as_str()),
            Column::new(DARK_WARN_COLOR_COL, policy.warn_color_dark.as_str()),
            Column::new(DARK_FONT_COLOR_COL, policy.font_color_dark.as_str()),
            Column::new(HIDE_LOGIN_NAME_SUFFIX_COL, policy.hide_login_name_suffix),
            Column::new(SHOULD_ERROR_POPUP_COL, policy.error_msg_popup),
            Column::new(WATERMARK_DISABLED_COL, policy.disable_watermark),
        ],
    ))
}

fn reduce_changed(event: &Event<IamEvent>) -> Result<Statement, ProjectionError> {
    let IamEvent::LabelPolicyChanged(changes) = &event.data else {
        return Err(wrong_event(
            event,
            &[ORG_LABEL_POLICY_CHANGED, INSTANCE_LABEL_POLICY_CHANGED],
        ));
    };
    let colors = [
        (LIGHT_PRIMARY_COLOR_COL, &changes.primary_color),
        (LIGHT_BACKGROUND_COLOR_COL, &changes.background_color),
        (LIGHT_WARN_COLOR_COL, &changes.warn_color),
        (LIGHT_FONT_COLOR_COL, &changes.font_color),
        (DARK_PRIMARY_COLOR_COL, &changes.primary_color_dark),
        (DARK_BACKGROUND_COLOR_COL, &changes.background_color_dark),
        (DARK_WARN_COLOR_COL, &changes.warn_color_dark),
        (DARK_FONT_COLOR_COL, &changes.font_color_dark),
    ];
    let flags = [
        (HIDE_LOGIN_NAME_SUFFIX_COL, changes.hide_login_name_suffix),
        (SHOULD_ERROR_POPUP_COL, changes.error_msg_popup),
        (WATERMARK_DISABLED_COL, changes.disable_watermark),
    ];

    let mut columns: Vec<Column> = colors
        .into_iter()
        .filter_map(|(name, value)| value.as_deref().map(|v| Column::new(name, v)))
        .chain(
            flags
                .into_iter()
                .filter_map(|(name, value)| value.map(|v| Column::new(name, v))),
        )
        .collect();
    if columns.is_empty() {
        return Ok(new_no_op_statement(event));
    }
    columns.extend(touched(event));
    Ok(new_update_statement(event, columns, preview_key(event)))
}

fn touched(event: &Event<IamEvent>) -> [Column; 2] {
    [
        Column::new(CHANGE_DATE_COL, event.base.creation_date),
        Column::new(SEQUENCE_COL, event.base.sequence),
    ]
}

fn reduce_activated(event: &Event<IamEvent>) -> Result<Statement, ProjectionError> {
    if event.data != IamEvent::LabelPolicyActivated {
        return Err(wrong_event(
            event,
            &[ORG_LABEL_POLICY_ACTIVATED, INSTANCE_LABEL_POLICY_ACTIVATED],
        ));
    }
    let mut columns = touched(event).to_vec();
    columns.push(Column::new(STATE_COL, LabelPolicyState::Active));
    Ok(new_copy_statement(
        event,
        &POLICY_KEY,
        columns,
        &ACTIVATION_COPIED,
        preview_key(event),
    ))
}

fn reduce_removed(event: &Event<IamEvent>) -> Result<Statement, ProjectionError> {
    if event.data != IamEvent::LabelPolicyRemoved {
        return Err(wrong_event(event, &[ORG_LABEL_POLICY_REMOVED]));
    }
    Ok(new_delete_statement(event, policy_key(event)))
}

/// Upload or removal of a single asset.
fn reduce_asset(event: &Event<IamEvent>) -> Result<Statement, ProjectionError> {
    let asset = match &event.data {
        IamEvent::LabelPolicyAssetAdded(asset, stored) => {
            Column::new(asset_column(*asset), stored.store_key.as_str())
        }
        IamEvent::LabelPolicyAssetRemoved(asset) => Column::new(asset_column(*asset), Value::Null),
        _ => {
            return Err(wrong_event(
                event,
                &["policy.label.<asset>.added", "policy.label.<asset>.removed"],
            ));
        }
    };
    let mut columns = vec![asset];
    columns.extend(touched(event));
    Ok(new_update_statement(event, columns, preview_key(event)))
}

fn reduce_assets_removed(event: &Event<IamEvent>) -> Result<Statement, ProjectionError> {
    if event.data != IamEvent::LabelPolicyAssetsRemoved {
        return Err(wrong_event(
            event,
            &[ORG_LABEL_POLICY_ASSETS_REMOVED, INSTANCE_LABEL_POLICY_ASSETS_REMOVED],
        ));
    }
    let mut columns: Vec<Column> = LabelAsset::ALL
        .into_iter()
        .map(|asset| Column::new(asset_column(asset), Value::Null))
        .collect();
    columns.extend(touched(event));
    Ok(new_update_statement(event, columns, preview_key(event)))
}
