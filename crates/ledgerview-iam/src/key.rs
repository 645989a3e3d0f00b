//! Signing key pairs and certificates.
//!
//! Private keys stay encrypted. Public keys and certificates are decrypted
//! on projection so verifiers can read them without key material.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ledgerview_core::crypto::{decrypt, DecryptError, EncryptionAlgorithm};
use ledgerview_core::db::schema::{Check, ColumnType, ForeignKey, PrimaryKey, SchemaColumn, Table};
use ledgerview_core::event::DataParseError;
use ledgerview_core::statement::{add_create_statement, new_multi_statement, Column};
use ledgerview_core::{AggregateReducer, Event, EventReducer, Projection, ProjectionError, Statement};

use crate::events::{IamEvent, KEY_PAIR_ADDED, KEY_PAIR_AGGREGATE, KEY_PAIR_CERTIFICATE_ADDED};
use crate::{json_value, wrong_event};

pub const KEY_TABLE: &str = "projections.keys4";
pub const KEY_PRIVATE_SUFFIX: &str = "private";
pub const KEY_PUBLIC_SUFFIX: &str = "public";
pub const KEY_CERTIFICATE_SUFFIX: &str = "certificate";

pub const ID_COL: &str = "id";
pub const CREATION_DATE_COL: &str = "creation_date";
pub const CHANGE_DATE_COL: &str = "change_date";
pub const RESOURCE_OWNER_COL: &str = "resource_owner";
pub const INSTANCE_ID_COL: &str = "instance_id";
pub const SEQUENCE_COL: &str = "sequence";
pub const ALGORITHM_COL: &str = "algorithm";
pub const USE_COL: &str = "use";

pub const KEY_ID_COL: &str = "id";
pub const KEY_INSTANCE_ID_COL: &str = "instance_id";
pub const KEY_EXPIRY_COL: &str = "expiry";
pub const KEY_KEY_COL: &str = "key";
pub const CERTIFICATE_COL: &str = "certificate";

#[derive(Clone)]
pub struct KeyProjection {
    encryption: Arc<dyn EncryptionAlgorithm>,
}

impl KeyProjection {
    #[must_use]
    pub fn new(encryption: Arc<dyn EncryptionAlgorithm>) -> Self {
        Self { encryption }
    }
}

impl fmt::Debug for KeyProjection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyProjection")
            .field("algorithm", &self.encryption.algorithm())
            .finish()
    }
}

impl Projection<IamEvent> for KeyProjection {
    fn name(&self) -> &str {
        KEY_TABLE
    }

    fn reducers(&self) -> Vec<AggregateReducer<IamEvent>> {
        let pair = Arc::clone(&self.encryption);
        let certificate = Arc::clone(&self.encryption);
        vec![
            AggregateReducer::new(
                KEY_PAIR_AGGREGATE,
                vec![
                    EventReducer::new(KEY_PAIR_ADDED, move |event: &Event<IamEvent>| {
                        reduce_key_pair_added(event, pair.as_ref())
                    }),
                    EventReducer::new(
                        KEY_PAIR_CERTIFICATE_ADDED,
                        move |event: &Event<IamEvent>| {
                            reduce_certificate_added(event, certificate.as_ref())
                        },
                    ),
                ],
            ),
            AggregateReducer::instance_removed(INSTANCE_ID_COL),
        ]
    }

    fn check(&self) -> Option<Check> {
        let side = |value: SchemaColumn, suffix: &str| {
            Table::suffixed(
                vec![
                    SchemaColumn::new(KEY_ID_COL, ColumnType::Text),
                    SchemaColumn::new(KEY_INSTANCE_ID_COL, ColumnType::Text),
                    SchemaColumn::new(KEY_EXPIRY_COL, ColumnType::Timestamp),
                    value,
                ],
                PrimaryKey::new(&[KEY_INSTANCE_ID_COL, KEY_ID_COL]),
                suffix,
            )
            .with_foreign_key(ForeignKey::of_public_keys())
        };
        Some(Check::multi_table(
            Table::new(
                vec![
                    SchemaColumn::new(ID_COL, ColumnType::Text),
                    SchemaColumn::new(CREATION_DATE_COL, ColumnType::Timestamp),
                    SchemaColumn::new(CHANGE_DATE_COL, ColumnType::Timestamp),
                    SchemaColumn::new(RESOURCE_OWNER_COL, ColumnType::Text),
                    SchemaColumn::new(INSTANCE_ID_COL, ColumnType::Text),
                    SchemaColumn::new(SEQUENCE_COL, ColumnType::Int64),
                    SchemaColumn::new(ALGORITHM_COL, ColumnType::Text).default("''"),
                    SchemaColumn::new(USE_COL, ColumnType::Enum).default("0"),
                ],
                PrimaryKey::new(&[INSTANCE_ID_COL, ID_COL]),
            ),
            vec![
                side(SchemaColumn::new(KEY_KEY_COL, ColumnType::Json), KEY_PRIVATE_SUFFIX),
                side(SchemaColumn::new(KEY_KEY_COL, ColumnType::Bytes), KEY_PUBLIC_SUFFIX),
                side(
                    SchemaColumn::new(CERTIFICATE_COL, ColumnType::Bytes),
                    KEY_CERTIFICATE_SUFFIX,
                ),
            ],
        ))
    }
}

fn decrypt_error(event: &Event<IamEvent>, err: &DecryptError) -> ProjectionError {
    tracing::error!(
        event_type = %event.base.event_type,
        sequence = event.base.sequence,
        aggregate_id = %event.base.aggregate_id(),
        error = %err,
        "could not decrypt key material"
    );
    ProjectionError::Conversion {
        event_type: event.base.event_type.clone(),
        sequence: event.base.sequence,
        source: DataParseError::Invalid {
            event_type: event.base.event_type.clone(),
            reason: err.to_string(),
        },
    }
}

fn reduce_key_pair_added(
    event: &Event<IamEvent>,
    encryption: &dyn EncryptionAlgorithm,
) -> Result<Statement, ProjectionError> {
    let IamEvent::KeyPairAdded(pair) = &event.data else {
        return Err(wrong_event(event, &[KEY_PAIR_ADDED]));
    };
    let public_key =
        decrypt(&pair.public_key.key, encryption).map_err(|err| decrypt_error(event, &err))?;
    let private_key = json_value(event, &pair.private_key.key)?;
    let key_columns = |expiry: DateTime<Utc>, value: Column| {
        vec![
            Column::new(KEY_ID_COL, event.base.aggregate_id()),
            Column::new(KEY_INSTANCE_ID_COL, event.base.instance_id()),
            Column::new(KEY_EXPIRY_COL, expiry),
            value,
        ]
    };
    Ok(new_multi_statement(
        event,
        vec![
            add_create_statement(vec![
                Column::new(ID_COL, event.base.aggregate_id()),
                Column::new(CREATION_DATE_COL, event.base.creation_date),
                Column::new(CHANGE_DATE_COL, event.base.creation_date),
                Column::new(RESOURCE_OWNER_COL, event.base.resource_owner()),
                Column::new(INSTANCE_ID_COL, event.base.instance_id()),
                Column::new(SEQUENCE_COL, event.base.sequence),
                Column::new(ALGORITHM_COL, pair.algorithm.as_str()),
                Column::new(USE_COL, pair.usage),
            ]),
            add_create_statement(key_columns(
                pair.private_key.expiry,
                Column::new(KEY_KEY_COL, private_key),
            ))
            .with_table_suffix(KEY_PRIVATE_SUFFIX),
            add_create_statement(key_columns(
                pair.public_key.expiry,
                Column::new(KEY_KEY_COL, public_key),
            ))
            .with_table_suffix(KEY_PUBLIC_SUFFIX),
        ],
    ))
}

fn reduce_certificate_added(
    event: &Event<IamEvent>,
    encryption: &dyn EncryptionAlgorithm,
) -> Result<Statement, ProjectionError> {
    let IamEvent::CertificateAdded(added) = &event.data else {
        return Err(wrong_event(event, &[KEY_PAIR_CERTIFICATE_ADDED]));
    };
    let certificate = decrypt(&added.certificate.key, encryption)
        .map_err(|err| decrypt_error(event, &err))?;
    Ok(new_multi_statement(
        event,
        vec![add_create_statement(vec![
            Column::new(KEY_ID_COL, event.base.aggregate_id()),
            Column::new(KEY_INSTANCE_ID_COL, event.base.instance_id()),
            Column::new(KEY_EXPIRY_COL, added.certificate.expiry),
            Column::new(CERTIFICATE_COL, certificate),
        ])
        .with_table_suffix(KEY_CERTIFICATE_SUFFIX)],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CertificateAdded, ExpiringKey, KeyPairAdded};
    use crate::testing::{event, recorded};
    use chrono::TimeZone;
    use ledgerview_core::crypto::CryptoValue;
    use ledgerview_core::statement::Value;

    /// XORs every byte with the key id length; enough to tell plain from crypted.
    struct Xor;

    impl EncryptionAlgorithm for Xor {
        fn algorithm(&self) -> &str {
            "xor"
        }

        fn decrypt(&self, crypted: &[u8], key_id: &str) -> Result<Vec<u8>, DecryptError> {
            if key_id.is_empty() {
                return Err(DecryptError::UnknownKey(String::new()));
            }
            let mask = u8::try_from(key_id.len()).unwrap_or(u8::MAX);
            Ok(crypted.iter().map(|b| b ^ mask).collect())
        }
    }

    fn crypted(plain: &[u8], key_id: &str) -> CryptoValue {
        let mask = u8::try_from(key_id.len()).unwrap();
        CryptoValue {
            algorithm: "xor".into(),
            key_id: key_id.into(),
            crypted: plain.iter().map(|b| b ^ mask).collect(),
        }
    }

    fn expiring(plain: &[u8]) -> ExpiringKey {
        ExpiringKey {
            key: crypted(plain, "key-1"),
            expiry: Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn reducer(event_type: &str) -> ledgerview_core::reducer::ReduceFn<IamEvent> {
        let table = ledgerview_core::reducer::RoutingTable::new(
            KeyProjection::new(Arc::new(Xor)).reducers(),
        );
        Arc::clone(table.lookup(&"key_pair".into(), &event_type.into()).unwrap())
    }

    #[test]
    fn key_pair_added_writes_three_tables() {
        let reduce = reducer(KEY_PAIR_ADDED);
        let bogus = event("key_pair", KEY_PAIR_ADDED, 2, IamEvent::InstanceRemoved);
        assert!(matches!(
            reduce(&bogus).unwrap_err(),
            ProjectionError::InvalidArgument { .. }
        ));

        let added = event(
            "key_pair",
            KEY_PAIR_ADDED,
            2,
            IamEvent::KeyPairAdded(KeyPairAdded {
                usage: 0,
                algorithm: "RS256".into(),
                private_key: expiring(b"private"),
                public_key: expiring(b"public"),
            }),
        );
        let calls = recorded(&reduce(&added).unwrap(), KEY_TABLE);
        let sql: Vec<&str> = calls.iter().map(|c| c.sql.as_str()).collect();
        assert_eq!(
            sql,
            vec![
                "INSERT INTO projections.keys4 (id, creation_date, change_date, resource_owner, \
                 instance_id, sequence, algorithm, use) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                "INSERT INTO projections.keys4_private (id, instance_id, expiry, key) VALUES (?1, ?2, ?3, ?4)",
                "INSERT INTO projections.keys4_public (id, instance_id, expiry, key) VALUES (?1, ?2, ?3, ?4)",
            ]
        );
        // private key stays encrypted, public key is stored in clear
        assert!(matches!(calls[1].args[3], Value::Json(_)));
        assert_eq!(calls[2].args[3], Value::Bytes(b"public".to_vec()));
    }

    #[test]
    fn undecryptable_public_key_is_a_conversion_error() {
        let mut public_key = expiring(b"public");
        public_key.key.algorithm = "aes".into();
        let added = event(
            "key_pair",
            KEY_PAIR_ADDED,
            3,
            IamEvent::KeyPairAdded(KeyPairAdded {
                usage: 0,
                algorithm: "RS256".into(),
                private_key: expiring(b"private"),
                public_key,
            }),
        );
        let err = reducer(KEY_PAIR_ADDED)(&added).unwrap_err();
        assert!(matches!(err, ProjectionError::Conversion { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn certificate_is_decrypted_into_its_table() {
        let reduce = reducer(KEY_PAIR_CERTIFICATE_ADDED);
        let bogus = event("key_pair", KEY_PAIR_CERTIFICATE_ADDED, 4, IamEvent::OrgRemoved);
        assert!(reduce(&bogus).is_err());

        let added = event(
            "key_pair",
            KEY_PAIR_CERTIFICATE_ADDED,
            4,
            IamEvent::CertificateAdded(CertificateAdded {
                certificate: expiring(b"-----BEGIN CERTIFICATE-----"),
            }),
        );
        let calls = recorded(&reduce(&added).unwrap(), KEY_TABLE);
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].sql,
            "INSERT INTO projections.keys4_certificate (id, instance_id, expiry, certificate) \
             VALUES (?1, ?2, ?3, ?4)"
        );
        assert_eq!(calls[0].args[3], Value::Bytes(b"-----BEGIN CERTIFICATE-----".to_vec()));
    }
}
