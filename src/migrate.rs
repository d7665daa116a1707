use std::collections::HashSet;

use bson::oid::ObjectId;
use mongodb::{options::IndexOptions, ClientSession, IndexModel};
use serde::{Deserialize, Serialize};

use crate::{app::AppState, error::Error, mongo_ext::Collection};

#[derive(Serialize, Deserialize)]
pub struct MigrateModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub version: i64,
}

#[derive(Clone)]
pub struct MigrationCollection(pub Collection<MigrateModel>);

impl std::ops::Deref for MigrationCollection {
    type Target = Collection<MigrateModel>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl MigrationCollection {
    pub async fn insert_version_with_session(
        &self,
        version: i64,
        session: &mut ClientSession,
    ) -> Result<(), mongodb::error::Error> {
        self.insert_one_with_session(
            MigrateModel {
                id: ObjectId::new(),
                version,
            },
            None,
            session,
        )
        .await
        .map(|_| ())
    }
}

fn index(keys: bson::Document, unique: bool) -> IndexModel {
    IndexModel::builder()
        .keys(keys)
        .options(IndexOptions::builder().unique(unique).build())
        .build()
}

impl AppState {
    /// Accounts and sessions.
    async fn v1_migrate(&self, session: &mut ClientSession) -> Result<(), mongodb::error::Error> {
        self.migrate_collection
            .create_index_with_session(index(bson::doc! { "version": 1 }, true), None, session)
            .await?;

        self.user_collection
            .create_index_with_session(index(bson::doc! { "email": 1 }, true), None, session)
            .await?;

        self.token_collection
            .create_index_with_session(index(bson::doc! { "user_id": 1 }, false), None, session)
            .await?;

        Ok(())
    }

    /// Shipments, checkouts and password resets.
    async fn v2_migrate(&self, session: &mut ClientSession) -> Result<(), mongodb::error::Error> {
        self.shipment_collection
            .create_index_with_session(
                index(bson::doc! { "user_id": 1, "created_at": -1 }, false),
                None,
                session,
            )
            .await?;

        self.shipment_collection
            .create_index_with_session(
                index(bson::doc! { "status": 1, "created_at": -1 }, false),
                None,
                session,
            )
            .await?;

        self.checkout_intent_collection
            .create_index_with_session(
                index(bson::doc! { "gateway_order_id": 1 }, true),
                None,
                session,
            )
            .await?;

        self.checkout_intent_collection
            .create_index_with_session(index(bson::doc! { "state": 1 }, false), None, session)
            .await?;

        self.password_reset_collection
            .create_index_with_session(index(bson::doc! { "user_id": 1 }, false), None, session)
            .await?;

        Ok(())
    }

    /// Applies every version not yet recorded, in one transaction.
    pub async fn run_migration(&self) -> Result<(), Error> {
        let applied: HashSet<i64> = self
            .migrate_collection
            .find_all(None, None)
            .await?
            .into_iter()
            .map(|it| it.version)
            .collect();

        let mut session = self.mongo_client.start_session(None).await?;
        session.start_transaction(None).await?;

        macro_rules! migrate {
            ($version:expr, $fun:ident) => {
                if !applied.contains(&$version) {
                    tracing::info!("running migration version {}", $version);
                    self.$fun(&mut session).await?;
                    self.migrate_collection
                        .insert_version_with_session($version, &mut session)
                        .await?;
                }
            };
        }

        migrate!(1, v1_migrate);
        migrate!(2, v2_migrate);

        session.commit_transaction().await?;

        Ok(())
    }
}
