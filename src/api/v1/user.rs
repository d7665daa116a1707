use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::{error::Error, status::ShipmentStatus};

use super::{
    auth::{ProfileResponse, Session, UserCollection, UserModel, UserRole},
    shipment::{status_filter, Shipment, ShipmentCollection, ShipmentScope},
};

pub async fn profile(user: UserModel) -> Json<ProfileResponse> {
    Json(user.into())
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub total: u64,
    pub pending: u64,
    pub order_picked: u64,
    pub in_transit: u64,
    pub delivered: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub fn tally(statuses: impl IntoIterator<Item = ShipmentStatus>) -> Self {
        statuses.into_iter().fold(Self::default(), |mut counts, status| {
            counts.total += 1;
            *match status {
                ShipmentStatus::Pending => &mut counts.pending,
                ShipmentStatus::OrderPicked => &mut counts.order_picked,
                ShipmentStatus::InTransit => &mut counts.in_transit,
                ShipmentStatus::Delivered => &mut counts.delivered,
                ShipmentStatus::Failed => &mut counts.failed,
            } += 1;
            counts
        })
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct DashboardQuery {
    /// A status label, or `All`.
    pub status: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DashboardResponse {
    pub profile: ProfileResponse,
    pub role: UserRole,
    pub counts: StatusCounts,
    pub shipments: Vec<Shipment>,
}

/// Counts always cover the whole scope; the status filter only narrows the list.
pub async fn dashboard(
    State(users): State<UserCollection>,
    State(shipments): State<ShipmentCollection>,
    session: Session,
    Query(query): Query<DashboardQuery>,
) -> Result<Json<DashboardResponse>, Error> {
    let filter = status_filter(query.status.as_deref())?;

    let user = UserModel::from_id(session.id, &users).await?;
    let scoped = shipments
        .find_scoped(ShipmentScope::of(&session), None)
        .await?;

    let counts = StatusCounts::tally(scoped.iter().map(|it| it.status));
    let shipments = scoped
        .into_iter()
        .filter(|it| filter.map_or(true, |status| it.status == status))
        .map(Into::into)
        .collect();

    Ok(Json(DashboardResponse {
        role: session.role,
        profile: user.into(),
        counts,
        shipments,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v1::tests::{bootstrap, draft};

    #[test]
    fn test_tally() {
        let counts = StatusCounts::tally([
            ShipmentStatus::Pending,
            ShipmentStatus::Pending,
            ShipmentStatus::InTransit,
            ShipmentStatus::Failed,
        ]);

        assert_eq!(
            counts,
            StatusCounts {
                total: 4,
                pending: 2,
                in_transit: 1,
                failed: 1,
                ..Default::default()
            }
        );
        assert_eq!(StatusCounts::tally([]), StatusCounts::default());
    }

    #[tokio::test]
    #[ignore = "needs MONGODB_URI pointing at a replica set"]
    async fn test_dashboard_filters_list_but_not_counts() {
        use bson::oid::ObjectId;

        use crate::api::v1::shipment::ShipmentModel;

        let bootstrap = bootstrap().await;
        let (user, session) = bootstrap.create_user("asha@example.in", UserRole::User).await;

        let collection = bootstrap.shipment_collection();
        for status in [ShipmentStatus::Pending, ShipmentStatus::Delivered] {
            let mut shipment = ShipmentModel::new(ObjectId::new(), user.id, draft(), 135);
            shipment.status = status;
            collection.insert_one(&shipment, None).await.unwrap();
        }
        collection
            .insert_one(
                ShipmentModel::new(ObjectId::new(), ObjectId::new(), draft(), 135),
                None,
            )
            .await
            .unwrap();

        let Json(dashboard) = dashboard(
            bootstrap.user_collection(),
            bootstrap.shipment_collection(),
            session,
            Query(DashboardQuery {
                status: Some("Delivered".to_string()),
            }),
        )
        .await
        .unwrap();

        assert_eq!(dashboard.role, UserRole::User);
        assert_eq!(dashboard.profile.email, "asha@example.in");
        assert_eq!(dashboard.counts.total, 2);
        assert_eq!(dashboard.counts.delivered, 1);
        assert_eq!(dashboard.shipments.len(), 1);
        assert_eq!(dashboard.shipments[0].status, ShipmentStatus::Delivered);

        bootstrap.teardown().await;
    }
}
