use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use bson::{oid::ObjectId, Document};
use mongodb::options::FindOptions;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::{
    error::Error,
    status::{ShipmentStatus, TransitionPolicy},
    util::{now, PathObjectId},
};

use super::{
    auth::AdminSession,
    shipment::{
        newest_first, status_filter, Package, Party, Shipment, ShipmentCollection, ShipmentModel,
    },
};

pub const DEFAULT_PER_PAGE: u64 = 5;

const STALE_WRITE: &str = "Shipment was changed meanwhile, reload and try again";
pub const MAX_PER_PAGE: u64 = 100;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// Newest first.
    #[default]
    Date,
    /// Sender name, A to Z.
    Name,
}

impl SortOrder {
    pub fn document(self) -> Document {
        match self {
            Self::Date => newest_first(),
            Self::Name => bson::doc! { "sender.name": 1, "created_at": -1 },
        }
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct ListQuery {
    pub status: Option<String>,
    pub sort: Option<SortOrder>,
    pub page: Option<u64>,
    pub per_page: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Listing {
    pub status: Option<ShipmentStatus>,
    pub sort: SortOrder,
    pub page: u64,
    pub per_page: u64,
}

impl TryFrom<ListQuery> for Listing {
    type Error = Error;

    fn try_from(query: ListQuery) -> Result<Self, Self::Error> {
        Ok(Self {
            status: status_filter(query.status.as_deref())?,
            sort: query.sort.unwrap_or_default(),
            page: query.page.unwrap_or(1).max(1),
            per_page: query
                .per_page
                .unwrap_or(DEFAULT_PER_PAGE)
                .clamp(1, MAX_PER_PAGE),
        })
    }
}

impl Listing {
    pub fn filter(&self) -> Document {
        match self.status {
            Some(status) => bson::doc! { "status": status.label() },
            None => bson::doc! {},
        }
    }

    pub fn skip(&self) -> u64 {
        (self.page - 1).saturating_mul(self.per_page)
    }
}

pub fn total_pages(total: u64, per_page: u64) -> u64 {
    if per_page == 0 {
        return 0;
    }

    (total + per_page - 1) / per_page
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ListResponse {
    pub shipments: Vec<Shipment>,
    pub page: u64,
    pub per_page: u64,
    pub total: u64,
    pub total_pages: u64,
}

pub async fn index(
    State(shipments): State<ShipmentCollection>,
    _admin: AdminSession,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse>, Error> {
    let listing = Listing::try_from(query)?;

    let total = shipments.count_documents(listing.filter(), None).await?;
    let page = shipments
        .find_all(
            listing.filter(),
            FindOptions::builder()
                .sort(listing.sort.document())
                .skip(listing.skip())
                .limit(listing.per_page as i64)
                .build(),
        )
        .await?;

    Ok(Json(ListResponse {
        shipments: page.into_iter().map(Into::into).collect(),
        page: listing.page,
        per_page: listing.per_page,
        total,
        total_pages: total_pages(total, listing.per_page),
    }))
}

/// Partial edit. Owner, creation time and id never change.
#[derive(Validate, Serialize, Deserialize, Debug, Clone, Default)]
pub struct ShipmentEdit {
    #[validate]
    pub sender: Option<Party>,
    #[validate]
    pub receiver: Option<Party>,
    #[validate]
    pub package: Option<Package>,

    pub status: Option<ShipmentStatus>,

    #[validate(range(min = 0, message = "Price cannot be negative"))]
    pub price: Option<i64>,
}

impl ShipmentEdit {
    /// Applies the edit in place. A changed package reprices the shipment
    /// unless a price is given explicitly.
    pub fn apply(self, shipment: &mut ShipmentModel, policy: TransitionPolicy) -> Result<(), Error> {
        self.validate()?;

        if let Some(status) = self.status {
            if status != shipment.status {
                policy.check(shipment.status, status)?;
                shipment.status = status;
            }
        }

        if let Some(sender) = self.sender {
            shipment.sender = sender;
        }
        if let Some(receiver) = self.receiver {
            shipment.receiver = receiver;
        }

        let repriced = match self.package {
            Some(package) if package != shipment.package => {
                shipment.package = package;
                true
            }
            _ => false,
        };

        match self.price {
            Some(price) => shipment.price = price,
            None if repriced => shipment.price = shipment.package.price(),
            None => {}
        }

        shipment.updated_at = now();

        Ok(())
    }
}

impl ShipmentCollection {
    /// Applies `update` only while the stored `updated_at` is still `seen`.
    async fn update_if_unchanged(
        &self,
        id: ObjectId,
        seen: bson::DateTime,
        update: Document,
    ) -> Result<(), Error> {
        let result = self
            .update_one(bson::doc! { "_id": id, "updated_at": seen }, update, None)
            .await?;
        if result.matched_count > 0 {
            return Ok(());
        }

        match self.find_one_by_id(id).await? {
            Some(_) => {
                tracing::debug!("shipment {} changed since it was read", id);
                Err(Error::CustomStr(StatusCode::CONFLICT, STALE_WRITE))
            }
            None => Err(Error::NoResource),
        }
    }
}

#[tracing::instrument(skip_all, fields(admin = %admin.id, shipment = %id))]
pub async fn update(
    State(shipments): State<ShipmentCollection>,
    State(policy): State<TransitionPolicy>,
    AdminSession(admin): AdminSession,
    PathObjectId(id): PathObjectId,
    Json(edit): Json<ShipmentEdit>,
) -> Result<Json<Shipment>, Error> {
    let mut shipment = shipments.find_one_by_id(id).await?.ok_or(Error::NoResource)?;

    let seen = shipment.updated_at;
    edit.apply(&mut shipment, policy)?;

    shipments
        .update_if_unchanged(
            id,
            seen,
            bson::doc! {
                "$set": {
                    "sender": bson::to_bson(&shipment.sender)?,
                    "receiver": bson::to_bson(&shipment.receiver)?,
                    "package": bson::to_bson(&shipment.package)?,
                    "status": shipment.status.label(),
                    "price": shipment.price,
                    "updated_at": shipment.updated_at,
                }
            },
        )
        .await?;

    tracing::info!("shipment edited");

    Ok(Json(shipment.into()))
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StatusRequest {
    pub status: ShipmentStatus,
    /// Falls back to the server's configured policy.
    pub policy: Option<TransitionPolicy>,
}

#[tracing::instrument(skip_all, fields(admin = %admin.id, shipment = %id, to = %request.status))]
pub async fn update_status(
    State(shipments): State<ShipmentCollection>,
    State(policy): State<TransitionPolicy>,
    AdminSession(admin): AdminSession,
    PathObjectId(id): PathObjectId,
    Json(request): Json<StatusRequest>,
) -> Result<Json<Shipment>, Error> {
    let mut shipment = shipments.find_one_by_id(id).await?.ok_or(Error::NoResource)?;

    request
        .policy
        .unwrap_or(policy)
        .check(shipment.status, request.status)?;

    let from = shipment.status;
    let seen = shipment.updated_at;
    shipment.status = request.status;
    shipment.updated_at = now();

    shipments
        .update_if_unchanged(
            id,
            seen,
            bson::doc! {
                "$set": {
                    "status": shipment.status.label(),
                    "updated_at": shipment.updated_at,
                }
            },
        )
        .await?;

    tracing::info!("status changed from {}", from);

    Ok(Json(shipment.into()))
}

#[tracing::instrument(skip_all, fields(admin = %admin.id, shipment = %id))]
pub async fn delete(
    State(shipments): State<ShipmentCollection>,
    AdminSession(admin): AdminSession,
    PathObjectId(id): PathObjectId,
) -> Result<StatusCode, Error> {
    if !shipments.delete_one_by_id(id).await? {
        return Err(Error::NoResource);
    }

    tracing::info!("shipment deleted");

    Ok(StatusCode::NO_CONTENT)
}
