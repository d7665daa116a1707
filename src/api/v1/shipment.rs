use std::convert::Infallible;

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    Json,
};
use bson::{oid::ObjectId, Document};
use futures::{Stream, StreamExt};
use mongodb::{
    change_stream::{event::ChangeStreamEvent, ChangeStream},
    options::FindOptions,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::{
    error::Error,
    mongo_ext::Collection,
    pricing::{self, DeliverySpeed, PackageSize, CURRENCY},
    receipt::{self, ReceiptLine},
    status::ShipmentStatus,
    util::{now, FormattedDateTime, ObjectIdString, PathObjectId},
};

use super::auth::Session;

pub const LIVE_EVENT: &str = "shipments";

#[derive(Clone)]
pub struct ShipmentCollection(pub Collection<ShipmentModel>);

impl std::ops::Deref for ShipmentCollection {
    type Target = Collection<ShipmentModel>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Sender or receiver of a parcel.
#[derive(Validate, Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Party {
    #[validate(custom = "crate::validation::non_blank")]
    pub name: String,

    #[validate(custom = "crate::validation::non_blank")]
    pub address: String,

    #[validate(
        custom = "crate::validation::non_blank",
        regex(path = "crate::validation::EMAIL_SHAPE", message = "Invalid email format")
    )]
    pub email: String,

    #[validate(regex(
        path = "crate::validation::PHONE_DIGITS",
        message = "Phone number must be exactly 10 digits"
    ))]
    pub phone: String,

    #[validate(regex(
        path = "crate::validation::PINCODE_DIGITS",
        message = "Pincode must be exactly 6 digits"
    ))]
    pub pincode: String,
}

#[derive(Validate, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Package {
    pub size: PackageSize,

    /// Kilograms.
    #[validate(custom = "crate::validation::positive_weight")]
    pub weight: Decimal,

    pub delivery_speed: DeliverySpeed,
}

impl Package {
    pub fn price(&self) -> i64 {
        pricing::price(self.size, self.weight, self.delivery_speed)
    }
}

/// What a customer fills in before paying.
#[derive(Validate, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ShipmentDraft {
    #[validate]
    pub sender: Party,
    #[validate]
    pub receiver: Party,
    #[validate]
    pub package: Package,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ShipmentModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,

    pub sender: Party,
    pub receiver: Party,
    pub package: Package,

    pub price: i64,
    pub status: ShipmentStatus,
    pub user_id: ObjectId,

    #[serde(default)]
    pub checkout_intent_id: Option<ObjectId>,

    pub created_at: bson::DateTime,
    pub updated_at: bson::DateTime,
}

impl ShipmentModel {
    /// A freshly paid shipment, always starting at `Pending`.
    pub fn new(id: ObjectId, user_id: ObjectId, draft: ShipmentDraft, price: i64) -> Self {
        let now = now();

        Self {
            id,
            sender: draft.sender,
            receiver: draft.receiver,
            package: draft.package,
            price,
            status: ShipmentStatus::Pending,
            user_id,
            checkout_intent_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn tracking_id(&self) -> String {
        self.id.to_hex()
    }

    pub fn receipt_file_name(&self) -> String {
        format!("Shipment_Receipt_{}.pdf", self.tracking_id())
    }

    pub fn receipt_lines(&self) -> Vec<ReceiptLine> {
        let party = |title: &str, party: &Party| {
            vec![
                ReceiptLine::Heading(title.to_string()),
                ReceiptLine::field("Name", &party.name),
                ReceiptLine::field("Address", &party.address),
                ReceiptLine::field("Email", &party.email),
                ReceiptLine::field("Phone", &party.phone),
                ReceiptLine::field("Pincode", &party.pincode),
                ReceiptLine::Gap,
            ]
        };

        let created_at = self
            .created_at
            .try_to_rfc3339_string()
            .unwrap_or_else(|_| self.created_at.to_string());

        let mut lines = vec![
            ReceiptLine::Title("DakiyaXpress Shipment Receipt".to_string()),
            ReceiptLine::field("Tracking ID", self.tracking_id()),
            ReceiptLine::field("Created", created_at),
            ReceiptLine::Gap,
        ];
        lines.extend(party("Sender Details", &self.sender));
        lines.extend(party("Receiver Details", &self.receiver));
        lines.extend([
            ReceiptLine::Heading("Package Details".to_string()),
            ReceiptLine::field("Size", self.package.size),
            ReceiptLine::field("Weight", format!("{} kg", self.package.weight)),
            ReceiptLine::field("Delivery Speed", self.package.delivery_speed),
            ReceiptLine::Gap,
            ReceiptLine::Heading("Shipment Details".to_string()),
            ReceiptLine::field("Status", self.status),
            ReceiptLine::field("Price", format!("{} {}", CURRENCY, self.price)),
        ]);

        lines
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Shipment {
    pub id: ObjectIdString,
    pub tracking_id: String,

    pub sender: Party,
    pub receiver: Party,
    pub package: Package,

    pub price: i64,
    pub status: ShipmentStatus,
    pub user_id: ObjectIdString,

    pub created_at: FormattedDateTime,
    pub updated_at: FormattedDateTime,
}

impl From<ShipmentModel> for Shipment {
    fn from(value: ShipmentModel) -> Self {
        Self {
            id: value.id.into(),
            tracking_id: value.tracking_id(),

            sender: value.sender,
            receiver: value.receiver,
            package: value.package,

            price: value.price,
            status: value.status,
            user_id: value.user_id.into(),

            created_at: value.created_at.into(),
            updated_at: value.updated_at.into(),
        }
    }
}

/// Which shipments a session may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShipmentScope {
    Owner(ObjectId),
    All,
}

impl ShipmentScope {
    pub fn of(session: &Session) -> Self {
        if session.is_admin() {
            Self::All
        } else {
            Self::Owner(session.id)
        }
    }

    pub fn filter(&self) -> Document {
        match self {
            Self::Owner(id) => bson::doc! { "user_id": id },
            Self::All => bson::doc! {},
        }
    }
}

/// `None`, empty and `All` mean no filter; anything else must be a status label.
pub fn status_filter(label: Option<&str>) -> Result<Option<ShipmentStatus>, Error> {
    match label.map(str::trim) {
        None | Some("") | Some("All") => Ok(None),
        Some(label) => label.parse().map(Some).map_err(|_| {
            Error::CustomStr(StatusCode::UNPROCESSABLE_ENTITY, "Unknown status filter")
        }),
    }
}

pub fn newest_first() -> Document {
    bson::doc! { "created_at": -1, "_id": -1 }
}

impl ShipmentCollection {
    pub async fn find_scoped(
        &self,
        scope: ShipmentScope,
        status: Option<ShipmentStatus>,
    ) -> Result<Vec<ShipmentModel>, Error> {
        let mut filter = scope.filter();
        if let Some(status) = status {
            filter.insert("status", status.label());
        }

        self.find_all(filter, FindOptions::builder().sort(newest_first()).build())
            .await
    }

    /// Loads a shipment the session is allowed to look at.
    pub async fn find_visible(&self, session: &Session, id: ObjectId) -> Result<ShipmentModel, Error> {
        let shipment = self.find_one_by_id(id).await?.ok_or(Error::NoResource)?;

        if !session.can_view(shipment.user_id) {
            tracing::debug!("{} denied shipment {}", session.id, id);
            return Err(Error::Forbidden);
        }

        Ok(shipment)
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct QuoteQuery {
    pub size: Option<String>,
    pub weight: Option<String>,
    pub delivery_speed: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct QuoteResponse {
    pub price: i64,
    pub amount: i64,
    pub currency: String,
}

impl From<QuoteQuery> for QuoteResponse {
    fn from(query: QuoteQuery) -> Self {
        let price = pricing::quote(
            query.size.and_then(|it| it.parse().ok()),
            query.weight.and_then(|it| it.trim().parse().ok()),
            query.delivery_speed.and_then(|it| it.parse().ok()),
        );

        Self {
            price,
            amount: pricing::gateway_amount(price),
            currency: CURRENCY.to_string(),
        }
    }
}

/// Running estimate for a form that may still be incomplete.
pub async fn quote(Query(query): Query<QuoteQuery>) -> Json<QuoteResponse> {
    Json(query.into())
}

pub async fn index(
    State(shipments): State<ShipmentCollection>,
    session: Session,
) -> Result<Json<Vec<Shipment>>, Error> {
    let shipments = shipments
        .find_scoped(ShipmentScope::of(&session), None)
        .await?
        .into_iter()
        .map(Into::into)
        .collect();

    Ok(Json(shipments))
}

pub async fn show(
    State(shipments): State<ShipmentCollection>,
    session: Session,
    PathObjectId(id): PathObjectId,
) -> Result<Json<Shipment>, Error> {
    let shipment = shipments.find_visible(&session, id).await?;

    Ok(Json(shipment.into()))
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TrackingResponse {
    pub tracking_id: String,
    pub status: ShipmentStatus,
    pub delivery_speed: DeliverySpeed,
    pub created_at: FormattedDateTime,
}

impl From<ShipmentModel> for TrackingResponse {
    fn from(value: ShipmentModel) -> Self {
        Self {
            tracking_id: value.tracking_id(),
            status: value.status,
            delivery_speed: value.package.delivery_speed,
            created_at: value.created_at.into(),
        }
    }
}

/// Public lookup; reveals nothing about the parties.
pub async fn track(
    State(shipments): State<ShipmentCollection>,
    PathObjectId(id): PathObjectId,
) -> Result<Json<TrackingResponse>, Error> {
    let shipment = shipments.find_one_by_id(id).await?.ok_or(Error::NoResource)?;

    Ok(Json(shipment.into()))
}

pub async fn receipt(
    State(shipments): State<ShipmentCollection>,
    session: Session,
    PathObjectId(id): PathObjectId,
) -> Result<impl IntoResponse, Error> {
    let shipment = shipments.find_visible(&session, id).await?;
    let pdf = receipt::render(&shipment.receipt_file_name(), &shipment.receipt_lines())?;

    Ok((
        [
            (header::CONTENT_TYPE, "application/pdf".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", shipment.receipt_file_name()),
            ),
        ],
        pdf,
    ))
}

/// Remembers the last value handed out and swallows repeats of it.
#[derive(Debug)]
pub struct Deduplicate<T> {
    last: Option<T>,
}

impl<T> Default for Deduplicate<T> {
    fn default() -> Self {
        Self { last: None }
    }
}

impl<T: PartialEq + Clone> Deduplicate<T> {
    pub fn fresh(&mut self, next: T) -> Option<T> {
        if self.last.as_ref() == Some(&next) {
            return None;
        }

        self.last = Some(next.clone());
        Some(next)
    }

    pub fn has_sent(&self) -> bool {
        self.last.is_some()
    }
}

struct LiveFeed {
    shipments: ShipmentCollection,
    scope: ShipmentScope,
    changes: ChangeStream<ChangeStreamEvent<ShipmentModel>>,
    sent: Deduplicate<Vec<ShipmentModel>>,
}

impl LiveFeed {
    /// Waits until the scoped result set differs from the one last sent.
    /// `None` once the change stream is exhausted.
    async fn next_snapshot(&mut self) -> Result<Option<Vec<ShipmentModel>>, Error> {
        loop {
            if self.sent.has_sent() {
                match self.changes.next().await {
                    Some(change) => {
                        change?;
                    }
                    None => return Ok(None),
                }
            }

            let current = self.shipments.find_scoped(self.scope, None).await?;
            if let Some(snapshot) = self.sent.fresh(current) {
                return Ok(Some(snapshot));
            }
        }
    }
}

/// Server-sent events carrying the full scoped list, newest first, on
/// subscribe and after every change that alters it. Dropping the response
/// closes the change stream.
pub async fn live(
    State(shipments): State<ShipmentCollection>,
    session: Session,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, Error> {
    let changes = shipments.watch(None, None).await?;
    tracing::debug!("live feed opened for {}", session.id);

    let feed = LiveFeed {
        shipments,
        scope: ShipmentScope::of(&session),
        changes,
        sent: Deduplicate::default(),
    };

    let stream = futures::stream::unfold(feed, |mut feed| async move {
        match feed.next_snapshot().await {
            Ok(Some(snapshot)) => {
                let snapshot: Vec<Shipment> = snapshot.into_iter().map(Into::into).collect();
                let event = Event::default()
                    .event(LIVE_EVENT)
                    .json_data(snapshot)
                    .unwrap_or_else(|err| {
                        tracing::error!("could not encode live snapshot: {}", err);
                        Event::default().event("error")
                    });

                Some((Ok(event), feed))
            }
            Ok(None) => None,
            Err(err) => {
                tracing::warn!("live feed closed: {}", err);
                None
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use assert_matches::assert_matches;
    use validator::Validate;

    use super::*;
    use crate::api::v1::{
        auth::UserRole,
        tests::{bootstrap, draft},
    };

    fn session(role: UserRole) -> Session {
        Session {
            id: ObjectId::new(),
            role,
        }
    }

    fn failing_fields(draft: &ShipmentDraft) -> Vec<String> {
        let mut fields = vec![];
        if let Err(errors) = draft.validate() {
            for (parent, kind) in errors.errors() {
                match kind {
                    validator::ValidationErrorsKind::Struct(inner) => {
                        for field in inner.field_errors().keys() {
                            fields.push(format!("{parent}.{field}"));
                        }
                    }
                    _ => fields.push(parent.to_string()),
                }
            }
        }
        fields.sort();
        fields
    }

    #[test]
    fn test_draft_validation() {
        assert!(draft().validate().is_ok());

        let mut invalid = draft();
        invalid.sender.name = " ".to_string();
        invalid.sender.phone = "12345".to_string();
        invalid.receiver.pincode = "1100011".to_string();
        invalid.receiver.email = "receiver.example.in".to_string();
        invalid.package.weight = Decimal::ZERO;

        assert_eq!(
            failing_fields(&invalid),
            vec![
                "package.weight",
                "receiver.email",
                "receiver.pincode",
                "sender.name",
                "sender.phone",
            ]
        );

        let empty = ShipmentDraft {
            sender: Party::default(),
            ..draft()
        };
        assert_eq!(
            failing_fields(&empty),
            vec![
                "sender.address",
                "sender.email",
                "sender.name",
                "sender.phone",
                "sender.pincode",
            ]
        );
    }

    #[test]
    fn test_overweight_draft_is_rejected_not_priced_at_zero() {
        let mut heavy = draft();
        heavy.package.weight = Decimal::from(1_000_000_000_000_000_000i64);
        assert_eq!(failing_fields(&heavy), vec!["package.weight"]);

        heavy.package.weight = Decimal::from(crate::pricing::MAX_WEIGHT_KG);
        assert!(heavy.validate().is_ok());
        assert!(heavy.package.price() > 0);
    }

    #[test]
    fn test_new_shipment_is_pending_and_owned() {
        let owner = ObjectId::new();
        let draft = draft();
        let price = draft.package.price();
        let shipment = ShipmentModel::new(ObjectId::new(), owner, draft, price);

        assert_eq!(shipment.status, ShipmentStatus::Pending);
        assert_eq!(shipment.user_id, owner);
        assert_eq!(shipment.price, 135);
        assert_eq!(shipment.created_at, shipment.updated_at);
        assert_eq!(shipment.tracking_id().len(), 24);
        assert_eq!(
            shipment.receipt_file_name(),
            format!("Shipment_Receipt_{}.pdf", shipment.id.to_hex())
        );
    }

    #[test]
    fn test_scope() {
        let user = session(UserRole::User);
        let admin = session(UserRole::Admin);

        assert_eq!(ShipmentScope::of(&user), ShipmentScope::Owner(user.id));
        assert_eq!(ShipmentScope::of(&user).filter(), bson::doc! { "user_id": user.id });
        assert_eq!(ShipmentScope::of(&admin), ShipmentScope::All);
        assert!(ShipmentScope::of(&admin).filter().is_empty());

        let mine = ShipmentModel::new(ObjectId::new(), user.id, draft(), 135);
        let theirs = ShipmentModel::new(ObjectId::new(), ObjectId::new(), draft(), 135);

        assert!(user.can_view(mine.user_id));
        assert!(!user.can_view(theirs.user_id));
        assert!(admin.can_view(theirs.user_id));
    }

    #[test]
    fn test_quote_query() {
        let response = QuoteResponse::from(QuoteQuery {
            size: Some("Medium".to_string()),
            weight: Some("2".to_string()),
            delivery_speed: Some("Standard".to_string()),
        });
        assert_eq!(response.price, 135);
        assert_eq!(response.amount, 13_500);
        assert_eq!(response.currency, "INR");

        let incomplete = QuoteResponse::from(QuoteQuery {
            size: Some("Large".to_string()),
            weight: Some(String::new()),
            delivery_speed: Some("Express".to_string()),
        });
        assert_eq!(incomplete.price, 0);
        assert_eq!(QuoteResponse::from(QuoteQuery::default()).price, 0);
    }

    #[test]
    fn test_receipt_lines() {
        let mut shipment = ShipmentModel::new(ObjectId::new(), ObjectId::new(), draft(), 135);
        shipment.package.weight = Decimal::from_str("2.5").unwrap();
        let lines = shipment.receipt_lines();

        assert_eq!(
            lines[0],
            ReceiptLine::Title("DakiyaXpress Shipment Receipt".to_string())
        );
        assert!(lines.contains(&ReceiptLine::field("Tracking ID", shipment.tracking_id())));
        assert!(lines.contains(&ReceiptLine::field("Weight", "2.5 kg")));
        assert!(lines.contains(&ReceiptLine::field("Price", "INR 135")));
        assert!(lines.contains(&ReceiptLine::field("Status", "Pending")));
        assert!(lines.contains(&ReceiptLine::Heading("Receiver Details".to_string())));

        let pdf = receipt::render(&shipment.receipt_file_name(), &lines).unwrap();
        assert!(pdf.starts_with(b"%PDF"));
    }

    #[test]
    fn test_status_filter() {
        assert_eq!(status_filter(None).unwrap(), None);
        assert_eq!(status_filter(Some("All")).unwrap(), None);
        assert_eq!(
            status_filter(Some("Order Picked")).unwrap(),
            Some(ShipmentStatus::OrderPicked)
        );
        assert_matches!(status_filter(Some("Lost")), Err(Error::CustomStr(..)));
    }

    #[test]
    fn test_deduplicate() {
        let mut sent = Deduplicate::default();

        assert!(!sent.has_sent());
        assert_eq!(sent.fresh(vec![1]), Some(vec![1]));
        assert!(sent.has_sent());
        assert_eq!(sent.fresh(vec![1]), None);
        assert_eq!(sent.fresh(vec![1, 2]), Some(vec![1, 2]));
        assert_eq!(sent.fresh(vec![1]), Some(vec![1]));
    }

    #[tokio::test]
    #[ignore = "needs MONGODB_URI pointing at a replica set"]
    async fn test_user_scope_never_leaks() {
        let bootstrap = bootstrap().await;
        let (_, alice) = bootstrap.create_user("alice@example.in", UserRole::User).await;
        let (_, bob) = bootstrap.create_user("bob@example.in", UserRole::User).await;
        let (_, admin) = bootstrap.create_user("admin@example.in", UserRole::Admin).await;

        let shipments = bootstrap.shipment_collection();
        for owner in [alice.id, alice.id, bob.id] {
            shipments
                .insert_one(ShipmentModel::new(ObjectId::new(), owner, draft(), 135), None)
                .await
                .unwrap();
        }

        let Json(listed) = index(bootstrap.shipment_collection(), alice).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|it| it.user_id == alice.id));

        let Json(listed) = index(bootstrap.shipment_collection(), admin).await.unwrap();
        assert_eq!(listed.len(), 3);
        assert!(listed.windows(2).all(|it| it[0].created_at >= it[1].created_at));

        let bobs = listed.iter().find(|it| it.user_id == bob.id).unwrap().id.0;
        let err = show(bootstrap.shipment_collection(), alice, PathObjectId(bobs))
            .await
            .unwrap_err();
        assert_matches!(err, Error::Forbidden);

        show(bootstrap.shipment_collection(), bob, PathObjectId(bobs))
            .await
            .unwrap();
        show(bootstrap.shipment_collection(), admin, PathObjectId(bobs))
            .await
            .unwrap();

        let Json(tracking) = track(bootstrap.shipment_collection(), PathObjectId(bobs))
            .await
            .unwrap();
        assert_eq!(tracking.status, ShipmentStatus::Pending);

        let err = track(bootstrap.shipment_collection(), PathObjectId(ObjectId::new()))
            .await
            .unwrap_err();
        assert_matches!(err, Error::NoResource);

        bootstrap.teardown().await;
    }
}
