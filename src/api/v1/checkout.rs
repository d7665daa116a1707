//! Pay-then-persist with a reserved intent in between.
//!
//! An intent is written before the customer is sent to the hosted checkout,
//! carrying the draft and a pre-allocated shipment id. Confirming moves it
//! `Reserved -> Paid -> Fulfilled`; the shipment write is an upsert on the
//! pre-allocated id, so a confirmation that dies halfway can be replayed by
//! the customer or picked up by [`reconcile`]. Once an intent is fulfilled
//! the shipment is never written again, so a deleted shipment stays deleted.

use axum::{extract::State, Json};
use bson::oid::ObjectId;
use mongodb::{
    error::{ErrorKind, WriteFailure},
    options::UpdateOptions,
};
use serde::{Deserialize, Serialize};
use tap::TapFallible;
use validator::Validate;

use crate::{
    error::Error,
    mongo_ext::Collection,
    payment::{Gateway, OrderRequest, PaymentConfirmation, PaymentGateway},
    pricing::{gateway_amount, CURRENCY},
    util::{now, ObjectIdString, PathObjectId},
};

use super::{
    auth::{AdminSession, CustomerSession},
    shipment::{Shipment, ShipmentCollection, ShipmentDraft, ShipmentModel},
};

pub const MERCHANT_NAME: &str = "DakiyaXpress";
pub const PAYMENT_DESCRIPTION: &str = "Shipment Payment";

#[derive(Clone)]
pub struct CheckoutIntentCollection(pub Collection<CheckoutIntentModel>);

impl std::ops::Deref for CheckoutIntentCollection {
    type Target = Collection<CheckoutIntentModel>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntentState {
    Reserved,
    Paid,
    Fulfilled,
}

impl IntentState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Reserved => "Reserved",
            Self::Paid => "Paid",
            Self::Fulfilled => "Fulfilled",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CheckoutIntentModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub user_id: ObjectId,

    pub draft: ShipmentDraft,
    pub price: i64,
    pub amount: i64,
    pub currency: String,

    pub gateway_order_id: String,
    pub state: IntentState,
    pub payment_id: Option<String>,
    pub shipment_id: ObjectId,

    pub created_at: bson::DateTime,
    pub updated_at: bson::DateTime,
}

impl CheckoutIntentModel {
    /// Whether `confirmation` is a genuine payment for this intent's order.
    pub fn accepts(&self, gateway: &dyn PaymentGateway, confirmation: &PaymentConfirmation) -> bool {
        confirmation.order_id == self.gateway_order_id && gateway.verify(confirmation)
    }

    pub fn shipment(&self) -> ShipmentModel {
        let mut shipment =
            ShipmentModel::new(self.shipment_id, self.user_id, self.draft.clone(), self.price);
        shipment.checkout_intent_id = Some(self.id);
        shipment
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Prefill {
    pub name: String,
    pub email: String,
    pub contact: String,
}

/// Everything the browser needs to open the hosted checkout.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CheckoutResponse {
    pub intent_id: ObjectIdString,
    pub key: String,
    pub order_id: String,
    pub amount: i64,
    pub currency: String,
    pub name: String,
    pub description: String,
    pub prefill: Prefill,
    pub price: i64,
}

impl CheckoutResponse {
    pub fn new(intent: &CheckoutIntentModel, key: &str) -> Self {
        let sender = &intent.draft.sender;

        Self {
            intent_id: intent.id.into(),
            key: key.to_string(),
            order_id: intent.gateway_order_id.clone(),
            amount: intent.amount,
            currency: intent.currency.clone(),
            name: MERCHANT_NAME.to_string(),
            description: PAYMENT_DESCRIPTION.to_string(),
            prefill: Prefill {
                name: sender.name.clone(),
                email: sender.email.clone(),
                contact: sender.phone.clone(),
            },
            price: intent.price,
        }
    }
}

#[tracing::instrument(skip_all, fields(user = %session.id))]
pub async fn checkout(
    State(intents): State<CheckoutIntentCollection>,
    State(gateway): State<Gateway>,
    CustomerSession(session): CustomerSession,
    Json(draft): Json<ShipmentDraft>,
) -> Result<Json<CheckoutResponse>, Error> {
    draft.validate()?;

    let price = draft.package.price();
    let amount = gateway_amount(price);
    let id = ObjectId::new();

    let order = gateway
        .create_order(&OrderRequest {
            amount,
            currency: CURRENCY.to_string(),
            receipt: id.to_hex(),
        })
        .await?;

    let now = now();
    let intent = CheckoutIntentModel {
        id,
        user_id: session.id,
        draft,
        price,
        amount,
        currency: CURRENCY.to_string(),
        gateway_order_id: order.id,
        state: IntentState::Reserved,
        payment_id: None,
        shipment_id: ObjectId::new(),
        created_at: now,
        updated_at: now,
    };
    intents.insert_one(&intent, None).await?;

    tracing::info!("reserved checkout {} for {} paise", intent.id, amount);

    Ok(Json(CheckoutResponse::new(&intent, gateway.key_id())))
}

const DUPLICATE_KEY: i32 = 11000;

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write)) => write.code == DUPLICATE_KEY,
        ErrorKind::Command(command) => command.code == DUPLICATE_KEY,
        _ => false,
    }
}

/// Writes the shipment for a paid intent and marks the intent fulfilled.
/// Safe to repeat while the intent is paid: the shipment is only inserted if
/// missing. Never call it for a fulfilled intent.
pub async fn fulfil(
    intents: &CheckoutIntentCollection,
    shipments: &ShipmentCollection,
    intent: &CheckoutIntentModel,
) -> Result<ShipmentModel, Error> {
    let mut document = bson::to_document(&intent.shipment())?;
    document.remove("_id");

    let upsert = shipments
        .update_one(
            bson::doc! { "_id": intent.shipment_id },
            bson::doc! { "$setOnInsert": document },
            UpdateOptions::builder().upsert(true).build(),
        )
        .await;

    match upsert {
        Ok(_) => {}
        // a concurrent fulfil inserted it first
        Err(err) if is_duplicate_key(&err) => {
            tracing::debug!("shipment {} already inserted", intent.shipment_id)
        }
        Err(err) => return Err(err.into()),
    }

    intents
        .update_one_by_id(
            intent.id,
            bson::doc! {
                "$set": {
                    "state": IntentState::Fulfilled.label(),
                    "updated_at": now(),
                }
            },
        )
        .await?;

    let shipment = shipments
        .find_one_by_id(intent.shipment_id)
        .await?
        .ok_or(Error::NoResource)
        .tap_err(|_| tracing::error!("shipment {} vanished after upsert", intent.shipment_id))?;

    tracing::info!("checkout {} fulfilled as shipment {}", intent.id, shipment.id);

    Ok(shipment)
}

#[tracing::instrument(skip_all, fields(user = %session.id, intent = %intent_id))]
pub async fn confirm(
    State(intents): State<CheckoutIntentCollection>,
    State(shipments): State<ShipmentCollection>,
    State(gateway): State<Gateway>,
    CustomerSession(session): CustomerSession,
    PathObjectId(intent_id): PathObjectId,
    Json(confirmation): Json<PaymentConfirmation>,
) -> Result<Json<Shipment>, Error> {
    let intent = intents
        .find_one_by_id(intent_id)
        .await?
        .ok_or(Error::NoResource)?;

    if intent.user_id != session.id {
        return Err(Error::Forbidden);
    }

    if !intent.accepts(&*gateway, &confirmation) {
        tracing::warn!("payment {} failed verification", confirmation.payment_id);
        return Err(Error::PaymentNotVerified);
    }

    if intent.state == IntentState::Fulfilled {
        let shipment = shipments
            .find_one_by_id(intent.shipment_id)
            .await?
            .ok_or(Error::NoResource)
            .tap_err(|_| tracing::debug!("shipment {} was deleted", intent.shipment_id))?;

        return Ok(Json(shipment.into()));
    }

    if intent.state == IntentState::Reserved {
        // the state guard makes a concurrent confirmation a no-op
        intents
            .update_one(
                bson::doc! {
                    "_id": intent.id,
                    "state": IntentState::Reserved.label(),
                },
                bson::doc! {
                    "$set": {
                        "state": IntentState::Paid.label(),
                        "payment_id": confirmation.payment_id.as_str(),
                        "updated_at": now(),
                    }
                },
                None,
            )
            .await?;

        tracing::info!("payment {} accepted", confirmation.payment_id);
    }

    let shipment = fulfil(&intents, &shipments, &intent).await?;

    Ok(Json(shipment.into()))
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ReconcileResponse {
    pub fulfilled: Vec<ObjectIdString>,
}

/// Finishes every intent that was paid but never turned into a shipment.
pub async fn reconcile(
    State(intents): State<CheckoutIntentCollection>,
    State(shipments): State<ShipmentCollection>,
    AdminSession(session): AdminSession,
) -> Result<Json<ReconcileResponse>, Error> {
    let paid = intents
        .find_all(bson::doc! { "state": IntentState::Paid.label() }, None)
        .await?;

    let mut fulfilled = vec![];
    for intent in paid {
        let shipment = fulfil(&intents, &shipments, &intent).await?;
        fulfilled.push(shipment.id.into());
    }

    tracing::info!("{} reconciled {} checkouts", session.id, fulfilled.len());

    Ok(Json(ReconcileResponse { fulfilled }))
}
